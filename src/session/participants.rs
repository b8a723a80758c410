use super::error::CallError;
use super::state::Role;
use crate::signaling::{IdentityProvider, ParticipantDirectory};

/// Bestimmt die eigene Rolle über den Termin des Calls
pub async fn resolve_role(
    directory: &dyn ParticipantDirectory,
    identity: &dyn IdentityProvider,
    call_id: &str,
) -> Result<Role, CallError> {
    let participants = directory
        .get_call_participants(call_id)
        .await
        .map_err(CallError::ParticipantLookup)?;
    let user_id = identity.current_user_id();

    if user_id == participants.initiator_id {
        Ok(Role::Initiator)
    } else if user_id == participants.responder_id {
        Ok(Role::Responder)
    } else {
        tracing::warn!("User {} is not a participant of call {}", user_id, call_id);
        Err(CallError::NotAParticipant {
            call_id: call_id.to_string(),
            user_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{SignalingError, StaticDirectory};

    fn directory() -> StaticDirectory {
        StaticDirectory::new().with_call("call_42", "clinician-1", "client-7")
    }

    #[tokio::test]
    async fn test_roles_follow_appointment() {
        let dir = directory();
        assert_eq!(
            resolve_role(&dir, &"clinician-1".to_string(), "call_42").await,
            Ok(Role::Initiator)
        );
        assert_eq!(
            resolve_role(&dir, &"client-7".to_string(), "call_42").await,
            Ok(Role::Responder)
        );
    }

    #[tokio::test]
    async fn test_strangers_and_unknown_calls_are_rejected() {
        let dir = directory();
        assert!(matches!(
            resolve_role(&dir, &"someone".to_string(), "call_42").await,
            Err(CallError::NotAParticipant { .. })
        ));
        assert_eq!(
            resolve_role(&dir, &"client-7".to_string(), "call_99").await,
            Err(CallError::ParticipantLookup(SignalingError::ParticipantsNotFound(
                "call_99".to_string()
            )))
        );
    }
}
