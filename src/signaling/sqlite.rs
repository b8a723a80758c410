//! SQLite Signaling Store
//!
//! Persistiert Call Records und ICE Candidates lokal.
//! Offer/Answer werden als JSON (`{type, sdp}`) gespeichert.

use super::channel::SignalingError;
use super::record::{
    CallParticipants, CallRecordStatus, CandidateLog, IceCandidate, SessionDescription,
    SignalingRecord, StoredIceCandidate,
};
use super::store::SignalingStore;
use crate::session::Role;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::path::Path;

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, SignalingError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SignalingError::InvalidData(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_description(raw: Option<String>) -> Result<Option<SessionDescription>, SignalingError> {
    match raw {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Rohe Zeile aus `call_records`
struct RecordRow {
    offer: Option<String>,
    answer: Option<String>,
    status: String,
    initiator_id: Option<String>,
    responder_id: Option<String>,
    attempt: i64,
    created_at: String,
    updated_at: String,
}

/// SQLite-Datenbank für Signaling Records (Thread-safe durch Mutex)
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Öffnet oder erstellt die Datenbank
    pub fn open(path: &Path) -> Result<Self, SignalingError> {
        // Parent-Verzeichnis erstellen
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SignalingError::Storage(e.to_string()))?;
        }

        tracing::info!("Opening signaling database at {:?}", path);

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// In-Memory Datenbank
    pub fn open_in_memory() -> Result<Self, SignalingError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialisiert das Datenbank-Schema
    fn init_schema(&self) -> Result<(), SignalingError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS call_records (
                call_id TEXT PRIMARY KEY,
                offer TEXT,
                answer TEXT,
                status TEXT NOT NULL DEFAULT 'waiting',
                initiator_id TEXT,
                responder_id TEXT,
                attempt INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS ice_candidates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                call_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                candidate TEXT NOT NULL,
                sdp_m_line_index INTEGER,
                sdp_mid TEXT,
                role TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        // Index für Abfragen pro Call und Versuch
        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ice_candidates_call ON ice_candidates(call_id, attempt, id)
            "#,
            [],
        )?;

        Ok(())
    }

    /// Legt eine leere Zeile an falls nötig
    fn ensure_record(conn: &Connection, call_id: &str) -> SqliteResult<()> {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO call_records (call_id, status, created_at, updated_at)
            VALUES (?1, 'waiting', ?2, ?2)
            ON CONFLICT(call_id) DO NOTHING
            "#,
            params![call_id, now],
        )?;
        Ok(())
    }

    fn current_attempt(conn: &Connection, call_id: &str) -> SqliteResult<i64> {
        Ok(conn
            .query_row(
                "SELECT attempt FROM call_records WHERE call_id = ?1",
                params![call_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0))
    }

    fn row_to_record(row: RecordRow) -> Result<SignalingRecord, SignalingError> {
        let status = CallRecordStatus::parse(&row.status).ok_or_else(|| {
            SignalingError::InvalidData(format!("unknown call status '{}'", row.status))
        })?;

        let participants = match (row.initiator_id, row.responder_id) {
            (Some(initiator_id), Some(responder_id)) => Some(CallParticipants {
                initiator_id,
                responder_id,
            }),
            _ => None,
        };

        Ok(SignalingRecord {
            offer: parse_description(row.offer)?,
            answer: parse_description(row.answer)?,
            status,
            participants,
            attempt: row.attempt.max(0) as u64,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

impl SignalingStore for SqliteStore {
    fn upsert_record(
        &self,
        call_id: &str,
        participants: &CallParticipants,
    ) -> Result<(), SignalingError> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO call_records (call_id, status, initiator_id, responder_id, created_at, updated_at)
            VALUES (?1, 'waiting', ?2, ?3, ?4, ?4)
            ON CONFLICT(call_id) DO UPDATE SET
                status = 'waiting',
                initiator_id = excluded.initiator_id,
                responder_id = excluded.responder_id,
                updated_at = excluded.updated_at
            "#,
            params![
                call_id,
                participants.initiator_id,
                participants.responder_id,
                now
            ],
        )?;
        Ok(())
    }

    fn load_record(&self, call_id: &str) -> Result<Option<SignalingRecord>, SignalingError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                r#"
                SELECT offer, answer, status, initiator_id, responder_id, attempt, created_at, updated_at
                FROM call_records
                WHERE call_id = ?1
                "#,
                params![call_id],
                |row| {
                    Ok(RecordRow {
                        offer: row.get(0)?,
                        answer: row.get(1)?,
                        status: row.get(2)?,
                        initiator_id: row.get(3)?,
                        responder_id: row.get(4)?,
                        attempt: row.get(5)?,
                        created_at: row.get(6)?,
                        updated_at: row.get(7)?,
                    })
                },
            )
            .optional()?;

        row.map(Self::row_to_record).transpose()
    }

    fn store_offer(&self, call_id: &str, offer: &SessionDescription) -> Result<(), SignalingError> {
        let json = serde_json::to_string(offer)?;
        let conn = self.conn.lock();
        Self::ensure_record(&conn, call_id)?;
        let written = conn.execute(
            r#"
            UPDATE call_records
            SET offer = ?2, updated_at = ?3
            WHERE call_id = ?1 AND offer IS NULL
            "#,
            params![call_id, json, Utc::now().to_rfc3339()],
        )?;
        if written == 0 {
            return Err(SignalingError::already_written(call_id, "offer"));
        }
        Ok(())
    }

    fn store_answer(
        &self,
        call_id: &str,
        answer: &SessionDescription,
    ) -> Result<(), SignalingError> {
        let json = serde_json::to_string(answer)?;
        let conn = self.conn.lock();
        let written = conn.execute(
            r#"
            UPDATE call_records
            SET answer = ?2, updated_at = ?3
            WHERE call_id = ?1 AND offer IS NOT NULL AND answer IS NULL
            "#,
            params![call_id, json, Utc::now().to_rfc3339()],
        )?;
        if written > 0 {
            return Ok(());
        }

        // Nichts geschrieben: Grund für die Fehlermeldung ermitteln
        let has_offer: bool = conn
            .query_row(
                "SELECT offer IS NOT NULL FROM call_records WHERE call_id = ?1",
                params![call_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(false);
        if has_offer {
            Err(SignalingError::already_written(call_id, "answer"))
        } else {
            Err(SignalingError::NoOffer(call_id.to_string()))
        }
    }

    fn set_status(&self, call_id: &str, status: CallRecordStatus) -> Result<bool, SignalingError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            UPDATE call_records
            SET status = ?2, updated_at = ?3
            WHERE call_id = ?1
            "#,
            params![call_id, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    fn reset(&self, call_id: &str) -> Result<(), SignalingError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::ensure_record(&tx, call_id)?;
        tx.execute(
            r#"
            UPDATE call_records
            SET offer = NULL, answer = NULL, status = 'waiting',
                attempt = attempt + 1, updated_at = ?2
            WHERE call_id = ?1
            "#,
            params![call_id, Utc::now().to_rfc3339()],
        )?;
        tx.execute(
            "DELETE FROM ice_candidates WHERE call_id = ?1",
            params![call_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn reopen_if_ended(&self, call_id: &str) -> Result<bool, SignalingError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let reopened = tx.execute(
            r#"
            UPDATE call_records
            SET offer = NULL, answer = NULL, status = 'waiting',
                attempt = attempt + 1, updated_at = ?2
            WHERE call_id = ?1 AND status = ?3
            "#,
            params![
                call_id,
                Utc::now().to_rfc3339(),
                CallRecordStatus::Ended.as_str()
            ],
        )? > 0;
        if reopened {
            tx.execute(
                "DELETE FROM ice_candidates WHERE call_id = ?1",
                params![call_id],
            )?;
        }
        tx.commit()?;
        Ok(reopened)
    }

    fn append_candidate(
        &self,
        call_id: &str,
        candidate: &StoredIceCandidate,
    ) -> Result<(), SignalingError> {
        let conn = self.conn.lock();
        let attempt = Self::current_attempt(&conn, call_id)?;
        conn.execute(
            r#"
            INSERT INTO ice_candidates (call_id, attempt, candidate, sdp_m_line_index, sdp_mid, role, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                call_id,
                attempt,
                candidate.candidate.candidate,
                candidate.candidate.sdp_m_line_index,
                candidate.candidate.sdp_mid,
                candidate.role.map(|r| r.as_str()),
                candidate.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn load_candidates(&self, call_id: &str) -> Result<CandidateLog, SignalingError> {
        let conn = self.conn.lock();
        let attempt = Self::current_attempt(&conn, call_id)?;

        let mut stmt = conn.prepare(
            r#"
            SELECT candidate, sdp_m_line_index, sdp_mid, role, created_at
            FROM ice_candidates
            WHERE call_id = ?1 AND attempt = ?2
            ORDER BY id ASC
            "#,
        )?;

        let rows = stmt
            .query_map(params![call_id, attempt], |row| {
                Ok((
                    IceCandidate {
                        candidate: row.get(0)?,
                        sdp_m_line_index: row.get(1)?,
                        sdp_mid: row.get(2)?,
                    },
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (candidate, role, created_at) in rows {
            entries.push(StoredIceCandidate {
                candidate,
                role: role.as_deref().and_then(Role::parse),
                created_at: parse_timestamp(&created_at)?,
            });
        }

        Ok(CandidateLog {
            attempt: attempt.max(0) as u64,
            entries,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn participants() -> CallParticipants {
        CallParticipants {
            initiator_id: "clinician-1".to_string(),
            responder_id: "client-7".to_string(),
        }
    }

    fn candidate(n: u16, role: Role) -> StoredIceCandidate {
        StoredIceCandidate::new(
            IceCandidate {
                candidate: format!("candidate:{} 1 udp 2122260223 192.0.2.{} 5000 typ host", n, n),
                sdp_m_line_index: Some(0),
                sdp_mid: Some("0".to_string()),
            },
            role,
        )
    }

    #[test]
    fn test_record_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_record("call_42", &participants()).unwrap();
        store
            .store_offer("call_42", &SessionDescription::offer("v=0 offer"))
            .unwrap();

        let record = store.load_record("call_42").unwrap().unwrap();
        assert_eq!(record.offer, Some(SessionDescription::offer("v=0 offer")));
        assert_eq!(record.answer, None);
        assert_eq!(record.status, CallRecordStatus::Waiting);
        assert_eq!(record.participants, Some(participants()));
    }

    #[test]
    fn test_missing_record_is_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.load_record("nope").unwrap().is_none());
        assert!(!store.set_status("nope", CallRecordStatus::Ended).unwrap());
        assert_eq!(store.load_candidates("nope").unwrap(), CandidateLog::default());
    }

    #[test]
    fn test_candidates_keep_insertion_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append_candidate("call_42", &candidate(1, Role::Initiator)).unwrap();
        store.append_candidate("call_42", &candidate(2, Role::Responder)).unwrap();
        store.append_candidate("call_42", &candidate(3, Role::Initiator)).unwrap();

        let log = store.load_candidates("call_42").unwrap();
        let order: Vec<_> = log
            .entries
            .iter()
            .map(|c| c.candidate.candidate.split(' ').next().unwrap().to_string())
            .collect();
        assert_eq!(order, vec!["candidate:1", "candidate:2", "candidate:3"]);
        assert_eq!(log.entries[1].role, Some(Role::Responder));
    }

    #[test]
    fn test_reset_clears_negotiation_state() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_record("call_42", &participants()).unwrap();
        store
            .store_offer("call_42", &SessionDescription::offer("v=0 offer"))
            .unwrap();
        store
            .store_answer("call_42", &SessionDescription::answer("v=0 answer"))
            .unwrap();
        store.append_candidate("call_42", &candidate(1, Role::Initiator)).unwrap();
        store.set_status("call_42", CallRecordStatus::Ended).unwrap();

        store.reset("call_42").unwrap();

        let record = store.load_record("call_42").unwrap().unwrap();
        assert!(record.offer.is_none());
        assert!(record.answer.is_none());
        assert_eq!(record.status, CallRecordStatus::Waiting);
        assert_eq!(record.attempt, 1);
        assert_eq!(record.participants, Some(participants()));

        let log = store.load_candidates("call_42").unwrap();
        assert_eq!(log.attempt, 1);
        assert!(log.entries.is_empty());
    }

    #[test]
    fn test_conditional_writes_across_connections() {
        let path = std::env::temp_dir()
            .join(format!("call-session-{}", uuid::Uuid::new_v4()))
            .join("signaling.db");
        let first = SqliteStore::open(&path).unwrap();
        let second = SqliteStore::open(&path).unwrap();

        first
            .store_offer("call_42", &SessionDescription::offer("v=0 first"))
            .unwrap();
        let err = second
            .store_offer("call_42", &SessionDescription::offer("v=0 second"))
            .unwrap_err();
        assert!(matches!(err, SignalingError::AlreadyWritten { field: "offer", .. }));

        second
            .store_answer("call_42", &SessionDescription::answer("v=0 answer"))
            .unwrap();
        let err = first
            .store_answer("call_42", &SessionDescription::answer("v=0 late"))
            .unwrap_err();
        assert!(matches!(err, SignalingError::AlreadyWritten { field: "answer", .. }));

        let record = first.load_record("call_42").unwrap().unwrap();
        assert_eq!(record.offer, Some(SessionDescription::offer("v=0 first")));
        assert_eq!(record.answer, Some(SessionDescription::answer("v=0 answer")));

        drop(first);
        drop(second);
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_answer_without_offer_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .store_answer("call_42", &SessionDescription::answer("v=0"))
            .unwrap_err();
        assert_eq!(err, SignalingError::NoOffer("call_42".to_string()));

        store.upsert_record("call_42", &participants()).unwrap();
        let err = store
            .store_answer("call_42", &SessionDescription::answer("v=0"))
            .unwrap_err();
        assert_eq!(err, SignalingError::NoOffer("call_42".to_string()));
    }

    #[test]
    fn test_reopen_resets_only_ended_records() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_record("call_42", &participants()).unwrap();
        store
            .store_offer("call_42", &SessionDescription::offer("v=0 offer"))
            .unwrap();
        store.append_candidate("call_42", &candidate(1, Role::Initiator)).unwrap();

        assert!(!store.reopen_if_ended("call_42").unwrap());
        assert!(store.load_record("call_42").unwrap().unwrap().offer.is_some());

        store.set_status("call_42", CallRecordStatus::Ended).unwrap();
        assert!(store.reopen_if_ended("call_42").unwrap());

        let record = store.load_record("call_42").unwrap().unwrap();
        assert!(record.offer.is_none());
        assert_eq!(record.status, CallRecordStatus::Waiting);
        assert_eq!(record.attempt, 1);
        assert!(store.load_candidates("call_42").unwrap().entries.is_empty());

        // Zweiter Aufruf ist ein No-Op
        assert!(!store.reopen_if_ended("call_42").unwrap());
    }
}
