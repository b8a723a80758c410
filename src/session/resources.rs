//! Ressourcen eines Verhandlungsversuchs
//!
//! Lokaler Stream, Peer Connection und Hintergrund-Tasks gehören genau einem
//! `SessionResources`. Freigabe passiert über `release()` oder spätestens im
//! `Drop`, also auch auf jedem Fehlerpfad.

use crate::media::MediaStream;
use crate::peer::PeerConnection;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct SessionResources {
    local_stream: MediaStream,
    peer: Option<Arc<dyn PeerConnection>>,
    tasks: Vec<JoinHandle<()>>,
    released: bool,
}

impl SessionResources {
    pub fn new(local_stream: MediaStream) -> Self {
        Self {
            local_stream,
            peer: None,
            tasks: Vec::new(),
            released: false,
        }
    }

    pub fn local_stream(&self) -> &MediaStream {
        &self.local_stream
    }

    pub fn set_peer(&mut self, peer: Arc<dyn PeerConnection>) {
        self.peer = Some(peer);
    }

    pub fn peer(&self) -> Option<Arc<dyn PeerConnection>> {
        self.peer.clone()
    }

    /// Task wird bei der Freigabe abgebrochen
    pub fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    /// Bricht Tasks ab, schließt die Peer Connection und stoppt alle Tracks
    pub async fn release(mut self) {
        self.abort_tasks();

        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                tracing::warn!("Failed to close peer connection: {}", e);
            }
        }

        let stopped = self.local_stream.stop_all();
        tracing::debug!("Released session resources ({} track(s) stopped)", stopped);
        self.released = true;
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        self.abort_tasks();
        self.local_stream.stop_all();

        if let Some(peer) = self.peer.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = peer.close().await {
                            tracing::warn!("Failed to close peer connection: {}", e);
                        }
                    });
                }
                Err(_) => tracing::warn!("No runtime to close peer connection on drop"),
            }
        }
        tracing::debug!("Session resources dropped without explicit release");
    }
}

impl std::fmt::Debug for SessionResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionResources")
            .field("local_stream", &self.local_stream)
            .field("has_peer", &self.peer.is_some())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaConstraints, SyntheticDevices};
    use crate::peer::PeerConnectionFactory;
    use crate::testing::FakePeerFactory;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_release_stops_everything() {
        let stream = SyntheticDevices::build_stream(&MediaConstraints::default());
        let factory = FakePeerFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = factory.create(&[], tx).await.unwrap();

        let mut resources = SessionResources::new(stream.clone());
        resources.set_peer(peer);
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        resources.track(task);

        resources.release().await;

        assert!(stream.all_ended());
        assert!(factory.last().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_drop_releases_on_error_path() {
        let stream = SyntheticDevices::build_stream(&MediaConstraints::default());
        let factory = FakePeerFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = factory.create(&[], tx).await.unwrap();

        {
            let mut resources = SessionResources::new(stream.clone());
            resources.set_peer(peer);
        }

        assert!(stream.all_ended());
        // Close läuft als eigener Task
        tokio::task::yield_now().await;
        assert!(factory.last().unwrap().is_closed());
    }
}
