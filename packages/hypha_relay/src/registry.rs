//! Session registry: at most one replication session per read key.
//!
//! Replaces the process-wide session map of earlier designs with an
//! injectable value, so several registries (one per domain) can coexist in
//! one process and tests get isolation for free.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use hypha_engine::Engine;
use hypha_identity::{DiscoveryKey, PublicKey, SigningKey};

use crate::error::RelayError;
use crate::overlay::OverlayMode;
use crate::session::{ReplicationSession, SessionState};

/// Registry-wide session settings.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Overlay participation for every session this registry creates.
    pub overlay_mode: OverlayMode,
    /// Seen-digest eviction window; `None` keeps digests forever.
    pub message_window: Option<Duration>,
    /// Close a session when its last transport detaches. Off by default:
    /// the relay keeps sessions open for reconnecting peers.
    pub evict_idle: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            overlay_mode: OverlayMode::Relay,
            message_window: None,
            evict_idle: false,
        }
    }
}

/// Row for the observability endpoints.
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub read_key: String,
    pub discovery_key: String,
    pub state: String,
    pub transports: usize,
    pub created_at: DateTime<Utc>,
}

struct Maps<E: Engine> {
    by_read_key: HashMap<PublicKey, Arc<ReplicationSession<E>>>,
    by_discovery_key: HashMap<DiscoveryKey, PublicKey>,
}

pub struct SessionRegistry<E: Engine> {
    engine: Arc<E>,
    config: RegistryConfig,
    // One lock over both maps; get_or_create constructs the engine handle
    // inside the critical section, so concurrent arrivals for the same
    // read key observe exactly one handle.
    maps: tokio::sync::Mutex<Maps<E>>,
}

impl<E: Engine> SessionRegistry<E> {
    pub fn new(engine: Arc<E>, config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            engine,
            config,
            maps: tokio::sync::Mutex::new(Maps {
                by_read_key: HashMap::new(),
                by_discovery_key: HashMap::new(),
            }),
        })
    }

    /// Look up or create the session for `read_key`.
    ///
    /// An existing session is returned unchanged — the write key argument
    /// is ignored for it; at most one engine handle exists per key and the
    /// first writer wins.
    pub async fn get_or_create(
        self: &Arc<Self>,
        read_key: PublicKey,
        write_key: Option<SigningKey>,
    ) -> Result<Arc<ReplicationSession<E>>, RelayError> {
        let mut maps = self.maps.lock().await;
        if let Some(session) = maps.by_read_key.get(&read_key) {
            return Ok(session.clone());
        }

        let handle = self
            .engine
            .open_session(read_key, write_key)
            .map_err(RelayError::from)?;
        let session = ReplicationSession::new(
            read_key,
            handle,
            self.config.overlay_mode.clone(),
            self.config.message_window,
        );

        maps.by_discovery_key
            .insert(*session.discovery_key(), read_key);
        maps.by_read_key.insert(read_key, session.clone());
        info!(
            session = %read_key.fingerprint(),
            discovery = %session.discovery_key().fingerprint(),
            "created replication session"
        );

        if self.config.evict_idle {
            self.spawn_idle_watcher(&session);
        }

        Ok(session)
    }

    /// Resolve a session by its advertised discovery key (swarm and
    /// rendezvous arrivals only know this).
    pub async fn find_by_discovery(
        &self,
        discovery_key: &DiscoveryKey,
    ) -> Option<Arc<ReplicationSession<E>>> {
        let maps = self.maps.lock().await;
        let read_key = maps.by_discovery_key.get(discovery_key)?;
        maps.by_read_key.get(read_key).cloned()
    }

    pub async fn get(&self, read_key: &PublicKey) -> Option<Arc<ReplicationSession<E>>> {
        self.maps.lock().await.by_read_key.get(read_key).cloned()
    }

    /// Tear down the session for `read_key`: every transport detaches with
    /// `SessionClosed` and the engine handle is closed.
    pub async fn close(&self, read_key: &PublicKey) -> bool {
        let session = {
            let mut maps = self.maps.lock().await;
            let Some(session) = maps.by_read_key.remove(read_key) else {
                return false;
            };
            maps.by_discovery_key.remove(session.discovery_key());
            session
        };
        session.close();
        true
    }

    pub async fn len(&self) -> usize {
        self.maps.lock().await.by_read_key.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<ReplicationSession<E>>> =
            self.maps.lock().await.by_read_key.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(SessionInfo {
                read_key: session.read_key().to_hex(),
                discovery_key: session.discovery_key().to_hex(),
                state: session.state().as_str().to_string(),
                transports: session.attachment_count().await,
                created_at: session.created_at(),
            });
        }
        infos
    }

    /// Total transports across all sessions (for /health).
    pub async fn attachment_total(&self) -> usize {
        let sessions: Vec<Arc<ReplicationSession<E>>> =
            self.maps.lock().await.by_read_key.values().cloned().collect();
        let mut total = 0;
        for session in sessions {
            total += session.attachment_count().await;
        }
        total
    }

    fn spawn_idle_watcher(self: &Arc<Self>, session: &Arc<ReplicationSession<E>>) {
        let registry = Arc::downgrade(self);
        let read_key = session.read_key();
        let mut state_rx = session.watch_state();
        tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow();
                match state {
                    SessionState::Idle => {
                        let Some(registry) = registry.upgrade() else {
                            return;
                        };
                        debug!(session = %read_key.fingerprint(), "evicting idle session");
                        registry.close(&read_key).await;
                        return;
                    }
                    SessionState::Closed => return,
                    _ => {}
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DetachReason;
    use hypha_engine::EngineHandle;
    use hypha_engine::memory::MemoryEngine;
    use hypha_identity::SigningKey;
    use std::time::Duration;
    use tokio::time::timeout;

    fn new_registry(config: RegistryConfig) -> Arc<SessionRegistry<MemoryEngine>> {
        SessionRegistry::new(Arc::new(MemoryEngine::new()), config)
    }

    fn read_key(byte: u8) -> PublicKey {
        SigningKey::from_bytes([byte; 32]).public_key()
    }

    #[tokio::test]
    async fn concurrent_get_or_create_yields_one_session() {
        let registry = new_registry(RegistryConfig::default());
        let key = read_key(1);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(
                async move { registry.get_or_create(key, None).await },
            ));
        }

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(registry.len().await, 1);
        for pair in sessions.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }

    #[tokio::test]
    async fn existing_session_ignores_later_write_key() {
        let registry = new_registry(RegistryConfig::default());
        let write_key = SigningKey::from_bytes([1u8; 32]);
        let key = write_key.public_key();

        let first = registry.get_or_create(key, None).await.unwrap();
        assert!(!first.handle().is_writable());

        // First writer wins; a write key on a later call changes nothing.
        let second = registry.get_or_create(key, Some(write_key)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!second.handle().is_writable());
    }

    #[tokio::test]
    async fn discovery_index_resolves_to_same_session() {
        let registry = new_registry(RegistryConfig::default());
        let key = read_key(1);
        let session = registry.get_or_create(key, None).await.unwrap();

        let found = registry
            .find_by_discovery(&key.discovery_key())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&session, &found));

        assert!(
            registry
                .find_by_discovery(&read_key(2).discovery_key())
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn close_detaches_everything_and_forgets_the_session() {
        let registry = new_registry(RegistryConfig::default());
        let key = read_key(1);
        let session = registry.get_or_create(key, None).await.unwrap();
        session.register_attachment("t".into(), None).await;

        assert!(registry.close(&key).await);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.get(&key).await.is_none());
        assert!(registry.find_by_discovery(&key.discovery_key()).await.is_none());
        assert!(!registry.close(&key).await);
    }

    #[tokio::test]
    async fn idle_sessions_survive_by_default() {
        let registry = new_registry(RegistryConfig::default());
        let key = read_key(1);
        let session = registry.get_or_create(key, None).await.unwrap();

        let id = session.register_attachment("t".into(), None).await;
        session.detach(id, DetachReason::Clean).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn evict_idle_closes_on_last_detach() {
        let registry = new_registry(RegistryConfig {
            evict_idle: true,
            ..RegistryConfig::default()
        });
        let key = read_key(1);
        let session = registry.get_or_create(key, None).await.unwrap();

        let mut state_rx = session.watch_state();
        let id = session.register_attachment("t".into(), None).await;
        session.detach(id, DetachReason::Clean).await;

        timeout(Duration::from_secs(5), async {
            loop {
                if *state_rx.borrow() == SessionState::Closed {
                    return;
                }
                state_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(registry.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn list_reports_state_and_counts() {
        let registry = new_registry(RegistryConfig::default());
        let key = read_key(1);
        let session = registry.get_or_create(key, None).await.unwrap();
        session.register_attachment("t".into(), None).await;

        let infos = registry.list().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].read_key, key.to_hex());
        assert_eq!(infos[0].transports, 1);
        assert_eq!(infos[0].state, "replicating");
        assert_eq!(registry.attachment_total().await, 1);
    }
}
