//! Connection lifecycle.
//!
//! Every client stream goes through
//! `Connecting -> Registered -> (Reading <-> Dispatching) -> Closing -> Closed`.
//!
//! On connect the manager registers the stream, marks the user online and
//! drains the offline backlog before the first inbound frame is read. The
//! backlog is handed to the writer ahead of anything arriving on the live
//! channel, so a client never sees live traffic before its backlog.
//!
//! Connect and teardown of the same user are serialized, so a reconnect that
//! races an old teardown always ends registered and flagged online.
//!
//! Teardown is best-effort: each step is attempted even if an earlier one
//! failed, and failures are only logged.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::config::DeliveryConfig;
use crate::message::ChatMessage;
use crate::offline::OfflineQueue;
use crate::presence::PresenceStore;
use crate::registry::{ConnectionRegistry, Outbound};
use crate::router::{DispatchReport, MessageRouter};
use crate::store::KeyValueStore;
use crate::types::{ConnectionId, UserId};
use crate::{DeliveryError, Result};

/// Close reason sent to a stream replaced by a newer connection.
pub const SUPERSEDED_REASON: &str = "superseded";

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registered,
    Reading,
    Dispatching,
    Closing,
    Closed,
}

/// One registered client stream.
#[derive(Debug)]
pub struct Session {
    user_id: UserId,
    connection_id: ConnectionId,
    state: SessionState,
}

impl Session {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Mark the session as reading client frames.
    pub fn start_reading(&mut self) {
        if self.state == SessionState::Registered {
            self.state = SessionState::Reading;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }
}

/// Everything the session's writer has to put on the socket, in order.
///
/// Yields the drained backlog first, then the live channel.
#[derive(Debug)]
pub struct SessionOutbound {
    backlog: VecDeque<ChatMessage>,
    rx: mpsc::Receiver<Outbound>,
}

impl SessionOutbound {
    /// Next item for the socket, None once the live channel is closed.
    pub async fn recv(&mut self) -> Option<Outbound> {
        if let Some(message) = self.backlog.pop_front() {
            return Some(Outbound::Message(Arc::new(message)));
        }
        self.rx.recv().await
    }

    /// Backlog messages not yet handed to the writer.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}

/// Owns accept, register and teardown of client streams.
pub struct SessionManager {
    registry: Arc<ConnectionRegistry>,
    offline: OfflineQueue,
    router: Arc<MessageRouter>,
    presence: Arc<dyn PresenceStore>,
    store: Arc<dyn KeyValueStore>,
    config: Arc<DeliveryConfig>,
    instance_id: String,
    lifecycle: DashMap<UserId, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        offline: OfflineQueue,
        router: Arc<MessageRouter>,
        presence: Arc<dyn PresenceStore>,
        store: Arc<dyn KeyValueStore>,
        config: Arc<DeliveryConfig>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            offline,
            router,
            presence,
            store,
            config,
            instance_id: instance_id.into(),
            lifecycle: DashMap::new(),
        }
    }

    /// Hold the user's lifecycle lock across register or teardown steps.
    async fn lock_user(&self, user_id: UserId) -> OwnedMutexGuard<()> {
        let lock = self.lifecycle.entry(user_id).or_default().clone();
        lock.lock_owned().await
    }

    /// Register a new stream for `user_id`.
    ///
    /// Fails only for an invalid user id, in which case nothing was touched.
    /// A stream the user already had on this process is told to close.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn connect(&self, user_id: UserId) -> Result<(Session, SessionOutbound)> {
        if !user_id.is_valid() {
            return Err(DeliveryError::invalid_message(format!(
                "cannot register user id {}",
                user_id
            )));
        }

        let _guard = self.lock_user(user_id).await;
        let connection_id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer);

        if let Some(previous) = self.registry.register(user_id, connection_id, tx) {
            info!(
                previous = %previous.connection_id,
                "Closing superseded connection"
            );
            if !previous.close(SUPERSEDED_REASON) {
                debug!("Superseded connection already gone");
            }
        }

        if let Err(e) = self
            .store
            .hash_set(
                &self.config.active_users_key,
                &user_id.to_string(),
                &self.instance_id,
            )
            .await
        {
            warn!(error = %e, "Error recording active user");
        }

        if let Err(e) = self.presence.set_online(user_id, true).await {
            warn!(error = %e, "Error setting user online");
        }

        let backlog = match self.offline.drain_all(user_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "Error draining offline messages");
                Vec::new()
            }
        };

        info!(
            connection_id = %connection_id,
            backlog = backlog.len(),
            "User connected"
        );

        let session = Session {
            user_id,
            connection_id,
            state: SessionState::Registered,
        };
        let outbound = SessionOutbound {
            backlog: backlog.into(),
            rx,
        };
        Ok((session, outbound))
    }

    /// Parse one inbound text frame and route it.
    ///
    /// Malformed frames are logged and dropped; the session carries on.
    pub async fn handle_frame(&self, session: &mut Session, text: &str) -> Option<DispatchReport> {
        if session.state == SessionState::Registered {
            session.state = SessionState::Reading;
        }

        let message = match ChatMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(user_id = %session.user_id, error = %e, "Dropping malformed frame");
                return None;
            }
        };

        session.state = SessionState::Dispatching;
        let report = self.router.dispatch(message).await;
        session.state = SessionState::Reading;
        Some(report)
    }

    /// Tear a session down.
    ///
    /// The registry entry, the active-user index and the presence flag are
    /// only touched if the entry still belongs to this session; a superseded
    /// session leaves its successor alone.
    #[instrument(skip(self, session), fields(user_id = %session.user_id, connection_id = %session.connection_id))]
    pub async fn disconnect(&self, session: &mut Session) {
        if session.state == SessionState::Closed {
            return;
        }
        session.state = SessionState::Closing;

        let user_id = session.user_id;
        let guard = self.lock_user(user_id).await;
        if self
            .registry
            .unregister_connection(user_id, session.connection_id)
            .is_some()
        {
            if let Err(e) = self
                .store
                .hash_delete(&self.config.active_users_key, &user_id.to_string())
                .await
            {
                warn!(error = %e, "Error removing active user");
            }

            if let Err(e) = self.presence.set_online(user_id, false).await {
                warn!(error = %e, "Error setting user offline");
            }
            info!("User disconnected");
        } else {
            debug!("Session was superseded, leaving registration in place");
        }

        // Map entry plus our guard; anything more is a waiting connect.
        self.lifecycle
            .remove_if(&user_id, |_, lock| Arc::strong_count(lock) == 2);
        drop(guard);

        session.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::GroupMembership;
    use crate::presence::MemoryPresenceStore;
    use crate::relay::CrossInstanceRelay;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct FailingPresence;

    #[async_trait]
    impl PresenceStore for FailingPresence {
        async fn set_online(&self, _user_id: UserId, _online: bool) -> Result<()> {
            Err(DeliveryError::presence("database unavailable"))
        }
    }

    /// Parks `set_online(false)` until released.
    #[derive(Default)]
    struct GatedPresence {
        inner: MemoryPresenceStore,
        parked: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PresenceStore for GatedPresence {
        async fn set_online(&self, user_id: UserId, online: bool) -> Result<()> {
            if !online {
                self.parked.notify_one();
                self.release.notified().await;
            }
            self.inner.set_online(user_id, online).await
        }
    }

    struct Fixture {
        sessions: SessionManager,
        registry: Arc<ConnectionRegistry>,
        offline: OfflineQueue,
        store: MemoryStore,
    }

    fn fixture_with(presence: Arc<dyn PresenceStore>) -> Fixture {
        let store = MemoryStore::new();
        let shared: Arc<dyn KeyValueStore> = Arc::new(store.clone());
        let config = Arc::new(DeliveryConfig::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let offline = OfflineQueue::new(Arc::clone(&shared), Arc::clone(&config));
        let relay = Arc::new(CrossInstanceRelay::new(
            Arc::clone(&shared),
            Arc::clone(&registry),
            Arc::clone(&config),
        ));
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            offline.clone(),
            relay,
            GroupMembership::new(Arc::clone(&shared), Arc::clone(&config)),
        ));
        let sessions = SessionManager::new(
            Arc::clone(&registry),
            offline.clone(),
            router,
            presence,
            shared,
            config,
            "instance-a",
        );
        Fixture {
            sessions,
            registry,
            offline,
            store,
        }
    }

    fn frame(from: i64, to: i64, content: &str) -> String {
        ChatMessage::direct(UserId(from), "user", UserId(to), content)
            .to_json()
            .unwrap()
    }

    async fn next_content(outbound: &mut SessionOutbound) -> String {
        match outbound.recv().await {
            Some(Outbound::Message(m)) => m.content().to_string(),
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_registers_and_marks_online() {
        let presence = Arc::new(MemoryPresenceStore::new());
        let f = fixture_with(presence.clone());

        let (session, _outbound) = f.sessions.connect(UserId(4)).await.unwrap();

        assert_eq!(session.state(), SessionState::Registered);
        assert!(f.registry.is_connected(UserId(4)));
        assert_eq!(presence.is_online(UserId(4)), Some(true));
        assert_eq!(
            f.store.hash_get("active_users", "4").as_deref(),
            Some("instance-a")
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_user() {
        let presence = Arc::new(MemoryPresenceStore::new());
        let f = fixture_with(presence.clone());

        assert!(f.sessions.connect(UserId(0)).await.is_err());
        assert_eq!(f.registry.connection_count(), 0);
        assert_eq!(presence.is_online(UserId(0)), None);
    }

    #[tokio::test]
    async fn test_backlog_precedes_live_traffic() {
        let f = fixture_with(Arc::new(MemoryPresenceStore::new()));
        for content in ["m1", "m2"] {
            let msg = ChatMessage::direct(UserId(1), "a", UserId(2), content);
            f.offline.enqueue(UserId(2), &msg).await.unwrap();
        }

        let (_session, mut outbound) = f.sessions.connect(UserId(2)).await.unwrap();
        assert_eq!(outbound.backlog_len(), 2);
        assert_eq!(f.offline.pending(UserId(2)).await.unwrap(), 0);

        let (mut sender, _sender_out) = f.sessions.connect(UserId(1)).await.unwrap();
        f.sessions
            .handle_frame(&mut sender, &frame(1, 2, "live"))
            .await
            .unwrap();

        assert_eq!(next_content(&mut outbound).await, "m1");
        assert_eq!(next_content(&mut outbound).await, "m2");
        assert_eq!(next_content(&mut outbound).await, "live");
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_session_reading() {
        let f = fixture_with(Arc::new(MemoryPresenceStore::new()));
        let (mut session, _outbound) = f.sessions.connect(UserId(1)).await.unwrap();
        session.start_reading();

        assert!(f.sessions.handle_frame(&mut session, "not json").await.is_none());
        assert_eq!(session.state(), SessionState::Reading);

        let report = f
            .sessions
            .handle_frame(&mut session, &frame(1, 9, "still here"))
            .await
            .unwrap();
        assert_eq!(report.queued_count(), 1);
        assert_eq!(session.state(), SessionState::Reading);
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_and_marks_offline() {
        let presence = Arc::new(MemoryPresenceStore::new());
        let f = fixture_with(presence.clone());
        let (mut session, _outbound) = f.sessions.connect(UserId(4)).await.unwrap();

        f.sessions.disconnect(&mut session).await;

        assert!(session.is_closed());
        assert!(!f.registry.is_connected(UserId(4)));
        assert_eq!(presence.is_online(UserId(4)), Some(false));
        assert!(f.store.hash_get("active_users", "4").is_none());
    }

    #[tokio::test]
    async fn test_superseded_session_is_closed_and_teardown_spares_successor() {
        let presence = Arc::new(MemoryPresenceStore::new());
        let f = fixture_with(presence.clone());

        let (mut first, mut first_out) = f.sessions.connect(UserId(4)).await.unwrap();
        let (second, _second_out) = f.sessions.connect(UserId(4)).await.unwrap();

        match first_out.recv().await {
            Some(Outbound::Close { reason }) => assert_eq!(reason, SUPERSEDED_REASON),
            other => panic!("expected close, got {:?}", other),
        }

        f.sessions.disconnect(&mut first).await;

        let handle = f.registry.lookup(UserId(4)).unwrap();
        assert_eq!(handle.connection_id, second.connection_id());
        assert_eq!(presence.is_online(UserId(4)), Some(true));
    }

    #[tokio::test]
    async fn test_presence_failure_is_not_fatal() {
        let f = fixture_with(Arc::new(FailingPresence));
        let msg = ChatMessage::direct(UserId(1), "a", UserId(4), "queued");
        f.offline.enqueue(UserId(4), &msg).await.unwrap();

        let (mut session, outbound) = f.sessions.connect(UserId(4)).await.unwrap();
        assert!(f.registry.is_connected(UserId(4)));
        assert_eq!(outbound.backlog_len(), 1);

        f.sessions.disconnect(&mut session).await;
        assert!(!f.registry.is_connected(UserId(4)));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_reconnect_during_teardown_stays_online() {
        let presence = Arc::new(GatedPresence::default());
        let f = Arc::new(fixture_with(presence.clone()));
        let (mut old, _old_out) = f.sessions.connect(UserId(4)).await.unwrap();

        let teardown = {
            let f = Arc::clone(&f);
            tokio::spawn(async move {
                f.sessions.disconnect(&mut old).await;
                old
            })
        };
        presence.parked.notified().await;

        let reconnect = {
            let f = Arc::clone(&f);
            tokio::spawn(async move { f.sessions.connect(UserId(4)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reconnect.is_finished());
        presence.release.notify_one();

        let old = teardown.await.unwrap();
        let (new, _new_out) = reconnect.await.unwrap().unwrap();

        assert!(old.is_closed());
        let handle = f.registry.lookup(UserId(4)).unwrap();
        assert_eq!(handle.connection_id, new.connection_id());
        assert_eq!(presence.inner.is_online(UserId(4)), Some(true));
        assert_eq!(
            f.store.hash_get("active_users", "4").as_deref(),
            Some("instance-a")
        );
    }

    #[tokio::test]
    async fn test_lifecycle_locks_released_after_teardown() {
        let f = fixture_with(Arc::new(MemoryPresenceStore::new()));
        let (mut session, _outbound) = f.sessions.connect(UserId(4)).await.unwrap();
        assert!(f.sessions.lifecycle.contains_key(&UserId(4)));

        f.sessions.disconnect(&mut session).await;
        assert!(!f.sessions.lifecycle.contains_key(&UserId(4)));
    }
}
