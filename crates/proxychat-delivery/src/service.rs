//! Wiring of the delivery components for one server process.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DeliveryConfig;
use crate::groups::GroupMembership;
use crate::offline::OfflineQueue;
use crate::presence::PresenceStore;
use crate::registry::ConnectionRegistry;
use crate::relay::CrossInstanceRelay;
use crate::router::MessageRouter;
use crate::session::SessionManager;
use crate::store::KeyValueStore;
use crate::Result;

/// All delivery components of one process, sharing one registry and store.
#[derive(Clone)]
pub struct DeliveryService {
    pub registry: Arc<ConnectionRegistry>,
    pub offline: OfflineQueue,
    pub groups: GroupMembership,
    pub relay: Arc<CrossInstanceRelay>,
    pub router: Arc<MessageRouter>,
    pub sessions: Arc<SessionManager>,
    store: Arc<dyn KeyValueStore>,
    instance_id: String,
}

impl DeliveryService {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        presence: Arc<dyn PresenceStore>,
        config: DeliveryConfig,
        instance_id: impl Into<String>,
    ) -> Self {
        let instance_id = instance_id.into();
        let config = Arc::new(config);
        let registry = Arc::new(ConnectionRegistry::new());
        let offline = OfflineQueue::new(Arc::clone(&store), Arc::clone(&config));
        let groups = GroupMembership::new(Arc::clone(&store), Arc::clone(&config));
        let relay = Arc::new(CrossInstanceRelay::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&config),
        ));
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            offline.clone(),
            Arc::clone(&relay),
            groups.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&registry),
            offline.clone(),
            Arc::clone(&router),
            presence,
            Arc::clone(&store),
            config,
            instance_id.clone(),
        ));

        Self {
            registry,
            offline,
            groups,
            relay,
            router,
            sessions,
            store,
            instance_id,
        }
    }

    /// Start the background relay subscriber.
    pub fn spawn_relay(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        Arc::clone(&self.relay).spawn(shutdown)
    }

    /// Round-trip to the shared store.
    pub async fn ping_store(&self) -> Result<()> {
        self.store.ping().await
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}
