//! Test utilities for delivery integration tests.
//!
//! Provides in-process "server processes" that share one in-memory store,
//! so cross-instance behavior can be exercised without Redis.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use proxychat_delivery::{
    ChatMessage, DeliveryConfig, DeliveryService, MemoryPresenceStore, MemoryStore, Outbound,
    SessionOutbound,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait before concluding nothing more will arrive.
pub const QUIET_PERIOD: Duration = Duration::from_millis(100);

/// Install a test subscriber once so `RUST_LOG` works in tests.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One simulated server process.
pub struct TestNode {
    pub delivery: DeliveryService,
    pub presence: Arc<MemoryPresenceStore>,
    relay: Option<JoinHandle<()>>,
}

impl TestNode {
    pub fn new(store: &MemoryStore, instance_id: &str) -> Self {
        Self::with_config(store, instance_id, DeliveryConfig::default())
    }

    pub fn with_config(store: &MemoryStore, instance_id: &str, config: DeliveryConfig) -> Self {
        let presence = Arc::new(MemoryPresenceStore::new());
        let delivery = DeliveryService::new(
            Arc::new(store.clone()),
            presence.clone(),
            config,
            instance_id,
        );
        Self {
            delivery,
            presence,
            relay: None,
        }
    }

    /// Start this node's relay and wait until it is subscribed.
    pub async fn start_relay(&mut self, shutdown: &CancellationToken) {
        let relay = Arc::clone(&self.delivery.relay);
        let stream = relay
            .subscribe()
            .await
            .expect("relay subscription");
        let shutdown = shutdown.clone();
        self.relay = Some(tokio::spawn(async move {
            relay.pump(stream, &shutdown).await;
        }));
    }

    pub async fn stop(self) {
        if let Some(handle) = self.relay {
            handle.await.expect("relay task panicked");
        }
    }
}

/// A fresh shared store plus shutdown token.
pub fn shared_store() -> (MemoryStore, CancellationToken) {
    init_tracing();
    (MemoryStore::new(), CancellationToken::new())
}

/// Wait for the next chat message on a session's outbound side.
pub async fn recv_message(outbound: &mut SessionOutbound) -> ChatMessage {
    match timeout(DEFAULT_TIMEOUT, outbound.recv()).await {
        Ok(Some(Outbound::Message(message))) => (*message).clone(),
        Ok(other) => panic!("expected a message, got {:?}", other),
        Err(_) => panic!("timed out waiting for a message"),
    }
}

/// Assert that nothing arrives within the quiet period.
pub async fn assert_silent(outbound: &mut SessionOutbound) {
    if let Ok(item) = timeout(QUIET_PERIOD, outbound.recv()).await {
        panic!("expected no outbound traffic, got {:?}", item);
    }
}
