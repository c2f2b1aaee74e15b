//! Cross-instance relay.
//!
//! When the router cannot find a recipient locally it publishes the message
//! on the recipient's channel (`ws:<user_id>`). Every process runs one relay
//! subscribed to `ws:*`; the process that has the recipient registered
//! delivers it, every other process drops it.
//!
//! The relay is a fast path only. The router has already written a copy to
//! the offline queue, so the relay never touches the queue itself. A
//! recipient reached through the relay will find that copy again on their
//! next reconnect (at-least-once delivery).
//!
//! # Example
//!
//! ```ignore
//! let relay = Arc::new(CrossInstanceRelay::new(store, registry, config));
//! let handle = relay.clone().spawn(shutdown.clone());
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::DeliveryConfig;
use crate::message::ChatMessage;
use crate::registry::{ConnectionRegistry, SendResult};
use crate::store::{KeyValueStore, PublishedMessage, PublishedStream};
use crate::types::UserId;
use crate::Result;

/// Back-off before re-subscribing after the subscription is lost.
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// What happened to one published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Recipient is registered here and the message was queued to its stream
    Delivered(UserId),
    /// Recipient is not registered on this process
    NotLocal(UserId),
    /// Recipient is registered but the write failed
    WriteFailed(UserId),
    /// Channel name or payload could not be decoded
    Malformed,
}

/// Pub/sub bridge between server processes.
pub struct CrossInstanceRelay {
    store: Arc<dyn KeyValueStore>,
    registry: Arc<ConnectionRegistry>,
    config: Arc<DeliveryConfig>,
    resubscribe_delay: Duration,
}

impl CrossInstanceRelay {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        registry: Arc<ConnectionRegistry>,
        config: Arc<DeliveryConfig>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            resubscribe_delay: RESUBSCRIBE_DELAY,
        }
    }

    /// Override the re-subscribe back-off.
    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Publish a message on a recipient's channel.
    #[instrument(skip(self, message), fields(user_id = %user_id))]
    pub async fn publish(&self, user_id: UserId, message: &ChatMessage) -> Result<()> {
        let payload = message.to_json()?;
        self.store
            .publish(&self.config.user_channel(user_id), &payload)
            .await
    }

    /// Open the pattern subscription covering every user channel.
    pub async fn subscribe(&self) -> Result<PublishedStream> {
        self.store.psubscribe(&self.config.channel_pattern()).await
    }

    /// Deliver one published message if its recipient is registered here.
    ///
    /// The recipient is taken from the channel name, which is set per
    /// recipient even for group fan-out.
    pub fn handle_published(&self, published: &PublishedMessage) -> RelayOutcome {
        let Some(user_id) = self.config.user_from_channel(&published.channel) else {
            warn!(channel = %published.channel, "Published message on unexpected channel");
            return RelayOutcome::Malformed;
        };

        let message = match ChatMessage::from_json(&published.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Error decoding relayed message");
                return RelayOutcome::Malformed;
            }
        };

        match self.registry.send_to(user_id, Arc::new(message)) {
            SendResult::Sent => {
                debug!(user_id = %user_id, "Relayed message delivered locally");
                RelayOutcome::Delivered(user_id)
            }
            SendResult::NotConnected => RelayOutcome::NotLocal(user_id),
            failed => {
                warn!(user_id = %user_id, result = ?failed, "Error delivering relayed message");
                RelayOutcome::WriteFailed(user_id)
            }
        }
    }

    /// Consume a subscription until it ends or shutdown is requested.
    ///
    /// Returns true if it stopped because of shutdown.
    pub async fn pump(&self, mut stream: PublishedStream, shutdown: &CancellationToken) -> bool {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return true,
                next = stream.next() => next,
            };

            match next {
                Some(published) => {
                    self.handle_published(&published);
                }
                None => return false,
            }
        }
    }

    /// Run the relay until shutdown, re-subscribing whenever the
    /// subscription fails or ends.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(pattern = %self.config.channel_pattern(), "Cross-instance relay starting");

        loop {
            match self.subscribe().await {
                Ok(stream) => {
                    if self.pump(stream, &shutdown).await {
                        break;
                    }
                    warn!("Relay subscription ended, re-subscribing");
                }
                Err(e) => {
                    error!(
                        error = %e,
                        retry_in = ?self.resubscribe_delay,
                        "Failed to subscribe relay channel"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.resubscribe_delay) => {}
            }
        }

        info!("Cross-instance relay stopped");
    }

    /// Spawn [`run`](Self::run) as the process's background relay task.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
