//! Offline message queue.
//!
//! Per-user FIFO of undelivered messages, stored in the durable store under
//! `offline:<user_id>`. Messages are pushed at the head of the list and the
//! key's TTL is refreshed on every push, so a backlog that keeps receiving
//! messages never expires, while one left untouched for the TTL is dropped
//! by the store.
//!
//! Draining reads and removes the list in one step and returns the messages
//! oldest first. Delivery of the drained messages is not part of the same
//! step: if the stream fails partway the remainder is lost.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::config::DeliveryConfig;
use crate::message::ChatMessage;
use crate::store::KeyValueStore;
use crate::types::UserId;
use crate::Result;

/// Offline queue on top of the shared store.
#[derive(Clone)]
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    config: Arc<DeliveryConfig>,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, config: Arc<DeliveryConfig>) -> Self {
        Self { store, config }
    }

    /// TTL applied on every push.
    pub fn ttl(&self) -> Duration {
        self.config.offline_ttl
    }

    /// Append a message to the user's backlog and refresh its TTL.
    #[instrument(skip(self, message), fields(user_id = %user_id))]
    pub async fn enqueue(&self, user_id: UserId, message: &ChatMessage) -> Result<()> {
        let payload = message.to_json()?;
        let key = self.config.offline_key(user_id);

        self.store.list_push_head(&key, &payload).await?;
        self.store.expire(&key, self.config.offline_ttl).await?;

        debug!("Stored offline message");
        Ok(())
    }

    /// Remove and return the user's whole backlog, oldest first.
    ///
    /// Entries that no longer parse are skipped and logged.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn drain_all(&self, user_id: UserId) -> Result<Vec<ChatMessage>> {
        let key = self.config.offline_key(user_id);
        let raw = self.store.list_take_all(&key).await?;

        let messages = decode_backlog(raw);
        if !messages.is_empty() {
            info!(count = messages.len(), "Drained offline messages");
        }
        Ok(messages)
    }

    /// Number of messages waiting for the user.
    pub async fn pending(&self, user_id: UserId) -> Result<usize> {
        let key = self.config.offline_key(user_id);
        Ok(self.store.list_range(&key).await?.len())
    }
}

/// Decode a head-first list into enqueue order.
fn decode_backlog(raw: Vec<String>) -> Vec<ChatMessage> {
    raw.into_iter()
        .rev()
        .filter_map(|entry| match ChatMessage::from_json(&entry) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, "Skipping corrupt offline entry");
                None
            }
        })
        .collect()
}
