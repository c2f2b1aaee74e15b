//! Durable key-value store used by the offline queue, group fan-out and relay.
//!
//! The store is shared by every server process. Each operation is assumed to
//! be atomic on its own; nothing here combines operations into a transaction
//! except [`KeyValueStore::list_take_all`], which reads and removes a list in
//! one step.
//!
//! ## Implementations
//!
//! - [`RedisStore`]: production backend, one Redis shared by all instances
//! - [`MemoryStore`]: in-process backend for tests and single-instance development

mod memory_store;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::Result;

pub use self::memory_store::MemoryStore;
pub use self::redis_store::RedisStore;

/// A payload received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Concrete channel the payload was published on
    pub channel: String,
    /// Raw payload
    pub payload: String,
}

/// Stream of published payloads for a pattern subscription.
///
/// Ends when the underlying subscription connection is lost.
pub type PublishedStream = BoxStream<'static, PublishedMessage>;

/// Operations consumed from the shared durable store.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Push a value at the head of a list (`LPUSH`).
    async fn list_push_head(&self, key: &str, value: &str) -> Result<()>;

    /// Read a whole list, head first (`LRANGE 0 -1`).
    async fn list_range(&self, key: &str) -> Result<Vec<String>>;

    /// Read a whole list, head first, and delete the key in the same step.
    async fn list_take_all(&self, key: &str) -> Result<Vec<String>>;

    /// Delete a key of any type.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Set (or refresh) the time-to-live of a key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Add a member to a set. Returns true if it was not already present.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;

    /// All members of a set; empty if the key does not exist.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Set membership check.
    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool>;

    /// Set a field of a hash.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Remove a field of a hash.
    async fn hash_delete(&self, key: &str, field: &str) -> Result<()>;

    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to every channel matching a glob pattern (`PSUBSCRIBE`).
    async fn psubscribe(&self, pattern: &str) -> Result<PublishedStream>;

    /// Round-trip health probe.
    async fn ping(&self) -> Result<()>;
}

/// Glob match supporting `*` wildcards, as used by pattern subscriptions.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = channel.strip_prefix(first) else {
        return false;
    };

    let pieces: Vec<&str> = parts.collect();
    if pieces.is_empty() {
        return rest.is_empty();
    }

    let (middle, last) = pieces.split_at(pieces.len() - 1);
    for piece in middle {
        match rest.find(piece) {
            Some(idx) => rest = &rest[idx + piece.len()..],
            None => return false,
        }
    }
    rest.ends_with(last[0])
}
