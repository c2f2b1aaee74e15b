//! Tunables for the delivery subsystem.

use std::time::Duration;

use crate::types::{GroupId, UserId};

/// How long an untouched offline backlog survives.
pub const DEFAULT_OFFLINE_TTL: Duration = Duration::from_secs(60 * 60);

/// Depth of each connection's outbound queue.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Delivery configuration.
///
/// The key and channel prefixes must be identical on every instance sharing
/// a store, otherwise the relay and offline queues silently stop lining up.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// TTL (re)applied to a user's offline queue on every push
    pub offline_ttl: Duration,
    /// Per-connection outbound queue depth
    pub outbound_buffer: usize,
    /// Prefix of offline queue keys (`offline:<user_id>`)
    pub offline_key_prefix: String,
    /// Prefix of per-user relay channels (`ws:<user_id>`)
    pub channel_prefix: String,
    /// Prefix of group membership sets (`group:<group_id>`)
    pub group_key_prefix: String,
    /// Hash indexing which users are connected somewhere
    pub active_users_key: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            offline_ttl: DEFAULT_OFFLINE_TTL,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            offline_key_prefix: "offline:".to_string(),
            channel_prefix: "ws:".to_string(),
            group_key_prefix: "group:".to_string(),
            active_users_key: "active_users".to_string(),
        }
    }
}

impl DeliveryConfig {
    /// Set the offline queue TTL.
    pub fn with_offline_ttl(mut self, ttl: Duration) -> Self {
        self.offline_ttl = ttl;
        self
    }

    /// Set the per-connection outbound queue depth.
    pub fn with_outbound_buffer(mut self, buffer: usize) -> Self {
        self.outbound_buffer = buffer.max(1);
        self
    }

    pub fn offline_key(&self, user_id: UserId) -> String {
        format!("{}{}", self.offline_key_prefix, user_id)
    }

    pub fn user_channel(&self, user_id: UserId) -> String {
        format!("{}{}", self.channel_prefix, user_id)
    }

    /// Pattern covering every per-user channel.
    pub fn channel_pattern(&self) -> String {
        format!("{}*", self.channel_prefix)
    }

    /// Recover the user id from a per-user channel name.
    pub fn user_from_channel(&self, channel: &str) -> Option<UserId> {
        channel
            .strip_prefix(&self.channel_prefix)
            .and_then(|rest| rest.parse().ok())
    }

    pub fn group_key(&self, group_id: GroupId) -> String {
        format!("{}{}", self.group_key_prefix, group_id)
    }
}
