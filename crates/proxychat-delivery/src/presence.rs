//! Persisted online/offline flag.
//!
//! The flag is written on registry entry creation and removal and read only
//! by the CRUD layer. Delivery decisions never consult it.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::types::UserId;
use crate::Result;

/// Trait for presence flag backends.
///
/// The server provides a relational implementation; the in-memory one is
/// used for single-node development and tests.
#[async_trait]
pub trait PresenceStore: Send + Sync + 'static {
    /// Set the user's online flag.
    async fn set_online(&self, user_id: UserId, online: bool) -> Result<()>;
}

/// In-memory presence flags.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    flags: DashMap<UserId, bool>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last flag written for the user, None if never written.
    pub fn is_online(&self, user_id: UserId) -> Option<bool> {
        self.flags.get(&user_id).map(|flag| *flag)
    }

    /// Users currently flagged online.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .flags
            .iter()
            .filter(|entry| *entry.value())
            .map(|entry| *entry.key())
            .collect();
        users.sort();
        users
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_online(&self, user_id: UserId, online: bool) -> Result<()> {
        self.flags.insert(user_id, online);
        debug!(user_id = %user_id, online = online, "Updated presence flag");
        Ok(())
    }
}
