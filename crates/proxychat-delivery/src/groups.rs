//! Group membership sets.
//!
//! Membership is owned by the CRUD layer (joining a group adds the user id to
//! `group:<group_id>`); the router only reads it for fan-out.

use std::sync::Arc;

use tracing::warn;

use crate::config::DeliveryConfig;
use crate::store::KeyValueStore;
use crate::types::{GroupId, UserId};
use crate::Result;

/// Reader (and writer, for the CRUD side) of group membership sets.
#[derive(Clone)]
pub struct GroupMembership {
    store: Arc<dyn KeyValueStore>,
    config: Arc<DeliveryConfig>,
}

impl GroupMembership {
    pub fn new(store: Arc<dyn KeyValueStore>, config: Arc<DeliveryConfig>) -> Self {
        Self { store, config }
    }

    /// Current members of a group. Members that are not valid user ids are
    /// skipped and logged.
    pub async fn members(&self, group_id: GroupId) -> Result<Vec<UserId>> {
        let raw = self
            .store
            .set_members(&self.config.group_key(group_id))
            .await?;

        Ok(raw
            .into_iter()
            .filter_map(|member| match member.parse::<UserId>() {
                Ok(user_id) => Some(user_id),
                Err(_) => {
                    warn!(group_id = %group_id, member = %member, "Ignoring malformed group member");
                    None
                }
            })
            .collect())
    }

    /// Add a user to a group. Returns false if they were already a member.
    pub async fn join(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        self.store
            .set_add(&self.config.group_key(group_id), &user_id.to_string())
            .await
    }

    pub async fn is_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        self.store
            .set_is_member(&self.config.group_key(group_id), &user_id.to_string())
            .await
    }
}
