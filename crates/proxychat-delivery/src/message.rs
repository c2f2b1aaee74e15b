//! Chat message model.
//!
//! The same JSON shape is used on the WebSocket, in the offline queue and on
//! the relay channels:
//!
//! ```json
//! {"type":"direct","sender_id":1,"sender_name":"ana","receiver_id":2,
//!  "content":"hi","created_at":"2025-01-01T00:00:00Z"}
//! ```
//!
//! `receiver_id` and `group_id` are omitted when absent; a value of `0` on
//! input is treated as absent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::types::{GroupId, UserId};
use crate::{DeliveryError, Result};

/// Message kind, carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Point-to-point message addressed by `receiver_id`
    Direct,
    /// Fan-out to the members of `group_id`
    Group,
}

/// Where a message is going, once validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    /// A single user
    Direct(UserId),
    /// Every member of a group except the sender
    Group(GroupId),
}

/// A chat message.
///
/// Immutable once constructed; cloned cheaply behind an `Arc` when it is
/// delivered to several connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(
        default,
        deserialize_with = "zero_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    group_id: Option<GroupId>,
    sender_id: UserId,
    #[serde(default)]
    sender_name: String,
    #[serde(
        default,
        deserialize_with = "zero_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    receiver_id: Option<UserId>,
    content: String,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
}

fn zero_as_none<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: From<i64>,
{
    let raw = Option::<i64>::deserialize(deserializer)?;
    Ok(raw.filter(|v| *v != 0).map(T::from))
}

impl ChatMessage {
    /// Build a direct message stamped with the current time.
    pub fn direct(
        sender_id: UserId,
        sender_name: impl Into<String>,
        receiver_id: UserId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageKind::Direct,
            group_id: None,
            sender_id,
            sender_name: sender_name.into(),
            receiver_id: Some(receiver_id),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// Build a group message stamped with the current time.
    pub fn group(
        sender_id: UserId,
        sender_name: impl Into<String>,
        group_id: GroupId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageKind::Group,
            group_id: Some(group_id),
            sender_id,
            sender_name: sender_name.into(),
            receiver_id: None,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// Parse a message from its JSON wire form.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn sender_id(&self) -> UserId {
        self.sender_id
    }

    pub fn sender_name(&self) -> &str {
        &self.sender_name
    }

    pub fn receiver_id(&self) -> Option<UserId> {
        self.receiver_id
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.group_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Validate the routing fields and return the destination.
    ///
    /// Exactly one of `receiver_id` / `group_id` must be set, it must be a
    /// positive id, and it must agree with `type`.
    pub fn route_target(&self) -> Result<RouteTarget> {
        match (self.kind, self.receiver_id, self.group_id) {
            (_, Some(_), Some(_)) => Err(DeliveryError::invalid_message(
                "both receiver_id and group_id are set",
            )),
            (_, None, None) => Err(DeliveryError::invalid_message(
                "neither receiver_id nor group_id is set",
            )),
            (MessageKind::Direct, Some(receiver), None) if receiver.is_valid() => {
                Ok(RouteTarget::Direct(receiver))
            }
            (MessageKind::Group, None, Some(group)) if group.is_valid() => {
                Ok(RouteTarget::Group(group))
            }
            (MessageKind::Direct, None, Some(_)) | (MessageKind::Group, Some(_), None) => Err(
                DeliveryError::invalid_message(format!("target does not match type {:?}", self.kind)),
            ),
            _ => Err(DeliveryError::invalid_message("routing id must be positive")),
        }
    }
}
