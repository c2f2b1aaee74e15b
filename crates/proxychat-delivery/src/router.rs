//! Message routing.
//!
//! This module provides the `MessageRouter`, which decides for every inbound
//! message whether each recipient is reached locally, through the relay, or
//! through the offline queue.
//!
//! # Routing Logic
//!
//! For each message, the router:
//! 1. Validates that exactly one of `receiver_id` / `group_id` is set
//! 2. Resolves recipients: the receiver, or every group member but the sender
//! 3. For each recipient, independently:
//!    - registered on this process: write to its stream, done
//!    - not registered: push to its offline queue (with TTL), then publish on
//!      its relay channel for whichever process may hold it
//!
//! Both the enqueue and the publish happen for every non-local recipient, so
//! a recipient connected to another process gets the message live and again
//! from its offline queue on its next reconnect. Nothing is retried; a
//! failure for one group member never affects the others.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::groups::GroupMembership;
use crate::message::{ChatMessage, RouteTarget};
use crate::offline::OfflineQueue;
use crate::registry::{ConnectionRegistry, SendResult};
use crate::relay::CrossInstanceRelay;
use crate::types::UserId;

/// Outcome of delivery to a single recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientOutcome {
    /// Written to the recipient's stream on this process
    DeliveredLocal,
    /// Stored in the offline queue; `published` tells whether the relay
    /// publish also succeeded
    Queued {
        /// Whether the relay publish succeeded
        published: bool,
    },
    /// Nothing was delivered or stored
    Failed {
        /// Error description
        reason: String,
    },
}

/// Result of one dispatch, for logging and tests.
///
/// The sender is never told about it.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Validated destination, None if the message was rejected
    pub target: Option<RouteTarget>,
    /// Why the message was rejected or could not be fanned out
    pub error: Option<String>,
    /// One entry per delivery attempt
    pub outcomes: Vec<(UserId, RecipientOutcome)>,
    /// Set when the sender was a member of the target group and skipped
    pub skipped_sender: Option<UserId>,
}

impl DispatchReport {
    fn rejected(reason: String) -> Self {
        Self {
            error: Some(reason),
            ..Self::default()
        }
    }

    /// Number of delivery attempts made.
    pub fn attempts(&self) -> usize {
        self.outcomes.len()
    }

    pub fn delivered_count(&self) -> usize {
        self.count(|o| matches!(o, RecipientOutcome::DeliveredLocal))
    }

    pub fn queued_count(&self) -> usize {
        self.count(|o| matches!(o, RecipientOutcome::Queued { .. }))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|o| matches!(o, RecipientOutcome::Failed { .. }))
    }

    /// Outcome for a given recipient, if one was attempted.
    pub fn outcome_for(&self, user_id: UserId) -> Option<&RecipientOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == user_id)
            .map(|(_, outcome)| outcome)
    }

    fn count(&self, pred: impl Fn(&RecipientOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

/// Router for local, relayed and offline message delivery.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    offline: OfflineQueue,
    relay: Arc<CrossInstanceRelay>,
    groups: GroupMembership,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        offline: OfflineQueue,
        relay: Arc<CrossInstanceRelay>,
        groups: GroupMembership,
    ) -> Self {
        Self {
            registry,
            offline,
            relay,
            groups,
        }
    }

    /// Route one inbound message.
    ///
    /// Malformed messages are dropped with a logged diagnostic.
    #[instrument(skip(self, message), fields(sender = %message.sender_id(), kind = ?message.kind()))]
    pub async fn dispatch(&self, message: ChatMessage) -> DispatchReport {
        let target = match message.route_target() {
            Ok(target) => target,
            Err(e) => {
                warn!(error = %e, "Dropping malformed message");
                return DispatchReport::rejected(e.to_string());
            }
        };

        let message = Arc::new(message);
        let mut report = DispatchReport {
            target: Some(target),
            ..DispatchReport::default()
        };

        match target {
            RouteTarget::Direct(receiver_id) => {
                let outcome = self.deliver_to(receiver_id, &message).await;
                report.outcomes.push((receiver_id, outcome));
            }
            RouteTarget::Group(group_id) => {
                let members = match self.groups.members(group_id).await {
                    Ok(members) => members,
                    Err(e) => {
                        warn!(group_id = %group_id, error = %e, "Error fetching group members");
                        report.error = Some(e.to_string());
                        return report;
                    }
                };

                for member in members {
                    if member == message.sender_id() {
                        report.skipped_sender = Some(member);
                        continue;
                    }
                    let outcome = self.deliver_to(member, &message).await;
                    report.outcomes.push((member, outcome));
                }
            }
        }

        debug!(
            attempts = report.attempts(),
            delivered = report.delivered_count(),
            queued = report.queued_count(),
            failed = report.failed_count(),
            "Dispatch complete"
        );
        report
    }

    /// Deliver to one recipient: locally if registered, otherwise offline
    /// queue plus relay publish.
    async fn deliver_to(&self, user_id: UserId, message: &Arc<ChatMessage>) -> RecipientOutcome {
        match self.registry.send_to(user_id, Arc::clone(message)) {
            SendResult::Sent => return RecipientOutcome::DeliveredLocal,
            SendResult::NotConnected => {}
            failed => {
                warn!(user_id = %user_id, result = ?failed, "Error sending message to local stream");
                return RecipientOutcome::Failed {
                    reason: format!("local write failed: {:?}", failed),
                };
            }
        }

        if let Err(e) = self.offline.enqueue(user_id, message).await {
            warn!(user_id = %user_id, error = %e, "Error storing offline message");
            return RecipientOutcome::Failed {
                reason: e.to_string(),
            };
        }

        let published = match self.relay.publish(user_id, message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Error publishing message to relay");
                false
            }
        };

        RecipientOutcome::Queued { published }
    }
}
