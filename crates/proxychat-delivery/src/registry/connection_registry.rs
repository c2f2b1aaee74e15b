//! Connection Registry implementation.
//!
//! Tracks active sessions by user id for message routing.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::message::ChatMessage;
use crate::types::{ConnectionId, UserId};

/// An item to be written to a connection.
///
/// This is the message type sent through the outbound channel to the
/// session's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A chat message to serialize onto the socket
    Message(Arc<ChatMessage>),
    /// Close the socket with the given reason
    Close {
        /// Human-readable close reason sent in the close frame
        reason: String,
    },
}

/// Connection state stored in the registry.
#[derive(Debug)]
pub struct ConnectionEntry {
    /// Identifies the session that owns this entry
    pub connection_id: ConnectionId,
    /// Channel to the session's writer task
    pub sender: mpsc::Sender<Outbound>,
    /// When the session registered
    pub connected_at: DateTime<Utc>,
}

impl ConnectionEntry {
    /// Create a new connection entry.
    pub fn new(connection_id: ConnectionId, sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            connection_id,
            sender,
            connected_at: Utc::now(),
        }
    }

    /// Ask the session to close its socket.
    ///
    /// Best-effort: a session whose writer already exited has nothing left
    /// to close.
    pub fn close(&self, reason: impl Into<String>) -> bool {
        self.sender
            .try_send(Outbound::Close {
                reason: reason.into(),
            })
            .is_ok()
    }
}

/// A cloned handle to a registered stream, as returned by a lookup.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Owner of the stream
    pub user_id: UserId,
    /// Session the stream belongs to
    pub connection_id: ConnectionId,
    sender: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Queue a message for the session's writer without waiting.
    pub fn deliver(&self, message: Arc<ChatMessage>) -> SendResult {
        match self.sender.try_send(Outbound::Message(message)) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendResult::ChannelFull,
            Err(mpsc::error::TrySendError::Closed(_)) => SendResult::ChannelClosed,
        }
    }
}

/// Result of attempting to send a message to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Message was successfully queued for delivery
    Sent,
    /// The recipient is not currently connected to this process
    NotConnected,
    /// The recipient's outbound queue is full
    ChannelFull,
    /// The recipient's writer has gone away
    ChannelClosed,
}

impl SendResult {
    /// Whether the message reached the recipient's queue.
    pub fn is_sent(self) -> bool {
        matches!(self, SendResult::Sent)
    }
}

/// Registry for tracking live sessions on this process.
///
/// Thread-safe registry that maps user ids to connection entries.
/// Uses DashMap for concurrent access without explicit locking; every
/// operation is in-memory and non-blocking.
///
/// ## Usage
///
/// ```ignore
/// let registry = ConnectionRegistry::new();
///
/// // When a session is upgraded:
/// let (tx, rx) = mpsc::channel(256);
/// if let Some(old) = registry.register(user_id, connection_id, tx) {
///     old.close("superseded");
/// }
///
/// // When routing a message:
/// let result = registry.send_to(receiver_id, Arc::new(message));
///
/// // When the session closes:
/// registry.unregister_connection(user_id, connection_id);
/// ```
pub struct ConnectionRegistry {
    connections: DashMap<UserId, ConnectionEntry>,
}

impl ConnectionRegistry {
    /// Create a new connection registry.
    pub fn new() -> Self {
        info!("Creating connection registry");
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a session's outbound channel.
    ///
    /// At most one entry exists per user. If the user already has an entry it
    /// is replaced and returned; closing the superseded stream is the
    /// caller's job.
    #[instrument(skip(self, sender), fields(user_id = %user_id, connection_id = %connection_id))]
    pub fn register(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        sender: mpsc::Sender<Outbound>,
    ) -> Option<ConnectionEntry> {
        let existing = self
            .connections
            .insert(user_id, ConnectionEntry::new(connection_id, sender));
        if existing.is_some() {
            debug!("Replaced existing connection registration");
        } else {
            debug!("Registered new connection");
        }
        existing
    }

    /// Unregister whatever session the user currently has.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn unregister(&self, user_id: UserId) -> Option<ConnectionEntry> {
        let removed = self.connections.remove(&user_id);
        if removed.is_some() {
            debug!("Unregistered connection");
        } else {
            debug!("Connection was not registered");
        }
        removed.map(|(_, entry)| entry)
    }

    /// Unregister the user only if the entry still belongs to `connection_id`.
    ///
    /// A superseded session calls this on teardown and must not evict the
    /// session that replaced it.
    #[instrument(skip(self), fields(user_id = %user_id, connection_id = %connection_id))]
    pub fn unregister_connection(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Option<ConnectionEntry> {
        let removed = self
            .connections
            .remove_if(&user_id, |_, entry| entry.connection_id == connection_id);
        if removed.is_some() {
            debug!("Unregistered connection");
        } else {
            debug!("Entry belongs to another connection or is gone");
        }
        removed.map(|(_, entry)| entry)
    }

    /// Look up the user's local stream.
    pub fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.connections.get(&user_id).map(|entry| ConnectionHandle {
            user_id,
            connection_id: entry.connection_id,
            sender: entry.sender.clone(),
        })
    }

    /// Check if a user is connected to this process.
    pub fn is_connected(&self, user_id: UserId) -> bool {
        self.connections.contains_key(&user_id)
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Send a message to a locally connected user.
    ///
    /// A failed write does not remove the entry; the recipient's own session
    /// tears it down when its read loop ends.
    #[instrument(skip(self, message), fields(to = %user_id))]
    pub fn send_to(&self, user_id: UserId, message: Arc<ChatMessage>) -> SendResult {
        let Some(handle) = self.lookup(user_id) else {
            debug!("Recipient not connected");
            return SendResult::NotConnected;
        };

        let result = handle.deliver(message);
        match result {
            SendResult::Sent => debug!("Message queued for delivery"),
            SendResult::ChannelFull => warn!("Outbound channel full, message dropped"),
            SendResult::ChannelClosed => {
                warn!("Outbound channel closed, entry left for the session to clean up")
            }
            SendResult::NotConnected => {}
        }
        result
    }

    /// List all connected users.
    ///
    /// Useful for debugging and monitoring.
    pub fn list_connections(&self) -> Vec<UserId> {
        self.connections.iter().map(|r| *r.key()).collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.connections.len())
            .finish()
    }
}
