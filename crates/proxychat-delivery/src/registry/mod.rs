//! Connection Registry for real-time message delivery.
//!
//! This module provides a thread-safe, process-local registry that tracks the
//! live WebSocket session of each connected user, so the router can tell
//! whether a recipient is reachable on this instance.
//!
//! ## Architecture
//!
//! Each session registers a channel sender once it is upgraded. The session's
//! writer task owns the receiving end and forwards everything to the socket.
//!
//! ```text
//! Session (user 1) <-> ConnectionRegistry <-> Session (user 2)
//!        |                    |                     |
//!        v                    v                     v
//!  mpsc::Sender        DashMap<UserId,         mpsc::Sender
//!                       ConnectionEntry>
//! ```
//!
//! The registry never closes streams itself. When a registration supersedes
//! an older one, the displaced entry is handed back to the caller.

mod connection_registry;

pub use connection_registry::{
    ConnectionEntry, ConnectionHandle, ConnectionRegistry, Outbound, SendResult,
};
