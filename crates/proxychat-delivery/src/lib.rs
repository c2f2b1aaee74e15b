//! # proxychat-delivery
//!
//! Real-time message delivery for Proxy Chat.
//!
//! Clients hold one WebSocket stream per user. This crate decides, for every
//! message a client sends, how each recipient is reached and keeps the
//! per-connection state needed to do so. It is embedded in `proxychat-server`.
//!
//! ## Architecture
//!
//! - **Registry**: process-local map of user id to live stream
//! - **Router**: local delivery, or offline queue plus relay publish
//! - **Offline Queue**: per-user FIFO with TTL in the shared store
//! - **Relay**: pub/sub subscriber delivering messages published by other
//!   processes to recipients registered here
//! - **Sessions**: connect, drain backlog, read, tear down
//!
//! Delivery is best-effort, at-least-once for recipients that reconnect
//! before their backlog expires, and never acknowledged to the sender.

pub mod config;
pub mod groups;
pub mod message;
pub mod offline;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod router;
pub mod service;
pub mod session;
pub mod store;

mod error;
mod types;

pub use config::DeliveryConfig;
pub use error::{DeliveryError, Result};
pub use message::{ChatMessage, MessageKind, RouteTarget};
pub use presence::{MemoryPresenceStore, PresenceStore};
pub use registry::{ConnectionRegistry, Outbound, SendResult};
pub use router::{DispatchReport, MessageRouter, RecipientOutcome};
pub use service::DeliveryService;
pub use session::{Session, SessionManager, SessionOutbound, SessionState};
pub use store::{KeyValueStore, MemoryStore, RedisStore};
pub use types::*;
