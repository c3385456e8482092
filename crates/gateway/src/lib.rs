//! Stateless realtime fan-out gateway.
//!
//! This service:
//! - Accepts WebSocket connections and authenticates them with RS256 JWTs
//! - Maintains a concurrent room/user membership index for routing
//! - Consumes events from NATS JetStream streams via durable pull consumers
//! - Fans each event out to the matching rooms or user sessions
//! - Forwards client-originated events back onto the bus
//!
//! ## Architecture
//!
//! ```text
//! NATS: {STREAM}.>  (durable pull consumer per stream)
//!         ↓
//! BusConsumer (decode envelope, pick room/user target)
//!         ↓
//! RoomManager (DashMap-based, lock-free)
//!         ↓
//! per-connection bounded queue → writer task → WebSocket client
//!
//! WebSocket client → reader task → control dispatch (ping/join/leave/typing)
//!                                  or publish to CHAT.events
//! ```
//!
//! ## Low-latency design
//!
//! - Lock-free membership index using DashMap; no global lock during fan-out
//! - Messages serialized once and shared across recipients
//! - Bounded per-connection queues: a slow consumer drops frames, it never
//!   blocks the broadcaster
//! - Durability and ordering belong to the bus; the gateway is best-effort

pub mod auth;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod rooms;
pub mod session;
pub mod ws_server;

pub use auth::{AuthError, Claims, TokenVerifier};
pub use config::Config;
pub use connection::{ClientId, Connection, Enqueue, Identity};
pub use consumer::{BusConsumer, EVENTS_SUBJECT};
pub use error::{GatewayError, Result};
pub use protocol::{ClientMessage, Envelope};
pub use rooms::RoomManager;
pub use ws_server::{create_router, AppState};
