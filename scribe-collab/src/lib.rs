//! # scribe-collab: Realtime document collaboration backend
//!
//! Relays opaque editing frames between every client viewing the same
//! document, across any number of server instances, and persists the latest
//! full-document snapshot with debounced writes.
//!
//! ## Architecture
//!
//! ```text
//!  client ──ws──► Connection ──► Hub ──┬──► Room (local fan-out) ──► Connection ──ws──► client
//!                     │                │
//!                     │                └──► FanoutBus ──► other instances' Hubs ──► their Rooms
//!                     │
//!                     └── tag-3 frames ──► save queue ──► persistence loop ──► DocumentStore
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Frame tagging and the bus wire format (bincode)
//! - [`connection`]: One socket, its bounded queues, read/write loops
//! - [`room`]: Per-document membership and non-blocking fan-out
//! - [`hub`]: Room registry, accept-and-attach, bus bridge, idle eviction
//! - [`persistence`]: Debounced snapshot writes
//! - [`bus`]: Cross-instance fan-out (in-process or Redis)
//! - [`storage`]: Snapshot stores (in-memory or RocksDB)
//! - [`server`]: WebSocket accept loop with admission control
//!
//! Delivery is best-effort throughout: full queues drop the newest item,
//! bus and store failures are logged and counted in [`stats::HubStats`],
//! and nothing is ever surfaced back to the sending client.

pub mod admission;
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod persistence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod stats;
pub mod storage;

// Re-exports for convenience
pub use admission::{AdmissionControl, RateLimit};
pub use bus::{BusError, BusSink, FanoutBus, LocalBus, RedisBus};
pub use config::ServerConfig;
pub use connection::{Connection, ConnectionHandle, ConnectionLimits};
pub use error::ServerError;
pub use hub::{Hub, HubConfig};
pub use persistence::{SaveDebouncer, SaveState};
pub use protocol::{BusMessage, DocumentId, Frame, FrameKind, ProtocolError};
pub use room::Room;
pub use server::Server;
pub use stats::{HubStats, StatsSnapshot};
pub use storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};
