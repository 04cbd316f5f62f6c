//! Traccar adapters for the fleet sync core.
//!
//! The core only knows the `Transport`, `RestClient` and `KeyValueStore`
//! traits. This crate implements them against a Traccar server and ships
//! the `traccar-sync` binary that runs the engine.
//!
//! # Architecture
//!
//! ```text
//!        Traccar server
//!     /api/session   /api/socket   /api/positions, /api/devices
//!          │              │                 │
//!          ▼              ▼                 ▼
//! ┌─────────────────────────────────────────────────┐
//! │  TraccarClient (login, REST, Basic auth)         │
//! │  WebSocketTransport (cookie session, frames)     │
//! └─────────────────────────────────────────────────┘
//!          │                        │
//!          ▼                        ▼
//!     fleet_sync::SyncEngine ◀── SqliteStore (snapshots)
//!          │
//!          ▼
//!     diffs + connection state
//! ```

pub mod api;
pub mod config;
pub mod socket;
pub mod store;

pub use api::TraccarClient;
pub use config::{AppConfig, TraccarConfig};
pub use socket::WebSocketTransport;
pub use store::SqliteStore;
