// Error taxonomy shared by every component
pub mod error;

// Entity model and stream message decoding
pub mod entity;

// Transport and REST boundaries
pub mod transport;

// Reconnect delay schedule with circuit breaker
pub mod backoff;

// TTL-bounded snapshot cache with write-through persistence
pub mod cache;

// Stream session manager
pub mod session;

// REST fallback poller
pub mod poller;

// Render-state diffing and throttling
pub mod delta;

// Wiring of all components into one live view
pub mod engine;

// Configuration loading
pub mod config;

pub use cache::{KeyValueStore, MemoryStore, SnapshotCache};
pub use config::{load_config, SyncConfig};
pub use delta::{DeviceFilter, DiffResult};
pub use engine::SyncEngine;
pub use entity::{Device, DeviceStatus, EntityId, EntitySnapshot, Position, StreamMessage};
pub use error::{ErrorKind, TransportError};
pub use session::{ConnectionState, ConnectionStatus};
pub use transport::{Connection, Frame, RestClient, Transport};
