use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

mod message;
#[cfg(test)]
mod tests;

pub use message::{decode_message, StreamMessage};

/// Entity identifier (Traccar device id)
pub type EntityId = i64;

/// Position fix reported by a device
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub device_id: EntityId,
    pub fix_time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub course: f64,
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

/// Last-known state of one entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: EntityId,

    /// Fix time of the position; drives merge precedence
    pub timestamp: DateTime<Utc>,

    pub position: Position,

    /// When this client accepted the snapshot
    pub last_update: DateTime<Utc>,
}

impl EntitySnapshot {
    pub fn from_position(position: Position) -> Self {
        Self {
            id: position.device_id,
            timestamp: position.fix_time,
            position,
            last_update: Utc::now(),
        }
    }

    /// True if `other` should replace `self`
    ///
    /// Latest timestamp wins. Equal timestamps keep the existing snapshot.
    pub fn is_superseded_by(&self, other: &EntitySnapshot) -> bool {
        other.timestamp > self.timestamp
    }

    /// Merge two snapshots of the same entity, keeping the newer one
    pub fn merge(self, other: EntitySnapshot) -> EntitySnapshot {
        if self.is_superseded_by(&other) {
            other
        } else {
            self
        }
    }
}

/// Device connectivity status as reported by the server
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Device attributes (name, status) used for filtering and rendering
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub unique_id: String,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}
