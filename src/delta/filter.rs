use crate::entity::{Device, DeviceStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Which devices the consumer wants to see
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceFilter {
    /// Case-insensitive substring of the device name or unique id
    #[serde(default)]
    pub query: Option<String>,

    /// Accepted statuses; empty accepts every status
    #[serde(default)]
    pub statuses: HashSet<DeviceStatus>,
}

impl DeviceFilter {
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_status(mut self, status: DeviceStatus) -> Self {
        self.statuses.insert(status);
        self
    }

    /// True if the filter accepts everything
    pub fn is_empty(&self) -> bool {
        self.query().is_none() && self.statuses.is_empty()
    }

    /// Whether an entity with this device record passes the filter.
    ///
    /// Entities without a known device only pass an empty filter.
    pub fn matches(&self, device: Option<&Device>) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(device) = device else {
            return false;
        };

        if !self.statuses.is_empty() && !self.statuses.contains(&device.status) {
            return false;
        }

        match self.query() {
            Some(query) => {
                device.name.to_lowercase().contains(&query)
                    || device.unique_id.to_lowercase().contains(&query)
            }
            None => true,
        }
    }

    fn query(&self) -> Option<String> {
        self.query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase)
    }
}
