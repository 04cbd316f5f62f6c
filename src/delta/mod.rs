//! Delta/dedup engine.
//!
//! Compares the current view of every entity with what was last handed to
//! the consumer, so only created, modified and removed entities need to be
//! rebuilt downstream.

use crate::entity::{Device, DeviceStatus, EntityId, EntitySnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

mod filter;


pub use filter::DeviceFilter;

/// Configuration for the delta engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeltaConfig {
    /// Minimum time between two computed diffs (milliseconds)
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

fn default_min_interval_ms() -> u64 {
    300
}

impl DeltaConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

/// Fields that decide whether an entity must be re-rendered
#[derive(Clone, Debug, PartialEq)]
pub struct RenderState {
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub course: f64,
    pub selected: bool,
    pub visible: bool,
    pub status: DeviceStatus,
}

impl RenderState {
    pub fn new(
        entity: &EntitySnapshot,
        device: Option<&Device>,
        selected: bool,
        filter: &DeviceFilter,
    ) -> Self {
        Self {
            latitude: entity.position.latitude,
            longitude: entity.position.longitude,
            speed: entity.position.speed,
            course: entity.position.course,
            selected,
            visible: filter.matches(device),
            status: device.map(|d| d.status).unwrap_or_default(),
        }
    }

    /// Bit-level equality; `NaN == NaN` and `0.0 != -0.0`
    pub fn same_as(&self, other: &RenderState) -> bool {
        self.latitude.to_bits() == other.latitude.to_bits()
            && self.longitude.to_bits() == other.longitude.to_bits()
            && self.speed.to_bits() == other.speed.to_bits()
            && self.course.to_bits() == other.course.to_bits()
            && self.selected == other.selected
            && self.visible == other.visible
            && self.status == other.status
    }
}

/// Classification of every affected entity for one diff
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DiffResult {
    pub created: Vec<EntityId>,
    pub reused: Vec<EntityId>,
    pub modified: Vec<EntityId>,
    pub removed: Vec<EntityId>,

    /// reused / total; 1.0 when there was nothing to classify
    pub efficiency: f64,

    pub computed_at: DateTime<Utc>,
}

impl DiffResult {
    pub fn total(&self) -> usize {
        self.created.len() + self.reused.len() + self.modified.len() + self.removed.len()
    }

    /// True if nothing needs to be rebuilt
    pub fn is_unchanged(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Ids the consumer has to rebuild or drop
    pub fn changed(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.created
            .iter()
            .chain(self.modified.iter())
            .chain(self.removed.iter())
            .copied()
    }
}

/// Everything a diff is computed from
#[derive(Clone, Debug, Default)]
pub struct DiffInput {
    pub states: HashMap<EntityId, EntitySnapshot>,
    pub devices: HashMap<EntityId, Device>,
    pub selection: HashSet<EntityId>,
    pub filter: DeviceFilter,
}

/// Running efficiency counters
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DeltaStats {
    pub diffs: u64,
    pub entities: u64,
    pub reused: u64,
    /// Cumulative reused / entities; 1.0 before the first classified entity
    pub efficiency: f64,
}

/// Throttled differ over the last rendered state
pub struct DeltaEngine {
    min_interval: Duration,
    rendered: HashMap<EntityId, RenderState>,
    last_diff_at: Option<Instant>,
    pending: Option<DiffInput>,
    diffs: u64,
    entities: u64,
    reused: u64,
}

impl DeltaEngine {
    pub fn new(config: &DeltaConfig) -> Self {
        Self {
            min_interval: config.min_interval(),
            rendered: HashMap::new(),
            last_diff_at: None,
            pending: None,
            diffs: 0,
            entities: 0,
            reused: 0,
        }
    }

    /// Diff `input` against the last rendered state.
    ///
    /// Inside the throttle window the input is kept as pending, replacing
    /// any earlier pending input, and `None` is returned; call
    /// [`flush`](Self::flush) at [`next_flush_at`](Self::next_flush_at).
    pub fn diff(&mut self, input: DiffInput) -> Option<DiffResult> {
        self.diff_at(input, Instant::now())
    }

    pub fn diff_at(&mut self, input: DiffInput, now: Instant) -> Option<DiffResult> {
        if let Some(ready_at) = self.window_end() {
            if now < ready_at {
                debug!(entities = input.states.len(), "Diff throttled, keeping latest input");
                self.pending = Some(input);
                return None;
            }
        }

        self.pending = None;
        Some(self.compute(&input, now))
    }

    /// Diff `input` now, ignoring the throttle window. Drops pending input.
    pub fn diff_immediate(&mut self, input: DiffInput) -> DiffResult {
        self.pending = None;
        self.compute(&input, Instant::now())
    }

    /// Compute the pending diff if the throttle window has elapsed
    pub fn flush(&mut self) -> Option<DiffResult> {
        self.flush_at(Instant::now())
    }

    pub fn flush_at(&mut self, now: Instant) -> Option<DiffResult> {
        match self.next_flush_at() {
            Some(ready_at) if now >= ready_at => {
                let input = self.pending.take()?;
                Some(self.compute(&input, now))
            }
            _ => None,
        }
    }

    /// When the pending diff becomes computable, if there is one
    pub fn next_flush_at(&self) -> Option<Instant> {
        self.pending.as_ref()?;
        Some(self.window_end().unwrap_or_else(Instant::now))
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Forget every rendered entity; the next diff reports all as created
    pub fn reset(&mut self) {
        self.rendered.clear();
        self.pending = None;
        self.last_diff_at = None;
    }

    pub fn rendered_len(&self) -> usize {
        self.rendered.len()
    }

    pub fn stats(&self) -> DeltaStats {
        DeltaStats {
            diffs: self.diffs,
            entities: self.entities,
            reused: self.reused,
            efficiency: ratio(self.reused, self.entities),
        }
    }

    fn window_end(&self) -> Option<Instant> {
        self.last_diff_at.map(|at| at + self.min_interval)
    }

    fn compute(&mut self, input: &DiffInput, now: Instant) -> DiffResult {
        let mut result = DiffResult {
            created: Vec::new(),
            reused: Vec::new(),
            modified: Vec::new(),
            removed: Vec::new(),
            efficiency: 1.0,
            computed_at: Utc::now(),
        };

        let mut next = HashMap::with_capacity(input.states.len());
        for (id, entity) in &input.states {
            let state = RenderState::new(
                entity,
                input.devices.get(id),
                input.selection.contains(id),
                &input.filter,
            );

            match self.rendered.get(id) {
                None => result.created.push(*id),
                Some(prior) if prior.same_as(&state) => result.reused.push(*id),
                Some(_) => result.modified.push(*id),
            }
            next.insert(*id, state);
        }

        result.removed = self
            .rendered
            .keys()
            .filter(|id| !input.states.contains_key(id))
            .copied()
            .collect();

        result.created.sort_unstable();
        result.reused.sort_unstable();
        result.modified.sort_unstable();
        result.removed.sort_unstable();

        let total = result.total() as u64;
        result.efficiency = ratio(result.reused.len() as u64, total);

        self.rendered = next;
        self.last_diff_at = Some(now);
        self.diffs += 1;
        self.entities += total;
        self.reused += result.reused.len() as u64;

        debug!(
            created = result.created.len(),
            reused = result.reused.len(),
            modified = result.modified.len(),
            removed = result.removed.len(),
            efficiency = result.efficiency,
            "Computed diff"
        );

        result
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        part as f64 / total as f64
    }
}
