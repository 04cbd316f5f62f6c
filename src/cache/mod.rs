use crate::entity::{EntityId, EntitySnapshot};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub mod config;
mod stats;
pub mod store;


pub use config::CacheConfig;
pub use stats::CacheStats;
pub use store::{KeyValueStore, MemoryStore};

use stats::CacheCounters;

/// Cached snapshot with its write time
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    pub entity: EntitySnapshot,
    pub written_at: DateTime<Utc>,
}

/// Last-known state per entity, bounded by age and count.
///
/// Reads never block each other (`DashMap`); writes replace atomically per
/// key and are written through to the persistence store. Persistence
/// failures are logged, never returned.
pub struct SnapshotCache {
    entries: DashMap<EntityId, CacheEntry>,
    store: Arc<dyn KeyValueStore>,
    config: CacheConfig,
    counters: CacheCounters,
}

impl SnapshotCache {
    pub fn new(config: CacheConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            entries: DashMap::new(),
            store,
            config,
            counters: CacheCounters::default(),
        }
    }

    /// Fresh snapshot for `id`, or `None` if absent or stale
    pub fn get(&self, id: EntityId) -> Option<EntitySnapshot> {
        self.get_at(id, Utc::now())
    }

    pub fn get_at(&self, id: EntityId, now: DateTime<Utc>) -> Option<EntitySnapshot> {
        // Guard must be released before a stale entry is removed
        let stale = match self.entries.get(&id) {
            Some(entry) if !self.is_stale(&entry, now) => {
                self.counters.record_hit();
                return Some(entry.entity.clone());
            }
            Some(_) => true,
            None => false,
        };

        self.counters.record_miss();
        if stale && self.evict_stale(id, now) {
            debug!(entity_id = id, "Evicted stale snapshot on read");
        }
        None
    }

    /// Store or overwrite, stamped with the current time
    pub fn put(&self, entity: EntitySnapshot) {
        self.put_at(entity, Utc::now());
    }

    pub fn put_at(&self, entity: EntitySnapshot, written_at: DateTime<Utc>) {
        let entry = CacheEntry {
            entity,
            written_at,
        };
        self.persist(&entry);
        self.entries.insert(entry.entity.id, entry);
        self.enforce_capacity();
    }

    /// Apply `entity` if it is newer than the cached snapshot.
    ///
    /// Returns true if the cache changed. A stale cached entry is treated
    /// as absent.
    pub fn merge(&self, entity: EntitySnapshot) -> bool {
        let now = Utc::now();
        let accepted = match self.entries.entry(entity.id) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if self.is_stale(current, now) || current.entity.is_superseded_by(&entity) {
                    occupied.insert(CacheEntry {
                        entity,
                        written_at: now,
                    });
                    Some(occupied.get().clone())
                } else {
                    None
                }
            }
            Entry::Vacant(vacant) => {
                let entry = vacant.insert(CacheEntry {
                    entity,
                    written_at: now,
                });
                Some(entry.value().clone())
            }
        };

        match accepted {
            Some(entry) => {
                self.persist(&entry);
                self.enforce_capacity();
                true
            }
            None => false,
        }
    }

    /// Remove an entity explicitly
    pub fn remove(&self, id: EntityId) -> Option<EntitySnapshot> {
        let removed = self.entries.remove(&id).map(|(_, entry)| entry.entity);
        self.delete_persisted(id);
        removed
    }

    /// Hydrate from the persistence store.
    ///
    /// Stale and corrupt entries are skipped and deleted from the store.
    /// Never fails: an unreadable store yields an empty map.
    pub fn load_all(&self) -> HashMap<EntityId, EntitySnapshot> {
        self.load_all_at(Utc::now())
    }

    pub fn load_all_at(&self, now: DateTime<Utc>) -> HashMap<EntityId, EntitySnapshot> {
        let started = Instant::now();

        let keys = match self.store.keys(&self.config.key_prefix) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list persisted snapshots, starting empty");
                return HashMap::new();
            }
        };

        let mut loaded = HashMap::with_capacity(keys.len());
        let mut skipped_stale = 0usize;
        let mut skipped_corrupt = 0usize;

        for key in keys {
            match self.read_entry(&key) {
                Some(entry) if self.is_stale(&entry, now) => {
                    skipped_stale += 1;
                    self.delete_key(&key);
                }
                Some(entry) => {
                    loaded.insert(entry.entity.id, entry.entity.clone());
                    match self.entries.entry(entry.entity.id) {
                        Entry::Occupied(mut occupied) => {
                            if occupied.get().entity.is_superseded_by(&entry.entity) {
                                occupied.insert(entry);
                            }
                        }
                        Entry::Vacant(vacant) => {
                            vacant.insert(entry);
                        }
                    }
                }
                None => {
                    skipped_corrupt += 1;
                    self.delete_key(&key);
                }
            }
        }

        info!(
            entities = loaded.len(),
            skipped_stale = skipped_stale,
            skipped_corrupt = skipped_corrupt,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Hydrated snapshot cache"
        );

        loaded
    }

    /// All fresh snapshots currently held in memory
    pub fn fresh_entries(&self) -> HashMap<EntityId, EntitySnapshot> {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|e| !self.is_stale(e.value(), now))
            .map(|e| (*e.key(), e.value().entity.clone()))
            .collect()
    }

    /// Ids of all entries held in memory (fresh or not yet swept)
    pub fn ids(&self) -> Vec<EntityId> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    /// Remove every entry older than the staleness window.
    ///
    /// Returns the number of entries evicted.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let stale: Vec<EntityId> = self
            .entries
            .iter()
            .filter(|e| self.is_stale(e.value(), now))
            .map(|e| *e.key())
            .collect();

        let evicted = stale
            .into_iter()
            .filter(|id| self.evict_stale(*id, now))
            .count();

        if evicted > 0 {
            info!(evicted = evicted, "Swept stale snapshots");
        }
        evicted
    }

    /// Evict `id` only if the entry held right now is still stale.
    ///
    /// A write landing between the staleness check and the eviction keeps
    /// its entry and its persisted row.
    pub(crate) fn evict_stale(&self, id: EntityId, now: DateTime<Utc>) -> bool {
        self.evict_if(id, |entry| self.is_stale(entry, now))
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_stale(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        match (now - entry.written_at).to_std() {
            Ok(age) => age > self.config.staleness_window(),
            // Written in the future (clock skew): not stale
            Err(_) => false,
        }
    }

    /// Remove `id` if `pred` holds for its current entry. The check, the
    /// removal and the store delete all happen under the shard lock.
    fn evict_if(&self, id: EntityId, pred: impl FnOnce(&CacheEntry) -> bool) -> bool {
        let removed = self.entries.remove_if(&id, |_, entry| {
            if pred(entry) {
                self.delete_persisted(id);
                true
            } else {
                false
            }
        });

        if removed.is_some() {
            self.counters.record_evictions(1);
            true
        } else {
            false
        }
    }

    fn enforce_capacity(&self) {
        while self.entries.len() > self.config.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().written_at)
                .map(|e| (*e.key(), e.value().written_at));

            match oldest {
                // Skipped if rewritten meanwhile; the next pass picks again
                Some((id, written_at)) => {
                    if self.evict_if(id, |entry| entry.written_at == written_at) {
                        debug!(entity_id = id, "Cache full, evicted oldest snapshot");
                    }
                }
                None => break,
            }
        }
    }

    fn key_for(&self, id: EntityId) -> String {
        format!("{}{}", self.config.key_prefix, id)
    }

    fn read_entry(&self, key: &str) -> Option<CacheEntry> {
        let expected_id: EntityId = key.strip_prefix(&self.config.key_prefix)?.parse().ok()?;

        let raw = match self.store.read(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read persisted snapshot");
                return None;
            }
        };

        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) if entry.entity.id == expected_id => Some(entry),
            Ok(_) => {
                warn!(key = %key, "Persisted snapshot id mismatch, dropping");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Corrupt persisted snapshot, dropping");
                None
            }
        }
    }

    fn persist(&self, entry: &CacheEntry) {
        let key = self.key_for(entry.entity.id);
        let value = match serde_json::to_string(entry) {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize snapshot");
                return;
            }
        };
        if let Err(e) = self.store.write(&key, &value) {
            warn!(key = %key, error = %e, "Failed to persist snapshot");
        }
    }

    fn delete_persisted(&self, id: EntityId) {
        let key = self.key_for(id);
        self.delete_key(&key);
    }

    fn delete_key(&self, key: &str) {
        if let Err(e) = self.store.delete(key) {
            warn!(key = %key, error = %e, "Failed to delete persisted snapshot");
        }
    }
}
