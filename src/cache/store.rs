use anyhow::Result;
use dashmap::DashMap;

/// Durable key-value storage used by the snapshot cache.
///
/// Implementations must be safe to call from any task. Values are opaque
/// strings (JSON-encoded cache entries).
pub trait KeyValueStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace
    fn write(&self, key: &str, value: &str) -> Result<()>;

    /// Deleting a missing key is not an error
    fn delete(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory store, for tests and for running without durability
#[derive(Default)]
pub struct MemoryStore {
    values: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .values
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }
}
