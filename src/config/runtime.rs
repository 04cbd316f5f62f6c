use super::SyncConfig;
use std::str::FromStr;
use tracing::warn;

impl SyncConfig {
    /// Apply `FLEET_SYNC_*` environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_value(&lookup, "FLEET_SYNC_BACKOFF_BASE_MS", &mut self.backoff.base_ms);
        override_value(&lookup, "FLEET_SYNC_BACKOFF_CAP_MS", &mut self.backoff.cap_ms);
        override_value(&lookup, "FLEET_SYNC_CIRCUIT_THRESHOLD", &mut self.backoff.circuit_threshold);
        override_value(
            &lookup,
            "FLEET_SYNC_CIRCUIT_COOLDOWN_SECS",
            &mut self.backoff.circuit_cooldown_secs,
        );

        override_value(
            &lookup,
            "FLEET_SYNC_STALENESS_WINDOW_SECS",
            &mut self.cache.staleness_window_secs,
        );
        override_value(&lookup, "FLEET_SYNC_CACHE_MAX_ENTRIES", &mut self.cache.max_entries);

        override_value(
            &lookup,
            "FLEET_SYNC_CONNECT_TIMEOUT_SECS",
            &mut self.session.connect_timeout_secs,
        );
        override_value(
            &lookup,
            "FLEET_SYNC_SILENCE_THRESHOLD_SECS",
            &mut self.session.silence_threshold_secs,
        );
        if let Some(v) = lookup("FLEET_SYNC_PING_INTERVAL_SECS") {
            match v.parse::<u64>() {
                Ok(0) => self.session.ping_interval_secs = None,
                Ok(n) => self.session.ping_interval_secs = Some(n),
                Err(_) => warn!(key = "FLEET_SYNC_PING_INTERVAL_SECS", value = %v, "Ignoring invalid override"),
            }
        }

        override_value(&lookup, "FLEET_SYNC_POLL_BASE_SECS", &mut self.poller.base_interval_secs);
        override_value(&lookup, "FLEET_SYNC_POLL_MAX_SECS", &mut self.poller.max_interval_secs);
        override_value(
            &lookup,
            "FLEET_SYNC_POLL_TIMEOUT_SECS",
            &mut self.poller.request_timeout_secs,
        );

        override_value(&lookup, "FLEET_SYNC_DIFF_INTERVAL_MS", &mut self.delta.min_interval_ms);
        override_value(
            &lookup,
            "FLEET_SYNC_SUPPRESSION_WINDOW_MS",
            &mut self.engine.suppression_window_ms,
        );
    }
}

fn override_value<T, F>(get: &F, key: &str, target: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = get(key) {
        match v.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key = key, value = %v, "Ignoring invalid override"),
        }
    }
}
