//! REST fallback poller.
//!
//! Runs only while the push stream is down. Each cycle fetches the latest
//! positions, keeps the ones newer than what this poller has already seen
//! and emits them as one batch. The poller stops itself as soon as the
//! stream reports online again.

use crate::entity::{EntityId, EntitySnapshot, Position};
use crate::transport::RestClient;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

mod cadence;
pub mod config;


pub use cadence::AdaptiveInterval;
pub use config::PollerConfig;

/// Batch of fresh snapshots from one poll
pub type PollBatch = Vec<EntitySnapshot>;

/// Starts fallback poll loops against a REST client
#[derive(Clone)]
pub struct FallbackPoller {
    config: PollerConfig,
    rest: Arc<dyn RestClient>,
}

impl FallbackPoller {
    pub fn new(config: PollerConfig, rest: Arc<dyn RestClient>) -> Self {
        Self { config, rest }
    }

    /// Start polling `ids` (all devices when empty).
    ///
    /// `is_stream_online` is checked before each cycle and again before a
    /// batch is emitted; once it returns true the poller stops.
    pub fn start<F>(
        &self,
        ids: Vec<EntityId>,
        is_stream_online: F,
        output: mpsc::Sender<PollBatch>,
    ) -> PollerHandle
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let poll_loop = PollLoop {
            config: self.config.clone(),
            rest: Arc::clone(&self.rest),
            params: ids
                .iter()
                .map(|id| ("deviceId".to_string(), id.to_string()))
                .collect(),
            cadence: AdaptiveInterval::new(&self.config),
            last_seen: HashMap::new(),
            output,
        };

        info!(entities = ids.len(), "Starting fallback poller");
        let task = tokio::spawn(poll_loop.run(is_stream_online));

        PollerHandle { task: Some(task) }
    }
}

/// Handle to a running poll loop. Dropping it stops the loop.
pub struct PollerHandle {
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Stop the poll loop. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                debug!("Stopping fallback poller");
            }
            task.abort();
        }
    }

    /// True while the loop is still polling
    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Why a poll cycle ended the loop
enum Outcome {
    Continue { new_data: bool },
    Stop,
}

struct PollLoop {
    config: PollerConfig,
    rest: Arc<dyn RestClient>,
    params: Vec<(String, String)>,
    cadence: AdaptiveInterval,
    /// Newest fix time seen per entity
    last_seen: HashMap<EntityId, DateTime<Utc>>,
    output: mpsc::Sender<PollBatch>,
}

impl PollLoop {
    async fn run<F>(mut self, is_stream_online: F)
    where
        F: Fn() -> bool,
    {
        loop {
            if is_stream_online() {
                info!("Stream back online, stopping fallback poller");
                break;
            }

            match self.poll_once(&is_stream_online).await {
                Outcome::Continue { new_data } => self.cadence.record(new_data),
                Outcome::Stop => break,
            }

            let delay = self.cadence.next_sleep();
            debug!(
                interval_ms = self.cadence.current().as_millis() as u64,
                delay_ms = delay.as_millis() as u64,
                "Next fallback poll scheduled"
            );
            sleep(delay).await;
        }
    }

    async fn poll_once<F>(&mut self, is_stream_online: &F) -> Outcome
    where
        F: Fn() -> bool,
    {
        let request = self.rest.get(&self.config.positions_path, &self.params);
        let body = match timeout(self.config.request_timeout(), request).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) if e.is_fatal() => {
                error!(error = %e, "Fallback poll rejected, stopping poller");
                return Outcome::Stop;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Fallback poll failed");
                return Outcome::Continue { new_data: false };
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.request_timeout().as_secs(),
                    "Fallback poll timed out"
                );
                return Outcome::Continue { new_data: false };
            }
        };

        let positions = match decode_positions(body) {
            Ok(positions) => positions,
            Err(e) => {
                warn!(error = %e, "Dropping malformed fallback poll response");
                return Outcome::Continue { new_data: false };
            }
        };

        let batch = self.fresh(positions);
        if batch.is_empty() {
            debug!("Fallback poll returned no new data");
            return Outcome::Continue { new_data: false };
        }

        if is_stream_online() {
            info!("Stream came back during poll, discarding batch");
            return Outcome::Stop;
        }

        debug!(entities = batch.len(), "Fallback poll returned new data");
        if self.output.send(batch).await.is_err() {
            debug!("Poll batch consumer dropped, stopping poller");
            return Outcome::Stop;
        }

        Outcome::Continue { new_data: true }
    }

    /// Keep positions newer than the last one seen for their entity
    fn fresh(&mut self, positions: Vec<Position>) -> PollBatch {
        let mut latest: HashMap<EntityId, Position> = HashMap::new();
        for position in positions {
            let newer = latest
                .get(&position.device_id)
                .map(|current| position.fix_time > current.fix_time)
                .unwrap_or(true);
            if newer {
                latest.insert(position.device_id, position);
            }
        }

        let mut batch = Vec::new();
        for (id, position) in latest {
            let is_new = self
                .last_seen
                .get(&id)
                .map(|seen| position.fix_time > *seen)
                .unwrap_or(true);
            if is_new {
                self.last_seen.insert(id, position.fix_time);
                batch.push(EntitySnapshot::from_position(position));
            }
        }
        batch
    }
}

fn decode_positions(body: Value) -> Result<Vec<Position>, serde_json::Error> {
    Vec::<Position>::deserialize(body)
}
