use super::EngineCommand;
use crate::cache::SnapshotCache;
use crate::config::EngineConfig;
use crate::delta::{DeltaEngine, DeltaStats, DeviceFilter, DiffInput, DiffResult};
use crate::entity::{Device, EntityId, EntitySnapshot, StreamMessage};
use crate::poller::{FallbackPoller, PollBatch, PollerHandle};
use crate::session::{ConnectionState, ConnectionStatus};
use crate::transport::RestClient;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Poll results are ignored for a short time after the stream (re)connects
#[derive(Debug, Clone)]
pub(crate) struct SuppressionWindow {
    window: Duration,
    armed_at: Option<Instant>,
}

impl SuppressionWindow {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            armed_at: None,
        }
    }

    pub(crate) fn arm(&mut self, now: Instant) {
        self.armed_at = Some(now);
    }

    pub(crate) fn is_active(&self, now: Instant) -> bool {
        match self.armed_at {
            Some(at) => now < at + self.window,
            None => false,
        }
    }
}

/// Running poll loop, shared so the engine can report whether it is polling
pub(crate) type SharedPoller = Arc<Mutex<Option<PollerHandle>>>;

/// Channels and shared state handed to the worker at spawn time
pub(crate) struct WorkerChannels {
    pub(crate) commands: mpsc::UnboundedReceiver<EngineCommand>,
    pub(crate) messages: mpsc::Receiver<StreamMessage>,
    pub(crate) connection: watch::Receiver<ConnectionState>,
    pub(crate) diffs: broadcast::Sender<DiffResult>,
    pub(crate) stats: watch::Sender<DeltaStats>,
    pub(crate) poller: SharedPoller,
}

/// Single task applying stream and poll data to the cache and differ
pub(crate) struct EngineWorker {
    config: EngineConfig,
    request_timeout: Duration,
    sweep_interval: Duration,
    cache: Arc<SnapshotCache>,
    rest: Arc<dyn RestClient>,
    delta: DeltaEngine,

    devices: HashMap<EntityId, Device>,
    selection: HashSet<EntityId>,
    filter: DeviceFilter,

    poller: FallbackPoller,
    batch_tx: mpsc::Sender<PollBatch>,
    batch_rx: mpsc::Receiver<PollBatch>,

    stream_online: Arc<AtomicBool>,
    suppression: SuppressionWindow,
    paused: bool,

    channels: WorkerChannels,
}

impl EngineWorker {
    pub(crate) fn new(
        config: EngineConfig,
        request_timeout: Duration,
        sweep_interval: Duration,
        cache: Arc<SnapshotCache>,
        rest: Arc<dyn RestClient>,
        delta: DeltaEngine,
        poller: FallbackPoller,
        channels: WorkerChannels,
    ) -> Self {
        let (batch_tx, batch_rx) = mpsc::channel(config.poll_batch_buffer.max(1));
        let suppression = SuppressionWindow::new(config.suppression_window());

        Self {
            config,
            request_timeout,
            sweep_interval,
            cache,
            rest,
            delta,
            devices: HashMap::new(),
            selection: HashSet::new(),
            filter: DeviceFilter::default(),
            poller,
            batch_tx,
            batch_rx,
            stream_online: Arc::new(AtomicBool::new(false)),
            suppression,
            paused: false,
            channels,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("Sync engine worker started");
        self.load_devices().await;

        let mut sweep = interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(message) = self.channels.messages.recv() => self.on_stream_message(message),
                Some(batch) = self.batch_rx.recv() => self.on_poll_batch(batch),
                Ok(()) = self.channels.connection.changed() => self.on_connection_change(),
                _ = sweep.tick() => self.on_sweep(),
                _ = flush_at(self.delta.next_flush_at()) => {
                    if let Some(result) = self.delta.flush() {
                        self.publish(result);
                    }
                }
                cmd = self.channels.commands.recv() => match cmd {
                    Some(EngineCommand::Dispose) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
            }
        }

        self.stop_poller();
        info!("Sync engine worker stopped");
    }

    /// Fetch device records once so filters and status apply from the start
    async fn load_devices(&mut self) {
        let request = self.rest.get(&self.config.devices_path, &[]);
        let devices = match timeout(self.request_timeout, request).await {
            Ok(Ok(body)) => match Vec::<Device>::deserialize(body) {
                Ok(devices) => devices,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed device list");
                    return;
                }
            },
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to load devices");
                return;
            }
            Err(_) => {
                warn!("Loading devices timed out");
                return;
            }
        };

        info!(devices = devices.len(), "Loaded device list");
        if self.apply_devices(devices) {
            self.request_diff();
        }
    }

    fn on_stream_message(&mut self, message: StreamMessage) {
        let mut changed = self.apply_devices(message.devices);

        for position in message.positions {
            let entity_id = position.device_id;
            if self.cache.merge(EntitySnapshot::from_position(position)) {
                changed = true;
            } else {
                debug!(entity_id = entity_id, "Ignoring out-of-date stream position");
            }
        }

        if !message.events.is_empty() {
            debug!(events = message.events.len(), "Received device events");
        }

        if changed {
            self.request_diff();
        }
    }

    fn on_poll_batch(&mut self, batch: PollBatch) {
        let now = Instant::now();
        if self.stream_online.load(Ordering::SeqCst) || self.suppression.is_active(now) {
            debug!(entities = batch.len(), "Stream recently online, dropping poll batch");
            return;
        }

        let mut changed = false;
        for snapshot in batch {
            changed |= self.cache.merge(snapshot);
        }

        if changed {
            self.request_diff();
        }
    }

    fn on_connection_change(&mut self) {
        let state = self.channels.connection.borrow_and_update().clone();

        if state.is_connected() {
            if !self.stream_online.swap(true, Ordering::SeqCst) {
                info!("Stream online, fallback polling suppressed");
                self.suppression.arm(Instant::now());
                self.stop_poller();
            }
            return;
        }

        self.stream_online.store(false, Ordering::SeqCst);
        match state.status {
            ConnectionStatus::Retrying | ConnectionStatus::Disconnected if !self.paused => {
                self.start_poller();
            }
            _ => {}
        }
    }

    /// Evicted entities leave the view on the next diff
    fn on_sweep(&mut self) {
        if self.cache.sweep() > 0 {
            self.request_diff();
        }
    }

    fn on_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Select(ids) => {
                self.selection = ids.into_iter().collect();
                self.request_diff();
            }
            EngineCommand::SetFilter(filter) => {
                self.filter = filter;
                self.request_diff();
            }
            EngineCommand::Remove(id) => {
                self.cache.remove(id);
                self.devices.remove(&id);
                self.selection.remove(&id);
                info!(entity_id = id, "Entity removed");
                self.request_diff();
            }
            EngineCommand::Pause => {
                self.paused = true;
                self.stop_poller();
            }
            EngineCommand::Resume => {
                self.paused = false;
            }
            EngineCommand::Dispose => {}
        }
    }

    /// Returns true if any device record changed
    fn apply_devices(&mut self, devices: Vec<Device>) -> bool {
        let mut changed = false;
        for device in devices {
            if self.devices.get(&device.id) != Some(&device) {
                self.devices.insert(device.id, device);
                changed = true;
            }
        }
        changed
    }

    fn start_poller(&mut self) {
        let Ok(mut slot) = self.channels.poller.lock() else {
            warn!("Poller slot poisoned, fallback polling unavailable");
            return;
        };
        if slot.as_ref().map(PollerHandle::is_running).unwrap_or(false) {
            return;
        }

        let ids: BTreeSet<EntityId> = self
            .cache
            .ids()
            .into_iter()
            .chain(self.devices.keys().copied())
            .collect();

        let online = Arc::clone(&self.stream_online);
        let handle = self.poller.start(
            ids.into_iter().collect(),
            move || online.load(Ordering::SeqCst),
            self.batch_tx.clone(),
        );
        *slot = Some(handle);
    }

    fn stop_poller(&mut self) {
        stop_shared_poller(&self.channels.poller);
    }

    fn request_diff(&mut self) {
        let input = DiffInput {
            states: self.cache.fresh_entries(),
            devices: self.devices.clone(),
            selection: self.selection.clone(),
            filter: self.filter.clone(),
        };

        if let Some(result) = self.delta.diff(input) {
            self.publish(result);
        }
    }

    fn publish(&mut self, result: DiffResult) {
        self.channels.stats.send_replace(self.delta.stats());

        if result.is_unchanged() {
            debug!(reused = result.reused.len(), "Diff unchanged, not publishing");
            return;
        }
        // No subscribers is fine
        let _ = self.channels.diffs.send(result);
    }
}

/// Stop and clear the poller in `slot`, if any
pub(crate) fn stop_shared_poller(slot: &SharedPoller) {
    if let Ok(mut slot) = slot.lock() {
        if let Some(mut handle) = slot.take() {
            handle.stop();
        }
    }
}

async fn flush_at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
