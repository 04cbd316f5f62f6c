//! Sync engine: wires the stream session, fallback poller, snapshot cache
//! and delta engine into one live view.
//!
//! ```text
//!   Transport ─▶ SessionHandle ─┐
//!                               ├─▶ EngineWorker ─▶ SnapshotCache.merge ─▶ DeltaEngine ─▶ broadcast<DiffResult>
//!   RestClient ─▶ FallbackPoller┘        ▲
//!                                        ├── connection state (starts/stops the poller)
//!                                        └── sweep tick (stale evictions become `removed`)
//! ```

use crate::cache::{KeyValueStore, SnapshotCache};
use crate::config::SyncConfig;
use crate::delta::{DeltaEngine, DeltaStats, DeviceFilter, DiffInput, DiffResult};
use crate::entity::EntityId;
use crate::poller::{FallbackPoller, PollerHandle};
use crate::session::{ConnectionState, SessionHandle};
use crate::transport::{RestClient, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod worker;


use worker::{stop_shared_poller, EngineWorker, SharedPoller, WorkerChannels};

/// Time allowed for the worker to exit after a dispose request
const DISPOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EngineCommand {
    Select(Vec<EntityId>),
    SetFilter(DeviceFilter),
    Remove(EntityId),
    Pause,
    Resume,
    Dispose,
}

/// Running sync core
pub struct SyncEngine {
    commands: mpsc::UnboundedSender<EngineCommand>,
    diffs: broadcast::Sender<DiffResult>,
    stats: watch::Receiver<DeltaStats>,
    session: SessionHandle,
    cache: Arc<SnapshotCache>,
    initial_diff: DiffResult,
    poller: SharedPoller,
    worker: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl SyncEngine {
    /// Hydrate the cache, compute the initial diff and connect the stream.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        rest: Arc<dyn RestClient>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let cache = Arc::new(SnapshotCache::new(config.cache.clone(), store));
        let hydrated = cache.load_all();

        let mut delta = DeltaEngine::new(&config.delta);
        let initial_diff = delta.diff_immediate(DiffInput {
            states: hydrated,
            ..DiffInput::default()
        });

        let (diff_tx, _) = broadcast::channel(config.engine.diff_channel_capacity.max(1));
        let (stats_tx, stats_rx) = watch::channel(delta.stats());
        let (message_tx, message_rx) = mpsc::channel(config.session.message_buffer.max(1));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let poller = SharedPoller::default();

        let session = SessionHandle::spawn(
            config.session.clone(),
            &config.backoff,
            transport,
            message_tx,
        );

        let worker = EngineWorker::new(
            config.engine.clone(),
            config.poller.request_timeout(),
            config.cache.sweep_interval(),
            Arc::clone(&cache),
            Arc::clone(&rest),
            delta,
            FallbackPoller::new(config.poller.clone(), rest),
            WorkerChannels {
                commands: command_rx,
                messages: message_rx,
                connection: session.subscribe(),
                diffs: diff_tx.clone(),
                stats: stats_tx,
                poller: Arc::clone(&poller),
            },
        );

        let worker = tokio::spawn(worker.run());
        session.connect();

        info!(
            entities = initial_diff.created.len(),
            "Sync engine started"
        );

        Self {
            commands: command_tx,
            diffs: diff_tx,
            stats: stats_rx,
            session,
            cache,
            initial_diff,
            poller,
            worker: Mutex::new(Some(worker)),
            disposed: AtomicBool::new(false),
        }
    }

    /// Diff computed from the hydrated cache, for the first paint
    pub fn initial_diff(&self) -> &DiffResult {
        &self.initial_diff
    }

    /// Receive every diff that changes something
    pub fn subscribe_diffs(&self) -> broadcast::Receiver<DiffResult> {
        self.diffs.subscribe()
    }

    /// Watch stream connection state
    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.session.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn cache(&self) -> Arc<SnapshotCache> {
        Arc::clone(&self.cache)
    }

    /// Running delta efficiency counters
    pub fn delta_stats(&self) -> DeltaStats {
        self.stats.borrow().clone()
    }

    /// True while the fallback poller is running
    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .map(|slot| slot.as_ref().map(PollerHandle::is_running).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Mark entities as selected; replaces the previous selection
    pub fn select(&self, ids: Vec<EntityId>) {
        self.send(EngineCommand::Select(ids));
    }

    pub fn set_filter(&self, filter: DeviceFilter) {
        self.send(EngineCommand::SetFilter(filter));
    }

    /// Drop an entity from the cache and the rendered view
    pub fn remove(&self, id: EntityId) {
        self.send(EngineCommand::Remove(id));
    }

    /// Close the stream and stop fallback polling
    pub fn pause(&self) {
        self.send(EngineCommand::Pause);
        self.session.pause();
    }

    pub fn resume(&self) {
        self.send(EngineCommand::Resume);
        self.session.resume();
    }

    /// Stop every task. Safe to call repeatedly.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!("Sync engine already disposed");
            return;
        }

        self.send(EngineCommand::Dispose);

        let worker = self.worker.lock().await.take();
        if let Some(mut worker) = worker {
            if tokio::time::timeout(DISPOSE_GRACE, &mut worker).await.is_err() {
                warn!("Sync engine worker did not stop in time, aborting");
                worker.abort();
            }
        }

        self.session.dispose().await;
        stop_shared_poller(&self.poller);
        info!("Sync engine disposed");
    }

    /// Number of live background tasks (worker, session, poller)
    pub async fn active_tasks(&self) -> usize {
        let worker_alive = self
            .worker
            .lock()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);

        let mut count = usize::from(worker_alive);
        if self.session.is_active().await {
            count += 1;
        }
        if self.is_polling() {
            count += 1;
        }
        count
    }

    fn send(&self, command: EngineCommand) {
        if self.commands.send(command).is_err() {
            debug!("Sync engine worker gone, command dropped");
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        // try_lock since Drop is sync
        if let Ok(mut worker) = self.worker.try_lock() {
            if let Some(handle) = worker.take() {
                handle.abort();
            }
        }
        stop_shared_poller(&self.poller);
    }
}
