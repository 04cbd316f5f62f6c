//! Stream session manager.
//!
//! One worker task owns the transport connection, the backoff policy and
//! every timer (retry delay, health check, ping). [`SessionHandle`] is the
//! only way to talk to it:
//!
//! ```text
//!   SessionHandle ──commands──▶ SessionWorker ──StreamMessage──▶ consumer
//!        ▲                           │
//!        └──── watch<ConnectionState>┘
//! ```

use crate::backoff::{BackoffConfig, BackoffPolicy};
use crate::entity::StreamMessage;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod config;
pub mod state;
mod worker;


pub use config::SessionConfig;
pub use state::{ConnectionState, ConnectionStatus};

use worker::SessionWorker;

/// Time allowed for the worker to exit after a dispose request
const DISPOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Connect,
    Pause,
    Resume,
    Dispose,
}

/// Handle to a running stream session
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    /// Spawn the session worker. No connection is made until [`connect`](Self::connect).
    ///
    /// Decoded, non-empty messages are delivered on `output`.
    pub fn spawn(
        config: SessionConfig,
        backoff: &BackoffConfig,
        transport: Arc<dyn Transport>,
        output: mpsc::Sender<StreamMessage>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());

        let worker = SessionWorker::new(
            config,
            transport,
            BackoffPolicy::new(backoff),
            command_rx,
            output,
            state_tx,
        );
        let handle = tokio::spawn(worker.run());

        Self {
            commands: command_tx,
            state: state_rx,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Open the stream. No-op while an attempt is in flight or a link is open.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Close the link and stop scheduling retries
    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    /// Reset the retry count and connect immediately
    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    /// Stop the worker and release the connection. Safe to call repeatedly.
    pub async fn dispose(&self) {
        let handle = self.worker.lock().await.take();
        let Some(mut handle) = handle else {
            debug!("Session already disposed");
            return;
        };

        self.send(Command::Dispose);
        match tokio::time::timeout(DISPOSE_GRACE, &mut handle).await {
            Ok(_) => info!("Stream session disposed"),
            Err(_) => {
                warn!("Session worker did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch connection state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// True while the worker task is alive
    pub async fn is_active(&self) -> bool {
        match self.worker.lock().await.as_ref() {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(command = ?command, "Session worker gone, command dropped");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        // try_lock since Drop is sync
        if let Ok(mut worker) = self.worker.try_lock() {
            if let Some(handle) = worker.take() {
                handle.abort();
            }
        }
    }
}
