// End-to-end tests of the sync engine through its public API: stream outage
// with fallback polling, restart from persisted snapshots, fatal errors.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use fleet_sync::{
    Connection, ConnectionStatus, DiffResult, EntityId, Frame, MemoryStore, RestClient,
    SyncConfig, SyncEngine, Transport, TransportError,
};
use futures::channel::mpsc as futures_mpsc;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};

// ── Mocks ────────────────────────────────────────────────────────────────────

enum Step {
    Open,
    Fail(TransportError),
}

/// Server side of an open mock connection. Dropping it ends the stream.
struct ServerEnd {
    inbound: futures_mpsc::UnboundedSender<Result<Frame, TransportError>>,
    _outbound: mpsc::Receiver<Frame>,
}

impl ServerEnd {
    fn send(&self, message: Value) {
        self.inbound
            .unbounded_send(Ok(Frame::Text(message.to_string())))
            .unwrap();
    }
}

/// Follows a script of connect outcomes; fails transiently once it runs out
struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    attempts: AtomicUsize,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self) -> Result<Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Open) => {
                let (in_tx, in_rx) = futures_mpsc::unbounded();
                let (out_tx, out_rx) = mpsc::channel(16);
                let _ = self.servers.send(ServerEnd {
                    inbound: in_tx,
                    _outbound: out_rx,
                });
                Ok(Connection::new(in_rx.boxed(), out_tx))
            }
            Some(Step::Fail(e)) => Err(e),
            None => Err(TransportError::Io("connection refused".to_string())),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Serves `/api/positions` responses in order, then empty lists
struct ScriptedRest {
    positions: Mutex<VecDeque<Result<Value, TransportError>>>,
    calls: AtomicUsize,
}

impl ScriptedRest {
    fn new(positions: Vec<Result<Value, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            positions: Mutex::new(positions.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RestClient for ScriptedRest {
    async fn get(&self, path: &str, _params: &[(String, String)]) -> Result<Value, TransportError> {
        match path {
            "/api/devices" => Ok(json!([])),
            "/api/positions" => {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.positions
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| Ok(json!([])))
            }
            other => Err(TransportError::from_status(404, other)),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

struct Fleet {
    engine: SyncEngine,
    transport: Arc<ScriptedTransport>,
    rest: Arc<ScriptedRest>,
    servers: mpsc::UnboundedReceiver<ServerEnd>,
    diffs: broadcast::Receiver<DiffResult>,
}

impl Fleet {
    fn start(script: Vec<Step>, rest: Arc<ScriptedRest>, store: Arc<MemoryStore>) -> Self {
        let (servers_tx, servers) = mpsc::unbounded_channel();
        let transport = Arc::new(ScriptedTransport {
            script: Mutex::new(script.into()),
            attempts: AtomicUsize::new(0),
            servers: servers_tx,
        });
        let engine = SyncEngine::start(
            SyncConfig::default(),
            transport.clone(),
            rest.clone(),
            store,
        );
        let diffs = engine.subscribe_diffs();
        Self {
            engine,
            transport,
            rest,
            servers,
            diffs,
        }
    }

    async fn next_server(&mut self) -> ServerEnd {
        timeout(Duration::from_secs(600), self.servers.recv())
            .await
            .expect("no connection opened")
            .expect("transport dropped")
    }

    async fn next_diff(&mut self) -> DiffResult {
        timeout(Duration::from_secs(600), self.diffs.recv())
            .await
            .expect("no diff published")
            .expect("diff channel closed")
    }

    async fn wait_for(&self, status: ConnectionStatus) {
        let mut rx = self.engine.connection();
        timeout(Duration::from_secs(600), rx.wait_for(|s| s.status == status))
            .await
            .expect("status not reached")
            .expect("session gone");
    }
}

fn position(id: EntityId, secs: i64, lat: f64) -> Value {
    json!({
        "deviceId": id,
        "fixTime": Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap().to_rfc3339(),
        "latitude": lat,
        "longitude": 8.54,
        "speed": 0.0,
        "course": 90.0
    })
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_outage_is_bridged_by_polling() {
    let rest = ScriptedRest::new(vec![Ok(json!([position(1, 120, 48.0)]))]);
    let mut fleet = Fleet::start(
        vec![
            Step::Open,
            Step::Fail(TransportError::Timeout),
            Step::Open,
        ],
        rest,
        Arc::new(MemoryStore::new()),
    );

    // Stream up and delivering
    let first = fleet.next_server().await;
    first.send(json!({ "positions": [position(1, 0, 47.0)] }));
    assert_eq!(fleet.next_diff().await.created, vec![1]);
    fleet.wait_for(ConnectionStatus::Connected).await;
    assert_eq!(fleet.rest.calls(), 0);

    // Past the suppression window, then the stream drops
    sleep(Duration::from_secs(10)).await;
    drop(first);
    fleet.wait_for(ConnectionStatus::Retrying).await;

    let diff = fleet.next_diff().await;
    assert_eq!(diff.modified, vec![1]);
    assert_eq!(fleet.engine.cache().get(1).unwrap().position.latitude, 48.0);
    assert!(fleet.rest.calls() >= 1);

    // Stream comes back and polling stops
    let second = fleet.next_server().await;
    second.send(json!({}));
    fleet.wait_for(ConnectionStatus::Connected).await;
    sleep(Duration::from_millis(10)).await;
    assert!(!fleet.engine.is_polling());
    assert_eq!(fleet.engine.connection_state().retry_count, 0);

    // Longer than one poll interval, shorter than the silence threshold
    let calls = fleet.rest.calls();
    sleep(Duration::from_secs(20)).await;
    assert_eq!(fleet.rest.calls(), calls);

    // Stream updates flow again
    second.send(json!({ "positions": [position(1, 240, 49.0)] }));
    assert_eq!(fleet.next_diff().await.modified, vec![1]);
    assert_eq!(fleet.engine.cache().get(1).unwrap().position.latitude, 49.0);

    fleet.engine.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_renders_persisted_snapshots() {
    let store = Arc::new(MemoryStore::new());

    let mut fleet = Fleet::start(vec![Step::Open], ScriptedRest::new(vec![]), store.clone());
    let server = fleet.next_server().await;
    server.send(json!({ "positions": [position(1, 0, 47.0), position(2, 0, 46.0)] }));
    assert_eq!(fleet.next_diff().await.created, vec![1, 2]);
    fleet.engine.dispose().await;
    drop(fleet);

    let fleet = Fleet::start(vec![], ScriptedRest::new(vec![]), store);
    assert_eq!(fleet.engine.initial_diff().created, vec![1, 2]);
    assert_eq!(fleet.engine.cache().len(), 2);
    fleet.engine.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credentials_stop_everything() {
    let rest = ScriptedRest::new(vec![Err(TransportError::Unauthorized("bad login".into()))]);
    let fleet = Fleet::start(
        vec![Step::Fail(TransportError::Unauthorized("bad login".into()))],
        rest,
        Arc::new(MemoryStore::new()),
    );

    fleet.wait_for(ConnectionStatus::Disconnected).await;
    sleep(Duration::from_secs(600)).await;

    let state = fleet.engine.connection_state();
    assert!(state.is_fatal());
    assert_eq!(fleet.transport.attempts.load(Ordering::SeqCst), 1);
    assert!(!fleet.engine.is_polling());
    assert!(fleet.rest.calls() <= 1);

    fleet.engine.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_dispose_leaves_nothing_running() {
    let mut fleet = Fleet::start(
        vec![Step::Open],
        ScriptedRest::new(vec![]),
        Arc::new(MemoryStore::new()),
    );
    let _server = fleet.next_server().await;
    assert!(fleet.engine.active_tasks().await >= 2);

    fleet.engine.dispose().await;
    fleet.engine.dispose().await;

    assert_eq!(fleet.engine.active_tasks().await, 0);
    assert_eq!(
        fleet.engine.connection_state().status,
        ConnectionStatus::Disconnected
    );
}
