use super::config::SessionConfig;
use super::state::{ConnectionState, ConnectionStatus};
use super::Command;
use crate::backoff::BackoffPolicy;
use crate::entity::{decode_message, StreamMessage};
use crate::error::{DecodeError, ErrorKind, Failure, TransportError};
use crate::transport::{Connection, Frame, Transport};
use chrono::Utc;
use futures::StreamExt;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where the worker is in the connection lifecycle
enum Phase {
    /// Not connected, not scheduled (initial, or after a fatal error)
    Idle,
    /// Explicitly suspended; retries disabled
    Paused,
    /// Waiting out a backoff delay
    Waiting { until: Instant },
    Connecting,
    Open(Link),
    Disposed,
}

/// An open transport connection
struct Link {
    id: Uuid,
    conn: Connection,
    opened_at: Instant,
    /// First valid message received
    confirmed: bool,
    last_inbound: Instant,
    last_payload_hash: Option<u64>,
    health: Interval,
    ping: Option<Interval>,
    pong_deadline: Option<Instant>,
}

enum LinkEvent {
    Frame(Option<Result<Frame, TransportError>>),
    HealthCheck,
    PingDue,
    PongOverdue,
    Command(Option<Command>),
}

/// Owns one logical stream connection plus its backoff state.
///
/// All state is mutated on this single task; commands arrive over a channel
/// and are processed in order, so a `connect` arriving during an attempt
/// is observed as a no-op rather than a second attempt.
pub(crate) struct SessionWorker {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    backoff: BackoffPolicy,
    commands: mpsc::UnboundedReceiver<Command>,
    output: mpsc::Sender<StreamMessage>,
    state_tx: watch::Sender<ConnectionState>,
    state: ConnectionState,
}

impl SessionWorker {
    pub(crate) fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        backoff: BackoffPolicy,
        commands: mpsc::UnboundedReceiver<Command>,
        output: mpsc::Sender<StreamMessage>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            config,
            transport,
            backoff,
            commands,
            output,
            state_tx,
            state: ConnectionState::default(),
        }
    }

    pub(crate) async fn run(mut self) {
        info!(transport = %self.transport.name(), "Stream session worker started");

        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => self.idle(Phase::Idle).await,
                Phase::Paused => self.idle(Phase::Paused).await,
                Phase::Waiting { until } => self.wait_for_retry(until).await,
                Phase::Connecting => self.connect().await,
                Phase::Open(link) => self.drive(link).await,
                Phase::Disposed => break,
            };
        }

        self.state.status = ConnectionStatus::Disconnected;
        self.publish();
        info!("Stream session worker stopped");
    }

    async fn idle(&mut self, current: Phase) -> Phase {
        match self.commands.recv().await {
            Some(cmd) => self.on_command(cmd, current),
            None => Phase::Disposed,
        }
    }

    async fn wait_for_retry(&mut self, until: Instant) -> Phase {
        tokio::select! {
            _ = sleep_until(until) => self.begin_connecting(),
            cmd = self.commands.recv() => match cmd {
                Some(cmd) => self.on_command(cmd, Phase::Waiting { until }),
                None => Phase::Disposed,
            },
        }
    }

    fn on_command(&mut self, cmd: Command, current: Phase) -> Phase {
        match (cmd, current) {
            (Command::Connect, current @ Phase::Waiting { .. }) if self.backoff.is_circuit_open() => {
                debug!("Connect ignored, circuit open until cooldown elapses");
                current
            }
            (Command::Connect, Phase::Idle) | (Command::Connect, Phase::Waiting { .. }) => {
                self.begin_connecting()
            }
            (Command::Connect, Phase::Paused) => {
                debug!("Connect ignored while paused");
                Phase::Paused
            }
            (Command::Connect, current) => {
                debug!("Connect ignored, attempt already in flight");
                current
            }
            (Command::Pause, current) => {
                if let Phase::Open(link) = current {
                    close_link(link);
                }
                info!("Stream session paused");
                self.state.status = ConnectionStatus::Disconnected;
                self.publish();
                Phase::Paused
            }
            (Command::Resume, current @ Phase::Open(_)) | (Command::Resume, current @ Phase::Connecting) => {
                current
            }
            (Command::Resume, _) => {
                info!("Stream session resumed");
                self.backoff.reset();
                self.state.retry_count = 0;
                self.state.circuit_open = false;
                self.begin_connecting()
            }
            (Command::Dispose, current) => {
                if let Phase::Open(link) = current {
                    close_link(link);
                }
                Phase::Disposed
            }
        }
    }

    fn begin_connecting(&mut self) -> Phase {
        self.state.status = ConnectionStatus::Connecting;
        self.state.circuit_open = self.backoff.is_circuit_open();
        self.publish();
        Phase::Connecting
    }

    async fn connect(&mut self) -> Phase {
        let attempt_id = Uuid::now_v7();
        let transport = Arc::clone(&self.transport);

        info!(
            attempt = %attempt_id,
            retry_count = self.state.retry_count,
            "Opening stream connection"
        );

        let connecting = timeout(self.config.connect_timeout(), transport.connect());
        tokio::pin!(connecting);

        let result = loop {
            tokio::select! {
                result = &mut connecting => break result,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect) | Some(Command::Resume) => {
                        debug!(attempt = %attempt_id, "Connect ignored, attempt already in flight");
                    }
                    Some(cmd) => return self.on_command(cmd, Phase::Connecting),
                    None => return Phase::Disposed,
                },
            }
        };

        match result {
            Ok(Ok(conn)) => {
                debug!(attempt = %attempt_id, "Transport open, awaiting first valid message");
                Phase::Open(self.open_link(attempt_id, conn))
            }
            Ok(Err(e)) => self.fail(&e),
            Err(_) => self.fail(&TransportError::Timeout),
        }
    }

    fn open_link(&self, id: Uuid, conn: Connection) -> Link {
        let now = Instant::now();
        let period = self.config.health_check_interval();
        let mut health = interval_at(now + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let ping = self.config.ping_interval().map(|period| {
            let mut ping = interval_at(now + period, period);
            ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ping
        });

        Link {
            id,
            conn,
            opened_at: now,
            confirmed: false,
            last_inbound: now,
            last_payload_hash: None,
            health,
            ping,
            pong_deadline: None,
        }
    }

    async fn drive(&mut self, mut link: Link) -> Phase {
        let event = tokio::select! {
            frame = link.conn.inbound.next() => LinkEvent::Frame(frame),
            _ = link.health.tick() => LinkEvent::HealthCheck,
            _ = tick_optional(link.ping.as_mut()) => LinkEvent::PingDue,
            _ = sleep_optional(link.pong_deadline) => LinkEvent::PongOverdue,
            cmd = self.commands.recv() => LinkEvent::Command(cmd),
        };

        match event {
            LinkEvent::Frame(Some(Ok(frame))) => self.on_frame(link, frame).await,
            LinkEvent::Frame(Some(Err(e))) => self.fail(&e),
            LinkEvent::Frame(None) => self.fail(&TransportError::Closed(None)),
            LinkEvent::HealthCheck => self.check_health(link),
            LinkEvent::PingDue => self.send_ping(link),
            LinkEvent::PongOverdue => {
                warn!(attempt = %link.id, "Pong not received in time");
                close_link(link);
                self.fail(&TransportError::Timeout)
            }
            LinkEvent::Command(Some(cmd)) => self.on_command(cmd, Phase::Open(link)),
            LinkEvent::Command(None) => {
                close_link(link);
                Phase::Disposed
            }
        }
    }

    async fn on_frame(&mut self, mut link: Link, frame: Frame) -> Phase {
        link.last_inbound = Instant::now();

        match frame {
            Frame::Text(text) => {
                let hash = content_hash(&text);
                if link.last_payload_hash == Some(hash) {
                    debug!(attempt = %link.id, "Duplicate payload dropped");
                    return Phase::Open(link);
                }
                link.last_payload_hash = Some(hash);

                match self.decode(text).await {
                    Ok(message) => {
                        if !link.confirmed {
                            self.confirm(&mut link);
                        } else {
                            self.state.last_event_at = Some(Utc::now());
                            self.publish_quietly();
                        }
                        if !message.is_empty() && self.output.send(message).await.is_err() {
                            debug!("Message consumer dropped, discarding stream message");
                        }
                    }
                    Err(e) => {
                        warn!(attempt = %link.id, error = %e, "Dropping malformed stream payload");
                    }
                }
            }
            Frame::Binary(_) => {
                let err = DecodeError::Binary;
                warn!(attempt = %link.id, error = %err, "Dropping malformed stream payload");
            }
            Frame::Ping(data) => {
                if link.conn.outbound.try_send(Frame::Pong(data)).is_err() {
                    warn!(attempt = %link.id, "Failed to send pong");
                }
            }
            Frame::Pong(_) => {
                link.pong_deadline = None;
            }
            Frame::Close => {
                info!(attempt = %link.id, "Stream closed by server");
                return self.fail(&TransportError::Closed(Some("closed by server".to_string())));
            }
        }

        Phase::Open(link)
    }

    async fn decode(&self, text: String) -> Result<StreamMessage, DecodeError> {
        if text.len() < self.config.offload_threshold_bytes {
            return decode_message(&text);
        }

        debug!(bytes = text.len(), "Decoding large payload on blocking pool");
        match tokio::task::spawn_blocking(move || decode_message(&text)).await {
            Ok(result) => result,
            Err(e) => Err(DecodeError::InvalidJson(format!("decode task failed: {}", e))),
        }
    }

    fn confirm(&mut self, link: &mut Link) {
        link.confirmed = true;
        self.backoff.reset();

        let now = Utc::now();
        self.state.status = ConnectionStatus::Connected;
        self.state.retry_count = 0;
        self.state.circuit_open = false;
        self.state.last_connected_at = Some(now);
        self.state.last_event_at = Some(now);
        self.publish();

        info!(
            attempt = %link.id,
            handshake_ms = link.opened_at.elapsed().as_millis() as u64,
            "Stream connection confirmed"
        );
    }

    fn check_health(&mut self, link: Link) -> Phase {
        let threshold = self.config.silence_threshold();
        let silence = link.last_inbound.elapsed();

        if !link.confirmed && link.opened_at.elapsed() > threshold {
            warn!(attempt = %link.id, "No valid message since connect, reconnecting");
            close_link(link);
            return self.fail(&TransportError::Timeout);
        }

        if silence > threshold {
            warn!(
                attempt = %link.id,
                silence_secs = silence.as_secs(),
                "Stream silent too long, reconnecting"
            );
            close_link(link);
            return self.fail(&TransportError::Timeout);
        }

        Phase::Open(link)
    }

    fn send_ping(&mut self, mut link: Link) -> Phase {
        if link.pong_deadline.is_some() {
            return Phase::Open(link);
        }

        if link.conn.outbound.try_send(Frame::Ping(b"keepalive".to_vec())).is_err() {
            warn!(attempt = %link.id, "Failed to send keep-alive ping");
            return self.fail(&TransportError::Closed(Some("outbound channel closed".to_string())));
        }

        link.pong_deadline = Some(Instant::now() + self.config.pong_timeout());
        Phase::Open(link)
    }

    /// Shared failure path for every non-fatal transport problem
    fn fail(&mut self, err: &TransportError) -> Phase {
        if err.is_fatal() {
            error!(error = %err, "Stream connection rejected, not retrying");
            self.state.status = ConnectionStatus::Disconnected;
            self.state.circuit_open = false;
            self.state.last_error = Some(Failure::from(err));
            self.publish();
            return Phase::Idle;
        }

        let delay = self.backoff.next_delay();
        // Restarts from 1 once a cooldown has closed the circuit
        self.state.retry_count = self.backoff.attempt();
        let circuit_open = self.backoff.is_circuit_open();

        self.state.circuit_open = circuit_open;
        if circuit_open {
            self.state.status = ConnectionStatus::Disconnected;
            self.state.last_error = Some(Failure::new(
                ErrorKind::PersistentFailure,
                format!(
                    "{} consecutive failures, last: {}",
                    self.state.retry_count, err
                ),
            ));
        } else {
            self.state.status = ConnectionStatus::Retrying;
            self.state.last_error = Some(Failure::from(err));
        }
        self.publish();

        warn!(
            error = %err,
            retry_count = self.state.retry_count,
            delay_ms = delay.as_millis() as u64,
            circuit_open = circuit_open,
            "Stream connection failed, scheduling retry"
        );

        Phase::Waiting {
            until: Instant::now() + delay,
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    /// Update the shared state without waking subscribers
    fn publish_quietly(&self) {
        let state = self.state.clone();
        self.state_tx.send_if_modified(move |current| {
            *current = state;
            false
        });
    }
}

fn close_link(link: Link) {
    // Best effort: the peer may already be gone
    let _ = link.conn.outbound.try_send(Frame::Close);
    debug!(attempt = %link.id, "Stream link closed");
}

fn content_hash(payload: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    hasher.finish()
}

async fn tick_optional(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn sleep_optional(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
