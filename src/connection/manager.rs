//! Connection manager with a persistent operator link and automatic reconnection
//!
//! Owns the transport socket, the ordered in-memory outbound queue and the
//! inbound handler registry. Messages sent while the link is down stay
//! queued and flush in FIFO order on the next successful connect.

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use outpost_proto::{
    codec::{self, FrameDecoder},
    Envelope, Heartbeat, MessageType, Register,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{interval_at, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use super::Backoff;
use crate::config::{ConnectionConfig, IdentityConfig};
use crate::telemetry::MetricsSource;

/// Link lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal; only entered on explicit shutdown
    Closing,
}

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Successfully connected and registered with the operator
    Connected,
    /// Link lost; the manager is backing off and will retry
    Disconnected { reason: String },
    /// Gave up after the configured maximum attempts
    ConnectionFailed { reason: String },
}

/// Inbound message handler. Runs on its own task; must not assume it can
/// block the transport loop.
pub type Handler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Cloneable handle for enqueueing outbound messages
///
/// Delivery is at-least-once and ordered relative to other queued sends,
/// but the queue is in-memory only and does not survive a process restart.
#[derive(Clone)]
pub struct Outbound {
    agent_id: Arc<str>,
    sequence: Arc<AtomicU64>,
    tx: mpsc::Sender<Envelope>,
}

impl Outbound {
    pub fn new(agent_id: &str, tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            agent_id: agent_id.into(),
            sequence: Arc::new(AtomicU64::new(0)),
            tx,
        }
    }

    /// Next correlation token: `<agent_id>-<sequence>`
    pub fn next_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", self.agent_id, seq)
    }

    /// Enqueue a message for transmission
    pub async fn send(&self, msg_type: MessageType, payload: serde_json::Value) -> Result<()> {
        let envelope = Envelope::new(msg_type, self.next_id(), payload);
        self.tx
            .send(envelope)
            .await
            .map_err(|_| anyhow!("connection closed"))
    }

    /// Enqueue a typed payload
    pub async fn send_json<T: serde::Serialize>(&self, msg_type: MessageType, payload: &T) -> Result<()> {
        self.send(msg_type, serde_json::to_value(payload)?).await
    }
}

/// Manages the persistent operator connection
pub struct ConnectionManager {
    outbound: Outbound,
    event_rx: mpsc::Receiver<ConnectionEvent>,
    handlers: Arc<RwLock<HashMap<MessageType, Handler>>>,
    state: Arc<RwLock<LinkState>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionManager {
    /// Create a new connection manager and start the connection loop
    pub fn new(
        identity: IdentityConfig,
        config: ConnectionConfig,
        metrics: Arc<dyn MetricsSource>,
        in_flight: Arc<AtomicU32>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(100);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(100);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let outbound = Outbound::new(&identity.agent_id, outbound_tx);
        let handlers: Arc<RwLock<HashMap<MessageType, Handler>>> = Arc::new(RwLock::new(HashMap::new()));
        let state = Arc::new(RwLock::new(LinkState::Disconnected));

        let loop_ctx = LoopContext {
            identity,
            config,
            outbound: outbound.clone(),
            handlers: handlers.clone(),
            state: state.clone(),
            metrics,
            in_flight,
            event_tx,
            shutdown_rx,
        };
        tokio::spawn(async move {
            connection_loop(loop_ctx, outbound_rx).await;
        });

        Self {
            outbound,
            event_rx,
            handlers,
            state,
            shutdown_tx,
        }
    }

    /// Enqueue a message; transmitted immediately when connected, otherwise
    /// held in the outbound queue for flush on reconnect
    pub async fn send(&self, msg_type: MessageType, payload: serde_json::Value) -> Result<()> {
        self.outbound.send(msg_type, payload).await
    }

    /// Register the handler for a message type. Exactly one handler per
    /// type; a second registration replaces the first.
    pub async fn on<F>(&self, msg_type: MessageType, handler: F)
    where
        F: Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.handlers.write().await.insert(msg_type, Arc::new(handler));
    }

    /// Get a cloneable outbound handle for other subsystems
    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Current link state
    pub async fn state(&self) -> LinkState {
        *self.state.read().await
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    /// Request shutdown: the link transitions to Closing, flushes no
    /// further messages and releases the transport
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct LoopContext {
    identity: IdentityConfig,
    config: ConnectionConfig,
    outbound: Outbound,
    handlers: Arc<RwLock<HashMap<MessageType, Handler>>>,
    state: Arc<RwLock<LinkState>>,
    metrics: Arc<dyn MetricsSource>,
    in_flight: Arc<AtomicU32>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl LoopContext {
    async fn set_state(&self, state: LinkState) {
        *self.state.write().await = state;
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

/// Main connection loop with reconnection logic
async fn connection_loop(mut ctx: LoopContext, mut outbound_rx: mpsc::Receiver<Envelope>) {
    let mut queue: VecDeque<Envelope> = VecDeque::new();
    let mut backoff = Backoff::new(ctx.config.reconnect_base(), ctx.config.reconnect_cap());
    let mut attempts: u32 = 0;
    let started = Instant::now();

    loop {
        if ctx.shutting_down() {
            break;
        }

        ctx.set_state(LinkState::Connecting).await;

        match timeout(ctx.config.connect_timeout(), TcpStream::connect(&ctx.config.operator_addr)).await {
            Ok(Ok(stream)) => {
                backoff.reset();
                attempts = 0;

                ctx.set_state(LinkState::Connected).await;
                let _ = ctx.event_tx.send(ConnectionEvent::Connected).await;
                info!("Connected to operator at {}", ctx.config.operator_addr);

                let result = handle_connection(&ctx, stream, &mut outbound_rx, &mut queue, started).await;

                if ctx.shutting_down() {
                    break;
                }

                let reason = match result {
                    Ok(()) => "link closed".to_string(),
                    Err(e) => e.to_string(),
                };
                warn!("Disconnected: {}", reason);
                ctx.set_state(LinkState::Reconnecting).await;
                let _ = ctx.event_tx.send(ConnectionEvent::Disconnected { reason }).await;
            }
            Ok(Err(e)) => {
                attempts += 1;
                debug!("Connect attempt {} failed: {}", attempts, e);
                ctx.set_state(LinkState::Reconnecting).await;
            }
            Err(_) => {
                attempts += 1;
                debug!("Connect attempt {} timed out", attempts);
                ctx.set_state(LinkState::Reconnecting).await;
            }
        }

        if ctx.config.max_attempts > 0 && attempts >= ctx.config.max_attempts {
            let reason = format!("giving up after {} connect attempts", attempts);
            warn!("{}", reason);
            ctx.set_state(LinkState::Disconnected).await;
            let _ = ctx.event_tx.send(ConnectionEvent::ConnectionFailed { reason }).await;
            return;
        }

        // Wait before reconnecting; sends arriving meanwhile join the queue
        let delay = backoff.next_delay();
        if !wait_for_retry(delay, &mut outbound_rx, &mut queue, &mut ctx.shutdown_rx).await {
            break;
        }
    }

    ctx.set_state(LinkState::Closing).await;
    info!("Connection manager closed");
}

/// Sleep out the backoff delay while still accepting outbound messages
/// into the queue. Returns false when shutdown was requested or all
/// senders are gone.
async fn wait_for_retry(
    delay: std::time::Duration,
    outbound_rx: &mut mpsc::Receiver<Envelope>,
    queue: &mut VecDeque<Envelope>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => return true,
            _ = shutdown_rx.changed() => return false,
            maybe = outbound_rx.recv() => match maybe {
                Some(envelope) => queue.push_back(envelope),
                None => return false,
            },
        }
    }
}

/// Handle an active connection until it fails or shutdown is requested
async fn handle_connection(
    ctx: &LoopContext,
    stream: TcpStream,
    outbound_rx: &mut mpsc::Receiver<Envelope>,
    queue: &mut VecDeque<Envelope>,
    started: Instant,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 4096];
    let mut shutdown_rx = ctx.shutdown_rx.clone();

    // Registration goes out before anything queued
    let register = Register {
        agent_id: ctx.identity.agent_id.clone(),
        hostname: hostname(),
        capabilities: ctx.identity.capabilities.clone(),
    };
    let envelope = Envelope::new(
        MessageType::Register,
        ctx.outbound.next_id(),
        serde_json::to_value(&register)?,
    );
    writer.write_all(&codec::encode(&envelope)?).await?;

    // Flush everything queued while the link was down, FIFO
    flush_queue(&mut writer, queue).await?;

    let period = ctx.config.heartbeat_interval();
    let mut heartbeat = interval_at(Instant::now() + period, period);
    let mut last_activity = Instant::now();

    loop {
        // Recomputed every iteration; inbound traffic pushes it forward
        let keepalive_deadline = last_activity + ctx.config.keepalive_timeout();

        tokio::select! {
            _ = shutdown_rx.changed() => {
                return Ok(());
            }

            _ = heartbeat.tick() => {
                let hb = Heartbeat {
                    uptime_ms: started.elapsed().as_millis() as u64,
                    in_flight_tasks: ctx.in_flight.load(Ordering::Relaxed),
                    telemetry: serde_json::to_value(ctx.metrics.sample())?,
                };
                let envelope = Envelope::new(
                    MessageType::Heartbeat,
                    ctx.outbound.next_id(),
                    serde_json::to_value(&hb)?,
                );
                queue.push_back(envelope);
                flush_queue(&mut writer, queue).await?;
            }

            maybe = outbound_rx.recv() => {
                match maybe {
                    Some(envelope) => {
                        queue.push_back(envelope);
                        flush_queue(&mut writer, queue).await?;
                    }
                    None => return Err(anyhow!("outbound channel closed")),
                }
            }

            // The deadline is its own branch: a link with no inbound
            // traffic for the full window is dead even while our own
            // writes still succeed
            _ = sleep_until(keepalive_deadline) => {
                return Err(anyhow!("keep-alive deadline missed"));
            }

            result = reader.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        return Err(anyhow!("operator closed connection"));
                    }
                    Ok(n) => {
                        last_activity = Instant::now();
                        decoder.extend(&read_buf[..n]);

                        while let Some(envelope) = decoder.decode_next()? {
                            dispatch(ctx, envelope).await;
                        }
                    }
                    Err(e) => {
                        return Err(anyhow!("read error: {}", e));
                    }
                }
            }
        }
    }
}

/// Route an inbound envelope to its registered handler. Unregistered
/// types are dropped with a log line, never fatal.
async fn dispatch(ctx: &LoopContext, envelope: Envelope) {
    let handler = ctx.handlers.read().await.get(&envelope.msg_type).cloned();
    match handler {
        Some(handler) => {
            // Handlers run on their own task so a slow one cannot stall reads
            tokio::spawn(handler(envelope));
        }
        None => {
            debug!("Dropping unhandled message type '{}' id={}", envelope.msg_type, envelope.id);
        }
    }
}

/// Write out the queue head-first, popping each message only after a
/// successful write so a failure keeps the rest for the next connect.
async fn flush_queue(writer: &mut OwnedWriteHalf, queue: &mut VecDeque<Envelope>) -> Result<()> {
    while let Some(envelope) = queue.front() {
        let encoded = match codec::encode(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Dropping unencodable message {}: {}", envelope.id, e);
                queue.pop_front();
                continue;
            }
        };
        writer.write_all(&encoded).await?;
        queue.pop_front();
    }
    Ok(())
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
