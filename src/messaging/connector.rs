//! Connection lifecycle for the shared STOMP socket
//!
//! A single background task owns the socket. Everything else talks to it
//! through an unbounded command channel and watches its state. Unexpected
//! drops are retried forever on a fixed delay; nothing here reports a
//! terminal error to callers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use url::Url;

use super::router::{Router, SubscriptionId};
use crate::models::Identity;
use crate::stomp::{Command, Frame, HeartBeat, Incoming, StompSocket};

pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws/websocket";

/// How long `shutdown` waits for the socket task to say goodbye.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Broker WebSocket endpoint, without the identity query parameter.
    pub url: Url,
    pub reconnect_delay: Duration,
    /// Heart-beat intervals offered in CONNECT.
    pub heartbeat: HeartBeat,
    /// Silence tolerated is the negotiated incoming interval times this.
    pub heartbeat_tolerance: u32,
    pub connect_timeout: Duration,
    /// Log every frame at debug level.
    pub trace_frames: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            url: Url::parse(DEFAULT_WS_URL).expect("default URL is valid"),
            reconnect_delay: Duration::from_millis(5000),
            heartbeat: HeartBeat::new(4000, 4000),
            heartbeat_tolerance: 2,
            connect_timeout: Duration::from_secs(10),
            trace_frames: false,
        }
    }
}

impl TransportSettings {
    /// Endpoint URL carrying the identity as `?user=`.
    pub fn endpoint_for(&self, identity: &Identity) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("user", &identity.email);
        url
    }
}

/// Requests to the socket task.
#[derive(Debug)]
pub(crate) enum ConnCommand {
    Subscribe(SubscriptionId),
    Unsubscribe(SubscriptionId),
    Publish { destination: String, body: String },
    Disconnect,
}

struct Run {
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    task: JoinHandle<()>,
}

struct Shared {
    settings: TransportSettings,
    router: Arc<Router>,
    state_tx: watch::Sender<ConnectionState>,
    /// Bumped on every connect/disconnect so a retiring task cannot
    /// overwrite the state of its successor.
    generation: AtomicU64,
    run: Mutex<Option<Run>>,
}

impl Shared {
    fn set_state(&self, generation: u64, state: ConnectionState) {
        if self.generation.load(Ordering::SeqCst) == generation {
            let previous = self.state_tx.send_replace(state);
            if previous != state {
                tracing::debug!("Connection state: {} -> {}", previous.as_str(), state.as_str());
            }
        }
    }
}

/// Handle to the shared connection. Cheap to clone.
#[derive(Clone)]
pub struct Connector {
    shared: Arc<Shared>,
}

impl Connector {
    pub fn new(settings: TransportSettings) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                settings,
                router: Arc::new(Router::default()),
                state_tx,
                generation: AtomicU64::new(0),
                run: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.shared.settings
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.shared.router
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Resolves once the connection is up. Returns immediately if it
    /// already is; otherwise waits for the next successful connect.
    pub async fn connected(&self) {
        let mut rx = self.subscribe_state();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|s| *s == ConnectionState::Connected).await;
    }

    /// Start connecting as `identity`. No-op if already started.
    pub fn connect(&self, identity: &Identity) {
        let mut run = self.lock_run();
        if let Some(ref existing) = *run {
            if !existing.task.is_finished() {
                tracing::debug!("connect() ignored: connection already active");
                return;
            }
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let endpoint = self.shared.settings.endpoint_for(identity);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        self.shared.set_state(generation, ConnectionState::Connecting);
        let task = tokio::spawn(run_loop(
            Arc::clone(&self.shared),
            generation,
            endpoint,
            cmd_rx,
        ));

        *run = Some(Run { cmd_tx, task });
    }

    /// Tear the connection down without waiting. Idempotent.
    pub fn disconnect(&self) {
        if self.retire().is_some() {
            tracing::info!("Disconnecting from chat broker");
        }
    }

    /// Tear the connection down and wait briefly for DISCONNECT to go out.
    pub async fn shutdown(&self) {
        if let Some(task) = self.retire() {
            if time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::warn!("Socket task did not stop in time");
            }
        }
    }

    /// Queue a command for the socket task. Dropped if nothing is running.
    pub(crate) fn command(&self, cmd: ConnCommand) {
        let run = self.lock_run();
        match *run {
            Some(ref r) => {
                if r.cmd_tx.send(cmd).is_err() {
                    tracing::debug!("Socket task gone -- command dropped");
                }
            }
            None => tracing::debug!("Not connected -- {:?} dropped", cmd),
        }
    }

    fn retire(&self) -> Option<JoinHandle<()>> {
        let run = self.lock_run().take()?;
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = run.cmd_tx.send(ConnCommand::Disconnect);
        self.shared.set_state(generation, ConnectionState::Disconnected);
        Some(run.task)
    }

    fn lock_run(&self) -> std::sync::MutexGuard<'_, Option<Run>> {
        self.shared.run.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Why a session ended.
enum SessionEnd {
    /// Asked to stop. Do not reconnect.
    Shutdown,
    /// Lost the connection. Reconnect after the delay.
    Dropped(anyhow::Error),
}

/// Keep a session alive until told to stop.
async fn run_loop(
    shared: Arc<Shared>,
    generation: u64,
    endpoint: Url,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
) {
    let delay = shared.settings.reconnect_delay;

    loop {
        match session(&shared, generation, &endpoint, &mut cmd_rx).await {
            SessionEnd::Shutdown => break,
            SessionEnd::Dropped(e) => {
                tracing::warn!("Chat connection lost: {:#}. Reconnecting in {:?}...", e, delay);
                shared.set_state(generation, ConnectionState::Reconnecting);
                if !wait_before_reconnect(delay, &mut cmd_rx).await {
                    break;
                }
            }
        }
    }

    shared.set_state(generation, ConnectionState::Disconnected);
    tracing::debug!("Socket task finished");
}

/// Sleep out the reconnect delay. Returns false if asked to stop meanwhile.
async fn wait_before_reconnect(
    delay: Duration,
    cmd_rx: &mut mpsc::UnboundedReceiver<ConnCommand>,
) -> bool {
    let sleep = time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = cmd_rx.recv() => {
                if !drop_offline_command(cmd) {
                    return false;
                }
            }
        }
    }
}

/// Handle a command that arrives with no live session. Returns false on
/// a shutdown request.
fn drop_offline_command(cmd: Option<ConnCommand>) -> bool {
    match cmd {
        None | Some(ConnCommand::Disconnect) => false,
        Some(ConnCommand::Publish { destination, .. }) => {
            tracing::debug!("Not connected, dropping publish to {}", destination);
            true
        }
        // Registrations are replayed from the router on the next connect.
        Some(ConnCommand::Subscribe(_)) | Some(ConnCommand::Unsubscribe(_)) => true,
    }
}

/// Open the socket and complete the STOMP handshake.
///
/// Returns the socket and the negotiated (outgoing, incoming) heart-beats.
async fn handshake(
    settings: &TransportSettings,
    endpoint: &Url,
) -> Result<(StompSocket, Option<Duration>, Option<Duration>)> {
    let mut socket = StompSocket::connect(endpoint.as_str(), settings.trace_frames).await?;

    let host = endpoint.host_str().unwrap_or("localhost");
    socket
        .send_frame(&Frame::connect(host, settings.heartbeat))
        .await?;

    let connected = time::timeout(settings.connect_timeout, await_connected(&mut socket))
        .await
        .context("Timed out waiting for CONNECTED")??;

    let server = connected
        .get("heart-beat")
        .and_then(HeartBeat::parse)
        .unwrap_or_default();
    let (outgoing, incoming) = settings.heartbeat.negotiate(server);

    tracing::info!(
        "STOMP session established (version={}, heart-beat out={:?} in={:?})",
        connected.get("version").unwrap_or("?"),
        outgoing,
        incoming
    );

    Ok((socket, outgoing, incoming))
}

async fn await_connected(socket: &mut StompSocket) -> Result<Frame> {
    loop {
        let items = socket
            .recv()
            .await?
            .context("Connection closed during STOMP handshake")?;
        for item in items {
            if let Incoming::Frame(frame) = item {
                match frame.command {
                    Command::Connected => return Ok(frame),
                    Command::Error => anyhow::bail!(
                        "Broker rejected CONNECT: {}",
                        frame.get("message").unwrap_or(&frame.body)
                    ),
                    other => tracing::debug!("Ignoring {} before CONNECTED", other),
                }
            }
        }
    }
}

/// One connection: handshake, replay subscriptions, then pump frames.
async fn session(
    shared: &Shared,
    generation: u64,
    endpoint: &Url,
    cmd_rx: &mut mpsc::UnboundedReceiver<ConnCommand>,
) -> SessionEnd {
    let settings = &shared.settings;

    let connecting = handshake(settings, endpoint);
    tokio::pin!(connecting);
    let (mut socket, outgoing, incoming) = loop {
        tokio::select! {
            result = &mut connecting => match result {
                Ok(parts) => break parts,
                Err(e) => return SessionEnd::Dropped(e),
            },
            cmd = cmd_rx.recv() => {
                if !drop_offline_command(cmd) {
                    return SessionEnd::Shutdown;
                }
            }
        }
    };

    // Subscriptions go out before anyone is told we are connected, so
    // nothing published after the on-connect event can miss its echo.
    let mut active: HashSet<SubscriptionId> = HashSet::new();
    for (id, destination) in shared.router.snapshot() {
        if let Err(e) = socket
            .send_frame(&Frame::subscribe(&id.to_string(), &destination))
            .await
        {
            return SessionEnd::Dropped(e);
        }
        active.insert(id);
    }
    shared.set_state(generation, ConnectionState::Connected);
    tracing::info!("Connected to chat broker ({} subscriptions)", active.len());

    let mut heartbeat = time::interval(outgoing.unwrap_or(Duration::from_secs(3600)));
    heartbeat.tick().await; // skip first immediate tick

    let liveness = incoming.map(|d| d * settings.heartbeat_tolerance.max(1));
    let deadline = time::sleep(liveness.unwrap_or(Duration::from_secs(3600)));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            received = socket.recv() => {
                let items = match received {
                    Ok(Some(items)) => items,
                    Ok(None) => return SessionEnd::Dropped(anyhow::anyhow!("WebSocket closed by server")),
                    Err(e) => return SessionEnd::Dropped(e),
                };
                if let Some(window) = liveness {
                    deadline.as_mut().reset(Instant::now() + window);
                }
                for item in items {
                    let Incoming::Frame(frame) = item else { continue };
                    match frame.command {
                        Command::Message => {
                            shared.router.route(&frame);
                        }
                        Command::Error => {
                            return SessionEnd::Dropped(anyhow::anyhow!(
                                "Broker error: {}",
                                frame.get("message").unwrap_or(&frame.body)
                            ));
                        }
                        Command::Receipt => {
                            tracing::debug!("Receipt {}", frame.get("receipt-id").unwrap_or("?"));
                        }
                        other => tracing::debug!("Unexpected {} frame ignored", other),
                    }
                }
            }
            _ = heartbeat.tick(), if outgoing.is_some() => {
                if let Err(e) = socket.send_heartbeat().await {
                    return SessionEnd::Dropped(e);
                }
            }
            _ = &mut deadline, if liveness.is_some() => {
                return SessionEnd::Dropped(anyhow::anyhow!(
                    "No traffic from broker within {:?}",
                    liveness.unwrap_or_default()
                ));
            }
            cmd = cmd_rx.recv() => {
                let result = match cmd {
                    Some(ConnCommand::Subscribe(id)) => {
                        match shared.router.destination_of(id) {
                            Some(destination) if !active.contains(&id) => {
                                active.insert(id);
                                socket.send_frame(&Frame::subscribe(&id.to_string(), &destination)).await
                            }
                            _ => Ok(()),
                        }
                    }
                    Some(ConnCommand::Unsubscribe(id)) => {
                        if active.remove(&id) {
                            socket.send_frame(&Frame::unsubscribe(&id.to_string())).await
                        } else {
                            Ok(())
                        }
                    }
                    Some(ConnCommand::Publish { destination, body }) => {
                        socket.send_frame(&Frame::send_json(&destination, body)).await
                    }
                    Some(ConnCommand::Disconnect) | None => {
                        let receipt = uuid::Uuid::new_v4().to_string();
                        if let Err(e) = socket.send_frame(&Frame::disconnect(&receipt)).await {
                            tracing::debug!("DISCONNECT not delivered: {:#}", e);
                        }
                        socket.close().await;
                        return SessionEnd::Shutdown;
                    }
                };
                if let Err(e) = result {
                    return SessionEnd::Dropped(e);
                }
            }
        }
    }
}
