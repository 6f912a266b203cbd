//! WebSocket link to the ATP backend: handshake, tool announcement,
//! request serving, keepalive and reconnect with backoff.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    secrecy::{ExposeSecret, Secret},
    serde::Serialize,
    serde_json::Value,
    tokio::{
        net::TcpStream,
        sync::{mpsc, watch},
        task::JoinHandle,
        time::{Instant, Interval},
    },
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use {
    atp_common::Backoff,
    atp_config::{AtpConfig, ReconnectConfig},
    atp_protocol::{
        ClientConnected, ClientHello, Envelope, HANDSHAKE_TIMEOUT_MS, PING_INTERVAL_SECS,
        PROGRAMMING_LANGUAGE, RegisterTools, ToolRequest, ToolResponseFrame, message_types, paths,
    },
};

use crate::{
    dispatcher::{Dispatcher, InvocationResult},
    error::{Context, Error, Result},
    registry::ToolRegistry,
    runner::{ConnectionState, ToolkitRunner},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Everything the connection loop needs to reach and talk to the backend.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    pub api_key: Secret<String>,
    pub app_name: String,
    pub reconnect: ReconnectConfig,
    /// Zero disables client pings.
    pub ping_interval: Duration,
    pub handshake_timeout: Duration,
    /// How long in-flight invocations get to deliver results on stop.
    pub shutdown_grace: Duration,
}

impl ConnectionSettings {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: Secret::new(api_key.into()),
            app_name: app_name.into(),
            reconnect: ReconnectConfig::default(),
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            shutdown_grace: Duration::from_secs(2),
        }
    }

    pub fn from_config(config: &AtpConfig) -> Result<Self> {
        let ws_base = config.ws_base().with_context(|| {
            format!(
                "cannot derive a WebSocket address from base_url '{}'",
                config.base_url
            )
        })?;
        let api_key = config.api_key.expose_secret();
        Ok(Self {
            url: paths::toolkit_socket(&ws_base, api_key),
            api_key: config.api_key.clone(),
            app_name: config.app_name.clone(),
            reconnect: config.reconnect.clone(),
            ping_interval: config.keepalive.ping_interval(),
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            shutdown_grace: config.shutdown_grace(),
        })
    }

    /// The socket URL with the API key masked, for logs.
    pub fn redacted_url(&self) -> String {
        let key = self.api_key.expose_secret();
        if key.is_empty() {
            self.url.clone()
        } else {
            self.url.replace(key.as_str(), "***")
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.reconnect.initial_delay(), self.reconnect.max_delay())
            .with_multiplier(self.reconnect.multiplier)
            .with_jitter(self.reconnect.jitter)
    }

    fn hello(&self) -> ClientHello {
        ClientHello {
            api_key: self.api_key.expose_secret().clone(),
            app_name: self.app_name.clone(),
            programming_language: PROGRAMMING_LANGUAGE.into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

struct Shared {
    settings: ConnectionSettings,
    registry: Arc<ToolRegistry>,
    dispatcher: Dispatcher,
    state: watch::Sender<ConnectionState>,
    tools_changed: watch::Sender<u64>,
    cancel: CancellationToken,
    announcements: AtomicUsize,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "connection state changed");
        }
    }
}

/// Owns the toolkit's WebSocket session.
///
/// `start` spawns the connection loop; `stop` cancels it (including any
/// backoff sleep), gives in-flight invocations `shutdown_grace` to report,
/// sends a close frame and settles in `Disconnected`.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings, dispatcher: Dispatcher) -> Self {
        let registry = Arc::clone(dispatcher.registry());
        Self {
            shared: Arc::new(Shared {
                settings,
                registry,
                dispatcher,
                state: watch::Sender::new(ConnectionState::Disconnected),
                tools_changed: watch::Sender::new(0),
                cancel: CancellationToken::new(),
                announcements: AtomicUsize::new(0),
            }),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Registration messages successfully sent so far.
    pub fn announcement_count(&self) -> usize {
        self.shared.announcements.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.shared.settings
    }
}

#[async_trait]
impl ToolkitRunner for ConnectionManager {
    fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        atp_common::install_crypto_provider();
        self.shared.set_state(ConnectionState::Connecting);
        let handle = tokio::spawn(connection_loop(Arc::clone(&self.shared)));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.shared.cancel.cancel();
        if !self.started.load(Ordering::SeqCst) {
            self.shared.set_state(ConnectionState::Disconnected);
            return;
        }
        let mut state = self.shared.state.subscribe();
        let _ = state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await;
    }

    async fn wait(&self) -> Result<()> {
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        match handle {
            Some(handle) => handle.await.context("connection task failed")?,
            None => Ok(()),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    fn refresh_tools(&self) {
        self.shared.tools_changed.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// Leaves the state in `Disconnected` however the loop ends, panics included,
/// so `stop` never waits on a task that is gone.
struct SettleOnExit(Arc<Shared>);

impl Drop for SettleOnExit {
    fn drop(&mut self) {
        self.0.set_state(ConnectionState::Disconnected);
    }
}

enum ServeExit {
    Stopped,
    Dropped(Error),
}

/// Main loop: connect, serve until the link drops, back off, repeat.
async fn connection_loop(shared: Arc<Shared>) -> Result<()> {
    let _settle = SettleOnExit(Arc::clone(&shared));
    let settings = &shared.settings;
    let mut backoff = settings.backoff();
    let mut failures: u32 = 0;
    let (results_tx, mut results_rx) = mpsc::unbounded_channel::<InvocationResult>();
    let mut unsent = VecDeque::new();

    let outcome = loop {
        info!(url = %settings.redacted_url(), app = %settings.app_name, "connecting to ATP backend");
        let attempt = tokio::select! {
            () = shared.cancel.cancelled() => break Ok(()),
            res = connect(settings) => res,
        };

        match attempt {
            Ok((sink, reader)) => {
                failures = 0;
                backoff.reset();
                shared.set_state(ConnectionState::Connected);
                match serve(&shared, sink, reader, &results_tx, &mut results_rx, &mut unsent).await {
                    ServeExit::Stopped => break Ok(()),
                    ServeExit::Dropped(e) => warn!(error = %e, "connection lost"),
                }
            },
            Err(e) => {
                failures = failures.saturating_add(1);
                warn!(attempt = failures, error = %e, "connection attempt failed");
                if let Some(max) = settings.reconnect.max_retries
                    && failures > max
                {
                    error!(attempts = failures, "giving up on ATP backend");
                    break Err(Error::ConnectivityExhausted { attempts: failures });
                }
            },
        }

        shared.set_state(ConnectionState::Reconnecting);
        let delay = backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, "reconnecting after delay");
        tokio::select! {
            () = shared.cancel.cancelled() => break Ok(()),
            () = tokio::time::sleep(delay) => {},
        }
    };

    if outcome.is_ok() {
        shared.set_state(ConnectionState::Closing);
    }
    if !unsent.is_empty() {
        warn!(count = unsent.len(), "dropping undelivered tool results");
    }
    shared.set_state(ConnectionState::Disconnected);
    info!("toolkit connection closed");
    outcome
}

/// Open the socket and complete the hello handshake.
async fn connect(settings: &ConnectionSettings) -> Result<(WsSink, WsReader)> {
    let (ws, _response) =
        tokio::time::timeout(settings.handshake_timeout, connect_async(settings.url.as_str()))
            .await
            .map_err(|_| Error::Transport("connect timed out".into()))??;
    let (mut sink, mut reader) = ws.split();

    let hello = Envelope::new(message_types::CLIENT_HELLO, settings.hello())?;
    send_json(&mut sink, &hello).await?;
    wait_for_connected(&mut reader, settings.handshake_timeout).await?;
    Ok((sink, reader))
}

/// Wait for `atp_client_connected`, skipping anything else.
async fn wait_for_connected(reader: &mut WsReader, timeout: Duration) -> Result<()> {
    tokio::time::timeout(timeout, read_until_connected(reader))
        .await
        .unwrap_or_else(|_| Err(Error::Transport("handshake timed out".into())))
}

async fn read_until_connected(reader: &mut WsReader) -> Result<()> {
    while let Some(msg) = reader.next().await {
        match msg? {
            Message::Text(text) => match serde_json::from_str::<Envelope>(text.as_str()) {
                Ok(env) if env.message_type == message_types::CLIENT_CONNECTED => {
                    let ack: ClientConnected =
                        serde_json::from_value(env.payload).unwrap_or_default();
                    info!(
                        message = ack.message.as_deref().unwrap_or_default(),
                        "backend accepted toolkit client"
                    );
                    return Ok(());
                },
                Ok(env) => {
                    debug!(message_type = %env.message_type, "ignoring frame before handshake");
                },
                Err(e) => debug!(error = %e, "ignoring unparseable frame before handshake"),
            },
            Message::Close(_) => {
                return Err(Error::Transport(
                    "server closed connection during handshake".into(),
                ));
            },
            _ => {},
        }
    }
    Err(Error::Transport("connection closed before handshake".into()))
}

async fn serve(
    shared: &Shared,
    mut sink: WsSink,
    mut reader: WsReader,
    results_tx: &mpsc::UnboundedSender<InvocationResult>,
    results_rx: &mut mpsc::UnboundedReceiver<InvocationResult>,
    unsent: &mut VecDeque<ToolResponseFrame>,
) -> ServeExit {
    let mut tools_changed = shared.tools_changed.subscribe();
    tools_changed.borrow_and_update();

    if let Err(e) = announce(shared, &mut sink).await {
        return ServeExit::Dropped(e);
    }
    while let Some(frame) = unsent.pop_front() {
        if let Err(e) = send_json(&mut sink, &frame).await {
            unsent.push_front(frame);
            return ServeExit::Dropped(e);
        }
    }

    let every = shared.settings.ping_interval;
    let mut ping = (!every.is_zero()).then(|| tokio::time::interval_at(Instant::now() + every, every));
    // Any inbound frame, pongs included, proves the peer is alive.
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            biased;
            () = shared.cancel.cancelled() => {
                shared.set_state(ConnectionState::Closing);
                close_gracefully(shared, &mut sink, results_rx).await;
                return ServeExit::Stopped;
            },
            msg = reader.next() => {
                if matches!(msg, Some(Ok(_))) {
                    last_inbound = Instant::now();
                }
                match msg {
                    Some(Ok(Message::Text(text))) => handle_text(shared, text.as_str(), results_tx),
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            return ServeExit::Dropped(e.into());
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "backend closed connection");
                        return ServeExit::Dropped(Error::Transport("closed by backend".into()));
                    },
                    Some(Ok(_)) => {},
                    Some(Err(e)) => return ServeExit::Dropped(e.into()),
                    None => return ServeExit::Dropped(Error::Transport("connection closed".into())),
                }
            },
            Some(result) = results_rx.recv() => {
                let frame = result.into_frame();
                if let Err(e) = send_json(&mut sink, &frame).await {
                    unsent.push_back(frame);
                    return ServeExit::Dropped(e);
                }
            },
            Ok(()) = tools_changed.changed() => {
                if let Err(e) = announce(shared, &mut sink).await {
                    return ServeExit::Dropped(e);
                }
            },
            () = next_ping(&mut ping) => {
                if last_inbound.elapsed() > every * 2 {
                    warn!(silent_ms = last_inbound.elapsed().as_millis() as u64, "backend stopped answering pings");
                    return ServeExit::Dropped(Error::Transport("keepalive timeout".into()));
                }
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    return ServeExit::Dropped(e.into());
                }
            },
        }
    }
}

async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        },
        None => std::future::pending().await,
    }
}

fn handle_text(shared: &Shared, text: &str, results: &mpsc::UnboundedSender<InvocationResult>) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "ignoring unparseable frame");
            return;
        },
    };

    if envelope.is_tool_request() {
        match serde_json::from_value::<ToolRequest>(envelope.payload.clone()) {
            Ok(req) => {
                info!(request_id = %req.request_id, tool = %req.tool_name, "tool request received");
                shared.dispatcher.spawn(req.into(), results.clone());
            },
            Err(e) => match envelope.payload.get("request_id").and_then(Value::as_str) {
                Some(request_id) => {
                    warn!(request_id, error = %e, "malformed tool request");
                    let _ = results.send(InvocationResult::failure(
                        request_id,
                        format!("Invalid tool request: {e}"),
                    ));
                },
                None => warn!(error = %e, "ignoring tool request without request_id"),
            },
        }
    } else {
        debug!(message_type = %envelope.message_type, "ignoring message");
    }
}

async fn announce(shared: &Shared, sink: &mut WsSink) -> Result<()> {
    let tools = shared.registry.announcements();
    let count = tools.len();
    let message = Envelope::new(message_types::REGISTER_TOOLS, RegisterTools {
        app_name: shared.settings.app_name.clone(),
        tools,
    })?;
    send_json(sink, &message).await?;
    shared.announcements.fetch_add(1, Ordering::SeqCst);
    info!(tools = count, "announced tools");
    Ok(())
}

/// Deliver results that finish within the grace period, then close the socket.
async fn close_gracefully(
    shared: &Shared,
    sink: &mut WsSink,
    results_rx: &mut mpsc::UnboundedReceiver<InvocationResult>,
) {
    let drained = shared.dispatcher.drain(shared.settings.shutdown_grace);
    tokio::pin!(drained);
    loop {
        tokio::select! {
            finished = &mut drained => {
                if !finished {
                    warn!(in_flight = shared.dispatcher.in_flight(), "closing with tool calls still running");
                }
                break;
            },
            Some(result) = results_rx.recv() => {
                let _ = send_json(sink, &result.into_frame()).await;
            },
        }
    }
    while let Ok(result) = results_rx.try_recv() {
        let _ = send_json(sink, &result.into_frame()).await;
    }
    let _ = sink.send(Message::Close(None)).await;
}

async fn send_json<T: Serialize>(sink: &mut WsSink, value: &T) -> Result<()> {
    let text = serde_json::to_string(value)?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}
