//! Authenticated WebSocket link used by [`crate::LlmClient`].
//!
//! The read loop feeds `toolkit_context` / `task_response` frames into the
//! [`CallBridge`]. When the link drops every pending call fails, then the
//! loop reconnects with backoff and re-authenticates.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    futures::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    secrecy::{ExposeSecret, Secret},
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
    atp_protocol::{HANDSHAKE_TIMEOUT_MS, LlmFrame, PING_INTERVAL_SECS, paths},
};

use crate::{
    bridge::CallBridge,
    error::{Error, Result},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub url: String,
    pub api_key: Secret<String>,
    pub auth_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Zero disables client pings.
    pub ping_interval: Duration,
    pub reconnect: ReconnectConfig,
}

impl LlmSettings {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: Secret::new(api_key.into()),
            auth_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn from_config(config: &AtpConfig) -> Result<Self> {
        let ws_base = config.ws_base().ok_or_else(|| {
            Error::Connection(format!(
                "cannot derive a WebSocket address from base_url '{}'",
                config.base_url
            ))
        })?;
        Ok(Self {
            url: paths::llm_socket(&ws_base, config.api_key.expose_secret()),
            api_key: config.api_key.clone(),
            auth_timeout: config.calls.auth_timeout(),
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            ping_interval: config.keepalive.ping_interval(),
            reconnect: config.reconnect.clone(),
        })
    }

    pub fn redacted_url(&self) -> String {
        let key = self.api_key.expose_secret();
        if key.is_empty() {
            self.url.clone()
        } else {
            self.url.replace(key.as_str(), "***")
        }
    }
}

pub struct LlmConnection {
    write_tx: mpsc::UnboundedSender<String>,
    connected: watch::Receiver<bool>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LlmConnection {
    /// Connect and authenticate, then keep the link alive in the background.
    ///
    /// Fails with [`Error::Auth`] if the backend rejects the API key or does
    /// not answer within `auth_timeout`.
    pub async fn connect(settings: LlmSettings, bridge: Arc<CallBridge>) -> Result<Self> {
        atp_common::install_crypto_provider();
        let link = open(&settings).await?;
        info!(url = %settings.redacted_url(), "LLM client authenticated");

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected) = watch::channel(true);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            settings,
            bridge,
            link,
            write_rx,
            connected_tx,
            cancel.clone(),
        ));

        Ok(Self {
            write_tx,
            connected,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Queue a frame for the writer. Fails fast while the link is down.
    pub fn send(&self, frame: &LlmFrame) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Connection("not connected to the ATP backend".into()));
        }
        let text = serde_json::to_string(frame)?;
        self.write_tx
            .send(text)
            .map_err(|_| Error::Connection("connection task has stopped".into()))
    }

    /// Close the socket and stop reconnecting. Pending calls fail. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for LlmConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Open the socket and complete the `auth` exchange.
async fn open(settings: &LlmSettings) -> Result<(WsSink, WsReader)> {
    let (ws, _response) =
        tokio::time::timeout(settings.handshake_timeout, connect_async(settings.url.as_str()))
            .await
            .map_err(|_| Error::Connection("connect timed out".into()))??;
    let (mut sink, mut reader) = ws.split();

    let auth = LlmFrame::Auth {
        api_key: settings.api_key.expose_secret().clone(),
    };
    sink.send(Message::Text(serde_json::to_string(&auth)?.into()))
        .await?;

    tokio::time::timeout(settings.auth_timeout, read_auth_response(&mut reader))
        .await
        .unwrap_or_else(|_| Err(Error::Auth("authentication timed out".into())))?;
    Ok((sink, reader))
}

async fn read_auth_response(reader: &mut WsReader) -> Result<()> {
    while let Some(msg) = reader.next().await {
        match msg? {
            Message::Text(text) => match serde_json::from_str::<LlmFrame>(text.as_str()) {
                Ok(LlmFrame::AuthResponse { success: true, .. }) => return Ok(()),
                Ok(LlmFrame::AuthResponse {
                    success: false,
                    error,
                }) => {
                    return Err(Error::Auth(
                        error.unwrap_or_else(|| "rejected by backend".into()),
                    ));
                },
                _ => debug!("ignoring frame before authentication"),
            },
            Message::Close(_) => {
                return Err(Error::Connection(
                    "backend closed the connection before authenticating".into(),
                ));
            },
            _ => {},
        }
    }
    Err(Error::Connection(
        "connection closed before authentication".into(),
    ))
}

enum ServeEnd {
    Closed,
    Lost(String),
}

async fn run(
    settings: LlmSettings,
    bridge: Arc<CallBridge>,
    mut link: (WsSink, WsReader),
    mut write_rx: mpsc::UnboundedReceiver<String>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(
        settings.reconnect.initial_delay(),
        settings.reconnect.max_delay(),
    )
    .with_multiplier(settings.reconnect.multiplier)
    .with_jitter(settings.reconnect.jitter);

    loop {
        let end = serve(&settings, &bridge, link, &mut write_rx, &cancel).await;
        connected.send_replace(false);
        match end {
            ServeEnd::Closed => {
                bridge.fail_all("client closed").await;
                info!("LLM client connection closed");
                return;
            },
            ServeEnd::Lost(reason) => {
                warn!(%reason, "LLM client connection lost");
                bridge.fail_all(&format!("connection lost: {reason}")).await;
            },
        }

        let mut failures: u32 = 0;
        link = loop {
            let delay = backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "reconnecting after delay");
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {},
            }
            let attempt = tokio::select! {
                () = cancel.cancelled() => return,
                res = open(&settings) => res,
            };
            match attempt {
                Ok(link) => {
                    backoff.reset();
                    break link;
                },
                Err(Error::Auth(reason)) => {
                    error!(%reason, "backend rejected credentials on reconnect");
                    return;
                },
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(attempt = failures, error = %e, "reconnect attempt failed");
                    if let Some(max) = settings.reconnect.max_retries
                        && failures > max
                    {
                        error!(attempts = failures, "giving up on ATP backend");
                        return;
                    }
                },
            }
        };
        connected.send_replace(true);
        info!("LLM client reconnected");
    }
}

async fn serve(
    settings: &LlmSettings,
    bridge: &CallBridge,
    link: (WsSink, WsReader),
    write_rx: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> ServeEnd {
    let (mut sink, mut reader) = link;
    let every = settings.ping_interval;
    let mut ping = (!every.is_zero()).then(|| tokio::time::interval_at(Instant::now() + every, every));
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return ServeEnd::Closed;
            },
            msg = reader.next() => {
                if matches!(msg, Some(Ok(_))) {
                    last_inbound = Instant::now();
                }
                match msg {
                    Some(Ok(Message::Text(text))) => handle_text(bridge, text.as_str()).await,
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            return ServeEnd::Lost(e.to_string());
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return ServeEnd::Lost("closed by backend".into());
                    },
                    Some(Ok(_)) => {},
                    Some(Err(e)) => return ServeEnd::Lost(e.to_string()),
                }
            },
            out = write_rx.recv() => match out {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        return ServeEnd::Lost(e.to_string());
                    }
                },
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return ServeEnd::Closed;
                },
            },
            () = next_ping(&mut ping) => {
                // Two silent intervals means the peer is gone even if TCP has not noticed.
                if last_inbound.elapsed() > every * 2 {
                    return ServeEnd::Lost("keepalive timeout".into());
                }
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    return ServeEnd::Lost(e.to_string());
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

async fn handle_text(bridge: &CallBridge, text: &str) {
    match serde_json::from_str::<LlmFrame>(text) {
        Ok(LlmFrame::ToolkitContext {
            request_id,
            payload,
        })
        | Ok(LlmFrame::TaskResponse {
            request_id,
            payload,
        }) => {
            bridge.resolve(&request_id, payload).await;
        },
        Ok(LlmFrame::AuthResponse { .. }) => debug!("ignoring late auth_response"),
        Ok(_) => debug!("ignoring unexpected frame"),
        Err(e) => debug!(error = %e, "ignoring unrecognised frame"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json, tokio::net::TcpListener};

    const WAIT: Duration = Duration::from_secs(5);

    type ServerWs = WebSocketStream<TcpStream>;

    /// Accept one client and approve its `auth` frame, then return the socket.
    async fn accept_authenticated(listener: &TcpListener) -> ServerWs {
        let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        loop {
            let msg = tokio::time::timeout(WAIT, ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                let frame: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(frame["type"], "auth");
                break;
            }
        }
        let reply = json!({"type": "auth_response", "success": true}).to_string();
        ws.send(Message::Text(reply.into())).await.unwrap();
        ws
    }

    async fn wait_connected(conn: &LlmConnection, expected: bool) {
        tokio::time::timeout(WAIT, async {
            while conn.is_connected() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn unanswered_pings_trigger_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut settings = LlmSettings::new(
            format!("ws://{}/key-1/", listener.local_addr().unwrap()),
            "key-1",
        );
        settings.ping_interval = Duration::from_millis(50);
        settings.reconnect.initial_delay_ms = 10;
        settings.reconnect.jitter = 0.0;

        let bridge = Arc::new(CallBridge::new());
        let (conn, silent) = tokio::join!(
            LlmConnection::connect(settings, Arc::clone(&bridge)),
            accept_authenticated(&listener)
        );
        let conn = conn.unwrap();

        // `silent` is never read, so no pong ever comes back.
        wait_connected(&conn, false).await;
        let _second = accept_authenticated(&listener).await;
        wait_connected(&conn, true).await;

        drop(silent);
        conn.close().await;
        assert!(!conn.is_connected());
    }

    #[test]
    fn settings_need_a_websocket_address() {
        let config = AtpConfig::new("k", "llm").with_base_url("ftp://example.com");
        let err = LlmSettings::from_config(&config).unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}
