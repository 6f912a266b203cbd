//! HTTP variant of the toolkit transport: per-tool registration over REST,
//! then periodic inbox polling. Used when the config selects `protocol = "http"`.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde_json::Value,
    tokio::{
        sync::{mpsc, watch},
        task::JoinHandle,
        time::MissedTickBehavior,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    atp_config::AtpConfig,
    atp_protocol::{
        API_KEY_HEADER, HttpToolRegistration, PROGRAMMING_LANGUAGE, ToolRequest, paths,
    },
};

use crate::{
    dispatcher::{Dispatcher, InvocationResult},
    error::{Context, Error, Result},
    runner::{ConnectionState, ToolkitRunner},
};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct InboxSettings {
    /// Base address without a trailing slash.
    pub base_url: String,
    pub api_key: Secret<String>,
    pub app_name: String,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
}

impl InboxSettings {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, app_name: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: Secret::new(api_key.into()),
            app_name: app_name.into(),
            poll_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
        }
    }

    pub fn from_config(config: &AtpConfig) -> Self {
        Self {
            base_url: config.http_base().to_string(),
            api_key: config.api_key.clone(),
            app_name: config.app_name.clone(),
            poll_interval: config.inbox.poll_interval(),
            shutdown_grace: config.shutdown_grace(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// One item pulled from the inbox.
#[derive(Debug)]
enum InboxItem {
    Request(ToolRequest),
    /// Has a `request_id` but is otherwise unusable; answered with an error.
    Malformed { request_id: String, error: String },
}

/// Parse an inbox body. Empty, `null` and `{}` mean no work; a single
/// object or an array of objects carry requests.
fn parse_inbox(body: &str) -> Result<Vec<InboxItem>> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let items = match serde_json::from_str::<Value>(body)? {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        other => {
            return Err(Error::Transport(format!(
                "unexpected inbox body: {other}"
            )));
        },
    };

    Ok(items
        .into_iter()
        .filter(|item| item.as_object().is_some_and(|o| !o.is_empty()))
        .filter_map(|item| {
            let request_id = item
                .get("request_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            match serde_json::from_value::<ToolRequest>(item) {
                Ok(req) => Some(InboxItem::Request(req)),
                Err(e) => match request_id {
                    Some(request_id) => Some(InboxItem::Malformed {
                        request_id,
                        error: format!("Invalid tool request: {e}"),
                    }),
                    None => {
                        warn!(error = %e, "dropping inbox item without request_id");
                        None
                    },
                },
            }
        })
        .collect())
}

struct Shared {
    settings: InboxSettings,
    http: reqwest::Client,
    dispatcher: Dispatcher,
    state: watch::Sender<ConnectionState>,
    tools_changed: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "inbox state changed");
        }
    }

    fn api_key(&self) -> &str {
        self.settings.api_key.expose_secret()
    }

    /// Register every tool. Failures are logged per tool.
    async fn register_all(&self) {
        let tools = self.dispatcher.registry().list();
        for tool in &tools {
            let body = HttpToolRegistration {
                function_id: tool.name.clone(),
                api_key: self.api_key().to_string(),
                app_name: self.settings.app_name.clone(),
                programming_language: PROGRAMMING_LANGUAGE.into(),
                metadata: tool.http_metadata(),
            };
            let resp = self
                .http
                .post(self.settings.url(paths::REGISTER_TOOL))
                .header(API_KEY_HEADER, self.api_key())
                .json(&body)
                .send()
                .await;
            match resp {
                Ok(resp) if resp.status().is_success() => {
                    info!(tool = %tool.name, "tool registered");
                },
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    warn!(tool = %tool.name, %status, body = %text, "tool registration rejected");
                },
                Err(e) => warn!(tool = %tool.name, error = %e, "tool registration failed"),
            }
        }
    }

    async fn poll(&self) -> Result<Vec<InboxItem>> {
        let resp = self
            .http
            .get(self.settings.url(&paths::inbox(self.api_key())))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("inbox poll failed with status {status}")));
        }
        parse_inbox(&resp.text().await?)
    }

    async fn deliver(&self, result: InvocationResult) {
        let request_id = result.request_id.clone();
        let body = result.into_inbox_response();
        let resp = self
            .http
            .post(self.settings.url(&paths::inbox_respond(self.api_key())))
            .json(&body)
            .send()
            .await;
        match resp {
            Ok(resp) if resp.status().is_success() => {
                debug!(request_id = %request_id, "result delivered to inbox");
            },
            Ok(resp) => {
                warn!(request_id = %request_id, status = %resp.status(), "inbox rejected result");
            },
            Err(e) => warn!(request_id = %request_id, error = %e, "failed to deliver result"),
        }
    }
}

/// Polls the backend inbox and answers through the same dispatcher the
/// WebSocket transport uses.
pub struct InboxPoller {
    shared: Arc<Shared>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl InboxPoller {
    pub fn new(settings: InboxSettings, dispatcher: Dispatcher) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building inbox HTTP client")?;
        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                http,
                dispatcher,
                state: watch::Sender::new(ConnectionState::Disconnected),
                tools_changed: watch::Sender::new(0),
                cancel: CancellationToken::new(),
            }),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ToolkitRunner for InboxPoller {
    fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        self.shared.set_state(ConnectionState::Connecting);
        let handle = tokio::spawn(poll_loop(Arc::clone(&self.shared)));
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
            Some(handle) => handle.await.context("inbox task failed")?,
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

/// Settles the poller in `Disconnected` on every exit path, panics included.
struct SettleOnExit(Arc<Shared>);

impl Drop for SettleOnExit {
    fn drop(&mut self) {
        self.0.set_state(ConnectionState::Disconnected);
    }
}

async fn poll_loop(shared: Arc<Shared>) -> Result<()> {
    let _settle = SettleOnExit(Arc::clone(&shared));
    let mut tools_changed = shared.tools_changed.subscribe();
    tools_changed.borrow_and_update();

    tokio::select! {
        () = shared.cancel.cancelled() => {
            shared.set_state(ConnectionState::Disconnected);
            return Ok(());
        },
        () = shared.register_all() => {},
    }
    shared.set_state(ConnectionState::Connected);
    info!(
        base_url = %shared.settings.base_url,
        interval_ms = shared.settings.poll_interval.as_millis() as u64,
        "polling toolkit inbox"
    );

    let (results_tx, mut results_rx) = mpsc::unbounded_channel::<InvocationResult>();
    let mut ticker = tokio::time::interval(shared.settings.poll_interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = shared.cancel.cancelled() => break,
            Some(result) = results_rx.recv() => shared.deliver(result).await,
            Ok(()) = tools_changed.changed() => shared.register_all().await,
            _ = ticker.tick() => match shared.poll().await {
                Ok(items) => {
                    shared.set_state(ConnectionState::Connected);
                    for item in items {
                        match item {
                            InboxItem::Request(req) => {
                                info!(request_id = %req.request_id, tool = %req.tool_name, "inbox request received");
                                shared.dispatcher.spawn(req.into(), results_tx.clone());
                            },
                            InboxItem::Malformed { request_id, error } => {
                                warn!(request_id = %request_id, %error, "malformed inbox request");
                                shared.deliver(InvocationResult::failure(request_id, error)).await;
                            },
                        }
                    }
                },
                Err(e) => {
                    warn!(error = %e, "inbox poll failed");
                    shared.set_state(ConnectionState::Reconnecting);
                },
            },
        }
    }

    shared.set_state(ConnectionState::Closing);
    let drained = shared.dispatcher.drain(shared.settings.shutdown_grace);
    tokio::pin!(drained);
    loop {
        tokio::select! {
            finished = &mut drained => {
                if !finished {
                    warn!(in_flight = shared.dispatcher.in_flight(), "stopping with tool calls still running");
                }
                break;
            },
            Some(result) = results_rx.recv() => shared.deliver(result).await,
        }
    }
    while let Ok(result) = results_rx.try_recv() {
        shared.deliver(result).await;
    }
    shared.set_state(ConnectionState::Disconnected);
    info!("inbox polling stopped");
    Ok(())
}
