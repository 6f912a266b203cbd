use std::sync::{Arc, Mutex};

use {
    serde_json::{Value, json},
    tokio::sync::watch,
    tracing::info,
};

use {
    atp_config::{AtpConfig, TransportProtocol},
    atp_oauth::TokenCache,
};

use crate::{
    auth::AuthInjector,
    connection::{ConnectionManager, ConnectionSettings},
    dispatcher::{Dispatcher, InvocationRequest, InvocationResult},
    error::{Error, Result},
    inbox::{InboxPoller, InboxSettings},
    registry::{ToolDescriptor, ToolRegistry},
    runner::{ConnectionState, ToolkitRunner},
};

/// Hosts a registry of tools and serves it to the ATP backend.
///
/// The transport follows `config.protocol`: a persistent WebSocket
/// ([`ConnectionManager`]) or HTTP inbox polling ([`InboxPoller`]).
///
/// ```no_run
/// # async fn demo() -> atp_toolkit::Result<()> {
/// use atp_toolkit::{ParamType, ToolArgs, ToolDescriptor, ToolkitClient};
/// use atp_config::AtpConfig;
///
/// let client = ToolkitClient::new(AtpConfig::new("my-key", "crm"));
/// client.register_tool(
///     ToolDescriptor::builder("echo")
///         .required_param("text", ParamType::String)
///         .handler(|args: ToolArgs| async move { Ok(args["text"].clone()) })
///         .build()?,
/// )?;
/// client.start()?;
/// client.wait().await
/// # }
/// ```
pub struct ToolkitClient {
    config: AtpConfig,
    registry: Arc<ToolRegistry>,
    cache: TokenCache,
    identity: Option<String>,
    runner: Mutex<Option<Arc<dyn ToolkitRunner>>>,
}

impl ToolkitClient {
    pub fn new(config: AtpConfig) -> Self {
        Self {
            config,
            registry: Arc::new(ToolRegistry::new()),
            cache: TokenCache::new(),
            identity: None,
            runner: Mutex::new(None),
        }
    }

    /// Share a token cache with an [`atp_oauth::OAuthCoordinator`].
    #[must_use]
    pub fn with_token_cache(mut self, cache: TokenCache) -> Self {
        self.cache = cache;
        self
    }

    /// External user whose cached tokens are used when a request names none.
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn config(&self) -> &AtpConfig {
        &self.config
    }

    pub fn app_name(&self) -> &str {
        &self.config.app_name
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn token_cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Add or replace a tool. A running client re-announces its registry.
    pub fn register_tool(&self, descriptor: ToolDescriptor) -> Result<()> {
        self.registry.register(descriptor)?;
        if let Some(runner) = self.runner() {
            runner.refresh_tools();
        }
        Ok(())
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        let removed = self.registry.unregister(name);
        if removed && let Some(runner) = self.runner() {
            runner.refresh_tools();
        }
        removed
    }

    fn injector(&self) -> AuthInjector {
        let injector = AuthInjector::new().with_cache(self.cache.clone());
        match &self.identity {
            Some(identity) => injector.with_identity(identity.clone()),
            None => injector,
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.registry), self.injector())
    }

    fn runner(&self) -> Option<Arc<dyn ToolkitRunner>> {
        self.runner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Connect and start serving. Returns once the background task is spawned.
    pub fn start(&self) -> Result<()> {
        if !self.config.has_api_key() {
            return Err(Error::MissingApiKey);
        }
        let mut slot = self.runner.lock().unwrap_or_else(|e| e.into_inner());
        // A runner that gave up on its own has settled and may be replaced.
        if let Some(runner) = slot.as_ref()
            && runner.state() != ConnectionState::Disconnected
        {
            return Err(Error::AlreadyStarted);
        }

        let dispatcher = self.dispatcher();
        let runner: Arc<dyn ToolkitRunner> = match self.config.protocol {
            TransportProtocol::Ws => Arc::new(ConnectionManager::new(
                ConnectionSettings::from_config(&self.config)?,
                dispatcher,
            )),
            TransportProtocol::Http => Arc::new(InboxPoller::new(
                InboxSettings::from_config(&self.config),
                dispatcher,
            )?),
        };
        runner.start()?;
        info!(
            app = %self.config.app_name,
            protocol = %self.config.protocol,
            tools = self.registry.len(),
            "toolkit client started"
        );
        *slot = Some(runner);
        Ok(())
    }

    /// Stop serving. In-flight calls get the configured grace period. Idempotent;
    /// the runner is released so `start` can bring up a fresh one.
    pub async fn stop(&self) {
        let runner = self.runner.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(runner) = runner {
            runner.stop().await;
        }
    }

    /// Resolve when the client stops; errors if connectivity was exhausted.
    pub async fn wait(&self) -> Result<()> {
        match self.runner() {
            Some(runner) => runner.wait().await,
            None => Ok(()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.runner()
            .map_or(ConnectionState::Disconnected, |runner| runner.state())
    }

    /// State updates, once started.
    pub fn subscribe(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.runner().map(|runner| runner.subscribe())
    }

    /// Run one invocation locally through the same path remote requests take.
    pub async fn invoke(&self, request: InvocationRequest) -> InvocationResult {
        self.dispatcher().dispatch(request).await
    }

    pub fn tool_context(&self, name: &str) -> Result<Value> {
        Ok(self.registry.lookup(name)?.context())
    }

    pub fn toolkit_context(&self) -> Value {
        let tools: Vec<Value> = self.registry.list().iter().map(|t| t.context()).collect();
        json!({
            "toolkit": self.config.app_name,
            "app_name": self.config.app_name,
            "tools": tools,
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use {
        super::*,
        crate::registry::{ParamType, ToolArgs},
        atp_oauth::TokenPair,
        futures::{SinkExt, StreamExt},
        tokio::net::TcpListener,
        tokio_tungstenite::tungstenite::Message,
    };

    fn mailer() -> ToolDescriptor {
        ToolDescriptor::builder("send_mail")
            .description("Send an email")
            .required_param("to", ParamType::String)
            .auth("gmail", "oauth2", "access_token")
            .handler(|args: ToolArgs| async move {
                Ok(json!({"to": args["to"], "token": args["access_token"]}))
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn start_requires_api_key() {
        let client = ToolkitClient::new(AtpConfig::new("  ", "crm"));
        assert!(matches!(client.start(), Err(Error::MissingApiKey)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.subscribe().is_none());
        client.stop().await;
        client.wait().await.unwrap();
    }

    #[tokio::test]
    async fn invoke_uses_shared_cache_and_identity() {
        let cache = TokenCache::new();
        cache.insert("gmail", "owner", TokenPair::new("tok-owner"));
        let client = ToolkitClient::new(AtpConfig::new("k", "crm"))
            .with_token_cache(cache.clone())
            .with_identity("owner");
        client.register_tool(mailer()).unwrap();

        let mut params = ToolArgs::new();
        params.insert("to".into(), json!("a@b.c"));
        let ok = client
            .invoke(InvocationRequest::new("r1", "send_mail", params.clone()))
            .await;
        assert_eq!(
            ok,
            InvocationResult::success("r1", json!({"to": "a@b.c", "token": "tok-owner"}))
        );

        cache.remove("gmail", "owner");
        let missing = client
            .invoke(InvocationRequest::new("r2", "send_mail", params))
            .await;
        assert_eq!(
            missing,
            InvocationResult::failure("r2", "Missing authentication token")
        );
    }

    #[test]
    fn contexts_describe_registered_tools() {
        let client = ToolkitClient::new(AtpConfig::new("k", "crm"));
        client.register_tool(mailer()).unwrap();

        assert_eq!(
            client.tool_context("send_mail").unwrap(),
            json!({
                "function": "send_mail",
                "description": "Send an email",
                "params": ["to"],
                "required_params": ["to"],
                "auth_provider": "gmail",
                "auth_type": "oauth2",
                "auth_with": "access_token",
            })
        );
        assert!(matches!(
            client.tool_context("ghost"),
            Err(Error::ToolNotFound { .. })
        ));

        let toolkit = client.toolkit_context();
        assert_eq!(toolkit["toolkit"], "crm");
        assert_eq!(toolkit["tools"][0]["function"], "send_mail");
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let mut config = AtpConfig::new("k", "crm").with_base_url("http://127.0.0.1:1");
        config.reconnect.initial_delay_ms = 60_000;
        let client = ToolkitClient::new(config);
        client.start().unwrap();
        assert!(matches!(client.start(), Err(Error::AlreadyStarted)));

        tokio::time::timeout(Duration::from_secs(5), client.stop())
            .await
            .unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.stop().await;
    }

    #[tokio::test]
    async fn restart_after_stop_opens_a_new_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let client = ToolkitClient::new(AtpConfig::new("k", "crm").with_base_url(base));

        client.start().unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut first = tokio_tungstenite::accept_async(stream).await.unwrap();
        assert_eq!(read_text(&mut first).await["message_type"], "atp_client_hello");
        tokio::time::timeout(Duration::from_secs(5), client.stop())
            .await
            .unwrap();
        assert!(client.subscribe().is_none());

        client.start().unwrap();
        assert_eq!(client.state(), ConnectionState::Connecting);
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut second = tokio_tungstenite::accept_async(stream).await.unwrap();
        assert_eq!(read_text(&mut second).await["message_type"], "atp_client_hello");
        client.stop().await;
    }

    #[tokio::test]
    async fn registering_while_running_reannounces() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let client = ToolkitClient::new(AtpConfig::new("k", "crm").with_base_url(base));
        client.register_tool(mailer()).unwrap();
        client.start().unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        assert_eq!(read_text(&mut ws).await["message_type"], "atp_client_hello");

        ws.send(Message::Text(
            json!({"message_type": "atp_client_connected", "payload": {}})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

        let first = read_text(&mut ws).await;
        assert_eq!(first["payload"]["tools"].as_array().unwrap().len(), 1);

        client
            .register_tool(
                ToolDescriptor::builder("noop")
                    .handler(|_args: ToolArgs| async { Ok(Value::Null) })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let second = read_text(&mut ws).await;
        assert_eq!(second["message_type"], "atp_register_tools");
        assert_eq!(second["payload"]["tools"][1]["name"], "noop");

        client.stop().await;
    }

    async fn read_text(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    ) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }
}
