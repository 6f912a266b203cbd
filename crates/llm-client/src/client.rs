use std::{sync::Arc, time::Duration};

use {
    futures::future::try_join_all,
    secrecy::ExposeSecret,
    serde_json::Value,
    tracing::{info, warn},
};

use {
    atp_config::{AtpConfig, TransportProtocol},
    atp_protocol::{
        API_KEY_HEADER, FormattedToolCall, LlmFrame, TaskRequest, ToolCallResult, paths,
    },
};

use crate::{
    bridge::CallBridge,
    connection::{LlmConnection, LlmSettings},
    error::{Context, Error, Result},
    format::{Provider, format_tool_calls},
    sse::{self, EventStream},
};

/// Per-call knobs for [`LlmClient::call_tool`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub provider: Provider,
    /// Forwarded to the toolkit; takes precedence over its cached OAuth tokens.
    pub auth_token: Option<String>,
    pub user_prompt: Option<String>,
    /// Overrides `calls.task_timeout_secs`.
    pub timeout: Option<Duration>,
    /// Run calls one at a time; a failing call is reported inline and the rest continue.
    pub sequential: bool,
}

impl CallOptions {
    pub fn new(provider: impl Into<Provider>) -> Self {
        Self {
            provider: provider.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_user_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.user_prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }
}

enum Transport {
    Socket {
        connection: LlmConnection,
        bridge: Arc<CallBridge>,
    },
    Http,
}

/// Consumer-side client: fetches toolkit context for a provider and executes
/// the provider's tool calls on the remote toolkit.
pub struct LlmClient {
    config: AtpConfig,
    http: reqwest::Client,
    transport: Transport,
}

impl LlmClient {
    /// Build a client for `config.protocol`. Over WebSocket this connects and
    /// authenticates before returning.
    pub async fn connect(config: AtpConfig) -> Result<Self> {
        let transport = match config.protocol {
            TransportProtocol::Ws => {
                let bridge = Arc::new(CallBridge::new());
                let connection =
                    LlmConnection::connect(LlmSettings::from_config(&config)?, Arc::clone(&bridge))
                        .await?;
                Transport::Socket { connection, bridge }
            },
            TransportProtocol::Http => Transport::Http,
        };
        Ok(Self {
            config,
            http: reqwest::Client::new(),
            transport,
        })
    }

    pub fn config(&self) -> &AtpConfig {
        &self.config
    }

    /// Whether the client can currently send. Always true over HTTP.
    pub fn is_connected(&self) -> bool {
        match &self.transport {
            Transport::Socket { connection, .. } => connection.is_connected(),
            Transport::Http => true,
        }
    }

    /// Provider-ready tool schemas and instructions for `toolkit_id`.
    pub async fn get_toolkit_context(
        &self,
        toolkit_id: &str,
        user_prompt: &str,
        provider: &Provider,
    ) -> Result<Value> {
        let timeout = self.config.calls.context_timeout();
        match &self.transport {
            Transport::Socket { connection, bridge } => {
                let request_id = format!("context_{toolkit_id}_{}", uuid::Uuid::new_v4());
                let frame = LlmFrame::GetToolkitContext {
                    toolkit_id: toolkit_id.to_string(),
                    request_id: request_id.clone(),
                    provider: provider.to_string(),
                    user_prompt: user_prompt.to_string(),
                };
                bridge
                    .call(&request_id, timeout, async { connection.send(&frame) })
                    .await
            },
            Transport::Http => {
                let request_id = uuid::Uuid::new_v4().to_string();
                let frame = LlmFrame::GetToolkitContext {
                    toolkit_id: toolkit_id.to_string(),
                    request_id: request_id.clone(),
                    provider: provider.to_string(),
                    user_prompt: user_prompt.to_string(),
                };
                let mut body = self.post_process(&request_id, &frame, timeout).await?;
                Ok(body
                    .get_mut("payload")
                    .map(Value::take)
                    .unwrap_or_else(|| Value::Object(Default::default())))
            },
        }
    }

    /// Execute provider tool calls on `toolkit_id`.
    ///
    /// Results keep the input order. Concurrent mode fails as a whole on the
    /// first error (e.g. [`Error::CallTimeout`]); sequential mode records
    /// `{"error": …}` for the failing call and carries on.
    pub async fn call_tool(
        &self,
        toolkit_id: &str,
        tool_calls: &[Value],
        options: &CallOptions,
    ) -> Result<Vec<ToolCallResult>> {
        if tool_calls.is_empty() {
            warn!(toolkit = toolkit_id, "no tool calls provided");
            return Ok(Vec::new());
        }
        let formatted = format_tool_calls(tool_calls, &options.provider);
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.calls.task_timeout());
        info!(
            toolkit = toolkit_id,
            calls = formatted.len(),
            sequential = options.sequential,
            "executing tool calls"
        );

        if options.sequential {
            let mut results = Vec::with_capacity(formatted.len());
            for (i, call) in formatted.into_iter().enumerate() {
                let tool_call_id = call_id(&call, i);
                let result = match self.execute(toolkit_id, i, call, options, timeout).await {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(toolkit = toolkit_id, %tool_call_id, error = %e, "tool call failed");
                        serde_json::json!({ "error": e.to_string() })
                    },
                };
                results.push(ToolCallResult {
                    tool_call_id,
                    result,
                });
            }
            Ok(results)
        } else {
            try_join_all(formatted.into_iter().enumerate().map(|(i, call)| async move {
                let tool_call_id = call_id(&call, i);
                let result = self.execute(toolkit_id, i, call, options, timeout).await?;
                Ok::<_, Error>(ToolCallResult {
                    tool_call_id,
                    result,
                })
            }))
            .await
        }
    }

    async fn execute(
        &self,
        toolkit_id: &str,
        index: usize,
        call: FormattedToolCall,
        options: &CallOptions,
        timeout: Duration,
    ) -> Result<Value> {
        let request_id = format!("task_{toolkit_id}_{index}_{}", uuid::Uuid::new_v4());
        let frame = LlmFrame::TaskRequest(TaskRequest {
            toolkit_id: toolkit_id.to_string(),
            request_id: request_id.clone(),
            payload: serde_json::to_value(&call)?,
            provider: options.provider.to_string(),
            auth_token: options.auth_token.clone(),
            user_prompt: options.user_prompt.clone(),
        });

        match &self.transport {
            Transport::Socket { connection, bridge } => {
                bridge
                    .call(&request_id, timeout, async { connection.send(&frame) })
                    .await
            },
            Transport::Http => {
                let mut body = self.post_process(&request_id, &frame, timeout).await?;
                Ok(match body.get_mut("payload") {
                    Some(payload) => payload.take(),
                    None => body,
                })
            },
        }
    }

    /// Execute the first tool call and stream the backend's SSE events.
    ///
    /// HTTP only. An empty `tool_calls` yields an empty stream.
    pub async fn call_tool_streaming(
        &self,
        toolkit_id: &str,
        tool_calls: &[Value],
        options: &CallOptions,
    ) -> Result<EventStream> {
        if !matches!(self.transport, Transport::Http) {
            return Err(Error::StreamingUnsupported);
        }
        let Some(call) = format_tool_calls(tool_calls, &options.provider)
            .into_iter()
            .next()
        else {
            warn!(toolkit = toolkit_id, "no tool calls provided");
            return Ok(Box::pin(futures::stream::empty::<Result<Value>>()));
        };

        let frame = LlmFrame::TaskRequest(TaskRequest {
            toolkit_id: toolkit_id.to_string(),
            request_id: format!("task_{toolkit_id}_{}", uuid::Uuid::new_v4()),
            payload: serde_json::to_value(&call)?,
            provider: options.provider.to_string(),
            auth_token: options.auth_token.clone(),
            user_prompt: options.user_prompt.clone(),
        });
        let mut request = self
            .http
            .post(self.process_url())
            .header(API_KEY_HEADER, self.config.api_key.expose_secret())
            .header("Accept", "application/json")
            .header("Cache-Control", "no-cache")
            .json(&frame);
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Backend {
                status: status.as_u16(),
                body,
            });
        }
        Ok(sse::events(resp))
    }

    /// Close the socket, failing any pending calls. No-op over HTTP.
    pub async fn close(&self) {
        if let Transport::Socket { connection, .. } = &self.transport {
            connection.close().await;
        }
    }

    fn process_url(&self) -> String {
        format!("{}{}", self.config.http_base(), paths::LLM_PROCESS)
    }

    async fn post_process(
        &self,
        request_id: &str,
        frame: &LlmFrame,
        timeout: Duration,
    ) -> Result<Value> {
        let resp = self
            .http
            .post(self.process_url())
            .header(API_KEY_HEADER, self.config.api_key.expose_secret())
            .timeout(timeout)
            .json(frame)
            .send()
            .await
            .map_err(|e| timeout_or_http(e, request_id, timeout))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Backend {
                status: status.as_u16(),
                body,
            });
        }
        let text = resp
            .text()
            .await
            .map_err(|e| timeout_or_http(e, request_id, timeout))?;
        serde_json::from_str(&text)
            .with_context(|| format!("unexpected response from {}", paths::LLM_PROCESS))
    }
}

fn timeout_or_http(e: reqwest::Error, request_id: &str, timeout: Duration) -> Error {
    if e.is_timeout() {
        Error::CallTimeout {
            request_id: request_id.to_string(),
            timeout,
        }
    } else {
        Error::Http(e)
    }
}

fn call_id(call: &FormattedToolCall, index: usize) -> String {
    if call.id.is_empty() {
        format!("call_{index}")
    } else {
        call.id.clone()
    }
}
