//! ATP backend wire protocol.
//!
//! Two client roles talk to the backend:
//! - the **toolkit** client hosts tools. It keeps a WebSocket open, announces
//!   its tools and answers `tool_request` messages (or polls an HTTP inbox).
//! - the **LLM** client consumes tools. It asks for toolkit context and
//!   submits `task_request` frames, correlated by `request_id`.
//!
//! The OAuth broker endpoints are plain JSON over HTTP.

use {
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

// ── Constants ────────────────────────────────────────────────────────────────

pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000; // 10s
pub const PING_INTERVAL_SECS: u64 = 30;
pub const PROGRAMMING_LANGUAGE: &str = "Rust";
pub const DEFAULT_BASE_URL: &str = "https://chatatp-backend.onrender.com";
pub const API_KEY_HEADER: &str = "X-ATP-API-Key";

pub mod message_types {
    pub const CLIENT_HELLO: &str = "atp_client_hello";
    pub const CLIENT_CONNECTED: &str = "atp_client_connected";
    pub const REGISTER_TOOLS: &str = "atp_register_tools";
    pub const TOOL_REQUEST: &str = "tool_request";
    pub const TOOL_REQUEST_LEGACY: &str = "atp_tool_request";
    pub const TOOL_RESPONSE: &str = "tool_response";
}

// ── Endpoints ────────────────────────────────────────────────────────────────

pub mod paths {
    pub const REGISTER_TOOL: &str = "/api/v1/register_tool";
    pub const LLM_PROCESS: &str = "/api/v1/atp/llm-client/process/";
    pub const OAUTH_INITIATE: &str = "/api/v1/atp/oauth/initiate/";
    pub const OAUTH_STATUS: &str = "/api/v1/atp/oauth/status/";
    pub const OAUTH_TOKENS: &str = "/api/v1/atp/oauth/tokens/";

    /// Convert an `http(s)://` base address to its `ws(s)://` counterpart.
    ///
    /// Returns `None` for any other scheme.
    pub fn ws_base(base_url: &str) -> Option<String> {
        let base = base_url.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            Some(format!("wss://{rest}"))
        } else if let Some(rest) = base.strip_prefix("http://") {
            Some(format!("ws://{rest}"))
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            Some(base.to_string())
        } else {
            None
        }
    }

    pub fn toolkit_socket(ws_base: &str, api_key: &str) -> String {
        format!(
            "{}/ws/v1/atp/toolkit-client/{api_key}/",
            ws_base.trim_end_matches('/')
        )
    }

    pub fn llm_socket(ws_base: &str, api_key: &str) -> String {
        format!("{}/{api_key}/", ws_base.trim_end_matches('/'))
    }

    pub fn inbox(api_key: &str) -> String {
        format!("/api/v1/toolkit/{api_key}/inbox")
    }

    pub fn inbox_respond(api_key: &str) -> String {
        format!("/api/v1/toolkit/{api_key}/inbox/respond")
    }
}

// ── Toolkit envelope ─────────────────────────────────────────────────────────

/// Generic `{message_type, payload}` envelope used on the toolkit socket.
///
/// Inbound frames are parsed into this first so that unknown message types
/// can be logged and skipped instead of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(message_type: impl Into<String>, payload: impl Serialize) -> serde_json::Result<Self> {
        Ok(Self {
            message_type: message_type.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn is_tool_request(&self) -> bool {
        matches!(
            self.message_type.as_str(),
            message_types::TOOL_REQUEST | message_types::TOOL_REQUEST_LEGACY
        )
    }
}

/// First frame sent by a toolkit client after the socket opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub api_key: String,
    pub app_name: String,
    pub programming_language: String,
    pub client_version: String,
}

/// Backend acknowledgement of [`ClientHello`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConnected {
    #[serde(default)]
    pub message: Option<String>,
}

// ── Tool announcement ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSpec {
    pub provider: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub with: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub type_hint: String,
}

/// One entry of the registration message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolAnnouncement {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
    pub required_parameters: Vec<String>,
    pub auth: Option<AuthSpec>,
}

/// Payload of the `atp_register_tools` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterTools {
    pub app_name: String,
    pub tools: Vec<ToolAnnouncement>,
}

/// Per-tool registration body for `POST /api/v1/register_tool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpToolRegistration {
    pub function_id: String,
    pub api_key: String,
    pub app_name: String,
    pub programming_language: String,
    pub metadata: HttpToolMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpToolMetadata {
    pub params: Vec<String>,
    pub required_params: Vec<String>,
    pub description: String,
    pub auth_provider: Option<String>,
    pub auth_type: Option<String>,
    pub auth_with: Option<String>,
}

// ── Tool invocation ──────────────────────────────────────────────────────────

/// Inbound invocation request (`tool_request` payload, or an inbox item).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// External user the request acts for. Selects the cached OAuth token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Exactly one of a result value or an error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolOutcome {
    Result(Value),
    Error(String),
}

/// Outbound invocation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponseFrame {
    pub r#type: String, // always "tool_response"
    pub request_id: String,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

impl ToolResponseFrame {
    pub fn new(request_id: impl Into<String>, outcome: ToolOutcome) -> Self {
        Self {
            r#type: message_types::TOOL_RESPONSE.into(),
            request_id: request_id.into(),
            outcome,
        }
    }
}

/// Body for `POST /api/v1/toolkit/{api_key}/inbox/respond`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxResponse {
    pub request_id: String,
    pub response: Value,
}

// ── LLM client frames ────────────────────────────────────────────────────────

/// Frames exchanged on the LLM client socket, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LlmFrame {
    Auth {
        api_key: String,
    },
    AuthResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    GetToolkitContext {
        toolkit_id: String,
        request_id: String,
        provider: String,
        user_prompt: String,
    },
    ToolkitContext {
        request_id: String,
        #[serde(default)]
        payload: Value,
    },
    TaskRequest(TaskRequest),
    TaskResponse {
        request_id: String,
        #[serde(default)]
        payload: Value,
    },
}

impl LlmFrame {
    /// Correlation id for frames that answer a pending call.
    pub fn response_id(&self) -> Option<&str> {
        match self {
            Self::ToolkitContext { request_id, .. } | Self::TaskResponse { request_id, .. } => {
                Some(request_id)
            },
            _ => None,
        }
    }
}

/// One tool call submitted for remote execution. Also the HTTP request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub toolkit_id: String,
    pub request_id: String,
    pub payload: Value,
    pub provider: String,
    pub auth_token: Option<String>,
    pub user_prompt: Option<String>,
}

/// Provider tool call normalised to the backend's shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedToolCall {
    pub id: String,
    pub function: String,
    pub arguments: Value,
    pub r#type: String, // always "function"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one executed tool call, keyed by the provider's call id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub tool_call_id: String,
    pub result: Value,
}

// ── OAuth broker ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthInitiateRequest {
    pub platform_id: String,
    pub external_user_id: String,
    pub redirect_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthInitiateResponse {
    pub authorization_url: String,
}

/// Body shared by the status and token endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthUserRequest {
    pub platform_id: String,
    pub external_user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthStatus {
    Pending,
    Completed,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthStatusResponse {
    pub status: OAuthStatus,
    #[serde(default)]
    pub integration_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn ws_base_rewrites_scheme() {
        assert_eq!(
            paths::ws_base("https://atp.example.com/").as_deref(),
            Some("wss://atp.example.com")
        );
        assert_eq!(
            paths::ws_base("http://127.0.0.1:8000").as_deref(),
            Some("ws://127.0.0.1:8000")
        );
        assert!(paths::ws_base("ftp://example.com").is_none());
    }

    #[test]
    fn socket_paths() {
        assert_eq!(
            paths::toolkit_socket("wss://atp.example.com/", "k1"),
            "wss://atp.example.com/ws/v1/atp/toolkit-client/k1/"
        );
        assert_eq!(paths::llm_socket("ws://h:1", "k2"), "ws://h:1/k2/");
        assert_eq!(paths::inbox_respond("k3"), "/api/v1/toolkit/k3/inbox/respond");
    }

    #[test]
    fn tool_request_envelope_accepts_both_type_names() {
        for kind in ["tool_request", "atp_tool_request"] {
            let raw = json!({
                "message_type": kind,
                "payload": {"request_id": "r1", "tool_name": "echo", "params": {"text": "hi"}}
            });
            let envelope: Envelope = serde_json::from_value(raw).unwrap();
            assert!(envelope.is_tool_request());
            let req: ToolRequest = serde_json::from_value(envelope.payload).unwrap();
            assert_eq!(req.request_id, "r1");
            assert_eq!(req.params["text"], "hi");
            assert!(req.auth_token.is_none());
        }
    }

    #[test]
    fn tool_request_params_default_to_empty() {
        let req: ToolRequest =
            serde_json::from_value(json!({"request_id": "r9", "tool_name": "ping"})).unwrap();
        assert!(req.params.is_empty());
    }

    #[test]
    fn tool_response_success_shape() {
        let frame = ToolResponseFrame::new("r1", ToolOutcome::Result(json!({"echo": "hi"})));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"type": "tool_response", "request_id": "r1", "result": {"echo": "hi"}})
        );
    }

    #[test]
    fn tool_response_error_shape() {
        let frame = ToolResponseFrame::new("r2", ToolOutcome::Error("Tool not found".into()));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["error"], "Tool not found");
        assert!(value.get("result").is_none());

        let back: ToolResponseFrame = serde_json::from_value(value).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn announcement_auth_serializes_as_null_or_triple() {
        let tool = ToolAnnouncement {
            name: "send_mail".into(),
            description: "Send a message".into(),
            parameters: vec![ParameterSpec {
                name: "to".into(),
                type_hint: "string".into(),
            }],
            required_parameters: vec!["to".into()],
            auth: Some(AuthSpec {
                provider: "gmail".into(),
                kind: "oauth2".into(),
                with: "access_token".into(),
            }),
        };
        let value = serde_json::to_value(&tool).unwrap();
        assert_eq!(value["auth"]["type"], "oauth2");
        assert_eq!(value["parameters"][0]["type"], "string");

        let bare = ToolAnnouncement { auth: None, ..tool };
        assert!(serde_json::to_value(&bare).unwrap()["auth"].is_null());
    }

    #[test]
    fn llm_frames_are_tagged_by_type() {
        let auth = serde_json::to_value(LlmFrame::Auth {
            api_key: "k".into(),
        })
        .unwrap();
        assert_eq!(auth, json!({"type": "auth", "api_key": "k"}));

        let task = serde_json::to_value(LlmFrame::TaskRequest(TaskRequest {
            toolkit_id: "kit".into(),
            request_id: "task_kit_0_x".into(),
            payload: json!({"function": "echo"}),
            provider: "openai".into(),
            auth_token: None,
            user_prompt: None,
        }))
        .unwrap();
        assert_eq!(task["type"], "task_request");
        assert_eq!(task["toolkit_id"], "kit");

        let resp: LlmFrame = serde_json::from_value(json!({
            "type": "task_response", "request_id": "task_kit_0_x", "payload": {"ok": true}
        }))
        .unwrap();
        assert_eq!(resp.response_id(), Some("task_kit_0_x"));

        let denied: LlmFrame =
            serde_json::from_value(json!({"type": "auth_response", "success": false})).unwrap();
        assert!(denied.response_id().is_none());
    }

    #[test]
    fn oauth_status_parses_lowercase() {
        let resp: OAuthStatusResponse =
            serde_json::from_value(json!({"status": "completed", "integration_id": "int_1"}))
                .unwrap();
        assert_eq!(resp.status, OAuthStatus::Completed);
        assert_eq!(resp.integration_id.as_deref(), Some("int_1"));

        let pending: OAuthStatusResponse =
            serde_json::from_value(json!({"status": "pending"})).unwrap();
        assert_eq!(pending.status, OAuthStatus::Pending);
        assert!(pending.integration_id.is_none());
    }
}
