//! Validates inbound invocations, injects credentials and runs handlers
//! on their own tasks.

use std::{any::Any, sync::Arc, time::Duration};

use {
    serde_json::{Value, json},
    tokio::sync::mpsc,
    tokio_util::task::TaskTracker,
    tracing::{debug, info, warn},
};

use atp_protocol::{InboxResponse, ToolOutcome, ToolRequest, ToolResponseFrame};

use crate::{
    auth::AuthInjector,
    error::{Error, Result},
    registry::{ToolArgs, ToolDescriptor, ToolRegistry},
};

#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub request_id: String,
    pub tool_name: String,
    pub params: ToolArgs,
    pub auth_token: Option<String>,
    pub user_id: Option<String>,
}

impl InvocationRequest {
    pub fn new(request_id: impl Into<String>, tool_name: impl Into<String>, params: ToolArgs) -> Self {
        Self {
            request_id: request_id.into(),
            tool_name: tool_name.into(),
            params,
            auth_token: None,
            user_id: None,
        }
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

impl From<ToolRequest> for InvocationRequest {
    fn from(req: ToolRequest) -> Self {
        Self {
            request_id: req.request_id,
            tool_name: req.tool_name,
            params: req.params,
            auth_token: req.auth_token,
            user_id: req.user_id,
        }
    }
}

/// Outcome of one invocation, correlated by `request_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult {
    pub request_id: String,
    pub outcome: ToolOutcome,
}

impl InvocationResult {
    pub fn success(request_id: impl Into<String>, value: Value) -> Self {
        Self {
            request_id: request_id.into(),
            outcome: ToolOutcome::Result(value),
        }
    }

    pub fn failure(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            outcome: ToolOutcome::Error(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Result(_))
    }

    pub fn into_frame(self) -> ToolResponseFrame {
        ToolResponseFrame::new(self.request_id, self.outcome)
    }

    /// Inbox mode carries the error inside the response value.
    pub fn into_inbox_response(self) -> InboxResponse {
        let response = match self.outcome {
            ToolOutcome::Result(value) => value,
            ToolOutcome::Error(message) => json!({ "error": message }),
        };
        InboxResponse {
            request_id: self.request_id,
            response,
        }
    }
}

/// Shared by the socket and inbox runners. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    injector: AuthInjector,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, injector: AuthInjector) -> Self {
        Self {
            registry,
            injector,
            tracker: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Lookup, required-parameter check and auth injection.
    pub fn prepare(&self, req: &InvocationRequest) -> Result<(Arc<ToolDescriptor>, ToolArgs)> {
        let tool = self.registry.lookup(&req.tool_name)?;

        if let Some(missing) = tool
            .required_parameters
            .iter()
            .find(|name| !req.params.contains_key(name.as_str()))
        {
            return Err(Error::MissingParameter {
                name: missing.clone(),
            });
        }

        let mut args = req.params.clone();
        if let Some(auth) = &tool.auth {
            self.injector.inject(auth, req, &mut args)?;
        }
        Ok((tool, args))
    }

    /// Run one invocation to completion. Never fails: every error, including
    /// a handler panic, becomes an error result.
    pub async fn dispatch(&self, req: InvocationRequest) -> InvocationResult {
        let request_id = req.request_id.clone();
        let (tool, args) = match self.prepare(&req) {
            Ok(prepared) => prepared,
            Err(e) => {
                info!(request_id = %request_id, tool = %req.tool_name, error = %e, "rejected tool request");
                return InvocationResult::failure(request_id, e.to_string());
            },
        };

        debug!(request_id = %request_id, tool = %tool.name, "executing tool");
        let handler = tool.handler();
        match tokio::spawn(async move { handler.call(args).await }).await {
            Ok(Ok(value)) => InvocationResult::success(request_id, value),
            Ok(Err(e)) => {
                let failure = Error::HandlerFailure {
                    message: e.to_string(),
                };
                warn!(request_id = %request_id, tool = %tool.name, error = %e, "tool failed");
                InvocationResult::failure(request_id, failure.to_string())
            },
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    format!("Tool panicked: {}", panic_message(join_err.into_panic()))
                } else {
                    "Tool execution cancelled".to_string()
                };
                warn!(request_id = %request_id, tool = %tool.name, %message, "tool aborted");
                InvocationResult::failure(request_id, message)
            },
        }
    }

    /// Run an invocation on its own task and send the result to `results`.
    pub fn spawn(&self, req: InvocationRequest, results: mpsc::UnboundedSender<InvocationResult>) {
        let this = self.clone();
        self.tracker.spawn(async move {
            let result = this.dispatch(req).await;
            if results.send(result).is_err() {
                debug!("result channel closed, dropping invocation result");
            }
        });
    }

    /// Number of spawned invocations still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `grace` for spawned invocations. Returns `true` if all finished.
    ///
    /// The dispatcher keeps accepting work afterwards.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        let finished = tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok();
        self.tracker.reopen();
        finished
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
