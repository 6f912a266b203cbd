//! LLM-side ATP client.
//!
//! [`LlmClient`] fetches provider-ready toolkit context and executes a
//! provider's tool calls on a remote toolkit, over an authenticated
//! WebSocket (responses correlated by `request_id`) or plain HTTP.

pub mod bridge;
pub mod client;
pub mod connection;
pub mod error;
pub mod format;
pub mod sse;

pub use {
    bridge::CallBridge,
    client::{CallOptions, LlmClient},
    connection::{LlmConnection, LlmSettings},
    error::{Error, Result},
    format::{Provider, format_tool_call, format_tool_calls},
    sse::EventStream,
};
