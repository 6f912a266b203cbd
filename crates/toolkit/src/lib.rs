//! Toolkit side of the Agent Tool Protocol.
//!
//! This crate provides:
//! - the tool registry and descriptor builder (`registry`)
//! - credential injection from requests or the OAuth token cache (`auth`)
//! - concurrent, panic-isolated request dispatch (`dispatcher`)
//! - the WebSocket transport with keepalive and reconnect (`connection`)
//! - the HTTP inbox-polling transport (`inbox`)
//! - the `ToolkitClient` facade and a process-wide client store (`client`, `instances`)

pub mod auth;
pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod inbox;
pub mod instances;
pub mod registry;
pub mod runner;

pub use {
    auth::AuthInjector,
    client::ToolkitClient,
    connection::{ConnectionManager, ConnectionSettings},
    dispatcher::{Dispatcher, InvocationRequest, InvocationResult},
    error::{Error, Result},
    inbox::{InboxPoller, InboxSettings},
    registry::{
        AuthRequirement, ParamType, ParameterDef, ToolArgs, ToolBuilder, ToolDescriptor,
        ToolHandler, ToolList, ToolRegistry,
    },
    runner::{ConnectionState, ToolkitRunner},
};
