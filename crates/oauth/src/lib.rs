//! OAuth connection broker.
//!
//! The backend owns the third-party OAuth dance; this crate starts it, polls
//! for completion and keeps the resulting tokens in a shared [`TokenCache`]
//! that the toolkit's auth injector reads from.

pub mod cache;
pub mod coordinator;
pub mod error;
pub mod types;

pub use {
    cache::TokenCache,
    coordinator::OAuthCoordinator,
    error::{Error, Result},
    types::{OAuthSession, TokenPair, serialize_option_secret, serialize_secret},
};

pub use atp_protocol::OAuthStatus;
