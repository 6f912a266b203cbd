//! Shared error plumbing, TLS setup and reconnect backoff used across all atp crates.

pub mod backoff;
pub mod error;
pub mod tls;

pub use {backoff::Backoff, error::FromMessage, tls::install_crypto_provider};
