//! Configuration loading, env substitution, overrides, and validation.
//!
//! Config files: `atp.toml`, `atp.yaml`, `atp.yml`, or `atp.json`.
//! Searched in `./` then the user config directory (`~/.config/atp/`).
//!
//! `${ENV_VAR}` placeholders are substituted before parsing, and `ATP_*`
//! environment variables override individual fields afterwards.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{
        apply_env_overrides, config_dir, discover_and_load, find_config_file, load_config,
    },
    schema::{
        AtpConfig, CallsConfig, InboxConfig, KeepaliveConfig, OAuthPollConfig, ReconnectConfig,
        TransportProtocol,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
