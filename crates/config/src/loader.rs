use std::path::{Path, PathBuf};

use {
    secrecy::Secret,
    tracing::{debug, warn},
};

use crate::{env_subst::substitute_env, schema::AtpConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["atp.toml", "atp.yaml", "atp.yml", "atp.json"];

/// Load config from the given path (any supported format).
///
/// `${ENV}` placeholders are substituted and `ATP_*` overrides applied.
pub fn load_config(path: &Path) -> anyhow::Result<AtpConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    let mut config = parse_config(&raw, path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./atp.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/atp/atp.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to defaults (plus env overrides) when nothing is found or the
/// file fails to parse.
pub fn discover_and_load() -> AtpConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    let mut config = AtpConfig::default();
    apply_env_overrides(&mut config);
    config
}

/// First config file present in the standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// The user-global config directory (`~/.config/atp/` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "atp").map(|d| d.config_dir().to_path_buf())
}

/// Apply `ATP_API_KEY`, `ATP_APP_NAME`, `ATP_BASE_URL` and `ATP_PROTOCOL`.
pub fn apply_env_overrides(config: &mut AtpConfig) {
    apply_overrides_with(config, |name| std::env::var(name).ok());
}

fn apply_overrides_with(config: &mut AtpConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(key) = lookup("ATP_API_KEY").filter(|v| !v.is_empty()) {
        config.api_key = Secret::new(key);
    }
    if let Some(name) = lookup("ATP_APP_NAME").filter(|v| !v.is_empty()) {
        config.app_name = name;
    }
    if let Some(url) = lookup("ATP_BASE_URL").filter(|v| !v.is_empty()) {
        config.base_url = url;
    }
    if let Some(raw) = lookup("ATP_PROTOCOL") {
        match raw.parse() {
            Ok(protocol) => config.protocol = protocol,
            Err(e) => warn!(error = %e, "ignoring ATP_PROTOCOL override"),
        }
    }
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<AtpConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
