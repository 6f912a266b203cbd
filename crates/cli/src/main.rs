mod config_commands;
mod llm_commands;
mod oauth_commands;
mod serve_commands;

use std::path::PathBuf;

use {
    atp_config::{AtpConfig, TransportProtocol},
    clap::{Parser, Subcommand},
    secrecy::Secret,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "atp", about = "Agent Tool Protocol client", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (defaults to ./atp.toml, then ~/.config/atp/).
    #[arg(long, global = true, env = "ATP_CONFIG")]
    config: Option<PathBuf>,

    /// Backend base URL (overrides config value).
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Transport: ws or http (overrides config value).
    #[arg(long, global = true)]
    protocol: Option<TransportProtocol>,

    /// API key (overrides config value).
    #[arg(long, global = true)]
    api_key: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Host the built-in demo tools until interrupted.
    Serve(serve_commands::ServeArgs),
    /// Fetch provider-ready context for a toolkit.
    Context(llm_commands::ContextArgs),
    /// Execute provider tool calls on a remote toolkit.
    Call(llm_commands::CallArgs),
    /// OAuth connections brokered by the backend.
    Oauth {
        #[command(subcommand)]
        action: oauth_commands::OAuthAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Load the config file (or defaults) and apply command-line overrides.
fn load_config(cli: &Cli) -> anyhow::Result<AtpConfig> {
    let mut config = match &cli.config {
        Some(path) => atp_config::load_config(path)?,
        None => atp_config::discover_and_load(),
    };
    if let Some(url) = &cli.base_url {
        config.base_url.clone_from(url);
    }
    if let Some(protocol) = cli.protocol {
        config.protocol = protocol;
    }
    if let Some(key) = &cli.api_key {
        config.api_key = Secret::new(key.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);
    atp_common::install_crypto_provider();

    let config = load_config(&cli)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        protocol = %config.protocol,
        "atp starting"
    );

    match cli.command {
        Commands::Serve(args) => serve_commands::handle_serve(config, args).await,
        Commands::Context(args) => llm_commands::handle_context(config, args).await,
        Commands::Call(args) => llm_commands::handle_call(config, args).await,
        Commands::Oauth { action } => oauth_commands::handle_oauth(config, action).await,
        Commands::Config { action } => config_commands::handle_config(&config, action),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, secrecy::ExposeSecret};

    #[test]
    fn cli_overrides_apply_on_top_of_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atp.toml");
        std::fs::write(&path, "app_name = \"billing\"\nbase_url = \"https://a.example\"\n")
            .unwrap();

        let cli = Cli::try_parse_from([
            "atp",
            "--config",
            path.to_str().unwrap(),
            "--protocol",
            "https",
            "--api-key",
            "k-1",
            "config",
            "check",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.app_name, "billing");
        assert_eq!(config.base_url, "https://a.example");
        assert_eq!(config.protocol, TransportProtocol::Http);
        assert_eq!(config.api_key.expose_secret(), "k-1");
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert!(Cli::try_parse_from(["atp", "--protocol", "grpc", "config", "check"]).is_err());
    }
}
