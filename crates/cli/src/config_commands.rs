use {
    anyhow::Result,
    atp_config::{
        AtpConfig,
        validate::{self, Severity},
    },
    clap::Subcommand,
};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the effective configuration and report errors/warnings.
    Check,
    /// Print the effective configuration as TOML (API key redacted).
    Show,
}

pub fn handle_config(config: &AtpConfig, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Check => check(config),
        ConfigAction::Show => show(config),
    }
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(config: &AtpConfig) -> Result<()> {
    match atp_config::find_config_file() {
        Some(path) => eprintln!("Checking {}\n", path.display()),
        None => eprintln!("No config file found; checking defaults and ATP_* variables.\n"),
    }

    let result = validate::validate(config);
    for d in &result.diagnostics {
        let color = match d.severity {
            Severity::Error => RED,
            Severity::Warning => YELLOW,
        };
        eprintln!("  {BOLD}{color}{}{RESET} {}: {}", d.severity, d.path, d.message);
    }

    let errors = result
        .diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .count();
    let warnings = result.diagnostics.len() - errors;
    if result.diagnostics.is_empty() {
        eprintln!("No issues found.");
    } else {
        eprintln!("\n{errors} error(s), {warnings} warning(s)");
    }

    if result.has_errors() {
        std::process::exit(1);
    }
    Ok(())
}

fn show(config: &AtpConfig) -> Result<()> {
    let mut redacted = config.clone();
    if config.has_api_key() {
        redacted.api_key = secrecy::Secret::new("[REDACTED]".into());
    }
    print!("{}", toml::to_string_pretty(&redacted)?);
    Ok(())
}
