use {
    anyhow::Result,
    atp_config::AtpConfig,
    atp_oauth::{OAuthCoordinator, TokenPair},
    clap::Subcommand,
    secrecy::ExposeSecret,
    tokio_util::sync::CancellationToken,
    tracing::warn,
};

#[derive(Subcommand)]
pub enum OAuthAction {
    /// Start an OAuth connection and wait until the user completes it.
    Connect {
        /// Platform id configured on the backend (e.g. "hubspot").
        #[arg(long)]
        platform: String,
        /// Your identifier for the end user.
        #[arg(long)]
        user: String,
        /// Where the provider sends the user after consent.
        #[arg(long)]
        redirect_url: String,
        /// Print the access token once connected.
        #[arg(long)]
        show_token: bool,
    },
    /// Show the current status of a connection.
    Status {
        #[arg(long)]
        platform: String,
        #[arg(long)]
        user: String,
    },
    /// Fetch the tokens of a completed connection.
    Tokens {
        #[arg(long)]
        platform: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        show_token: bool,
    },
}

pub async fn handle_oauth(config: AtpConfig, action: OAuthAction) -> Result<()> {
    let coordinator = OAuthCoordinator::from_config(&config);
    match action {
        OAuthAction::Connect {
            platform,
            user,
            redirect_url,
            show_token,
        } => {
            let url = coordinator.initiate(&platform, &user, &redirect_url).await?;
            println!("Visit this URL to authorize:\n{url}");
            println!("Waiting for authorization (Ctrl-C to abort)...");

            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            let watcher = tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                    return;
                }
                on_ctrl_c.cancel();
            });

            let integration = coordinator
                .wait_for_connection(
                    &platform,
                    &user,
                    config.oauth.poll_interval(),
                    config.oauth.timeout(),
                    &cancel,
                )
                .await;
            watcher.abort();
            let integration_id = integration?;
            println!("Connected (integration {integration_id})");

            let tokens = coordinator.get_user_tokens(&platform, &user).await?;
            print_tokens(&tokens, show_token);
        },
        OAuthAction::Status { platform, user } => {
            let status = coordinator.status(&platform, &user).await?;
            match status.integration_id {
                Some(id) => println!("{:?} (integration {id})", status.status),
                None => println!("{:?}", status.status),
            }
        },
        OAuthAction::Tokens {
            platform,
            user,
            show_token,
        } => {
            let tokens = coordinator.get_user_tokens(&platform, &user).await?;
            print_tokens(&tokens, show_token);
        },
    }
    Ok(())
}

fn print_tokens(tokens: &TokenPair, show_token: bool) {
    if show_token {
        println!("access_token: {}", tokens.access_token.expose_secret());
    } else {
        println!("access_token: [REDACTED]");
    }
    println!(
        "refresh_token: {}",
        if tokens.refresh_token.is_some() { "present" } else { "none" }
    );
    match tokens.expires_at {
        Some(at) => println!("expires_at: {at}"),
        None => println!("expires_at: never"),
    }
}
