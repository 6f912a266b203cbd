use std::time::Duration;

use {
    anyhow::{Context, Result},
    atp_config::AtpConfig,
    atp_llm_client::{CallOptions, LlmClient, Provider},
    clap::Args,
    futures::StreamExt,
    serde_json::Value,
};

#[derive(Args)]
pub struct ContextArgs {
    /// Toolkit id as registered with the backend.
    pub toolkit_id: String,
    /// Prompt the context is prepared for.
    #[arg(long, default_value = "")]
    pub prompt: String,
    #[arg(long, default_value = "openai")]
    pub provider: String,
}

#[derive(Args)]
pub struct CallArgs {
    pub toolkit_id: String,
    /// Tool calls as JSON: one call object or an array of them, in the provider's shape.
    pub calls: String,
    #[arg(long, default_value = "openai")]
    pub provider: String,
    /// Access token forwarded to tools that require one.
    #[arg(long)]
    pub auth_token: Option<String>,
    #[arg(long)]
    pub prompt: Option<String>,
    /// Per-call timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,
    /// Run calls one by one, reporting failures inline.
    #[arg(long)]
    pub sequential: bool,
    /// Stream progress events (HTTP only, first call only).
    #[arg(long)]
    pub stream: bool,
}

pub async fn handle_context(config: AtpConfig, args: ContextArgs) -> Result<()> {
    let client = LlmClient::connect(config).await?;
    let provider = Provider::from(args.provider.as_str());
    let context = client
        .get_toolkit_context(&args.toolkit_id, &args.prompt, &provider)
        .await;
    client.close().await;
    println!("{}", serde_json::to_string_pretty(&context?)?);
    Ok(())
}

fn parse_calls(raw: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(raw).context("tool calls must be valid JSON")?;
    Ok(match value {
        Value::Array(calls) => calls,
        single => vec![single],
    })
}

pub async fn handle_call(config: AtpConfig, args: CallArgs) -> Result<()> {
    let calls = parse_calls(&args.calls)?;
    let mut options = CallOptions::new(args.provider.as_str());
    options.auth_token = args.auth_token;
    options.user_prompt = args.prompt;
    options.timeout = args.timeout.map(Duration::from_secs);
    options.sequential = args.sequential;

    let client = LlmClient::connect(config).await?;
    if args.stream {
        let mut events = client
            .call_tool_streaming(&args.toolkit_id, &calls, &options)
            .await?;
        while let Some(event) = events.next().await {
            println!("{}", serde_json::to_string(&event?)?);
        }
        return Ok(());
    }

    let results = client.call_tool(&args.toolkit_id, &calls, &options).await;
    client.close().await;
    println!("{}", serde_json::to_string_pretty(&results?)?);
    Ok(())
}
