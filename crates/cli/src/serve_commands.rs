use std::sync::Arc;

use {
    anyhow::Result,
    atp_config::AtpConfig,
    atp_toolkit::{ParamType, ToolDescriptor, ToolkitClient, instances},
    clap::Args,
    serde_json::json,
    tracing::{info, warn},
};

#[derive(Args)]
pub struct ServeArgs {
    /// Toolkit name announced to the backend (overrides `app_name`).
    #[arg(long)]
    pub name: Option<String>,
}

/// Tools hosted by `atp serve`.
pub fn demo_tools() -> Result<Vec<ToolDescriptor>> {
    let echo = ToolDescriptor::builder("echo")
        .description("Return the given text unchanged.")
        .required_param("text", ParamType::String)
        .handler(|args: atp_toolkit::ToolArgs| async move {
            Ok(json!({ "text": args.get("text").cloned().unwrap_or_default() }))
        })
        .build()?;

    let add = ToolDescriptor::builder("add")
        .description("Add two numbers.")
        .required_param("a", ParamType::Number)
        .required_param("b", ParamType::Number)
        .blocking_handler(|args| {
            let a = args.get("a").and_then(|v| v.as_f64());
            let b = args.get("b").and_then(|v| v.as_f64());
            match (a, b) {
                (Some(a), Some(b)) => Ok(json!(a + b)),
                _ => anyhow::bail!("a and b must be numbers"),
            }
        })
        .build()?;

    Ok(vec![echo, add])
}

pub async fn handle_serve(mut config: AtpConfig, args: ServeArgs) -> Result<()> {
    if let Some(name) = args.name {
        config.app_name = name;
    }
    let name = config.app_name.clone();
    let client = Arc::new(ToolkitClient::new(config));
    for tool in demo_tools()? {
        client.register_tool(tool)?;
    }
    instances::register_client(&name, Arc::clone(&client));

    client.start()?;
    info!(toolkit = %name, tools = client.registry().len(), "serving tools, press Ctrl-C to stop");

    let outcome = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "failed to listen for Ctrl-C");
            }
            client.stop().await;
            Ok(())
        },
        res = client.wait() => res,
    };
    instances::remove_client(&name);
    outcome.map_err(Into::into)
}
