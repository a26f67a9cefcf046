//! Minimal coding-agent wiring: one session over the Anthropic adapter
//! with the builtin toolset, working against the current directory.
//!
//! ```sh
//! ANTHROPIC_API_KEY=... cargo run --example coder -- "add a README"
//! ```

use std::sync::Arc;

use kestrel::LLMClient;
use kestrel::providers::anthropic::{AnthropicConfig, AnthropicMessages};
use kestrel_agent::config::SessionConfig;
use kestrel_agent::env::LocalEnv;
use kestrel_agent::profile::Profile;
use kestrel_agent::session::Session;
use kestrel_agent::subagent::register_subagent_tools;
use kestrel_agent::tools::ToolRegistry;
use kestrel_agent::tools::builtins::register_builtins;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let api_key = std::env::var("ANTHROPIC_API_KEY")?;
    let task = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "describe this repository".to_string());

    let client = Arc::new(
        LLMClient::builder()
            .provider(Arc::new(AnthropicMessages::new(AnthropicConfig {
                api_key,
                base_url: None,
            })))
            .build(),
    );
    let registry = Arc::new(ToolRegistry::new());
    register_builtins(&registry)?;
    register_subagent_tools(&registry)?;

    let mut profile = Profile::new("anthropic", "claude-sonnet-4-5");
    profile.supports_parallel_tool_calls = true;

    let session = Session::new(
        SessionConfig::default(),
        Arc::new(profile),
        Arc::new(LocalEnv::new(std::env::current_dir()?)),
        client,
        registry,
    )
    .await;

    let mut events = session.take_events().expect("first take");
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!(
                "[{}] {}",
                event.kind.name(),
                serde_json::to_string(&event.kind).unwrap_or_default()
            );
        }
    });

    let cancel = CancellationToken::new();
    let output = session.process_input(&cancel, &task).await?;
    println!("\n{}", output);

    session.close().await;
    let _ = printer.await;
    Ok(())
}
