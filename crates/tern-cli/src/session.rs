use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;

use tern::agent::Agent;
use tern::providers::configs::{OpenAiProviderConfig, ProviderConfig};
use tern::providers::factory::get_provider;
use tern::registry::ToolRegistry;
use tern::toolkit::developer::DeveloperToolkit;
use tern::toolkit::remote::RemoteToolkit;

use crate::config::Profile;
use crate::Cli;

/// One run's worth of wiring: the agent plus the remote sessions whose
/// lifetime it shares. Once `build` succeeds, `close` runs on every exit
/// path; a build failure shuts down whatever had already been opened.
pub struct Session {
    agent: Agent,
    remotes: Vec<Arc<RemoteToolkit>>,
}

impl Session {
    pub async fn build(cli: &Cli, profile: Profile) -> Result<Self> {
        let provider = get_provider(ProviderConfig::OpenAi(provider_config(cli, &profile)?))?;

        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(DeveloperToolkit::new()))
            .context("Failed to register the developer toolkit")?;

        let mut remotes: Vec<Arc<RemoteToolkit>> = Vec::new();
        for server in profile.servers {
            let name = server.name.clone();
            let toolkit = Arc::new(RemoteToolkit::new(server));

            if let Err(err) = bring_up(&mut registry, &toolkit).await {
                // The run must not start with a partial tool catalog.
                toolkit.close().await;
                for remote in &remotes {
                    remote.close().await;
                }
                return Err(err.context(format!("Failed to bring up tool server '{name}'")));
            }

            println!(
                "{}",
                style(format!("connected to tool server '{name}'")).dim()
            );
            remotes.push(toolkit);
        }

        let mut agent = Agent::new(provider, registry).with_max_iterations(cli.max_iterations);
        if let Some(seconds) = cli.tool_timeout {
            agent = agent.with_tool_timeout(Duration::from_secs(seconds));
        }

        Ok(Self { agent, remotes })
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Release every remote session, regardless of how the run went.
    pub async fn close(&self) {
        for remote in &self.remotes {
            remote.close().await;
        }
    }
}

async fn bring_up(registry: &mut ToolRegistry, toolkit: &Arc<RemoteToolkit>) -> Result<()> {
    toolkit.open().await?;
    registry.register(toolkit.clone())?;
    Ok(())
}

fn provider_config(cli: &Cli, profile: &Profile) -> Result<OpenAiProviderConfig> {
    let api_key = cli
        .api_key
        .clone()
        .or_else(|| env::var("OPENAI_API_KEY").ok())
        .context("API key must be provided via --api-key or OPENAI_API_KEY environment variable")?;

    let host = cli
        .host
        .clone()
        .or_else(|| env::var("OPENAI_HOST").ok())
        .or_else(|| profile.provider.host.clone())
        .unwrap_or_else(|| "https://api.openai.com".to_string());

    let model = cli
        .model
        .clone()
        .or_else(|| env::var("OPENAI_MODEL").ok())
        .or_else(|| profile.provider.model.clone())
        .unwrap_or_else(|| "gpt-4o-mini".to_string());

    Ok(OpenAiProviderConfig {
        host,
        api_key,
        model,
        temperature: profile.provider.temperature,
        max_tokens: profile.provider.max_tokens,
    })
}
