use anyhow::Result;
use gramhands::agent::{AgentConfig, AgentManager, HashtagWorkSpec, PromptPreset, WorkItemSpec, WorkSpec};
use gramhands::browser::{BrowserConfig, ChromiumLauncher};
use gramhands::generator::{GeneratorClient, GeneratorConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let launcher = ChromiumLauncher::new(BrowserConfig {
        headless: false,
        user_agent: None,
    });
    let generator = Arc::new(GeneratorClient::new(GeneratorConfig::default())?);
    let manager = Arc::new(AgentManager::new(launcher, generator));

    let config = AgentConfig {
        username: std::env::var("GRAMHANDS_USERNAME").unwrap_or_default(),
        password: std::env::var("GRAMHANDS_PASSWORD").unwrap_or_default(),
        prompt: PromptPreset::Friendly,
        ..AgentConfig::default()
    };
    let work = WorkSpec {
        feed: WorkItemSpec {
            enabled: true,
            count: 3,
        },
        hashtag: HashtagWorkSpec {
            enabled: true,
            count: 2,
            hashtags: vec!["photography".into(), "travel".into()],
        },
        ..WorkSpec::default()
    };

    // tail the status stream while the agent works
    let mut status_rx = manager.subscribe();
    let printer = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow().clone();
            if let Some(last) = status.logs.last() {
                let details = last
                    .details
                    .as_deref()
                    .map(|d| format!(": {d}"))
                    .unwrap_or_default();
                println!("[{}] {}{}", last.timestamp.format("%H:%M:%S"), last.action, details);
            }
        }
    });

    manager.start(config, work).await?;
    tokio::signal::ctrl_c().await?;
    manager.stop().await;
    printer.abort();
    Ok(())
}
