use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use telemon_agent::agent::Agent;
use telemon_agent::config::{AgentArgs, AgentConfig};
use telemon_agent::sender::HttpSender;
use telemon_collector::runtime::RuntimeCollector;
use telemon_collector::system::SystemCollector;
use telemon_common::build_info::BuildInfo;
use telemon_storage::memory::MemStorage;
use telemon_storage::Storage;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::from_args(AgentArgs::parse())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("telemon={}", config.log_level).parse()?),
        )
        .init();

    BuildInfo::current(env!("CARGO_PKG_VERSION")).log("telemon-agent");

    let sender = HttpSender::from_config(&config)?;
    tracing::info!(
        url = %sender.url(),
        signed = config.hash_key().is_some(),
        encrypted = config.crypto_key.is_some(),
        "telemon-agent starting"
    );

    let storage: Arc<dyn Storage> = Arc::new(MemStorage::new(tracing::info_span!("cache")));
    let agent = Agent::new(storage.clone(), Arc::new(sender), tracing::info_span!("agent"))
        .with_collector(Arc::new(RuntimeCollector::new(storage.clone())))
        .with_collector(Arc::new(SystemCollector::new(storage)))
        .with_intervals(config.poll_interval(), config.report_interval())
        .with_rate_limit(config.rate_limit);

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutting down gracefully");
                shutdown.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    agent.run(token).await
}
