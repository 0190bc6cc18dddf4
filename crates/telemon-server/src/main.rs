use anyhow::Result;
use clap::Parser;
use telemon_common::build_info::BuildInfo;
use telemon_server::app;
use telemon_server::config::{ServerArgs, ServerConfig};
use telemon_server::persist::spawn_persist_loop;
use telemon_server::service::MetricService;
use telemon_server::state::AppState;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::from_args(ServerArgs::parse())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("telemon={}", config.log_level).parse()?),
        )
        .init();

    BuildInfo::current(env!("CARGO_PKG_VERSION")).log("telemon-server");

    let storage =
        telemon_storage::open(&config.storage_config(), tracing::info_span!("storage")).await?;
    let state = AppState::new(config.clone(), MetricService::new(storage.clone()))?;

    let token = CancellationToken::new();
    let persist_handle = match config.store_interval() {
        Some(every) if storage.backend() == "memory" => {
            Some(spawn_persist_loop(storage.clone(), every, token.clone()))
        }
        _ => None,
    };

    let listener = tokio::net::TcpListener::bind(&config.address).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        backend = storage.backend(),
        signed = state.hash_key.is_some(),
        encrypted = state.decryptor.is_some(),
        trusted_subnet = ?state.trusted_subnet,
        "Server started"
    );

    let app = app::build_http_app(state);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "HTTP server error");
    }

    token.cancel();
    if let Some(handle) = persist_handle {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Snapshot task failed");
        }
    }
    if let Err(e) = storage.persist().await {
        tracing::error!(error = %e, "Final snapshot failed");
    }
    storage.close().await?;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutting down gracefully");
}
