// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vector_agent::{Agent, AgentConfig, Daemon};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vector_agent=info".into()),
        )
        .init();

    let config = load_config()?;
    info!(
        "Starting vector agent, index path {} (read replica: {})",
        config.index_path.display(),
        config.is_read_replica
    );

    let daemon_config = config.daemon.clone();
    let agent = Arc::new(Agent::new(config).await.context("failed to open index")?);
    info!("Index ready with {} objects", agent.len());

    let mut daemon = Daemon::start(agent.clone(), daemon_config);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(e) = daemon.errors().recv() => error!("daemon error: {}", e),
        }
    }

    let mut remaining = daemon.shutdown().await;
    while let Ok(e) = remaining.try_recv() {
        warn!("unreported daemon error: {}", e);
    }

    agent
        .close(&CancellationToken::new())
        .await
        .context("failed to close index")?;
    info!("Agent shutdown complete");
    Ok(())
}

fn load_config() -> Result<AgentConfig> {
    match std::env::var("VECTOR_AGENT_CONFIG") {
        Ok(path) => AgentConfig::from_file(&path)
            .with_context(|| format!("failed to load configuration from {}", path)),
        Err(_) => Ok(AgentConfig::from_env()),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
