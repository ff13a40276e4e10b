// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Background scheduler driving automatic index creation, saving and metric
//! export for an [`Agent`].

use crate::config::DaemonConfig;
use crate::core::error::{AgentError, Result};
use crate::service::agent::Agent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Daemon;

pub struct DaemonHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
    errors: mpsc::Receiver<AgentError>,
}

impl DaemonHandle {
    /// Errors raised by scheduled operations. Errors are dropped while the
    /// buffer is full.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<AgentError> {
        &mut self.errors
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancels the scheduler and waits for the in-flight operation to return.
    pub async fn shutdown(self) -> mpsc::Receiver<AgentError> {
        self.token.cancel();
        if let Err(e) = self.join.await {
            warn!("daemon task ended abnormally: {}", e);
        }
        self.errors
    }
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl Daemon {
    pub fn start(agent: Arc<Agent>, config: DaemonConfig) -> DaemonHandle {
        let token = CancellationToken::new();
        let (tx, errors) = mpsc::channel(agent.config().error_buffer_limit.max(1));
        let join = tokio::spawn(run(agent, config, token.clone(), tx));
        DaemonHandle {
            token,
            join,
            errors,
        }
    }
}

fn report(errors: &mpsc::Sender<AgentError>, result: Result<()>) {
    match result {
        Ok(()) | Err(AgentError::UncommittedIndexNotFound) => {}
        Err(AgentError::Cancelled) => debug!("scheduled operation cancelled"),
        Err(e) => {
            warn!("scheduled index operation failed: {}", e);
            if errors.try_send(e).is_err() {
                debug!("daemon error buffer is full, dropping error");
            }
        }
    }
}

async fn run(
    agent: Arc<Agent>,
    config: DaemonConfig,
    token: CancellationToken,
    errors: mpsc::Sender<AgentError>,
) {
    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(config.initial_delay()) => {}
    }

    let writable = !agent.is_read_replica();
    let pool_size = agent.config().default_pool_size;
    let limit = config.auto_index_duration_limit();
    let mut export = ticker(config.export_index_info_duration());
    let mut check = ticker(config.auto_index_check_duration());
    let mut save = ticker(config.auto_save_index_duration());
    let mut last_create = Instant::now();
    info!(writable, "index daemon started");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = export.tick() => agent.export_metrics().await,
            _ = check.tick(), if writable => {
                let uncommitted =
                    agent.insert_vqueue_buffer_len() + agent.delete_vqueue_buffer_len();
                if uncommitted >= config.auto_index_length as u64
                    || (uncommitted > 0 && last_create.elapsed() >= limit)
                {
                    debug!(uncommitted, "auto index triggered");
                    let result = agent.create_index(&token, pool_size).await;
                    if result.is_ok() {
                        last_create = Instant::now();
                    }
                    report(&errors, result);
                }
            }
            _ = save.tick(), if writable => {
                report(&errors, agent.save_index(&token).await);
            }
        }
    }
    info!("index daemon stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use tempfile::TempDir;

    fn fast_daemon() -> DaemonConfig {
        DaemonConfig {
            auto_index_check_duration_ms: 10,
            auto_save_index_duration_ms: 20,
            auto_index_duration_limit_ms: 60_000,
            auto_index_length: 1,
            initial_delay_ms: 0,
            export_index_info_duration_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_daemon_indexes_and_saves() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(
            Agent::new(AgentConfig::with_index_path(2, dir.path()))
                .await
                .unwrap(),
        );
        agent.insert("a", vec![1.0, 2.0]).unwrap();

        let handle = Daemon::start(agent.clone(), fast_daemon());
        for _ in 0..200 {
            if agent.len() == 1 && agent.index_metrics().last_save.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut errors = handle.shutdown().await;

        assert_eq!(agent.len(), 1);
        assert!(agent.index_metrics().last_save.is_some());
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_before_initial_delay() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(
            Agent::new(AgentConfig::with_index_path(2, dir.path()))
                .await
                .unwrap(),
        );
        let config = DaemonConfig {
            initial_delay_ms: 60_000,
            ..fast_daemon()
        };
        let handle = Daemon::start(agent.clone(), config);
        agent.insert("a", vec![1.0, 2.0]).unwrap();
        handle.shutdown().await;

        assert_eq!(agent.len(), 0);
        assert_eq!(agent.insert_vqueue_buffer_len(), 1);
    }
}
