use crate::state::HubState;
use aoc_remote_core::protocol::{HealthStatus, ServerStats};
use serde::Serialize;
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info};

/// Condensed body for `GET /health`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthSummary {
    pub status: HealthStatus,
    pub uptime_secs: u64,
    pub active_connections: u64,
    pub projects: usize,
    pub shutting_down: bool,
}

impl HubState {
    pub async fn server_stats(&self) -> ServerStats {
        ServerStats {
            uptime_secs: self.uptime().as_secs(),
            connections: self.metrics.connection_stats(),
            executions: self.metrics.execution_stats(),
            messages: self.metrics.message_stats(),
            projects: self.registry.stats().await,
        }
    }

    pub async fn health_summary(&self) -> HealthSummary {
        let report = self.health.check(self.uptime().as_secs()).await;
        HealthSummary {
            status: report.status,
            uptime_secs: report.uptime_secs,
            active_connections: self.metrics.active_connections(),
            projects: self.registry.len().await,
            shutting_down: self.is_shutting_down(),
        }
    }

    /// Broadcasts stats on a fixed interval until shutdown is signalled.
    pub fn spawn_stats_task(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.stats_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let stats = self.server_stats().await;
                        let reached = self.broadcaster.broadcast_stats(&stats).await;
                        debug!(event = "stats_broadcast", reached, active = stats.connections.active);
                    }
                }
            }
            info!(event = "stats_task_stopped");
        })
    }
}
