use crate::error::HubResult;
use crate::metrics::HubMetrics;
use crate::registry::{Project, ProjectRegistry};
use crate::session::{Subscriber, MAX_OUTBOUND_FRAME_BYTES};
use aoc_remote_core::protocol::{
    encode_frame, AgentMessagePayload, ErrorCode, ErrorPayload, ProjectInfo, ProjectRef,
    ProjectStatePayload, ServerEnvelope, ServerMsg, ServerStats,
};
use aoc_remote_core::TimestampedMessage;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub recipients: usize,
    pub delivered: usize,
    pub skipped: usize,
    pub timed_out: bool,
}

pub struct Broadcaster {
    registry: Arc<ProjectRegistry>,
    metrics: Arc<HubMetrics>,
    write_timeout: Duration,
    broadcast_timeout: Duration,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<ProjectRegistry>,
        metrics: Arc<HubMetrics>,
        write_timeout: Duration,
        broadcast_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            write_timeout,
            broadcast_timeout,
        }
    }

    /// Sends to a snapshot of the project's subscribers, one task per subscriber.
    pub async fn broadcast_to_project(
        &self,
        project: &Project,
        envelope: &ServerEnvelope,
    ) -> BroadcastReport {
        let subscribers = project.subscribers().await;
        self.deliver(project.id(), subscribers, envelope).await
    }

    pub async fn broadcast_to_id(&self, project_id: &str, envelope: &ServerEnvelope) -> BroadcastReport {
        match self.registry.get(project_id).await {
            Some(project) => self.broadcast_to_project(&project, envelope).await,
            None => BroadcastReport::default(),
        }
    }

    pub async fn deliver(
        &self,
        project_id: &str,
        subscribers: Vec<Subscriber>,
        envelope: &ServerEnvelope,
    ) -> BroadcastReport {
        let mut report = BroadcastReport {
            recipients: subscribers.len(),
            ..BroadcastReport::default()
        };
        if subscribers.is_empty() {
            return report;
        }
        let text = match encode_frame(envelope, MAX_OUTBOUND_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "broadcast_encode_error", project_id, kind = envelope.msg.kind(), error = %err);
                report.skipped = report.recipients;
                return report;
            }
        };

        let write_timeout = self.write_timeout;
        let mut pending = JoinSet::new();
        for subscriber in subscribers {
            let text = text.clone();
            pending.spawn(async move {
                let delivered = subscriber.send_text(text, write_timeout).await;
                (subscriber.session_id, delivered)
            });
        }

        let deadline = tokio::time::sleep(self.broadcast_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = pending.join_next() => {
                    match joined {
                        Some(Ok((_, true))) => report.delivered += 1,
                        Some(Ok((session_id, false))) => {
                            report.skipped += 1;
                            warn!(event = "subscriber_skipped", project_id, session_id = %session_id);
                        }
                        Some(Err(err)) => {
                            report.skipped += 1;
                            warn!(event = "subscriber_task_failed", project_id, error = %err);
                        }
                        None => break,
                    }
                }
                _ = &mut deadline => {
                    report.timed_out = true;
                    report.skipped = report.recipients - report.delivered;
                    warn!(
                        event = "broadcast_timeout",
                        project_id,
                        pending = pending.len(),
                        delivered = report.delivered
                    );
                    // Stragglers finish or fail on their own write deadline.
                    pending.detach_all();
                    break;
                }
            }
        }

        self.metrics.messages_sent(report.delivered as u64);
        debug!(
            event = "broadcast",
            project_id,
            kind = envelope.msg.kind(),
            delivered = report.delivered,
            skipped = report.skipped
        );
        report
    }

    pub async fn broadcast_state(&self, info: &ProjectInfo) -> BroadcastReport {
        let envelope = ServerEnvelope::new(ServerMsg::ProjectState(ProjectStatePayload {
            project_id: info.id.clone(),
            state: info.state,
            claude_session_id: info.claude_session_id.clone(),
            last_error: info.last_error.clone(),
        }));
        self.broadcast_to_id(&info.id, &envelope).await
    }

    pub async fn broadcast_update(&self, info: &ProjectInfo) -> BroadcastReport {
        let envelope = ServerEnvelope::new(ServerMsg::ProjectUpdate(info.clone()));
        self.broadcast_to_id(&info.id, &envelope).await
    }

    /// The project is already out of the registry, so it is passed in directly.
    pub async fn broadcast_deleted(&self, project: &Project) -> BroadcastReport {
        let envelope = ServerEnvelope::new(ServerMsg::ProjectDeleted(ProjectRef {
            project_id: project.id().to_string(),
        }));
        self.broadcast_to_project(project, &envelope).await
    }

    pub async fn broadcast_session_reset(&self, project_id: &str) -> BroadcastReport {
        let envelope = ServerEnvelope::new(ServerMsg::SessionReset(ProjectRef {
            project_id: project_id.to_string(),
        }));
        self.broadcast_to_id(project_id, &envelope).await
    }

    pub async fn broadcast_process_killed(&self, project_id: &str) -> BroadcastReport {
        let envelope = ServerEnvelope::new(ServerMsg::ProcessKilled(ProjectRef {
            project_id: project_id.to_string(),
        }));
        self.broadcast_to_id(project_id, &envelope).await
    }

    pub async fn broadcast_error(
        &self,
        project_id: &str,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> BroadcastReport {
        let envelope = ServerEnvelope::new(ServerMsg::Error(ErrorPayload {
            code,
            message: message.into(),
            project_id: Some(project_id.to_string()),
        }));
        self.broadcast_to_id(project_id, &envelope).await
    }

    /// Logs the message first so history never misses what subscribers saw.
    pub async fn broadcast_agent_message(
        &self,
        project_id: &str,
        message: TimestampedMessage,
    ) -> HubResult<BroadcastReport> {
        self.registry
            .append_message(project_id, message.clone())
            .await?;
        let envelope = ServerEnvelope::new(ServerMsg::AgentMessage(AgentMessagePayload {
            project_id: project_id.to_string(),
            message,
        }));
        Ok(self.broadcast_to_id(project_id, &envelope).await)
    }

    /// Sends a stats snapshot to every project that has at least one subscriber.
    pub async fn broadcast_stats(&self, stats: &ServerStats) -> usize {
        let envelope = ServerEnvelope::new(ServerMsg::ServerStats(stats.clone()));
        let mut reached = 0;
        for info in self.registry.list_all().await {
            if info.subscribers == 0 {
                continue;
            }
            reached += self.broadcast_to_id(&info.id, &envelope).await.delivered;
        }
        reached
    }
}
