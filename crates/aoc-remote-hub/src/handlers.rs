use crate::engine::{EngineError, ExecutionRequest};
use crate::error::{HubError, HubResult};
use crate::session::Session;
use crate::state::HubState;
use aoc_remote_core::protocol::{
    ClientEnvelope, ClientRequest, ProjectListPayload, ProjectRef, ProjectStatePayload,
    PongPayload, ServerEnvelope, ServerMsg,
};
use aoc_remote_core::{MessageDirection, ProjectState, TimestampedMessage};
use serde_json::json;
use std::{sync::Arc, time::Instant};
use tracing::{debug, error, info, warn};

impl HubState {
    pub async fn dispatch(self: &Arc<Self>, session: &Session, envelope: ClientEnvelope) {
        let request_id = envelope.request_id.clone();
        let kind = envelope.r#type.clone();
        let result = match envelope.into_request() {
            Ok(request) => self.handle_request(session, request).await,
            Err(err) => Err(err.into()),
        };
        match result {
            Ok(msg) => {
                let reply = ServerEnvelope::reply(request_id, msg);
                if !session.send(&reply, self.config.write_timeout).await {
                    debug!(event = "reply_dropped", session_id = %session.id(), kind = %kind);
                }
            }
            Err(err) => self.send_error(session, request_id, &kind, &err).await,
        }
    }

    pub async fn send_error(
        &self,
        session: &Session,
        request_id: Option<String>,
        kind: &str,
        err: &HubError,
    ) {
        if err.is_internal() {
            error!(event = "request_failed", session_id = %session.id(), kind, error = %err);
        } else {
            warn!(event = "request_rejected", session_id = %session.id(), kind, code = %err.code(), error = %err);
        }
        let envelope = ServerEnvelope::error(request_id, err.code(), err.client_message());
        let _ = session.send(&envelope, self.config.write_timeout).await;
    }

    pub async fn handle_request(
        self: &Arc<Self>,
        session: &Session,
        request: ClientRequest,
    ) -> HubResult<ServerMsg> {
        match request {
            ClientRequest::ProjectCreate { path } => {
                let info = self.registry.create(&path).await?;
                Ok(ServerMsg::ProjectCreated(info))
            }
            ClientRequest::ProjectList => Ok(ServerMsg::ProjectList(ProjectListPayload {
                projects: self.registry.list_all().await,
            })),
            ClientRequest::ProjectDelete { project_id } => {
                self.delete_project(&project_id).await?;
                Ok(ServerMsg::ProjectDeleted(ProjectRef { project_id }))
            }
            ClientRequest::ProjectJoin { project_id } => {
                let info = self.registry.join(&project_id, session).await?;
                self.broadcaster.broadcast_update(&info).await;
                Ok(ServerMsg::ProjectJoined(info))
            }
            ClientRequest::ProjectLeave { project_id } => {
                if !self.registry.leave(&project_id, session).await? {
                    return Err(HubError::not_joined(&project_id));
                }
                if let Some(info) = self.registry.get_by_id(&project_id).await {
                    self.broadcaster.broadcast_update(&info).await;
                }
                Ok(ServerMsg::ProjectLeft(ProjectRef { project_id }))
            }
            ClientRequest::Execute {
                project_id,
                command,
            } => self.start_execution(&project_id, command).await,
            ClientRequest::SessionReset { project_id } => {
                let info = self.registry.reset_session(&project_id).await?;
                self.broadcaster.broadcast_session_reset(&project_id).await;
                self.broadcaster.broadcast_state(&info).await;
                info!(event = "session_reset", project_id = %project_id);
                Ok(ServerMsg::SessionReset(ProjectRef { project_id }))
            }
            ClientRequest::ProcessKill { project_id } => {
                self.kill_process(&project_id).await?;
                Ok(ServerMsg::ProcessKilled(ProjectRef { project_id }))
            }
            ClientRequest::GetMessages(query) => {
                Ok(ServerMsg::Messages(self.registry.messages(&query).await?))
            }
            ClientRequest::HealthCheck => Ok(ServerMsg::Health(
                self.health.check(self.uptime().as_secs()).await,
            )),
            ClientRequest::Ping => Ok(ServerMsg::Pong(PongPayload {
                session_id: session.id().to_string(),
            })),
        }
    }

    async fn delete_project(&self, project_id: &str) -> HubResult<()> {
        if let Some(info) = self.registry.get_by_id(project_id).await {
            if info.state.is_executing() {
                if let Err(err) = self.engine.kill(project_id).await {
                    debug!(event = "kill_before_delete", project_id, error = %err);
                }
            }
        }
        if let Some(project) = self.registry.delete(project_id).await? {
            self.broadcaster.broadcast_deleted(&project).await;
        }
        Ok(())
    }

    async fn kill_process(&self, project_id: &str) -> HubResult<()> {
        if self.registry.get(project_id).await.is_none() {
            return Err(HubError::project_not_found(project_id));
        }
        self.engine.kill(project_id).await?;
        let info = self
            .registry
            .update_state(project_id, ProjectState::Idle, None)
            .await?;
        self.broadcaster.broadcast_process_killed(project_id).await;
        self.broadcaster.broadcast_state(&info).await;
        info!(event = "process_killed", project_id);
        Ok(())
    }

    /// Marks the project executing, records the command, and runs the engine in
    /// the background. The reply is the new project state.
    async fn start_execution(self: &Arc<Self>, project_id: &str, command: String) -> HubResult<ServerMsg> {
        let info = self.registry.begin_execution(project_id).await?;

        let client_message = TimestampedMessage::new(
            MessageDirection::Client,
            json!({"type": "command", "command": command}),
        );
        if let Err(err) = self
            .broadcaster
            .broadcast_agent_message(project_id, client_message)
            .await
        {
            if let Err(rollback) = self
                .registry
                .update_state(project_id, ProjectState::Idle, None)
                .await
            {
                warn!(event = "execution_rollback_failed", project_id, error = %rollback);
            }
            return Err(err);
        }
        self.broadcaster.broadcast_state(&info).await;

        let request = ExecutionRequest {
            project_id: project_id.to_string(),
            path: info.path.clone(),
            command,
            claude_session_id: info.claude_session_id.clone(),
        };
        let hub = self.clone();
        let guard = self.work.start();
        self.metrics.execution_started();
        tokio::spawn(async move {
            hub.run_execution(request).await;
            drop(guard);
        });
        info!(event = "execution_started", project_id);

        Ok(ServerMsg::ProjectState(ProjectStatePayload {
            project_id: info.id,
            state: info.state,
            claude_session_id: info.claude_session_id,
            last_error: info.last_error,
        }))
    }

    async fn run_execution(&self, request: ExecutionRequest) {
        let project_id = request.project_id.clone();
        let started = Instant::now();
        let result = self.engine.execute(request).await;
        let failed = result.is_err() && !matches!(result, Err(EngineError::Killed));
        self.metrics.execution_finished(started.elapsed(), failed);

        match result {
            Ok(outcome) => {
                for message in outcome.messages {
                    let message = TimestampedMessage::new(MessageDirection::Claude, message);
                    if let Err(err) = self
                        .broadcaster
                        .broadcast_agent_message(&project_id, message)
                        .await
                    {
                        warn!(event = "agent_message_dropped", project_id = %project_id, error = %err);
                    }
                }
                if outcome.claude_session_id.is_some() {
                    if let Err(err) = self
                        .registry
                        .update_session(&project_id, outcome.claude_session_id)
                        .await
                    {
                        warn!(event = "session_update_failed", project_id = %project_id, error = %err);
                    }
                }
                match self
                    .registry
                    .update_state(&project_id, ProjectState::Idle, None)
                    .await
                {
                    Ok(info) => {
                        self.broadcaster.broadcast_state(&info).await;
                    }
                    Err(err) => {
                        debug!(event = "execution_state_lost", project_id = %project_id, error = %err)
                    }
                }
                info!(event = "execution_finished", project_id = %project_id, elapsed_ms = started.elapsed().as_millis() as u64);
            }
            Err(EngineError::Killed) => {
                debug!(event = "execution_killed", project_id = %project_id);
            }
            Err(err) => {
                let message = err.to_string();
                warn!(event = "execution_failed", project_id = %project_id, error = %message);
                match self
                    .registry
                    .update_state(&project_id, ProjectState::Error, Some(message.clone()))
                    .await
                {
                    Ok(info) => {
                        self.broadcaster.broadcast_state(&info).await;
                        let hub_err = HubError::from(err);
                        self.broadcaster
                            .broadcast_error(&project_id, hub_err.code(), message)
                            .await;
                    }
                    Err(state_err) => {
                        debug!(event = "execution_state_lost", project_id = %project_id, error = %state_err)
                    }
                }
            }
        }
    }
}
