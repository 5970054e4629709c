use crate::model::{MessageDirection, ProjectState, TimestampedMessage};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const DEFAULT_HISTORY_LIMIT: usize = 100;
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// Raw client frame. The payload is decoded per `type` by [`ClientEnvelope::into_request`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    ProjectCreate { path: String },
    ProjectList,
    ProjectDelete { project_id: String },
    ProjectJoin { project_id: String },
    ProjectLeave { project_id: String },
    Execute { project_id: String, command: String },
    SessionReset { project_id: String },
    ProcessKill { project_id: String },
    GetMessages(MessageQuery),
    HealthCheck,
    Ping,
}

impl ClientRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientRequest::ProjectCreate { .. } => "project_create",
            ClientRequest::ProjectList => "project_list",
            ClientRequest::ProjectDelete { .. } => "project_delete",
            ClientRequest::ProjectJoin { .. } => "project_join",
            ClientRequest::ProjectLeave { .. } => "project_leave",
            ClientRequest::Execute { .. } => "execute",
            ClientRequest::SessionReset { .. } => "session_reset",
            ClientRequest::ProcessKill { .. } => "process_kill",
            ClientRequest::GetMessages(_) => "get_messages",
            ClientRequest::HealthCheck => "health_check",
            ClientRequest::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageQuery {
    pub project_id: String,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub direction: Option<MessageDirection>,
}

impl MessageQuery {
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            Some(0) | None => DEFAULT_HISTORY_LIMIT,
            Some(limit) => limit.min(MAX_HISTORY_LIMIT),
        }
    }

    pub fn effective_offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct PathPayload {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Deserialize)]
struct ProjectRefPayload {
    #[serde(default)]
    project_id: String,
}

#[derive(Debug, Deserialize)]
struct ExecutePayload {
    #[serde(default)]
    project_id: String,
    #[serde(default)]
    command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl ClientEnvelope {
    pub fn into_request(self) -> Result<ClientRequest, ProtocolError> {
        let payload = self.payload;
        match self.r#type.as_str() {
            "project_create" => {
                let value: PathPayload = parse_payload(payload)?;
                let path = required(value.path, "path")?;
                Ok(ClientRequest::ProjectCreate { path })
            }
            "project_list" => Ok(ClientRequest::ProjectList),
            "project_delete" => Ok(ClientRequest::ProjectDelete {
                project_id: project_id_from(payload)?,
            }),
            "project_join" => Ok(ClientRequest::ProjectJoin {
                project_id: project_id_from(payload)?,
            }),
            "project_leave" => Ok(ClientRequest::ProjectLeave {
                project_id: project_id_from(payload)?,
            }),
            "execute" => {
                let value: ExecutePayload = parse_payload(payload)?;
                Ok(ClientRequest::Execute {
                    project_id: required(value.project_id, "project_id")?,
                    command: non_blank(value.command, "command")?,
                })
            }
            "session_reset" => Ok(ClientRequest::SessionReset {
                project_id: project_id_from(payload)?,
            }),
            "process_kill" => Ok(ClientRequest::ProcessKill {
                project_id: project_id_from(payload)?,
            }),
            "get_messages" => {
                let mut query: MessageQuery = parse_payload(payload)?;
                query.project_id = required(query.project_id, "project_id")?;
                Ok(ClientRequest::GetMessages(query))
            }
            "health_check" => Ok(ClientRequest::HealthCheck),
            "ping" => Ok(ClientRequest::Ping),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

fn parse_payload<T: DeserializeOwned>(payload: Value) -> Result<T, ProtocolError> {
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(|err| ProtocolError::InvalidPayload(err.to_string()))
}

fn project_id_from(payload: Value) -> Result<String, ProtocolError> {
    let value: ProjectRefPayload = parse_payload(payload)?;
    required(value.project_id, "project_id")
}

fn required(value: String, field: &'static str) -> Result<String, ProtocolError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::MissingField(field));
    }
    Ok(trimmed.to_string())
}

/// Like `required`, but hands the value back untouched.
fn non_blank(value: String, field: &'static str) -> Result<String, ProtocolError> {
    if value.trim().is_empty() {
        return Err(ProtocolError::MissingField(field));
    }
    Ok(value)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: ServerMsg,
}

impl ServerEnvelope {
    pub fn new(msg: ServerMsg) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: None,
            msg,
        }
    }

    pub fn reply(request_id: Option<String>, msg: ServerMsg) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id,
            msg,
        }
    }

    pub fn error(request_id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::reply(
            request_id,
            ServerMsg::Error(ErrorPayload {
                code,
                message: message.into(),
                project_id: None,
            }),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMsg {
    ProjectCreated(ProjectInfo),
    ProjectList(ProjectListPayload),
    ProjectState(ProjectStatePayload),
    ProjectUpdate(ProjectInfo),
    ProjectDeleted(ProjectRef),
    ProjectJoined(ProjectInfo),
    ProjectLeft(ProjectRef),
    AgentMessage(AgentMessagePayload),
    Messages(MessagesPayload),
    Error(ErrorPayload),
    ServerStats(ServerStats),
    ConnectionHealth(ConnectionHealthPayload),
    SessionReset(ProjectRef),
    ProcessKilled(ProjectRef),
    Health(HealthReport),
    Pong(PongPayload),
}

impl ServerMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMsg::ProjectCreated(_) => "project_created",
            ServerMsg::ProjectList(_) => "project_list",
            ServerMsg::ProjectState(_) => "project_state",
            ServerMsg::ProjectUpdate(_) => "project_update",
            ServerMsg::ProjectDeleted(_) => "project_deleted",
            ServerMsg::ProjectJoined(_) => "project_joined",
            ServerMsg::ProjectLeft(_) => "project_left",
            ServerMsg::AgentMessage(_) => "agent_message",
            ServerMsg::Messages(_) => "messages",
            ServerMsg::Error(_) => "error",
            ServerMsg::ServerStats(_) => "server_stats",
            ServerMsg::ConnectionHealth(_) => "connection_health",
            ServerMsg::SessionReset(_) => "session_reset",
            ServerMsg::ProcessKilled(_) => "process_killed",
            ServerMsg::Health(_) => "health",
            ServerMsg::Pong(_) => "pong",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectInfo {
    pub id: String,
    pub path: String,
    pub state: ProjectState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub subscribers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectListPayload {
    pub projects: Vec<ProjectInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectRef {
    pub project_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectStatePayload {
    pub project_id: String,
    pub state: ProjectState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessagePayload {
    pub project_id: String,
    pub message: TimestampedMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagesPayload {
    pub project_id: String,
    pub messages: Vec<TimestampedMessage>,
    pub total: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    UnknownType,
    MessageTooLarge,
    InvalidPath,
    ProjectNotFound,
    NotJoined,
    ProcessActive,
    AlreadyExecuting,
    ProjectLimit,
    ConnectionLimit,
    IpConnectionLimit,
    RateLimited,
    OriginRejected,
    ProcessError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::UnknownType => "unknown_type",
            ErrorCode::MessageTooLarge => "message_too_large",
            ErrorCode::InvalidPath => "invalid_path",
            ErrorCode::ProjectNotFound => "project_not_found",
            ErrorCode::NotJoined => "not_joined",
            ErrorCode::ProcessActive => "process_active",
            ErrorCode::AlreadyExecuting => "already_executing",
            ErrorCode::ProjectLimit => "project_limit",
            ErrorCode::ConnectionLimit => "connection_limit",
            ErrorCode::IpConnectionLimit => "ip_connection_limit",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::OriginRejected => "origin_rejected",
            ErrorCode::ProcessError => "process_error",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionHealthPayload {
    pub session_id: String,
    pub status: String,
    pub ping_interval_secs: u64,
    pub read_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PongPayload {
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerStats {
    pub uptime_secs: u64,
    pub connections: ConnectionStats,
    pub executions: ExecutionStats,
    pub messages: MessageStats,
    pub projects: Vec<ProjectStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionStats {
    pub active: u64,
    pub total: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionStats {
    pub total: u64,
    pub active: u64,
    pub failed: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub per_minute: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageStats {
    pub received: u64,
    pub sent: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectStats {
    pub project_id: String,
    pub state: ProjectState,
    pub subscribers: usize,
}

/// Ordered by severity so the overall status is the maximum of the checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
            HealthStatus::Error => "error",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub uptime_secs: u64,
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    pub fn from_checks(uptime_secs: u64, checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|check| check.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            uptime_secs,
            checks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    if bytes.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: bytes.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(bytes).map_err(|err| FrameError::Decode(err.to_string()))
}
