use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProjectState {
    Idle,
    Executing,
    Error,
}

impl Default for ProjectState {
    fn default() -> Self {
        Self::Idle
    }
}

impl ProjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectState::Idle => "idle",
            ProjectState::Executing => "executing",
            ProjectState::Error => "error",
        }
    }

    pub fn is_executing(&self) -> bool {
        matches!(self, ProjectState::Executing)
    }
}

impl fmt::Display for ProjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "idle" => Ok(ProjectState::Idle),
            "executing" | "running" => Ok(ProjectState::Executing),
            "error" | "failed" => Ok(ProjectState::Error),
            other => Err(format!("Unknown project state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Client,
    Claude,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Client => "client",
            MessageDirection::Claude => "claude",
        }
    }
}

impl fmt::Display for MessageDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageDirection {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "client" => Ok(MessageDirection::Client),
            "claude" => Ok(MessageDirection::Claude),
            other => Err(format!("Unknown message direction: {other}")),
        }
    }
}

/// One line of a project's message log. Never mutated after it is written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimestampedMessage {
    pub timestamp: DateTime<Utc>,
    pub direction: MessageDirection,
    pub message: Value,
}

impl TimestampedMessage {
    pub fn new(direction: MessageDirection, message: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            direction,
            message,
        }
    }

    pub fn at(timestamp: DateTime<Utc>, direction: MessageDirection, message: Value) -> Self {
        Self {
            timestamp,
            direction,
            message,
        }
    }
}

/// Durable projection of a project. Subscribers and log content are not part of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectMetadata {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub state: ProjectState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl ProjectMetadata {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            path: path.into(),
            state: ProjectState::Idle,
            claude_session_id: None,
            created_at: now,
            last_active: now,
        }
    }
}

pub fn new_project_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn new_session_id() -> String {
    format!("sess-{}", uuid::Uuid::new_v4().simple())
}
