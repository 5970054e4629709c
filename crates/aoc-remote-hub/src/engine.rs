use async_trait::async_trait;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};
use thiserror::Error;
use tokio::{io::AsyncReadExt, process::Command, sync::oneshot};
use tracing::{debug, info, warn};

const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start {bin}: {reason}")]
    Spawn { bin: String, reason: String },
    #[error("execution failed: {0}")]
    Failed(String),
    #[error("execution was killed")]
    Killed,
    #[error("no running process for project {0}")]
    NotRunning(String),
    #[error("process already running for project {0}")]
    AlreadyRunning(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one command: the agent's messages and the session handle to resume with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    pub messages: Vec<Value>,
    pub claude_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub project_id: String,
    pub path: String,
    pub command: String,
    pub claude_session_id: Option<String>,
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, EngineError>;

    async fn kill(&self, project_id: &str) -> Result<(), EngineError>;

    /// Executable the engine depends on, probed by the health check.
    fn tool(&self) -> &str;
}

/// Kill handle for one run. The run id keeps a finished run from removing the
/// handle of a newer run for the same project.
struct RunHandle {
    run_id: u64,
    kill_tx: oneshot::Sender<()>,
}

pub struct ClaudeCliEngine {
    bin: String,
    next_run: AtomicU64,
    running: Mutex<HashMap<String, RunHandle>>,
}

impl ClaudeCliEngine {
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            next_run: AtomicU64::new(1),
            running: Mutex::new(HashMap::new()),
        }
    }

    fn command(&self, request: &ExecutionRequest) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-p")
            .arg(&request.command)
            .arg("--output-format")
            .arg("json");
        if let Some(session_id) = &request.claude_session_id {
            cmd.arg("--resume").arg(session_id);
        }
        cmd.current_dir(&request.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn register(&self, project_id: &str) -> Result<(u64, oneshot::Receiver<()>), EngineError> {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if running.contains_key(project_id) {
            return Err(EngineError::AlreadyRunning(project_id.to_string()));
        }
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let (kill_tx, kill_rx) = oneshot::channel();
        running.insert(project_id.to_string(), RunHandle { run_id, kill_tx });
        Ok((run_id, kill_rx))
    }

    fn unregister(&self, project_id: &str, run_id: u64) {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if running
            .get(project_id)
            .is_some_and(|handle| handle.run_id == run_id)
        {
            running.remove(project_id);
        }
    }

    #[cfg(test)]
    pub fn is_running(&self, project_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(project_id)
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        kill_rx: oneshot::Receiver<()>,
    ) -> Result<ExecutionOutcome, EngineError> {
        let mut child = self.command(request).spawn().map_err(|err| EngineError::Spawn {
            bin: self.bin.clone(),
            reason: err.to_string(),
        })?;
        debug!(event = "engine_spawned", project_id = %request.project_id, pid = child.id());

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(out) = stdout.as_mut() {
                let _ = out.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(err) = stderr.as_mut() {
                let _ = err.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            Ok(()) = kill_rx => {
                child.kill().await?;
                info!(event = "engine_killed", project_id = %request.project_id);
                return Err(EngineError::Killed);
            }
        };

        let out = stdout_task.await.unwrap_or_default();
        let err = stderr_task.await.unwrap_or_default();
        if !status.success() {
            let tail = stderr_tail(&err);
            warn!(event = "engine_failed", project_id = %request.project_id, status = %status, stderr = %tail);
            let reason = if tail.is_empty() {
                format!("exited with {status}")
            } else {
                tail
            };
            return Err(EngineError::Failed(reason));
        }
        parse_output(&out)
    }
}

#[async_trait]
impl ExecutionEngine for ClaudeCliEngine {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, EngineError> {
        let (run_id, kill_rx) = self.register(&request.project_id)?;
        let result = self.run(&request, kill_rx).await;
        self.unregister(&request.project_id, run_id);
        result
    }

    async fn kill(&self, project_id: &str) -> Result<(), EngineError> {
        let sender = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(project_id);
        match sender {
            Some(handle) => {
                let _ = handle.kill_tx.send(());
                Ok(())
            }
            None => Err(EngineError::NotRunning(project_id.to_string())),
        }
    }

    fn tool(&self) -> &str {
        &self.bin
    }
}

/// Accepts a single JSON result, a JSON array of events, or JSON lines.
/// Plain text lines are wrapped as `{"type":"text","text":...}`.
pub fn parse_output(raw: &[u8]) -> Result<ExecutionOutcome, EngineError> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    let messages: Vec<Value> = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) => items,
        Ok(Value::Null) => Vec::new(),
        Ok(value) => vec![value],
        Err(_) => trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<Value>(line)
                    .unwrap_or_else(|_| json!({"type": "text", "text": line}))
            })
            .collect(),
    };

    if let Some(failure) = messages.iter().find(|message| {
        message.get("is_error").and_then(Value::as_bool) == Some(true)
    }) {
        let reason = failure
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or("agent reported an error");
        return Err(EngineError::Failed(reason.to_string()));
    }

    let claude_session_id = messages
        .iter()
        .rev()
        .find_map(|message| message.get("session_id").and_then(Value::as_str))
        .map(str::to_string);
    Ok(ExecutionOutcome {
        messages,
        claude_session_id,
    })
}

fn stderr_tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    let start = trimmed.len().saturating_sub(STDERR_TAIL_BYTES);
    let start = (start..trimmed.len())
        .find(|index| trimmed.is_char_boundary(*index))
        .unwrap_or(trimmed.len());
    trimmed[start..].to_string()
}
