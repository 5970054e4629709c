use aoc_remote_core::new_session_id;
use aoc_remote_core::protocol::{encode_frame, ServerEnvelope};
use axum::extract::ws::{CloseFrame, Message};
use chrono::{DateTime, Utc};
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tracing::warn;

/// Outbound frames may carry a page of history, so they get more room than inbound ones.
pub const MAX_OUTBOUND_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub const CLOSE_INACTIVITY: u16 = 4000;
pub const CLOSE_KEEPALIVE: u16 = 4001;
pub const CLOSE_GOING_AWAY: u16 = 1001;

const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Cheap clone of a session's outbound queue, held in project subscriber sets.
#[derive(Clone, Debug)]
pub struct Subscriber {
    pub session_id: String,
    pub sender: mpsc::Sender<Message>,
}

impl Subscriber {
    pub async fn send_text(&self, text: String, write_timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(write_timeout, self.sender.send(Message::Text(text))).await,
            Ok(Ok(()))
        )
    }
}

/// One live socket. Owned by its connection task; projects refer to it by id only.
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    sender: mpsc::Sender<Message>,
    last_seen: Mutex<Instant>,
    joined: Mutex<Option<String>>,
}

impl Session {
    pub fn new(sender: mpsc::Sender<Message>) -> Self {
        Self {
            id: new_session_id(),
            created_at: Utc::now(),
            sender,
            last_seen: Mutex::new(Instant::now()),
            joined: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn subscriber(&self) -> Subscriber {
        Subscriber {
            session_id: self.id.clone(),
            sender: self.sender.clone(),
        }
    }

    pub fn touch(&self) {
        let mut last = self
            .last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    pub fn joined_project(&self) -> Option<String> {
        self.joined
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_joined(&self, project_id: Option<String>) {
        let mut joined = self
            .joined
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *joined = project_id;
    }

    /// Clears the joined project only if it still equals `project_id`.
    pub fn clear_joined_if(&self, project_id: &str) -> bool {
        let mut joined = self
            .joined
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if joined.as_deref() == Some(project_id) {
            *joined = None;
            return true;
        }
        false
    }

    pub async fn send(&self, envelope: &ServerEnvelope, write_timeout: Duration) -> bool {
        let text = match encode_frame(envelope, MAX_OUTBOUND_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "encode_error", session_id = %self.id, kind = envelope.msg.kind(), error = %err);
                return false;
            }
        };
        self.subscriber().send_text(text, write_timeout).await
    }

    pub async fn close(&self, code: u16, reason: &str) {
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        }));
        let _ = tokio::time::timeout(CLOSE_SEND_TIMEOUT, self.sender.send(frame)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aoc_remote_core::protocol::{PongPayload, ServerMsg};

    #[tokio::test]
    async fn send_encodes_envelope_as_text() {
        let (tx, mut rx) = mpsc::channel(4);
        let session = Session::new(tx);
        assert!(session.id().starts_with("sess-"));
        let envelope = ServerEnvelope::reply(
            Some("r-1".to_string()),
            ServerMsg::Pong(PongPayload {
                session_id: session.id().to_string(),
            }),
        );
        assert!(session.send(&envelope, Duration::from_secs(1)).await);
        let Some(Message::Text(text)) = rx.recv().await else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["type"], "pong");
        assert_eq!(value["request_id"], "r-1");
    }

    #[tokio::test]
    async fn send_times_out_on_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::new(tx);
        let subscriber = session.subscriber();
        assert!(subscriber.send_text("a".to_string(), Duration::from_millis(50)).await);
        assert!(!subscriber.send_text("b".to_string(), Duration::from_millis(50)).await);
    }

    #[test]
    fn joined_project_is_cleared_only_when_matching() {
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::new(tx);
        session.set_joined(Some("p-1".to_string()));
        assert!(!session.clear_joined_if("p-2"));
        assert_eq!(session.joined_project().as_deref(), Some("p-1"));
        assert!(session.clear_joined_if("p-1"));
        assert_eq!(session.joined_project(), None);
    }
}
