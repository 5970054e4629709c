use crate::admission::{AdmissionError, AdmissionPermit};
use crate::error::HubError;
use crate::session::{Session, CLOSE_GOING_AWAY, CLOSE_INACTIVITY, CLOSE_KEEPALIVE};
use crate::state::HubState;
use aoc_remote_core::protocol::{
    decode_frame, ClientEnvelope, ConnectionHealthPayload, ErrorCode, FrameError, ServerEnvelope,
    ServerMsg,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header::ORIGIN, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
struct RejectBody {
    code: ErrorCode,
    message: String,
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let body = RejectBody {
            code: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

pub fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(hub)
}

/// Resolves once the hub's shutdown flag flips. Used for `with_graceful_shutdown`.
pub async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn health_handler(State(hub): State<Arc<HubState>>) -> impl IntoResponse {
    Json(hub.health_summary().await)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(hub): State<Arc<HubState>>,
) -> Response {
    if hub.is_shutting_down() {
        let body = RejectBody {
            code: ErrorCode::ConnectionLimit,
            message: "server shutting down".to_string(),
        };
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    }
    let origin = headers.get(ORIGIN).and_then(|value| value.to_str().ok());
    let permit = match hub.admission.admit(addr.ip(), origin) {
        Ok(permit) => permit,
        Err(err) => return err.into_response(),
    };
    // Frames past twice the limit fail the socket. Smaller oversized frames get an error reply.
    let max = hub.config.max_message_bytes.saturating_mul(2);
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| async move {
            hub.handle_socket(socket, addr, permit).await;
        })
}

impl HubState {
    async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr, permit: AdmissionPermit) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.config.queue_capacity);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
                if closing {
                    return;
                }
            }
        });

        let session = Session::new(tx);
        info!(
            event = "client_connected",
            session_id = %session.id(),
            remote = %permit.ip(),
            from_ip = self.admission.active_for(permit.ip())
        );
        let welcome = ServerEnvelope::new(ServerMsg::ConnectionHealth(ConnectionHealthPayload {
            session_id: session.id().to_string(),
            status: "connected".to_string(),
            ping_interval_secs: self.config.ping_interval.as_secs(),
            read_timeout_secs: self.config.read_timeout.as_secs(),
        }));
        session.send(&welcome, write_timeout).await;

        let reason = self.read_loop(&session, &mut ws_receiver).await;

        // Cleanup runs once per connection, whatever ended the loop.
        let left = self.registry.leave_session(&session).await;
        permit.release();
        info!(
            event = "client_disconnected",
            session_id = %session.id(),
            remote = %remote,
            reason,
            left_project = left,
            connected_secs = (chrono::Utc::now() - session.created_at()).num_seconds()
        );
        drop(session);
        if tokio::time::timeout(write_timeout * 2, write_task).await.is_err() {
            debug!(event = "writer_detached", remote = %remote);
        }
    }

    async fn read_loop(
        self: &Arc<Self>,
        session: &Session,
        ws_receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    ) -> &'static str {
        let read_timeout = self.config.read_timeout;
        let pong_timeout = self.config.pong_timeout;
        let mut shutdown = self.subscribe_shutdown();
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.tick().await;
        let mut awaiting_pong: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                session.close(CLOSE_GOING_AWAY, "server_shutting_down").await;
                return "shutdown";
            }
            let idle_left = read_timeout.saturating_sub(session.idle_for());
            let pong_due = awaiting_pong.map(|sent| sent + pong_timeout);
            let pong_deadline = async move {
                match pong_due {
                    Some(due) => tokio::time::sleep_until(due).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown.changed() => {
                    continue;
                }
                _ = tokio::time::sleep(idle_left) => {
                    if session.idle_for() >= read_timeout {
                        warn!(event = "inactivity_timeout", session_id = %session.id());
                        session.close(CLOSE_INACTIVITY, "inactivity_timeout").await;
                        return "inactivity_timeout";
                    }
                }
                _ = pong_deadline => {
                    warn!(event = "keepalive_timeout", session_id = %session.id());
                    session.close(CLOSE_KEEPALIVE, "keepalive_timeout").await;
                    return "keepalive_timeout";
                }
                _ = ping.tick() => {
                    if awaiting_pong.is_none() {
                        let outbound = session.subscriber();
                        if outbound.sender.try_send(Message::Ping(Vec::new())).is_ok() {
                            awaiting_pong = Some(Instant::now());
                        }
                    }
                }
                frame = ws_receiver.next() => {
                    let msg = match frame {
                        Some(Ok(value)) => value,
                        Some(Err(err)) => {
                            warn!(event = "read_error", session_id = %session.id(), error = %err);
                            return "read_error";
                        }
                        None => return "disconnect",
                    };
                    session.touch();
                    match msg {
                        Message::Text(text) => self.handle_frame(session, text.as_bytes()).await,
                        Message::Binary(bytes) => self.handle_frame(session, &bytes).await,
                        Message::Pong(_) => awaiting_pong = None,
                        Message::Ping(_) => {}
                        Message::Close(_) => {
                            debug!(event = "client_close", session_id = %session.id());
                            return "client_close";
                        }
                    }
                }
            }
        }
    }

    async fn handle_frame(self: &Arc<Self>, session: &Session, data: &[u8]) {
        self.metrics.message_received();
        if self.config.debug {
            debug!(event = "message_received", session_id = %session.id(), raw = %String::from_utf8_lossy(data));
        }
        match decode_frame::<ClientEnvelope>(data, self.config.max_message_bytes) {
            Ok(envelope) => self.dispatch(session, envelope).await,
            Err(FrameError::OversizedFrame { size, max }) => {
                let err = HubError::Validation {
                    code: ErrorCode::MessageTooLarge,
                    message: format!("message of {size} bytes exceeds {max}"),
                };
                self.send_error(session, None, "frame", &err).await;
            }
            Err(err) => {
                let err = HubError::invalid(err.to_string());
                self.send_error(session, None, "frame", &err).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::handlers::tests::test_hub;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::{
        client::IntoClientRequest, Error as WsError, Message as WsMessage,
    };
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn serve(hub: Arc<HubState>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = router(hub.clone());
        let shutdown = shutdown_signal(hub.subscribe_shutdown());
        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown)
            .await;
        });
        addr
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");
        let welcome = next_json(&mut client).await;
        assert_eq!(welcome["type"], "connection_health");
        client
    }

    async fn connect_status(addr: SocketAddr, origin: Option<&str>) -> u16 {
        let mut request = format!("ws://{addr}/ws")
            .into_client_request()
            .expect("request");
        if let Some(origin) = origin {
            request
                .headers_mut()
                .insert("Origin", origin.parse().expect("header"));
        }
        match tokio_tungstenite::connect_async(request).await {
            Ok(_) => 101,
            Err(WsError::Http(response)) => response.status().as_u16(),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    async fn next_frame(client: &mut Client) -> WsMessage {
        tokio::time::timeout(Duration::from_secs(3), client.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame")
    }

    async fn next_json(client: &mut Client) -> Value {
        loop {
            if let WsMessage::Text(text) = next_frame(client).await {
                return serde_json::from_str(&text).expect("json");
            }
        }
    }

    async fn next_of(client: &mut Client, kind: &str) -> Value {
        loop {
            let value = next_json(client).await;
            if value["type"] == kind {
                return value;
            }
        }
    }

    async fn send(client: &mut Client, value: Value) {
        client
            .send(WsMessage::Text(value.to_string()))
            .await
            .expect("send");
    }

    async fn close_code(client: &mut Client) -> u16 {
        loop {
            if let WsMessage::Close(Some(frame)) = next_frame(client).await {
                return u16::from(frame.code);
            }
        }
    }

    async fn wait_active(hub: &HubState, expected: usize) {
        for _ in 0..200 {
            if hub.admission.active() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("active connections never reached {expected}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn global_ceiling_rejects_until_a_slot_frees() {
        let dir = TempDir::new().expect("tempdir");
        let (hub, _) = test_hub(
            &dir,
            HubConfig {
                max_connections: 1,
                ..HubConfig::default()
            },
        );
        let addr = serve(hub.clone()).await;

        let mut first = connect(addr).await;
        assert_eq!(connect_status(addr, None).await, 503);
        assert_eq!(hub.metrics.connection_stats().rejected, 1);
        assert_eq!(hub.metrics.connection_stats().active, 1);

        first.close(None).await.expect("close");
        wait_active(&hub, 0).await;
        let _second = connect(addr).await;
        assert_eq!(hub.metrics.connection_stats().total, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rate_and_origin_rejections_use_distinct_statuses() {
        let dir = TempDir::new().expect("tempdir");
        let (hub, _) = test_hub(
            &dir,
            HubConfig {
                rate_limit_per_ip: 1,
                allowed_origins: vec!["https://app.example.com".to_string()],
                ..HubConfig::default()
            },
        );
        let addr = serve(hub.clone()).await;

        assert_eq!(connect_status(addr, Some("https://evil.example.com")).await, 403);
        let _allowed = connect(addr).await;
        assert_eq!(connect_status(addr, Some("https://app.example.com")).await, 429);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broadcast_reaches_only_remaining_subscriber() {
        let dir = TempDir::new().expect("tempdir");
        let (hub, _) = test_hub(&dir, HubConfig::default());
        let addr = serve(hub.clone()).await;
        let mut a = connect(addr).await;
        let mut b = connect(addr).await;

        send(&mut a, json!({"type": "project_create", "request_id": "c", "payload": {"path": "/p"}})).await;
        let created = next_of(&mut a, "project_created").await;
        let project_id = created["payload"]["id"].as_str().expect("id").to_string();

        for client in [&mut a, &mut b] {
            send(client, json!({"type": "project_join", "payload": {"project_id": project_id}})).await;
            next_of(client, "project_joined").await;
        }
        send(&mut a, json!({"type": "project_leave", "payload": {"project_id": project_id}})).await;
        next_of(&mut a, "project_left").await;

        let report = hub.broadcaster.broadcast_session_reset(&project_id).await;
        assert_eq!(report.recipients, 1);
        next_of(&mut b, "session_reset").await;

        let quiet = tokio::time::timeout(Duration::from_millis(300), async {
            loop {
                let value = next_json(&mut a).await;
                if value["type"] == "session_reset" {
                    return value;
                }
            }
        })
        .await;
        assert!(quiet.is_err(), "departed session received a broadcast");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bad_frames_get_error_replies_without_closing() {
        let dir = TempDir::new().expect("tempdir");
        let (hub, _) = test_hub(
            &dir,
            HubConfig {
                max_message_bytes: 256,
                ..HubConfig::default()
            },
        );
        let addr = serve(hub).await;
        let mut client = connect(addr).await;

        client
            .send(WsMessage::Text("{not json".to_string()))
            .await
            .expect("send");
        let invalid = next_of(&mut client, "error").await;
        assert_eq!(invalid["payload"]["code"], "invalid_request");

        let oversized = json!({"type": "ping", "payload": {"blob": "x".repeat(300)}});
        send(&mut client, oversized).await;
        let too_large = next_of(&mut client, "error").await;
        assert_eq!(too_large["payload"]["code"], "message_too_large");

        send(&mut client, json!({"type": "ping", "request_id": "p-1"})).await;
        let pong = next_of(&mut client, "pong").await;
        assert_eq!(pong["request_id"], "p-1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_connections_are_closed_with_inactivity_code() {
        let dir = TempDir::new().expect("tempdir");
        let (hub, _) = test_hub(
            &dir,
            HubConfig {
                read_timeout: Duration::from_millis(300),
                ..HubConfig::default()
            },
        );
        let addr = serve(hub.clone()).await;
        let mut client = connect(addr).await;
        assert_eq!(close_code(&mut client).await, CLOSE_INACTIVITY);
        wait_active(&hub, 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unanswered_ping_closes_with_keepalive_code() {
        let dir = TempDir::new().expect("tempdir");
        let (hub, _) = test_hub(
            &dir,
            HubConfig {
                ping_interval: Duration::from_millis(100),
                pong_timeout: Duration::from_millis(200),
                ..HubConfig::default()
            },
        );
        let addr = serve(hub.clone()).await;
        let mut client = connect(addr).await;

        // The client answers pings only while it reads, so stay idle past the deadline.
        tokio::time::sleep(Duration::from_millis(800)).await;
        wait_active(&hub, 0).await;
        assert_eq!(close_code(&mut client).await, CLOSE_KEEPALIVE);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_closes_sessions_with_going_away() {
        let dir = TempDir::new().expect("tempdir");
        let (hub, _) = test_hub(&dir, HubConfig::default());
        let addr = serve(hub.clone()).await;
        let mut client = connect(addr).await;

        hub.begin_shutdown();
        assert_eq!(close_code(&mut client).await, CLOSE_GOING_AWAY);
        assert!(hub.drain(Duration::from_secs(2)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn health_endpoint_returns_summary() {
        let dir = TempDir::new().expect("tempdir");
        let (hub, _) = test_hub(&dir, HubConfig::default());
        let addr = serve(hub).await;

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("\"status\":\"healthy\""), "{response}");
    }
}
