#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use collabornest_gateway::auth::JwtTokenVerifier;
use collabornest_gateway::{serve, Gateway, GatewayConfig};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const SECRET: &str = "your_super_secure_jwt_secret_32_characters_minimum";
pub const ISSUER: &str = "collabornest";
pub const AUDIENCE: &str = "collabornest-users";
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

pub type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub gateway: Gateway,
    pub verifier: JwtTokenVerifier,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(configure: impl FnOnce(&mut GatewayConfig)) -> Self {
        let mut config = GatewayConfig {
            jwt_secret: SECRET.to_string(),
            jwt_issuer: ISSUER.to_string(),
            jwt_audience: AUDIENCE.to_string(),
            ..GatewayConfig::default()
        };
        configure(&mut config);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");
        let gateway = Gateway::new(config).expect("gateway should initialize");
        let verifier =
            JwtTokenVerifier::new(SECRET, ISSUER, AUDIENCE).expect("verifier should build");

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server_gateway = gateway.clone();
        let task = tokio::spawn(async move {
            serve(listener, server_gateway, async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("gateway server should run");
        });

        Self { addr, gateway, verifier, shutdown: Some(shutdown), task }
    }

    pub fn token(&self, subject_id: &str) -> String {
        self.verifier
            .issue_token(subject_id, Some(&format!("user_{subject_id}")), None)
            .expect("token should be issued")
    }

    pub fn url(&self, token: &str) -> String {
        format!("ws://{}/ws/collaboration?token={token}", self.addr)
    }

    /// Connect and consume the `connected` frame.
    pub async fn connect(&self, subject_id: &str) -> Client {
        let (socket, _) = connect_async(self.url(&self.token(subject_id)))
            .await
            .expect("client should connect");
        let mut client = Client { socket, connection_id: String::new() };

        let connected = client.expect_event("connected").await;
        assert_eq!(connected["userId"], subject_id);
        client.connection_id = connected["connectionId"]
            .as_str()
            .expect("connected frame should carry a connection id")
            .to_string();
        client
    }

    /// Attempt a handshake that is expected to fail at the HTTP layer.
    pub async fn rejected_status(&self, url: String) -> StatusCode {
        match connect_async(url).await {
            Err(tungstenite::Error::Http(response)) => response.status(),
            Err(other) => panic!("expected an HTTP rejection, got {other:?}"),
            Ok(_) => panic!("handshake should have been rejected"),
        }
    }

    pub fn trigger_shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    pub async fn pool_count(&self, subject_id: &str) -> usize {
        self.gateway.manager().pool().count_for(subject_id).await
    }

    pub async fn wait_for_pool_count(&self, subject_id: &str, expected: usize) {
        let deadline = Instant::now() + FRAME_TIMEOUT;
        while self.pool_count(subject_id).await != expected {
            assert!(
                Instant::now() < deadline,
                "pool count for {subject_id} never reached {expected}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct Client {
    socket: ClientSocket,
    pub connection_id: String,
}

impl Client {
    pub fn from_socket(socket: ClientSocket) -> Self {
        Self { socket, connection_id: String::new() }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.socket
            .send(WsMessage::Text(value.to_string().into()))
            .await
            .expect("client should send frame");
    }

    pub async fn join(&mut self, resource_id: &str, mode: &str) -> Value {
        self.send_json(json!({
            "type": "resource:join",
            "resourceId": resource_id,
            "resourceType": "page",
            "mode": mode,
        }))
        .await;
        self.expect_event("resource:joined").await
    }

    pub async fn leave(&mut self, resource_id: &str) -> Value {
        self.send_json(json!({ "type": "resource:leave", "resourceId": resource_id })).await;
        self.expect_event("resource:left").await
    }

    /// Next JSON frame, answering pings on the way.
    pub async fn next_event(&mut self) -> Value {
        loop {
            let next = timeout(FRAME_TIMEOUT, self.socket.next())
                .await
                .expect("timed out waiting for websocket frame");
            let message =
                next.expect("websocket should remain open").expect("websocket read should succeed");

            match message {
                WsMessage::Text(raw) => {
                    return serde_json::from_str(raw.as_str()).expect("frame should be JSON")
                }
                WsMessage::Ping(payload) => {
                    self.socket
                        .send(WsMessage::Pong(payload))
                        .await
                        .expect("websocket should reply to ping");
                }
                WsMessage::Close(frame) => panic!("websocket closed unexpectedly: {frame:?}"),
                WsMessage::Binary(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
            }
        }
    }

    /// Skip frames until one of type `event` arrives.
    pub async fn expect_event(&mut self, event: &str) -> Value {
        loop {
            let frame = self.next_event().await;
            if frame["type"] == event {
                return frame;
            }
        }
    }

    /// Collect every JSON frame that arrives within `window`.
    pub async fn drain_for(&mut self, window: Duration) -> Vec<Value> {
        let deadline = Instant::now() + window;
        let mut frames = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return frames;
            }
            match timeout(remaining, self.socket.next()).await {
                Err(_) => return frames,
                Ok(Some(Ok(WsMessage::Text(raw)))) => {
                    frames.push(serde_json::from_str(raw.as_str()).expect("frame should be JSON"))
                }
                Ok(Some(Ok(WsMessage::Ping(payload)))) => {
                    let _ = self.socket.send(WsMessage::Pong(payload)).await;
                }
                Ok(Some(Ok(WsMessage::Close(frame)))) => {
                    panic!("websocket closed unexpectedly: {frame:?}")
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(error))) => panic!("websocket read failed: {error}"),
                Ok(None) => panic!("websocket ended unexpectedly"),
            }
        }
    }

    /// Read until the server closes; returns the close code, if any.
    pub async fn expect_close(&mut self) -> Option<u16> {
        loop {
            let next = timeout(FRAME_TIMEOUT, self.socket.next())
                .await
                .expect("timed out waiting for close frame");
            match next {
                Some(Ok(WsMessage::Close(frame))) => {
                    return frame.map(|frame| u16::from(frame.code));
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return None,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}
