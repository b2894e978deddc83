#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use pulse_server::auth::{AuthConfig, PermissionPolicy, Session, TokenValidator};
use pulse_server::backend::memory::MemoryStore;
use pulse_server::backend::{Backend, HandlerRegistry};
use pulse_server::config::ServerConfig;
use pulse_server::error::GatewayError;
use pulse_server::lifecycle::GatewayServer;
use pulse_server::Services;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Loopback config on an ephemeral port.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..ServerConfig::default()
    }
}

/// Store + a backend that panics on `boom.*`.
pub fn test_services() -> Services {
    Services {
        handlers: HandlerRegistry::new()
            .with("store", Arc::new(MemoryStore::new()))
            .with("boom", Arc::new(PanickingBackend)),
        auth: None,
    }
}

pub fn with_auth(mut services: Services) -> Services {
    services.auth = Some(AuthConfig::new(Arc::new(StaticTokens)).with_policy(Arc::new(DenySecrets)));
    services
}

pub async fn start(config: ServerConfig, services: Services) -> GatewayServer {
    GatewayServer::start(config, services)
        .await
        .expect("server should start")
}

/// Tokens are accepted iff they start with `token-`; the rest is the user id.
pub struct StaticTokens;

#[async_trait]
impl TokenValidator for StaticTokens {
    async fn validate(&self, token: &str) -> Result<Option<Session>, GatewayError> {
        Ok(token
            .strip_prefix("token-")
            .map(|user| Session::new(user, vec!["user".to_string()])))
    }
}

/// Denies everything touching the `secrets` resource.
pub struct DenySecrets;

impl PermissionPolicy for DenySecrets {
    fn check(&self, _session: &Session, _operation: &str, resource: &str) -> bool {
        resource != "secrets"
    }
}

pub struct PanickingBackend;

#[async_trait]
impl Backend for PanickingBackend {
    async fn call(&self, operation: &str, _request: &Value) -> Result<Value, GatewayError> {
        panic!("backend exploded on {operation}");
    }
}

/// Never answers within a test's lifetime.
pub struct SlowBackend;

#[async_trait]
impl Backend for SlowBackend {
    async fn call(&self, _operation: &str, _request: &Value) -> Result<Value, GatewayError> {
        time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    }
}

/// Open a socket and return it together with the welcome frame.
pub async fn connect(server: &GatewayServer) -> (Client, Value) {
    let url = format!("ws://{}{}", server.local_addr(), server.config().path);
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "welcome");
    (ws, welcome)
}

/// Next JSON text frame. Panics on close or timeout.
pub async fn next_json(ws: &mut Client) -> Value {
    loop {
        let msg = time::timeout(READ_TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("frame is JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Next JSON frame that is not a heartbeat ping.
pub async fn next_reply(ws: &mut Client) -> Value {
    loop {
        let frame = next_json(ws).await;
        if frame["type"] != "ping" {
            return frame;
        }
    }
}

pub async fn send_json(ws: &mut Client, frame: Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("ws send");
}

pub async fn request(ws: &mut Client, frame: Value) -> Value {
    send_json(ws, frame).await;
    next_reply(ws).await
}

/// Read until the server closes the socket. Returns `(code, reason)` of the
/// close frame, ignoring everything else.
pub async fn wait_for_close(ws: &mut Client, within: Duration) -> Option<(u16, String)> {
    time::timeout(within, async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Close(frame)) => {
                    return frame.map(|f| (u16::from(f.code), f.reason.as_str().to_string()));
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    })
    .await
    .expect("socket should be closed in time")
}
