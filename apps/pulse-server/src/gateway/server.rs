//! WebSocket upgrade handler.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::SinkExt;

use crate::AppState;

use super::events::CloseReason;

pub fn router(path: &str) -> Router<AppState> {
    Router::new().route(path, get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_address): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let max_payload = state.config.max_payload_bytes;
    ws.max_message_size(max_payload)
        .max_frame_size(max_payload)
        .on_upgrade(move |socket| handle_connection(socket, remote_address, state))
}

async fn handle_connection(socket: WebSocket, remote_address: SocketAddr, state: AppState) {
    if !state.accepting.load(Ordering::Acquire) {
        tracing::warn!(remote_addr = %remote_address, "connection rejected during shutdown");
        reject(socket, CloseReason::Rejected).await;
        return;
    }
    // `None` means shutdown began after the check above; the socket is closed.
    let _ = state.supervisor.add_connection(socket, remote_address);
}

async fn reject(mut socket: WebSocket, reason: CloseReason) {
    let frame = CloseFrame {
        code: reason.code(),
        reason: reason.reason().to_string().into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
    let _ = socket.close().await;
}
