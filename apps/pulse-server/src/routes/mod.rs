pub mod health;

use axum::Router;

use crate::AppState;

pub fn router(ws_path: &str) -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router(ws_path))
}
