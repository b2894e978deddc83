pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod routes;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use auth::AuthConfig;
use backend::HandlerRegistry;
use config::ServerConfig;
use gateway::supervisor::ConnectionSupervisor;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<ConnectionSupervisor>,
    /// Cleared when shutdown begins; late upgrades are closed immediately.
    pub accepting: Arc<AtomicBool>,
    pub config: Arc<ServerConfig>,
}

/// Collaborators plugged into the gateway at startup.
#[derive(Clone, Default)]
pub struct Services {
    pub handlers: HandlerRegistry,
    pub auth: Option<AuthConfig>,
}
