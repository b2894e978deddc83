pub mod actor;
pub mod backpressure;
pub mod events;
pub mod heartbeat;
pub mod outbound;
pub mod pipeline;
pub mod rate_limit;
pub mod server;
pub mod session;
pub mod supervisor;

use std::sync::Arc;

use crate::auth::AuthConfig;
use crate::backend::HandlerRegistry;
use crate::config::{BackpressureConfig, ConnectionLimits, HeartbeatConfig};

use self::rate_limit::RateLimiter;

/// Read-only context shared by every connection actor.
pub struct GatewayContext {
    pub handlers: HandlerRegistry,
    pub auth: Option<AuthConfig>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub heartbeat: HeartbeatConfig,
    pub backpressure: BackpressureConfig,
    pub limits: ConnectionLimits,
}

impl GatewayContext {
    pub fn requires_auth(&self) -> bool {
        self.auth.as_ref().is_some_and(|a| a.required)
    }
}
