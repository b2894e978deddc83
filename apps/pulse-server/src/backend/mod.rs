//! External collaborators (store, rules engine, procedures, ...) and the
//! namespace registry the request pipeline routes through.

pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::GatewayError;

/// Invoked by a backend whenever subscribed data changes.
pub type PushCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Releases a subscription. Called at most once.
pub type Unsubscribe = Box<dyn FnOnce() -> Result<(), GatewayError> + Send>;

/// A live subscription handed back by [`Backend::subscribe`].
pub struct Subscription {
    /// Result of the query at subscription time, if the backend computes one.
    pub initial: Option<Value>,
    pub unsubscribe: Unsubscribe,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("initial", &self.initial)
            .finish_non_exhaustive()
    }
}

/// A subsystem reachable under one operation namespace (`store.*`, `rules.*`).
///
/// Implementations must be safe to call concurrently from many connections.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run `operation` (the part after the namespace prefix) with the full
    /// request object. Errors are passed to the client unchanged.
    async fn call(&self, operation: &str, request: &Value) -> Result<Value, GatewayError>;

    /// Subscribe to changes of `query`. The default rejects subscriptions.
    async fn subscribe(
        &self,
        query: &str,
        params: Option<&Value>,
        callback: PushCallback,
    ) -> Result<Subscription, GatewayError> {
        let _ = (query, params, callback);
        Err(GatewayError::unknown_operation("subscribe"))
    }
}

/// Namespaces with a dedicated "unavailable" error when not configured.
const WELL_KNOWN_NAMESPACES: &[&str] = &["store", "rules"];

/// Maps operation namespaces to backends. Populated once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Backend>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, namespace: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        self.register(namespace, backend);
        self
    }

    pub fn register(&mut self, namespace: impl Into<String>, backend: Arc<dyn Backend>) {
        self.handlers.insert(namespace.into(), backend);
    }

    pub fn get(&self, namespace: &str) -> Option<&Arc<dyn Backend>> {
        self.handlers.get(namespace)
    }

    /// Error reported for a namespace with no registered backend.
    pub fn missing(&self, namespace: &str, operation: &str) -> GatewayError {
        if WELL_KNOWN_NAMESPACES.contains(&namespace) {
            GatewayError::unavailable(namespace)
        } else {
            GatewayError::unknown_operation(operation)
        }
    }

    /// Channel name stamped on pushes from subscriptions in `namespace`.
    pub fn push_channel(namespace: &str) -> &str {
        match namespace {
            "store" => "subscription",
            "rules" => "event",
            other => other,
        }
    }
}
