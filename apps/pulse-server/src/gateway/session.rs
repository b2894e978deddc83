//! Per-connection state, exclusively owned by its connection actor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Utc};

use super::heartbeat::HeartbeatMonitor;
use crate::auth::Session;
use crate::backend::Unsubscribe;

struct ActiveSubscription {
    namespace: String,
    unsubscribe: Unsubscribe,
}

/// State for a single WebSocket connection.
pub struct ConnectionState {
    /// Monotonically assigned identifier (`conn-<n>`).
    pub connection_id: String,
    pub remote_address: SocketAddr,
    /// Authenticated identity, if any.
    pub session: Option<Session>,
    pub heartbeat: HeartbeatMonitor,
    /// subscription id → release action, across every namespace.
    subscriptions: HashMap<String, ActiveSubscription>,
    cleaned_up: bool,
}

impl ConnectionState {
    pub fn new(connection_id: String, remote_address: SocketAddr, heartbeat: HeartbeatMonitor) -> Self {
        Self {
            connection_id,
            remote_address,
            session: None,
            heartbeat,
            subscriptions: HashMap::new(),
            cleaned_up: false,
        }
    }

    /// Clear the session if it has expired. Returns the live session, if any.
    pub fn active_session(&mut self, now: DateTime<Utc>) -> Option<&Session> {
        if self.session.as_ref().is_some_and(|s| s.is_expired(now)) {
            tracing::debug!(connection_id = %self.connection_id, "session expired");
            self.session = None;
        }
        self.session.as_ref()
    }

    /// Key used for rate limiting: user id once authenticated, else the peer IP.
    pub fn rate_limit_key(&self) -> String {
        match &self.session {
            Some(session) => session.user_id.clone(),
            None => self.remote_address.ip().to_string(),
        }
    }

    pub fn add_subscription(&mut self, id: String, namespace: &str, unsubscribe: Unsubscribe) {
        self.subscriptions.insert(
            id,
            ActiveSubscription {
                namespace: namespace.to_string(),
                unsubscribe,
            },
        );
    }

    /// Remove a subscription belonging to `namespace`, returning its release action.
    pub fn take_subscription(&mut self, id: &str, namespace: &str) -> Option<Unsubscribe> {
        match self.subscriptions.get(id) {
            Some(sub) if sub.namespace == namespace => {
                self.subscriptions.remove(id).map(|sub| sub.unsubscribe)
            }
            _ => None,
        }
    }

    pub fn has_subscription(&self, id: &str) -> bool {
        self.subscriptions.contains_key(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn subscription_count_in(&self, namespace: &str) -> usize {
        self.subscriptions
            .values()
            .filter(|s| s.namespace == namespace)
            .count()
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up
    }

    /// Release every subscription exactly once. A failing (or panicking)
    /// unsubscribe is logged and does not stop the rest. Subsequent calls are
    /// no-ops. Returns how many subscriptions were released.
    pub fn release_all(&mut self) -> usize {
        if self.cleaned_up {
            return 0;
        }
        self.cleaned_up = true;

        let mut released = 0;
        for (id, sub) in self.subscriptions.drain() {
            match panic::catch_unwind(AssertUnwindSafe(sub.unsubscribe)) {
                Ok(Ok(())) => released += 1,
                Ok(Err(err)) => tracing::warn!(
                    connection_id = %self.connection_id,
                    subscription_id = %id,
                    namespace = %sub.namespace,
                    %err,
                    "unsubscribe failed"
                ),
                Err(_) => tracing::warn!(
                    connection_id = %self.connection_id,
                    subscription_id = %id,
                    namespace = %sub.namespace,
                    "unsubscribe panicked"
                ),
            }
        }
        released
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        // Covers actors aborted mid-request during force-stop.
        self.release_all();
    }
}
