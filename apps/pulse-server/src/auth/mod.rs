//! Authentication and authorization seams.
//!
//! The gateway never validates tokens or evaluates permissions itself; it
//! depends only on [`TokenValidator`] and [`PermissionPolicy`].

pub mod resource;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::GatewayError;

/// An authenticated identity attached to one connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub roles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            roles,
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Resolves a client-supplied token into a session.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// `Ok(None)` means the token is well-formed but not valid.
    async fn validate(&self, token: &str) -> Result<Option<Session>, GatewayError>;
}

/// Decides whether a session may run an operation against a resource.
pub trait PermissionPolicy: Send + Sync {
    fn check(&self, session: &Session, operation: &str, resource: &str) -> bool;
}

/// Authentication wiring supplied at startup.
#[derive(Clone)]
pub struct AuthConfig {
    pub validator: Arc<dyn TokenValidator>,
    pub policy: Option<Arc<dyn PermissionPolicy>>,
    /// When set, every non-bootstrap operation needs a session.
    pub required: bool,
}

impl AuthConfig {
    pub fn new(validator: Arc<dyn TokenValidator>) -> Self {
        Self {
            validator,
            policy: None,
            required: true,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn PermissionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Operations that must work before a session exists.
pub fn is_bootstrap_operation(operation: &str) -> bool {
    matches!(operation, "auth.login" | "auth.logout" | "auth.whoami")
}
