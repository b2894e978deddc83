use std::fmt;

use serde_json::Value;

/// Stable error codes carried by `{type:"error"}` frames.
pub mod codes {
    pub const PARSE_ERROR: &str = "PARSE_ERROR";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNKNOWN_OPERATION: &str = "UNKNOWN_OPERATION";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const LIMIT_EXCEEDED: &str = "LIMIT_EXCEEDED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Client-visible failure of a single request.
///
/// Every failure carries a stable `code`, a human-readable `message` and
/// optional structured `details`. Errors returned by backends pass through
/// the pipeline unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayError {
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl GatewayError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(codes::PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, message)
    }

    pub fn unknown_operation(operation: &str) -> Self {
        Self::new(
            codes::UNKNOWN_OPERATION,
            format!("Unknown operation \"{operation}\""),
        )
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(codes::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(codes::FORBIDDEN, message)
    }

    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self::new(codes::RATE_LIMITED, "Rate limit exceeded")
            .with_details(serde_json::json!({ "retryAfterMs": retry_after_ms }))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(codes::VALIDATION_ERROR, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(codes::NOT_FOUND, message)
    }

    pub fn limit_exceeded(message: impl Into<String>) -> Self {
        Self::new(codes::LIMIT_EXCEEDED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    /// A well-known subsystem (e.g. `store`) that this server was started without.
    pub fn unavailable(namespace: &str) -> Self {
        Self::new(
            format!("{}_UNAVAILABLE", namespace.to_ascii_uppercase()),
            format!("The {namespace} subsystem is not configured"),
        )
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for GatewayError {}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        tracing::debug!(?err, "request payload rejected");
        Self::validation(err.to_string())
    }
}
