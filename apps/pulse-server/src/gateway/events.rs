//! Wire-format frames, inbound parsing and close codes.

use serde::Serialize;
use serde_json::{Number, Value};

use crate::error::GatewayError;

/// Protocol version announced in the welcome frame.
pub const PROTOCOL_VERSION: &str = "1.0.0";

// ---------------------------------------------------------------------------
// Close codes
// ---------------------------------------------------------------------------

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4001;

/// Why a connection is being closed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the socket (or it dropped).
    Normal,
    /// Graceful server shutdown reached this connection.
    ServerShutdown,
    /// The client missed a heartbeat cycle.
    HeartbeatTimeout,
    /// A socket arrived while the server was shutting down.
    Rejected,
    /// The connection's actor failed while processing an input.
    InternalError,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            Self::Normal | Self::ServerShutdown => CLOSE_NORMAL,
            Self::Rejected => CLOSE_GOING_AWAY,
            Self::HeartbeatTimeout => CLOSE_HEARTBEAT_TIMEOUT,
            Self::InternalError => CLOSE_INTERNAL_ERROR,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Normal => "normal_closure",
            Self::ServerShutdown => "server_shutdown",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Rejected => "server_shutting_down",
            Self::InternalError => "internal_error",
        }
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// A frame sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Welcome {
        version: &'static str,
        #[serde(rename = "serverTime")]
        server_time: i64,
        #[serde(rename = "requiresAuth")]
        requires_auth: bool,
    },
    Result {
        id: Number,
        data: Value,
    },
    Error {
        id: Number,
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    Push {
        channel: String,
        #[serde(rename = "subscriptionId")]
        subscription_id: String,
        data: Value,
    },
    Ping {
        timestamp: i64,
    },
    System {
        event: &'static str,
        #[serde(rename = "gracePeriodMs")]
        grace_period_ms: u64,
    },
}

impl ServerMessage {
    pub fn welcome(requires_auth: bool) -> Self {
        Self::Welcome {
            version: PROTOCOL_VERSION,
            server_time: chrono::Utc::now().timestamp_millis(),
            requires_auth,
        }
    }

    pub fn result(id: Number, data: Value) -> Self {
        Self::Result { id, data }
    }

    pub fn error(id: Number, err: &GatewayError) -> Self {
        Self::Error {
            id,
            code: err.code.clone(),
            message: err.message.clone(),
            details: err.details.clone(),
        }
    }

    pub fn push(channel: &str, subscription_id: &str, data: Value) -> Self {
        Self::Push {
            channel: channel.to_string(),
            subscription_id: subscription_id.to_string(),
            data,
        }
    }

    pub fn ping(timestamp: i64) -> Self {
        Self::Ping { timestamp }
    }

    pub fn shutdown(grace_period_ms: u64) -> Self {
        Self::System {
            event: "shutdown",
            grace_period_ms,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// A structurally valid request: `{id:number, type:"ns.op", ...}`.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Number,
    /// Full operation name, e.g. `store.get`.
    pub operation: String,
    /// The whole request object, including `id` and `type`.
    pub payload: Value,
}

impl Request {
    /// `("store", "get")` for `store.get`.
    pub fn split_operation(&self) -> Option<(&str, &str)> {
        self.operation
            .split_once('.')
            .filter(|(ns, op)| !ns.is_empty() && !op.is_empty())
    }
}

#[derive(Debug, Clone)]
pub enum Inbound {
    Request(Request),
    /// Heartbeat reply echoing the ping's timestamp.
    Pong { timestamp: i64 },
}

/// A frame rejected before reaching the pipeline, with the id to report.
#[derive(Debug, Clone)]
pub struct FrameError {
    pub id: Number,
    pub error: GatewayError,
}

impl FrameError {
    fn new(id: Option<&Number>, error: GatewayError) -> Self {
        Self {
            id: id.cloned().unwrap_or_else(|| Number::from(0)),
            error,
        }
    }
}

/// Parse and structurally validate one inbound text frame.
pub fn parse_frame(raw: &str) -> Result<Inbound, FrameError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|_| FrameError::new(None, GatewayError::parse_error("Invalid JSON")))?;

    let Value::Object(ref object) = value else {
        return Err(FrameError::new(
            None,
            GatewayError::parse_error("Message must be a JSON object"),
        ));
    };

    let id = match object.get("id") {
        Some(Value::Number(n)) => Some(n),
        _ => None,
    };

    let kind = match object.get("type") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => {
            return Err(FrameError::new(
                id,
                GatewayError::invalid_request("Missing or invalid \"type\" field"),
            ))
        }
    };

    if kind == "pong" {
        let timestamp = object
            .get("timestamp")
            .and_then(Value::as_f64)
            .filter(|t| t.is_finite())
            .ok_or_else(|| {
                FrameError::new(id, GatewayError::invalid_request("Pong requires a timestamp"))
            })?;
        return Ok(Inbound::Pong {
            timestamp: timestamp as i64,
        });
    }

    let Some(id) = id.cloned() else {
        return Err(FrameError::new(
            None,
            GatewayError::invalid_request("Missing or invalid \"id\" field"),
        ));
    };

    Ok(Inbound::Request(Request {
        id,
        operation: kind,
        payload: value,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    fn expect_err(raw: &str) -> FrameError {
        match parse_frame(raw) {
            Err(e) => e,
            Ok(other) => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_parse_error_with_id_zero() {
        let err = expect_err("{not json");
        assert_eq!(err.error.code, codes::PARSE_ERROR);
        assert_eq!(err.id, Number::from(0));
    }

    #[test]
    fn non_object_is_parse_error() {
        for raw in ["[1,2]", "42", "\"hello\"", "null"] {
            let err = expect_err(raw);
            assert_eq!(err.error.code, codes::PARSE_ERROR, "{raw}");
            assert_eq!(err.id, Number::from(0));
        }
    }

    #[test]
    fn missing_or_empty_type_is_invalid_request() {
        let err = expect_err(r#"{"id": 5}"#);
        assert_eq!(err.error.code, codes::INVALID_REQUEST);
        assert_eq!(err.id, Number::from(5));

        let err = expect_err(r#"{"id": 6, "type": ""}"#);
        assert_eq!(err.error.code, codes::INVALID_REQUEST);

        let err = expect_err(r#"{"id": 7, "type": 3}"#);
        assert_eq!(err.error.code, codes::INVALID_REQUEST);
    }

    #[test]
    fn missing_or_non_numeric_id_is_invalid_request() {
        let err = expect_err(r#"{"type": "store.get"}"#);
        assert_eq!(err.error.code, codes::INVALID_REQUEST);
        assert_eq!(err.id, Number::from(0));

        let err = expect_err(r#"{"id": "1", "type": "store.get"}"#);
        assert_eq!(err.error.code, codes::INVALID_REQUEST);
    }

    #[test]
    fn pong_needs_no_id() {
        match parse_frame(r#"{"type": "pong", "timestamp": 1700000000123}"#).unwrap() {
            Inbound::Pong { timestamp } => assert_eq!(timestamp, 1_700_000_000_123),
            other => panic!("expected pong, got {other:?}"),
        }
    }

    #[test]
    fn request_keeps_payload_and_splits_namespace() {
        let Inbound::Request(req) =
            parse_frame(r#"{"id": 1, "type": "store.get", "bucket": "b"}"#).unwrap()
        else {
            panic!("expected request");
        };
        assert_eq!(req.split_operation(), Some(("store", "get")));
        assert_eq!(req.payload["bucket"], "b");
    }

    #[test]
    fn operation_without_namespace_does_not_split() {
        let Inbound::Request(req) = parse_frame(r#"{"id": 1, "type": "ping"}"#).unwrap() else {
            panic!("expected request");
        };
        assert!(req.split_operation().is_none());
    }

    #[test]
    fn frames_serialize_to_wire_shape() {
        let json: Value =
            serde_json::to_value(ServerMessage::push("subscription", "sub_1", Value::Null))
                .unwrap();
        assert_eq!(json["type"], "push");
        assert_eq!(json["subscriptionId"], "sub_1");

        let json: Value = serde_json::to_value(ServerMessage::shutdown(5000)).unwrap();
        assert_eq!(json["type"], "system");
        assert_eq!(json["event"], "shutdown");
        assert_eq!(json["gracePeriodMs"], 5000);

        let err = GatewayError::forbidden("no");
        let json: Value = serde_json::to_value(ServerMessage::error(Number::from(3), &err)).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["code"], "FORBIDDEN");
        assert!(json.get("details").is_none());

        let json: Value = serde_json::to_value(ServerMessage::welcome(true)).unwrap();
        assert_eq!(json["type"], "welcome");
        assert_eq!(json["version"], PROTOCOL_VERSION);
        assert_eq!(json["requiresAuth"], true);
        assert!(json["serverTime"].as_i64().unwrap() > 0);
    }

    #[test]
    fn close_reasons() {
        assert_eq!(CloseReason::Normal.code(), CloseReason::ServerShutdown.code());
        assert_ne!(CloseReason::Normal.reason(), CloseReason::ServerShutdown.reason());
        assert_eq!(CloseReason::Rejected.code(), CLOSE_GOING_AWAY);
        assert_eq!(CloseReason::Rejected.reason(), "server_shutting_down");
        assert_eq!(CloseReason::HeartbeatTimeout.reason(), "heartbeat_timeout");
    }
}
