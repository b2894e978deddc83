//! Ordered, short-circuiting processing of one inbound frame:
//! parse → validate → authenticate → rate-limit → authorize → route → respond.

use std::sync::Arc;

use chrono::Utc;
use pulse_common::id::{PrefixedId, SubscriptionId};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::actor::ActorInput;
use super::events::{parse_frame, Inbound, Request, ServerMessage};
use super::rate_limit::RateDecision;
use super::session::ConnectionState;
use super::GatewayContext;
use crate::auth::{self, resource};
use crate::backend::{Backend, HandlerRegistry, PushCallback};
use crate::error::GatewayError;

/// Process one raw frame. Returns the reply to send, if any.
pub(crate) async fn process(
    ctx: &GatewayContext,
    state: &mut ConnectionState,
    mailbox: &mpsc::Sender<ActorInput>,
    raw: &str,
) -> Option<ServerMessage> {
    let request = match parse_frame(raw) {
        Ok(Inbound::Request(request)) => request,
        Ok(Inbound::Pong { timestamp }) => {
            state.heartbeat.record_pong(timestamp);
            return None;
        }
        Err(rejected) => {
            tracing::debug!(
                connection_id = %state.connection_id,
                code = %rejected.error.code,
                "inbound frame rejected"
            );
            return Some(ServerMessage::error(rejected.id, &rejected.error));
        }
    };

    let reply = match run_stages(ctx, state, mailbox, &request).await {
        Ok(data) => ServerMessage::result(request.id.clone(), data),
        Err(err) => ServerMessage::error(request.id.clone(), &err),
    };
    Some(reply)
}

async fn run_stages(
    ctx: &GatewayContext,
    state: &mut ConnectionState,
    mailbox: &mpsc::Sender<ActorInput>,
    request: &Request,
) -> Result<Value, GatewayError> {
    authenticate(ctx, state, request)?;
    rate_limit(ctx, state)?;
    authorize(ctx, state, request)?;
    route(ctx, state, mailbox, request).await
}

fn authenticate(
    ctx: &GatewayContext,
    state: &mut ConnectionState,
    request: &Request,
) -> Result<(), GatewayError> {
    let Some(auth) = &ctx.auth else {
        return Ok(());
    };
    let has_session = state.active_session(Utc::now()).is_some();
    if !auth.required || has_session || auth::is_bootstrap_operation(&request.operation) {
        return Ok(());
    }
    Err(GatewayError::unauthorized("Authentication required"))
}

fn rate_limit(ctx: &GatewayContext, state: &ConnectionState) -> Result<(), GatewayError> {
    let Some(limiter) = &ctx.rate_limiter else {
        return Ok(());
    };
    let key = state.rate_limit_key();
    match limiter.consume(&key) {
        RateDecision::Allowed { .. } => Ok(()),
        RateDecision::Limited { retry_after_ms } => {
            tracing::warn!(
                connection_id = %state.connection_id,
                %key,
                retry_after_ms,
                "rate limit exceeded"
            );
            Err(GatewayError::rate_limited(retry_after_ms))
        }
    }
}

fn authorize(
    ctx: &GatewayContext,
    state: &ConnectionState,
    request: &Request,
) -> Result<(), GatewayError> {
    if auth::is_bootstrap_operation(&request.operation) {
        return Ok(());
    }
    let (Some(policy), Some(session)) = (
        ctx.auth.as_ref().and_then(|a| a.policy.as_ref()),
        state.session.as_ref(),
    ) else {
        return Ok(());
    };

    let namespace = request
        .split_operation()
        .map(|(ns, _)| ns)
        .unwrap_or(request.operation.as_str());
    let target = resource::resource_for(namespace, &request.payload);

    if policy.check(session, &request.operation, &target) {
        Ok(())
    } else {
        Err(GatewayError::forbidden(format!(
            "No permission for {} on {}",
            request.operation, target
        )))
    }
}

async fn route(
    ctx: &GatewayContext,
    state: &mut ConnectionState,
    mailbox: &mpsc::Sender<ActorInput>,
    request: &Request,
) -> Result<Value, GatewayError> {
    let Some((namespace, action)) = request.split_operation() else {
        return Err(GatewayError::unknown_operation(&request.operation));
    };

    if namespace == "auth" {
        return auth_operation(ctx, state, action, request).await;
    }

    let backend = ctx
        .handlers
        .get(namespace)
        .ok_or_else(|| ctx.handlers.missing(namespace, &request.operation))?;

    match action {
        "subscribe" => subscribe(ctx, state, mailbox, namespace, backend, request).await,
        "unsubscribe" => unsubscribe(state, namespace, request),
        _ => backend.call(action, &request.payload).await,
    }
}

// ---------------------------------------------------------------------------
// auth.*
// ---------------------------------------------------------------------------

async fn auth_operation(
    ctx: &GatewayContext,
    state: &mut ConnectionState,
    action: &str,
    request: &Request,
) -> Result<Value, GatewayError> {
    let Some(auth) = &ctx.auth else {
        return Err(GatewayError::unknown_operation(&request.operation));
    };

    match action {
        "login" => {
            let token = request
                .payload
                .get("token")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| GatewayError::validation("Missing \"token\""))?;

            let session = auth
                .validator
                .validate(token)
                .await?
                .ok_or_else(|| GatewayError::unauthorized("Invalid token"))?;
            if session.is_expired(Utc::now()) {
                return Err(GatewayError::unauthorized("Token expired"));
            }

            tracing::info!(
                connection_id = %state.connection_id,
                user_id = %session.user_id,
                "connection authenticated"
            );
            let body = serde_json::to_value(&session)
                .map_err(|_| GatewayError::internal("Failed to encode session"))?;
            state.session = Some(session);
            Ok(body)
        }
        "logout" => {
            state.session = None;
            Ok(json!({ "loggedOut": true }))
        }
        "whoami" => match state.active_session(Utc::now()) {
            Some(session) => {
                let mut body = serde_json::to_value(session)
                    .map_err(|_| GatewayError::internal("Failed to encode session"))?;
                body["authenticated"] = Value::Bool(true);
                Ok(body)
            }
            None => Ok(json!({ "authenticated": false })),
        },
        _ => Err(GatewayError::unknown_operation(&request.operation)),
    }
}

// ---------------------------------------------------------------------------
// <ns>.subscribe / <ns>.unsubscribe
// ---------------------------------------------------------------------------

async fn subscribe(
    ctx: &GatewayContext,
    state: &mut ConnectionState,
    mailbox: &mpsc::Sender<ActorInput>,
    namespace: &str,
    backend: &Arc<dyn Backend>,
    request: &Request,
) -> Result<Value, GatewayError> {
    let max = ctx.limits.max_subscriptions_per_connection;
    if state.subscription_count() >= max {
        return Err(GatewayError::limit_exceeded(format!(
            "Subscription limit of {max} per connection reached"
        )));
    }

    let query = resource::primary_target(namespace, &request.payload)
        .ok_or_else(|| GatewayError::validation("Missing subscription target"))?;
    let params = request.payload.get("params");

    let subscription_id = SubscriptionId::generate();
    let callback = push_callback(
        mailbox.clone(),
        subscription_id.clone(),
        HandlerRegistry::push_channel(namespace).to_string(),
    );

    let subscription = backend.subscribe(query, params, callback).await?;
    state.add_subscription(subscription_id.clone(), namespace, subscription.unsubscribe);

    let mut body = json!({ "subscriptionId": subscription_id });
    if let Some(initial) = subscription.initial {
        body["initial"] = initial;
    }
    Ok(body)
}

fn unsubscribe(
    state: &mut ConnectionState,
    namespace: &str,
    request: &Request,
) -> Result<Value, GatewayError> {
    let id = request
        .payload
        .get("subscriptionId")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::validation("Missing \"subscriptionId\""))?;

    let release = state
        .take_subscription(id, namespace)
        .ok_or_else(|| GatewayError::not_found(format!("Subscription {id} not found")))?;
    release()?;
    Ok(json!({ "unsubscribed": true }))
}

/// Callback handed to a backend: forwards changes into the actor's mailbox.
/// A full mailbox drops the update; the next change carries a fresh snapshot.
fn push_callback(
    mailbox: mpsc::Sender<ActorInput>,
    subscription_id: String,
    channel: String,
) -> PushCallback {
    Arc::new(move |data: Value| {
        let input = ActorInput::Push {
            subscription_id: subscription_id.clone(),
            channel: channel.clone(),
            data,
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = mailbox.try_send(input) {
            tracing::debug!(subscription_id = %subscription_id, "mailbox full; push dropped");
        }
    })
}
