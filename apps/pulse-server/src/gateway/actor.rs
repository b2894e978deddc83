//! One isolated execution unit per connection.
//!
//! Inbound frames, subscription pushes and heartbeat ticks all funnel into a
//! single loop, so exactly one input is processed at a time for a given
//! connection. Nothing here is shared with other connections except the
//! read-only [`GatewayContext`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::backpressure::is_backpressured;
use super::events::{CloseReason, ServerMessage};
use super::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use super::outbound::OutboundQueue;
use super::pipeline;
use super::session::ConnectionState;
use super::GatewayContext;

/// Bounded so a flooding client is slowed down by TCP instead of memory.
pub const MAILBOX_CAPACITY: usize = 1024;

/// Inputs processed in arrival order by the actor loop.
#[derive(Debug)]
pub enum ActorInput {
    Frame(String),
    Push {
        subscription_id: String,
        channel: String,
        data: Value,
    },
    SocketClosed,
}

/// Out-of-band instructions from the supervisor. Served before queued inputs.
#[derive(Debug)]
pub enum Control {
    Send(ServerMessage),
    Terminate {
        reason: CloseReason,
        done: oneshot::Sender<()>,
    },
}

/// Receiving ends of an actor's queues, kept apart from the actor so the
/// loop can borrow the actor mutably while waiting on them.
pub struct ActorInbox {
    inputs: mpsc::Receiver<ActorInput>,
    control: mpsc::UnboundedReceiver<Control>,
}

/// Sending ends, handed to the socket reader and the supervisor.
pub struct ActorHandles {
    pub mailbox: mpsc::Sender<ActorInput>,
    pub control: mpsc::UnboundedSender<Control>,
}

enum Event {
    Control(Control),
    Input(Option<ActorInput>),
    Tick,
}

pub struct ConnectionActor {
    ctx: Arc<GatewayContext>,
    state: ConnectionState,
    outbound: OutboundQueue,
    /// Cloned into push callbacks handed to backends.
    mailbox: mpsc::Sender<ActorInput>,
}

impl ConnectionActor {
    pub fn new(
        connection_id: String,
        remote_address: SocketAddr,
        ctx: Arc<GatewayContext>,
        outbound: OutboundQueue,
    ) -> (Self, ActorInbox, ActorHandles) {
        let (mailbox, inputs) = mpsc::channel(MAILBOX_CAPACITY);
        let (control_tx, control) = mpsc::unbounded_channel();
        let heartbeat = HeartbeatMonitor::new(ctx.heartbeat.interval());

        let actor = Self {
            state: ConnectionState::new(connection_id, remote_address, heartbeat),
            ctx,
            outbound,
            mailbox: mailbox.clone(),
        };
        let inbox = ActorInbox { inputs, control };
        let handles = ActorHandles {
            mailbox,
            control: control_tx,
        };
        (actor, inbox, handles)
    }

    pub fn connection_id(&self) -> &str {
        &self.state.connection_id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Announce protocol version, server time and whether auth is required.
    pub fn init(&mut self) {
        self.outbound
            .send(&ServerMessage::welcome(self.ctx.requires_auth()));
    }

    /// Run until the connection ends. Returns why it ended.
    pub async fn run(&mut self, inbox: &mut ActorInbox) -> CloseReason {
        self.init();
        let mut ticker = self.state.heartbeat.ticker();

        loop {
            let event = tokio::select! {
                biased;
                Some(control) = inbox.control.recv() => Event::Control(control),
                input = inbox.inputs.recv() => Event::Input(input),
                _ = ticker.tick() => Event::Tick,
            };

            match event {
                Event::Control(Control::Send(message)) => self.outbound.send(&message),
                Event::Control(Control::Terminate { reason, done }) => {
                    self.terminate(reason);
                    let _ = done.send(());
                    return reason;
                }
                Event::Input(Some(ActorInput::Frame(raw))) => self.on_message(&raw).await,
                Event::Input(Some(ActorInput::Push {
                    subscription_id,
                    channel,
                    data,
                })) => {
                    self.on_push(&subscription_id, &channel, data);
                }
                Event::Input(Some(ActorInput::SocketClosed)) | Event::Input(None) => {
                    self.terminate(CloseReason::Normal);
                    return CloseReason::Normal;
                }
                Event::Tick => {
                    if let Some(reason) = self.on_heartbeat_tick() {
                        self.terminate(reason);
                        return reason;
                    }
                }
            }
        }
    }

    pub async fn on_message(&mut self, raw: &str) {
        if let Some(reply) = pipeline::process(&self.ctx, &mut self.state, &self.mailbox, raw).await
        {
            self.outbound.send(&reply);
        }
    }

    /// Deliver a push unless its subscription is gone or the socket is
    /// backpressured. Returns whether it was sent.
    pub fn on_push(&mut self, subscription_id: &str, channel: &str, data: Value) -> bool {
        if !self.state.has_subscription(subscription_id) {
            // Unsubscribed while the push was queued.
            return false;
        }
        if is_backpressured(self.outbound.buffered(), &self.ctx.backpressure) {
            tracing::debug!(
                connection_id = %self.state.connection_id,
                subscription_id,
                buffered = self.outbound.buffered(),
                "push dropped under backpressure"
            );
            return false;
        }
        self.outbound
            .send(&ServerMessage::push(channel, subscription_id, data));
        true
    }

    /// Returns a close reason when the connection must be terminated.
    pub fn on_heartbeat_tick(&mut self) -> Option<CloseReason> {
        let now = chrono::Utc::now().timestamp_millis();
        match self.state.heartbeat.on_tick(now) {
            HeartbeatAction::SendPing(timestamp) => {
                self.outbound.send(&ServerMessage::ping(timestamp));
                None
            }
            HeartbeatAction::TimedOut => {
                tracing::warn!(
                    connection_id = %self.state.connection_id,
                    last_ping_at = self.state.heartbeat.last_ping_at(),
                    last_pong_at = self.state.heartbeat.last_pong_at(),
                    "heartbeat timeout"
                );
                Some(CloseReason::HeartbeatTimeout)
            }
        }
    }

    /// Release subscriptions and close the socket. Idempotent.
    pub fn terminate(&mut self, reason: CloseReason) {
        if self.state.is_cleaned_up() {
            return;
        }
        let released = self.state.release_all();
        self.outbound.close(reason);
        tracing::info!(
            connection_id = %self.state.connection_id,
            remote_addr = %self.state.remote_address,
            reason = reason.reason(),
            released,
            "connection closed"
        );
    }
}

/// Forward a socket's inbound frames and its close into the actor's mailbox.
pub fn spawn_reader(
    mut stream: SplitStream<WebSocket>,
    mailbox: mpsc::Sender<ActorInput>,
    connection_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            let input = match msg {
                Ok(Message::Text(text)) => ActorInput::Frame(text.to_string()),
                Ok(Message::Binary(bytes)) => {
                    ActorInput::Frame(String::from_utf8_lossy(&bytes).into_owned())
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::debug!(?e, %connection_id, "ws read error");
                    break;
                }
            };
            if mailbox.send(input).await.is_err() {
                return;
            }
        }
        let _ = mailbox.send(ActorInput::SocketClosed).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use crate::backend::HandlerRegistry;
    use crate::config::{BackpressureConfig, ConnectionLimits, HeartbeatConfig};
    use crate::gateway::outbound::Outgoing;

    fn context(backpressure: BackpressureConfig) -> Arc<GatewayContext> {
        Arc::new(GatewayContext {
            handlers: HandlerRegistry::new(),
            auth: None,
            rate_limiter: None,
            heartbeat: HeartbeatConfig {
                interval_ms: 100,
                timeout_ms: 100,
            },
            backpressure,
            limits: ConnectionLimits::default(),
        })
    }

    fn actor(
        backpressure: BackpressureConfig,
    ) -> (ConnectionActor, ActorInbox, ActorHandles, mpsc::UnboundedReceiver<Outgoing>) {
        let (outbound, rx) = OutboundQueue::detached();
        let (actor, inbox, handles) = ConnectionActor::new(
            "conn-1".to_string(),
            "127.0.0.1:40000".parse().unwrap(),
            context(backpressure),
            outbound,
        );
        (actor, inbox, handles, rx)
    }

    fn half_full() -> BackpressureConfig {
        BackpressureConfig {
            max_buffered_bytes: 1000,
            high_water_mark: 0.5,
        }
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<Outgoing> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn counting_subscription(actor: &mut ConnectionActor, id: &str, counter: &Arc<AtomicUsize>) {
        let counter = counter.clone();
        actor.state.add_subscription(
            id.to_string(),
            "store",
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
    }

    #[tokio::test]
    async fn init_sends_welcome() {
        let (mut actor, _inbox, _handles, mut rx) = actor(half_full());
        actor.init();
        match frames(&mut rx).as_slice() {
            [Outgoing::Text(text)] => {
                let v: Value = serde_json::from_str(text).unwrap();
                assert_eq!(v["type"], "welcome");
                assert_eq!(v["requiresAuth"], false);
            }
            other => panic!("unexpected frames: {other:?}"),
        }
    }

    #[tokio::test]
    async fn push_sent_below_high_water_mark() {
        let (mut actor, _inbox, _handles, mut rx) = actor(half_full());
        let counter = Arc::new(AtomicUsize::new(0));
        counting_subscription(&mut actor, "sub_1", &counter);

        actor.outbound.send_text("x".repeat(499));
        assert!(actor.on_push("sub_1", "subscription", json!({"n": 1})));
        assert_eq!(frames(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn push_dropped_at_high_water_mark() {
        let (mut actor, _inbox, _handles, mut rx) = actor(half_full());
        let counter = Arc::new(AtomicUsize::new(0));
        counting_subscription(&mut actor, "sub_1", &counter);

        actor.outbound.send_text("x".repeat(500));
        assert!(!actor.on_push("sub_1", "subscription", json!({"n": 1})));
        assert_eq!(frames(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn push_for_released_subscription_is_dropped() {
        let (mut actor, _inbox, _handles, mut rx) = actor(half_full());
        assert!(!actor.on_push("sub_gone", "subscription", json!(null)));
        assert!(frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn terminate_twice_unsubscribes_once() {
        let (mut actor, _inbox, _handles, mut rx) = actor(half_full());
        let counter = Arc::new(AtomicUsize::new(0));
        counting_subscription(&mut actor, "sub_1", &counter);
        counting_subscription(&mut actor, "sub_2", &counter);

        actor.terminate(CloseReason::ServerShutdown);
        actor.terminate(CloseReason::ServerShutdown);

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        let closes = frames(&mut rx)
            .into_iter()
            .filter(|f| matches!(f, Outgoing::Close(_)))
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn pong_updates_heartbeat_without_reply() {
        let (mut actor, _inbox, _handles, mut rx) = actor(half_full());
        actor.on_message(r#"{"type":"pong","timestamp":1234}"#).await;
        assert_eq!(actor.state().heartbeat.last_pong_at(), 1234);
        assert!(frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn unanswered_ping_times_out_on_next_tick() {
        let (mut actor, _inbox, _handles, mut rx) = actor(half_full());
        assert!(actor.on_heartbeat_tick().is_none());
        let sent = frames(&mut rx);
        let Some(Outgoing::Text(ping)) = sent.first() else {
            panic!("expected ping");
        };
        let ping: Value = serde_json::from_str(ping).unwrap();
        assert_eq!(ping["type"], "ping");

        assert_eq!(actor.on_heartbeat_tick(), Some(CloseReason::HeartbeatTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn run_processes_inputs_in_order_and_stops_on_close() {
        let (mut actor, mut inbox, handles, mut rx) = actor(half_full());
        handles
            .mailbox
            .send(ActorInput::Frame("not json".into()))
            .await
            .unwrap();
        handles
            .mailbox
            .send(ActorInput::Frame(r#"{"id": 2}"#.into()))
            .await
            .unwrap();
        handles.mailbox.send(ActorInput::SocketClosed).await.unwrap();

        let reason = actor.run(&mut inbox).await;
        assert_eq!(reason, CloseReason::Normal);

        let texts: Vec<Value> = frames(&mut rx)
            .into_iter()
            .filter_map(|f| match f {
                Outgoing::Text(t) => serde_json::from_str(&t).ok(),
                Outgoing::Close(_) => None,
            })
            .collect();
        assert_eq!(texts[0]["type"], "welcome");
        assert_eq!(texts[1]["code"], "PARSE_ERROR");
        assert_eq!(texts[1]["id"], 0);
        assert_eq!(texts[2]["code"], "INVALID_REQUEST");
        assert_eq!(texts[2]["id"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_heartbeat_timeout() {
        let (mut actor, mut inbox, _handles, mut rx) = actor(half_full());
        let reason = tokio::time::timeout(Duration::from_secs(5), actor.run(&mut inbox))
            .await
            .expect("actor should time out by itself");
        assert_eq!(reason, CloseReason::HeartbeatTimeout);
        assert!(frames(&mut rx)
            .iter()
            .any(|f| matches!(f, Outgoing::Close(CloseReason::HeartbeatTimeout))));
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_control_acknowledges() {
        let (mut actor, mut inbox, handles, _rx) = actor(half_full());
        let (done_tx, done_rx) = oneshot::channel();
        handles
            .control
            .send(Control::Terminate {
                reason: CloseReason::ServerShutdown,
                done: done_tx,
            })
            .unwrap();
        assert_eq!(actor.run(&mut inbox).await, CloseReason::ServerShutdown);
        done_rx.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_heartbeat_interval_does_not_crash_the_actor() {
        let (outbound, mut rx) = OutboundQueue::detached();
        let mut ctx = context(half_full());
        Arc::get_mut(&mut ctx).unwrap().heartbeat.interval_ms = 0;
        let (mut actor, mut inbox, _handles) = ConnectionActor::new(
            "conn-1".to_string(),
            "127.0.0.1:40000".parse().unwrap(),
            ctx,
            outbound,
        );

        let reason = tokio::time::timeout(Duration::from_secs(5), actor.run(&mut inbox))
            .await
            .expect("actor should time out by itself");
        assert_eq!(reason, CloseReason::HeartbeatTimeout);
        let pings = frames(&mut rx)
            .iter()
            .filter(|f| matches!(f, Outgoing::Text(t) if t.contains("\"ping\"")))
            .count();
        assert_eq!(pings, 1);
    }
}
