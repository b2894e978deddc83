//! Registry and supervisor of live connection actors.
//!
//! Each connection runs as its own task. A failed actor is logged, its
//! socket closed with an internal-error code and its entry removed; it is
//! never restarted, since the client owns reconnection and connection state
//! is not durable. Sibling connections are unaffected.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocket;
use dashmap::DashMap;
use futures_util::future::join_all;
use futures_util::{FutureExt, StreamExt};
use pulse_common::ConnectionIdGenerator;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::actor::{spawn_reader, ConnectionActor, Control};
use super::events::{CloseReason, ServerMessage};
use super::outbound::{spawn_writer, OutboundQueue};
use super::GatewayContext;

/// What the supervisor keeps for one live connection.
pub struct ConnectionHandle {
    control: mpsc::UnboundedSender<Control>,
    outbound: OutboundQueue,
    pub remote_address: SocketAddr,
    pub connected_at: Instant,
    task: Option<JoinHandle<()>>,
}

pub struct ConnectionSupervisor {
    ctx: Arc<GatewayContext>,
    ids: ConnectionIdGenerator,
    connections: DashMap<String, ConnectionHandle>,
    live: watch::Sender<usize>,
    /// Set by [`ConnectionSupervisor::stop_all`]; no connection is adopted after.
    sealed: AtomicBool,
}

impl ConnectionSupervisor {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        let (live, _) = watch::channel(0);
        Self {
            ctx,
            ids: ConnectionIdGenerator::new(),
            connections: DashMap::new(),
            live,
            sealed: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        *self.live.borrow()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Adopt an upgraded socket: spawn its writer, reader and actor.
    /// Returns the assigned connection id, or `None` when the supervisor is
    /// already stopping and the socket was closed instead.
    pub fn add_connection(
        self: &Arc<Self>,
        socket: WebSocket,
        remote_address: SocketAddr,
    ) -> Option<String> {
        let connection_id = self.ids.generate();
        let (sink, stream) = socket.split();
        let (outbound, writer) = spawn_writer(sink);

        let (mut actor, mut inbox, handles) = ConnectionActor::new(
            connection_id.clone(),
            remote_address,
            self.ctx.clone(),
            outbound.clone(),
        );

        // Registered before the task runs so a fast exit still finds it to remove.
        self.connections.insert(
            connection_id.clone(),
            ConnectionHandle {
                control: handles.control,
                outbound: outbound.clone(),
                remote_address,
                connected_at: Instant::now(),
                task: None,
            },
        );
        self.live.send_modify(|n| *n += 1);

        // `stop_all` seals before listing connections, so an entry inserted
        // concurrently is either seen there or turned away here.
        if self.is_sealed() {
            self.remove(&connection_id);
            outbound.close(CloseReason::Rejected);
            tracing::warn!(
                %connection_id,
                remote_addr = %remote_address,
                "connection rejected during shutdown"
            );
            return None;
        }

        let reader = spawn_reader(stream, handles.mailbox, connection_id.clone());

        tracing::info!(
            %connection_id,
            remote_addr = %remote_address,
            connections = self.count(),
            "connection opened"
        );

        let supervisor = Arc::clone(self);
        let id = connection_id.clone();
        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(actor.run(&mut inbox)).catch_unwind().await;
            if outcome.is_err() {
                tracing::error!(
                    connection_id = %id,
                    "connection actor panicked; closing connection, not restarting"
                );
                actor.terminate(CloseReason::InternalError);
            }
            reader.abort();
            drop(actor);
            supervisor.remove(&id);
            // Let the writer flush the close frame; it exits on its own.
            drop(writer);
        });

        if let Some(mut entry) = self.connections.get_mut(&connection_id) {
            entry.task = Some(task);
        }
        Some(connection_id)
    }

    /// Forget a connection. Only the first call for an id has any effect.
    pub fn remove(&self, connection_id: &str) -> bool {
        if self.connections.remove(connection_id).is_none() {
            return false;
        }
        self.live.send_modify(|n| *n = n.saturating_sub(1));
        tracing::debug!(%connection_id, connections = self.count(), "connection removed");
        true
    }

    /// Deliver a server frame to every live connection through its actor.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.control.send(Control::Send(message.clone())).is_ok())
            .count()
    }

    /// Resolves once no connection is live.
    pub async fn wait_until_empty(&self) {
        let mut rx = self.live.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Terminate every connection and stop adopting new ones. Each actor gets
    /// `per_child_timeout` to release its subscriptions and acknowledge;
    /// stragglers are closed, aborted and awaited for up to the same timeout
    /// so their subscriptions are gone when this returns.
    pub async fn stop_all(&self, per_child_timeout: Duration) {
        self.sealed.store(true, Ordering::SeqCst);
        loop {
            let ids = self.connection_ids();
            if ids.is_empty() {
                break;
            }
            tracing::info!(connections = ids.len(), "terminating connections");
            join_all(ids.iter().map(|id| self.stop_one(id, per_child_timeout))).await;
        }
    }

    async fn stop_one(&self, connection_id: &str, timeout: Duration) {
        let Some((control, outbound)) = self
            .connections
            .get(connection_id)
            .map(|entry| (entry.control.clone(), entry.outbound.clone()))
        else {
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        let sent = control
            .send(Control::Terminate {
                reason: CloseReason::ServerShutdown,
                done: done_tx,
            })
            .is_ok();

        let acknowledged =
            sent && matches!(tokio::time::timeout(timeout, done_rx).await, Ok(Ok(())));
        if !acknowledged {
            tracing::warn!(%connection_id, "connection did not stop in time; aborting");
            outbound.close(CloseReason::ServerShutdown);
            let task = self
                .connections
                .get_mut(connection_id)
                .and_then(|mut entry| entry.task.take());
            if let Some(task) = task {
                task.abort();
                // Dropping the aborted actor releases its subscriptions.
                if tokio::time::timeout(timeout, task).await.is_err() {
                    tracing::error!(%connection_id, "aborted connection task did not unwind");
                }
            }
        }
        self.remove(connection_id);
    }
}
