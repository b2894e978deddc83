//! Startup ordering and graceful shutdown of the whole gateway.
//!
//! Dependencies come up before the listening socket (rate limiter, then the
//! supervisor, then the listener) and go down in reverse.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::gateway::events::ServerMessage;
use crate::gateway::rate_limit::RateLimiter;
use crate::gateway::supervisor::ConnectionSupervisor;
use crate::gateway::GatewayContext;
use crate::{AppState, Services};

/// How long the HTTP server task may take to wind down after the listener
/// is told to stop.
const SERVE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Present only between a stop request and its completion.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownState {
    pub grace_period: Duration,
    pub started_at: Instant,
}

pub struct GatewayServer {
    config: Arc<ServerConfig>,
    state: Mutex<LifecycleState>,
    shutdown: Mutex<Option<ShutdownState>>,
    accepting: Arc<AtomicBool>,
    supervisor: Arc<ConnectionSupervisor>,
    rate_limiter: Option<Arc<RateLimiter>>,
    local_addr: SocketAddr,
    stop_listener: Mutex<Option<oneshot::Sender<()>>>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayServer {
    /// Bring the gateway up and start accepting connections.
    ///
    /// If the listener cannot be set up, everything already started is torn
    /// down before the error is returned.
    pub async fn start(config: ServerConfig, services: Services) -> io::Result<Self> {
        let config = Arc::new(config);

        let rate_limiter = config.rate_limit.map(|rl| {
            let limiter = Arc::new(RateLimiter::new(rl));
            limiter.start();
            limiter
        });

        let ctx = Arc::new(GatewayContext {
            handlers: services.handlers,
            auth: services.auth,
            rate_limiter: rate_limiter.clone(),
            heartbeat: config.heartbeat,
            backpressure: config.backpressure,
            limits: config.connection_limits,
        });
        let supervisor = Arc::new(ConnectionSupervisor::new(ctx));
        let accepting = Arc::new(AtomicBool::new(false));

        let (listener, local_addr) = match bind(&config).await {
            Ok(bound) => bound,
            Err(err) => {
                tracing::error!(%err, host = %config.host, port = config.port, "failed to bind");
                abort_startup(&supervisor, rate_limiter.as_deref(), config.stop_timeout()).await;
                return Err(err);
            }
        };

        let app_state = AppState {
            supervisor: supervisor.clone(),
            accepting: accepting.clone(),
            config: config.clone(),
        };
        let app = Router::new()
            .merge(crate::routes::router(&config.path))
            .layer(TraceLayer::new_for_http())
            .with_state(app_state);

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serve_task = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await;
            if let Err(err) = result {
                tracing::error!(%err, "server error");
            }
        });

        accepting.store(true, Ordering::Release);
        tracing::info!(addr = %local_addr, path = %config.path, "gateway listening");

        Ok(Self {
            config,
            state: Mutex::new(LifecycleState::Running),
            shutdown: Mutex::new(None),
            accepting,
            supervisor,
            rate_limiter,
            local_addr,
            stop_listener: Mutex::new(Some(stop_tx)),
            serve_task: Mutex::new(Some(serve_task)),
        })
    }

    /// Shut down, giving clients up to `grace_period` to leave on their own.
    /// Calling this while already stopping or stopped returns immediately.
    pub async fn stop(&self, grace_period: Duration) {
        {
            let mut state = self.state.lock();
            if matches!(*state, LifecycleState::Stopping | LifecycleState::Stopped) {
                return;
            }
            *state = LifecycleState::Stopping;
        }
        self.accepting.store(false, Ordering::Release);
        *self.shutdown.lock() = Some(ShutdownState {
            grace_period,
            started_at: Instant::now(),
        });

        let live = self.supervisor.count();
        tracing::info!(
            grace_ms = grace_period.as_millis() as u64,
            connections = live,
            "gateway stopping"
        );

        if let Some(tx) = self.stop_listener.lock().take() {
            let _ = tx.send(());
        }

        if !grace_period.is_zero() && live > 0 {
            self.supervisor
                .broadcast(&ServerMessage::shutdown(grace_period.as_millis() as u64));
            if tokio::time::timeout(grace_period, self.supervisor.wait_until_empty())
                .await
                .is_err()
            {
                tracing::info!(
                    remaining = self.supervisor.count(),
                    "grace period elapsed; closing remaining connections"
                );
            }
        }

        self.supervisor.stop_all(self.config.stop_timeout()).await;

        if let Some(limiter) = &self.rate_limiter {
            limiter.stop();
        }

        let serve_task = self.serve_task.lock().take();
        if let Some(mut task) = serve_task {
            if tokio::time::timeout(SERVE_SHUTDOWN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                tracing::warn!("server task did not finish in time; aborting");
                task.abort();
            }
        }

        *self.shutdown.lock() = None;
        *self.state.lock() = LifecycleState::Stopped;
        tracing::info!("gateway stopped");
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.supervisor.count()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn shutdown_state(&self) -> Option<ShutdownState> {
        *self.shutdown.lock()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Bind the listener and resolve the address it actually got.
async fn bind(config: &ServerConfig) -> io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

/// Undo the parts of `start` that ran before the listener failed.
async fn abort_startup(
    supervisor: &ConnectionSupervisor,
    rate_limiter: Option<&RateLimiter>,
    stop_timeout: Duration,
) {
    supervisor.stop_all(stop_timeout).await;
    if let Some(limiter) = rate_limiter {
        limiter.stop();
    }
}
