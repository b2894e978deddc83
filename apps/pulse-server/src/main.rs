use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulse_server::backend::memory::MemoryStore;
use pulse_server::backend::HandlerRegistry;
use pulse_server::config::ServerConfig;
use pulse_server::lifecycle::GatewayServer;
use pulse_server::Services;

#[tokio::main]
async fn main() {
    // Load .env if present; env vars may also be set externally.
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();
    let grace = config.shutdown_grace();

    // In-memory store until a real backend is wired in.
    let services = Services {
        handlers: HandlerRegistry::new().with("store", Arc::new(MemoryStore::new())),
        auth: None,
    };

    let server = match GatewayServer::start(config, services).await {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(%err, "failed to start gateway");
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    server.stop(grace).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
