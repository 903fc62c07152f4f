//! dglabd — DG-Lab device relay daemon.
//!
//! Bootstraps config, tracing, the aggregate state, background tasks, and
//! the shared HTTP/WebSocket listener. The agent-facing layer mounts its
//! own endpoints on the paths named in the config; standalone, this binary
//! serves the broker and the health probe.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use dglabd::{build_router, lifecycle, AppState, Config};

#[tokio::main]
async fn main() {
    // Load .env if present (local dev).
    let _ = dotenvy::dotenv();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("dglabd: {e}");
            std::process::exit(1);
        }
    };

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .with_target(true)
        .init();

    info!("dglabd starting");

    // ── Shared state ────────────────────────────────────────
    let state = AppState::new(config.clone());

    // ── Background tasks ────────────────────────────────────
    lifecycle::spawn_sweeper(&state);
    lifecycle::spawn_heartbeat(&state);

    // ── Bind & serve ────────────────────────────────────────
    let app = build_router(Arc::clone(&state));
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await.expect("failed to bind");

    info!(addr = %addr, "dglabd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    state.shutdown();
    info!("dglabd stopped");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
