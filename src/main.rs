//! Passthru Proxy Server - Entry Point
//!
//! Starts the proxy listener with graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use passthru::config::{Config, LogFormat};
use passthru::proxy::{DirectEngine, DirectTransport, ProxyServer, TracingLogger};

#[tokio::main]
async fn main() -> passthru::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let fmt_layer = match config.log.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("passthru={}", config.log.level).into()),
        )
        .with(fmt_layer)
        .init();

    info!("Starting Passthru Proxy Server");

    let transport = Arc::new(DirectTransport::new());
    let engine = Arc::new(DirectEngine::new(transport));
    let proxy_server = ProxyServer::new(config.proxy.clone(), engine, Arc::new(TracingLogger));

    // Create shutdown channel
    let (shutdown_tx, proxy_shutdown) = watch::channel(false);

    let proxy_task = tokio::spawn(async move {
        if let Err(e) = proxy_server.run(proxy_shutdown).await {
            error!("Proxy server error: {}", e);
        }
    });

    info!("Proxy server started on {}", config.proxy_addr());

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = proxy_task.await;

    info!("Passthru Proxy Server stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
