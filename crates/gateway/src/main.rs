//! Gateway service entry point.
//!
//! Startup order: config → metrics exporter → token verifier → NATS →
//! stream consumers → HTTP/WebSocket server. Shutdown drains in reverse.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use gateway::{create_router, AppState, BusConsumer, Config, RoomManager, TokenVerifier};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use nats_client::NatsClient;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting fan-out gateway");

    let cfg = Config::from_env()?;
    info!("Configuration:");
    info!("  GATEWAY_PORT: {}", cfg.server.port);
    info!("  METRICS_PORT: {}", cfg.metrics.port);
    info!("  NATS_URL: {}", cfg.nats.url);
    info!("  NATS_STREAMS: {}", cfg.nats.streams.join(","));
    info!("  WS_MAX_CONNECTIONS: {}", cfg.ws.max_connections);
    if cfg.ws.enable_compression {
        warn!("WS_ENABLE_COMPRESSION is set but per-message compression is not supported; ignoring");
    }

    if cfg.metrics.enabled {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], cfg.metrics.port))
            .set_buckets_for_metric(
                Matcher::Full(gateway::metrics::MESSAGE_LATENCY_SECONDS.to_string()),
                gateway::metrics::LATENCY_BUCKETS,
            )?
            .install()
            .context("failed to start Prometheus exporter")?;
        gateway::metrics::describe();
        info!(
            "Prometheus metrics server started on port {}",
            cfg.metrics.port
        );
    }

    let verifier = Arc::new(TokenVerifier::new(
        &cfg.jwt.public_key_pem,
        cfg.jwt.validate_exp,
        cfg.jwt.allowed_issuers.clone(),
    )?);

    let manager = Arc::new(RoomManager::new());

    let nats = Arc::new(
        NatsClient::connect(&cfg.nats.url, &cfg.nats.client_id)
            .await
            .context("failed to connect to NATS")?,
    );

    let consumer = Arc::new(BusConsumer::new(
        nats.clone(),
        manager.clone(),
        cfg.nats.client_id.clone(),
    ));
    let (consumer_shutdown, consumer_handles) = consumer.start(&cfg.nats.streams);

    let state = Arc::new(AppState {
        manager: manager.clone(),
        verifier,
        nats: Some(nats),
        ws: cfg.ws.clone(),
        draining: AtomicBool::new(false),
    });

    let app = create_router(state.clone(), cfg.server.read_timeout);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Gateway listening on {}", addr);

    let (server_shutdown_tx, server_shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = server_shutdown_rx.await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("Server error: {}", e);
        }
    });

    shutdown_signal().await;
    info!("Shutting down gracefully...");

    // Health flips to draining, consumers stop pulling, every session closes,
    // then the HTTP server stops accepting. All bounded by the drain timeout.
    state.draining.store(true, Ordering::Relaxed);
    for tx in &consumer_shutdown {
        let _ = tx.send(()).await;
    }
    manager.drain();
    let _ = server_shutdown_tx.send(());

    let drain = async {
        let _ = server.await;
        for handle in consumer_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(cfg.shutdown_timeout, drain).await.is_err() {
        warn!(
            "Drain timeout of {:?} exceeded, exiting anyway",
            cfg.shutdown_timeout
        );
    }

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
