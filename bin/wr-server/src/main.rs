//! Webhook Relay server.
//!
//! Wires configuration, the Redis-backed store, the route registry, the
//! delivery worker pool and the HTTP API together, then runs until a
//! terminate/interrupt signal. On shutdown the API stops accepting requests
//! and workers finish their in-flight deliveries; unacknowledged events stay
//! claim-pending in the store and are picked up on the next start.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wr_api::create_router;
use wr_common::AppConfig;
use wr_metrics::{Collector, RedisCollector};
use wr_routes::RouteRegistry;
use wr_store::RedisRepository;
use wr_worker::{DeliveryPool, DeliveryPoolConfig, HttpDeliverer, HttpDelivererConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting Webhook Relay");

    let config = AppConfig::load().context("loading configuration")?;

    let repo = Arc::new(
        RedisRepository::connect(&config.redis_url())
            .await
            .context("connecting to redis")?,
    );
    info!(host = %config.redis_host, port = config.redis_port, "Connected to redis");

    let registry =
        Arc::new(RouteRegistry::load(&config.routes_file).context("loading routes")?);
    info!(routes = registry.len(), file = %config.routes_file, "Routes loaded");

    let deliverer = Arc::new(
        HttpDeliverer::new(HttpDelivererConfig::default()).context("building http client")?,
    );
    let pool = DeliveryPool::start(
        repo.clone(),
        &registry,
        deliverer,
        config.clone(),
        DeliveryPoolConfig::default(),
    );
    info!(workers = pool.worker_count(), "Delivery pool running");

    let collector: Option<Arc<dyn Collector>> = if config.telemetry_enabled {
        info!("Telemetry enabled, mounting /metrics");
        Some(Arc::new(RedisCollector::new(
            repo.connection(),
            registry.clone(),
        )))
    } else {
        None
    };

    let app = create_router(repo.clone(), registry.clone(), collector)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await.context("binding listener")?;
    info!(port = config.port, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    info!("Shutdown signal received, draining workers");
    if tokio::time::timeout(Duration::from_secs(30), pool.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Worker drain timed out, exiting with claims pending");
    }

    info!("Webhook Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
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
