//! Gateway service entry point.
//!
//! SSE gateway streaming GraphQL subscription results to clients.

use anyhow::{Context, Result};
use event_bus::{transport_from_url, EventBus, EventBusConfig};
use execution::{ExecutionEngine, ExecutionProxy, HttpExecutionEngine, RootValueSigner};
use gateway::{
    create_router, AppState, ChannelRouter, ConnectionConfig, ConnectionRegistry, EventPublisher,
    GatewayConfig, ManagerConfig, SubscriptionManager,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    let config = GatewayConfig::from_env()?;

    info!("Configuration:");
    info!("  GATEWAY_BIND_ADDR: {}", config.bind_addr);
    info!("  EXECUTION_ENGINE_URL: {}", config.execution_url);
    info!("  EVENT_BUS_URL: {}", config.event_bus_url);
    info!("  TOPIC_PREFIX: {:?}", config.topic_prefix);
    info!("  ALLOWED_ORIGINS: {:?}", config.allowed_origins);
    info!("  MAX_SUBSCRIPTIONS_PER_TOKEN: {}", config.max_subscriptions_per_token);

    if config.metrics_port != 0 {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.metrics_port))
            .install()
            .context("Failed to start Prometheus exporter")?;
        info!("Prometheus metrics server started on port {}", config.metrics_port);
    }

    // Event bus: an unreachable bus at boot is fatal.
    let transport = transport_from_url(&config.event_bus_url)
        .await
        .with_context(|| format!("Failed to create event bus for {}", config.event_bus_url))?;
    let bus = EventBus::new(
        transport,
        EventBusConfig {
            reconnect: config.event_bus_reconnect.clone(),
        },
    );
    bus.connect().await.context("Failed to connect to event bus")?;
    info!("Connected to event bus");

    let engine = HttpExecutionEngine::new(config.execution_url.clone(), config.execution_timeout)
        .context("Failed to build execution engine client")?;
    if config.execution_startup_check {
        engine
            .health_check()
            .await
            .context("Execution engine is unreachable")?;
        info!("Execution engine reachable at {}", engine.url());
    } else {
        warn!("Skipping execution engine startup check");
    }

    let signer = RootValueSigner::new(
        config.signing_secret.as_bytes(),
        config.signature_bucket,
        config.signature_window,
    )
    .context("Invalid signing configuration")?;
    let proxy = ExecutionProxy::new(Arc::new(engine), signer);

    let router = ChannelRouter::new(config.topic_prefix.clone());
    let manager = SubscriptionManager::new(
        bus.clone(),
        proxy,
        router.clone(),
        ManagerConfig {
            queue_size: config.subscription_queue_size,
            max_consecutive_failures: config.max_consecutive_failures,
        },
    );

    let registry = Arc::new(ConnectionRegistry::new(
        manager.clone(),
        ConnectionConfig {
            max_subscriptions: config.max_subscriptions_per_token,
            stream_buffer_size: config.stream_buffer_size,
            reservation_timeout: config.reservation_timeout,
            idle_timeout: config.idle_timeout,
        },
    ));

    let janitor_cancel = CancellationToken::new();
    let janitor = registry.clone().spawn_janitor(janitor_cancel.clone());

    let publisher = config
        .enable_publish_endpoint
        .then(|| EventPublisher::new(bus.clone(), router));

    let state = Arc::new(AppState {
        registry,
        manager,
        publisher,
        heartbeat_interval: config.heartbeat_interval,
    });
    let app = create_router(state.clone(), &config.allowed_origins);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Gateway listening on {}", config.bind_addr);

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_state.shutdown().await;
        })
        .await?;

    info!("Shutting down event bus...");
    janitor_cancel.cancel();
    let _ = janitor.await;
    bus.disconnect().await;

    info!("Gateway stopped");
    Ok(())
}

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
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
