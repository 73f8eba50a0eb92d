use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tranquara_relay::api::{self, AppState};
use tranquara_relay::broker::AmqpConnector;
use tranquara_relay::dead_letter::DeadLetterRouter;
use tranquara_relay::events;
use tranquara_relay::handlers::HandlerTable;
use tranquara_relay::metrics::Metrics;
use tranquara_relay::shutdown::ShutdownSignal;
use tranquara_relay::store::{DataStore, MemoryStore};
use tranquara_relay::{
    Bridge, ConnectionManager, ConsumerDispatcher, Publisher, RelayConfig, ResponseRouter,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // 2. Load configuration
    let config = RelayConfig::load()?;
    info!(
        environment = %config.server.environment,
        port = config.server.port,
        "Tranquara relay starting"
    );
    if config.server.api_key.is_none() {
        warn!("server.api_key not set, API is unauthenticated");
    }

    let metrics = Arc::new(Metrics::new());
    let shutdown = ShutdownSignal::new();
    // The relay only needs a DataStore; deployments embedding it inject their own.
    let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new());
    warn!("Using the in-memory store, records do not outlive this process");

    // 3. Connect to the broker, or start degraded
    let connector = AmqpConnector::new(config.broker.url.clone(), config.queues.durable)
        .with_connection_name(format!("tranquara-relay-{}", config.server.environment));
    let connection = Arc::new(ConnectionManager::new(
        Arc::new(connector),
        config.broker.retry_policy(),
        config.queues.declared(),
    ));
    if let Err(e) = connection.connect().await {
        error!(error = %e, "Starting without broker, messaging is disabled until it is reachable");
    }

    // 4. Background tasks
    let write_back = HandlerTable::write_back(store.clone());
    write_back.validate(events::WRITE_BACK_EVENTS)?;
    let dispatcher = Arc::new(ConsumerDispatcher::new(
        config.queues.sync.clone(),
        write_back,
        config.dispatch_policy(),
        DeadLetterRouter::new(config.queues.dead_letter_suffix.clone()),
        metrics.clone(),
    ));
    let responses = Arc::new(ResponseRouter::new(
        config.queues.responses.clone(),
        &config.bridge,
        metrics.clone(),
    ));

    let mut tasks = Vec::new();
    {
        let connection = connection.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move { connection.supervise(shutdown).await }));
    }
    {
        let dispatcher = dispatcher.clone();
        let connection = connection.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move { dispatcher.run(connection, shutdown).await }));
    }
    {
        let responses = responses.clone();
        let connection = connection.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move { responses.run(connection, shutdown).await }));
    }

    // 5. HTTP server
    let publisher = Arc::new(Publisher::new(
        connection.clone(),
        config.queues.clone(),
        config.broker.publish_timeout(),
        metrics.clone(),
    ));
    let bridge = Arc::new(Bridge::new(
        publisher.clone(),
        responses,
        connection.clone(),
        config.bridge.timeout(),
        metrics.clone(),
    ));
    let state = Arc::new(AppState {
        environment: config.server.environment.clone(),
        api_key: config.server.api_key.clone(),
        connection,
        publisher,
        bridge,
        store,
        metrics,
    });
    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Tranquara relay listening on {}", addr);

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.listen_for_signals().await });
    }
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    // 6. Let background tasks finish
    let drain = futures_util::future::join_all(tasks);
    if tokio::time::timeout(shutdown.timeout(), drain).await.is_err() {
        warn!("Background tasks did not stop in time");
    }

    info!("Shutdown complete");
    Ok(())
}
