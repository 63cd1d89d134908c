use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use parley_core::config::{LogBackend, LogConfig};
use parley_core::log::{LogProducer, MemoryLog};
use parley_core::{
    ConnectionRegistry, ConsumerSettings, GatewayConfig, IdentityGate, JwtGate,
    LibSqlMessageStore, PersistenceConsumer, RouterShared, TokenIssuer,
};
use parley_shutdown::GracefulShutdown;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{debug, info, Level};

pub mod routes;

/// How often registry entries whose connection went away are swept.
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state
pub struct AppState {
    /// Live connections by user id
    pub registry: Arc<ConnectionRegistry>,
    /// Handed to every connection's router
    pub router: RouterShared,
    /// Bearer-token check in front of the upgrade endpoint
    pub gate: Arc<dyn IdentityGate>,
    pub issuer: TokenIssuer,
    /// Capacity of each connection's outbound channel
    pub outbound_buffer: usize,
    pub shutdown: Arc<GracefulShutdown>,
}

impl AppState {
    pub fn new(
        config: &GatewayConfig,
        producer: Arc<dyn LogProducer>,
        shutdown: Arc<GracefulShutdown>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = RouterShared::new(registry.clone(), producer, config.log.main_topic.clone());

        Self {
            registry,
            router,
            gate: Arc::new(JwtGate::new(&config.auth.secret)),
            issuer: TokenIssuer::from_config(&config.auth),
            outbound_buffer: config.outbound_buffer,
            shutdown,
        }
    }

    /// Token every connection router watches.
    pub fn stop_token(&self) -> CancellationToken {
        self.shutdown.stop_token()
    }
}

/// Start the gateway and run until a shutdown signal has been handled.
pub async fn start(config: GatewayConfig) -> Result<()> {
    let shutdown = Arc::new(GracefulShutdown::new(config.http.drain_timeout()));
    let stop = shutdown.stop_token();

    let (producer, embedded) = match config.log.backend {
        LogBackend::Memory => {
            let log = MemoryLog::new();
            let consumer = embedded_consumer(&config, &log).await?;
            info!("Persistence consumer embedded (memory log backend)");
            (Arc::new(log) as Arc<dyn LogProducer>, Some(consumer))
        }
        LogBackend::Kafka => (kafka_producer(&config.log)?, None),
    };

    let consumer_task = embedded.map(|consumer| tokio::spawn(consumer.run(stop.clone())));

    let state = Arc::new(AppState::new(&config, producer, shutdown.clone()));
    let sweep = tokio::spawn(sweep_stale_connections(
        state.registry.clone(),
        STALE_SWEEP_INTERVAL,
        stop.clone(),
    ));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.http.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.http.bind))?;
    info!("Starting Axum HTTP server on {}", listener.local_addr()?);

    let lifecycle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.run().await })
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(stop.clone().cancelled_owned())
        .await
        .context("HTTP server failed")?;

    // serve() also returns once the stop token fires; make sure the drain
    // below runs in either case.
    stop.cancel();
    let signal = lifecycle.await.context("Shutdown task panicked")?;

    sweep.await.context("Stale connection sweep panicked")?;
    if let Some(task) = consumer_task {
        task.await.context("Persistence consumer panicked")?;
    }

    info!(?signal, "Gateway stopped");
    Ok(())
}

/// Periodically drop registry entries whose outbound channel has closed.
///
/// `send_to` already prunes closed entries it runs into; this catches the ones
/// nobody sends to.
async fn sweep_stale_connections(
    registry: Arc<ConnectionRegistry>,
    every: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let removed = registry.cleanup_stale();
                debug!(removed, remaining = registry.connection_count(), "Stale connection sweep");
            }
        }
    }
}

/// Persistence consumer sharing the gateway's in-memory log.
async fn embedded_consumer(config: &GatewayConfig, log: &MemoryLog) -> Result<PersistenceConsumer> {
    let store = LibSqlMessageStore::open(config.store.path.as_deref())
        .await
        .context("Failed to open message store")?;
    store
        .initialize()
        .await
        .context("Failed to initialize message store schema")?;

    let settings = ConsumerSettings::new(&config.log, &config.consumer);
    let source = log.consumer(config.log.consumer_group.clone(), &settings.subscribed_topics());

    Ok(PersistenceConsumer::new(
        Box::new(source),
        Arc::new(store),
        Arc::new(log.clone()),
        settings,
    ))
}

#[cfg(feature = "kafka")]
fn kafka_producer(config: &LogConfig) -> Result<Arc<dyn LogProducer>> {
    let producer = parley_core::log::kafka::KafkaProducer::new(&config.brokers, config.publish_timeout())
        .context("Failed to create Kafka producer")?;
    info!(brokers = %config.brokers, "Publishing to Kafka");
    Ok(Arc::new(producer))
}

#[cfg(not(feature = "kafka"))]
fn kafka_producer(_config: &LogConfig) -> Result<Arc<dyn LogProducer>> {
    anyhow::bail!("log.backend = kafka requires parley-server built with the `kafka` feature")
}

/// Create the Axum router with all routes and middleware
pub fn create_router(state: Arc<AppState>) -> Router {
    let websocket = Router::new()
        .route("/ws/:user_id", get(routes::websocket::ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            routes::auth::require_bearer,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/login", post(routes::auth::login_handler))
        .merge(websocket)
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "parley-server",
            "version": env!("CARGO_PKG_VERSION"),
            "connections": state.registry.connection_count(),
        })),
    )
}
