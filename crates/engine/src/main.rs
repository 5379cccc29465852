//! Pipeline Engine Server
//!
//! Runs the orchestrator with its HTTP API, recovering unfinished
//! executions from the store on startup.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeline_engine::{
    config::{DatabaseConfig, EngineConfig, StoreBackend},
    engine::{ChannelTransport, Orchestrator, TaskTransport, TransportMessage},
    handlers,
    nats::{self, NatsEventSink, NatsTaskTransport},
    state::AppState,
    store::{ExecutionStore, MemoryStore, PgStore},
    ResultExt,
};

/// Initialize tracing/logging.
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,pipeline_engine=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_router(state: AppState) -> Router {
    // CORS configuration - allow all origins for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    handlers::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn open_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn ExecutionStore>> {
    match config.store {
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; executions do not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to load database config, using defaults");
                DatabaseConfig::default()
            });
            let store = PgStore::connect(&db_config).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}

/// Log task traffic when no executor transport is configured.
fn drain_local_tasks(mut rx: mpsc::UnboundedReceiver<TransportMessage>) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                TransportMessage::Request(request) => tracing::warn!(
                    task_id = %request.task_id,
                    task_type = %request.task_type,
                    "No executor transport; answer via POST /api/tasks/{{task_id}}/response"
                ),
                TransportMessage::Cancel(task_id) => {
                    tracing::debug!(task_id = %task_id, "Task cancelled")
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let loaded = EngineConfig::from_env();
    let config = loaded.as_ref().cloned().unwrap_or_default();
    init_tracing(config.log_json);
    if let Err(e) = loaded {
        tracing::warn!(error = %e, "Failed to load engine config, using defaults");
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.host,
        port = config.port,
        store = ?config.store,
        workers = config.worker_count,
        "Starting pipeline engine"
    );

    let store = open_store(&config).await?;

    let nats_client = nats::connect(config.nats_url.as_deref()).await;
    let nats_transport = match nats_client.clone() {
        Some(client) => NatsTaskTransport::new(client)
            .await
            .warn("setting up NATS task stream")
            .ok(),
        None => None,
    };
    let using_nats = nats_transport.is_some();
    let transport: Arc<dyn TaskTransport> = match nats_transport {
        Some(transport) => Arc::new(transport),
        None => {
            let (transport, rx) = ChannelTransport::new();
            drain_local_tasks(rx);
            Arc::new(transport)
        }
    };

    let mut builder = Orchestrator::builder(store, transport).config(&config);
    if let Some(client) = nats_client {
        builder = builder.event_sink(Arc::new(NatsEventSink::new(client)));
    }
    let (orchestrator, work) = builder.build();

    orchestrator.recover().await?;
    let background = orchestrator.spawn_background(work);

    let state = AppState::new(orchestrator, config.clone(), using_nats);
    let app = build_router(state);

    let addr: SocketAddr = config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in background {
        handle.abort();
    }
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
