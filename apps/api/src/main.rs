mod auth;
mod backend;
mod chat;
mod config;
mod db;
mod errors;
mod feedback;
mod hypotheses;
mod models;
mod registry;
mod routes;
mod state;
mod store;
mod stream;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::backend::BackendClient;
use crate::chat::coordinator::{Coordinator, GenerationSettings};
use crate::config::Config;
use crate::db::{create_pool, migrate};
use crate::registry::{LocalStreamRegistry, RedisStreamRegistry, StreamRegistry};
use crate::routes::build_router;
use crate::state::AppState;
use crate::store::{ChatStore, PgChatStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting research chat API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let db = create_pool(&config.database_url, config.database_max_connections).await?;
    if config.run_migrations {
        migrate(&db).await?;
    }
    let store: Arc<dyn ChatStore> = Arc::new(PgChatStore::new(db));

    // Initialize the resumable stream registry
    let registry: Arc<dyn StreamRegistry> = match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            Arc::new(RedisStreamRegistry::connect(&client, config.stream_ttl).await?)
        }
        None => {
            info!("REDIS_URL not set, resumable streams are kept in process");
            Arc::new(LocalStreamRegistry::new(config.stream_ttl))
        }
    };

    // Initialize backend client
    let backend = BackendClient::new(
        config.backend_url.clone(),
        config.backend_api_key.clone(),
        config.backend_timeout,
    )?;
    info!("Backend client initialized ({})", config.backend_url);

    let coordinator = Coordinator::new(
        store.clone(),
        Arc::new(backend),
        registry.clone(),
        GenerationSettings {
            temperature: config.backend_temperature,
            max_tokens: config.backend_max_tokens,
        },
    );

    // Build app state
    let state = AppState {
        store,
        registry,
        coordinator,
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict origins once the web client's domain is fixed

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
