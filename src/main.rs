//! capcast — CAP alert ingestion, normalization and real-time distribution pipeline.
//!
//! Wires the eight components together: C3 Source Registry, C5 Scheduler (which drives C2
//! CAP Parser and C1 Geometry Normalizer per tick), C4 Alert Store, C6 Event Broadcaster,
//! C7 Janitor, and C8's Axum query API. Each is an explicitly constructed value with
//! injected dependencies — no module-level singletons, no hidden global state.

mod api;
mod broadcaster;
mod cap;
mod clock;
mod config;
mod error;
mod geometry;
mod janitor;
mod model;
mod parser;
mod scheduler;
mod source;
mod store;
mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;

use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use broadcaster::EventBroadcaster;
use clock::SystemClock;
use config::Config;
use janitor::Janitor;
use parser::CapParser;
use scheduler::Scheduler;
use source::SourceRegistry;
use store::{AlertStore, InMemoryAlertStore};

/// No request on this surface ships a body larger than a single source/update payload.
const MAX_REQUEST_BODY_BYTES: usize = 1 << 20;

#[tokio::main]
async fn main() {
    telemetry::init();
    let config = Config::from_env();
    info!(http_port = config.http_port, "capcast starting");

    let registry = Arc::new(SourceRegistry::new());
    let store: Arc<dyn AlertStore> = match &config.snapshot_path {
        Some(path) => Arc::new(InMemoryAlertStore::with_snapshot_path(path.clone()).await),
        None => Arc::new(InMemoryAlertStore::new()),
    };
    let parser = Arc::new(CapParser::new(config.detail_cache_ttl));
    let broadcaster = Arc::new(EventBroadcaster::new());
    let clock = Arc::new(SystemClock);

    let scheduler = Arc::new(Scheduler::new(
        registry.clone(),
        store.clone(),
        parser.clone(),
        broadcaster.clone(),
        clock.clone(),
    ));
    scheduler.start();

    let janitor = Arc::new(Janitor::new(
        store.clone(),
        broadcaster.clone(),
        clock.clone(),
        config.janitor_interval,
        config.retention,
    ));
    tokio::spawn(Arc::clone(&janitor).run());

    let api_state = api::ApiState {
        registry,
        store,
        parser,
        scheduler: scheduler.clone(),
        broadcaster,
        janitor,
    };

    let app = api::router(api_state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive())
            .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES)),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        eprintln!("failed to bind {addr}: {e}");
        std::process::exit(1);
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received, draining scheduler");
            scheduler.stop().await;
        })
        .await
        .unwrap_or_else(|e| {
            eprintln!("server error: {e}");
            std::process::exit(1);
        });
}
