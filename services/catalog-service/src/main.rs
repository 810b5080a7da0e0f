// =============================================================================
// CATALOG SERVICE - Main Entry Point
// =============================================================================
// Marketplace product catalog for a seller on Wildberries/Ozon.
//
// WHAT THIS SERVICE DOES:
// - Stores product inputs (identity, pricing, stock, packaging)
// - Computes derived fields (final price, commission, tax, margin) on read
// - Imports CSV spreadsheets with loose, multilingual headers
// - Exports CSV/XLSX with a chosen set of columns
// - Types custom_data keys through custom field definitions; bulk edits
// - Upserts marketplace listing snapshots into the legacy item store
// - Caches stored inputs in Redis and exposes Prometheus metrics
// =============================================================================

// -----------------------------------------------------------------------------
// MODULE DECLARATIONS
// -----------------------------------------------------------------------------
mod cache;         // Redis cache of product inputs (cache.rs)
mod calculator;    // Derived pricing fields (calculator.rs)
mod config;        // Configuration loading (config.rs)
mod custom_fields; // Custom field definitions and bulk updates (custom_fields.rs)
mod db;            // PostgreSQL repository (db.rs)
mod error;         // Error types (error.rs)
mod export;        // CSV/XLSX writers (export.rs)
mod handlers;      // HTTP request handlers (handlers.rs)
mod import;        // Spreadsheet import pipeline (import.rs)
mod mapper;        // Field registry and header reconciliation (mapper.rs)
mod metrics;       // Prometheus metrics setup (metrics.rs)
mod models;        // Data structures (models.rs)
mod sync;          // Marketplace listing sync (sync.rs)

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::ProductCache;
use crate::config::Config;
use crate::db::Database;
use crate::metrics::setup_metrics;

/// Largest accepted upload (import file, sync snapshot): 20 MiB
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
// Shared by every handler through State<Arc<AppState>>.
pub struct AppState {
    // PostgreSQL connection pool
    pub db: Database,

    // Redis cache of product inputs
    pub cache: ProductCache,

    // Renders metrics in Prometheus format
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,

    pub config: Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // STEP 1: Load environment variables
    // -------------------------------------------------------------------------
    dotenvy::dotenv().ok();

    // -------------------------------------------------------------------------
    // STEP 2: Initialize logging/tracing
    // -------------------------------------------------------------------------
    // RUST_LOG controls log levels, e.g. RUST_LOG=info,catalog_service=debug
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,catalog_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Catalog Service...");

    // -------------------------------------------------------------------------
    // STEP 3: Load configuration
    // -------------------------------------------------------------------------
    let config = Config::from_env()?;
    info!(
        port = config.port,
        price_precedence = %config.price_precedence,
        export_max_rows = config.export_max_rows,
        "Configuration loaded"
    );

    // -------------------------------------------------------------------------
    // STEP 4: Set up Prometheus metrics
    // -------------------------------------------------------------------------
    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STEP 5: Connect to PostgreSQL database
    // -------------------------------------------------------------------------
    let db = Database::connect(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    db.run_migrations().await?;
    info!("Database migrations completed");

    // -------------------------------------------------------------------------
    // STEP 6: Connect to Redis
    // -------------------------------------------------------------------------
    let cache = ProductCache::connect(&config.redis_url).await?;
    info!("Connected to Redis");

    // -------------------------------------------------------------------------
    // STEP 7: Create application state
    // -------------------------------------------------------------------------
    let port = config.port;
    let state = Arc::new(AppState {
        db,
        cache,
        metrics_handle,
        config,
    });

    // -------------------------------------------------------------------------
    // STEP 8: Define routes
    // -------------------------------------------------------------------------
    // Static segments (brands, import, export, bulk-update) win over /:sku in axum.
    let app = Router::new()
        // ----- Health & Readiness Endpoints -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))

        // ----- Metrics Endpoint -----
        .route("/metrics", get(handlers::metrics_handler))

        // ----- Product API Endpoints -----
        .route(
            "/api/v1/products",
            get(handlers::list_products).post(handlers::create_product),
        )
        .route("/api/v1/products/brands", get(handlers::list_brands))
        .route(
            "/api/v1/products/import",
            post(handlers::import_products).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/v1/products/export", get(handlers::export_products))
        .route(
            "/api/v1/products/bulk-update",
            post(handlers::bulk_update_products),
        )
        .route(
            "/api/v1/products/:sku",
            get(handlers::get_product).put(handlers::update_product),
        )
        .route(
            "/api/v1/products/:sku/deactivate",
            post(handlers::deactivate_product),
        )

        // ----- Marketplace Sync -----
        .route(
            "/api/v1/sync/listings",
            post(handlers::sync_listings).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )

        // ----- Spreadsheet Metadata -----
        .route("/api/v1/import-logs", get(handlers::list_import_logs))
        .route("/api/v1/fields", get(handlers::list_fields))
        .route(
            "/api/v1/custom-fields",
            get(handlers::list_custom_fields).post(handlers::create_custom_field),
        )
        .route(
            "/api/v1/custom-fields/:key",
            put(handlers::update_custom_field).delete(handlers::delete_custom_field),
        )

        // ----- Middleware Layers -----
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // -------------------------------------------------------------------------
    // STEP 9: Start the HTTP server
    // -------------------------------------------------------------------------
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Catalog Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
