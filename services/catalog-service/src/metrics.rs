// =============================================================================
// METRICS MODULE
// =============================================================================
// This module sets up Prometheus metrics for observability.
//
// METRIC TYPES USED:
// - Counter: requests, imported rows, import batches, synced items
// - Histogram: HTTP, database and Redis latency
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// METRIC NAMES (Constants)
// =============================================================================

/// HTTP request counter
/// Labels: method (GET/POST), endpoint (/api/v1/products), status (200/500)
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// HTTP request duration histogram
/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Database query duration histogram
/// Labels: operation (select/upsert)
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

/// Redis operation duration histogram
/// Labels: operation (get/set/delete)
pub const REDIS_OPERATION_DURATION_SECONDS: &str = "redis_operation_duration_seconds";

/// Imported spreadsheet rows
/// Labels: outcome (inserted/updated/rejected/overwritten)
pub const CATALOG_IMPORT_ROWS_TOTAL: &str = "catalog_import_rows_total";

/// Finished import runs
/// Labels: status (success/partial/failed)
pub const CATALOG_IMPORT_BATCHES_TOTAL: &str = "catalog_import_batches_total";

/// Marketplace listings processed by sync
/// Labels: source (WB/OZON), outcome (inserted/updated/skipped)
pub const CATALOG_SYNC_ITEMS_TOTAL: &str = "catalog_sync_items_total";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Initialize Prometheus metrics recorder
///
/// # Returns
/// * `PrometheusHandle` - Used to render metrics in Prometheus format
///
/// # Example
/// ```
/// let handle = setup_metrics()?;
/// let metrics_output = handle.render();
/// ```
pub fn setup_metrics() -> Result<PrometheusHandle> {
    // 1ms .. 10s; an import of a large file sits at the top end
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(REDIS_OPERATION_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_histogram!(DB_QUERY_DURATION_SECONDS, "Database query latency in seconds");
    describe_histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "Redis operation latency in seconds"
    );
    describe_counter!(
        CATALOG_IMPORT_ROWS_TOTAL,
        "Spreadsheet rows processed by imports, by outcome"
    );
    describe_counter!(CATALOG_IMPORT_BATCHES_TOTAL, "Finished import runs, by status");
    describe_counter!(
        CATALOG_SYNC_ITEMS_TOTAL,
        "Marketplace listings processed by sync, by outcome"
    );

    Ok(handle)
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Record an HTTP request
///
/// # Arguments
/// * `method` - HTTP method (GET, POST, etc.)
/// * `endpoint` - Route pattern (/api/v1/products/:sku)
/// * `status` - Response status code (200, 404, 500)
/// * `duration_secs` - Request duration in seconds
pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

/// Record database query duration
pub fn record_db_query(operation: &str, duration_secs: f64) {
    histogram!(
        DB_QUERY_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

/// Record Redis operation duration
pub fn record_redis_operation(operation: &str, duration_secs: f64) {
    histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

/// Count imported rows of one outcome
pub fn record_import_rows(outcome: &str, rows: u64) {
    counter!(CATALOG_IMPORT_ROWS_TOTAL, "outcome" => outcome.to_string()).increment(rows);
}

/// Count a finished import run
pub fn record_import_batch(status: &str) {
    counter!(CATALOG_IMPORT_BATCHES_TOTAL, "status" => status.to_string()).increment(1);
}

/// Count one synced listing
pub fn record_sync_item(source: &str, outcome: &str) {
    counter!(
        CATALOG_SYNC_ITEMS_TOTAL,
        "source" => source.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
