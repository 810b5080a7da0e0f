// =============================================================================
// HANDLERS MODULE
// =============================================================================
// This module contains all HTTP request handlers (controller layer).
//
// NOTES:
// - Every product that leaves this layer goes through view(): stored inputs
//   plus a freshly computed derived snapshot
// - Every write path invalidates the cached inputs of the SKUs it touched
// =============================================================================

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;

use crate::calculator::DerivedFields;
use crate::custom_fields::{self, conform_product};
use crate::db::CatalogRepository;
use crate::error::{AppError, AppResult};
use crate::export::{self, ExportFormat};
use crate::import::{import_rows, read_csv_rows, ImportOptions};
use crate::mapper::{self, default_export_columns, resolve_columns, ExportTable};
use crate::metrics;
use crate::models::*;
use crate::sync::{self, Listing, SnapshotSource, SyncReport};
use crate::AppState;

const MAX_PER_PAGE: i64 = 200;

fn view(state: &AppState, product: Product) -> ProductView {
    let derived = DerivedFields::compute(&product, state.config.price_precedence);
    ProductView { product, derived }
}

fn elapsed(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness check - Is the service running?
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "catalog-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - Are PostgreSQL and Redis reachable?
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_healthy = state.db.health_check().await;
    let redis_healthy = state.cache.ping().await;

    let all_healthy = db_healthy && redis_healthy;
    let status = if all_healthy { "ready" } else { "not_ready" };

    let response = ReadinessResponse {
        status: status.to_string(),
        checks: ReadinessChecks {
            database: db_healthy,
            redis: redis_healthy,
        },
    };

    if all_healthy {
        Ok(Json(response))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

// =============================================================================
// METRICS ENDPOINT
// =============================================================================
/// Prometheus metrics endpoint
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// PRODUCT ENDPOINTS
// =============================================================================

// -----------------------------------------------------------------------------
// LIST PRODUCTS
// -----------------------------------------------------------------------------
/// List products with filtering and pagination
///
/// GET /api/v1/products?search=кружка&brand=Acme&active_only=true&page=1&per_page=50
///
/// # Response
/// ```json
/// {
///   "items": [{"sku": "WB-1001", ..., "derived": {"price_final": 800.0, ...}}],
///   "total": 150,
///   "page": 1,
///   "per_page": 50
/// }
/// ```
pub async fn list_products(
    State(state): State<Arc<AppState>>,
    Query(mut filter): Query<ProductFilter>,
) -> AppResult<Json<ProductListResponse>> {
    let start = Instant::now();

    filter.page = filter.page.max(1);
    filter.per_page = filter.per_page.clamp(1, MAX_PER_PAGE);

    let products = state.db.list(&filter).await?;
    let total = state.db.count(&filter).await?;

    metrics::record_http_request("GET", "/api/v1/products", 200, elapsed(start));

    Ok(Json(ProductListResponse {
        items: products.into_iter().map(|p| view(&state, p)).collect(),
        total,
        page: filter.page,
        per_page: filter.per_page,
    }))
}

// -----------------------------------------------------------------------------
// GET SINGLE PRODUCT
// -----------------------------------------------------------------------------
/// Get one product with its derived fields
///
/// GET /api/v1/products/:sku
///
/// # Response
/// - 200 OK: Product found
/// - 404 Not Found: No product with this SKU
pub async fn get_product(
    State(state): State<Arc<AppState>>,
    Path(sku): Path<String>,
) -> AppResult<Json<ProductView>> {
    let start = Instant::now();

    if let Some(product) = state.cache.get(&sku).await {
        metrics::record_http_request("GET", "/api/v1/products/:sku", 200, elapsed(start));
        return Ok(Json(view(&state, product)));
    }

    let product = state
        .db
        .get(&sku)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("SKU not found: {sku}")))?;

    state.cache.put(&product).await;

    metrics::record_http_request("GET", "/api/v1/products/:sku", 200, elapsed(start));
    Ok(Json(view(&state, product)))
}

// -----------------------------------------------------------------------------
// CREATE / REPLACE
// -----------------------------------------------------------------------------
/// Create a product, or replace the inputs of the product with the same SKU
///
/// POST /api/v1/products
///
/// # Request Body
/// ```json
/// {"sku": "WB-1001", "title": "Термокружка", "price_src": 1000, "seller_discount_pct": 20}
/// ```
///
/// # Response
/// - 201 Created: New product
/// - 200 OK: Existing product replaced
/// - 400 Bad Request: A custom field value that does not fit its definition
/// - 409 Conflict: NM ID already used by another product
/// - 422 Unprocessable Entity: Missing SKU/title, discount outside 0..=100,
///   or a custom_data key that would not survive export and re-import
pub async fn create_product(
    State(state): State<Arc<AppState>>,
    Json(input): Json<ProductInput>,
) -> AppResult<(StatusCode, Json<ProductView>)> {
    let start = Instant::now();

    let existing = state.db.get(input.sku.trim()).await?;
    let created = existing.is_none();
    let mut product = existing.unwrap_or_else(|| Product::new("", ""));
    product.apply_input(input);
    let definitions = state.db.list_custom_fields().await?;
    conform_product(&mut product, &definitions, created)?;
    product.validate()?;

    let saved = state.db.upsert(&product).await?;
    state.cache.invalidate(&saved.sku).await;

    tracing::info!(sku = %saved.sku, created, "Product saved");

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    metrics::record_http_request("POST", "/api/v1/products", status.as_u16(), elapsed(start));
    Ok((status, Json(view(&state, saved))))
}

// -----------------------------------------------------------------------------
// UPDATE
// -----------------------------------------------------------------------------
/// Replace the inputs of an existing product
///
/// PUT /api/v1/products/:sku
///
/// A blank `sku` in the body keeps the current SKU; a different one renames
/// the product.
///
/// # Response
/// - 200 OK: Product updated
/// - 404 Not Found: No product with this SKU
/// - 409 Conflict: New SKU or NM ID already used by another product
pub async fn update_product(
    State(state): State<Arc<AppState>>,
    Path(sku): Path<String>,
    Json(mut input): Json<ProductInput>,
) -> AppResult<Json<ProductView>> {
    let start = Instant::now();

    let mut product = state
        .db
        .get(&sku)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("SKU not found: {sku}")))?;

    if input.sku.trim().is_empty() {
        input.sku = sku.clone();
    }
    product.apply_input(input);
    let definitions = state.db.list_custom_fields().await?;
    conform_product(&mut product, &definitions, false)?;
    product.validate()?;

    let saved = state.db.upsert(&product).await?;
    state
        .cache
        .invalidate_many(&[sku.clone(), saved.sku.clone()])
        .await;

    tracing::info!(sku = %sku, new_sku = %saved.sku, "Product updated");

    metrics::record_http_request("PUT", "/api/v1/products/:sku", 200, elapsed(start));
    Ok(Json(view(&state, saved)))
}

// -----------------------------------------------------------------------------
// DEACTIVATE
// -----------------------------------------------------------------------------
/// Switch a product off. Products are never deleted.
///
/// POST /api/v1/products/:sku/deactivate
pub async fn deactivate_product(
    State(state): State<Arc<AppState>>,
    Path(sku): Path<String>,
) -> AppResult<Json<ProductView>> {
    let start = Instant::now();

    let product = state
        .db
        .set_active(&sku, false)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("SKU not found: {sku}")))?;
    state.cache.invalidate(&sku).await;

    tracing::info!(sku = %sku, "Product deactivated");

    metrics::record_http_request(
        "POST",
        "/api/v1/products/:sku/deactivate",
        200,
        elapsed(start),
    );
    Ok(Json(view(&state, product)))
}

// -----------------------------------------------------------------------------
// BRANDS
// -----------------------------------------------------------------------------
/// Distinct brands, for filter drop-downs
///
/// GET /api/v1/products/brands
pub async fn list_brands(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<String>>> {
    let start = Instant::now();
    let brands = state.db.distinct_brands().await?;
    metrics::record_http_request("GET", "/api/v1/products/brands", 200, elapsed(start));
    Ok(Json(brands))
}

// -----------------------------------------------------------------------------
// BULK UPDATE
// -----------------------------------------------------------------------------
/// Set one field to the same value on several products
///
/// POST /api/v1/products/bulk-update
///
/// # Request Body
/// ```json
/// {"skus": ["WB-1001", "WB-1002"], "field": "seller_discount_pct", "value": 15}
/// ```
///
/// # Response
/// - 200 OK: `{"updated": 2, "missing": []}`
/// - 400 Bad Request: No SKUs or unknown field
/// - 422 Unprocessable Entity: Value does not fit, or a product would break
///   a rule; nothing is written
pub async fn bulk_update_products(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BulkUpdateRequest>,
) -> AppResult<Json<BulkUpdateResult>> {
    let start = Instant::now();

    let (result, touched) = custom_fields::bulk_update(&state.db, request).await?;
    state.cache.invalidate_many(&touched).await;

    metrics::record_http_request("POST", "/api/v1/products/bulk-update", 200, elapsed(start));
    Ok(Json(result))
}

// =============================================================================
// CUSTOM FIELD ENDPOINTS
// =============================================================================

/// Custom field definitions in export order
///
/// GET /api/v1/custom-fields
pub async fn list_custom_fields(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<CustomFieldDefinition>>> {
    let start = Instant::now();
    let definitions = state.db.list_custom_fields().await?;
    metrics::record_http_request("GET", "/api/v1/custom-fields", 200, elapsed(start));
    Ok(Json(definitions))
}

/// Define a custom field; stored values are normalized and the default is
/// filled in where a product has none
///
/// POST /api/v1/custom-fields
///
/// # Response
/// - 201 Created
/// - 409 Conflict: Key already defined
/// - 422 Unprocessable Entity: Key collides with a canonical field, choice
///   field without choices, or a default that does not fit the type
pub async fn create_custom_field(
    State(state): State<Arc<AppState>>,
    Json(input): Json<CustomFieldInput>,
) -> AppResult<(StatusCode, Json<CustomFieldDefinition>)> {
    let start = Instant::now();

    let (definition, touched) = custom_fields::save_definition(&state.db, None, input).await?;
    state.cache.invalidate_many(&touched).await;

    metrics::record_http_request("POST", "/api/v1/custom-fields", 201, elapsed(start));
    Ok((StatusCode::CREATED, Json(definition)))
}

/// Replace a custom field definition; a new key renames the stored values
///
/// PUT /api/v1/custom-fields/:key
pub async fn update_custom_field(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(input): Json<CustomFieldInput>,
) -> AppResult<Json<CustomFieldDefinition>> {
    let start = Instant::now();

    let (definition, touched) =
        custom_fields::save_definition(&state.db, Some(key.as_str()), input).await?;
    state.cache.invalidate_many(&touched).await;

    metrics::record_http_request("PUT", "/api/v1/custom-fields/:key", 200, elapsed(start));
    Ok(Json(definition))
}

/// Delete a custom field and its values on every product
///
/// DELETE /api/v1/custom-fields/:key
pub async fn delete_custom_field(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> AppResult<StatusCode> {
    let start = Instant::now();

    let touched = custom_fields::delete_definition(&state.db, &key).await?;
    state.cache.invalidate_many(&touched).await;

    metrics::record_http_request("DELETE", "/api/v1/custom-fields/:key", 204, elapsed(start));
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// SPREADSHEET ENDPOINTS
// =============================================================================

// -----------------------------------------------------------------------------
// IMPORT
// -----------------------------------------------------------------------------
/// Import a CSV file
///
/// POST /api/v1/products/import  (multipart/form-data)
///
/// # Form Fields
/// - `file`: the CSV file (required)
/// - `key`: `sku` (default) or `nm_id`
/// - `known_fields_only`: `true` to drop unrecognized columns
///
/// # Response
/// The stored import log: counts plus row-level issues. Row failures do not
/// fail the request.
pub async fn import_products(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> AppResult<Json<ImportLog>> {
    let start = Instant::now();

    let mut file: Option<(String, axum::body::Bytes)> = None;
    let mut key = ImportKey::default();
    let mut known_fields_only = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("upload.csv").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                file = Some((file_name, bytes));
            }
            "key" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                key = text.parse().map_err(AppError::BadRequest)?;
            }
            "known_fields_only" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                known_fields_only = matches!(text.trim(), "true" | "1" | "on" | "yes");
            }
            _ => {}
        }
    }

    let (file_name, bytes) =
        file.ok_or_else(|| AppError::BadRequest("multipart field 'file' is required".into()))?;

    tracing::info!(
        file = %file_name,
        bytes = bytes.len(),
        key = key.as_str(),
        known_fields_only,
        "Import started"
    );

    let rows = read_csv_rows(&bytes).map_err(|e| AppError::BadRequest(format!("{e:#}")))?;
    let options = ImportOptions { file_name, key, known_fields_only };
    let outcome = import_rows(&state.db, rows, &options).await?;

    state.cache.invalidate_many(&outcome.touched).await;

    metrics::record_http_request("POST", "/api/v1/products/import", 200, elapsed(start));
    Ok(Json(outcome.log))
}

// -----------------------------------------------------------------------------
// EXPORT
// -----------------------------------------------------------------------------
/// Query parameters of the export endpoint
///
/// # Example
/// GET /api/v1/products/export?format=xlsx&columns=sku,title,price_final,margin&brand=Acme
#[derive(Debug, Default, Deserialize)]
pub struct ExportParams {
    /// `csv` (default) or `xlsx`
    pub format: Option<String>,
    /// Comma-separated field keys or headers; all fields when absent
    pub columns: Option<String>,
    pub search: Option<String>,
    pub brand: Option<String>,
    #[serde(default)]
    pub active_only: bool,
}

impl ExportParams {
    fn filter(&self, max_rows: i64) -> ProductFilter {
        ProductFilter {
            search: self.search.clone(),
            brand: self.brand.clone(),
            active_only: self.active_only,
            page: 1,
            per_page: max_rows,
        }
    }
}

fn attachment_name(format: ExportFormat) -> String {
    format!(
        "products_{}.{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}

/// Export products as CSV or XLSX
///
/// GET /api/v1/products/export
///
/// Derived columns are snapshots computed at export time. Custom columns
/// follow the visible custom field definitions, then any undefined keys.
pub async fn export_products(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ExportParams>,
) -> AppResult<Response> {
    let start = Instant::now();

    let format: ExportFormat = match params.format.as_deref() {
        Some(raw) => raw.parse().map_err(AppError::BadRequest)?,
        None => ExportFormat::default(),
    };
    let columns = match params.columns.as_deref() {
        Some(list) => resolve_columns(list).map_err(AppError::BadRequest)?,
        None => default_export_columns(),
    };

    let products = state
        .db
        .list(&params.filter(state.config.export_max_rows))
        .await?;
    let definitions = state.db.list_custom_fields().await?;
    let extra_keys = custom_fields::export_keys(&products, &definitions);
    let table = ExportTable::with_extra_keys(
        &products,
        &columns,
        &extra_keys,
        state.config.price_precedence,
    );
    let bytes = export::export(&table, format)?;

    tracing::info!(
        rows = products.len(),
        columns = columns.len() + extra_keys.len(),
        format = format.extension(),
        "Export generated"
    );

    metrics::record_http_request("GET", "/api/v1/products/export", 200, elapsed(start));

    let disposition = format!("attachment; filename=\"{}\"", attachment_name(format));
    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

// =============================================================================
// LISTING SYNC
// =============================================================================

/// Listings pushed by a marketplace client
///
/// # Example JSON
/// ```json
/// {
///   "source": "WB",
///   "key_type": "nm_id",
///   "items": [{"external_key": "123456", "nm_id": 123456, "title": "Кружка"}]
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub source: String,
    pub key_type: String,
    #[serde(default)]
    pub items: Vec<Listing>,
    /// Items stored per page (default: 100)
    #[serde(default = "default_sync_page_size")]
    pub page_size: usize,
}

fn default_sync_page_size() -> usize {
    100
}

/// Upsert a listing snapshot into the legacy item store
///
/// POST /api/v1/sync/listings
///
/// # Response
/// - 200 OK: `{"inserted": 2, "updated": 1, "skipped": 0, "pages": 1}`
/// - 400 Bad Request: Blank source or key type
pub async fn sync_listings(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncRequest>,
) -> AppResult<Json<SyncReport>> {
    let start = Instant::now();

    let source = request.source.trim().to_uppercase();
    let key_type = request.key_type.trim().to_string();
    if source.is_empty() || key_type.is_empty() {
        return Err(AppError::BadRequest(
            "'source' and 'key_type' are required".into(),
        ));
    }

    tracing::info!(source = %source, items = request.items.len(), "Listing sync started");

    let snapshot = SnapshotSource::new(source, key_type, request.items, request.page_size);
    let report = sync::sync_listings(&snapshot, &state.db, snapshot.page_count()).await?;

    metrics::record_http_request("POST", "/api/v1/sync/listings", 200, elapsed(start));
    Ok(Json(report))
}

// =============================================================================
// IMPORT LOG & FIELD CATALOG
// =============================================================================

/// Query parameters of the import log endpoint
#[derive(Debug, Deserialize)]
pub struct LogParams {
    /// Number of entries (default: 20, max: 100)
    #[serde(default = "default_log_limit")]
    pub limit: i64,
}

fn default_log_limit() -> i64 {
    20
}

/// Recent import runs, newest first
///
/// GET /api/v1/import-logs?limit=20
pub async fn list_import_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogParams>,
) -> AppResult<Json<Vec<ImportLog>>> {
    let start = Instant::now();
    let logs = state.db.list_import_logs(params.limit.clamp(1, 100)).await?;
    metrics::record_http_request("GET", "/api/v1/import-logs", 200, elapsed(start));
    Ok(Json(logs))
}

/// Canonical fields with display headers and accepted aliases
///
/// GET /api/v1/fields
pub async fn list_fields() -> Json<Vec<FieldDescriptor>> {
    Json(mapper::field_catalog())
}
