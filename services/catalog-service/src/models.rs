// =============================================================================
// MODELS MODULE
// =============================================================================
// This module defines the data structures used throughout the service.
//
// NOTES:
// - Every optional numeric is an Option: "unset" and "zero" mean different
//   things to the derived-field calculator
// - Derived fields never live on Product; see calculator.rs
// - Serde handles JSON serialization/deserialization
// =============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calculator::DerivedFields;
use crate::error::RowError;

// =============================================================================
// CUSTOM DATA
// =============================================================================
// Open key-value extension of a product. Two keys are recognized and feed the
// calculator; everything else is kept verbatim under `extra`.
//
// Stored as one flat JSON object:
// {"commission_pct": 15, "tax_pct": 6, "color": "red"}
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomData {
    /// Marketplace commission, percent of the final price (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission_pct: Option<f64>,

    /// Tax rate, percent of the final price (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_pct: Option<f64>,

    /// Unrecognized keys, preserved as-is
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

// =============================================================================
// PRODUCT
// =============================================================================
// The catalog's unit of record. Only inputs are stored here.
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Server-assigned identifier
    pub id: Uuid,

    /// Stock Keeping Unit - required, unique
    pub sku: String,
    pub seller_sku: Option<String>,
    pub wb_sku: Option<String>,

    /// Marketplace card identifier (unique when present)
    pub nm_id: Option<i64>,

    /// Human-readable product name (required)
    pub title: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub barcode: Option<String>,
    pub comments: Option<String>,
    pub is_active: bool,

    // ----- Pricing inputs -----
    /// List price before the seller discount
    pub price_src: Option<f64>,
    /// Seller discount, percent (documented range 0-100)
    pub seller_discount_pct: Option<f64>,
    pub product_cost: Option<f64>,
    pub shipping_cost: Option<f64>,
    pub logistics_back_cost: Option<f64>,
    pub warehouse_coeff: Option<f64>,

    // ----- Inventory inputs -----
    pub stock_wb: Option<i32>,
    pub stock_seller: Option<i32>,
    pub turnover_days: Option<f64>,

    // ----- Physical inputs -----
    pub weight_kg: Option<f64>,
    pub package_l_cm: Option<f64>,
    pub package_w_cm: Option<f64>,
    pub package_h_cm: Option<f64>,
    /// Explicit volume in litres; derived from the package when unset
    pub volume_l: Option<f64>,

    /// Final price recorded verbatim from an import row that had no list price
    pub price_final_literal: Option<f64>,

    #[serde(default)]
    pub custom_data: CustomData,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// A fresh, active product with every optional input unset
    pub fn new(sku: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            sku: sku.into(),
            seller_sku: None,
            wb_sku: None,
            nm_id: None,
            title: title.into(),
            brand: None,
            category: None,
            barcode: None,
            comments: None,
            is_active: true,
            price_src: None,
            seller_discount_pct: None,
            product_cost: None,
            shipping_cost: None,
            logistics_back_cost: None,
            warehouse_coeff: None,
            stock_wb: None,
            stock_seller: None,
            turnover_days: None,
            weight_kg: None,
            package_l_cm: None,
            package_w_cm: None,
            package_h_cm: None,
            volume_l: None,
            price_final_literal: None,
            custom_data: CustomData::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the write-path rules shared by manual edits and imports.
    ///
    /// The calculator itself never clamps the discount; out-of-range values
    /// are refused here instead so they never reach storage.
    pub fn validate(&self) -> Result<(), RowError> {
        if self.sku.trim().is_empty() {
            return Err(RowError::Validation("required field 'sku' is empty".into()));
        }
        if self.title.trim().is_empty() {
            return Err(RowError::Validation("required field 'title' is empty".into()));
        }
        if let Some(discount) = self.seller_discount_pct {
            if !(0.0..=100.0).contains(&discount) {
                return Err(RowError::Validation(format!(
                    "seller_discount_pct must be within 0..=100, got {discount}"
                )));
            }
        }
        for key in self.custom_data.extra.keys() {
            check_extra_key(key)?;
        }
        Ok(())
    }

    /// Copy every user-editable input from a request body.
    /// Identity (`id`) and timestamps are left alone.
    pub fn apply_input(&mut self, input: ProductInput) {
        let pricing_changed = input.price_src != self.price_src
            || input.seller_discount_pct != self.seller_discount_pct;
        // A body echoing the stored literal next to a new list price means
        // the literal is stale; an explicitly changed literal is kept.
        let stale_literal = input.price_src.is_some()
            && pricing_changed
            && input.price_final_literal == self.price_final_literal;

        self.sku = input.sku.trim().to_string();
        self.seller_sku = input.seller_sku;
        self.wb_sku = input.wb_sku;
        self.nm_id = input.nm_id;
        self.title = input.title.trim().to_string();
        self.brand = input.brand;
        self.category = input.category;
        self.barcode = input.barcode;
        self.comments = input.comments;
        self.is_active = input.is_active.unwrap_or(true);
        self.price_src = input.price_src;
        self.seller_discount_pct = input.seller_discount_pct;
        self.product_cost = input.product_cost;
        self.shipping_cost = input.shipping_cost;
        self.logistics_back_cost = input.logistics_back_cost;
        self.warehouse_coeff = input.warehouse_coeff;
        self.stock_wb = input.stock_wb;
        self.stock_seller = input.stock_seller;
        self.turnover_days = input.turnover_days;
        self.weight_kg = input.weight_kg;
        self.package_l_cm = input.package_l_cm;
        self.package_w_cm = input.package_w_cm;
        self.package_h_cm = input.package_h_cm;
        self.volume_l = input.volume_l;
        self.price_final_literal = if stale_literal { None } else { input.price_final_literal };
        self.custom_data = input.custom_data;
    }
}

/// A custom_data key must survive an export/import round trip: it has to be
/// in sanitized form already and must not read back as a canonical column.
pub fn check_extra_key(key: &str) -> Result<(), RowError> {
    if crate::mapper::sanitize_key(key).as_deref() != Some(key) {
        return Err(RowError::Validation(format!(
            "custom_data key '{key}' must be lowercase letters, digits and '_'"
        )));
    }
    if let Some(field) = crate::mapper::lookup(key) {
        return Err(RowError::Validation(format!(
            "custom_data key '{key}' collides with field '{}'",
            field.key()
        )));
    }
    Ok(())
}

// =============================================================================
// API REQUEST/RESPONSE STRUCTURES
// =============================================================================

// -----------------------------------------------------------------------------
// PRODUCT INPUT
// -----------------------------------------------------------------------------
/// Request body for creating or editing a product
///
/// # Example JSON
/// ```json
/// {
///   "sku": "WB-1001",
///   "title": "Термокружка 450 мл",
///   "price_src": 1000,
///   "seller_discount_pct": 20,
///   "custom_data": {"commission_pct": 15, "tax_pct": 6}
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductInput {
    pub sku: String,
    pub seller_sku: Option<String>,
    pub wb_sku: Option<String>,
    pub nm_id: Option<i64>,
    pub title: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub barcode: Option<String>,
    pub comments: Option<String>,
    pub is_active: Option<bool>,
    pub price_src: Option<f64>,
    pub seller_discount_pct: Option<f64>,
    pub product_cost: Option<f64>,
    pub shipping_cost: Option<f64>,
    pub logistics_back_cost: Option<f64>,
    pub warehouse_coeff: Option<f64>,
    pub stock_wb: Option<i32>,
    pub stock_seller: Option<i32>,
    pub turnover_days: Option<f64>,
    pub weight_kg: Option<f64>,
    pub package_l_cm: Option<f64>,
    pub package_w_cm: Option<f64>,
    pub package_h_cm: Option<f64>,
    pub volume_l: Option<f64>,
    pub price_final_literal: Option<f64>,
    pub custom_data: CustomData,
}

// -----------------------------------------------------------------------------
// PRODUCT VIEW
// -----------------------------------------------------------------------------
/// A product as rendered: stored inputs plus a freshly computed snapshot of
/// the derived fields. Unset derived values serialize as `null`.
#[derive(Debug, Clone, Serialize)]
pub struct ProductView {
    #[serde(flatten)]
    pub product: Product,
    pub derived: DerivedFields,
}

// -----------------------------------------------------------------------------
// LIST FILTER
// -----------------------------------------------------------------------------
/// Query parameters for listing and exporting products
///
/// # Example
/// GET /api/v1/products?search=кружка&brand=Acme&active_only=true&page=2
#[derive(Debug, Clone, Deserialize)]
pub struct ProductFilter {
    /// Case-insensitive match on title, brand, SKU or NM ID
    pub search: Option<String>,

    /// Exact brand match
    pub brand: Option<String>,

    #[serde(default)]
    pub active_only: bool,

    /// Page number (1-indexed, default: 1)
    #[serde(default = "default_page")]
    pub page: i64,

    /// Items per page (default: 50)
    #[serde(default = "default_per_page")]
    pub per_page: i64,
}

fn default_page() -> i64 {
    1
}
fn default_per_page() -> i64 {
    50
}

impl Default for ProductFilter {
    fn default() -> Self {
        Self {
            search: None,
            brand: None,
            active_only: false,
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

impl ProductFilter {
    /// Search text, trimmed; `None` when blank
    pub fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }

    /// In-process equivalent of the SQL WHERE clause
    pub fn matches(&self, product: &Product) -> bool {
        if self.active_only && !product.is_active {
            return false;
        }
        if let Some(brand) = self.brand.as_deref().filter(|b| !b.is_empty()) {
            if product.brand.as_deref() != Some(brand) {
                return false;
            }
        }
        match self.search_term() {
            None => true,
            Some(term) => {
                product.title.to_lowercase().contains(&term)
                    || product.sku.to_lowercase().contains(&term)
                    || product
                        .brand
                        .as_deref()
                        .is_some_and(|b| b.to_lowercase().contains(&term))
                    || product
                        .nm_id
                        .is_some_and(|nm| nm.to_string().contains(&term))
            }
        }
    }
}

/// Response for listing products with pagination metadata
#[derive(Debug, Clone, Serialize)]
pub struct ProductListResponse {
    pub items: Vec<ProductView>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

// =============================================================================
// IMPORT LOG
// =============================================================================
// One entry per import run, written once at the end of the run.

// -----------------------------------------------------------------------------
// IMPORT KEY
// -----------------------------------------------------------------------------
/// Which identifying field an import upserts by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportKey {
    #[default]
    Sku,
    NmId,
}

impl ImportKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportKey::Sku => "sku",
            ImportKey::NmId => "nm_id",
        }
    }
}

impl FromStr for ImportKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sku" => Ok(ImportKey::Sku),
            "nm_id" | "nmid" => Ok(ImportKey::NmId),
            other => Err(format!("unknown import key '{other}', expected 'sku' or 'nm_id'")),
        }
    }
}

// -----------------------------------------------------------------------------
// IMPORT STATUS
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    /// Every row was persisted
    Success,
    /// Some rows were rejected, at least one persisted
    Partial,
    /// Nothing was persisted
    Failed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Success => "success",
            ImportStatus::Partial => "partial",
            ImportStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ImportStatus::Success),
            "partial" => Ok(ImportStatus::Partial),
            "failed" => Ok(ImportStatus::Failed),
            other => Err(format!("unknown import status '{other}'")),
        }
    }
}

// -----------------------------------------------------------------------------
// ROW ISSUES
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    /// The row was not persisted
    Rejected,
    /// A later row with the same key replaced this one
    Overwritten,
}

/// Row-level detail of an import run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowIssue {
    /// Spreadsheet row number (the header is row 1)
    pub row: u32,
    pub kind: IssueKind,
    pub message: String,
}

/// Immutable record of one import run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportLog {
    pub id: Uuid,
    pub file_name: String,
    pub key_field: ImportKey,
    pub status: ImportStatus,
    pub rows_read: i32,
    pub inserted: i32,
    pub updated: i32,
    pub rejected: i32,
    pub issues: Vec<RowIssue>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// CUSTOM FIELD DEFINITIONS
// =============================================================================
// A definition gives a custom_data key a name, a value type and a default.
// Values of defined keys are normalized to that type on every write; keys
// without a definition stay free-form.

/// Value type of a custom field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomFieldType {
    #[default]
    String,
    Number,
    Boolean,
    /// Stored as `YYYY-MM-DD`
    Date,
    /// One of a fixed list of options, matched case-insensitively
    Choice,
}

impl CustomFieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CustomFieldType::String => "string",
            CustomFieldType::Number => "number",
            CustomFieldType::Boolean => "boolean",
            CustomFieldType::Date => "date",
            CustomFieldType::Choice => "choice",
        }
    }

    /// Phrase used in coercion errors
    pub fn expected(&self) -> &'static str {
        match self {
            CustomFieldType::String => "text",
            CustomFieldType::Number => "a number",
            CustomFieldType::Boolean => "a yes/no value",
            CustomFieldType::Date => "a date",
            CustomFieldType::Choice => "one of the allowed choices",
        }
    }
}

impl fmt::Display for CustomFieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CustomFieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "string" => Ok(CustomFieldType::String),
            "number" => Ok(CustomFieldType::Number),
            "boolean" => Ok(CustomFieldType::Boolean),
            "date" => Ok(CustomFieldType::Date),
            "choice" => Ok(CustomFieldType::Choice),
            other => Err(format!("unknown custom field type '{other}'")),
        }
    }
}

/// A stored custom field definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomFieldDefinition {
    /// custom_data key, in sanitized form
    pub key: String,
    /// Display name
    pub name: String,
    pub field_type: CustomFieldType,
    /// Already normalized to `field_type`
    pub default_value: Option<serde_json::Value>,
    /// New products must carry a value (or get the default)
    pub required: bool,
    /// Included in exports
    pub visible: bool,
    /// Export column position among custom fields
    pub sort_order: i32,
    /// Allowed options of a `choice` field; empty otherwise
    pub choices: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request body for creating or editing a custom field
///
/// # Example JSON
/// ```json
/// {"key": "season", "name": "Сезон", "field_type": "choice", "choices": ["Лето", "Зима"]}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct CustomFieldInput {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub field_type: CustomFieldType,
    #[serde(default)]
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default)]
    pub choices: Vec<String>,
}

fn default_visible() -> bool {
    true
}

// -----------------------------------------------------------------------------
// BULK UPDATE
// -----------------------------------------------------------------------------
/// Set one field to the same value on several products
///
/// # Example JSON
/// ```json
/// {"skus": ["WB-1001", "WB-1002"], "field": "stock_wb", "value": 0}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct BulkUpdateRequest {
    pub skus: Vec<String>,
    /// Canonical field key or header, or a custom field key
    pub field: String,
    /// `null` or blank clears the field
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkUpdateResult {
    pub updated: usize,
    /// Requested SKUs with no product
    pub missing: Vec<String>,
}

// =============================================================================
// FIELD CATALOG RESPONSE
// =============================================================================
/// One canonical field as advertised to spreadsheet users
#[derive(Debug, Clone, Serialize)]
pub struct FieldDescriptor {
    pub key: &'static str,
    pub header: &'static str,
    pub aliases: Vec<&'static str>,
    pub derived: bool,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

/// Simple health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Detailed readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

/// Individual dependency health checks
#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    pub redis: bool,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type/code
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }
}
