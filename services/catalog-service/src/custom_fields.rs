// =============================================================================
// CUSTOM FIELDS MODULE
// =============================================================================
// Typed custom_data keys and bulk edits.
//
// A definition turns a free-form custom_data key into a typed field:
// - every write (HTTP, import, bulk update) normalizes its value to the type
// - new products receive the default when they carry no value
// - saving a definition rewrites stored products: values are renamed with the
//   key, normalized, and (on creation only) filled with the default
// - deleting a definition removes the key from every product
//
// NOTES:
// - Product rewrites are per product, not one transaction; a failure midway
//   leaves the products already written in their new shape
// - Keys are sanitized and may not read back as a canonical column, so a
//   defined key always survives an export/import round trip
// =============================================================================

use std::collections::{BTreeSet, HashSet};

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::db::CatalogRepository;
use crate::error::{AppError, AppResult, RowError};
use crate::mapper::{lookup, parse_flag, parse_real, sanitize_key, single_field_patch, Field};
use crate::models::{
    BulkUpdateRequest, BulkUpdateResult, CustomFieldDefinition, CustomFieldInput, CustomFieldType,
    Product, ProductFilter,
};

/// Products read per page while rewriting the whole catalog
const SCAN_PAGE: i64 = 500;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y"];

// =============================================================================
// VALUE NORMALIZATION
// =============================================================================

fn parse_date(text: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.date_naive()))
        .or_else(|| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
}

/// Convert a raw value to the definition's type.
///
/// `Ok(None)` for null or blank input. A value that does not fit the type is
/// a `RowError::Coercion` naming the key.
///
/// # Example
/// ```
/// // number field: "1 234,5" -> 1234.5
/// // choice field with ["Лето", "Зима"]: "лето" -> "Лето"
/// let value = normalize_value(&definition, &json!("лето"))?;
/// ```
pub fn normalize_value(
    definition: &CustomFieldDefinition,
    value: &Value,
) -> Result<Option<Value>, RowError> {
    let text = match value {
        Value::Null => return Ok(None),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    if text.is_empty() {
        return Ok(None);
    }
    let fail = || RowError::Coercion {
        column: definition.key.clone(),
        value: text.clone(),
        expected: definition.field_type.expected(),
    };
    if matches!(value, Value::Array(_) | Value::Object(_)) {
        return Err(fail());
    }

    let normalized = match definition.field_type {
        CustomFieldType::String => Some(Value::String(text.clone())),
        CustomFieldType::Number => {
            let number = match value {
                Value::Number(n) => n.as_f64(),
                _ => parse_real(&text),
            };
            number.and_then(serde_json::Number::from_f64).map(Value::Number)
        }
        CustomFieldType::Boolean => {
            let flag = match value {
                Value::Bool(flag) => Some(*flag),
                _ => parse_flag(&text),
            };
            flag.map(Value::Bool)
        }
        CustomFieldType::Date => {
            parse_date(&text).map(|date| Value::String(date.format("%Y-%m-%d").to_string()))
        }
        CustomFieldType::Choice => {
            let wanted = text.to_lowercase();
            definition
                .choices
                .iter()
                .find(|choice| choice.to_lowercase() == wanted)
                .map(|choice| Value::String(choice.clone()))
        }
    };
    normalized.map(Some).ok_or_else(fail)
}

/// Bring the defined keys of one product in line with their definitions.
///
/// Values are normalized in place. A new product without a value gets the
/// default; without a default, a required field rejects it. Stored products
/// are not held to `required`, since defining a field never backfills them.
pub fn conform_product(
    product: &mut Product,
    definitions: &[CustomFieldDefinition],
    is_new: bool,
) -> Result<(), RowError> {
    for definition in definitions {
        let extra = &mut product.custom_data.extra;
        let current = extra.get(&definition.key).cloned().unwrap_or(Value::Null);
        if let Some(value) = normalize_value(definition, &current)? {
            extra.insert(definition.key.clone(), value);
            continue;
        }
        extra.remove(&definition.key);
        if !is_new {
            continue;
        }
        match &definition.default_value {
            Some(default) => {
                extra.insert(definition.key.clone(), default.clone());
            }
            None if definition.required => {
                return Err(RowError::Validation(format!(
                    "custom field '{}' is required",
                    definition.name
                )));
            }
            None => {}
        }
    }
    Ok(())
}

/// Custom columns of an export: visible definitions in their order, then
/// undefined keys found on the products, sorted. Hidden definitions are
/// left out.
pub fn export_keys(products: &[Product], definitions: &[CustomFieldDefinition]) -> Vec<String> {
    let defined: HashSet<&str> = definitions.iter().map(|d| d.key.as_str()).collect();
    let undefined: BTreeSet<&String> = products
        .iter()
        .flat_map(|p| p.custom_data.extra.keys())
        .filter(|key| !defined.contains(key.as_str()))
        .collect();

    definitions
        .iter()
        .filter(|d| d.visible)
        .map(|d| d.key.clone())
        .chain(undefined.into_iter().cloned())
        .collect()
}

// =============================================================================
// DEFINITIONS
// =============================================================================

/// Validate an input into a definition ready to store.
pub fn prepare_definition(input: CustomFieldInput) -> AppResult<CustomFieldDefinition> {
    let key = sanitize_key(&input.key).ok_or_else(|| {
        AppError::Validation("custom field key must contain letters or digits".into())
    })?;
    if let Some(field) = lookup(&key) {
        return Err(AppError::Validation(format!(
            "custom field key '{key}' collides with field '{}'",
            field.key()
        )));
    }

    let mut choices: Vec<String> = Vec::new();
    if input.field_type == CustomFieldType::Choice {
        for choice in input.choices.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
            if !choices.iter().any(|c| c.to_lowercase() == choice.to_lowercase()) {
                choices.push(choice.to_string());
            }
        }
        if choices.is_empty() {
            return Err(AppError::Validation(
                "a choice field needs at least one choice".into(),
            ));
        }
    }

    let name = input
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map_or_else(|| key.clone(), str::to_string);

    let now = chrono::Utc::now();
    let mut definition = CustomFieldDefinition {
        key,
        name,
        field_type: input.field_type,
        default_value: None,
        required: input.required,
        visible: input.visible,
        sort_order: input.sort_order,
        choices,
        created_at: now,
        updated_at: now,
    };
    if let Some(raw) = &input.default_value {
        definition.default_value = normalize_value(&definition, raw).map_err(|err| {
            AppError::Validation(format!("default value does not fit the field type: {err}"))
        })?;
    }
    Ok(definition)
}

/// Apply every product through `rewrite`; products it reports as changed
/// are saved. Returns the SKUs written.
async fn rewrite_products<R, F>(repo: &R, mut rewrite: F) -> Result<Vec<String>>
where
    R: CatalogRepository + ?Sized,
    F: FnMut(&mut Product) -> bool,
{
    let mut touched = Vec::new();
    let mut page = 1;
    loop {
        let filter = ProductFilter { page, per_page: SCAN_PAGE, ..Default::default() };
        let products = repo.list(&filter).await?;
        let last_page = (products.len() as i64) < SCAN_PAGE;
        for mut product in products {
            if rewrite(&mut product) {
                repo.upsert(&product).await?;
                touched.push(product.sku);
            }
        }
        if last_page {
            return Ok(touched);
        }
        page += 1;
    }
}

/// Rename, normalize and (optionally) default the definition's key on one
/// product. Values that no longer fit the type are dropped.
fn apply_definition(
    product: &mut Product,
    definition: &CustomFieldDefinition,
    old_key: Option<&str>,
    fill_default: bool,
) -> bool {
    let extra = &mut product.custom_data.extra;
    let before = extra.clone();

    if let Some(old_key) = old_key {
        if let Some(value) = extra.remove(old_key) {
            extra.entry(definition.key.clone()).or_insert(value);
        }
    }

    let current = extra.get(&definition.key).cloned().unwrap_or(Value::Null);
    match normalize_value(definition, &current) {
        Ok(Some(value)) => {
            extra.insert(definition.key.clone(), value);
        }
        Ok(None) | Err(_) => {
            extra.remove(&definition.key);
            if let Some(default) = definition.default_value.as_ref().filter(|_| fill_default) {
                extra.insert(definition.key.clone(), default.clone());
            }
        }
    }

    *extra != before
}

/// Create a definition (`original_key` = None) or replace the one stored
/// under `original_key`, then bring stored products in line.
///
/// # Returns
/// * `Ok((definition, touched))` - The stored definition and the SKUs rewritten
/// * `Err(AppError::Conflict)` - The key belongs to another definition
/// * `Err(AppError::NotFound)` - Nothing is stored under `original_key`
pub async fn save_definition<R>(
    repo: &R,
    original_key: Option<&str>,
    input: CustomFieldInput,
) -> AppResult<(CustomFieldDefinition, Vec<String>)>
where
    R: CatalogRepository + ?Sized,
{
    let definition = prepare_definition(input)?;
    let saved = match original_key {
        Some(original) => repo
            .update_custom_field(original, &definition)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("custom field not found: {original}")))?,
        None => repo.insert_custom_field(&definition).await?,
    };

    let renamed_from = original_key.filter(|key| *key != saved.key);
    let fill_default = original_key.is_none();
    let touched = rewrite_products(repo, |product| {
        apply_definition(product, &saved, renamed_from, fill_default)
    })
    .await?;

    tracing::info!(
        key = %saved.key,
        field_type = %saved.field_type,
        renamed_from = renamed_from.unwrap_or_default(),
        products = touched.len(),
        "Custom field saved"
    );
    Ok((saved, touched))
}

/// Delete a definition and strip its key from every product.
/// Returns the SKUs rewritten.
pub async fn delete_definition<R>(repo: &R, key: &str) -> AppResult<Vec<String>>
where
    R: CatalogRepository + ?Sized,
{
    let not_found = || AppError::NotFound(format!("custom field not found: {key}"));
    let key = sanitize_key(key).ok_or_else(not_found)?;
    if !repo.delete_custom_field(&key).await? {
        return Err(not_found());
    }

    let touched =
        rewrite_products(repo, |product| product.custom_data.extra.remove(&key).is_some()).await?;

    tracing::info!(key = %key, products = touched.len(), "Custom field deleted");
    Ok(touched)
}

// =============================================================================
// BULK UPDATE
// =============================================================================

enum BulkTarget {
    Canonical(Field),
    Custom(CustomFieldDefinition),
}

async fn resolve_target<R>(repo: &R, name: &str) -> AppResult<BulkTarget>
where
    R: CatalogRepository + ?Sized,
{
    if let Some(field) = lookup(name) {
        return Ok(BulkTarget::Canonical(field));
    }
    if let Some(key) = sanitize_key(name) {
        if let Some(definition) = repo.get_custom_field(&key).await? {
            return Ok(BulkTarget::Custom(definition));
        }
    }
    Err(AppError::BadRequest(format!("unknown field '{name}'")))
}

/// JSON scalar as the text an import cell would hold
fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Set one field on several products.
///
/// Every product is changed and validated before the first write, so one
/// product breaking a rule (e.g. a discount over 100) fails the request
/// without writing anything. SKUs with no product are reported back.
///
/// # Returns
/// * `Ok((result, touched))` - Counts and the SKUs written
pub async fn bulk_update<R>(
    repo: &R,
    request: BulkUpdateRequest,
) -> AppResult<(BulkUpdateResult, Vec<String>)>
where
    R: CatalogRepository + ?Sized,
{
    let mut skus: Vec<String> = Vec::new();
    for sku in request.skus.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if !skus.iter().any(|known| known == sku) {
            skus.push(sku.to_string());
        }
    }
    if skus.is_empty() {
        return Err(AppError::BadRequest("no products selected".into()));
    }

    let target = resolve_target(repo, &request.field).await?;

    let mut products = Vec::new();
    let mut missing = Vec::new();
    for sku in skus {
        match repo.get(&sku).await? {
            Some(product) => products.push(product),
            None => missing.push(sku),
        }
    }

    match &target {
        BulkTarget::Canonical(field @ (Field::Sku | Field::NmId)) => {
            return Err(AppError::Validation(format!(
                "'{}' identifies a product and cannot be set in bulk",
                field.key()
            )));
        }
        BulkTarget::Canonical(field) => {
            let patch = single_field_patch(*field, &cell_text(&request.value))
                .map_err(|err| AppError::Validation(err.to_string()))?;
            for product in &mut products {
                patch.apply(product);
            }
        }
        BulkTarget::Custom(definition) => {
            let value = normalize_value(definition, &request.value)
                .map_err(|err| AppError::Validation(err.to_string()))?;
            if value.is_none() && definition.required {
                return Err(AppError::Validation(format!(
                    "custom field '{}' is required and cannot be cleared",
                    definition.name
                )));
            }
            for product in &mut products {
                match &value {
                    Some(value) => {
                        product
                            .custom_data
                            .extra
                            .insert(definition.key.clone(), value.clone());
                    }
                    None => {
                        product.custom_data.extra.remove(&definition.key);
                    }
                }
            }
        }
    }

    for product in &products {
        product
            .validate()
            .map_err(|err| AppError::Validation(format!("{}: {err}", product.sku)))?;
    }

    let mut touched = Vec::with_capacity(products.len());
    for product in &products {
        let saved = repo.upsert(product).await?;
        touched.push(saved.sku);
    }

    tracing::info!(
        field = %request.field,
        updated = touched.len(),
        missing = missing.len(),
        "Bulk update finished"
    );
    Ok((BulkUpdateResult { updated: touched.len(), missing }, touched))
}
