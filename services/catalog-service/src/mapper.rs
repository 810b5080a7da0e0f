// =============================================================================
// MAPPER MODULE
// =============================================================================
// Field reconciliation between spreadsheet columns and canonical product
// fields, in both directions.
//
// IMPORT:  header → canonical field → typed cell → ProductPatch
// EXPORT:  canonical field → display header, product → typed cells
//
// NOTES:
// - The alias table is static and built once per process (once_cell::Lazy)
// - Header lookups ignore case, repeated whitespace and ё/е spelling
// - Derived-field columns are recognized on import and ignored: derived
//   values are never written back as input. The one exception is an
//   "already discounted" price on a row without a list price, which is kept
//   as `price_final_literal`
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap};

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::calculator::{DerivedFields, PricePrecedence};
use crate::error::RowError;
use crate::models::{FieldDescriptor, ImportKey, Product};

// =============================================================================
// CANONICAL FIELDS
// =============================================================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    // ----- Identity & description -----
    Sku,
    SellerSku,
    WbSku,
    NmId,
    Title,
    Brand,
    Category,
    Barcode,
    Comments,
    IsActive,
    // ----- Pricing inputs -----
    PriceSrc,
    SellerDiscountPct,
    PriceFinalLiteral,
    ProductCost,
    ShippingCost,
    LogisticsBackCost,
    WarehouseCoeff,
    CommissionPct,
    TaxPct,
    // ----- Inventory & physical inputs -----
    StockWb,
    StockSeller,
    TurnoverDays,
    WeightKg,
    PackageLCm,
    PackageWCm,
    PackageHCm,
    VolumeL,
    // ----- Derived (export snapshots only) -----
    PriceFinal,
    Commission,
    Tax,
    Margin,
    MarginPercent,
    StockTotal,
    VolumeComputed,
}

/// How a cell of this field is coerced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Text,
    Real,
    /// 32-bit counts (stock)
    Count,
    /// 64-bit identifiers (nm_id)
    Id,
    Flag,
}

impl ValueKind {
    fn expected(&self) -> &'static str {
        match self {
            ValueKind::Text => "text",
            ValueKind::Real => "a number",
            ValueKind::Count | ValueKind::Id => "a whole number",
            ValueKind::Flag => "a yes/no value",
        }
    }
}

/// One row of the static field table
#[derive(Debug)]
pub struct FieldSpec {
    pub field: Field,
    /// snake_case name, also accepted as a header
    pub key: &'static str,
    /// Header written on export
    pub header: &'static str,
    /// Extra headers accepted on import
    pub aliases: &'static [&'static str],
    kind: ValueKind,
    pub derived: bool,
}

macro_rules! spec {
    ($field:ident, $key:literal, $header:literal, $kind:ident, derived = $derived:literal, [$($alias:literal),* $(,)?]) => {
        FieldSpec {
            field: Field::$field,
            key: $key,
            header: $header,
            aliases: &[$($alias),*],
            kind: ValueKind::$kind,
            derived: $derived,
        }
    };
}

/// Every canonical field, in export column order: inputs first, then the
/// derived snapshots.
static FIELD_SPECS: &[FieldSpec] = &[
    spec!(Sku, "sku", "Артикул", Text, derived = false, ["SKU", "Код товара"]),
    spec!(SellerSku, "seller_sku", "Артикул продавца", Text, derived = false, ["vendor code", "vendorcode", "артикул поставщика"]),
    spec!(WbSku, "wb_sku", "Артикул WB", Text, derived = false, ["артикул вб", "wb sku"]),
    spec!(NmId, "nm_id", "NM ID", Id, derived = false, ["nmid", "номенклатура", "код номенклатуры"]),
    spec!(Title, "title", "Название", Text, derived = false, ["наименование", "name", "товар"]),
    spec!(Brand, "brand", "Бренд", Text, derived = false, ["торговая марка"]),
    spec!(Category, "category", "Категория", Text, derived = false, ["предмет"]),
    spec!(Barcode, "barcode", "Баркод", Text, derived = false, ["штрихкод", "штрих-код"]),
    spec!(Comments, "comments", "Комментарий", Text, derived = false, ["комментарии", "comment", "примечание"]),
    spec!(IsActive, "is_active", "Активен", Flag, derived = false, ["active", "активный"]),
    spec!(PriceSrc, "price_src", "Цена до скидки", Real, derived = false, ["цена", "price", "розничная цена"]),
    spec!(SellerDiscountPct, "seller_discount_pct", "Скидка продавца, %", Real, derived = false, ["скидка продавца", "скидка, %", "скидка", "discount"]),
    spec!(PriceFinalLiteral, "price_final_literal", "Зафиксированная цена", Real, derived = false, ["фиксированная цена"]),
    spec!(ProductCost, "product_cost", "Себестоимость", Real, derived = false, ["себестоимость товара", "себестоимость, ₽", "cost"]),
    spec!(ShippingCost, "shipping_cost", "Доставка до склада", Real, derived = false, ["доставка", "shipping"]),
    spec!(LogisticsBackCost, "logistics_back_cost", "Обратная логистика", Real, derived = false, ["возвратная логистика", "логистика обратно"]),
    spec!(WarehouseCoeff, "warehouse_coeff", "Коэффициент склада", Real, derived = false, ["коэф. склада", "коэффициент"]),
    spec!(CommissionPct, "commission_pct", "Комиссия, %", Real, derived = false, ["комиссия %", "комиссия мп, %"]),
    spec!(TaxPct, "tax_pct", "Налог, %", Real, derived = false, ["налог %", "ставка налога"]),
    spec!(StockWb, "stock_wb", "Остатки WB", Count, derived = false, ["остаток wb", "остатки вб", "остаток вб"]),
    spec!(StockSeller, "stock_seller", "Остатки продавца", Count, derived = false, ["остаток продавца", "остатки на своём складе"]),
    spec!(TurnoverDays, "turnover_days", "Оборачиваемость, дн", Real, derived = false, ["оборачиваемость"]),
    spec!(WeightKg, "weight_kg", "Вес, кг", Real, derived = false, ["вес"]),
    spec!(PackageLCm, "package_l_cm", "Длина упаковки, см", Real, derived = false, ["длина, см", "длина"]),
    spec!(PackageWCm, "package_w_cm", "Ширина упаковки, см", Real, derived = false, ["ширина, см", "ширина"]),
    spec!(PackageHCm, "package_h_cm", "Высота упаковки, см", Real, derived = false, ["высота, см", "высота"]),
    spec!(VolumeL, "volume_l", "Литраж", Real, derived = false, ["литраж, л", "объём, л", "объем"]),
    spec!(PriceFinal, "price_final", "Итоговая цена", Real, derived = true, ["цена со скидкой", "цена с учётом скидки"]),
    spec!(Commission, "commission", "Комиссия, ₽", Real, derived = true, ["комиссия"]),
    spec!(Tax, "tax", "Налог, ₽", Real, derived = true, ["налог"]),
    spec!(Margin, "margin", "Маржа, ₽", Real, derived = true, ["маржа", "прибыль"]),
    spec!(MarginPercent, "margin_percent", "Маржа, %", Real, derived = true, ["маржинальность"]),
    spec!(StockTotal, "stock_total", "Остатки всего", Count, derived = true, ["всего остатков"]),
    spec!(VolumeComputed, "volume_l_computed", "Литраж (расчёт)", Real, derived = true, []),
];

// -----------------------------------------------------------------------------
// ALIAS TABLE
// -----------------------------------------------------------------------------
struct HeaderTable {
    by_alias: HashMap<String, Field>,
    by_field: HashMap<Field, &'static FieldSpec>,
}

static HEADERS: Lazy<HeaderTable> = Lazy::new(|| {
    let mut by_alias = HashMap::new();
    let mut by_field = HashMap::new();
    for spec in FIELD_SPECS {
        by_field.insert(spec.field, spec);
        let names = [spec.key, spec.header].into_iter().chain(spec.aliases.iter().copied());
        for name in names {
            // first spelling wins; uniqueness is asserted in the tests
            by_alias.entry(normalize_header(name)).or_insert(spec.field);
        }
    }
    HeaderTable { by_alias, by_field }
});

impl Field {
    pub fn spec(&self) -> &'static FieldSpec {
        HEADERS.by_field[self]
    }

    pub fn key(&self) -> &'static str {
        self.spec().key
    }

    pub fn header(&self) -> &'static str {
        self.spec().header
    }

    pub fn is_derived(&self) -> bool {
        self.spec().derived
    }

    /// Every canonical field in export order
    pub fn all() -> impl Iterator<Item = Field> {
        FIELD_SPECS.iter().map(|spec| spec.field)
    }
}

/// Trim, collapse inner whitespace, lowercase, fold ё into е.
///
/// "  Остатки\u{a0}WB " and "остатки wb" normalize to the same string.
pub fn normalize_header(raw: &str) -> String {
    raw.trim_matches('\u{feff}')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .replace('ё', "е")
}

/// Turn an arbitrary header into a custom_data key: lowercase letters and
/// digits, with spaces, dashes and underscores folded into single `_`.
pub fn sanitize_key(raw: &str) -> Option<String> {
    let mut key = String::new();
    for ch in normalize_header(raw).chars() {
        if ch.is_alphanumeric() {
            key.push(ch);
        } else if matches!(ch, ' ' | '-' | '_') && !key.ends_with('_') {
            key.push('_');
        }
    }
    let key = key.trim_matches('_').to_string();
    (!key.is_empty()).then_some(key)
}

/// Canonical field for a spreadsheet header, if any
pub fn lookup(header: &str) -> Option<Field> {
    let normalized = normalize_header(header);
    if let Some(field) = HEADERS.by_alias.get(&normalized) {
        return Some(*field);
    }
    sanitize_key(header).and_then(|key| HEADERS.by_alias.get(&key).copied())
}

/// Resolve a comma-separated list of headers or field keys
/// (e.g. `sku,title,price_final`) into export columns.
pub fn resolve_columns(list: &str) -> Result<Vec<Field>, String> {
    let mut columns = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let field = lookup(name).ok_or_else(|| format!("unknown column '{name}'"))?;
        if !columns.contains(&field) {
            columns.push(field);
        }
    }
    if columns.is_empty() {
        return Err("no export columns selected".into());
    }
    Ok(columns)
}

/// Default export layout: every input field, then every derived snapshot
pub fn default_export_columns() -> Vec<Field> {
    Field::all().collect()
}

/// Field catalog for API consumers building their own spreadsheets
pub fn field_catalog() -> Vec<FieldDescriptor> {
    Field::all()
        .map(|field| FieldDescriptor {
            key: field.key(),
            header: field.header(),
            aliases: field.spec().aliases.to_vec(),
            derived: field.is_derived(),
        })
        .collect()
}

// =============================================================================
// RAW ROWS
// =============================================================================
/// One spreadsheet row as read: (header, cell text) pairs in column order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    pub cells: Vec<(String, String)>,
}

impl<H: Into<String>, V: Into<String>> FromIterator<(H, V)> for RawRow {
    fn from_iter<T: IntoIterator<Item = (H, V)>>(iter: T) -> Self {
        Self {
            cells: iter.into_iter().map(|(h, v)| (h.into(), v.into())).collect(),
        }
    }
}

// =============================================================================
// CELL COERCION
// =============================================================================
/// A coerced cell. `Empty` means the column was present but blank, which
/// unsets the field on update.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Real(f64),
    Integer(i64),
    Flag(bool),
}

impl CellValue {
    fn text(&self) -> Option<String> {
        match self {
            CellValue::Text(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn real(&self) -> Option<f64> {
        match self {
            CellValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    fn integer(&self) -> Option<i64> {
        match self {
            CellValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    fn count(&self) -> Option<i32> {
        self.integer().and_then(|v| i32::try_from(v).ok())
    }

    fn flag(&self) -> Option<bool> {
        match self {
            CellValue::Flag(v) => Some(*v),
            _ => None,
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }
}

/// Accepts "1 234,5", "1234.5", "\u{a0}12 ". Rejects non-finite values.
pub(crate) fn parse_real(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub(crate) fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "да" | "истина" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "нет" | "ложь" | "off" => Some(false),
        _ => None,
    }
}

fn coerce(kind: ValueKind, column: &str, raw: &str) -> Result<CellValue, RowError> {
    let text = raw.trim();
    if text.is_empty() {
        return Ok(CellValue::Empty);
    }
    let fail = || RowError::Coercion {
        column: column.to_string(),
        value: text.to_string(),
        expected: kind.expected(),
    };
    match kind {
        ValueKind::Text => Ok(CellValue::Text(text.to_string())),
        ValueKind::Real => parse_real(text).map(CellValue::Real).ok_or_else(fail),
        ValueKind::Count | ValueKind::Id => {
            let value = parse_real(text).filter(|v| v.fract() == 0.0).ok_or_else(fail)?;
            let fits = match kind {
                ValueKind::Count => (i32::MIN as f64..=i32::MAX as f64).contains(&value),
                _ => value.abs() < 9_007_199_254_740_992.0, // 2^53, exact in f64
            };
            if fits {
                Ok(CellValue::Integer(value as i64))
            } else {
                Err(fail())
            }
        }
        ValueKind::Flag => parse_flag(text).map(CellValue::Flag).ok_or_else(fail),
    }
}

// =============================================================================
// PRODUCT PATCH
// =============================================================================
/// The canonical assignment produced from one import row.
///
/// Only columns present in the file appear in `values`; absent columns leave
/// a stored product untouched when the patch is applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductPatch {
    pub values: BTreeMap<Field, CellValue>,
    /// Unrecognized columns, keyed by sanitized header. Blank cells skipped.
    pub extras: BTreeMap<String, String>,
}

/// Reconcile one raw row into a patch.
///
/// With `known_fields_only` unmatched columns are dropped instead of being
/// kept as custom_data entries.
pub fn reconcile(row: &RawRow, known_fields_only: bool) -> Result<ProductPatch, RowError> {
    let mut patch = ProductPatch::default();
    let mut price_final_cell: Option<(&str, &str)> = None;

    for (header, raw) in &row.cells {
        match lookup(header) {
            Some(Field::PriceFinal) => {
                if !raw.trim().is_empty() {
                    price_final_cell = Some((header.as_str(), raw.as_str()));
                }
            }
            Some(field) if field.is_derived() => {}
            Some(field) => {
                let value = coerce(field.spec().kind, header, raw)?;
                // a blank duplicate column must not wipe a filled one
                let keep_existing = value.is_empty()
                    && patch.values.get(&field).is_some_and(|v| !v.is_empty());
                if !keep_existing {
                    patch.values.insert(field, value);
                }
            }
            None if known_fields_only => {}
            None => {
                if let Some(key) = sanitize_key(header) {
                    let value = raw.trim();
                    if !value.is_empty() {
                        patch.extras.insert(key, value.to_string());
                    }
                }
            }
        }
    }

    // An "already discounted" price counts only when the row has no list
    // price and no explicit literal column.
    let has_price_src = patch.values.get(&Field::PriceSrc).is_some_and(|v| !v.is_empty());
    let has_literal = patch.values.contains_key(&Field::PriceFinalLiteral);
    if let (Some((header, raw)), false, false) = (price_final_cell, has_price_src, has_literal) {
        let value = coerce(ValueKind::Real, header, raw)?;
        patch.values.insert(Field::PriceFinalLiteral, value);
    }

    Ok(patch)
}

/// Patch setting one input field from a single raw value, coerced the same
/// way an import cell is. Derived fields cannot be set.
pub fn single_field_patch(field: Field, raw: &str) -> Result<ProductPatch, RowError> {
    if field.is_derived() {
        return Err(RowError::Validation(format!(
            "'{}' is derived and cannot be set",
            field.key()
        )));
    }
    let value = coerce(field.spec().kind, field.key(), raw)?;
    let mut patch = ProductPatch::default();
    patch.values.insert(field, value);
    Ok(patch)
}

impl ProductPatch {
    /// Upsert key of this row, as text. Fails when the key column is missing,
    /// blank or (for nm_id) not a number.
    pub fn key_value(&self, key: ImportKey) -> Result<String, RowError> {
        match key {
            ImportKey::Sku => self
                .values
                .get(&Field::Sku)
                .and_then(CellValue::text)
                .ok_or_else(|| RowError::Validation("key column 'sku' is empty".into())),
            ImportKey::NmId => self
                .values
                .get(&Field::NmId)
                .and_then(CellValue::integer)
                .map(|nm| nm.to_string())
                .ok_or_else(|| RowError::Validation("key column 'nm_id' is empty".into())),
        }
    }

    /// The row's nm_id, if it carries one
    pub fn nm_id(&self) -> Option<i64> {
        self.values.get(&Field::NmId).and_then(CellValue::integer)
    }

    /// Write the patch onto a product (new or stored).
    pub fn apply(&self, product: &mut Product) {
        for (field, cell) in &self.values {
            match field {
                Field::Sku => product.sku = cell.text().unwrap_or_default(),
                Field::SellerSku => product.seller_sku = cell.text(),
                Field::WbSku => product.wb_sku = cell.text(),
                Field::NmId => product.nm_id = cell.integer(),
                Field::Title => product.title = cell.text().unwrap_or_default(),
                Field::Brand => product.brand = cell.text(),
                Field::Category => product.category = cell.text(),
                Field::Barcode => product.barcode = cell.text(),
                Field::Comments => product.comments = cell.text(),
                Field::IsActive => product.is_active = cell.flag().unwrap_or(true),
                Field::PriceSrc => product.price_src = cell.real(),
                Field::SellerDiscountPct => product.seller_discount_pct = cell.real(),
                Field::PriceFinalLiteral => product.price_final_literal = cell.real(),
                Field::ProductCost => product.product_cost = cell.real(),
                Field::ShippingCost => product.shipping_cost = cell.real(),
                Field::LogisticsBackCost => product.logistics_back_cost = cell.real(),
                Field::WarehouseCoeff => product.warehouse_coeff = cell.real(),
                Field::CommissionPct => product.custom_data.commission_pct = cell.real(),
                Field::TaxPct => product.custom_data.tax_pct = cell.real(),
                Field::StockWb => product.stock_wb = cell.count(),
                Field::StockSeller => product.stock_seller = cell.count(),
                Field::TurnoverDays => product.turnover_days = cell.real(),
                Field::WeightKg => product.weight_kg = cell.real(),
                Field::PackageLCm => product.package_l_cm = cell.real(),
                Field::PackageWCm => product.package_w_cm = cell.real(),
                Field::PackageHCm => product.package_h_cm = cell.real(),
                Field::VolumeL => product.volume_l = cell.real(),
                Field::PriceFinal
                | Field::Commission
                | Field::Tax
                | Field::Margin
                | Field::MarginPercent
                | Field::StockTotal
                | Field::VolumeComputed => {}
            }
        }
        // A new list price supersedes a literal kept from an earlier import,
        // unless this row sets the literal itself.
        let sets_price_src = self.values.get(&Field::PriceSrc).is_some_and(|v| !v.is_empty());
        if sets_price_src && !self.values.contains_key(&Field::PriceFinalLiteral) {
            product.price_final_literal = None;
        }
        for (key, value) in &self.extras {
            product
                .custom_data
                .extra
                .insert(key.clone(), serde_json::Value::String(value.clone()));
        }
    }
}

// =============================================================================
// EXPORT
// =============================================================================
/// A typed export cell; CSV renders it as text, XLSX keeps numbers numeric
#[derive(Debug, Clone, PartialEq)]
pub enum ExportCell {
    Empty,
    Text(String),
    Number(f64),
    Integer(i64),
    Flag(bool),
}

impl ExportCell {
    /// Text form. Numbers use the shortest representation that parses back
    /// to the same f64, so a re-import is exact.
    pub fn to_text(&self) -> String {
        match self {
            ExportCell::Empty => String::new(),
            ExportCell::Text(v) => v.clone(),
            ExportCell::Number(v) => v.to_string(),
            ExportCell::Integer(v) => v.to_string(),
            ExportCell::Flag(true) => "да".to_string(),
            ExportCell::Flag(false) => "нет".to_string(),
        }
    }
}

fn text_cell(value: &Option<String>) -> ExportCell {
    value.clone().map_or(ExportCell::Empty, ExportCell::Text)
}

fn number_cell(value: Option<f64>) -> ExportCell {
    value.map_or(ExportCell::Empty, ExportCell::Number)
}

fn integer_cell<T: Into<i64>>(value: Option<T>) -> ExportCell {
    value.map_or(ExportCell::Empty, |v| ExportCell::Integer(v.into()))
}

/// Cell of one canonical field for one product
pub fn export_cell(field: Field, product: &Product, derived: &DerivedFields) -> ExportCell {
    match field {
        Field::Sku => ExportCell::Text(product.sku.clone()),
        Field::SellerSku => text_cell(&product.seller_sku),
        Field::WbSku => text_cell(&product.wb_sku),
        Field::NmId => integer_cell(product.nm_id),
        Field::Title => ExportCell::Text(product.title.clone()),
        Field::Brand => text_cell(&product.brand),
        Field::Category => text_cell(&product.category),
        Field::Barcode => text_cell(&product.barcode),
        Field::Comments => text_cell(&product.comments),
        Field::IsActive => ExportCell::Flag(product.is_active),
        Field::PriceSrc => number_cell(product.price_src),
        Field::SellerDiscountPct => number_cell(product.seller_discount_pct),
        Field::PriceFinalLiteral => number_cell(product.price_final_literal),
        Field::ProductCost => number_cell(product.product_cost),
        Field::ShippingCost => number_cell(product.shipping_cost),
        Field::LogisticsBackCost => number_cell(product.logistics_back_cost),
        Field::WarehouseCoeff => number_cell(product.warehouse_coeff),
        Field::CommissionPct => number_cell(product.custom_data.commission_pct),
        Field::TaxPct => number_cell(product.custom_data.tax_pct),
        Field::StockWb => integer_cell(product.stock_wb),
        Field::StockSeller => integer_cell(product.stock_seller),
        Field::TurnoverDays => number_cell(product.turnover_days),
        Field::WeightKg => number_cell(product.weight_kg),
        Field::PackageLCm => number_cell(product.package_l_cm),
        Field::PackageWCm => number_cell(product.package_w_cm),
        Field::PackageHCm => number_cell(product.package_h_cm),
        Field::VolumeL => number_cell(product.volume_l),
        Field::PriceFinal => number_cell(derived.price_final),
        Field::Commission => number_cell(derived.commission),
        Field::Tax => number_cell(derived.tax),
        Field::Margin => number_cell(derived.margin),
        Field::MarginPercent => number_cell(derived.margin_percent),
        Field::StockTotal => ExportCell::Integer(derived.stock_total),
        Field::VolumeComputed => number_cell(derived.volume_l),
    }
}

fn extra_cell(value: Option<&serde_json::Value>) -> ExportCell {
    match value {
        None | Some(serde_json::Value::Null) => ExportCell::Empty,
        Some(serde_json::Value::String(s)) => ExportCell::Text(s.clone()),
        Some(other) => ExportCell::Text(other.to_string()),
    }
}

/// Headers plus typed cells, ready for a CSV or XLSX writer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<ExportCell>>,
}

impl ExportTable {
    /// Render products under the chosen canonical columns, followed by one
    /// column per custom_data key found in any of the products.
    #[cfg(test)]
    pub fn build(products: &[Product], columns: &[Field], precedence: PricePrecedence) -> Self {
        let extra_keys: Vec<String> = products
            .iter()
            .flat_map(|p| p.custom_data.extra.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Self::with_extra_keys(products, columns, &extra_keys, precedence)
    }

    /// Render products under the chosen canonical columns, followed by the
    /// given custom_data keys in order. The key itself is the header.
    pub fn with_extra_keys(
        products: &[Product],
        columns: &[Field],
        extra_keys: &[String],
        precedence: PricePrecedence,
    ) -> Self {
        let headers = columns
            .iter()
            .map(|field| field.header().to_string())
            .chain(extra_keys.iter().cloned())
            .collect();

        let rows = products
            .iter()
            .map(|product| {
                let derived = DerivedFields::compute(product, precedence);
                columns
                    .iter()
                    .map(|field| export_cell(*field, product, &derived))
                    .chain(
                        extra_keys
                            .iter()
                            .map(|key| extra_cell(product.custom_data.extra.get(key))),
                    )
                    .collect()
            })
            .collect();

        Self { headers, rows }
    }

    /// Rows as header → text pairs, the shape the importer reads
    #[cfg(test)]
    pub fn to_raw_rows(&self) -> Vec<RawRow> {
        self.rows
            .iter()
            .map(|row| {
                self.headers
                    .iter()
                    .cloned()
                    .zip(row.iter().map(ExportCell::to_text))
                    .collect()
            })
            .collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn row(cells: &[(&str, &str)]) -> RawRow {
        cells.iter().map(|(h, v)| (*h, *v)).collect()
    }

    #[test]
    fn aliases_are_unique_across_fields() {
        let mut seen: HashMap<String, Field> = HashMap::new();
        for spec in FIELD_SPECS {
            let names: HashSet<String> = [spec.key, spec.header]
                .into_iter()
                .chain(spec.aliases.iter().copied())
                .map(normalize_header)
                .collect();
            for name in names {
                if let Some(other) = seen.insert(name.clone(), spec.field) {
                    panic!("alias '{name}' maps to both {other:?} and {:?}", spec.field);
                }
            }
        }
    }

    #[test]
    fn every_field_has_a_spec_and_round_trips_its_header() {
        for field in Field::all() {
            assert_eq!(lookup(field.header()), Some(field));
            assert_eq!(lookup(field.key()), Some(field));
        }
    }

    #[test]
    fn stock_header_is_case_insensitive() {
        assert_eq!(lookup("Остатки WB"), Some(Field::StockWb));
        assert_eq!(lookup("остатки wb"), Some(Field::StockWb));
        assert_eq!(lookup("  ОСТАТКИ \u{a0} wb "), Some(Field::StockWb));
    }

    #[test]
    fn volume_aliases_cover_case_and_yo_spelling() {
        assert_eq!(lookup("Литраж"), Some(Field::VolumeL));
        assert_eq!(lookup("литраж"), Some(Field::VolumeL));
        assert_eq!(lookup("Объём, л"), Some(Field::VolumeL));
        assert_eq!(lookup("объем, л"), Some(Field::VolumeL));
    }

    #[test]
    fn sanitized_headers_fall_back_to_field_keys() {
        assert_eq!(lookup("Stock WB"), Some(Field::StockWb));
        assert_eq!(lookup("price-src"), Some(Field::PriceSrc));
        assert_eq!(lookup("Цвет"), None);
    }

    #[test]
    fn sanitize_key_folds_separators() {
        assert_eq!(sanitize_key("  Цвет  корпуса "), Some("цвет_корпуса".into()));
        assert_eq!(sanitize_key("Size -- EU"), Some("size_eu".into()));
        assert_eq!(sanitize_key("%%%"), None);
    }

    #[test]
    fn stock_only_row_leaves_seller_stock_unset() {
        let patch = reconcile(&row(&[("остатки wb", "12")]), false).unwrap();
        let mut product = Product::new("A-1", "Кружка");
        patch.apply(&mut product);

        assert_eq!(product.stock_wb, Some(12));
        assert_eq!(product.stock_seller, None);
        let derived = DerivedFields::compute(&product, PricePrecedence::Computed);
        assert_eq!(derived.stock_total, 12);
    }

    #[test]
    fn numbers_accept_comma_decimals_and_spaces() {
        let patch = reconcile(
            &row(&[("Цена до скидки", "1 234,50"), ("Остатки WB", "7.0")]),
            false,
        )
        .unwrap();
        let mut product = Product::new("A-1", "Кружка");
        patch.apply(&mut product);
        assert_eq!(product.price_src, Some(1234.5));
        assert_eq!(product.stock_wb, Some(7));
    }

    #[test]
    fn non_numeric_price_is_a_coercion_error() {
        let err = reconcile(&row(&[("Цена до скидки", "дорого")]), false).unwrap_err();
        assert_eq!(
            err,
            RowError::Coercion {
                column: "Цена до скидки".into(),
                value: "дорого".into(),
                expected: "a number",
            }
        );
    }

    #[test]
    fn fractional_stock_is_rejected() {
        assert!(matches!(
            reconcile(&row(&[("Остатки WB", "1.5")]), false),
            Err(RowError::Coercion { .. })
        ));
        assert!(matches!(
            reconcile(&row(&[("Остатки WB", "99999999999")]), false),
            Err(RowError::Coercion { .. })
        ));
    }

    #[test]
    fn flags_accept_russian_and_english_words() {
        for (raw, expected) in [("да", true), ("Нет", false), ("TRUE", true), ("0", false)] {
            let patch = reconcile(&row(&[("Активен", raw)]), false).unwrap();
            let mut product = Product::new("A-1", "Кружка");
            product.is_active = !expected;
            patch.apply(&mut product);
            assert_eq!(product.is_active, expected, "{raw}");
        }
        assert!(reconcile(&row(&[("Активен", "может быть")]), false).is_err());
    }

    #[test]
    fn unmatched_columns_become_custom_data_unless_restricted() {
        let raw = row(&[("Артикул", "A-1"), ("Цвет корпуса", "синий"), ("Пусто", "  ")]);

        let patch = reconcile(&raw, false).unwrap();
        assert_eq!(patch.extras.get("цвет_корпуса"), Some(&"синий".to_string()));
        assert!(!patch.extras.contains_key("пусто"));

        let restricted = reconcile(&raw, true).unwrap();
        assert!(restricted.extras.is_empty());
    }

    #[test]
    fn rate_columns_land_in_recognized_custom_slots() {
        let patch = reconcile(&row(&[("Комиссия, %", "15"), ("Налог, %", "6")]), false).unwrap();
        let mut product = Product::new("A-1", "Кружка");
        patch.apply(&mut product);
        assert_eq!(product.custom_data.commission_pct, Some(15.0));
        assert_eq!(product.custom_data.tax_pct, Some(6.0));
        assert!(product.custom_data.extra.is_empty());
    }

    #[test]
    fn derived_columns_are_ignored_on_import() {
        let patch = reconcile(
            &row(&[("Маржа, ₽", "not even a number"), ("Остатки всего", "100")]),
            false,
        )
        .unwrap();
        assert!(patch.values.is_empty());
        assert!(patch.extras.is_empty());
    }

    #[test]
    fn final_price_without_list_price_is_kept_as_literal() {
        let patch = reconcile(&row(&[("Итоговая цена", "799,90")]), false).unwrap();
        assert_eq!(patch.values.get(&Field::PriceFinalLiteral), Some(&CellValue::Real(799.9)));

        let with_list_price = reconcile(
            &row(&[("Цена до скидки", "1000"), ("Итоговая цена", "800")]),
            false,
        )
        .unwrap();
        assert!(!with_list_price.values.contains_key(&Field::PriceFinalLiteral));
    }

    #[test]
    fn blank_duplicate_column_does_not_wipe_filled_one() {
        let patch = reconcile(&row(&[("Литраж", "2,5"), ("литраж", "")]), false).unwrap();
        assert_eq!(patch.values.get(&Field::VolumeL), Some(&CellValue::Real(2.5)));
    }

    #[test]
    fn absent_columns_leave_stored_values_and_blank_columns_unset_them() {
        let mut product = Product::new("A-1", "Кружка");
        product.brand = Some("Acme".into());
        product.product_cost = Some(100.0);

        let patch = reconcile(&row(&[("Себестоимость", "")]), false).unwrap();
        patch.apply(&mut product);

        assert_eq!(product.brand.as_deref(), Some("Acme"));
        assert_eq!(product.product_cost, None);
    }

    #[test]
    fn key_value_requires_the_chosen_key() {
        let patch = reconcile(&row(&[("Артикул", " A-1 "), ("NM ID", "")]), false).unwrap();
        assert_eq!(patch.key_value(ImportKey::Sku).unwrap(), "A-1");
        assert!(matches!(patch.key_value(ImportKey::NmId), Err(RowError::Validation(_))));

        let by_nm = reconcile(&row(&[("nmId", "123456")]), false).unwrap();
        assert_eq!(by_nm.key_value(ImportKey::NmId).unwrap(), "123456");
    }

    #[test]
    fn resolve_columns_accepts_keys_and_headers() {
        let columns = resolve_columns("sku, Название ,price_final,sku").unwrap();
        assert_eq!(columns, vec![Field::Sku, Field::Title, Field::PriceFinal]);
        assert!(resolve_columns("sku,warp_drive").is_err());
        assert!(resolve_columns(" , ").is_err());
    }

    fn full_product() -> Product {
        let mut product = Product::new("WB-1001", "Термокружка 450 мл");
        product.seller_sku = Some("TK-450".into());
        product.wb_sku = Some("WB-TK-450".into());
        product.nm_id = Some(987654321);
        product.brand = Some("Acme".into());
        product.category = Some("Посуда".into());
        product.barcode = Some("4600000000017".into());
        product.comments = Some("хит, продаж".into());
        product.is_active = false;
        product.price_src = Some(1299.99);
        product.seller_discount_pct = Some(17.5);
        product.product_cost = Some(412.3);
        product.shipping_cost = Some(50.0);
        product.logistics_back_cost = Some(33.3);
        product.warehouse_coeff = Some(1.15);
        product.custom_data.commission_pct = Some(19.5);
        product.custom_data.tax_pct = Some(6.0);
        product
            .custom_data
            .extra
            .insert("цвет".into(), serde_json::json!("синий"));
        product.stock_wb = Some(40);
        product.stock_seller = Some(-2);
        product.turnover_days = Some(12.5);
        product.weight_kg = Some(0.45);
        product.package_l_cm = Some(21.0);
        product.package_w_cm = Some(9.5);
        product.package_h_cm = Some(9.5);
        product
    }

    #[test]
    fn export_then_reimport_reproduces_inputs_and_derived_values() {
        let original = full_product();
        let table = ExportTable::build(
            std::slice::from_ref(&original),
            &default_export_columns(),
            PricePrecedence::Computed,
        );
        let raw = &table.to_raw_rows()[0];

        let patch = reconcile(raw, false).unwrap();
        let mut reimported = Product::new("", "");
        reimported.id = original.id;
        reimported.created_at = original.created_at;
        reimported.updated_at = original.updated_at;
        patch.apply(&mut reimported);

        assert_eq!(reimported, original);
        assert_eq!(
            DerivedFields::compute(&reimported, PricePrecedence::Computed),
            DerivedFields::compute(&original, PricePrecedence::Computed)
        );
    }

    #[test]
    fn literal_only_product_survives_round_trip() {
        let mut original = Product::new("OZ-7", "Плед");
        original.price_final_literal = Some(1490.0);
        let table = ExportTable::build(
            std::slice::from_ref(&original),
            &[Field::Sku, Field::Title, Field::PriceSrc, Field::PriceFinal],
            PricePrecedence::Computed,
        );
        let raw = &table.to_raw_rows()[0];
        assert_eq!(raw.cells[3], ("Итоговая цена".to_string(), "1490".to_string()));

        let mut reimported = Product::new("", "");
        reconcile(raw, false).unwrap().apply(&mut reimported);
        assert_eq!(reimported.price_final_literal, Some(1490.0));
        assert_eq!(reimported.price_src, None);
    }

    #[test]
    fn export_renders_unset_derived_fields_as_blank_cells() {
        let product = Product::new("A-1", "Кружка");
        let table = ExportTable::build(
            &[product],
            &[Field::Sku, Field::Margin, Field::MarginPercent, Field::StockTotal],
            PricePrecedence::Computed,
        );
        assert_eq!(table.headers, vec!["Артикул", "Маржа, ₽", "Маржа, %", "Остатки всего"]);
        assert_eq!(
            table.rows[0],
            vec![
                ExportCell::Text("A-1".into()),
                ExportCell::Empty,
                ExportCell::Empty,
                ExportCell::Integer(0)
            ]
        );
    }

    #[test]
    fn export_adds_union_of_custom_keys() {
        let mut first = Product::new("A-1", "Кружка");
        first.custom_data.extra.insert("цвет".into(), serde_json::json!("синий"));
        let mut second = Product::new("A-2", "Плед");
        second.custom_data.extra.insert("размер".into(), serde_json::json!(42));

        let table = ExportTable::build(&[first, second], &[Field::Sku], PricePrecedence::Computed);
        assert_eq!(table.headers, vec!["Артикул", "размер", "цвет"]);
        assert_eq!(table.rows[0][1], ExportCell::Empty);
        assert_eq!(table.rows[0][2], ExportCell::Text("синий".into()));
        assert_eq!(table.rows[1][1], ExportCell::Text("42".into()));
    }

    #[test]
    fn new_list_price_clears_a_literal_from_an_earlier_import() {
        let mut product = Product::new("OZ-7", "Плед");
        reconcile(&row(&[("Итоговая цена", "1800")]), false)
            .unwrap()
            .apply(&mut product);
        assert_eq!(product.price_final_literal, Some(1800.0));

        reconcile(&row(&[("Цена до скидки", "1000"), ("Скидка продавца, %", "10")]), false)
            .unwrap()
            .apply(&mut product);
        assert_eq!(product.price_final_literal, None);
        let literal_first = DerivedFields::compute(&product, PricePrecedence::Literal);
        assert_eq!(literal_first.price_final, Some(900.0));

        // a row carrying both keeps the literal it sets
        reconcile(
            &row(&[("Цена до скидки", "1000"), ("Зафиксированная цена", "850")]),
            false,
        )
        .unwrap()
        .apply(&mut product);
        assert_eq!(product.price_final_literal, Some(850.0));
    }

    #[test]
    fn single_field_patch_coerces_like_an_import_cell() {
        let mut product = Product::new("A-1", "Кружка");
        single_field_patch(Field::StockWb, "1 200").unwrap().apply(&mut product);
        assert_eq!(product.stock_wb, Some(1200));

        assert!(matches!(
            single_field_patch(Field::PriceSrc, "дорого"),
            Err(RowError::Coercion { .. })
        ));
        assert!(matches!(
            single_field_patch(Field::Margin, "10"),
            Err(RowError::Validation(_))
        ));
    }

    #[test]
    fn explicit_extra_keys_fix_the_custom_column_order() {
        let mut product = Product::new("A-1", "Кружка");
        product.custom_data.extra.insert("цвет".into(), serde_json::json!("синий"));
        product.custom_data.extra.insert("скрытое".into(), serde_json::json!("x"));

        let table = ExportTable::with_extra_keys(
            &[product],
            &[Field::Sku],
            &["размер".to_string(), "цвет".to_string()],
            PricePrecedence::Computed,
        );
        assert_eq!(table.headers, vec!["Артикул", "размер", "цвет"]);
        assert_eq!(table.rows[0][1], ExportCell::Empty);
        assert_eq!(table.rows[0][2], ExportCell::Text("синий".into()));
    }
}
