// =============================================================================
// IMPORT MODULE
// =============================================================================
// Bulk load of spreadsheet rows into the catalog.
//
// FLOW (per batch):
// 1. For every row: reconcile headers → read key → look up stored product →
//    merge → normalize defined custom fields → validate. A failing row is
//    rejected and the batch moves on.
// 2. Duplicate keys: the last valid row wins; each replaced earlier row is
//    logged as "overwritten". An invalid row never replaces a valid one.
// 3. Upsert the surviving rows. A storage error rejects that row only; the
//    rejection names the earlier rows it had replaced.
// 4. Append exactly one import log entry and return it.
//
// ROW NUMBERS:
// Reported numbers match the spreadsheet: the header is row 1, the first
// data row is row 2.
// =============================================================================

use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::Utc;
use csv::{ReaderBuilder, StringRecordsIntoIter};
use uuid::Uuid;

use crate::custom_fields::conform_product;
use crate::db::CatalogRepository;
use crate::error::RowError;
use crate::mapper::{lookup, reconcile, RawRow};
use crate::metrics;
use crate::models::{
    CustomFieldDefinition, ImportKey, ImportLog, ImportStatus, IssueKind, Product, RowIssue,
};

// =============================================================================
// OPTIONS & OUTCOME
// =============================================================================

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Uploaded file name, recorded in the log
    pub file_name: String,
    /// Field rows are upserted by
    pub key: ImportKey,
    /// Drop unrecognized columns instead of keeping them as custom_data
    pub known_fields_only: bool,
}

#[derive(Debug, Clone)]
pub struct ImportOutcome {
    /// The stored log entry
    pub log: ImportLog,
    /// SKUs whose stored inputs changed (cache invalidation)
    pub touched: Vec<String>,
}

/// A validated row waiting to be persisted
struct Pending {
    row: u32,
    product: Product,
    /// SKU before this import, when the product already existed
    previous_sku: Option<String>,
    /// Earlier rows with the same key that this row replaced
    replaced: Vec<u32>,
}

fn spreadsheet_row(idx: usize) -> u32 {
    u32::try_from(idx + 2).unwrap_or(u32::MAX)
}

fn is_blank(row: &RawRow) -> bool {
    row.cells.iter().all(|(_, value)| value.trim().is_empty())
}

fn row_list(rows: &[u32]) -> String {
    rows.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")
}

// =============================================================================
// PIPELINE
// =============================================================================

/// Run one import batch against `repo`.
///
/// # Arguments
/// * `repo` - Catalog storage
/// * `rows` - Raw rows in file order; `Err` is a row the reader could not decode
/// * `options` - Key field, file name and unknown-column policy
///
/// # Returns
/// * `Ok(ImportOutcome)` - The appended import log plus the touched SKUs.
///   Row failures never surface here; they are issues inside the log
/// * `Err` - Custom field definitions could not be loaded, or the import log
///   itself could not be written
///
/// # Example
/// ```
/// let rows = read_csv_rows(&bytes)?;
/// let outcome = import_rows(&db, rows, &options).await?;
/// println!("{} rows rejected", outcome.log.rejected);
/// ```
pub async fn import_rows<R, I>(repo: &R, rows: I, options: &ImportOptions) -> Result<ImportOutcome>
where
    R: CatalogRepository + ?Sized,
    I: IntoIterator<Item = std::result::Result<RawRow, String>>,
{
    let mut issues: Vec<RowIssue> = Vec::new();
    let mut pending: Vec<Option<Pending>> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();
    let mut rows_read: i32 = 0;
    let mut rejected: i32 = 0;

    let definitions = repo
        .list_custom_fields()
        .await
        .context("Failed to load custom field definitions")?;

    let mut reject = |issues: &mut Vec<RowIssue>, row: u32, err: RowError| {
        tracing::debug!(row, reason = %err, "Import row rejected");
        issues.push(RowIssue { row, kind: IssueKind::Rejected, message: err.to_string() });
        rejected += 1;
    };

    // -------------------------------------------------------------------------
    // PHASE 1: reconcile, merge, validate, dedupe
    // -------------------------------------------------------------------------
    for (idx, raw) in rows.into_iter().enumerate() {
        let row = spreadsheet_row(idx);
        let raw = match raw {
            Ok(raw) if is_blank(&raw) => continue,
            Ok(raw) => raw,
            Err(msg) => {
                rows_read += 1;
                reject(&mut issues, row, RowError::Unreadable(msg));
                continue;
            }
        };
        rows_read += 1;

        let prepared = prepare_row(repo, &raw, options, &definitions).await;
        let (key, candidate) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                reject(&mut issues, row, err);
                continue;
            }
        };

        let mut candidate = Pending { row, ..candidate };
        match by_key.get(&key) {
            Some(&slot) => {
                if let Some(earlier) = pending[slot].take() {
                    issues.push(RowIssue {
                        row: earlier.row,
                        kind: IssueKind::Overwritten,
                        message: format!(
                            "{} '{}' appears again in row {row}; the later row wins",
                            options.key.as_str(),
                            key
                        ),
                    });
                    candidate.replaced = earlier.replaced;
                    candidate.replaced.push(earlier.row);
                }
                pending[slot] = Some(candidate);
            }
            None => {
                by_key.insert(key, pending.len());
                pending.push(Some(candidate));
            }
        }
    }

    // -------------------------------------------------------------------------
    // PHASE 2: persist
    // -------------------------------------------------------------------------
    let mut inserted: i32 = 0;
    let mut updated: i32 = 0;
    let mut touched: Vec<String> = Vec::new();

    for Pending { row, product, previous_sku, replaced } in pending.into_iter().flatten() {
        match repo.upsert(&product).await {
            Ok(saved) => {
                if let Some(previous) = previous_sku {
                    updated += 1;
                    if previous != saved.sku {
                        touched.push(previous);
                    }
                } else {
                    inserted += 1;
                }
                touched.push(saved.sku);
            }
            Err(err) => {
                let mut reason = format!("{err:#}");
                if !replaced.is_empty() {
                    reason.push_str(&format!(
                        "; earlier rows {} with the same key were not saved either",
                        row_list(&replaced)
                    ));
                }
                reject(&mut issues, row, RowError::Storage(reason));
            }
        }
    }

    // -------------------------------------------------------------------------
    // PHASE 3: log
    // -------------------------------------------------------------------------
    let status = if inserted + updated == 0 {
        ImportStatus::Failed
    } else if rejected > 0 {
        ImportStatus::Partial
    } else {
        ImportStatus::Success
    };

    issues.sort_by_key(|issue| issue.row);
    let overwritten = issues
        .iter()
        .filter(|issue| issue.kind == IssueKind::Overwritten)
        .count();

    let log = ImportLog {
        id: Uuid::new_v4(),
        file_name: options.file_name.clone(),
        key_field: options.key,
        status,
        rows_read,
        inserted,
        updated,
        rejected,
        issues,
        created_at: Utc::now(),
    };
    let log = repo
        .append_import_log(&log)
        .await
        .context("Failed to record import log")?;

    metrics::record_import_rows("inserted", inserted as u64);
    metrics::record_import_rows("updated", updated as u64);
    metrics::record_import_rows("rejected", rejected as u64);
    metrics::record_import_rows("overwritten", overwritten as u64);
    metrics::record_import_batch(status.as_str());

    tracing::info!(
        file = %log.file_name,
        key = log.key_field.as_str(),
        status = %log.status,
        rows_read,
        inserted,
        updated,
        rejected,
        overwritten,
        "Import finished"
    );

    Ok(ImportOutcome { log, touched })
}

/// Reconcile one row and merge it onto the stored product, if any.
/// Returns the key value and a validated candidate.
async fn prepare_row<R>(
    repo: &R,
    raw: &RawRow,
    options: &ImportOptions,
    definitions: &[CustomFieldDefinition],
) -> std::result::Result<(String, Pending), RowError>
where
    R: CatalogRepository + ?Sized,
{
    let patch = reconcile(raw, options.known_fields_only)?;
    let key = patch.key_value(options.key)?;

    let existing = match options.key {
        ImportKey::Sku => repo.get(&key).await,
        ImportKey::NmId => match patch.nm_id() {
            Some(nm_id) => repo.find_by_nm_id(nm_id).await,
            None => Ok(None),
        },
    }
    .map_err(|err| RowError::Storage(format!("{err:#}")))?;

    let previous_sku = existing.as_ref().map(|p| p.sku.clone());
    let mut product = existing.unwrap_or_else(|| Product::new("", ""));
    patch.apply(&mut product);
    conform_product(&mut product, definitions, previous_sku.is_none())?;
    product.validate()?;

    Ok((key, Pending { row: 0, product, previous_sku, replaced: Vec::new() }))
}

// =============================================================================
// CSV READER
// =============================================================================

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Header cells of `line` when split on `delimiter`, quoting respected
fn split_header(line: &[u8], delimiter: u8) -> Vec<String> {
    ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .from_reader(line)
        .records()
        .next()
        .and_then(|record| record.ok())
        .map(|record| record.iter().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Pick `;` or `,` by which split of the header line yields more known
/// columns. Headers such as "Вес, кг" hold a comma, so a plain character
/// count misleads. With no difference, `;` wins when it splits the line
/// into more cells.
fn detect_delimiter(bytes: &[u8]) -> u8 {
    let header_line = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    let semicolon = split_header(header_line, b';');
    let comma = split_header(header_line, b',');
    let known = |cells: &[String]| cells.iter().filter(|cell| lookup(cell).is_some()).count();

    match known(&semicolon).cmp(&known(&comma)) {
        Ordering::Greater => b';',
        Ordering::Less => b',',
        Ordering::Equal if semicolon.len() > comma.len() => b';',
        Ordering::Equal => b',',
    }
}

/// Lazy sequence of raw rows from an uploaded CSV file
pub struct CsvRows<'a> {
    headers: Vec<String>,
    records: StringRecordsIntoIter<&'a [u8]>,
}

impl Iterator for CsvRows<'_> {
    type Item = std::result::Result<RawRow, String>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        Some(
            record
                .map(|record| {
                    self.headers
                        .iter()
                        .zip(record.iter())
                        .map(|(header, value)| (header.clone(), value.to_string()))
                        .collect::<RawRow>()
                })
                .map_err(|err| err.to_string()),
        )
    }
}

/// Open an uploaded CSV file: UTF-8 with optional BOM, `,` or `;` separated,
/// first line is the header. Short rows are allowed; their missing trailing
/// columns count as absent.
pub fn read_csv_rows(bytes: &[u8]) -> Result<CsvRows<'_>> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .delimiter(detect_delimiter(bytes))
        .from_reader(bytes);

    let headers = reader
        .headers()
        .context("Failed to read CSV header row")?
        .iter()
        .map(str::to_string)
        .collect();

    Ok(CsvRows { headers, records: reader.into_records() })
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::{DerivedFields, PricePrecedence};
    use crate::db::memory::MemoryCatalog;
    use crate::export::write_csv;
    use crate::mapper::{default_export_columns, ExportTable};

    fn options(key: ImportKey) -> ImportOptions {
        ImportOptions { file_name: "products.csv".into(), key, known_fields_only: false }
    }

    fn row(cells: &[(&str, &str)]) -> std::result::Result<RawRow, String> {
        Ok(cells.iter().map(|(h, v)| (*h, *v)).collect())
    }

    #[tokio::test]
    async fn one_invalid_row_makes_the_batch_partial() {
        let repo = MemoryCatalog::default();
        let rows = vec![
            row(&[("Артикул", "A-1"), ("Название", "Кружка"), ("Цена до скидки", "100")]),
            row(&[("Артикул", "A-2"), ("Название", "Плед"), ("Цена до скидки", "дорого")]),
            row(&[("Артикул", "A-3"), ("Название", "Лампа"), ("Цена до скидки", "300")]),
        ];

        let outcome = import_rows(&repo, rows, &options(ImportKey::Sku)).await.unwrap();
        let log = outcome.log;

        assert_eq!(log.status, ImportStatus::Partial);
        assert_eq!(log.rows_read, 3);
        assert_eq!(log.inserted, 2);
        assert_eq!(log.rejected, 1);
        assert_eq!(log.issues.len(), 1);
        assert_eq!(log.issues[0].row, 3);
        assert_eq!(log.issues[0].kind, IssueKind::Rejected);
        assert!(log.issues[0].message.contains("'дорого' is not a number"));
        assert_eq!(repo.products().len(), 2);
        assert_eq!(repo.logs().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_sku_keeps_the_last_row_and_logs_the_earlier() {
        let repo = MemoryCatalog::default();
        let rows = vec![
            row(&[("Артикул", "A-1"), ("Название", "Первая"), ("Остатки WB", "1")]),
            row(&[("Артикул", "A-2"), ("Название", "Другая")]),
            row(&[("Артикул", "A-1"), ("Название", "Вторая"), ("Остатки WB", "2")]),
        ];

        let log = import_rows(&repo, rows, &options(ImportKey::Sku)).await.unwrap().log;

        assert_eq!(log.status, ImportStatus::Success);
        assert_eq!(log.inserted, 2);
        assert_eq!(log.rejected, 0);
        assert_eq!(log.issues.len(), 1);
        assert_eq!(log.issues[0].row, 2);
        assert_eq!(log.issues[0].kind, IssueKind::Overwritten);

        let stored = repo.get("A-1").await.unwrap().unwrap();
        assert_eq!(stored.title, "Вторая");
        assert_eq!(stored.stock_wb, Some(2));
    }

    #[tokio::test]
    async fn invalid_duplicate_does_not_replace_a_valid_row() {
        let repo = MemoryCatalog::default();
        let rows = vec![
            row(&[("Артикул", "A-1"), ("Название", "Кружка"), ("Скидка продавца, %", "10")]),
            row(&[("Артикул", "A-1"), ("Название", "Кружка"), ("Скидка продавца, %", "120")]),
        ];

        let log = import_rows(&repo, rows, &options(ImportKey::Sku)).await.unwrap().log;

        assert_eq!(log.status, ImportStatus::Partial);
        assert_eq!(log.issues.len(), 1);
        assert_eq!(log.issues[0].row, 3);
        assert_eq!(log.issues[0].kind, IssueKind::Rejected);
        assert!(log.issues[0].message.contains("seller_discount_pct"));
        let stored = repo.get("A-1").await.unwrap().unwrap();
        assert_eq!(stored.seller_discount_pct, Some(10.0));
    }

    #[tokio::test]
    async fn reimport_updates_present_columns_and_merges_extras() {
        let mut existing = Product::new("A-1", "Кружка");
        existing.brand = Some("Acme".into());
        existing.product_cost = Some(100.0);
        existing.custom_data.extra.insert("цвет".into(), serde_json::json!("синий"));
        let repo = MemoryCatalog::with_products(vec![existing.clone()]);

        let rows = vec![row(&[
            ("Артикул", "A-1"),
            ("Себестоимость", ""),
            ("Остатки WB", "12"),
            ("Материал", "сталь"),
        ])];
        let outcome = import_rows(&repo, rows, &options(ImportKey::Sku)).await.unwrap();

        assert_eq!(outcome.log.updated, 1);
        assert_eq!(outcome.touched, vec!["A-1".to_string()]);
        let stored = repo.get("A-1").await.unwrap().unwrap();
        assert_eq!(stored.id, existing.id);
        assert_eq!(stored.title, "Кружка");
        assert_eq!(stored.brand.as_deref(), Some("Acme"));
        assert_eq!(stored.product_cost, None);
        assert_eq!(stored.stock_wb, Some(12));
        assert_eq!(stored.stock_seller, None);
        assert_eq!(stored.custom_data.extra.get("цвет"), Some(&serde_json::json!("синий")));
        assert_eq!(stored.custom_data.extra.get("материал"), Some(&serde_json::json!("сталь")));
    }

    #[tokio::test]
    async fn nm_id_key_finds_the_stored_product() {
        let mut existing = Product::new("A-1", "Кружка");
        existing.nm_id = Some(555);
        let repo = MemoryCatalog::with_products(vec![existing]);

        let rows = vec![
            row(&[("NM ID", "555"), ("Цена до скидки", "990")]),
            row(&[("NM ID", "777"), ("Цена до скидки", "100")]),
        ];
        let log = import_rows(&repo, rows, &options(ImportKey::NmId)).await.unwrap().log;

        assert_eq!(log.key_field, ImportKey::NmId);
        assert_eq!(log.updated, 1);
        assert_eq!(log.rejected, 1);
        assert!(log.issues[0].message.contains("'sku' is empty"));
        assert_eq!(repo.get("A-1").await.unwrap().unwrap().price_src, Some(990.0));
    }

    #[tokio::test]
    async fn missing_key_column_rejects_the_row() {
        let repo = MemoryCatalog::default();
        let rows = vec![row(&[("Название", "Кружка")])];
        let log = import_rows(&repo, rows, &options(ImportKey::Sku)).await.unwrap().log;
        assert_eq!(log.status, ImportStatus::Failed);
        assert!(log.issues[0].message.contains("key column 'sku' is empty"));
    }

    #[tokio::test]
    async fn empty_file_is_a_failed_batch_with_a_log() {
        let repo = MemoryCatalog::default();
        let rows: Vec<std::result::Result<RawRow, String>> = Vec::new();
        let log = import_rows(&repo, rows, &options(ImportKey::Sku)).await.unwrap().log;

        assert_eq!(log.status, ImportStatus::Failed);
        assert_eq!(log.rows_read, 0);
        assert_eq!(repo.logs().len(), 1);
    }

    #[tokio::test]
    async fn storage_error_rejects_only_that_row() {
        let repo = MemoryCatalog::failing_on("A-2");
        let rows = vec![
            row(&[("Артикул", "A-1"), ("Название", "Кружка")]),
            row(&[("Артикул", "A-2"), ("Название", "Плед")]),
        ];
        let log = import_rows(&repo, rows, &options(ImportKey::Sku)).await.unwrap().log;

        assert_eq!(log.status, ImportStatus::Partial);
        assert_eq!(log.inserted, 1);
        assert_eq!(log.issues[0].row, 3);
        assert!(log.issues[0].message.starts_with("could not be saved"));
    }

    #[tokio::test]
    async fn unreadable_and_blank_rows() {
        let repo = MemoryCatalog::default();
        let rows = vec![
            row(&[("Артикул", "A-1"), ("Название", "Кружка")]),
            Err("invalid UTF-8 in field 2".to_string()),
            row(&[("Артикул", " "), ("Название", "")]),
        ];
        let log = import_rows(&repo, rows, &options(ImportKey::Sku)).await.unwrap().log;

        assert_eq!(log.rows_read, 2);
        assert_eq!(log.rejected, 1);
        assert_eq!(log.issues[0].row, 3);
        assert!(log.issues[0].message.starts_with("unreadable row"));
    }

    #[test]
    fn csv_reader_strips_bom_and_detects_semicolons() {
        let bytes = "\u{feff}Артикул;Название;Скидка продавца, %\nA-1;Кружка;10,5\nA-2;Плед\n";
        let rows: Vec<_> = read_csv_rows(bytes.as_bytes()).unwrap().collect();

        assert_eq!(rows.len(), 2);
        let first = rows[0].as_ref().unwrap();
        assert_eq!(first.cells[0], ("Артикул".to_string(), "A-1".to_string()));
        assert_eq!(first.cells[2].1, "10,5");
        // short row: the missing column is absent, not blank
        assert_eq!(rows[1].as_ref().unwrap().cells.len(), 2);
    }

    #[test]
    fn csv_reader_reports_undecodable_rows() {
        let mut bytes = b"sku,title\nA-1,ok\nA-2,".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe]);
        bytes.push(b'\n');
        let rows: Vec<_> = read_csv_rows(&bytes).unwrap().collect();
        assert!(rows[0].is_ok());
        assert!(rows[1].is_err());
    }

    #[tokio::test]
    async fn export_then_reimport_reproduces_inputs() {
        let mut product = Product::new("WB-1001", "Термокружка, 450 мл");
        product.nm_id = Some(123456789);
        product.price_src = Some(1299.99);
        product.seller_discount_pct = Some(17.5);
        product.product_cost = Some(412.3);
        product.shipping_cost = Some(50.0);
        product.custom_data.commission_pct = Some(19.5);
        product.custom_data.tax_pct = Some(6.0);
        product.custom_data.extra.insert("цвет".into(), serde_json::json!("синий"));
        product.stock_wb = Some(40);
        product.package_l_cm = Some(21.0);
        product.package_w_cm = Some(9.5);
        product.package_h_cm = Some(9.5);
        product.comments = Some("строка \"в кавычках\"".into());

        let table = ExportTable::build(
            std::slice::from_ref(&product),
            &default_export_columns(),
            PricePrecedence::Computed,
        );
        let csv_bytes = write_csv(&table).unwrap();

        // re-import into an empty catalog under the same key
        let repo = MemoryCatalog::default();
        let rows = read_csv_rows(&csv_bytes).unwrap();
        let log = import_rows(&repo, rows, &options(ImportKey::Sku)).await.unwrap().log;
        assert_eq!(log.status, ImportStatus::Success);

        let mut reimported = repo.get("WB-1001").await.unwrap().unwrap();
        reimported.id = product.id;
        reimported.created_at = product.created_at;
        reimported.updated_at = product.updated_at;
        assert_eq!(reimported, product);
        assert_eq!(
            DerivedFields::compute(&reimported, PricePrecedence::Computed),
            DerivedFields::compute(&product, PricePrecedence::Computed)
        );
    }

    #[test]
    fn delimiter_detection_uses_the_header_line() {
        assert_eq!(detect_delimiter(b"a;b;c\n1,2;3;4"), b';');
        assert_eq!(detect_delimiter(b"a,b,c\n1;2;3"), b',');
        assert_eq!(detect_delimiter(b""), b',');
    }

    #[test]
    fn delimiter_detection_sees_commas_inside_headers() {
        // one semicolon, one comma: the comma belongs to "Вес, кг"
        assert_eq!(detect_delimiter("Артикул;Вес, кг\nA-1;0,5".as_bytes()), b';');
        assert_eq!(
            detect_delimiter("Артикул,\"Вес, кг\",Название\nA-1,\"0,5\",Кружка".as_bytes()),
            b','
        );
    }

    #[tokio::test]
    async fn semicolon_file_with_comma_header_imports() {
        let bytes = "Артикул;Вес, кг;Название\nA-1;0,5;Кружка\n";
        let repo = MemoryCatalog::default();
        let rows = read_csv_rows(bytes.as_bytes()).unwrap();
        let log = import_rows(&repo, rows, &options(ImportKey::Sku)).await.unwrap().log;

        assert_eq!(log.status, ImportStatus::Success);
        let stored = repo.get("A-1").await.unwrap().unwrap();
        assert_eq!(stored.weight_kg, Some(0.5));
        assert_eq!(stored.title, "Кружка");
    }

    #[tokio::test]
    async fn list_price_import_replaces_an_earlier_literal() {
        let repo = MemoryCatalog::default();
        let first = vec![row(&[
            ("Артикул", "OZ-7"),
            ("Название", "Плед"),
            ("Итоговая цена", "1800"),
        ])];
        import_rows(&repo, first, &options(ImportKey::Sku)).await.unwrap();
        assert_eq!(repo.get("OZ-7").await.unwrap().unwrap().price_final_literal, Some(1800.0));

        let second = vec![row(&[
            ("Артикул", "OZ-7"),
            ("Цена до скидки", "1000"),
            ("Скидка продавца, %", "10"),
        ])];
        import_rows(&repo, second, &options(ImportKey::Sku)).await.unwrap();

        let stored = repo.get("OZ-7").await.unwrap().unwrap();
        assert_eq!(stored.price_final_literal, None);
        let derived = DerivedFields::compute(&stored, PricePrecedence::Literal);
        assert_eq!(derived.price_final, Some(900.0));
    }

    #[tokio::test]
    async fn storage_failure_of_a_duplicate_names_the_replaced_rows() {
        let repo = MemoryCatalog::failing_on("A-1");
        let rows = vec![
            row(&[("Артикул", "A-1"), ("Название", "Первая")]),
            row(&[("Артикул", "A-2"), ("Название", "Другая")]),
            row(&[("Артикул", "A-1"), ("Название", "Вторая")]),
            row(&[("Артикул", "A-1"), ("Название", "Третья")]),
        ];
        let log = import_rows(&repo, rows, &options(ImportKey::Sku)).await.unwrap().log;

        assert_eq!(log.status, ImportStatus::Partial);
        assert_eq!(log.inserted, 1);
        let rejection = log
            .issues
            .iter()
            .find(|issue| issue.kind == IssueKind::Rejected)
            .unwrap();
        assert_eq!(rejection.row, 5);
        assert!(rejection.message.starts_with("could not be saved"));
        assert!(rejection.message.contains("earlier rows 2, 4 with the same key were not saved either"));
    }

    #[tokio::test]
    async fn custom_field_columns_are_normalized_to_their_definition() {
        let season = crate::custom_fields::prepare_definition(crate::models::CustomFieldInput {
            key: "season".into(),
            name: Some("Сезон".into()),
            field_type: crate::models::CustomFieldType::Choice,
            default_value: None,
            required: false,
            visible: true,
            sort_order: 0,
            choices: vec!["Лето".into(), "Зима".into()],
        })
        .unwrap();
        let repo = MemoryCatalog::default().with_custom_fields(vec![season]);
        let rows = vec![
            row(&[("Артикул", "A-1"), ("Название", "Кружка"), ("season", "лето")]),
            row(&[("Артикул", "A-2"), ("Название", "Плед"), ("season", "осень")]),
        ];
        let log = import_rows(&repo, rows, &options(ImportKey::Sku)).await.unwrap().log;

        assert_eq!(log.inserted, 1);
        assert_eq!(log.issues[0].row, 3);
        assert!(log.issues[0].message.contains("column 'season': 'осень'"));
        let stored = repo.get("A-1").await.unwrap().unwrap();
        assert_eq!(stored.custom_data.extra.get("season"), Some(&serde_json::json!("Лето")));
    }

    #[tokio::test]
    async fn sanitized_custom_keys_round_trip_through_csv() {
        let mut product = Product::new("A-1", "Кружка");
        product.custom_data.extra.insert("color_name".into(), serde_json::json!("blue"));
        product.validate().unwrap();

        let table = ExportTable::build(
            std::slice::from_ref(&product),
            &[crate::mapper::Field::Sku, crate::mapper::Field::Title],
            PricePrecedence::Computed,
        );
        let csv_bytes = write_csv(&table).unwrap();

        let repo = MemoryCatalog::default();
        let rows = read_csv_rows(&csv_bytes).unwrap();
        import_rows(&repo, rows, &options(ImportKey::Sku)).await.unwrap();

        let stored = repo.get("A-1").await.unwrap().unwrap();
        assert_eq!(stored.custom_data.extra, product.custom_data.extra);
    }
}
