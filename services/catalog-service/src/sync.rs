// =============================================================================
// SYNC MODULE
// =============================================================================
// Pulls product listings from a marketplace and upserts them into the legacy
// `product_items` store.
//
// FLOW:
// ListingSource::fetch_page(cursor) → normalize() → LegacyItemStore::upsert_item()
//
// NOTES:
// - Pages are walked sequentially; there is no retry or backoff
// - The walk ends when the source returns no cursor, an empty page, or the
//   cursor it was just given
// - A listing without an external key cannot be upserted and is skipped
// - Marketplace HTTP clients live outside this crate; anything implementing
//   ListingSource can be synced
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::metrics;

const UNTITLED: &str = "Untitled product";

// =============================================================================
// SOURCE SIDE
// =============================================================================

/// One listing as delivered by a marketplace client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Listing {
    /// Identifier the item is upserted by (nm_id for WB, product_id for Ozon)
    pub external_key: Option<String>,
    pub product_id: Option<String>,
    pub offer_id: Option<String>,
    pub sku: Option<String>,
    pub nm_id: Option<i64>,
    pub title: Option<String>,
    pub brand: Option<String>,
    pub price: Option<f64>,
    pub stock: Option<i32>,
    pub image_urls: Vec<String>,
    /// Raw payload fragments kept for reference
    pub extra: Value,
}

/// One page of listings plus the cursor for the next one
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub items: Vec<Listing>,
    pub next_cursor: Option<String>,
}

/// A paginated marketplace catalog
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Marketplace name stored with every item ("WB", "OZON")
    fn source(&self) -> &str;

    /// Which identifier `Listing::external_key` holds ("nm_id", "product_id")
    fn key_type(&self) -> &str;

    /// Fetch the page at `cursor`; `None` is the first page
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<ListingPage>;
}

// -----------------------------------------------------------------------------
// SNAPSHOT SOURCE
// -----------------------------------------------------------------------------
/// Listings pushed in one request by an external marketplace client, served
/// back in fixed-size pages. The cursor is the offset of the next page.
pub struct SnapshotSource {
    source: String,
    key_type: String,
    items: Vec<Listing>,
    page_size: usize,
}

impl SnapshotSource {
    pub fn new(
        source: impl Into<String>,
        key_type: impl Into<String>,
        items: Vec<Listing>,
        page_size: usize,
    ) -> Self {
        Self {
            source: source.into(),
            key_type: key_type.into(),
            items,
            page_size: page_size.max(1),
        }
    }

    /// Pages needed to walk every item (an empty snapshot still has one)
    pub fn page_count(&self) -> usize {
        self.items.len().div_ceil(self.page_size).max(1)
    }
}

#[async_trait]
impl ListingSource for SnapshotSource {
    fn source(&self) -> &str {
        &self.source
    }

    fn key_type(&self) -> &str {
        &self.key_type
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<ListingPage> {
        let offset = cursor
            .map(str::parse::<usize>)
            .transpose()
            .context("Invalid snapshot cursor")?
            .unwrap_or(0);
        let items: Vec<Listing> = self
            .items
            .iter()
            .skip(offset)
            .take(self.page_size)
            .cloned()
            .collect();
        let next = offset + self.page_size;
        Ok(ListingPage {
            items,
            next_cursor: (next < self.items.len()).then(|| next.to_string()),
        })
    }
}

// =============================================================================
// STORE SIDE
// =============================================================================

/// A normalized row of the legacy store, unique on
/// (source, external_key, external_key_type)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyItem {
    pub source: String,
    pub external_key: String,
    /// Qualified key type, e.g. "WB:nm_id"
    pub external_key_type: String,
    pub product_id: Option<String>,
    pub offer_id: Option<String>,
    pub sku: Option<String>,
    pub nm_id: Option<i64>,
    pub title: String,
    pub brand: Option<String>,
    pub price: Option<f64>,
    pub stock: Option<i32>,
    pub image_urls: Vec<String>,
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[async_trait]
pub trait LegacyItemStore: Send + Sync {
    async fn upsert_item(&self, item: &LegacyItem) -> Result<UpsertOutcome>;
}

// =============================================================================
// NORMALIZATION
// =============================================================================

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Listing → legacy row. Returns `None` when the listing has no usable key.
///
/// Blank strings become unset, a missing title becomes "Untitled product",
/// blank image urls are dropped and a non-object `extra` is wrapped as
/// `{"value": ...}`.
pub fn normalize(source: &str, key_type: &str, listing: &Listing) -> Option<LegacyItem> {
    let external_key = clean(&listing.external_key)?;

    let extra = match &listing.extra {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };

    Some(LegacyItem {
        source: source.to_string(),
        external_key,
        external_key_type: format!("{source}:{key_type}"),
        product_id: clean(&listing.product_id),
        offer_id: clean(&listing.offer_id),
        sku: clean(&listing.sku),
        nm_id: listing.nm_id,
        title: clean(&listing.title).unwrap_or_else(|| UNTITLED.to_string()),
        brand: clean(&listing.brand),
        price: listing.price.filter(|p| p.is_finite()),
        stock: listing.stock,
        image_urls: listing
            .image_urls
            .iter()
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect(),
        extra,
    })
}

// =============================================================================
// DRIVER
// =============================================================================

/// Counters of one sync run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub pages: usize,
}

/// Walk every page of `source` (at most `max_pages`) and upsert each listing.
///
/// # Arguments
/// * `source` - Paginated marketplace catalog
/// * `store` - Legacy item store to upsert into
/// * `max_pages` - Hard stop for sources that never end their cursor chain
///
/// # Returns
/// * `Ok(SyncReport)` - Counts of inserted, updated and skipped listings
/// * `Err` - A page could not be fetched or an item could not be stored;
///   items stored before the failure stay stored
pub async fn sync_listings(
    source: &dyn ListingSource,
    store: &dyn LegacyItemStore,
    max_pages: usize,
) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    let mut cursor: Option<String> = None;

    while report.pages < max_pages {
        let page = source
            .fetch_page(cursor.as_deref())
            .await
            .with_context(|| format!("Failed to fetch {} page {}", source.source(), report.pages + 1))?;
        report.pages += 1;

        if page.items.is_empty() {
            break;
        }

        for listing in &page.items {
            let Some(item) = normalize(source.source(), source.key_type(), listing) else {
                report.skipped += 1;
                metrics::record_sync_item(source.source(), "skipped");
                continue;
            };
            let outcome = store
                .upsert_item(&item)
                .await
                .with_context(|| format!("Failed to store {} item {}", item.source, item.external_key))?;
            match outcome {
                UpsertOutcome::Inserted => {
                    report.inserted += 1;
                    metrics::record_sync_item(source.source(), "inserted");
                }
                UpsertOutcome::Updated => {
                    report.updated += 1;
                    metrics::record_sync_item(source.source(), "updated");
                }
            }
        }

        match page.next_cursor {
            Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
            _ => break,
        }
    }

    tracing::info!(
        source = source.source(),
        pages = report.pages,
        inserted = report.inserted,
        updated = report.updated,
        skipped = report.skipped,
        "Listing sync finished"
    );

    Ok(report)
}
