// =============================================================================
// CACHE MODULE
// =============================================================================
// Redis cache of stored product inputs, keyed by SKU.
//
// NOTES:
// - Only inputs are cached; derived fields are computed after the read, so
//   a cached entry can never hold a stale margin or final price
// - Every write path invalidates the SKU it touched
// - Redis is an optimization: failures are logged and treated as a miss
// =============================================================================

use std::time::Instant;

use redis::aio::ConnectionManager;

use crate::metrics;
use crate::models::Product;

/// Entry lifetime: 5 minutes
const TTL_SECONDS: u64 = 300;

fn cache_key(sku: &str) -> String {
    format!("catalog:product:{sku}")
}

#[derive(Clone)]
pub struct ProductCache {
    conn: ConnectionManager,
}

impl ProductCache {
    /// Connect to Redis
    ///
    /// ConnectionManager reconnects on its own after a dropped connection.
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Cached product inputs for `sku`, if present and decodable
    pub async fn get(&self, sku: &str) -> Option<Product> {
        let start = Instant::now();
        let cached = redis::cmd("GET")
            .arg(cache_key(sku))
            .query_async::<_, Option<String>>(&mut self.conn.clone())
            .await;
        metrics::record_redis_operation("get", start.elapsed().as_secs_f64());

        match cached {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(product) => Some(product),
                Err(err) => {
                    tracing::warn!(sku, error = %err, "Dropping undecodable cache entry");
                    self.invalidate(sku).await;
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(sku, error = %err, "Redis GET failed");
                None
            }
        }
    }

    /// Store product inputs for `TTL_SECONDS`
    pub async fn put(&self, product: &Product) {
        let json = match serde_json::to_string(product) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(sku = %product.sku, error = %err, "Product not cacheable");
                return;
            }
        };

        let start = Instant::now();
        let result = redis::cmd("SETEX")
            .arg(cache_key(&product.sku))
            .arg(TTL_SECONDS)
            .arg(json)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await;
        metrics::record_redis_operation("set", start.elapsed().as_secs_f64());

        if let Err(err) = result {
            tracing::warn!(sku = %product.sku, error = %err, "Redis SETEX failed");
        }
    }

    /// Drop the cached entries of every given SKU
    pub async fn invalidate_many(&self, skus: &[String]) {
        if skus.is_empty() {
            return;
        }
        let start = Instant::now();
        let mut cmd = redis::cmd("DEL");
        for sku in skus {
            cmd.arg(cache_key(sku));
        }
        let result = cmd.query_async::<_, ()>(&mut self.conn.clone()).await;
        metrics::record_redis_operation("delete", start.elapsed().as_secs_f64());

        if let Err(err) = result {
            tracing::warn!(count = skus.len(), error = %err, "Redis DEL failed");
        }
    }

    pub async fn invalidate(&self, sku: &str) {
        self.invalidate_many(&[sku.to_string()]).await;
    }

    /// Readiness check
    pub async fn ping(&self) -> bool {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn.clone())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_sku() {
        assert_eq!(cache_key("WB-1001"), "catalog:product:WB-1001");
    }

    #[test]
    fn cached_json_round_trips_inputs_only() {
        let mut product = Product::new("WB-1001", "Термокружка");
        product.price_src = Some(1000.0);
        product.seller_discount_pct = Some(20.0);

        let json = serde_json::to_value(&product).unwrap();
        assert!(json.get("derived").is_none());
        assert!(json.get("price_final").is_none());

        let back: Product = serde_json::from_value(json).unwrap();
        assert_eq!(back, product);
    }
}
