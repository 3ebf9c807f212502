//! Result cache for guarded queries.
//!
//! Keys are a SHA-256 of `(tenant, rewritten SQL)`, so one tenant's entry can
//! never satisfy another tenant's lookup. Entries expire after a TTL and the
//! least recently used entry is evicted once the cache is full.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use askdb_types::Row;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;

#[async_trait]
pub trait QueryCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<Row>>;
    async fn put(&self, key: &str, rows: Vec<Row>);
}

pub fn cache_key(tenant_id: &str, sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update(b"|");
    hasher.update(sql.as_bytes());
    format!("{:064x}", hasher.finalize())
}

pub struct NoopCache;

#[async_trait]
impl QueryCache for NoopCache {
    async fn get(&self, _key: &str) -> Option<Vec<Row>> {
        None
    }

    async fn put(&self, _key: &str, _rows: Vec<Row>) {}
}

struct CacheEntry {
    rows: Vec<Row>,
    inserted_at: Instant,
    accessed_at: Instant,
}

pub struct TtlLruCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    ttl: Duration,
    max_entries: usize,
}

impl TtlLruCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl QueryCache for TtlLruCache {
    async fn get(&self, key: &str) -> Option<Vec<Row>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expired = match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.inserted_at) < self.ttl => {
                entry.accessed_at = now;
                return Some(entry.rows.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    async fn put(&self, key: &str, rows: Vec<Row>) {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.insert(
            key.to_string(),
            CacheEntry {
                rows,
                inserted_at: now,
                accessed_at: now,
            },
        );

        let ttl = self.ttl;
        entries.retain(|_, entry| now.duration_since(entry.inserted_at) < ttl);

        while entries.len() > self.max_entries {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.accessed_at)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            entries.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(n: i64) -> Vec<Row> {
        let mut row = Row::new();
        row.insert("n".to_string(), json!(n));
        vec![row]
    }

    #[test]
    fn keys_are_scoped_by_tenant() {
        let sql = "SELECT count(*) FROM projects LIMIT 100";
        assert_ne!(cache_key("acme", sql), cache_key("globex", sql));
        assert_eq!(cache_key("acme", sql), cache_key("acme", sql));
        assert_eq!(cache_key("acme", sql).len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = TtlLruCache::new(Duration::from_secs(60), 10);
        cache.put("k", rows(1)).await;
        assert_eq!(cache.get("k").await, Some(rows(1)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn least_recently_used_entry_is_evicted() {
        let cache = TtlLruCache::new(Duration::from_secs(600), 2);
        cache.put("a", rows(1)).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.put("b", rows(2)).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(cache.get("a").await.is_some());
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.put("c", rows(3)).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn noop_cache_never_hits() {
        let cache = NoopCache;
        cache.put("k", rows(1)).await;
        assert!(cache.get("k").await.is_none());
    }
}
