use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use super::{FrameFormat, FrameRecord};
use crate::config::CacheConfig;

/// Roughly how many bytes of a large frame are sampled for its key.
const SAMPLE_POINTS: usize = 1000;

/// Approximate content key for a frame.
///
/// Only a sparse sample of the bytes is folded into a 32-bit rolling hash, so
/// distinct frames can collide. Cache entries hold descriptive metadata only,
/// which makes a collision cost a stale description rather than wrong data.
pub fn cache_key(data: &[u8]) -> String {
    let stride = (data.len() / SAMPLE_POINTS).max(1);
    let hash = data
        .iter()
        .step_by(stride)
        .fold(0u32, |hash, &byte| {
            (hash << 5).wrapping_sub(hash).wrapping_add(u32::from(byte))
        });
    format!("{:08x}", hash)
}

/// Metadata remembered for a frame, never the frame bytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub format: FrameFormat,
    pub size: usize,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub processed_at: DateTime<Utc>,
}

impl From<&FrameRecord> for CacheEntry {
    fn from(frame: &FrameRecord) -> Self {
        Self {
            format: frame.format,
            size: frame.size,
            width: frame.width,
            height: frame.height,
            processed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub skipped_inserts: u64,
}

/// Fixed-capacity metadata cache.
///
/// Once `capacity` keys are stored new keys are dropped; existing entries
/// are never evicted.
#[derive(Debug)]
pub struct FrameCache {
    enabled: bool,
    capacity: usize,
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    skipped_inserts: AtomicU64,
}

impl FrameCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            capacity: config.size,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            skipped_inserts: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.read().await.get(key).cloned();
        if entry.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        entry
    }

    /// Returns whether the key is now stored with `entry`.
    pub async fn insert(&self, key: String, entry: CacheEntry) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&key) {
            entries.insert(key, entry);
            return true;
        }
        if entries.len() >= self.capacity {
            self.skipped_inserts.fetch_add(1, Ordering::Relaxed);
            debug!("Frame cache full ({} entries), not caching {}", self.capacity, key);
            return false;
        }
        entries.insert(key, entry);
        true
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            enabled: self.enabled,
            entries: self.len().await,
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            skipped_inserts: self.skipped_inserts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(size: usize) -> CacheEntry {
        CacheEntry {
            format: FrameFormat::Png,
            size,
            width: None,
            height: None,
            processed_at: Utc::now(),
        }
    }

    fn cache(size: usize) -> FrameCache {
        FrameCache::new(&CacheConfig { enabled: true, size })
    }

    #[test]
    fn test_cache_key_is_stable_and_short() {
        let frame = vec![42u8; 4096];
        assert_eq!(cache_key(&frame), cache_key(&frame.clone()));
        assert_eq!(cache_key(&frame).len(), 8);
        assert_eq!(cache_key(&[]), "00000000");
        assert_ne!(cache_key(&[1, 2, 3]), cache_key(&[3, 2, 1]));
    }

    #[test]
    fn test_cache_key_samples_sparsely() {
        // 2000 bytes -> stride 2, odd offsets are never read
        let a = vec![0u8; 2000];
        let mut b = a.clone();
        b[1] = 0xFF;
        assert_eq!(cache_key(&a), cache_key(&b));

        b[0] = 0xFF;
        assert_ne!(cache_key(&a), cache_key(&b));
    }

    #[tokio::test]
    async fn test_fixed_capacity_without_eviction() {
        let cache = cache(2);
        let keys: Vec<String> = [[1u8; 4], [2u8; 4], [3u8; 4]]
            .iter()
            .map(|bytes| cache_key(bytes))
            .collect();

        assert!(cache.insert(keys[0].clone(), entry(1)).await);
        assert!(cache.insert(keys[1].clone(), entry(2)).await);
        assert!(!cache.insert(keys[2].clone(), entry(3)).await);

        assert_eq!(cache.len().await, 2);
        assert!(cache.lookup(&keys[2]).await.is_none());
        assert_eq!(cache.lookup(&keys[0]).await.map(|e| e.size), Some(1));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.skipped_inserts, 1);
    }

    #[tokio::test]
    async fn test_existing_key_is_refreshed_when_full() {
        let cache = cache(1);
        assert!(cache.insert("a".into(), entry(1)).await);
        assert!(cache.insert("a".into(), entry(5)).await);
        assert_eq!(cache.lookup("a").await.map(|e| e.size), Some(5));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = cache(2);
        cache.insert("a".into(), entry(1)).await;
        cache.clear().await;
        assert_eq!(cache.len().await, 0);
        assert!(cache.insert("b".into(), entry(1)).await);
    }
}
