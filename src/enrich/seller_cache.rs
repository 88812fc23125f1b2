use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::types::SellerInfo;

#[derive(Debug, Clone)]
struct CachedSeller {
    info: SellerInfo,
    inserted_at: Instant,
}

/// Owned seller-profile cache. Entries live for `ttl`; once `capacity` is
/// reached the oldest entry is evicted to make room.
pub struct SellerCache {
    entries: DashMap<String, CachedSeller>,
    ttl: Duration,
    capacity: usize,
}

impl SellerCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Fresh entry for `seller_id`. Expired entries are dropped on read.
    pub fn get(&self, seller_id: &str) -> Option<SellerInfo> {
        let entry = self.entries.get(seller_id)?;
        if entry.inserted_at.elapsed() < self.ttl {
            return Some(entry.info.clone());
        }
        drop(entry);
        self.entries.remove(seller_id);
        None
    }

    pub fn insert(&self, info: SellerInfo) {
        if !self.entries.contains_key(&info.id) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            info.id.clone(),
            CachedSeller { info, inserted_at: Instant::now() },
        );
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.inserted_at)
            .map(|e| e.key().clone());
        if let Some(id) = oldest {
            self.entries.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
