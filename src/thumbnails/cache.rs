use super::Thumbnail;
use lru::LruCache;
use std::sync::Arc;
use tracing::trace;

struct Slot {
    thumbnail: Arc<Thumbnail>,
    cost: u64,
}

/// Path-keyed thumbnail cache bounded by total cost (RGBA bytes). The LRU
/// itself is unbounded; when an insert would exceed the byte budget, least
/// recently used entries go first.
pub struct ThumbnailCache {
    capacity: u64,
    total_cost: u64,
    lru: LruCache<String, Slot>,
}

impl ThumbnailCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            total_cost: 0,
            lru: LruCache::unbounded(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn total_cost(&self) -> u64 {
        self.total_cost
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    /// Membership check; does not refresh recency.
    pub fn contains(&self, key: &str) -> bool {
        self.lru.contains(key)
    }

    /// Looks up without refreshing recency.
    pub fn peek(&self, key: &str) -> Option<Arc<Thumbnail>> {
        self.lru.peek(key).map(|slot| Arc::clone(&slot.thumbnail))
    }

    /// Looks up and marks the entry most recently used.
    pub fn get(&mut self, key: &str) -> Option<Arc<Thumbnail>> {
        self.lru.get(key).map(|slot| Arc::clone(&slot.thumbnail))
    }

    /// Stores `thumbnail` under `key`, evicting as needed. Returns false when
    /// the thumbnail alone is larger than the whole cache.
    pub fn insert(&mut self, key: &str, thumbnail: Arc<Thumbnail>) -> bool {
        let cost = thumbnail.cost();
        self.remove(key);
        if cost > self.capacity {
            trace!(key, cost, capacity = self.capacity, "thumbnail larger than cache");
            return false;
        }
        while self.total_cost + cost > self.capacity {
            let Some((evicted, slot)) = self.lru.pop_lru() else {
                break;
            };
            self.total_cost -= slot.cost;
            trace!(key = %evicted, cost = slot.cost, "evicted thumbnail");
        }
        self.lru.put(key.to_string(), Slot { thumbnail, cost });
        self.total_cost += cost;
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<Arc<Thumbnail>> {
        let slot = self.lru.pop(key)?;
        self.total_cost -= slot.cost;
        Some(slot.thumbnail)
    }

    pub fn clear(&mut self) {
        self.lru.clear();
        self.total_cost = 0;
    }
}

impl std::fmt::Debug for ThumbnailCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailCache")
            .field("capacity", &self.capacity)
            .field("total_cost", &self.total_cost)
            .field("len", &self.lru.len())
            .finish()
    }
}
