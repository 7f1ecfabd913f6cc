// Read caches.
//
// The row cache holds fully merged partitions and is consulted by the row
// merge before any source is read. The key cache holds index entries so that
// point reads can skip the index file.

use std::{
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
};

use hashlink::LruCache;

use crate::db::{column_family::ColumnFamily, decorated_key::DecoratedKey, row_index_entry::RowIndexEntry};

/// A cache of merged partitions.
///
/// Implementations must only ever hold partitions that reflect every write
/// to their key: the store invalidates a key on each write and only
/// populates it from flushed state.
pub trait RowCache {
    fn get(&self, key: &DecoratedKey) -> Option<Arc<ColumnFamily>>;
    fn put(&self, key: DecoratedKey, cf: Arc<ColumnFamily>);
    fn invalidate(&self, key: &DecoratedKey);
}

/// A row cache holding at most `capacity` partitions.
pub struct MapRowCache {
    rows: Mutex<LruCache<DecoratedKey, Arc<ColumnFamily>>>,
}

impl MapRowCache {
    pub fn new(capacity: usize) -> Self {
        MapRowCache {
            rows: Mutex::new(LruCache::new(capacity.max(1))),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RowCache for MapRowCache {
    fn get(&self, key: &DecoratedKey) -> Option<Arc<ColumnFamily>> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn put(&self, key: DecoratedKey, cf: Arc<ColumnFamily>) {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, cf);
    }

    fn invalidate(&self, key: &DecoratedKey) {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// Identifies an index entry: the segment it belongs to and the key.
pub type KeyCacheKey = (String, DecoratedKey);

/// An LRU bounded by the estimated memory of its entries rather than their
/// number.
struct SizedLru<K: Hash + Eq, V> {
    map: LruCache<K, (V, usize)>,
    used: usize,
    capacity: usize,
}

impl<K: Hash + Eq, V> SizedLru<K, V> {
    fn new(capacity: usize) -> Self {
        SizedLru {
            map: LruCache::new_unbounded(),
            used: 0,
            capacity,
        }
    }

    fn get(&mut self, key: &K) -> Option<&V> {
        self.map.get(key).map(|(v, _)| v)
    }

    // Returns false if the value alone exceeds the capacity.
    fn insert(&mut self, key: K, val: V, size: usize) -> bool {
        if size > self.capacity {
            return false;
        }
        if let Some((_, old)) = self.map.insert(key, (val, size)) {
            self.used -= old;
        }
        self.used += size;
        while self.used > self.capacity {
            match self.map.remove_lru() {
                Some((_, (_, s))) => self.used -= s,
                None => break,
            }
        }
        true
    }

    fn remove(&mut self, key: &K) {
        if let Some((_, size)) = self.map.remove(key) {
            self.used -= size;
        }
    }
}

/// Index entries by segment and key, bounded by `memory_size()` of the
/// cached entries.
pub struct KeyCache {
    entries: Mutex<SizedLru<KeyCacheKey, RowIndexEntry>>,
}

impl KeyCache {
    pub fn new(capacity_bytes: usize) -> Self {
        KeyCache {
            entries: Mutex::new(SizedLru::new(capacity_bytes)),
        }
    }

    pub fn get(&self, segment: &str, key: &DecoratedKey) -> Option<RowIndexEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(segment.to_owned(), key.clone()))
            .cloned()
    }

    pub fn put(&self, segment: &str, key: DecoratedKey, entry: RowIndexEntry) -> bool {
        let size = entry.memory_size() + key.key().len() + segment.len();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((segment.to_owned(), key), entry, size)
    }

    /// Drops an entry, used when its segment is removed.
    pub fn invalidate(&self, segment: &str, key: &DecoratedKey) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(segment.to_owned(), key.clone()));
    }

    pub fn memory_used(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).used
    }
}
