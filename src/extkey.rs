//! # Extended-Key Cache
//!
//! Bounded LRU cache mapping a blob id to the full bytes of an extended key.
//! Key comparison against an extended slot needs the full key whenever the
//! inline prefix ties; this cache keeps hot keys out of the blob store.
//!
//! Entries are evicted on erase and on overwrite of the owning slot, so a
//! stale id can never serve bytes for a recycled blob page.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::config::DEFAULT_EXTKEY_CACHE_CAPACITY;
use crate::storage::BlobId;

#[derive(Debug)]
pub struct ExtkeyCache {
    entries: LruCache<BlobId, Vec<u8>>,
}

impl ExtkeyCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn insert(&mut self, id: BlobId, key: Vec<u8>) {
        self.entries.put(id, key);
    }

    pub fn lookup(&mut self, id: BlobId) -> Option<&[u8]> {
        self.entries.get(&id).map(|v| v.as_slice())
    }

    pub fn remove(&mut self, id: BlobId) {
        self.entries.pop(&id);
    }

    pub fn contains(&self, id: BlobId) -> bool {
        self.entries.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ExtkeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_EXTKEY_CACHE_CAPACITY)
    }
}
