//! Optional segment cache — a pluggable key (message ID) → bytes store the
//! downloader consults before issuing a fetch.

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// A best-effort cache of decoded article bodies, keyed by message ID.
///
/// `put` is best-effort: a cache that is full, unavailable, or otherwise
/// unable to store the value must silently drop it rather than error, since
/// a cache miss only costs a re-fetch.
pub trait SegmentCache: Send + Sync {
    fn get(&self, message_id: &str) -> Option<Bytes>;
    fn put(&self, message_id: &str, data: Bytes);
}

/// In-memory LRU cache, bounded by entry count.
pub struct LruSegmentCache {
    inner: Mutex<LruCache<String, Bytes>>,
}

impl LruSegmentCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self { inner: Mutex::new(LruCache::new(capacity)) }
    }
}

impl SegmentCache for LruSegmentCache {
    fn get(&self, message_id: &str) -> Option<Bytes> {
        self.inner.lock().get(message_id).cloned()
    }

    fn put(&self, message_id: &str, data: Bytes) {
        self.inner.lock().put(message_id.to_string(), data);
    }
}
