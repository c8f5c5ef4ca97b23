//! Expiring, persisted cache of flag resolutions keyed by cache key.
//!
//! The whole cache lives in one [`Storage`] slot as a single JSON blob (see
//! [`cache_codec`](crate::cache_codec)), so every write re-serializes the whole map. There is no
//! background eviction: expired entries are dropped whenever the cache is written.
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    cache_codec::{self, CacheEntry},
    clock::{add_duration, Clock},
    flags::FlagMap,
    storage::Storage,
};

/// Value to store for a cache key. Timestamps are computed by the cache on write.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheValue {
    pub flags: Option<FlagMap>,
    pub success: bool,
    pub attempt_count: u32,
}

impl CacheValue {
    /// A successful fetch. Resets the failed-attempt counter.
    pub fn success(flags: FlagMap) -> CacheValue {
        CacheValue {
            flags: Some(flags),
            success: true,
            attempt_count: 0,
        }
    }

    /// A failed fetch, recorded for negative caching.
    pub fn failure(flags: Option<FlagMap>, attempt_count: u32) -> CacheValue {
        CacheValue {
            flags,
            success: false,
            attempt_count,
        }
    }
}

/// Result of a cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult {
    pub flags: Option<FlagMap>,
    /// The entry is past its `staleAt`.
    pub stale: bool,
    pub success: bool,
    pub attempt_count: u32,
}

/// `FlagCache` stores flag resolutions in a [`Storage`] slot and decides when they become stale
/// and when they expire.
///
/// The cache never fails: unreadable storage behaves like an empty cache, and failed writes are
/// logged and dropped.
pub struct FlagCache {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    stale_time: Duration,
    expire_time: Duration,
    /// Serializes read-modify-write cycles within this process. Other processes sharing the same
    /// storage may still race; the last writer wins.
    write_lock: Mutex<()>,
}

impl FlagCache {
    /// Create a cache over `storage`.
    ///
    /// # Panics
    ///
    /// Panics if `stale_time` is greater than `expire_time`.
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        stale_time: Duration,
        expire_time: Duration,
    ) -> FlagCache {
        assert!(
            stale_time <= expire_time,
            "stale_time ({stale_time:?}) must not exceed expire_time ({expire_time:?})"
        );
        FlagCache {
            storage,
            clock,
            stale_time,
            expire_time,
            write_lock: Mutex::new(()),
        }
    }

    /// Look up `key`. Returns `None` if the key is absent, the entry has expired, or the stored
    /// blob is unusable.
    pub fn get(&self, key: &str) -> Option<CacheResult> {
        let mut map = cache_codec::decode_or_empty(self.storage.get().as_deref());
        let entry = map.remove(key)?;

        let now = self.clock.now();
        if entry.expire_at <= now {
            log::trace!(target: "flagwise", cache_key = key; "cache entry expired");
            return None;
        }

        Some(CacheResult {
            flags: entry.flags,
            stale: entry.stale_at <= now,
            success: entry.success,
            attempt_count: entry.attempt_count,
        })
    }

    /// Store `value` under `key` with fresh stale/expire timestamps, dropping every expired entry.
    pub fn set(&self, key: &str, value: CacheValue) {
        let _guard = self
            .write_lock
            .lock()
            .expect("thread holding cache write lock should not panic");

        let mut map = cache_codec::decode_or_empty(self.storage.get().as_deref());

        let now = self.clock.now();
        map.insert(
            key.to_owned(),
            CacheEntry {
                expire_at: add_duration(now, self.expire_time),
                stale_at: add_duration(now, self.stale_time),
                flags: value.flags,
                success: value.success,
                attempt_count: value.attempt_count,
            },
        );
        map.retain(|_, entry| entry.expire_at > now);

        let result = cache_codec::encode(&map)
            .map_err(crate::Error::from)
            .and_then(|blob| self.storage.set(&blob));
        if let Err(err) = result {
            log::warn!(target: "flagwise", cache_key = key; "failed to write flag cache: {:?}", err);
        }
    }

    /// Remove all cached entries.
    pub fn clear(&self) {
        let _guard = self
            .write_lock
            .lock()
            .expect("thread holding cache write lock should not panic");
        if let Err(err) = self.storage.clear() {
            log::warn!(target: "flagwise", "failed to clear flag cache: {:?}", err);
        }
    }
}
