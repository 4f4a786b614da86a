//! Cache health counters and their queryable snapshot.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

/// Live counters, updated lock-free from the cache paths.
#[derive(Debug, Default)]
pub(crate) struct CacheStats {
    pub entries: AtomicU32,
    pub invalidate_entire_cache: AtomicU64,
    pub total_lookups: AtomicU64,
    pub lookup_collisions: AtomicU64,
    pub find_root_hits: AtomicU64,
    pub find_root_misses: AtomicU64,
    pub refreshes: AtomicU64,
    pub entry_invalidations: AtomicU64,
    pub cache_full: AtomicU64,
}

impl CacheStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fixed-size health snapshot, fetched by query from the telemetry side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub cache_capacity: u32,
    pub cache_entries: u32,
    pub invalidate_entire_cache_count: u64,
    pub total_cache_lookups: u64,
    pub total_lookup_collisions: u64,
    pub find_root_hits: u64,
    pub find_root_misses: u64,
    pub refresh_count: u64,
    pub invalidate_entry_count: u64,
    pub cache_full_count: u64,
}

impl CacheStats {
    pub fn snapshot(&self, capacity: u32) -> HealthSnapshot {
        HealthSnapshot {
            cache_capacity: capacity,
            cache_entries: self.entries.load(Ordering::Relaxed),
            invalidate_entire_cache_count: self.invalidate_entire_cache.load(Ordering::Relaxed),
            total_cache_lookups: self.total_lookups.load(Ordering::Relaxed),
            total_lookup_collisions: self.lookup_collisions.load(Ordering::Relaxed),
            find_root_hits: self.find_root_hits.load(Ordering::Relaxed),
            find_root_misses: self.find_root_misses.load(Ordering::Relaxed),
            refresh_count: self.refreshes.load(Ordering::Relaxed),
            invalidate_entry_count: self.entry_invalidations.load(Ordering::Relaxed),
            cache_full_count: self.cache_full.load(Ordering::Relaxed),
        }
    }
}
