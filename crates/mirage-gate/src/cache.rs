//! Vnode-to-virtualization-root resolution cache.
//!
//! A fixed-capacity open-addressed table mapping `{identity, generation}` to
//! a cached [`RootHandle`]. Reads outnumber writes by orders of magnitude,
//! so lookups take the shared lock and probe without writing; only a miss,
//! a stale generation, or an explicit refresh/invalidate acquires the
//! exclusive lock, and the probe is redone under it rather than trusting the
//! shared-lock result. The table never grows: when a probe wraps without
//! finding a usable slot the whole table is cleared and the entry reinserted,
//! trading a burst of misses for a hard memory bound.

use parking_lot::RwLock;
use tracing::error;

use mirage_ipc::RootHandle;

use crate::health::{CacheStats, HealthSnapshot};
use crate::root::RootRegistry;
use crate::vnode::VnodeIdentity;
use crate::GateError;

/// Capacity bounds, in entries (4 MB to 64 MB at 16 bytes per entry).
pub const MIN_CACHE_CAPACITY: usize = 0x0004_0000;
pub const MAX_CACHE_CAPACITY: usize = 0x0040_0000;

#[derive(Debug, Clone, Copy)]
struct VnodeCacheEntry {
    vnode: VnodeIdentity,
    vid: u32,
    root: RootHandle,
}

impl VnodeCacheEntry {
    const EMPTY: VnodeCacheEntry = VnodeCacheEntry {
        vnode: VnodeIdentity::NULL,
        vid: 0,
        root: RootHandle::NONE,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateBehavior {
    /// Use the current entry if its generation still matches.
    TrustCurrent,
    /// Overwrite the entry with a fresh registry resolution.
    ForceRefresh,
    /// Mark the entry indeterminate so the next lookup re-resolves; the
    /// caller still receives a freshly resolved root.
    InvalidateEntry,
}

pub struct VnodeCache {
    capacity: usize,
    entries: RwLock<Box<[VnodeCacheEntry]>>,
    stats: CacheStats,
}

impl VnodeCache {
    /// Build a cache sized from the kernel's vnode-table hint, clamped to
    /// the fixed capacity bounds. Capacity never changes afterward.
    pub fn with_capacity_hint(hint: usize) -> Result<Self, GateError> {
        Self::with_exact_capacity(
            hint.saturating_mul(2)
                .clamp(MIN_CACHE_CAPACITY, MAX_CACHE_CAPACITY),
        )
    }

    /// Build a cache with an explicit capacity. Production code goes through
    /// `with_capacity_hint`; harnesses use small tables to exercise wrap
    /// and cache-full behavior.
    pub fn with_exact_capacity(capacity: usize) -> Result<Self, GateError> {
        if capacity == 0 {
            return Err(GateError::CacheAllocation { capacity });
        }
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(capacity)
            .map_err(|_| GateError::CacheAllocation { capacity })?;
        entries.resize(capacity, VnodeCacheEntry::EMPTY);
        Ok(Self {
            capacity,
            entries: RwLock::new(entries.into_boxed_slice()),
            stats: CacheStats::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resolve the root for `vnode`, trusting a cached entry whose
    /// generation matches `vid`.
    pub fn find_root_for_vnode(
        &self,
        registry: &dyn RootRegistry,
        vnode: VnodeIdentity,
        vid: u32,
    ) -> RootHandle {
        self.lookup(registry, vnode, vid, UpdateBehavior::TrustCurrent)
    }

    /// Re-resolve the root for `vnode` and overwrite its entry. Used after a
    /// file rename, when the cached root may name the wrong tree.
    pub fn refresh_root_for_vnode(
        &self,
        registry: &dyn RootRegistry,
        vnode: VnodeIdentity,
        vid: u32,
    ) -> RootHandle {
        CacheStats::bump(&self.stats.refreshes);
        self.lookup(registry, vnode, vid, UpdateBehavior::ForceRefresh)
    }

    /// Mark the entry for `vnode` indeterminate and return a freshly
    /// resolved root. Used after hard-link creation, where the next access
    /// must re-derive parent information.
    pub fn invalidate_root_for_vnode(
        &self,
        registry: &dyn RootRegistry,
        vnode: VnodeIdentity,
        vid: u32,
    ) -> RootHandle {
        CacheStats::bump(&self.stats.entry_invalidations);
        self.lookup(registry, vnode, vid, UpdateBehavior::InvalidateEntry)
    }

    /// Drop every entry. Used when an operation's effect cannot be localized
    /// to one entry, e.g. a directory rename moving a whole subtree between
    /// roots.
    pub fn invalidate_all(&self) {
        CacheStats::bump(&self.stats.invalidate_entire_cache);
        let mut entries = self.entries.write();
        self.clear_locked(&mut entries);
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.stats.snapshot(self.capacity as u32)
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.stats
            .entries
            .load(std::sync::atomic::Ordering::Relaxed) as usize
    }

    fn slot_for(&self, vnode: VnodeIdentity) -> usize {
        // The low bits are always zero from natural alignment; shifting them
        // out spreads consecutive identities across distinct slots.
        ((vnode.raw() >> 3) % self.capacity as u64) as usize
    }

    fn lookup(
        &self,
        registry: &dyn RootRegistry,
        vnode: VnodeIdentity,
        vid: u32,
        behavior: UpdateBehavior,
    ) -> RootHandle {
        debug_assert!(!vnode.is_null());
        CacheStats::bump(&self.stats.total_lookups);
        let starting_index = self.slot_for(vnode);

        if behavior == UpdateBehavior::TrustCurrent {
            let entries = self.entries.read();
            if let Some(index) = self.probe(&entries, vnode, starting_index) {
                let entry = entries[index];
                if entry.vnode == vnode
                    && entry.vid == vid
                    && entry.root != RootHandle::INDETERMINATE
                {
                    CacheStats::bump(&self.stats.find_root_hits);
                    return entry.root;
                }
            }
            CacheStats::bump(&self.stats.find_root_misses);
            // Fall through: the shared guard is dropped here and the probe is
            // redone under the exclusive lock, so an intervening writer
            // cannot invalidate what we act on.
        }

        let mut entries = self.entries.write();
        if let Some(index) = self.probe(&entries, vnode, starting_index) {
            return self.update_entry_locked(&mut entries, registry, index, vnode, vid, behavior);
        }

        // The probe wrapped without a usable slot: unrelated collisions have
        // saturated the table. Clear everything and reinsert at the home
        // slot, which must succeed in an empty table.
        CacheStats::bump(&self.stats.cache_full);
        self.clear_locked(&mut entries);
        match self.probe(&entries, vnode, starting_index) {
            Some(index) => self.update_entry_locked(
                &mut entries,
                registry,
                index,
                vnode,
                vid,
                UpdateBehavior::ForceRefresh,
            ),
            None => {
                error!(
                    vnode = vnode.raw(),
                    "insert failed after emptying cache; resolving uncached"
                );
                registry.find_root_for_vnode(vnode)
            }
        }
    }

    /// Walk from the home slot until the identity matches, an empty slot
    /// appears, or the walk returns to where it started (table full along
    /// this path).
    fn probe(
        &self,
        entries: &[VnodeCacheEntry],
        vnode: VnodeIdentity,
        starting_index: usize,
    ) -> Option<usize> {
        let mut index = starting_index;
        while entries[index].vnode != vnode {
            if entries[index].vnode.is_null() {
                return Some(index);
            }
            CacheStats::bump(&self.stats.lookup_collisions);
            index = (index + 1) % self.capacity;
            if index == starting_index {
                return None;
            }
        }
        Some(index)
    }

    fn update_entry_locked(
        &self,
        entries: &mut [VnodeCacheEntry],
        registry: &dyn RootRegistry,
        index: usize,
        vnode: VnodeIdentity,
        vid: u32,
        behavior: UpdateBehavior,
    ) -> RootHandle {
        let slot_was_empty = entries[index].vnode.is_null();
        let entry = &mut entries[index];

        match behavior {
            UpdateBehavior::InvalidateEntry => {
                if slot_was_empty {
                    self.stats
                        .entries
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                entry.vnode = vnode;
                entry.vid = vid;
                entry.root = RootHandle::INDETERMINATE;
                registry.find_root_for_vnode(vnode)
            }
            UpdateBehavior::TrustCurrent | UpdateBehavior::ForceRefresh => {
                let needs_update = behavior == UpdateBehavior::ForceRefresh
                    || slot_was_empty
                    || entry.vnode != vnode
                    || entry.vid != vid
                    || entry.root == RootHandle::INDETERMINATE;
                if needs_update {
                    if slot_was_empty {
                        self.stats
                            .entries
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                    entry.vnode = vnode;
                    entry.vid = vid;
                    entry.root = registry.find_root_for_vnode(vnode);
                }
                entry.root
            }
        }
    }

    fn clear_locked(&self, entries: &mut [VnodeCacheEntry]) {
        entries.fill(VnodeCacheEntry::EMPTY);
        self.stats
            .entries
            .store(0, std::sync::atomic::Ordering::Relaxed);
    }
}
