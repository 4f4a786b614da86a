//! Virtualization-root registry boundary.
//!
//! The registry owns root registration and provider lifecycle; the engine
//! and cache only hold copies of resolved [`RootHandle`]s, which may go
//! stale and are re-validated against the registry before any provider
//! round-trip.

use mirage_ipc::RootHandle;

use crate::vnode::VnodeIdentity;

/// Provider connection state for one root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderState {
    pub pid: i32,
    pub is_online: bool,
}

impl ProviderState {
    pub const OFFLINE: ProviderState = ProviderState {
        pid: -1,
        is_online: false,
    };
}

/// Authoritative mapping from filesystem objects to virtualization roots.
pub trait RootRegistry: Send + Sync {
    /// Resolve the root containing `vnode` by walking kernel state. This is
    /// the slow path behind every cache miss.
    fn find_root_for_vnode(&self, vnode: VnodeIdentity) -> RootHandle;

    /// Resolve a root by textual path, for events that only carry a path.
    fn find_root_for_path(&self, path: &str) -> RootHandle;

    fn active_provider(&self, root: RootHandle) -> ProviderState;

    /// Whether the object lives on a filesystem type virtualization supports.
    fn vnode_on_allowed_filesystem(&self, vnode: VnodeIdentity) -> bool;

    /// Whether `pid` may perform operations that are blocked for ordinary
    /// processes while a root's provider is offline.
    fn may_access_offline_roots(&self, pid: i32) -> bool;
}
