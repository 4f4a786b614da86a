//! Vnode vocabulary and the kernel metadata boundary.
//!
//! A [`VnodeIdentity`] is an opaque, process-lifetime-scoped token for a
//! kernel filesystem object. Identity values are recycled by the kernel, so
//! they are only meaningful together with the generation counter reported by
//! [`KernelOps::vnode_generation`]. Nothing in this crate ever dereferences
//! the token.

use bitflags::bitflags;

/// Opaque handle to a kernel filesystem object.
///
/// The raw value is address-derived: naturally aligned, with the low bits
/// always zero. Zero is reserved as the "no vnode" sentinel used for empty
/// cache slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VnodeIdentity(u64);

impl VnodeIdentity {
    pub const NULL: VnodeIdentity = VnodeIdentity(0);

    pub const fn from_raw(raw: u64) -> Self {
        VnodeIdentity(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Kernel-level object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeType {
    None,
    Regular,
    Directory,
    SymLink,
    BlockDevice,
    CharDevice,
    Socket,
    Fifo,
    Bad,
}

impl VnodeType {
    /// Types that never participate in virtualization and are filtered out
    /// before any lock or messaging work.
    pub fn is_ignored(self) -> bool {
        matches!(
            self,
            VnodeType::None
                | VnodeType::BlockDevice
                | VnodeType::CharDevice
                | VnodeType::Socket
                | VnodeType::Fifo
                | VnodeType::Bad
        )
    }
}

bitflags! {
    /// Persisted per-object flags maintained by the provider.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileFlags: u32 {
        /// The object belongs to some virtualization root. When unset,
        /// ordinary I/O bypasses the engine entirely.
        const IS_IN_VIRTUALIZATION_ROOT = 0x0000_0040;
        /// The object is an unmaterialized placeholder.
        const IS_EMPTY = 0x0000_8000;
    }
}

bitflags! {
    /// Action bits delivered with an authorization event. Directory and file
    /// interpretations share bit positions, as in the kernel's own encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VnodeAction: u32 {
        const READ_DATA           = 1 << 1;
        const LIST_DIRECTORY      = 1 << 1;
        const WRITE_DATA          = 1 << 2;
        const ADD_FILE            = 1 << 2;
        const EXECUTE             = 1 << 3;
        const SEARCH              = 1 << 3;
        const DELETE              = 1 << 4;
        const APPEND_DATA         = 1 << 5;
        const ADD_SUBDIRECTORY    = 1 << 5;
        const DELETE_CHILD        = 1 << 6;
        const READ_ATTRIBUTES     = 1 << 7;
        const WRITE_ATTRIBUTES    = 1 << 8;
        const READ_EXTATTRIBUTES  = 1 << 9;
        const WRITE_EXTATTRIBUTES = 1 << 10;
        const READ_SECURITY       = 1 << 11;
        const WRITE_SECURITY      = 1 << 12;
        const TAKE_OWNERSHIP      = 1 << 13;
        /// The check is advisory: informational only, gating no real I/O.
        const ACCESS              = 1 << 31;
    }
}

/// Kernel metadata reads the engine depends on.
///
/// Everything here is a thin view over kernel state; reads of persisted
/// attributes can fail and return the kernel errno. Methods that hand out a
/// vnode (`named_stream_parent`, `lookup_path`) take a reference on it which
/// the caller releases through `release_vnode`.
pub trait KernelOps: Send + Sync {
    fn vnode_type(&self, vnode: VnodeIdentity) -> VnodeType;

    /// Generation counter for a (possibly recycled) identity value.
    fn vnode_generation(&self, vnode: VnodeIdentity) -> u32;

    /// Best-effort path, used for tracing and diagnostics only.
    fn vnode_path(&self, vnode: VnodeIdentity) -> Option<String>;

    /// Main fork of a named stream, or None when `vnode` is not a stream.
    fn named_stream_parent(&self, vnode: VnodeIdentity) -> Option<VnodeIdentity>;

    fn lookup_path(&self, path: &str) -> Result<VnodeIdentity, i32>;

    fn release_vnode(&self, vnode: VnodeIdentity);

    fn read_file_flags(&self, vnode: VnodeIdentity) -> Result<FileFlags, i32>;

    /// Whether the placeholder attribute is still present on the object.
    fn read_placeholder_attr(&self, vnode: VnodeIdentity) -> Result<bool, i32>;

    fn process_name(&self, pid: i32) -> String;

    fn process_uid(&self, pid: i32) -> u32;

    fn process_parent(&self, pid: i32) -> i32;
}
