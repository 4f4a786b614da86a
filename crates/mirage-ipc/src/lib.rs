//! # mirage-ipc
//!
//! Provider messaging protocol for miragefs.
//!
//! The interception core communicates with user-space provider processes
//! through synchronous request/response exchanges: the thread performing a
//! filesystem operation blocks until the provider has hydrated or enumerated
//! the object it is about to touch. This crate owns the wire vocabulary
//! ([`MessageType`], [`ProviderRequest`], [`ProviderResponse`]), the
//! length-prefixed bincode framing, and the [`ProviderMessenger`] that
//! correlates responses to waiting threads and can abort every outstanding
//! wait when a provider dies or the module unloads.

mod frame;
mod messenger;
mod socket;

pub use frame::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use messenger::{MessageSink, ProviderMessenger};
pub use socket::SocketTransport;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the messaging layer.
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode/decode error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("wait aborted (provider disconnected or module unloading)")]
    Aborted,

    #[error("timed out waiting for provider response")]
    TimedOut,

    #[error("unexpected response for message {message_id}")]
    ProtocolMismatch { message_id: u64 },
}

pub type Result<T> = std::result::Result<T, IpcError>;

/// Handle identifying a virtualization root.
///
/// Zero and positive values index a live root; the reserved negative values
/// carry resolution outcomes through the cache and decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RootHandle(i16);

impl RootHandle {
    /// The object is not in any virtualization root.
    pub const NONE: RootHandle = RootHandle(-1);
    /// Resolution has been invalidated; the next lookup must re-resolve.
    pub const INDETERMINATE: RootHandle = RootHandle(-2);
    /// The object lives under a provider's temporary working directory.
    pub const PROVIDER_TEMP_DIR: RootHandle = RootHandle(-3);

    pub const fn from_raw(raw: i16) -> Self {
        RootHandle(raw)
    }

    pub const fn raw(self) -> i16 {
        self.0
    }

    /// True for handles that index a live root.
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

/// Kernel-to-provider request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    EnumerateDirectory,
    RecursivelyEnumerateDirectory,
    HydrateFile,
    NotifyFileModified,
    NotifyFilePreDelete,
    NotifyFilePreDeleteFromRename,
    NotifyDirectoryPreDelete,
    NotifyFileCreated,
    NotifyFileRenamed,
    NotifyDirectoryRenamed,
    NotifyFileHardLinkCreated,
    NotifyFilePreConvertToFull,
}

impl MessageType {
    /// Short name used in trace output.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::EnumerateDirectory => "EnumerateDirectory",
            MessageType::RecursivelyEnumerateDirectory => "RecursivelyEnumerateDirectory",
            MessageType::HydrateFile => "HydrateFile",
            MessageType::NotifyFileModified => "NotifyFileModified",
            MessageType::NotifyFilePreDelete => "NotifyFilePreDelete",
            MessageType::NotifyFilePreDeleteFromRename => "NotifyFilePreDeleteFromRename",
            MessageType::NotifyDirectoryPreDelete => "NotifyDirectoryPreDelete",
            MessageType::NotifyFileCreated => "NotifyFileCreated",
            MessageType::NotifyFileRenamed => "NotifyFileRenamed",
            MessageType::NotifyDirectoryRenamed => "NotifyDirectoryRenamed",
            MessageType::NotifyFileHardLinkCreated => "NotifyFileHardLinkCreated",
            MessageType::NotifyFilePreConvertToFull => "NotifyFilePreConvertToFull",
        }
    }
}

/// A request from the interception core to a provider.
///
/// `message_id` correlates the response; `identity` is the opaque vnode token
/// when the provider should resolve the object itself, `path`/`from_path`
/// carry textual paths for the notification variants that have them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub message_id: u64,
    pub message_type: MessageType,
    pub root: RootHandle,
    pub identity: Option<u64>,
    pub path: Option<String>,
    pub from_path: Option<String>,
    pub pid: i32,
    pub process_name: String,
}

/// Outcome reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    Fail,
}

/// A provider's answer to a [`ProviderRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub message_id: u64,
    pub status: ResponseStatus,
    /// errno to surface to the intercepted operation when `status` is `Fail`;
    /// zero otherwise.
    pub errno: i32,
}
