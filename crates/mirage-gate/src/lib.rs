//! # mirage-gate
//!
//! Authorization interception core for miragefs.
//!
//! Every vnode access and file-operation notification in the system flows
//! through this crate's [`AuthorizationEngine`]: it decides which
//! virtualization root (if any) the object belongs to, applies policy, and
//! blocks the calling thread on a provider round-trip when the object still
//! needs to be materialized. Root resolution is served by the
//! [`VnodeCache`], a fixed-capacity open-addressed table built to answer on
//! the shared-lock fast path for the overwhelming read-mostly workload.
//!
//! The kernel itself, the root registry, and the provider transport sit
//! behind the [`KernelOps`], [`RootRegistry`], and [`ProviderMessaging`]
//! traits, so the whole engine runs unmodified against test doubles.

mod cache;
mod config;
mod engine;
mod health;
mod renames;
mod root;
mod trace;
mod vnode;

pub use cache::{VnodeCache, MAX_CACHE_CAPACITY, MIN_CACHE_CAPACITY};
pub use config::{ConfigError, GateConfig};
pub use engine::{
    AuthVerdict, AuthorizationEngine, Decision, FileOpEvent, FileOpKind, ProviderMessaging,
    VnodeEvent,
};
pub use health::HealthSnapshot;
pub use renames::PendingRenameTracker;
pub use root::{ProviderState, RootRegistry};
pub use trace::{EventTracer, LogTracer, NullTracer, TraceControl, TraceSettings};
pub use vnode::{FileFlags, KernelOps, VnodeAction, VnodeIdentity, VnodeType};

pub use mirage_ipc::{MessageType, RootHandle};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("vnode cache allocation of {capacity} entries failed")]
    CacheAllocation { capacity: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Initialize logging for binaries and tests. Call once at startup.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
