//! Authorization decision engine.
//!
//! Invoked from the kernel's access-check and file-operation notification
//! hooks on arbitrary threads. Vnode operations produce an explicit
//! [`Decision`]; file-operation events are informational and can only have
//! side effects (messaging the provider, maintaining the cache and the
//! pending-rename table). The hook contract requires them to succeed
//! unconditionally, so every failure there is logged and swallowed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use mirage_ipc::{MessageType, ProviderMessenger, ProviderResponse, ResponseStatus, RootHandle};

use crate::cache::VnodeCache;
use crate::config::GateConfig;
use crate::renames::PendingRenameTracker;
use crate::root::RootRegistry;
use crate::trace::{EventTracer, LogTracer, NullTracer, TraceControl, TraceSettings};
use crate::vnode::{FileFlags, KernelOps, VnodeAction, VnodeIdentity, VnodeType};
use crate::{GateError, HealthSnapshot};

/// Result of a vnode authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    Allow,
    Deny,
    Defer,
}

/// Verdict plus the errno to report alongside a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub verdict: AuthVerdict,
    pub errno: Option<i32>,
}

impl Decision {
    pub const fn defer() -> Self {
        Decision {
            verdict: AuthVerdict::Defer,
            errno: None,
        }
    }

    pub const fn deny() -> Self {
        Decision {
            verdict: AuthVerdict::Deny,
            errno: None,
        }
    }

    pub const fn deny_errno(errno: i32) -> Self {
        Decision {
            verdict: AuthVerdict::Deny,
            errno: Some(errno),
        }
    }
}

/// An access-check event for one vnode.
#[derive(Debug, Clone, Copy)]
pub struct VnodeEvent {
    pub vnode: VnodeIdentity,
    pub action: VnodeAction,
    pub pid: i32,
}

/// A post-hoc file-operation notification.
#[derive(Debug, Clone, Copy)]
pub struct FileOpEvent<'a> {
    pub pid: i32,
    pub kind: FileOpKind<'a>,
}

#[derive(Debug, Clone, Copy)]
pub enum FileOpKind<'a> {
    Open {
        vnode: VnodeIdentity,
        path: &'a str,
    },
    Close {
        vnode: VnodeIdentity,
        path: &'a str,
        modified: bool,
    },
    Rename {
        from_path: &'a str,
        to_path: &'a str,
    },
    HardLink {
        from_path: &'a str,
        to_path: &'a str,
    },
    WillRename {
        vnode: VnodeIdentity,
    },
}

/// Synchronous transport to the user-space provider.
pub trait ProviderMessaging: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn send_request_and_wait(
        &self,
        root: RootHandle,
        message_type: MessageType,
        identity: Option<u64>,
        path: Option<&str>,
        from_path: Option<&str>,
        pid: i32,
        process_name: &str,
    ) -> mirage_ipc::Result<ProviderResponse>;

    fn abort_all_outstanding(&self);
}

impl ProviderMessaging for ProviderMessenger {
    fn send_request_and_wait(
        &self,
        root: RootHandle,
        message_type: MessageType,
        identity: Option<u64>,
        path: Option<&str>,
        from_path: Option<&str>,
        pid: i32,
        process_name: &str,
    ) -> mirage_ipc::Result<ProviderResponse> {
        self.send_and_wait(
            root,
            message_type,
            identity,
            path,
            from_path,
            pid,
            process_name,
        )
    }

    fn abort_all_outstanding(&self) {
        ProviderMessenger::abort_all_outstanding(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallbackPolicy {
    /// Any process may trigger the provider round-trip.
    AllowAny,
    /// Only user-initiated I/O may; system services triggering hydration
    /// side effects have caused deadlocks with other authorization hooks.
    UserInitiatedOnly,
}

enum RootAccess {
    Granted {
        root: RootHandle,
    },
    /// Resolution stopped; the engine answers with `decision`.
    /// `provider_offline` lets the write path continue its placeholder
    /// check even though no round-trip is possible.
    Stopped {
        decision: Decision,
        provider_offline: bool,
    },
}

enum Precheck {
    Proceed {
        flags: FileFlags,
        process_name: String,
    },
    Stop(Decision),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOpLookup {
    Rename,
    HardLink,
    Other,
}

/// Holds a vnode reference that must be released on every exit path.
struct VnodeRef<'k> {
    kernel: &'k dyn KernelOps,
    vnode: VnodeIdentity,
    owned: bool,
}

impl<'k> VnodeRef<'k> {
    fn borrowed(kernel: &'k dyn KernelOps, vnode: VnodeIdentity) -> Self {
        Self {
            kernel,
            vnode,
            owned: false,
        }
    }

    fn owned(kernel: &'k dyn KernelOps, vnode: VnodeIdentity) -> Self {
        Self {
            kernel,
            vnode,
            owned: true,
        }
    }

    fn vnode(&self) -> VnodeIdentity {
        self.vnode
    }
}

impl Drop for VnodeRef<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.kernel.release_vnode(self.vnode);
        }
    }
}

struct EventGuard<'e> {
    counter: &'e AtomicU64,
}

impl Drop for EventGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct AuthorizationEngine {
    kernel: Arc<dyn KernelOps>,
    registry: Arc<dyn RootRegistry>,
    messaging: Arc<dyn ProviderMessaging>,
    cache: VnodeCache,
    renames: PendingRenameTracker,
    trace: TraceControl,
    config: GateConfig,
    active_events: AtomicU64,
    accepting: AtomicBool,
}

impl AuthorizationEngine {
    pub fn new(
        config: GateConfig,
        kernel: Arc<dyn KernelOps>,
        registry: Arc<dyn RootRegistry>,
        messaging: Arc<dyn ProviderMessaging>,
    ) -> Result<Self, GateError> {
        let cache = VnodeCache::with_capacity_hint(config.cache_capacity_hint)?;
        Ok(Self {
            kernel,
            registry,
            messaging,
            cache,
            renames: PendingRenameTracker::new(),
            trace: TraceControl::new(),
            config,
            active_events: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
        })
    }

    /// Authorize one vnode operation.
    pub fn handle_vnode_event(&self, event: &VnodeEvent) -> Decision {
        let Some(_guard) = self.enter_event() else {
            return Decision::defer();
        };
        if self.trace.is_enabled() {
            self.vnode_event_impl::<LogTracer>(event)
        } else {
            self.vnode_event_impl::<NullTracer>(event)
        }
    }

    /// Process one file-operation notification. These cannot fail upward:
    /// whatever happens internally, the caller reports success to the kernel.
    pub fn handle_fileop_event(&self, event: &FileOpEvent<'_>) {
        let Some(_guard) = self.enter_event() else {
            return;
        };
        match event.kind {
            FileOpKind::Rename { to_path, .. } => self.fileop_rename(event.pid, to_path),
            FileOpKind::HardLink { from_path, to_path } => {
                self.fileop_hard_link(event.pid, from_path, to_path)
            }
            FileOpKind::Open { vnode, path } => self.fileop_open(event.pid, vnode, path),
            FileOpKind::Close {
                vnode,
                path,
                modified,
            } => self.fileop_close(event.pid, vnode, path, modified),
            FileOpKind::WillRename { vnode } => self.fileop_will_rename(vnode),
        }
    }

    /// Drop every cached root resolution.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate_all();
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.cache.health_snapshot()
    }

    pub fn enable_tracing(&self, settings: TraceSettings) {
        self.trace.enable(settings);
    }

    pub fn disable_tracing(&self) {
        self.trace.disable();
    }

    /// Stop accepting events, abort in-flight provider waits, and block
    /// until every active callback has returned.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.messaging.abort_all_outstanding();
        // Always sleep at least once: narrows the race between intake
        // shutoff and an event that has not yet incremented the counter,
        // which the dispatch framework gives us no way to close entirely.
        loop {
            std::thread::sleep(Duration::from_millis(1));
            if self.active_events.load(Ordering::SeqCst) == 0 {
                break;
            }
        }
        self.renames.drain();
    }

    fn enter_event(&self) -> Option<EventGuard<'_>> {
        self.active_events.fetch_add(1, Ordering::SeqCst);
        let guard = EventGuard {
            counter: &self.active_events,
        };
        if self.accepting.load(Ordering::SeqCst) {
            Some(guard)
        } else {
            None
        }
    }

    fn vnode_event_impl<'a, T: EventTracer<'a>>(&'a self, event: &VnodeEvent) -> Decision {
        let mut tracer = T::begin_vnode(&self.trace, self.kernel.as_ref(), event);
        let decision = self.vnode_decision(&mut tracer, event);
        tracer.vnode_result(decision.verdict);
        decision
    }

    fn vnode_decision<'a, T: EventTracer<'a>>(
        &self,
        tracer: &mut T,
        event: &VnodeEvent,
    ) -> Decision {
        // Attribute checks behave oddly on a named fork; act on the main
        // file instead.
        let target = self.main_fork_of(event.vnode);
        let vnode = target.vnode();

        if !self.vnode_eligible(vnode) {
            return Decision::defer();
        }

        let is_delete = event.action.intersects(VnodeAction::DELETE);
        // Consumes the thread's pending record, so it must run under the
        // same conditions as the recording notification did - early.
        let is_rename = is_delete && self.delete_is_for_rename(vnode);

        let (flags, process_name) =
            match self.precheck_vnode_event(tracer, event.action, vnode, event.pid) {
                Precheck::Proceed {
                    flags,
                    process_name,
                } => (flags, process_name),
                Precheck::Stop(decision) => return decision,
            };

        let pid = event.pid;
        let vid = self.kernel.vnode_generation(vnode);
        let is_directory = self.kernel.vnode_type(vnode) == VnodeType::Directory;
        let mut decision = Decision::defer();

        if is_directory {
            if is_rename
                || event.action.intersects(
                    VnodeAction::LIST_DIRECTORY
                        | VnodeAction::SEARCH
                        | VnodeAction::READ_SECURITY
                        | VnodeAction::READ_ATTRIBUTES
                        | VnodeAction::READ_EXTATTRIBUTES,
                )
            {
                if is_rename {
                    // The moved directory must show its full contents at the
                    // new location right away, so expand it recursively.
                    // Rename targets are blocked offline only when renames
                    // are actually distinguishable from deletes.
                    let root = match self.resolve_root(
                        vnode,
                        vid,
                        pid,
                        CallbackPolicy::UserInitiatedOnly,
                        self.config.rename_detection,
                    ) {
                        RootAccess::Granted { root } => root,
                        RootAccess::Stopped { decision, .. } => return decision,
                    };
                    if !self.message_provider(
                        tracer,
                        root,
                        MessageType::RecursivelyEnumerateDirectory,
                        Some(vnode.raw()),
                        None,
                        None,
                        pid,
                        &process_name,
                        &mut decision,
                    ) {
                        return decision;
                    }
                } else if flags.contains(FileFlags::IS_EMPTY) {
                    let root = match self.resolve_root(
                        vnode,
                        vid,
                        pid,
                        CallbackPolicy::UserInitiatedOnly,
                        // Reading an unexpanded directory is fine offline.
                        false,
                    ) {
                        RootAccess::Granted { root } => root,
                        RootAccess::Stopped { decision, .. } => return decision,
                    };
                    if !self.message_provider(
                        tracer,
                        root,
                        MessageType::EnumerateDirectory,
                        Some(vnode.raw()),
                        None,
                        None,
                        pid,
                        &process_name,
                        &mut decision,
                    ) {
                        return decision;
                    }
                }
            } else if event
                .action
                .intersects(VnodeAction::ADD_FILE | VnodeAction::ADD_SUBDIRECTORY)
            {
                // Content created in an offline root would never reach the
                // provider; reject it.
                if let RootAccess::Stopped { decision, .. } =
                    self.resolve_root(vnode, vid, pid, CallbackPolicy::AllowAny, true)
                {
                    return decision;
                }
            }
        } else {
            if is_rename
                || event.action.intersects(
                    VnodeAction::READ_ATTRIBUTES
                        | VnodeAction::WRITE_ATTRIBUTES
                        | VnodeAction::READ_EXTATTRIBUTES
                        | VnodeAction::WRITE_EXTATTRIBUTES
                        | VnodeAction::READ_DATA
                        | VnodeAction::WRITE_DATA
                        | VnodeAction::EXECUTE
                        | VnodeAction::APPEND_DATA,
                )
            {
                if flags.contains(FileFlags::IS_EMPTY) {
                    // Offline blocking is broader for write- and rename-class
                    // actions: writes would be overwritten by hydration and a
                    // moved placeholder would orphan its data, while reads of
                    // an offline placeholder merely yield no contents.
                    let deny_if_offline = (is_rename && self.config.rename_detection)
                        || event.action.intersects(
                            VnodeAction::WRITE_ATTRIBUTES
                                | VnodeAction::WRITE_EXTATTRIBUTES
                                | VnodeAction::WRITE_DATA
                                | VnodeAction::APPEND_DATA
                                | VnodeAction::READ_DATA
                                | VnodeAction::READ_ATTRIBUTES
                                | VnodeAction::EXECUTE
                                | VnodeAction::READ_EXTATTRIBUTES,
                        );
                    let root = match self.resolve_root(
                        vnode,
                        vid,
                        pid,
                        CallbackPolicy::UserInitiatedOnly,
                        deny_if_offline,
                    ) {
                        RootAccess::Granted { root } => root,
                        RootAccess::Stopped { decision, .. } => return decision,
                    };
                    if !self.message_provider(
                        tracer,
                        root,
                        MessageType::HydrateFile,
                        Some(vnode.raw()),
                        None,
                        None,
                        pid,
                        &process_name,
                        &mut decision,
                    ) {
                        return decision;
                    }
                }

                if event
                    .action
                    .intersects(VnodeAction::WRITE_DATA | VnodeAction::APPEND_DATA)
                {
                    // The file is no longer empty here, but it may still be a
                    // hydrated placeholder. The provider must convert it to a
                    // full file before modifications; if the provider is
                    // offline the write would go untracked, so it is denied
                    // while the placeholder attribute is present.
                    let (granted_root, provider_offline) = match self.resolve_root(
                        vnode,
                        vid,
                        pid,
                        CallbackPolicy::UserInitiatedOnly,
                        false,
                    ) {
                        RootAccess::Granted { root } => (Some(root), false),
                        RootAccess::Stopped {
                            decision,
                            provider_offline,
                        } => {
                            if !provider_offline {
                                return decision;
                            }
                            (None, true)
                        }
                    };

                    match self.kernel.read_placeholder_attr(vnode) {
                        // No placeholder attribute: already a full file, and
                        // offline providers are no obstacle to writing it.
                        Ok(false) => return decision,
                        Ok(true) => {
                            if provider_offline {
                                return Decision::deny();
                            }
                            if let Some(root) = granted_root {
                                if !self.message_provider(
                                    tracer,
                                    root,
                                    MessageType::NotifyFilePreConvertToFull,
                                    Some(vnode.raw()),
                                    None,
                                    None,
                                    pid,
                                    &process_name,
                                    &mut decision,
                                ) {
                                    return decision;
                                }
                            }
                        }
                        Err(errno) => return Decision::deny_errno(errno),
                    }
                }
            }
        }

        if is_delete {
            // The provider must hear about the removal regardless of
            // hydration state, and after any hydration above since that may
            // have converted the file to full. Plain deletes are allowed
            // offline; rename-induced ones are not (where distinguishable).
            let root = match self.resolve_root(
                vnode,
                vid,
                pid,
                CallbackPolicy::AllowAny,
                is_rename && self.config.rename_detection,
            ) {
                RootAccess::Granted { root } => root,
                RootAccess::Stopped { decision, .. } => return decision,
            };
            let message = if is_directory {
                MessageType::NotifyDirectoryPreDelete
            } else if is_rename {
                MessageType::NotifyFilePreDeleteFromRename
            } else {
                MessageType::NotifyFilePreDelete
            };
            if !self.message_provider(
                tracer,
                root,
                message,
                Some(vnode.raw()),
                None,
                None,
                pid,
                &process_name,
                &mut decision,
            ) {
                return decision;
            }
        }

        decision
    }

    /// Cheap filters that run before the main tree: advisory checks, the
    /// in-root flag fast exit, and crawler denial.
    fn precheck_vnode_event<'a, T: EventTracer<'a>>(
        &self,
        tracer: &mut T,
        action: VnodeAction,
        vnode: VnodeIdentity,
        pid: i32,
    ) -> Precheck {
        if action.contains(VnodeAction::ACCESS) {
            // Advisory request: nothing real to gate.
            return Precheck::Stop(Decision::defer());
        }

        let flags = match self.kernel.read_file_flags(vnode) {
            Ok(flags) => flags,
            // Fail closed: without the flags nothing below can be trusted.
            Err(_errno) => return Precheck::Stop(Decision::deny_errno(libc::EBADF)),
        };

        if !flags.contains(FileFlags::IS_IN_VIRTUALIZATION_ROOT) {
            // Not part of any root; this is what keeps ordinary I/O cheap.
            return Precheck::Stop(Decision::defer());
        }

        let process_name = self.kernel.process_name(pid);

        if flags.contains(FileFlags::IS_EMPTY) && self.config.is_crawler(&process_name) {
            // Deferring would let the kernel cache an allow verdict and
            // never ask again, permanently hiding unmaterialized content
            // from the crawler. Deny so it comes back after hydration.
            tracer.denied_for_crawler();
            return Precheck::Stop(Decision::deny());
        }

        Precheck::Proceed {
            flags,
            process_name,
        }
    }

    /// Cache lookup plus the per-event policy gates on the resolved root.
    fn resolve_root(
        &self,
        vnode: VnodeIdentity,
        vid: u32,
        pid: i32,
        policy: CallbackPolicy,
        deny_if_offline: bool,
    ) -> RootAccess {
        let root = self
            .cache
            .find_root_for_vnode(self.registry.as_ref(), vnode, vid);

        if root == RootHandle::PROVIDER_TEMP_DIR {
            return RootAccess::Stopped {
                decision: Decision::defer(),
                provider_offline: false,
            };
        }
        if !root.is_valid() {
            debug!(vnode = vnode.raw(), "no root found for flagged vnode");
            return RootAccess::Stopped {
                decision: Decision::defer(),
                provider_offline: false,
            };
        }

        let provider = self.registry.active_provider(root);
        if !provider.is_online {
            let decision = if deny_if_offline && !self.registry.may_access_offline_roots(pid) {
                Decision::deny()
            } else {
                Decision::defer()
            };
            return RootAccess::Stopped {
                decision,
                provider_offline: true,
            };
        }

        if provider.pid == pid {
            // The provider's own I/O must never wait on the provider.
            return RootAccess::Stopped {
                decision: Decision::defer(),
                provider_offline: false,
            };
        }

        if policy == CallbackPolicy::UserInitiatedOnly && !self.process_may_hydrate(pid) {
            debug!(pid, "process is not allowed to hydrate");
            return RootAccess::Stopped {
                decision: Decision::deny(),
                provider_offline: false,
            };
        }

        RootAccess::Granted { root }
    }

    /// Walk the ancestor chain looking for a non-service user.
    fn process_may_hydrate(&self, pid: i32) -> bool {
        let mut current = pid;
        loop {
            if self.kernel.process_uid(current) >= self.config.service_uid_ceiling {
                return true;
            }
            let parent = self.kernel.process_parent(current);
            if parent <= 1 || parent == current {
                break;
            }
            current = parent;
        }

        // Exempted services (the code-signing validator) must hydrate even
        // without a user ancestor, or application launches would fail.
        let name = self.kernel.process_name(pid);
        self.config.is_exempt_hydrator(&name)
    }

    fn delete_is_for_rename(&self, vnode: VnodeIdentity) -> bool {
        if !self.config.rename_detection {
            // Without the will-rename notification any delete may be a
            // rename in disguise.
            return true;
        }
        self.renames.consume_for_current_thread(vnode)
    }

    /// Send one request and wait. Returns false when the caller should stop
    /// and answer with `decision`: a provider denial denies the operation,
    /// while transport failure leaves it at DEFER so I/O never hangs on a
    /// dead provider.
    #[allow(clippy::too_many_arguments)]
    fn message_provider<'a, T: EventTracer<'a>>(
        &self,
        tracer: &mut T,
        root: RootHandle,
        message_type: MessageType,
        identity: Option<u64>,
        path: Option<&str>,
        from_path: Option<&str>,
        pid: i32,
        process_name: &str,
        decision: &mut Decision,
    ) -> bool {
        tracer.provider_message(message_type);
        match self.messaging.send_request_and_wait(
            root,
            message_type,
            identity,
            path,
            from_path,
            pid,
            process_name,
        ) {
            Ok(response) => {
                let success = response.status == ResponseStatus::Success;
                tracer.provider_message_result(success);
                if success {
                    true
                } else {
                    *decision = Decision::deny_errno(if response.errno != 0 {
                        response.errno
                    } else {
                        libc::EIO
                    });
                    false
                }
            }
            Err(err) => {
                tracer.provider_message_result(false);
                warn!(
                    error = %err,
                    message = message_type.as_str(),
                    root = root.raw(),
                    "provider round-trip failed; deferring"
                );
                false
            }
        }
    }

    fn vnode_eligible(&self, vnode: VnodeIdentity) -> bool {
        if !self.registry.vnode_on_allowed_filesystem(vnode) {
            return false;
        }
        !self.kernel.vnode_type(vnode).is_ignored()
    }

    fn main_fork_of(&self, vnode: VnodeIdentity) -> VnodeRef<'_> {
        match self.kernel.named_stream_parent(vnode) {
            Some(parent) => VnodeRef::owned(self.kernel.as_ref(), parent),
            None => VnodeRef::borrowed(self.kernel.as_ref(), vnode),
        }
    }

    // --- file-operation notifications ---

    fn fileop_rename(&self, pid: i32, to_path: &str) {
        let vnode = match self.kernel.lookup_path(to_path) {
            Ok(vnode) => vnode,
            Err(errno) => {
                error!(errno, path = to_path, "rename: path lookup failed");
                return;
            }
        };
        let target = VnodeRef::owned(self.kernel.as_ref(), vnode);
        let is_directory = self.kernel.vnode_type(target.vnode()) == VnodeType::Directory;

        let Some(root) =
            self.resolve_fileop_root(target.vnode(), None, FileOpLookup::Rename, is_directory, pid)
        else {
            return;
        };

        let process_name = self.kernel.process_name(pid);
        let message = if is_directory {
            MessageType::NotifyDirectoryRenamed
        } else {
            MessageType::NotifyFileRenamed
        };
        if let Err(err) = self.messaging.send_request_and_wait(
            root,
            message,
            Some(target.vnode().raw()),
            Some(to_path),
            None,
            pid,
            &process_name,
        ) {
            warn!(error = %err, path = to_path, "rename notification failed");
        }
    }

    fn fileop_hard_link(&self, pid: i32, from_path: &str, to_path: &str) {
        let vnode = match self.kernel.lookup_path(to_path) {
            Ok(vnode) => vnode,
            Err(errno) => {
                error!(errno, path = to_path, "hard link: path lookup failed");
                return;
            }
        };
        let target = VnodeRef::owned(self.kernel.as_ref(), vnode);

        if self.kernel.vnode_type(target.vnode()) == VnodeType::Directory {
            info!(
                from = from_path,
                to = to_path,
                "hard-linked directory not handled"
            );
            return;
        }

        // Source and destination may live in different roots; each gets one
        // notification, and a shared root only gets one.
        let target_root =
            self.resolve_fileop_root(target.vnode(), None, FileOpLookup::HardLink, false, pid);
        let from_root = self.resolve_fileop_root(
            target.vnode(),
            Some(from_path),
            FileOpLookup::HardLink,
            false,
            pid,
        );
        if target_root.is_none() && from_root.is_none() {
            return;
        }

        let process_name = self.kernel.process_name(pid);

        if let Some(root) = target_root {
            // An empty from-path tells the provider the source is outside
            // its root.
            let from_arg = if from_root == Some(root) {
                from_path
            } else {
                ""
            };
            if let Err(err) = self.messaging.send_request_and_wait(
                root,
                MessageType::NotifyFileHardLinkCreated,
                Some(target.vnode().raw()),
                Some(to_path),
                Some(from_arg),
                pid,
                &process_name,
            ) {
                warn!(error = %err, root = root.raw(), "hard-link notification to destination root failed");
            }
        }

        if let Some(root) = from_root {
            if target_root != Some(root) {
                // The vnode and destination path are not in this root.
                if let Err(err) = self.messaging.send_request_and_wait(
                    root,
                    MessageType::NotifyFileHardLinkCreated,
                    None,
                    Some(""),
                    Some(from_path),
                    pid,
                    &process_name,
                ) {
                    warn!(error = %err, root = root.raw(), "hard-link notification to source root failed");
                }
            }
        }
    }

    fn fileop_open(&self, pid: i32, vnode: VnodeIdentity, path: &str) {
        if self.kernel.vnode_type(vnode) == VnodeType::Directory {
            return;
        }
        let target = self.main_fork_of(vnode);

        let flagged_in_root = match self.kernel.read_file_flags(target.vnode()) {
            Ok(flags) => flags.contains(FileFlags::IS_IN_VIRTUALIZATION_ROOT),
            Err(errno) => {
                error!(errno, path, "open: checking file flags failed");
                return;
            }
        };
        if flagged_in_root {
            // Already known to the provider; only newly created files are
            // announced.
            return;
        }

        let Some(root) =
            self.resolve_fileop_root(target.vnode(), None, FileOpLookup::Other, false, pid)
        else {
            return;
        };

        let process_name = self.kernel.process_name(pid);
        if let Err(err) = self.messaging.send_request_and_wait(
            root,
            MessageType::NotifyFileCreated,
            Some(target.vnode().raw()),
            Some(path),
            None,
            pid,
            &process_name,
        ) {
            warn!(error = %err, path, "file-created notification failed");
        }
    }

    fn fileop_close(&self, pid: i32, vnode: VnodeIdentity, path: &str, modified: bool) {
        if self.kernel.vnode_type(vnode) == VnodeType::Directory {
            return;
        }
        if !modified {
            return;
        }
        let target = self.main_fork_of(vnode);

        let Some(root) =
            self.resolve_fileop_root(target.vnode(), None, FileOpLookup::Other, false, pid)
        else {
            return;
        };

        let process_name = self.kernel.process_name(pid);
        if let Err(err) = self.messaging.send_request_and_wait(
            root,
            MessageType::NotifyFileModified,
            Some(target.vnode().raw()),
            Some(path),
            None,
            pid,
            &process_name,
        ) {
            warn!(error = %err, path, "file-modified notification failed");
        }
    }

    fn fileop_will_rename(&self, vnode: VnodeIdentity) {
        if !self.config.rename_detection {
            return;
        }
        if self.vnode_eligible(vnode) {
            // The next delete-class check on this thread belongs to this
            // rename.
            self.renames.record(vnode);
        }
    }

    /// Shared filter for file-operation events: eligibility, root
    /// resolution (path- or vnode-based), provider liveness, and the
    /// provider self-exemption.
    fn resolve_fileop_root(
        &self,
        vnode: VnodeIdentity,
        path: Option<&str>,
        lookup: FileOpLookup,
        is_directory: bool,
        pid: i32,
    ) -> Option<RootHandle> {
        if !self.vnode_eligible(vnode) {
            return None;
        }

        let root = if let Some(path) = path {
            self.registry.find_root_for_path(path)
        } else {
            let vid = self.kernel.vnode_generation(vnode);
            let registry = self.registry.as_ref();
            match lookup {
                FileOpLookup::Rename if is_directory => {
                    // The rename may have moved an entire subtree between
                    // roots; dropping the whole cache beats walking it for
                    // descendants.
                    self.cache.invalidate_all();
                    self.cache.find_root_for_vnode(registry, vnode, vid)
                }
                FileOpLookup::Rename => self.cache.refresh_root_for_vnode(registry, vnode, vid),
                FileOpLookup::HardLink => {
                    // Parent information changed; the next access must
                    // re-derive it.
                    self.cache.invalidate_root_for_vnode(registry, vnode, vid)
                }
                FileOpLookup::Other => self.cache.find_root_for_vnode(registry, vnode, vid),
            }
        };
        if !root.is_valid() {
            return None;
        }

        let provider = self.registry.active_provider(root);
        if !provider.is_online {
            return None;
        }
        if provider.pid == pid {
            // Never ask the provider to answer for its own I/O.
            return None;
        }

        Some(root)
    }
}
