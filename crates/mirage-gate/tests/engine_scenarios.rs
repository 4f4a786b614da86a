//! End-to-end engine scenarios against mock kernel, registry, and provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use mirage_gate::{
    AuthVerdict, AuthorizationEngine, FileFlags, FileOpEvent, FileOpKind, GateConfig, KernelOps,
    MessageType, ProviderMessaging, ProviderState, RootHandle, RootRegistry, VnodeAction,
    VnodeEvent, VnodeIdentity, VnodeType,
};
use mirage_ipc::{IpcError, ProviderResponse, ResponseStatus};

// --- mock kernel ---

struct MockVnode {
    vtype: VnodeType,
    vid: u32,
    flags: Result<FileFlags, i32>,
    placeholder: Result<bool, i32>,
    path: Option<String>,
    stream_parent: Option<VnodeIdentity>,
}

struct MockProcess {
    name: String,
    uid: u32,
    ppid: i32,
}

#[derive(Default)]
struct MockKernel {
    vnodes: Mutex<HashMap<u64, MockVnode>>,
    paths: Mutex<HashMap<String, VnodeIdentity>>,
    processes: Mutex<HashMap<i32, MockProcess>>,
    released: Mutex<Vec<VnodeIdentity>>,
    flag_reads: AtomicUsize,
}

impl KernelOps for MockKernel {
    fn vnode_type(&self, vnode: VnodeIdentity) -> VnodeType {
        self.vnodes
            .lock()
            .get(&vnode.raw())
            .map(|v| v.vtype)
            .unwrap_or(VnodeType::Regular)
    }

    fn vnode_generation(&self, vnode: VnodeIdentity) -> u32 {
        self.vnodes
            .lock()
            .get(&vnode.raw())
            .map(|v| v.vid)
            .unwrap_or(1)
    }

    fn vnode_path(&self, vnode: VnodeIdentity) -> Option<String> {
        self.vnodes.lock().get(&vnode.raw())?.path.clone()
    }

    fn named_stream_parent(&self, vnode: VnodeIdentity) -> Option<VnodeIdentity> {
        self.vnodes.lock().get(&vnode.raw())?.stream_parent
    }

    fn lookup_path(&self, path: &str) -> Result<VnodeIdentity, i32> {
        self.paths.lock().get(path).copied().ok_or(libc::ENOENT)
    }

    fn release_vnode(&self, vnode: VnodeIdentity) {
        self.released.lock().push(vnode);
    }

    fn read_file_flags(&self, vnode: VnodeIdentity) -> Result<FileFlags, i32> {
        self.flag_reads.fetch_add(1, Ordering::Relaxed);
        self.vnodes
            .lock()
            .get(&vnode.raw())
            .map(|v| v.flags)
            .unwrap_or(Ok(FileFlags::empty()))
    }

    fn read_placeholder_attr(&self, vnode: VnodeIdentity) -> Result<bool, i32> {
        self.vnodes
            .lock()
            .get(&vnode.raw())
            .map(|v| v.placeholder)
            .unwrap_or(Ok(false))
    }

    fn process_name(&self, pid: i32) -> String {
        self.processes
            .lock()
            .get(&pid)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "proc".to_string())
    }

    fn process_uid(&self, pid: i32) -> u32 {
        self.processes.lock().get(&pid).map(|p| p.uid).unwrap_or(501)
    }

    fn process_parent(&self, pid: i32) -> i32 {
        self.processes.lock().get(&pid).map(|p| p.ppid).unwrap_or(1)
    }
}

// --- mock registry ---

#[derive(Default)]
struct MockRegistry {
    roots: Mutex<HashMap<u64, RootHandle>>,
    path_roots: Mutex<HashMap<String, RootHandle>>,
    providers: Mutex<HashMap<i16, ProviderState>>,
    disallowed_filesystem: Mutex<Vec<VnodeIdentity>>,
    resolutions: AtomicUsize,
}

impl RootRegistry for MockRegistry {
    fn find_root_for_vnode(&self, vnode: VnodeIdentity) -> RootHandle {
        self.resolutions.fetch_add(1, Ordering::Relaxed);
        self.roots
            .lock()
            .get(&vnode.raw())
            .copied()
            .unwrap_or(RootHandle::NONE)
    }

    fn find_root_for_path(&self, path: &str) -> RootHandle {
        self.path_roots
            .lock()
            .get(path)
            .copied()
            .unwrap_or(RootHandle::NONE)
    }

    fn active_provider(&self, root: RootHandle) -> ProviderState {
        self.providers
            .lock()
            .get(&root.raw())
            .copied()
            .unwrap_or(ProviderState::OFFLINE)
    }

    fn vnode_on_allowed_filesystem(&self, vnode: VnodeIdentity) -> bool {
        !self.disallowed_filesystem.lock().contains(&vnode)
    }

    fn may_access_offline_roots(&self, _pid: i32) -> bool {
        false
    }
}

// --- mock provider messaging ---

#[derive(Debug, Clone, PartialEq)]
struct SentMessage {
    root: RootHandle,
    message_type: MessageType,
    identity: Option<u64>,
    path: Option<String>,
    from_path: Option<String>,
    pid: i32,
    process_name: String,
}

#[derive(Clone, Copy)]
enum MockAnswer {
    Success,
    Fail(i32),
    TransportError,
}

#[derive(Default)]
struct MockMessaging {
    sent: Mutex<Vec<SentMessage>>,
    answers: Mutex<HashMap<&'static str, MockAnswer>>,
    aborted: AtomicBool,
}

impl MockMessaging {
    fn answer_with(&self, message_type: MessageType, answer: MockAnswer) {
        self.answers.lock().insert(message_type.as_str(), answer);
    }

    fn sent_types(&self) -> Vec<MessageType> {
        self.sent.lock().iter().map(|m| m.message_type).collect()
    }
}

impl ProviderMessaging for MockMessaging {
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
        self.sent.lock().push(SentMessage {
            root,
            message_type,
            identity,
            path: path.map(str::to_owned),
            from_path: from_path.map(str::to_owned),
            pid,
            process_name: process_name.to_owned(),
        });
        let answer = self
            .answers
            .lock()
            .get(message_type.as_str())
            .copied()
            .unwrap_or(MockAnswer::Success);
        match answer {
            MockAnswer::Success => Ok(ProviderResponse {
                message_id: 1,
                status: ResponseStatus::Success,
                errno: 0,
            }),
            MockAnswer::Fail(errno) => Ok(ProviderResponse {
                message_id: 1,
                status: ResponseStatus::Fail,
                errno,
            }),
            MockAnswer::TransportError => Err(IpcError::Aborted),
        }
    }

    fn abort_all_outstanding(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

// --- harness ---

struct Harness {
    kernel: Arc<MockKernel>,
    registry: Arc<MockRegistry>,
    messaging: Arc<MockMessaging>,
    engine: AuthorizationEngine,
}

const PROVIDER_PID: i32 = 999;
const USER_PID: i32 = 100;
const ROOT: i16 = 2;

impl Harness {
    fn new() -> Self {
        Self::with_config(GateConfig::default())
    }

    fn with_config(config: GateConfig) -> Self {
        let kernel = Arc::new(MockKernel::default());
        let registry = Arc::new(MockRegistry::default());
        let messaging = Arc::new(MockMessaging::default());
        let engine = AuthorizationEngine::new(
            config,
            kernel.clone(),
            registry.clone(),
            messaging.clone(),
        )
        .unwrap();

        let harness = Harness {
            kernel,
            registry,
            messaging,
            engine,
        };
        harness.set_provider(ROOT, PROVIDER_PID, true);
        harness.add_process(USER_PID, "cat", 501, 1);
        harness
    }

    fn add_vnode(&self, raw: u64, vtype: VnodeType, flags: FileFlags) -> VnodeIdentity {
        let identity = VnodeIdentity::from_raw(raw);
        self.kernel.vnodes.lock().insert(
            raw,
            MockVnode {
                vtype,
                vid: 1,
                flags: Ok(flags),
                placeholder: Ok(false),
                path: None,
                stream_parent: None,
            },
        );
        self.registry
            .roots
            .lock()
            .insert(raw, RootHandle::from_raw(ROOT));
        identity
    }

    fn add_file(&self, raw: u64, flags: FileFlags) -> VnodeIdentity {
        self.add_vnode(raw, VnodeType::Regular, flags)
    }

    fn add_dir(&self, raw: u64, flags: FileFlags) -> VnodeIdentity {
        self.add_vnode(raw, VnodeType::Directory, flags)
    }

    fn set_provider(&self, root: i16, pid: i32, is_online: bool) {
        self.registry
            .providers
            .lock()
            .insert(root, ProviderState { pid, is_online });
    }

    fn add_process(&self, pid: i32, name: &str, uid: u32, ppid: i32) {
        self.kernel.processes.lock().insert(
            pid,
            MockProcess {
                name: name.to_string(),
                uid,
                ppid,
            },
        );
    }

    fn vnode_event(&self, vnode: VnodeIdentity, action: VnodeAction, pid: i32) -> AuthVerdict {
        self.engine
            .handle_vnode_event(&VnodeEvent { vnode, action, pid })
            .verdict
    }
}

fn in_root() -> FileFlags {
    FileFlags::IS_IN_VIRTUALIZATION_ROOT
}

fn empty_in_root() -> FileFlags {
    FileFlags::IS_IN_VIRTUALIZATION_ROOT | FileFlags::IS_EMPTY
}

// --- vnode operation scenarios ---

#[test]
fn read_on_empty_file_hydrates_through_cached_root() {
    let h = Harness::new();
    let file = h.add_file(0x1000, in_root());

    // Warm the cache: a write to a full file resolves the root but needs no
    // provider round-trip.
    assert_eq!(
        h.vnode_event(file, VnodeAction::WRITE_DATA, USER_PID),
        AuthVerdict::Defer
    );
    let warm = h.engine.health_snapshot();
    assert_eq!(warm.find_root_misses, 1);
    assert!(h.messaging.sent.lock().is_empty());

    // Flag it empty: the next read must hydrate via the cached root.
    h.kernel.vnodes.lock().get_mut(&0x1000).unwrap().flags = Ok(empty_in_root());
    assert_eq!(
        h.vnode_event(file, VnodeAction::READ_DATA, USER_PID),
        AuthVerdict::Defer
    );

    let sent = h.messaging.sent.lock();
    let hydrations: Vec<_> = sent
        .iter()
        .filter(|m| m.message_type == MessageType::HydrateFile)
        .collect();
    assert_eq!(hydrations.len(), 1);
    assert_eq!(hydrations[0].root, RootHandle::from_raw(ROOT));
    assert_eq!(hydrations[0].identity, Some(0x1000));
    assert_eq!(hydrations[0].pid, USER_PID);
    assert_eq!(hydrations[0].process_name, "cat");

    let health = h.engine.health_snapshot();
    assert_eq!(health.find_root_hits, 1);
    assert_eq!(health.find_root_misses, 1);
}

#[test]
fn crawler_is_denied_on_unmaterialized_object() {
    let h = Harness::new();
    let file = h.add_file(0x1000, empty_in_root());
    h.add_process(300, "mdworker", 501, 1);

    assert_eq!(
        h.vnode_event(file, VnodeAction::READ_DATA, 300),
        AuthVerdict::Deny
    );
    assert!(h.messaging.sent.lock().is_empty());
}

#[test]
fn crawler_may_read_hydrated_object() {
    let h = Harness::new();
    let file = h.add_file(0x1000, in_root());
    h.add_process(300, "mdworker", 501, 1);

    assert_eq!(
        h.vnode_event(file, VnodeAction::READ_DATA, 300),
        AuthVerdict::Defer
    );
    assert!(h.messaging.sent.lock().is_empty());
}

#[test]
fn provider_never_waits_on_itself() {
    let h = Harness::new();
    let file = h.add_file(0x1000, empty_in_root());
    h.add_process(PROVIDER_PID, "provider", 501, 1);

    for action in [
        VnodeAction::READ_DATA,
        VnodeAction::WRITE_DATA,
        VnodeAction::DELETE,
        VnodeAction::READ_ATTRIBUTES | VnodeAction::EXECUTE,
    ] {
        assert_eq!(h.vnode_event(file, action, PROVIDER_PID), AuthVerdict::Defer);
    }
    assert!(h.messaging.sent.lock().is_empty());
}

#[test]
fn object_outside_any_root_exits_before_resolution() {
    let h = Harness::new();
    let file = h.add_file(0x1000, FileFlags::empty());

    assert_eq!(
        h.vnode_event(file, VnodeAction::READ_DATA, USER_PID),
        AuthVerdict::Defer
    );
    assert_eq!(h.registry.resolutions.load(Ordering::Relaxed), 0);
    assert!(h.messaging.sent.lock().is_empty());
}

#[test]
fn advisory_check_short_circuits_before_attribute_reads() {
    let h = Harness::new();
    let file = h.add_file(0x1000, empty_in_root());

    assert_eq!(
        h.vnode_event(file, VnodeAction::ACCESS | VnodeAction::READ_DATA, USER_PID),
        AuthVerdict::Defer
    );
    assert_eq!(h.kernel.flag_reads.load(Ordering::Relaxed), 0);
    assert!(h.messaging.sent.lock().is_empty());
}

#[test]
fn attribute_read_failure_fails_closed() {
    let h = Harness::new();
    let file = h.add_file(0x1000, in_root());
    h.kernel.vnodes.lock().get_mut(&0x1000).unwrap().flags = Err(libc::EIO);

    let decision = h.engine.handle_vnode_event(&VnodeEvent {
        vnode: file,
        action: VnodeAction::READ_DATA,
        pid: USER_PID,
    });
    assert_eq!(decision.verdict, AuthVerdict::Deny);
    assert_eq!(decision.errno, Some(libc::EBADF));
}

#[test]
fn ignored_vnode_types_are_filtered_cheaply() {
    let h = Harness::new();
    let socket = h.add_vnode(0x1000, VnodeType::Socket, empty_in_root());

    assert_eq!(
        h.vnode_event(socket, VnodeAction::READ_DATA, USER_PID),
        AuthVerdict::Defer
    );
    assert_eq!(h.kernel.flag_reads.load(Ordering::Relaxed), 0);
}

#[test]
fn disallowed_filesystem_is_filtered_cheaply() {
    let h = Harness::new();
    let file = h.add_file(0x1000, empty_in_root());
    h.registry.disallowed_filesystem.lock().push(file);

    assert_eq!(
        h.vnode_event(file, VnodeAction::READ_DATA, USER_PID),
        AuthVerdict::Defer
    );
    assert_eq!(h.kernel.flag_reads.load(Ordering::Relaxed), 0);
}

// --- rename disambiguation ---

#[test]
fn will_rename_then_delete_is_rename_induced() {
    let h = Harness::new();
    let file = h.add_file(0x1000, in_root());

    h.engine.handle_fileop_event(&FileOpEvent {
        pid: USER_PID,
        kind: FileOpKind::WillRename { vnode: file },
    });
    assert_eq!(
        h.vnode_event(file, VnodeAction::DELETE, USER_PID),
        AuthVerdict::Defer
    );

    assert_eq!(
        h.messaging.sent_types(),
        vec![MessageType::NotifyFilePreDeleteFromRename]
    );

    // The record was consumed: the next delete is a plain one.
    assert_eq!(
        h.vnode_event(file, VnodeAction::DELETE, USER_PID),
        AuthVerdict::Defer
    );
    assert_eq!(
        h.messaging.sent_types(),
        vec![
            MessageType::NotifyFilePreDeleteFromRename,
            MessageType::NotifyFilePreDelete,
        ]
    );
}

#[test]
fn another_threads_rename_record_is_not_consumed() {
    let h = Arc::new(Harness::new());
    let file = h.add_file(0x1000, in_root());

    let remote = h.clone();
    std::thread::spawn(move || {
        remote.engine.handle_fileop_event(&FileOpEvent {
            pid: USER_PID,
            kind: FileOpKind::WillRename { vnode: file },
        });
    })
    .join()
    .unwrap();

    // This thread's delete does not belong to that rename.
    assert_eq!(
        h.vnode_event(file, VnodeAction::DELETE, USER_PID),
        AuthVerdict::Defer
    );
    assert_eq!(
        h.messaging.sent_types(),
        vec![MessageType::NotifyFilePreDelete]
    );
}

#[test]
fn without_rename_detection_every_delete_is_a_possible_rename() {
    let config = GateConfig {
        rename_detection: false,
        ..GateConfig::default()
    };
    let h = Harness::with_config(config);
    let file = h.add_file(0x1000, in_root());

    assert_eq!(
        h.vnode_event(file, VnodeAction::DELETE, USER_PID),
        AuthVerdict::Defer
    );
    assert_eq!(
        h.messaging.sent_types(),
        vec![MessageType::NotifyFilePreDeleteFromRename]
    );
}

#[test]
fn rename_induced_delete_is_blocked_offline() {
    let h = Harness::new();
    let file = h.add_file(0x1000, in_root());
    h.set_provider(ROOT, PROVIDER_PID, false);

    h.engine.handle_fileop_event(&FileOpEvent {
        pid: USER_PID,
        kind: FileOpKind::WillRename { vnode: file },
    });
    assert_eq!(
        h.vnode_event(file, VnodeAction::DELETE, USER_PID),
        AuthVerdict::Deny
    );

    // A plain delete is still permitted while offline.
    assert_eq!(
        h.vnode_event(file, VnodeAction::DELETE, USER_PID),
        AuthVerdict::Defer
    );
}

// --- directory handling ---

#[test]
fn empty_directory_enumeration_messages_provider() {
    let h = Harness::new();
    let dir = h.add_dir(0x2000, empty_in_root());

    assert_eq!(
        h.vnode_event(dir, VnodeAction::LIST_DIRECTORY, USER_PID),
        AuthVerdict::Defer
    );
    assert_eq!(
        h.messaging.sent_types(),
        vec![MessageType::EnumerateDirectory]
    );
}

#[test]
fn directory_rename_expands_recursively_before_delete_notice() {
    let h = Harness::new();
    let dir = h.add_dir(0x2000, in_root());

    h.engine.handle_fileop_event(&FileOpEvent {
        pid: USER_PID,
        kind: FileOpKind::WillRename { vnode: dir },
    });
    assert_eq!(
        h.vnode_event(dir, VnodeAction::DELETE, USER_PID),
        AuthVerdict::Defer
    );

    assert_eq!(
        h.messaging.sent_types(),
        vec![
            MessageType::RecursivelyEnumerateDirectory,
            MessageType::NotifyDirectoryPreDelete,
        ]
    );
}

#[test]
fn adding_content_to_offline_root_is_denied() {
    let h = Harness::new();
    let dir = h.add_dir(0x2000, in_root());
    h.set_provider(ROOT, PROVIDER_PID, false);

    assert_eq!(
        h.vnode_event(dir, VnodeAction::ADD_FILE, USER_PID),
        AuthVerdict::Deny
    );
    assert!(h.messaging.sent.lock().is_empty());
}

#[test]
fn materialized_directory_enumeration_needs_no_provider() {
    let h = Harness::new();
    let dir = h.add_dir(0x2000, in_root());

    assert_eq!(
        h.vnode_event(dir, VnodeAction::LIST_DIRECTORY, USER_PID),
        AuthVerdict::Defer
    );
    assert!(h.messaging.sent.lock().is_empty());
}

// --- placeholder write handling ---

#[test]
fn write_to_placeholder_sends_pre_convert() {
    let h = Harness::new();
    let file = h.add_file(0x1000, in_root());
    h.kernel.vnodes.lock().get_mut(&0x1000).unwrap().placeholder = Ok(true);

    assert_eq!(
        h.vnode_event(file, VnodeAction::WRITE_DATA, USER_PID),
        AuthVerdict::Defer
    );
    assert_eq!(
        h.messaging.sent_types(),
        vec![MessageType::NotifyFilePreConvertToFull]
    );
}

#[test]
fn write_to_placeholder_is_denied_offline() {
    let h = Harness::new();
    let file = h.add_file(0x1000, in_root());
    h.kernel.vnodes.lock().get_mut(&0x1000).unwrap().placeholder = Ok(true);
    h.set_provider(ROOT, PROVIDER_PID, false);

    assert_eq!(
        h.vnode_event(file, VnodeAction::WRITE_DATA, USER_PID),
        AuthVerdict::Deny
    );
    assert!(h.messaging.sent.lock().is_empty());
}

#[test]
fn write_to_full_file_is_allowed_offline() {
    let h = Harness::new();
    let file = h.add_file(0x1000, in_root());
    h.set_provider(ROOT, PROVIDER_PID, false);

    assert_eq!(
        h.vnode_event(file, VnodeAction::WRITE_DATA, USER_PID),
        AuthVerdict::Defer
    );
    assert!(h.messaging.sent.lock().is_empty());
}

#[test]
fn placeholder_attribute_read_failure_fails_closed() {
    let h = Harness::new();
    let file = h.add_file(0x1000, in_root());
    h.kernel.vnodes.lock().get_mut(&0x1000).unwrap().placeholder = Err(libc::EIO);

    let decision = h.engine.handle_vnode_event(&VnodeEvent {
        vnode: file,
        action: VnodeAction::WRITE_DATA,
        pid: USER_PID,
    });
    assert_eq!(decision.verdict, AuthVerdict::Deny);
    assert_eq!(decision.errno, Some(libc::EIO));
}

// --- hydration policy ---

#[test]
fn system_service_may_not_trigger_hydration() {
    let h = Harness::new();
    let file = h.add_file(0x1000, empty_in_root());
    h.add_process(200, "searchd", 0, 1);

    assert_eq!(
        h.vnode_event(file, VnodeAction::READ_DATA, 200),
        AuthVerdict::Deny
    );
    assert!(h.messaging.sent.lock().is_empty());
}

#[test]
fn service_with_user_ancestor_may_hydrate() {
    let h = Harness::new();
    let file = h.add_file(0x1000, empty_in_root());
    // A helper forked from a user session: its parent runs as a real user.
    h.add_process(201, "helper", 0, 202);
    h.add_process(202, "Terminal", 501, 1);

    assert_eq!(
        h.vnode_event(file, VnodeAction::READ_DATA, 201),
        AuthVerdict::Defer
    );
    assert_eq!(h.messaging.sent_types(), vec![MessageType::HydrateFile]);
}

#[test]
fn code_signing_validator_is_exempt() {
    let h = Harness::new();
    let file = h.add_file(0x1000, empty_in_root());
    h.add_process(203, "amfid", 0, 1);

    assert_eq!(
        h.vnode_event(file, VnodeAction::READ_DATA, 203),
        AuthVerdict::Defer
    );
    assert_eq!(h.messaging.sent_types(), vec![MessageType::HydrateFile]);
}

#[test]
fn offline_hydration_for_reads_is_denied() {
    let h = Harness::new();
    let file = h.add_file(0x1000, empty_in_root());
    h.set_provider(ROOT, PROVIDER_PID, false);

    assert_eq!(
        h.vnode_event(file, VnodeAction::READ_DATA, USER_PID),
        AuthVerdict::Deny
    );
}

// --- provider failure semantics ---

#[test]
fn transport_failure_degrades_to_defer() {
    let h = Harness::new();
    let file = h.add_file(0x1000, empty_in_root());
    h.messaging
        .answer_with(MessageType::HydrateFile, MockAnswer::TransportError);

    assert_eq!(
        h.vnode_event(file, VnodeAction::READ_DATA, USER_PID),
        AuthVerdict::Defer
    );
}

#[test]
fn provider_denial_denies_with_its_errno() {
    let h = Harness::new();
    let file = h.add_file(0x1000, empty_in_root());
    h.messaging
        .answer_with(MessageType::HydrateFile, MockAnswer::Fail(libc::EACCES));

    let decision = h.engine.handle_vnode_event(&VnodeEvent {
        vnode: file,
        action: VnodeAction::READ_DATA,
        pid: USER_PID,
    });
    assert_eq!(decision.verdict, AuthVerdict::Deny);
    assert_eq!(decision.errno, Some(libc::EACCES));
}

// --- named streams ---

#[test]
fn named_stream_event_applies_to_main_fork_and_releases_it() {
    let h = Harness::new();
    let main = h.add_file(0x1000, empty_in_root());
    let stream = h.add_file(0x1040, FileFlags::empty());
    h.kernel
        .vnodes
        .lock()
        .get_mut(&0x1040)
        .unwrap()
        .stream_parent = Some(main);

    assert_eq!(
        h.vnode_event(stream, VnodeAction::READ_DATA, USER_PID),
        AuthVerdict::Defer
    );
    // Hydration targeted the main fork, and its extra reference was dropped.
    let sent = h.messaging.sent.lock();
    assert_eq!(sent[0].identity, Some(0x1000));
    assert_eq!(h.kernel.released.lock().as_slice(), &[main]);
}

// --- file-operation notifications ---

#[test]
fn directory_rename_invalidates_whole_cache() {
    let h = Harness::new();
    let file = h.add_file(0x1000, in_root());
    let dir = h.add_dir(0x2000, in_root());
    h.kernel
        .paths
        .lock()
        .insert("/mirage/dst".to_string(), dir);

    // Prime the cache.
    h.vnode_event(file, VnodeAction::WRITE_DATA, USER_PID);
    assert_eq!(h.engine.health_snapshot().cache_entries, 1);

    h.engine.handle_fileop_event(&FileOpEvent {
        pid: USER_PID,
        kind: FileOpKind::Rename {
            from_path: "/mirage/src",
            to_path: "/mirage/dst",
        },
    });

    let health = h.engine.health_snapshot();
    assert_eq!(health.invalidate_entire_cache_count, 1);
    assert_eq!(
        h.messaging.sent_types(),
        vec![MessageType::NotifyDirectoryRenamed]
    );
    // Only the renamed directory itself was re-cached.
    assert_eq!(health.cache_entries, 1);
}

#[test]
fn file_rename_refreshes_entry_without_full_invalidation() {
    let h = Harness::new();
    let file = h.add_file(0x1000, in_root());
    h.kernel
        .paths
        .lock()
        .insert("/mirage/file".to_string(), file);

    h.engine.handle_fileop_event(&FileOpEvent {
        pid: USER_PID,
        kind: FileOpKind::Rename {
            from_path: "/mirage/old",
            to_path: "/mirage/file",
        },
    });

    let health = h.engine.health_snapshot();
    assert_eq!(health.invalidate_entire_cache_count, 0);
    assert_eq!(health.refresh_count, 1);
    assert_eq!(
        h.messaging.sent_types(),
        vec![MessageType::NotifyFileRenamed]
    );
}

#[test]
fn hard_link_across_roots_notifies_both_providers_once() {
    let h = Harness::new();
    let file = h.add_file(0x1000, in_root());
    h.kernel
        .paths
        .lock()
        .insert("/mirage/link".to_string(), file);
    // The source path resolves to a different root with its own provider.
    h.registry
        .path_roots
        .lock()
        .insert("/other/src".to_string(), RootHandle::from_raw(7));
    h.set_provider(7, 998, true);

    h.engine.handle_fileop_event(&FileOpEvent {
        pid: USER_PID,
        kind: FileOpKind::HardLink {
            from_path: "/other/src",
            to_path: "/mirage/link",
        },
    });

    let sent = h.messaging.sent.lock();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].message_type, MessageType::NotifyFileHardLinkCreated);
    assert_eq!(sent[0].root, RootHandle::from_raw(ROOT));
    // Source is outside the destination root, signalled by "".
    assert_eq!(sent[0].from_path.as_deref(), Some(""));
    assert_eq!(sent[1].root, RootHandle::from_raw(7));
    assert_eq!(sent[1].path.as_deref(), Some(""));
    assert_eq!(sent[1].from_path.as_deref(), Some("/other/src"));

    assert_eq!(h.engine.health_snapshot().invalidate_entry_count, 1);
}

#[test]
fn hard_link_within_one_root_notifies_once() {
    let h = Harness::new();
    let file = h.add_file(0x1000, in_root());
    h.kernel
        .paths
        .lock()
        .insert("/mirage/link".to_string(), file);
    h.registry
        .path_roots
        .lock()
        .insert("/mirage/src".to_string(), RootHandle::from_raw(ROOT));

    h.engine.handle_fileop_event(&FileOpEvent {
        pid: USER_PID,
        kind: FileOpKind::HardLink {
            from_path: "/mirage/src",
            to_path: "/mirage/link",
        },
    });

    let sent = h.messaging.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].from_path.as_deref(), Some("/mirage/src"));
}

#[test]
fn open_of_unflagged_file_announces_creation() {
    let h = Harness::new();
    let file = h.add_file(0x1000, FileFlags::empty());

    h.engine.handle_fileop_event(&FileOpEvent {
        pid: USER_PID,
        kind: FileOpKind::Open {
            vnode: file,
            path: "/mirage/new",
        },
    });

    let sent = h.messaging.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_type, MessageType::NotifyFileCreated);
    assert_eq!(sent[0].path.as_deref(), Some("/mirage/new"));
}

#[test]
fn open_of_flagged_file_is_silent() {
    let h = Harness::new();
    let file = h.add_file(0x1000, in_root());

    h.engine.handle_fileop_event(&FileOpEvent {
        pid: USER_PID,
        kind: FileOpKind::Open {
            vnode: file,
            path: "/mirage/known",
        },
    });
    assert!(h.messaging.sent.lock().is_empty());
}

#[test]
fn close_reports_modified_files_only() {
    let h = Harness::new();
    let file = h.add_file(0x1000, in_root());

    h.engine.handle_fileop_event(&FileOpEvent {
        pid: USER_PID,
        kind: FileOpKind::Close {
            vnode: file,
            path: "/mirage/file",
            modified: false,
        },
    });
    assert!(h.messaging.sent.lock().is_empty());

    h.engine.handle_fileop_event(&FileOpEvent {
        pid: USER_PID,
        kind: FileOpKind::Close {
            vnode: file,
            path: "/mirage/file",
            modified: true,
        },
    });
    assert_eq!(
        h.messaging.sent_types(),
        vec![MessageType::NotifyFileModified]
    );
}

#[test]
fn fileop_from_provider_itself_is_ignored() {
    let h = Harness::new();
    let file = h.add_file(0x1000, in_root());

    h.engine.handle_fileop_event(&FileOpEvent {
        pid: PROVIDER_PID,
        kind: FileOpKind::Close {
            vnode: file,
            path: "/mirage/file",
            modified: true,
        },
    });
    assert!(h.messaging.sent.lock().is_empty());
}

// --- lifecycle ---

#[test]
fn shutdown_aborts_messaging_and_rejects_new_events() {
    let h = Harness::new();
    let file = h.add_file(0x1000, empty_in_root());

    h.engine.shutdown();
    assert!(h.messaging.aborted.load(Ordering::SeqCst));

    assert_eq!(
        h.vnode_event(file, VnodeAction::READ_DATA, USER_PID),
        AuthVerdict::Defer
    );
    assert!(h.messaging.sent.lock().is_empty());
}
