//! Synchronous request/response correlation.
//!
//! A thread sending a request blocks inside [`ProviderMessenger::send_and_wait`]
//! until the transport reader feeds the matching response back through
//! [`ProviderMessenger::complete`], or until the wait is aborted. Aborting is
//! how provider death and module unload are tolerated: every blocked thread
//! wakes with [`IpcError::Aborted`] and its operation proceeds un-hydrated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::{
    IpcError, MessageType, ProviderRequest, ProviderResponse, Result, RootHandle,
};

/// Outbound half of a provider connection.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, request: &ProviderRequest) -> Result<()>;
}

enum WaitState {
    Waiting,
    Done(ProviderResponse),
    Aborted,
}

struct Pending {
    root: RootHandle,
    state: WaitState,
}

/// Correlates synchronous provider round-trips.
pub struct ProviderMessenger {
    sink: Arc<dyn MessageSink>,
    next_message_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    completed: Condvar,
    shutting_down: AtomicBool,
    response_timeout: Option<Duration>,
}

impl ProviderMessenger {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self::with_timeout(sink, None)
    }

    /// A messenger whose waits give up after `timeout`. `None` waits until
    /// completion or abort, matching the kernel original.
    pub fn with_timeout(sink: Arc<dyn MessageSink>, timeout: Option<Duration>) -> Self {
        Self {
            sink,
            next_message_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            completed: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            response_timeout: timeout,
        }
    }

    /// Send one request and block until the provider answers.
    #[allow(clippy::too_many_arguments)]
    pub fn send_and_wait(
        &self,
        root: RootHandle,
        message_type: MessageType,
        identity: Option<u64>,
        path: Option<&str>,
        from_path: Option<&str>,
        pid: i32,
        process_name: &str,
    ) -> Result<ProviderResponse> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(IpcError::Aborted);
        }

        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let request = ProviderRequest {
            message_id,
            message_type,
            root,
            identity,
            path: path.map(str::to_owned),
            from_path: from_path.map(str::to_owned),
            pid,
            process_name: process_name.to_owned(),
        };

        self.pending.lock().insert(
            message_id,
            Pending {
                root,
                state: WaitState::Waiting,
            },
        );

        if let Err(err) = self.sink.deliver(&request) {
            self.pending.lock().remove(&message_id);
            return Err(err);
        }

        enum Outcome {
            Ready(ProviderResponse),
            Aborted,
            NotYet,
            Missing,
        }

        let mut pending = self.pending.lock();
        loop {
            let outcome = match pending.get_mut(&message_id) {
                Some(entry) => match std::mem::replace(&mut entry.state, WaitState::Waiting) {
                    WaitState::Done(response) => Outcome::Ready(response),
                    WaitState::Aborted => Outcome::Aborted,
                    WaitState::Waiting => Outcome::NotYet,
                },
                None => Outcome::Missing,
            };
            match outcome {
                Outcome::Ready(response) => {
                    pending.remove(&message_id);
                    return Ok(response);
                }
                Outcome::Aborted => {
                    pending.remove(&message_id);
                    return Err(IpcError::Aborted);
                }
                Outcome::NotYet => {}
                Outcome::Missing => return Err(IpcError::ProtocolMismatch { message_id }),
            }

            match self.response_timeout {
                Some(timeout) => {
                    let timed_out = self.completed.wait_for(&mut pending, timeout).timed_out();
                    let still_waiting = matches!(
                        pending.get(&message_id).map(|p| &p.state),
                        Some(WaitState::Waiting)
                    );
                    if timed_out && still_waiting {
                        pending.remove(&message_id);
                        return Err(IpcError::TimedOut);
                    }
                }
                None => self.completed.wait(&mut pending),
            }
        }
    }

    /// Deliver a response from the transport. Returns false for a response
    /// nothing is waiting on (late arrival after timeout or abort).
    pub fn complete(&self, response: ProviderResponse) -> bool {
        let mut pending = self.pending.lock();
        match pending.get_mut(&response.message_id) {
            Some(entry) if matches!(entry.state, WaitState::Waiting) => {
                entry.state = WaitState::Done(response);
                self.completed.notify_all();
                true
            }
            _ => {
                warn!(
                    message_id = response.message_id,
                    "dropping response with no waiting thread"
                );
                false
            }
        }
    }

    /// Fail every outstanding wait for one root (provider disconnect).
    pub fn abort_outstanding_for_root(&self, root: RootHandle) {
        let mut pending = self.pending.lock();
        for entry in pending.values_mut() {
            if entry.root == root && matches!(entry.state, WaitState::Waiting) {
                entry.state = WaitState::Aborted;
            }
        }
        self.completed.notify_all();
    }

    /// Fail every outstanding wait and refuse new sends (module unload).
    pub fn abort_all_outstanding(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let mut pending = self.pending.lock();
        for entry in pending.values_mut() {
            if matches!(entry.state, WaitState::Waiting) {
                entry.state = WaitState::Aborted;
            }
        }
        self.completed.notify_all();
    }

    /// Number of requests currently awaiting a response.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }
}
