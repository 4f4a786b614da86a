//! Pending-rename tracking.
//!
//! The kernel delivers a will-rename notification, then a delete-class
//! authorization check on the same thread as part of carrying out the
//! rename. Recording the notification lets the delete check classify itself
//! as rename-induced instead of a true delete. At most one record exists per
//! thread at a time.

use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::warn;

use crate::vnode::VnodeIdentity;

const INITIAL_PENDING_RENAMES: usize = 8;

#[derive(Debug, Clone, Copy)]
struct PendingRename {
    thread: ThreadId,
    vnode: VnodeIdentity,
}

#[derive(Debug)]
pub struct PendingRenameTracker {
    records: Mutex<Vec<PendingRename>>,
}

impl Default for PendingRenameTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRenameTracker {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::with_capacity(INITIAL_PENDING_RENAMES)),
        }
    }

    /// Record an in-flight rename of `vnode` on the calling thread. Storage
    /// grows geometrically; a dropped record would misclassify the rename as
    /// a plain delete, so this never fails silently.
    pub fn record(&self, vnode: VnodeIdentity) {
        let thread = thread::current().id();
        let mut records = self.records.lock();
        debug_assert!(
            !records.iter().any(|r| r.thread == thread),
            "thread already has a pending rename"
        );
        records.push(PendingRename { thread, vnode });
        if records.len() > 2 * INITIAL_PENDING_RENAMES {
            warn!(
                pending = records.len(),
                "pending rename table unusually large"
            );
        }
    }

    /// Remove the calling thread's record, if any. The identity must match
    /// the recorded one: the delete check fires for the object named in the
    /// will-rename notification.
    pub fn consume_for_current_thread(&self, vnode: VnodeIdentity) -> bool {
        let thread = thread::current().id();
        let mut records = self.records.lock();
        match records.iter().position(|r| r.thread == thread) {
            Some(position) => {
                debug_assert_eq!(records[position].vnode, vnode);
                records.swap_remove(position);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Teardown check: every recorded rename must have been consumed.
    pub fn drain(&self) {
        let mut records = self.records.lock();
        debug_assert!(records.is_empty(), "pending renames left at teardown");
        records.clear();
    }
}
