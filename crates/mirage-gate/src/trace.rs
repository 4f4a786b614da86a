//! Event tracing strategy.
//!
//! Tracing mirrors every decision point with human-readable log lines, but
//! must cost nothing when disabled. The engine monomorphizes its event
//! handler over an [`EventTracer`] implementation and picks one per event
//! dispatch: [`NullTracer`] (every method an empty inline body) in
//! production, [`LogTracer`] when the trace surface has been enabled.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::info;

use mirage_ipc::MessageType;

use crate::engine::{AuthVerdict, VnodeEvent};
use crate::vnode::{KernelOps, VnodeAction, VnodeType};

/// Runtime-settable trace filters.
#[derive(Debug, Clone)]
pub struct TraceSettings {
    /// Only trace objects whose path starts with this prefix.
    pub path_prefix_filter: Option<String>,
    /// Only trace events whose action intersects this mask.
    pub vnode_action_filter_mask: VnodeAction,
    /// Emit only events that ended in denial.
    pub trace_denied_events: bool,
    /// Emit events that reached a provider round-trip.
    pub trace_provider_messaging_events: bool,
    /// Emit everything passing the filters above.
    pub trace_all_events: bool,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            path_prefix_filter: None,
            vnode_action_filter_mask: VnodeAction::all(),
            trace_denied_events: false,
            trace_provider_messaging_events: false,
            trace_all_events: false,
        }
    }
}

/// Shared trace state; the enabled flag is the only thing the hot path reads.
#[derive(Debug, Default)]
pub struct TraceControl {
    enabled: AtomicBool,
    next_trace_index: AtomicU64,
    settings: RwLock<TraceSettings>,
}

impl TraceControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self, settings: TraceSettings) {
        *self.settings.write() = settings;
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn settings(&self) -> TraceSettings {
        self.settings.read().clone()
    }

    fn next_index(&self) -> u64 {
        self.next_trace_index.fetch_add(1, Ordering::Relaxed)
    }
}

/// One tracer accompanies one authorization event.
pub trait EventTracer<'a>: Sized {
    fn begin_vnode(control: &'a TraceControl, kernel: &dyn KernelOps, event: &VnodeEvent) -> Self;

    fn provider_message(&mut self, message: MessageType);

    fn provider_message_result(&mut self, success: bool);

    fn denied_for_crawler(&mut self);

    fn vnode_result(&mut self, verdict: AuthVerdict);
}

/// Production tracer: compiles to nothing.
pub struct NullTracer;

impl<'a> EventTracer<'a> for NullTracer {
    #[inline(always)]
    fn begin_vnode(
        _control: &'a TraceControl,
        _kernel: &dyn KernelOps,
        _event: &VnodeEvent,
    ) -> Self {
        NullTracer
    }

    #[inline(always)]
    fn provider_message(&mut self, _message: MessageType) {}

    #[inline(always)]
    fn provider_message_result(&mut self, _success: bool) {}

    #[inline(always)]
    fn denied_for_crawler(&mut self) {}

    #[inline(always)]
    fn vnode_result(&mut self, _verdict: AuthVerdict) {}
}

/// Buffering tracer that emits one structured line per traced event.
pub struct LogTracer {
    discarded: bool,
    will_emit: bool,
    trace_denied: bool,
    trace_provider_messaging: bool,
    trace_all: bool,
    index: u64,
    buffer: String,
}

impl LogTracer {
    fn append(&mut self, text: &str) {
        if !self.discarded {
            self.buffer.push_str(text);
        }
    }

    fn flush(&mut self) {
        if !self.discarded && self.will_emit && !self.buffer.is_empty() {
            info!(target: "mirage_gate::trace", index = self.index, "{}", self.buffer);
            self.buffer.clear();
        }
    }
}

impl<'a> EventTracer<'a> for LogTracer {
    fn begin_vnode(control: &'a TraceControl, kernel: &dyn KernelOps, event: &VnodeEvent) -> Self {
        let settings = control.settings();
        let mut tracer = LogTracer {
            discarded: false,
            will_emit: settings.trace_all_events,
            trace_denied: settings.trace_denied_events,
            trace_provider_messaging: settings.trace_provider_messaging_events,
            trace_all: settings.trace_all_events,
            index: 0,
            buffer: String::new(),
        };

        if !settings.vnode_action_filter_mask.intersects(event.action) {
            tracer.discarded = true;
            return tracer;
        }

        let path = kernel.vnode_path(event.vnode);
        if let Some(prefix) = &settings.path_prefix_filter {
            let matches_prefix = path.as_deref().is_some_and(|p| p.starts_with(prefix.as_str()));
            if !matches_prefix {
                tracer.discarded = true;
                return tracer;
            }
        }

        tracer.index = control.next_index();
        let kind = if kernel.vnode_type(event.vnode) == VnodeType::Directory {
            "Directory"
        } else {
            "File"
        };
        let process_name = kernel.process_name(event.pid);
        tracer.append(&format!(
            "{} vnode '{}' event by process '{}' (PID = {}) actions {:?}",
            kind,
            path.as_deref().unwrap_or("[unknown path]"),
            process_name,
            event.pid,
            event.action,
        ));
        tracer
    }

    fn provider_message(&mut self, message: MessageType) {
        if self.discarded {
            return;
        }
        if !self.will_emit && self.trace_provider_messaging {
            self.will_emit = true;
        }
        self.append(&format!("\nMessage to provider: {}", message.as_str()));
        // Emit before blocking on the provider so the trace is visible even
        // if the round-trip never completes.
        self.flush();
    }

    fn provider_message_result(&mut self, success: bool) {
        self.append(&format!(
            " -> result: {}",
            if success { "success" } else { "failed" }
        ));
    }

    fn denied_for_crawler(&mut self) {
        // When tracing only denied events, drop denied crawlers: they spam
        // the trace.
        if !self.will_emit && !self.discarded && self.trace_denied && !self.trace_all {
            self.discarded = true;
        }
    }

    fn vnode_result(&mut self, verdict: AuthVerdict) {
        if self.discarded {
            return;
        }
        if !self.will_emit && self.trace_denied {
            if verdict == AuthVerdict::Deny {
                self.will_emit = true;
            } else {
                self.discarded = true;
                return;
            }
        }
        self.append(&format!("\n-> {:?}", verdict));
    }
}

impl Drop for LogTracer {
    fn drop(&mut self) {
        self.flush();
    }
}
