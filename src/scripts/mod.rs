//! Script subscribers
//!
//! Scripts are named participants registered with the broker: they can
//! subscribe to topic filters, publish, and — when they declare themselves
//! `Sync` — veto delivery of a publish to connection subscribers. The
//! execution engine behind a script is not this crate's concern; it only
//! has to implement [`Script`] and drive the callback outputs.
//!
//! A `Sync` script blocks the dispatching thread until it signals
//! `success`/`error`; the wait is bounded by a configurable deadline so a
//! wedged script cannot stall the writer forever.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::protocol::QoS;

/// How a script participates in dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptRunType {
    /// Blocks the publisher until the script answers; may veto delivery
    Sync,
    /// Runs concurrently; cannot veto
    #[default]
    Async,
}

/// Returned by a script's `init` through the `success` callback
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptInitReturn {
    pub run_type: ScriptRunType,
}

/// A Sync script's verdict on the publish that triggered it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncAction {
    /// Deliver to connection subscribers as usual
    #[default]
    Continue,
    /// Suppress delivery to all connection subscribers and skip the
    /// retain-store update for this publish
    AbortPublish,
}

/// Inputs for one script run
#[derive(Debug, Clone)]
pub struct ScriptRunInput {
    pub topic: String,
    pub payload: Bytes,
    pub retained: bool,
}

/// Callback outputs for `init`
pub struct ScriptInitOutputs {
    pub success: Box<dyn FnOnce(ScriptInitReturn) + Send>,
    pub error: Box<dyn FnOnce(String) + Send>,
}

/// Callback outputs for one script run.
///
/// The broker-facing callbacks (`publish`, `subscribe`, `unsubscribe`)
/// enqueue change requests asynchronously, so they are safe to call from any
/// thread, including from under the writer's own dispatch.
pub struct ScriptRunOutputs {
    pub publish: Box<dyn Fn(String, Bytes, QoS, bool) + Send + Sync>,
    pub subscribe: Box<dyn Fn(String) + Send + Sync>,
    pub unsubscribe: Box<dyn Fn(String) + Send + Sync>,
    pub sync_action: Box<dyn Fn(SyncAction) + Send + Sync>,
    pub success: Box<dyn FnOnce() + Send>,
    pub error: Box<dyn FnOnce(String) + Send>,
}

/// A registered script. `force_quit` must leave the value safe to drop.
pub trait Script: Send + Sync {
    /// Called once after registration; report the run type through
    /// `out.success` before returning.
    fn init(&mut self, out: ScriptInitOutputs);

    /// Called for every publish matching one of the script's subscriptions.
    /// A `Sync` script must eventually call `out.success` or `out.error`;
    /// its `sync_action` before that signal decides whether dispatch aborts.
    fn run(&self, input: ScriptRunInput, out: ScriptRunOutputs);

    /// Stop the script; called before replacement or removal.
    fn force_quit(&self);
}

/// Constructor passed along an add-script change request
pub type ScriptCtor = Box<dyn FnOnce() -> Box<dyn Script> + Send>;

/// A script as held by the state writer
pub struct ScriptEntry {
    pub script: Box<dyn Script>,
    pub run_type: ScriptRunType,
}

/// Single-shot rendezvous the dispatcher blocks on for Sync scripts.
///
/// The script's `sync_action` callback records the verdict; `success` or
/// `error` completes the rendezvous. `wait` returns the recorded action, or
/// `Continue` if the deadline passes first.
pub struct SyncRendezvous {
    inner: Mutex<RendezvousState>,
    condvar: Condvar,
}

#[derive(Default)]
struct RendezvousState {
    action: SyncAction,
    done: bool,
}

impl SyncRendezvous {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RendezvousState::default()),
            condvar: Condvar::new(),
        })
    }

    pub fn set_action(&self, action: SyncAction) {
        self.inner.lock().action = action;
    }

    pub fn complete(&self) {
        let mut state = self.inner.lock();
        state.done = true;
        drop(state);
        self.condvar.notify_all();
    }

    /// Block until completion or deadline. Returns (action, completed).
    pub fn wait(&self, deadline: Duration) -> (SyncAction, bool) {
        let timeout_at = Instant::now() + deadline;
        let mut state = self.inner.lock();
        while !state.done {
            if self.condvar.wait_until(&mut state, timeout_at).timed_out() {
                break;
            }
        }
        (state.action, state.done)
    }
}
