//! Per-thread state precondition checks
//!
//! Mutator threads are either `Runnable` (may touch managed objects) or
//! `Native` (running foreign code, invisible to the collector). The registry
//! only consumes this as a precondition: dereferencing a handle requires the
//! runnable state. Tracking is interface-level; actual safepoint blocking
//! lives in the runtime, not here.

use std::cell::Cell;

/// Execution state of a mutator thread as seen by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Thread may access managed objects; collector coordination applies.
    Runnable,
    /// Thread is executing foreign code and holds no unprotected object refs.
    Native,
}

thread_local! {
    static STATE: Cell<ThreadState> = const { Cell::new(ThreadState::Runnable) };
}

/// Current thread's state.
pub fn current() -> ThreadState {
    STATE.with(|s| s.get())
}

/// Switch the current thread's state, returning the previous one.
pub fn set(state: ThreadState) -> ThreadState {
    STATE.with(|s| s.replace(state))
}

/// Debug-contract check: the current thread must be runnable.
#[inline]
pub fn assert_runnable() {
    debug_assert!(
        current() == ThreadState::Runnable,
        "operation requires the runnable thread state, current state is {:?}",
        current()
    );
}

/// Scoped switch to the runnable state, restoring the previous state on drop.
///
/// Bridge entry points that may be called from native code (e.g. a foreign
/// runtime retaining a back reference) wrap themselves in this guard.
pub struct RunnableGuard {
    prev: ThreadState,
}

impl RunnableGuard {
    /// Enter the runnable state.
    pub fn new() -> Self {
        Self {
            prev: set(ThreadState::Runnable),
        }
    }
}

impl Default for RunnableGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RunnableGuard {
    fn drop(&mut self) {
        set(self.prev);
    }
}
