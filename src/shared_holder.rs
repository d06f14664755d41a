//! Shared-ref holder for objects crossing the interop boundary.
//!
//! A holder travels inside the foreign representation of a managed object.
//! Depending on how the object crosses the boundary it either borrows a
//! live local root (`init_local`) or pins the object itself with a stable
//! reference (`init`).

use crate::object::ObjHeader;
use crate::stable_ref::StableRef;
use crate::thread_state;
use std::ptr;

/// Holder of a managed object shared with foreign code.
pub struct SharedRefHolder {
    obj: *mut ObjHeader,
    stable: Option<StableRef>,
}

// SAFETY: the target pointer is only handed out in the runnable state, and
// the optional StableRef is itself Send + Sync.
unsafe impl Send for SharedRefHolder {}
unsafe impl Sync for SharedRefHolder {}

impl SharedRefHolder {
    /// An uninitialized holder. Disposing it is a no-op, which the foreign
    /// runtime's teardown paths rely on.
    pub const fn new() -> Self {
        Self {
            obj: ptr::null_mut(),
            stable: None,
        }
    }

    /// Initialize with a borrowed target: the caller guarantees a live
    /// local root for as long as the holder is used. No stable ref is
    /// created.
    pub fn init_local(&mut self, obj: *mut ObjHeader) {
        debug_assert!(!obj.is_null(), "initializing a shared-ref holder with null");
        self.stable = None;
        self.obj = obj;
    }

    /// Initialize and pin the target with a stable reference.
    pub fn init(&mut self, obj: *mut ObjHeader) {
        debug_assert!(!obj.is_null(), "initializing a shared-ref holder with null");
        self.stable = Some(StableRef::create(obj));
        self.obj = obj;
    }

    /// The held object. Requires the runnable thread state.
    pub fn get(&self) -> *mut ObjHeader {
        thread_state::assert_runnable();
        // obj may be null if the holder was never initialized; callers that
        // reach here through a live foreign object initialized it.
        self.obj
    }

    /// Dispose the pinning stable reference, if any. Handles holders that
    /// were never initialized or were initialized locally.
    pub fn dispose(&mut self) {
        if let Some(stable) = self.stable.take() {
            stable.dispose();
        }
        // obj is dangling from here on; the holder is dead.
    }
}

impl Default for SharedRefHolder {
    fn default() -> Self {
        Self::new()
    }
}
