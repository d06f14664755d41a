//! Weak-reference counter — the bridge's canonical weak handle per object.
//!
//! The foreign bridge wants exactly one weak-reference object per managed
//! target, memoized in the target's extra-data slot so repeated requests
//! return the same counter. The counter embeds a [`WeakRef`] that is
//! disposed when the counter itself is finalized.

use crate::node::{Node, RawSpecialRef};
use crate::object::ObjHeader;
use crate::thread_state;
use crate::weak_ref::WeakRef;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::ptr::NonNull;

/// Canonical weak handle for one managed object.
pub struct WeakReferenceCounter {
    weak: *mut RawSpecialRef,
    referred: *mut ObjHeader,
}

// SAFETY: `weak` points at a registry node (thread-safe operations only) and
// `referred` is only read, never dereferenced, outside try_deref.
unsafe impl Send for WeakReferenceCounter {}
unsafe impl Sync for WeakReferenceCounter {}

impl WeakReferenceCounter {
    fn new(obj: *mut ObjHeader) -> Self {
        Self {
            weak: WeakRef::create(obj).into_raw(),
            referred: obj,
        }
    }

    /// Safely dereference the embedded weak reference, writing the result
    /// to `slot`. Returns null once the target has been collected. Requires
    /// the runnable thread state.
    pub fn try_deref(&self, slot: &mut *mut ObjHeader) -> *mut ObjHeader {
        // SAFETY: the embedded raw ref stays valid until the counter is
        // disposed, and dispose consumes the table entry owning self.
        unsafe { Node::from_raw(self.weak).as_ref() }.try_ref(slot)
    }

    /// The originally referred object, without any liveness check. Only for
    /// identity comparisons and diagnostics; the pointee may be gone.
    pub fn base_object_unsafe(&self) -> *mut ObjHeader {
        self.referred
    }
}

/// Extra-data table memoizing one [`WeakReferenceCounter`] per object.
pub struct WeakCounterTable {
    entries: Mutex<FxHashMap<usize, Box<WeakReferenceCounter>>>,
}

impl WeakCounterTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Get the counter for `obj`, installing one on first request. All
    /// callers racing on the same object observe the same counter. Requires
    /// the runnable thread state.
    pub fn get_or_create(&self, obj: *mut ObjHeader) -> NonNull<WeakReferenceCounter> {
        thread_state::assert_runnable();
        debug_assert!(!obj.is_null(), "creating a weak counter for null");
        let mut entries = self.entries.lock();
        let counter = entries
            .entry(obj as usize)
            .or_insert_with(|| Box::new(WeakReferenceCounter::new(obj)));
        NonNull::from(&mut **counter)
    }

    /// Dispose `counter` when its object is finalized: disposes the
    /// embedded weak reference and drops the table entry. The pointer must
    /// not be used afterwards.
    pub fn dispose(&self, counter: NonNull<WeakReferenceCounter>) {
        // SAFETY: the caller's finalizer owns the last use of the counter;
        // the box it points into lives in our table until removed below.
        let referred = unsafe { counter.as_ref() }.base_object_unsafe();
        let removed = self.entries.lock().remove(&(referred as usize));
        debug_assert!(removed.is_some(), "disposing an unknown weak counter");
        if let Some(counter) = removed {
            // SAFETY: the raw ref was produced by into_raw at creation and
            // is disposed exactly once, here.
            unsafe { WeakRef::from_raw(counter.weak) }.dispose();
        }
    }
}

impl Default for WeakCounterTable {
    fn default() -> Self {
        Self::new()
    }
}
