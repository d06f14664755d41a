//! Weak reference — observes its target without keeping it alive.

use crate::node::{Node, RawSpecialRef};
use crate::object::ObjHeader;
use crate::queue;
use std::ptr::NonNull;

/// Weak reference to a managed object.
///
/// The collector invalidates the reference when the target is collected;
/// [`try_ref`] then returns null. Use [`create`] and [`dispose`] to create
/// and destroy it.
///
/// [`create`]: WeakRef::create
/// [`dispose`]: WeakRef::dispose
/// [`try_ref`]: WeakRef::try_ref
pub struct WeakRef {
    node: NonNull<Node>,
}

// SAFETY: plain pointer to a Node; all Node operations are thread-safe.
unsafe impl Send for WeakRef {}
unsafe impl Sync for WeakRef {}

impl WeakRef {
    /// Create a new weak reference for `obj` on the current thread's queue.
    /// Must be manually disposed.
    pub fn create(obj: *mut ObjHeader) -> WeakRef {
        queue::with_current(|q| q.create_weak_ref(obj))
    }

    pub(crate) fn from_node(node: NonNull<Node>) -> Self {
        Self { node }
    }

    /// Dispose the reference. Safe to call with any thread state.
    pub fn dispose(self) {
        // SAFETY: an undisposed facade keeps its node alive.
        unsafe { self.node.as_ref() }.dispose();
    }

    /// Safely dereference, writing the result to `slot` so the caller can
    /// install it as a local root before use. Returns null if the target is
    /// no longer alive. Requires the runnable thread state.
    pub fn try_ref(&self, slot: &mut *mut ObjHeader) -> *mut ObjHeader {
        // SAFETY: an undisposed facade keeps its node alive.
        unsafe { self.node.as_ref() }.try_ref(slot)
    }

    /// Convert into the raw form handed across the interop boundary. The
    /// obligation to dispose moves with it.
    pub fn into_raw(self) -> *mut RawSpecialRef {
        Node::as_raw(self.node)
    }

    /// Reconstruct from the raw form.
    ///
    /// # Safety
    ///
    /// `raw` must have come from [`WeakRef::into_raw`] and not have been
    /// disposed since.
    pub unsafe fn from_raw(raw: *mut RawSpecialRef) -> WeakRef {
        // SAFETY: forwarded caller contract.
        Self {
            node: unsafe { Node::from_raw(raw) },
        }
    }
}
