//! Stable reference — pins its target into the GC root set.

use crate::node::{Node, RawSpecialRef};
use crate::object::ObjHeader;
use crate::queue;
use std::ptr::NonNull;

/// Stable reference to a managed object.
///
/// Every stable reference keeps its target in the root set. Use [`create`]
/// and [`dispose`] to create and destroy it; dropping without disposing
/// leaks the underlying registry node.
///
/// [`create`]: StableRef::create
/// [`dispose`]: StableRef::dispose
pub struct StableRef {
    node: NonNull<Node>,
}

// SAFETY: the facade is a plain pointer to a Node, and every Node operation
// is thread-safe; handles routinely cross threads on their way through a
// foreign runtime.
unsafe impl Send for StableRef {}
unsafe impl Sync for StableRef {}

impl StableRef {
    /// Create a new stable reference for `obj` on the current thread's
    /// queue. Must be manually disposed.
    pub fn create(obj: *mut ObjHeader) -> StableRef {
        queue::with_current(|q| q.create_stable_ref(obj))
    }

    pub(crate) fn from_node(node: NonNull<Node>) -> Self {
        Self { node }
    }

    /// Dispose the reference.
    ///
    /// Safe to call with any thread state. A reference that never left the
    /// creating thread's queue is erased on the spot, skipping publication
    /// and collector work.
    pub fn dispose(self) {
        let node = self.node;
        // SAFETY: an undisposed facade keeps its node alive.
        let r = unsafe { node.as_ref() };
        r.release_ref();
        r.dispose();
        let _ = queue::try_with_current(|q| q.delete_node_if_local(node));
    }

    /// Get the underlying object.
    ///
    /// Always safe while the reference is alive: the target is guaranteed to
    /// be in the root set. Requires the runnable thread state.
    pub fn get(&self) -> *mut ObjHeader {
        // SAFETY: an undisposed facade keeps its node alive.
        unsafe { self.node.as_ref() }.deref()
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
    /// `raw` must have come from [`StableRef::into_raw`] and not have been
    /// disposed since.
    pub unsafe fn from_raw(raw: *mut RawSpecialRef) -> StableRef {
        // SAFETY: forwarded caller contract.
        Self {
            node: unsafe { Node::from_raw(raw) },
        }
    }
}
