//! Back reference — the foreign runtime's handle to a shared object.
//!
//! Created for the foreign-runtime half of an object shared across the
//! interop boundary. Carries the external refcount: while it is positive the
//! reference behaves like a stable one (target is a root); once it drops to
//! zero it degrades to a weak reference, and [`BackRef::try_retain`] can
//! re-promote it atomically with respect to a running collection.

use crate::node::{Node, RawSpecialRef};
use crate::object::ObjHeader;
use crate::queue;
use crate::thread_state::RunnableGuard;
use std::ptr::{self, NonNull};

/// Back reference from a foreign-runtime object to its managed counterpart.
///
/// The target is tracked as a root while the external refcount is positive
/// and invalidated when the target is collected with the count at zero. Use
/// [`create`] and [`dispose`] to create and destroy it.
///
/// [`create`]: BackRef::create
/// [`dispose`]: BackRef::dispose
pub struct BackRef {
    node: NonNull<Node>,
}

// SAFETY: plain pointer to a Node; all Node operations are thread-safe. The
// foreign runtime retains and releases from arbitrary threads.
unsafe impl Send for BackRef {}
unsafe impl Sync for BackRef {}

impl BackRef {
    /// Create a new back reference for `obj` with an external refcount of 1
    /// on the current thread's queue. Must be manually disposed.
    pub fn create(obj: *mut ObjHeader) -> BackRef {
        queue::with_current(|q| q.create_back_ref(obj))
    }

    pub(crate) fn from_node(node: NonNull<Node>) -> Self {
        Self { node }
    }

    /// Dispose the reference. The external refcount is expected to have
    /// balanced out to zero by the time the node is destroyed; transient
    /// imbalance from autorelease-style patterns is tolerated.
    ///
    /// Safe to call with any thread state.
    pub fn dispose(self) {
        // SAFETY: an undisposed facade keeps its node alive.
        unsafe { self.node.as_ref() }.dispose();
    }

    /// Increment the external refcount. A 0 -> 1 transition re-promotes the
    /// target into the root set. Safe to call with any thread state.
    pub fn retain(&self) {
        // SAFETY: an undisposed facade keeps its node alive.
        unsafe { self.node.as_ref() }.retain_ref();
    }

    /// Decrement the external refcount. Safe to call with any thread state.
    pub fn release(&self) {
        // SAFETY: an undisposed facade keeps its node alive.
        unsafe { self.node.as_ref() }.release_ref();
    }

    /// Try incrementing the external refcount; fails if the target has
    /// already been collected.
    ///
    /// May be called from the native thread state (the foreign runtime's
    /// retain slow path): the guard switches to runnable for the duration.
    /// A collector that is mid-cycle cannot clear the target between the
    /// successful read and the retain, because sweeping only starts after
    /// root scanning is done and a 0 -> 1 retain re-promotes the node into
    /// the roots first.
    pub fn try_retain(&self) -> bool {
        let _state = RunnableGuard::new();
        let mut slot: *mut ObjHeader = ptr::null_mut();
        // SAFETY: an undisposed facade keeps its node alive.
        let node = unsafe { self.node.as_ref() };
        if !node.try_ref(&mut slot).is_null() {
            node.retain_ref();
            true
        } else {
            false
        }
    }

    /// Get the underlying object. Only safe to use while the external
    /// refcount is positive. Requires the runnable thread state.
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
    /// `raw` must have come from [`BackRef::into_raw`] and not have been
    /// disposed since.
    pub unsafe fn from_raw(raw: *mut RawSpecialRef) -> BackRef {
        // SAFETY: forwarded caller contract.
        Self {
            node: unsafe { Node::from_raw(raw) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::publish_current_thread;
    use crate::registry::SpecialRefRegistry;
    use crate::test_util;
    use crate::thread_state::{self, ThreadState};
    use std::sync::atomic::Ordering;

    #[test]
    fn test_refcount_oscillation_moves_in_and_out_of_roots() {
        let _guard = test_util::registry_guard();
        let registry = SpecialRefRegistry::instance();
        let mut obj = ObjHeader::new();

        let back = BackRef::create(&mut obj);
        publish_current_thread();

        let roots: Vec<_> = registry.roots().into_iter().collect();
        assert_eq!(roots, vec![&mut obj as *mut ObjHeader]);

        // rc 1 -> 0: the next scan demotes the target.
        back.release();
        assert!(registry.roots().into_iter().next().is_none());

        // rc 0 -> 1: promoted again, same node identity.
        back.retain();
        let roots: Vec<_> = registry.roots().into_iter().collect();
        assert_eq!(roots, vec![&mut obj as *mut ObjHeader]);

        let raw = back.into_raw();
        // SAFETY: raw came from into_raw above.
        let back = unsafe { BackRef::from_raw(raw) };
        assert_eq!(back.into_raw(), raw);

        // SAFETY: as above.
        let back = unsafe { BackRef::from_raw(raw) };
        back.release();
        back.dispose();
    }

    #[test]
    fn test_try_retain_succeeds_while_target_alive() {
        let _guard = test_util::registry_guard();
        let mut obj = ObjHeader::new();

        let back = BackRef::create(&mut obj);
        publish_current_thread();
        back.release();

        // try_retain is a bridge entry point; it must work from the native
        // state.
        let prev = thread_state::set(ThreadState::Native);
        assert!(back.try_retain());
        thread_state::set(prev);

        let registry = SpecialRefRegistry::instance();
        let roots: Vec<_> = registry.roots().into_iter().collect();
        assert_eq!(roots, vec![&mut obj as *mut ObjHeader]);

        back.release();
        back.dispose();
    }

    #[test]
    fn test_try_retain_fails_after_target_collected() {
        let _guard = test_util::registry_guard();
        let registry = SpecialRefRegistry::instance();
        let mut obj = ObjHeader::new();

        let back = BackRef::create(&mut obj);
        publish_current_thread();
        back.release();

        // Scan demotes the zero-rc node, then the sweep clears the target.
        assert!(registry.roots().into_iter().next().is_none());
        {
            let mut iter = registry.lock_for_iter();
            while let Some(target) = iter.next_slot() {
                target.store(std::ptr::null_mut(), Ordering::Release);
            }
        }

        assert!(!back.try_retain());
        back.dispose();
    }
}
