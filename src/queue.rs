//! Per-thread staging queue for freshly created special references
//!
//! Creation must be cheap and lock-free from any mutator thread, so new
//! nodes first land in a thread-private list. At a publish point (a
//! safepoint, or thread exit) the queue promotes its positive-rc nodes into
//! the roots list and splices the whole batch onto the registry's all-list
//! under the mutex — one lock acquisition per batch, not per handle.
//!
//! The queue also enables *fast local deletion*: a stable ref created and
//! disposed between two publish points is erased right here, skipping
//! publication and collector work entirely.

use crate::back_ref::BackRef;
use crate::node::{DISPOSED, Node, NodeList};
use crate::object::ObjHeader;
use crate::registry::SpecialRefRegistry;
use crate::stable_ref::StableRef;
use crate::weak_ref::WeakRef;
use std::cell::RefCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

/// Thread-private staging list of nodes not yet visible to the collector.
pub struct ThreadQueue {
    registry: &'static SpecialRefRegistry,
    queue: NodeList,
}

impl ThreadQueue {
    /// Create a queue feeding the process-wide registry.
    pub fn new() -> Self {
        Self {
            registry: SpecialRefRegistry::instance(),
            queue: NodeList::new(),
        }
    }

    /// Create a stable reference for `obj`. Must be manually disposed.
    pub fn create_stable_ref(&mut self, obj: *mut ObjHeader) -> StableRef {
        StableRef::from_node(self.register_node(obj, 1, true))
    }

    /// Create a weak reference for `obj`. Must be manually disposed.
    pub fn create_weak_ref(&mut self, obj: *mut ObjHeader) -> WeakRef {
        WeakRef::from_node(self.register_node(obj, 0, false))
    }

    /// Create a back reference for `obj` with an external refcount of 1.
    /// Must be manually disposed.
    pub fn create_back_ref(&mut self, obj: *mut ObjHeader) -> BackRef {
        BackRef::from_node(self.register_node(obj, 1, false))
    }

    fn register_node(
        &mut self,
        obj: *mut ObjHeader,
        rc: i32,
        allow_fast_deletion: bool,
    ) -> NonNull<Node> {
        let node = self.queue.push_back(Box::new(Node::new(obj, rc)));
        if allow_fast_deletion {
            // SAFETY: the node was just linked into this queue.
            unsafe { node.as_ref() }.set_owner(self as *const Self as *const ());
        }
        node
    }

    /// Erase a node that never left this queue; no-op for published nodes,
    /// which must go through dispose and the collector's sweep instead.
    pub(crate) fn delete_node_if_local(&mut self, node: NonNull<Node>) {
        // SAFETY: the caller's facade keeps the node alive; a disposed node
        // is only destroyed by the sweep, which has not seen it (it is
        // either still local or freshly published).
        let r = unsafe { node.as_ref() };
        if r.owner() == self as *const Self as *const () {
            debug_assert!(
                r.next_root().load(Ordering::Relaxed).is_null(),
                "a queue-local node cannot be in the roots list"
            );
            // SAFETY: owner is only ever set while the node sits in this
            // queue's list.
            drop(unsafe { self.queue.unlink(node) });
        }
    }

    /// Make every staged node visible to the collector.
    ///
    /// Promotion happens before the splice so that a node with a positive
    /// rc is in the roots list by the time the collector can see it at all.
    pub fn publish(&mut self) {
        #[cfg(feature = "gc_logging")]
        let published = self.queue.len();
        #[cfg(feature = "gc_logging")]
        let mut promoted = 0usize;

        let mut it = self.queue.head();
        while let Some(node) = NonNull::new(it) {
            // SAFETY: the node is linked in this queue until the splice
            // below.
            let r = unsafe { node.as_ref() };
            r.set_owner(ptr::null());
            // promote_into_roots depends on the rc being published before
            // it runs, so the load is acquire.
            if r.rc().load(Ordering::Acquire) > 0 {
                self.registry.promote_into_roots(r);
                #[cfg(feature = "gc_logging")]
                {
                    promoted += 1;
                }
            }
            // SAFETY: as above.
            it = unsafe { NodeList::next(node) };
        }
        self.registry.splice_into_all(&mut self.queue);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "gc::special_refs",
            published,
            promoted,
            "thread queue published"
        );
    }

    /// Discard the queue without publishing, force-disposing staged nodes.
    pub fn clear_for_tests(&mut self) {
        while let Some(node) = self.queue.pop_front() {
            node.rc().store(DISPOSED, Ordering::Relaxed);
            node.next_root().store(ptr::null_mut(), Ordering::Relaxed);
            drop(node);
        }
    }
}

impl Default for ThreadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadQueue {
    fn drop(&mut self) {
        self.publish();
    }
}

thread_local! {
    static CURRENT: RefCell<ThreadQueue> = RefCell::new(ThreadQueue::new());
}

/// Run `f` on the current thread's queue.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut ThreadQueue) -> R) -> R {
    CURRENT.with(|queue| f(&mut queue.borrow_mut()))
}

/// Like [`with_current`], but returns None during thread teardown when the
/// queue has already been destroyed (its drop published everything, so
/// callers can safely skip queue-local work).
pub(crate) fn try_with_current<R>(f: impl FnOnce(&mut ThreadQueue) -> R) -> Option<R> {
    CURRENT.try_with(|queue| f(&mut queue.borrow_mut())).ok()
}

/// Publish the current thread's queue. The runtime calls this from its
/// safepoint slow path; thread exit publishes implicitly.
pub fn publish_current_thread() {
    with_current(ThreadQueue::publish);
}
