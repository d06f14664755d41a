//! Registry node — the fixed-identity record backing one special reference.
//!
//! A `Node` lives in exactly one of two places: the creating thread's private
//! [`ThreadQueue`](crate::queue::ThreadQueue) staging list, or the registry's
//! global all-list. Handle facades store raw node pointers; nodes are boxed
//! and never move, so that identity is stable for the node's whole life.
//!
//! The refcount doubles as the dispose flag: disposing biases the counter by
//! [`DISPOSED`] (`i32::MIN`) in a single `fetch_add`, so "disposed" and the
//! pre-dispose count are observed atomically together. Foreign-runtime
//! autorelease patterns may retain/release after dispose; those pairs must
//! balance out before the node is destroyed.

use crate::object::ObjHeader;
use crate::registry::SpecialRefRegistry;
use crate::thread_state;
use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

/// Refcount type. Non-negative in normal life; biased by [`DISPOSED`] once
/// the handle has been disposed.
pub(crate) type Rc = i32;

/// Impossibly-low refcount bias marking a disposed node.
///
/// A disposed node with all foreign retain/release pairs balanced holds
/// exactly this value, which is what the sweep checks for before erasing.
pub(crate) const DISPOSED: Rc = Rc::MIN;

/// Opaque raw form of a special reference.
///
/// Foreign runtimes store handles as raw bytes; a handle facade converts to
/// and from this type losslessly (`into_raw` / `from_raw`). The pointee is
/// never dereferenced through this type.
#[repr(C)]
pub struct RawSpecialRef {
    _opaque: [u8; 0],
}

/// One special reference: target pointer, refcount, roots-list link, and the
/// fast-deletion backlink to the creating queue.
pub(crate) struct Node {
    /// Target object. Non-null from creation until the collector clears it
    /// during sweep.
    obj: AtomicPtr<ObjHeader>,
    /// Refcount, biased by [`DISPOSED`] once disposed.
    rc: AtomicI32,
    /// Intrusive link in the registry's lock-free roots list. Null means the
    /// node is not in the roots list.
    next_root: AtomicPtr<Node>,
    /// Creating queue while the node is still private and eligible for fast
    /// deletion; null once published or when fast deletion is disallowed.
    /// Relaxed atomic: read from whichever thread happens to dispose.
    owner: AtomicPtr<()>,
    /// All-list links. Touched only by the owning thread before publish and
    /// only under the registry mutex afterwards.
    prev_all: Cell<*mut Node>,
    next_all: Cell<*mut Node>,
}

// SAFETY: `obj`, `rc`, `next_root` and `owner` are atomics. The `prev_all`/
// `next_all` cells follow a hand-off discipline: the owning thread mutates
// them before publish, and publish transfers them under the registry mutex,
// which also guards every later access.
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    pub(crate) fn new(obj: *mut ObjHeader, rc: Rc) -> Self {
        debug_assert!(!obj.is_null(), "creating a special ref for a null object");
        debug_assert!(rc >= 0, "creating a special ref with negative rc {rc}");
        Self {
            obj: AtomicPtr::new(obj),
            rc: AtomicI32::new(rc),
            next_root: AtomicPtr::new(ptr::null_mut()),
            owner: AtomicPtr::new(ptr::null_mut()),
            prev_all: Cell::new(ptr::null_mut()),
            next_all: Cell::new(ptr::null_mut()),
        }
    }

    /// Sentinel node for the roots list. Never carries an object, never has
    /// its rc inspected, and is never destroyed.
    pub(crate) const fn sentinel() -> Self {
        Self {
            obj: AtomicPtr::new(ptr::null_mut()),
            rc: AtomicI32::new(0),
            next_root: AtomicPtr::new(ptr::null_mut()),
            owner: AtomicPtr::new(ptr::null_mut()),
            prev_all: Cell::new(ptr::null_mut()),
            next_all: Cell::new(ptr::null_mut()),
        }
    }

    /// The target slot. The collector nulls it through this handle during
    /// sweep; promotion and root iteration read it.
    #[inline]
    pub(crate) fn obj(&self) -> &AtomicPtr<ObjHeader> {
        &self.obj
    }

    #[inline]
    pub(crate) fn rc(&self) -> &AtomicI32 {
        &self.rc
    }

    /// The roots-list link.
    #[inline]
    pub(crate) fn next_root(&self) -> &AtomicPtr<Node> {
        &self.next_root
    }

    /// Get the underlying object.
    ///
    /// Precondition: the caller knows `rc > 0`, or the object is a root some
    /// other way. The GC therefore cannot have nulled out `obj`, and a
    /// relaxed load suffices.
    pub(crate) fn deref(&self) -> *mut ObjHeader {
        thread_state::assert_runnable();
        debug_assert!(
            self.rc.load(Ordering::Relaxed) >= 0,
            "dereferencing a special ref with rc {}",
            self.rc.load(Ordering::Relaxed)
        );
        let obj = self.obj.load(Ordering::Relaxed);
        debug_assert!(!obj.is_null(), "dereferencing a special ref with cleaned up object");
        obj
    }

    /// Safely get the underlying object, or null if the collector has
    /// already cleared it. The result is also written to `slot` so the
    /// caller can install it as a local root before using it.
    ///
    /// The acquire load pairs with the collector's release store when it
    /// nulls the slot during sweep.
    pub(crate) fn try_ref(&self, slot: &mut *mut ObjHeader) -> *mut ObjHeader {
        thread_state::assert_runnable();
        let obj = self.obj.load(Ordering::Acquire);
        *slot = obj;
        obj
    }

    /// Increment the refcount. A 0 -> 1 transition promotes the node into
    /// the roots list.
    ///
    /// `promote_into_roots` depends on the rc being published before it
    /// runs, hence acq-rel on the increment.
    pub(crate) fn retain_ref(&self) {
        let rc = self.rc.fetch_add(1, Ordering::AcqRel);
        // Note: rc can be negative here when retaining after dispose. The
        // foreign runtime's deinit paths produce such transients.
        if rc == 0 {
            debug_assert!(
                self.owner.load(Ordering::Relaxed).is_null(),
                "retaining a special ref with the fast deletion optimization is disallowed"
            );
            SpecialRefRegistry::instance().promote_into_roots(self);
        }
    }

    /// Decrement the refcount. Only atomicity is needed; demotion happens
    /// lazily on the next root scan.
    pub(crate) fn release_ref(&self) {
        self.rc.fetch_sub(1, Ordering::Relaxed);
    }

    /// Mark the node disposed by biasing the refcount with [`DISPOSED`].
    ///
    /// The rc may still be > 0 here: a foreign runtime retaining and
    /// autoreleasing during its deinit leaves pending releases that balance
    /// out later. The destructor then observes exactly [`DISPOSED`].
    pub(crate) fn dispose(&self) {
        let rc = self.rc.fetch_add(DISPOSED, Ordering::Release);
        debug_assert!(rc >= 0, "disposing a special ref with rc {rc}");
    }

    #[inline]
    pub(crate) fn set_owner(&self, owner: *const ()) {
        self.owner.store(owner as *mut (), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn owner(&self) -> *const () {
        self.owner.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn as_raw(node: NonNull<Node>) -> *mut RawSpecialRef {
        node.as_ptr().cast()
    }

    /// # Safety
    ///
    /// `raw` must have come from [`Node::as_raw`] on a node that has not been
    /// destroyed.
    #[inline]
    pub(crate) unsafe fn from_raw(raw: *mut RawSpecialRef) -> NonNull<Node> {
        debug_assert!(!raw.is_null(), "null raw special ref");
        // SAFETY: caller guarantees the pointer originated from `as_raw`.
        unsafe { NonNull::new_unchecked(raw.cast()) }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let rc = self.rc.load(Ordering::Relaxed);
        debug_assert!(rc == DISPOSED, "destroying a special ref node with rc {rc}");
        debug_assert!(
            self.next_root.load(Ordering::Relaxed).is_null(),
            "destroying a special ref node that is still in the roots list"
        );
    }
}

/// Intrusive doubly-linked list of boxed nodes.
///
/// Serves both as a thread queue's private staging list and as the registry's
/// all-list. Links live inside the nodes, so a published queue is spliced
/// onto the all-list in O(1) and a node is unlinked in O(1) given only its
/// address.
pub(crate) struct NodeList {
    head: *mut Node,
    tail: *mut Node,
    len: usize,
}

// SAFETY: a NodeList owns its nodes exclusively. It is either thread-private
// (a ThreadQueue's staging list) or guarded by the registry mutex.
unsafe impl Send for NodeList {}

impl NodeList {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn head(&self) -> *mut Node {
        self.head
    }

    /// Successor of `node` within this list.
    ///
    /// # Safety
    ///
    /// `node` must be linked in this list.
    #[inline]
    pub(crate) unsafe fn next(node: NonNull<Node>) -> *mut Node {
        // SAFETY: membership in the list keeps the node alive.
        unsafe { node.as_ref().next_all.get() }
    }

    /// Append a node, transferring ownership to the list.
    pub(crate) fn push_back(&mut self, node: Box<Node>) -> NonNull<Node> {
        let node = Box::into_raw(node);
        // SAFETY: `node` came out of the box above; `tail` is either null or
        // a node owned by this list.
        unsafe {
            (*node).prev_all.set(self.tail);
            (*node).next_all.set(ptr::null_mut());
            if self.tail.is_null() {
                self.head = node;
            } else {
                (*self.tail).next_all.set(node);
            }
        }
        self.tail = node;
        self.len += 1;
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(node) }
    }

    /// Unlink a node, returning ownership to the caller.
    ///
    /// # Safety
    ///
    /// `node` must be linked in this list.
    pub(crate) unsafe fn unlink(&mut self, node: NonNull<Node>) -> Box<Node> {
        let raw = node.as_ptr();
        // SAFETY: per contract the node and its neighbors belong to this
        // list, so all link pointers are valid.
        unsafe {
            let prev = (*raw).prev_all.get();
            let next = (*raw).next_all.get();
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next_all.set(next);
            }
            if next.is_null() {
                self.tail = prev;
            } else {
                (*next).prev_all.set(prev);
            }
            (*raw).prev_all.set(ptr::null_mut());
            (*raw).next_all.set(ptr::null_mut());
            self.len -= 1;
            Box::from_raw(raw)
        }
    }

    /// Remove and return the first node, if any.
    pub(crate) fn pop_front(&mut self) -> Option<Box<Node>> {
        NonNull::new(self.head).map(|head| {
            // SAFETY: `head` is linked in this list by construction.
            unsafe { self.unlink(head) }
        })
    }

    /// Move every node of `other` to the back of `self` in O(1).
    pub(crate) fn splice_back(&mut self, other: &mut NodeList) {
        if other.is_empty() {
            return;
        }
        // SAFETY: both boundary nodes are owned by their respective lists.
        unsafe {
            if self.tail.is_null() {
                self.head = other.head;
            } else {
                (*self.tail).next_all.set(other.head);
                (*other.head).prev_all.set(self.tail);
            }
        }
        self.tail = other.tail;
        self.len += other.len;
        other.head = ptr::null_mut();
        other.tail = ptr::null_mut();
        other.len = 0;
    }
}

impl Drop for NodeList {
    fn drop(&mut self) {
        debug_assert!(self.is_empty(), "dropping a non-empty node list");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjHeader;

    fn disposed_node(obj: *mut ObjHeader) -> Box<Node> {
        let node = Box::new(Node::new(obj, 0));
        node.dispose();
        node
    }

    #[test]
    fn test_dispose_biases_rc() {
        let mut obj = ObjHeader::new();
        let node = Node::new(&mut obj, 1);
        node.release_ref();
        node.dispose();
        assert_eq!(node.rc.load(Ordering::Relaxed), DISPOSED);
    }

    #[test]
    fn test_retain_release_after_dispose_balances() {
        let mut obj = ObjHeader::new();
        let node = Node::new(&mut obj, 1);
        node.release_ref();
        node.dispose();
        // Autorelease pattern: the foreign runtime retains and releases
        // after dispose; the pairs net out to the plain disposed marker.
        node.rc.fetch_add(1, Ordering::AcqRel);
        assert_ne!(node.rc.load(Ordering::Relaxed), DISPOSED);
        node.release_ref();
        assert_eq!(node.rc.load(Ordering::Relaxed), DISPOSED);
    }

    #[test]
    fn test_try_ref_writes_slot() {
        let mut obj = ObjHeader::new();
        let node = Node::new(&mut obj, 0);
        let mut slot: *mut ObjHeader = std::ptr::null_mut();
        let got = node.try_ref(&mut slot);
        assert_eq!(got, &mut obj as *mut ObjHeader);
        assert_eq!(slot, got);
        node.dispose();
    }

    #[test]
    fn test_list_push_unlink() {
        let mut obj = ObjHeader::new();
        let mut list = NodeList::new();
        let a = list.push_back(disposed_node(&mut obj));
        let b = list.push_back(disposed_node(&mut obj));
        let c = list.push_back(disposed_node(&mut obj));
        assert_eq!(list.len(), 3);

        // Middle, then head, then tail.
        drop(unsafe { list.unlink(b) });
        assert_eq!(list.len(), 2);
        drop(unsafe { list.unlink(a) });
        drop(unsafe { list.unlink(c) });
        assert!(list.is_empty());
    }

    #[test]
    fn test_list_splice_back() {
        let mut obj = ObjHeader::new();
        let mut left = NodeList::new();
        let mut right = NodeList::new();
        left.push_back(disposed_node(&mut obj));
        right.push_back(disposed_node(&mut obj));
        right.push_back(disposed_node(&mut obj));

        left.splice_back(&mut right);
        assert_eq!(left.len(), 3);
        assert!(right.is_empty());

        while left.pop_front().is_some() {}
        assert!(left.is_empty());
    }
}
