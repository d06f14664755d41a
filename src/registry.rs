//! Process-wide registry of special references
//!
//! Owns every published node twice over:
//!
//! - the **all-list**, a doubly-linked list of all published nodes, mutated
//!   only under a mutex; the collector iterates it after marking to clear
//!   dead targets and to erase disposed nodes, and
//! - the **roots list**, a lock-free singly-linked list threaded through the
//!   nodes' `next_root` fields, holding the nodes whose targets must be
//!   treated as GC roots.
//!
//! The roots list is deliberately asymmetric: any mutator may push at the
//! head (CAS), but only the single collector walker reads and deletes
//! mid-list. That asymmetry is what keeps in-place deletion tractable
//! without a general concurrent-list dependency.

use crate::node::{DISPOSED, Node, NodeList};
use crate::object::ObjHeader;
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Mutex, MutexGuard};
use std::ptr::{self, NonNull};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Registry tuning knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Iteration bound for the first advance of a roots scan. Continuous
    /// concurrent insertion right after the list head could otherwise stall
    /// the walker; past the bound it conservatively returns whatever node
    /// comes next, extending at most one object's life by a cycle.
    pub roots_begin_scan_cap: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            roots_begin_scan_cap: 1000,
        }
    }
}

/// Tail sentinel of the roots list. Static storage: its address must be
/// stable and available before any registry value exists.
static ROOTS_TAIL: Node = Node::sentinel();

static INSTANCE: OnceLock<SpecialRefRegistry> = OnceLock::new();

/// Registry for all special references to managed objects:
///
/// - stable references (always part of the root set),
/// - weak references,
/// - back references, a mix between the two kept for objects shared with a
///   foreign refcounted runtime: a root while the external count is
///   positive, a weak reference once it drops to zero.
pub struct SpecialRefRegistry {
    config: RegistryConfig,
    /// Every published node. Erasure happens only during locked iteration.
    all: Mutex<NodeList>,
    /// Head sentinel of the roots list. Padded so contended CAS pushes do
    /// not false-share with the all-list mutex word.
    roots_head: CachePadded<Node>,
}

impl SpecialRefRegistry {
    fn with_config(config: RegistryConfig) -> Self {
        let registry = Self {
            config,
            all: Mutex::new(NodeList::new()),
            roots_head: CachePadded::new(Node::sentinel()),
        };
        registry
            .roots_head
            .next_root()
            .store(Self::roots_tail().as_ptr(), Ordering::Relaxed);
        registry
    }

    /// The process-wide registry, created with default configuration on
    /// first use.
    pub fn instance() -> &'static SpecialRefRegistry {
        INSTANCE.get_or_init(|| Self::with_config(RegistryConfig::default()))
    }

    /// Install the process-wide registry with a non-default configuration.
    /// Returns false if the registry was already initialized.
    pub fn init_global(config: RegistryConfig) -> bool {
        INSTANCE.set(Self::with_config(config)).is_ok()
    }

    #[inline]
    fn roots_tail() -> NonNull<Node> {
        NonNull::from(&ROOTS_TAIL)
    }

    /// Lazy iteration over the current roots, pruning dead entries in
    /// place.
    ///
    /// Single-walker: only the collector may iterate, at a safepoint, after
    /// every thread queue has published.
    pub fn roots(&self) -> RootsIterable<'_> {
        RootsIterable { registry: self }
    }

    /// Lock the registry and iterate over every published node, yielding
    /// each live node's target slot so the collector can null it after
    /// marking. Disposed nodes that are no longer in the roots list are
    /// erased and destroyed along the way.
    pub fn lock_for_iter(&self) -> AllIterable<'_> {
        let guard = self.all.lock();
        let first = guard.head();
        let mut iter = AllIterable {
            guard,
            cursor: ptr::null_mut(),
            erased: 0,
        };
        iter.cursor = iter.skip_dead(first);
        iter
    }

    /// Push a node onto the roots list head, unless it is already there.
    ///
    /// Callers guarantee the node's rc was published (with release ordering
    /// or stronger) before this runs; the walker's rc recheck relies on it.
    pub(crate) fn promote_into_roots(&self, node: &Node) {
        let obj = node.obj().load(Ordering::Relaxed);
        if obj.is_null() {
            // The collector already cleared the target; nothing to root.
            return;
        }
        if !node.next_root().load(Ordering::Acquire).is_null() {
            // Already a root, or another promoter claimed it. A concurrent
            // walker may be demoting it right now, but it rechecks the rc
            // after unlinking and re-promotes when needed.
            return;
        }

        // Claim the insertion: the walker's re-promotion and a mutator's
        // 0 -> 1 retain can race on the same node, and exactly one of them
        // may link it. The loser observes a non-null next_root and bows out.
        let mut next = self.roots_head.next_root().load(Ordering::Acquire);
        debug_assert!(!next.is_null(), "head's next cannot be null");
        if node
            .next_root()
            .compare_exchange(ptr::null_mut(), next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let node_ptr = node as *const Node as *mut Node;
        let backoff = Backoff::new();
        loop {
            match self.roots_head.next_root().compare_exchange_weak(
                next,
                node_ptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    debug_assert!(!actual.is_null(), "head's next cannot be null");
                    // We own the claimed link, so a plain store republishes
                    // the new successor.
                    next = actual;
                    node.next_root().store(next, Ordering::Release);
                    backoff.spin();
                }
            }
        }
    }

    /// Advance from `current` to the next node with a positive rc, deleting
    /// zero-rc nodes encountered on the way.
    ///
    /// `max_iterations` bounds the walk so the caller can surface to a
    /// safepoint even under an insertion storm; past the bound the current
    /// successor is returned as-is, which at worst keeps one object alive an
    /// extra cycle.
    fn next_root(&self, mut current: NonNull<Node>, max_iterations: usize) -> NonNull<Node> {
        let tail = Self::roots_tail();
        for _ in 0..max_iterations {
            debug_assert!(current != tail, "current cannot be tail");
            // SAFETY: nodes linked in the roots list stay alive at least
            // until the finalize phase, which runs on this same collector
            // thread strictly after the walk.
            let candidate = unsafe { current.as_ref() }.next_root().load(Ordering::Acquire);
            debug_assert!(!candidate.is_null(), "candidate cannot be null");
            // SAFETY: roots links are never null (the list is tail-terminated).
            let candidate = unsafe { NonNull::new_unchecked(candidate) };
            if candidate == tail || unsafe { candidate.as_ref() }.rc().load(Ordering::Acquire) > 0
            {
                // Perfectly good node. If someone concurrently pushed onto
                // the head behind us, promotion itself keeps that node
                // visible to the current cycle, and the next cycle walks it
                // anyway.
                return candidate;
            }
            // Zero-rc node: unlink it. Deletion is racy only against head
            // insertion, never against another deleter or reader.
            loop {
                let next = unsafe { candidate.as_ref() }.next_root().load(Ordering::Acquire);
                debug_assert!(!next.is_null(), "candidate's next cannot be null");
                match unsafe { current.as_ref() }.next_root().compare_exchange(
                    candidate.as_ptr(),
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        unsafe { candidate.as_ref() }
                            .next_root()
                            .store(ptr::null_mut(), Ordering::Release);
                        break;
                    }
                    Err(actual) => {
                        // Someone inserted between current and candidate.
                        // All concurrent insertions happen at the head, so
                        // moving current forward both makes progress and
                        // re-establishes that candidate is its successor.
                        debug_assert!(!actual.is_null(), "current's next cannot be null");
                        // SAFETY: see null check above.
                        current = unsafe { NonNull::new_unchecked(actual) };
                    }
                }
            }
            // We unlinked candidate. But should we have? A concurrent
            // retain may have raced the demotion; close the window by
            // re-promoting.
            if unsafe { candidate.as_ref() }.rc().load(Ordering::Acquire) > 0 {
                self.promote_into_roots(unsafe { candidate.as_ref() });
            }
        }
        // Too many iterations. Conservatively hand back whatever follows
        // current.
        let next = unsafe { current.as_ref() }.next_root().load(Ordering::Acquire);
        debug_assert!(!next.is_null());
        // SAFETY: roots links are never null.
        unsafe { NonNull::new_unchecked(next) }
    }

    /// Splice a published thread queue onto the all-list.
    pub(crate) fn splice_into_all(&self, queue: &mut NodeList) {
        self.all.lock().splice_back(queue);
    }

    /// Number of published nodes currently in the all-list.
    pub fn all_size_for_tests(&self) -> usize {
        self.all.lock().len()
    }

    /// Reset the registry to its initial state, force-disposing every
    /// published node so destruction invariants hold without running
    /// finalizers.
    pub fn clear_for_tests(&self) {
        self.roots_head
            .next_root()
            .store(Self::roots_tail().as_ptr(), Ordering::Relaxed);
        let mut all = self.all.lock();
        while let Some(node) = all.pop_front() {
            node.rc().store(DISPOSED, Ordering::Relaxed);
            node.next_root().store(ptr::null_mut(), Ordering::Relaxed);
            drop(node);
        }
    }
}

/// Lazy single-walker view of the roots list. Obtained from
/// [`SpecialRefRegistry::roots`].
pub struct RootsIterable<'a> {
    registry: &'a SpecialRefRegistry,
}

impl<'a> IntoIterator for RootsIterable<'a> {
    type Item = *mut ObjHeader;
    type IntoIter = RootsIter<'a>;

    fn into_iter(self) -> RootsIter<'a> {
        let registry = self.registry;
        let head = NonNull::from(&*registry.roots_head);
        // The first advance is capped: concurrent insertions right after
        // the head could otherwise keep the walker from ever returning.
        let node = registry.next_root(head, registry.config.roots_begin_scan_cap);
        RootsIter { registry, node }
    }
}

/// Iterator over current root objects. May yield null for a target the
/// collector cleared mid-scan; callers skip those.
pub struct RootsIter<'a> {
    registry: &'a SpecialRefRegistry,
    node: NonNull<Node>,
}

impl Iterator for RootsIter<'_> {
    type Item = *mut ObjHeader;

    fn next(&mut self) -> Option<*mut ObjHeader> {
        if self.node == SpecialRefRegistry::roots_tail() {
            return None;
        }
        // The rc is ignored at yield time: if it drops to zero during the
        // scan it is fine to conservatively keep the object a root for this
        // cycle. Only the collector thread clears targets, and that happens
        // after the walk.
        // SAFETY: the walker is the only deleter; nodes it holds are alive.
        let obj = unsafe { self.node.as_ref() }.obj().load(Ordering::Relaxed);
        self.node = self.registry.next_root(self.node, usize::MAX);
        Some(obj)
    }
}

/// Locked iteration over every published node. Obtained from
/// [`SpecialRefRegistry::lock_for_iter`]; holds the registry mutex for its
/// whole lifetime.
pub struct AllIterable<'a> {
    guard: MutexGuard<'a, NodeList>,
    cursor: *mut Node,
    #[cfg_attr(not(feature = "gc_logging"), allow(dead_code))]
    erased: usize,
}

impl AllIterable<'_> {
    /// Advance past (and erase) disposed nodes starting at `it`.
    ///
    /// A disposed node still linked in the roots list is left for the next
    /// cycle: erasing it now would race the roots walk. `rc == DISPOSED`
    /// excludes in-flight retains (no facade owns the node any more), and a
    /// null `next_root` excludes the walker, so erasure is safe.
    fn skip_dead(&mut self, mut it: *mut Node) -> *mut Node {
        while let Some(node) = NonNull::new(it) {
            // SAFETY: the node is owned by the locked all-list.
            let r = unsafe { node.as_ref() };
            if r.rc().load(Ordering::Acquire) != DISPOSED {
                break;
            }
            if !r.next_root().load(Ordering::Relaxed).is_null() {
                // Still in the roots list; wait for the next root scan to
                // unlink it before erasing.
                // SAFETY: node is linked in the locked list.
                it = unsafe { NodeList::next(node) };
                continue;
            }
            // SAFETY: as above.
            it = unsafe { NodeList::next(node) };
            // SAFETY: node is linked in the locked list; after the checks
            // above nothing else can reach it, so destroying it is safe.
            drop(unsafe { self.guard.unlink(node) });
            self.erased += 1;
        }
        it
    }

    /// The next live node's target slot, or None when the list is
    /// exhausted. The collector stores null through the slot (release) for
    /// targets that did not survive marking.
    pub fn next_slot(&mut self) -> Option<&AtomicPtr<ObjHeader>> {
        let node = NonNull::new(self.cursor)?;
        // SAFETY: cursor always points at a node of the locked list.
        let next = unsafe { NodeList::next(node) };
        self.cursor = self.skip_dead(next);
        // SAFETY: the yielded node was checked alive and is owned by the
        // locked all-list, which cannot shrink past it while the guard is
        // held.
        Some(unsafe { node.as_ref() }.obj())
    }
}

impl Drop for AllIterable<'_> {
    fn drop(&mut self) {
        #[cfg(feature = "gc_logging")]
        if self.erased > 0 {
            tracing::debug!(
                target: "gc::special_refs",
                erased = self.erased,
                "erased disposed special refs during locked iteration"
            );
        }
    }
}
