//! Registry correctness tests
//!
//! These tests drive the special-reference registry the way a runtime does:
//! mutator threads create, retain, release and dispose handles while a
//! simulated collector scans roots and sweeps the all-list at quiescent
//! points.

use gc_special_refs::{
    BackRef, ObjHeader, SpecialRefRegistry, StableRef, ThreadQueue, WeakRef,
    publish_current_thread,
};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

static REGISTRY_LOCK: Mutex<()> = Mutex::new(());

/// Serialize tests touching the process-wide registry and start each from a
/// clean slate. Leftovers staged on this thread are published first so the
/// clear can destroy them.
fn registry_guard() -> MutexGuard<'static, ()> {
    let guard = REGISTRY_LOCK.lock();
    publish_current_thread();
    SpecialRefRegistry::instance().clear_for_tests();
    guard
}

fn collect_roots(registry: &SpecialRefRegistry) -> Vec<*mut ObjHeader> {
    registry.roots().into_iter().filter(|o| !o.is_null()).collect()
}

/// Simulate the collector's post-mark phase: clear targets not in `live`,
/// erasing disposed nodes along the way.
fn sweep_keeping(registry: &SpecialRefRegistry, live: &[*mut ObjHeader]) {
    let mut iter = registry.lock_for_iter();
    while let Some(slot) = iter.next_slot() {
        let target = slot.load(Ordering::Relaxed);
        if !target.is_null() && !live.contains(&target) {
            slot.store(ptr::null_mut(), Ordering::Release);
        }
    }
}

#[test]
fn test_stable_ref_lifecycle_through_collection() {
    let _guard = registry_guard();
    let registry = SpecialRefRegistry::instance();
    let mut obj = ObjHeader::new();

    let stable = StableRef::create(&mut obj);
    publish_current_thread();

    // The target must be a root while the stable ref is alive.
    assert_eq!(collect_roots(registry), vec![&mut obj as *mut ObjHeader]);
    assert_eq!(registry.all_size_for_tests(), 1);

    stable.dispose();

    // Next cycle: the root scan drops it, the locked sweep destroys it.
    assert!(collect_roots(registry).is_empty());
    sweep_keeping(registry, &[]);
    assert_eq!(registry.all_size_for_tests(), 0);
}

#[test]
fn test_weak_ref_outlives_target() {
    let _guard = registry_guard();
    let registry = SpecialRefRegistry::instance();
    let mut obj = ObjHeader::new();

    let weak = WeakRef::create(&mut obj);
    publish_current_thread();

    // Nothing keeps the target alive; the collector reclaims it.
    assert!(collect_roots(registry).is_empty());
    sweep_keeping(registry, &[]);

    let mut slot: *mut ObjHeader = ptr::null_mut();
    assert!(weak.try_ref(&mut slot).is_null());

    weak.dispose();
    sweep_keeping(registry, &[]);
    assert_eq!(registry.all_size_for_tests(), 0);
}

#[test]
fn test_back_ref_refcount_oscillation() {
    let _guard = registry_guard();
    let registry = SpecialRefRegistry::instance();
    let mut obj = ObjHeader::new();

    let back = BackRef::create(&mut obj);
    publish_current_thread();
    let raw = back.into_raw();

    // rc 1: target is a root.
    // SAFETY: raw came from into_raw above.
    let back = unsafe { BackRef::from_raw(raw) };
    assert_eq!(collect_roots(registry), vec![&mut obj as *mut ObjHeader]);

    // rc 1 -> 0: not a root any more.
    back.release();
    assert!(collect_roots(registry).is_empty());

    // rc 0 -> 1: a root again, same node identity.
    back.retain();
    assert_eq!(collect_roots(registry), vec![&mut obj as *mut ObjHeader]);
    assert_eq!(back.into_raw(), raw);

    // SAFETY: as above.
    let back = unsafe { BackRef::from_raw(raw) };
    back.release();
    back.dispose();
    collect_roots(registry);
    sweep_keeping(registry, &[]);
    assert_eq!(registry.all_size_for_tests(), 0);
}

#[test]
fn test_fast_local_deletion_never_reaches_registry() {
    let _guard = registry_guard();
    let registry = SpecialRefRegistry::instance();
    let mut obj = ObjHeader::new();

    let stable = StableRef::create(&mut obj);
    stable.dispose();
    publish_current_thread();

    assert_eq!(registry.all_size_for_tests(), 0);
    assert!(collect_roots(registry).is_empty());
}

#[test]
fn test_disposed_but_still_rooted_takes_two_cycles() {
    let _guard = registry_guard();
    let registry = SpecialRefRegistry::instance();
    let mut obj = ObjHeader::new();

    // Boost the external count, then dispose with the extra retains still
    // pending, the way autorelease-heavy foreign deinit paths do.
    let back = BackRef::create(&mut obj);
    publish_current_thread();
    let raw = back.into_raw();
    // SAFETY: raw came from into_raw above.
    let back = unsafe { BackRef::from_raw(raw) };
    back.retain();
    assert_eq!(collect_roots(registry), vec![&mut obj as *mut ObjHeader]);
    back.dispose();

    // The pending releases trickle in after dispose and balance the count
    // out; the node is now fully disposed but still linked in the roots
    // list.
    // SAFETY: the node is not destroyed until the sweep below.
    unsafe { BackRef::from_raw(raw) }.release();
    unsafe { BackRef::from_raw(raw) }.release();

    // Cycle 1: the locked sweep must leave it alone (still rooted).
    sweep_keeping(registry, &[&mut obj as *mut ObjHeader]);
    assert_eq!(registry.all_size_for_tests(), 1);

    // The root scan unlinks it...
    assert!(collect_roots(registry).is_empty());

    // ...so cycle 2's sweep erases and destroys it.
    sweep_keeping(registry, &[]);
    assert_eq!(registry.all_size_for_tests(), 0);
}

#[test]
fn test_concurrent_retain_release_pairs_net_to_zero() {
    let _guard = registry_guard();
    let registry = SpecialRefRegistry::instance();
    let mut obj = ObjHeader::new();

    let back = BackRef::create(&mut obj);
    publish_current_thread();

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..10_000 {
                    back.retain();
                    back.release();
                }
            });
        }
    });

    // Balanced pairs left the count at its pre-state (1): still a root.
    assert_eq!(collect_roots(registry), vec![&mut obj as *mut ObjHeader]);

    // And one release away from not being one.
    back.release();
    assert!(collect_roots(registry).is_empty());

    back.dispose();
    sweep_keeping(registry, &[]);
    assert_eq!(registry.all_size_for_tests(), 0);
}

#[test]
fn test_concurrent_promoter_vs_walker() {
    let _guard = registry_guard();
    let registry = SpecialRefRegistry::instance();
    let mut obj = ObjHeader::new();

    let back = BackRef::create(&mut obj);
    publish_current_thread();
    back.release();

    let stop = AtomicBool::new(false);
    thread::scope(|s| {
        // Mutator: oscillate the count so every scan races a promotion.
        s.spawn(|| {
            for _ in 0..20_000 {
                back.retain();
                back.release();
            }
            back.retain();
            stop.store(true, Ordering::Release);
        });
        // Collector: keep walking (single walker) and demoting.
        s.spawn(|| {
            while !stop.load(Ordering::Acquire) {
                for root in registry.roots() {
                    std::hint::black_box(root);
                }
            }
        });
    });

    // Quiescence with rc 1: whichever way each race went, the node must
    // have ended up in the roots list.
    assert_eq!(collect_roots(registry), vec![&mut obj as *mut ObjHeader]);

    back.release();
    back.dispose();
    collect_roots(registry);
    sweep_keeping(registry, &[]);
    assert_eq!(registry.all_size_for_tests(), 0);
}

#[test]
fn test_concurrent_creators_publish_all_roots() {
    let _guard = registry_guard();
    let registry = SpecialRefRegistry::instance();

    const THREADS: usize = 8;
    const PER_THREAD: usize = 64;
    let mut objects: Vec<ObjHeader> = (0..THREADS * PER_THREAD).map(|_| ObjHeader::new()).collect();
    let ptrs: Vec<*mut ObjHeader> = objects.iter_mut().map(|o| o as *mut ObjHeader).collect();

    struct SendPtr(*mut ObjHeader);
    // SAFETY: the pointers outlive the scope and are only stored, not
    // dereferenced, by the handles.
    unsafe impl Send for SendPtr {}

    let stables: Vec<StableRef> = thread::scope(|s| {
        let handles: Vec<_> = ptrs
            .chunks(PER_THREAD)
            .map(|chunk| {
                let chunk: Vec<SendPtr> = chunk.iter().map(|p| SendPtr(*p)).collect();
                s.spawn(move || {
                    // Thread-exit publish covers these creations.
                    chunk
                        .into_iter()
                        .map(|p| StableRef::create(p.0))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    // Every strong handle's target is yielded at least once, with no
    // duplicates in the roots list.
    let roots = collect_roots(registry);
    let unique: HashSet<_> = roots.iter().copied().collect();
    assert_eq!(roots.len(), unique.len());
    assert_eq!(unique, ptrs.iter().copied().collect::<HashSet<_>>());

    for stable in stables {
        stable.dispose();
    }
    collect_roots(registry);
    sweep_keeping(registry, &[]);
    assert_eq!(registry.all_size_for_tests(), 0);
}

#[test]
fn test_explicit_queue_publish_then_sweep_clears_weak() {
    let _guard = registry_guard();
    let registry = SpecialRefRegistry::instance();
    let mut obj_live = ObjHeader::new();
    let mut obj_dead = ObjHeader::new();
    let mut queue = ThreadQueue::new();

    let stable = queue.create_stable_ref(&mut obj_live);
    let weak = queue.create_weak_ref(&mut obj_dead);
    queue.publish();

    // Mark phase sees only the live object as a root; sweep clears the
    // other target.
    assert_eq!(collect_roots(registry), vec![&mut obj_live as *mut ObjHeader]);
    sweep_keeping(registry, &[&mut obj_live as *mut ObjHeader]);

    let mut slot: *mut ObjHeader = ptr::null_mut();
    assert!(weak.try_ref(&mut slot).is_null());
    assert_eq!(stable.get(), &mut obj_live as *mut ObjHeader);

    stable.dispose();
    weak.dispose();
    collect_roots(registry);
    sweep_keeping(registry, &[]);
    assert_eq!(registry.all_size_for_tests(), 0);
}
