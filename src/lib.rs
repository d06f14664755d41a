//! # Special-reference registry
//!
//! Sits between a tracing garbage collector and external code holding
//! handles into the managed heap.
//!
//! ## Handle flavors
//!
//! - [`StableRef`] — pins its target into the GC root set while alive
//! - [`WeakRef`] — observes its target; invalidated when the target dies
//! - [`BackRef`] — carries a foreign runtime's external refcount: a stable
//!   ref while the count is positive, a weak ref at zero, atomically
//!   re-promotable via `try_retain`
//!
//! ## Design
//!
//! - Creation stages nodes in a per-thread [`queue::ThreadQueue`]; a publish
//!   point batches them into the global registry
//! - The root set view is a lock-free singly-linked list: multi-producer
//!   push at the head, single-walker (the collector) read-and-delete
//! - Dispose is encoded as an `i32::MIN` bias on the refcount, so disposal
//!   and the pre-dispose count are observed in one atomic op
//! - The collector's locked sweep erases nodes only once they are disposed
//!   *and* out of the roots list, which stands in for a grace period

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod back_ref;
mod node;
pub mod object;
pub mod queue;
pub mod registry;
pub mod shared_holder;
pub mod stable_ref;
pub mod thread_state;
pub mod weak_counter;
pub mod weak_ref;

pub use back_ref::BackRef;
pub use node::RawSpecialRef;
pub use object::ObjHeader;
pub use queue::{ThreadQueue, publish_current_thread};
pub use registry::{AllIterable, RegistryConfig, RootsIter, RootsIterable, SpecialRefRegistry};
pub use shared_holder::SharedRefHolder;
pub use stable_ref::StableRef;
pub use thread_state::{RunnableGuard, ThreadState};
pub use weak_counter::{WeakCounterTable, WeakReferenceCounter};
pub use weak_ref::WeakRef;
