//! A concurrent, append-at-head singly linked collection with multi-version
//! visibility and safe deferred reclamation.
//!
//! Multiple threads insert, logically remove, and traverse elements without
//! mutual exclusion; each traversal observes a consistent point-in-time view
//! determined by a monotonic version counter (the "commit counter"). Memory
//! safety in the absence of locks comes from per-thread hazard pointers and
//! a retired list drained only once no observer could still reach a removed
//! node.
//!
//! Three pieces, composed leaves-first:
//! - [`Domain`](domain::Domain): process-scoped registry of per-thread
//!   reclamation state, shared by any number of lists.
//! - [`List`](list::List): one head pointer plus a monotonic commit counter,
//!   bound to exactly one domain.
//! - [`ListIter`](iter::ListIter) and [`List::reclaim`]: the operations that
//!   read/mutate list state and cooperate through the domain's hazard
//!   pointers and active snapshots.
//!
//! Descended from `rs_lockfree`'s hazard-pointer stack/queue pair
//! (`lockfree_stack`/`lockfree_queue` on top of `HazardEpoch`), generalized
//! into a single multi-version collection with a growable thread registry.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "max_thread_count_4096")] {
        /// Initial domain slot-table capacity hint for this build (see
        /// [`domain::DEFAULT_CAPACITY`]). The table still grows past this at
        /// runtime if more threads register; this only sizes the first
        /// allocation.
        pub const MAX_THREAD_COUNT: usize = 4096;
    } else if #[cfg(feature = "max_thread_count_256")] {
        pub const MAX_THREAD_COUNT: usize = 256;
    } else {
        pub const MAX_THREAD_COUNT: usize = 16;
    }
}

pub mod domain;
pub mod error;
pub mod iter;
pub mod list;
mod node;
mod reclaim;
mod spin_lock;
mod util;

pub use domain::Domain;
pub use error::Status;
pub use iter::ListIter;
pub use list::{Destructor, List};
