//! Memory pool for constant-sized elements.
//!
//! A [`Pool`] hands out equally sized slots carved from large clusters,
//! coalesces freed neighbours into runs, and indexes those runs in
//! length-bucketed free lists for amortised constant-time allocation.
//! Intended for workloads that churn through huge numbers of small objects
//! of one footprint (interpreter cells, tree nodes, list links) where the
//! general-purpose heap is too slow and fragments too much.
//!
//! Pools are not thread safe; callers serialise externally.

mod cluster;
mod heap;
mod list;
mod pool;
mod run;
mod stats;

pub use heap::{
    global_hooks, set_global_hooks, AcquireFn, HeapHooks, PoolError, ReleaseFn,
};
pub use pool::{set_destroy_hook, set_init_hook, LifecycleHook, Pool};
pub use run::BUCKETS;
pub use stats::{snapshot, Counter, PoolStats};

// Tests touching process-global state (default hooks, lifecycle observers,
// stats gauges) take this lock for writing; everything else reads.
#[cfg(test)]
pub(crate) static TEST_MUTEX: std::sync::RwLock<()> = std::sync::RwLock::new(());
