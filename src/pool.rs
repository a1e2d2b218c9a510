//! The pool itself: bucketed free lists over clustered slot storage.
//!
//! Slots of one fixed size are carved out of large clusters. Free slots form
//! maximal runs encoded in place (see `run.rs`) and indexed two ways:
//! per-cluster endpoint bitmaps for O(1) coalescing, and pool-wide
//! length-bucketed lists for O(1) allocation.

use std::ptr::NonNull;
use std::sync::Mutex;

use crate::cluster::{Cluster, Geometry};
use crate::heap::{self, HeapHooks, PoolError};
use crate::list::LinkedList;
use crate::run::{self, bucket_index, Endpoint, FreeRun, RunNode, BUCKETS};
use crate::stats;

/// Observer invoked when a pool is constructed or destroyed.
pub type LifecycleHook = fn(&Pool);

static INIT_HOOK: Mutex<Option<LifecycleHook>> = Mutex::new(None);
static DESTROY_HOOK: Mutex<Option<LifecycleHook>> = Mutex::new(None);

/// Installs (or clears) the process-global observer called after every pool
/// construction.
///
/// # Panics
///
/// Panics if the hook lock is poisoned.
pub fn set_init_hook(hook: Option<LifecycleHook>) {
    *INIT_HOOK.lock().unwrap() = hook;
}

/// Installs (or clears) the process-global observer called before every pool
/// teardown.
///
/// # Panics
///
/// Panics if the hook lock is poisoned.
pub fn set_destroy_hook(hook: Option<LifecycleHook>) {
    *DESTROY_HOOK.lock().unwrap() = hook;
}

/// Fixed-element-size memory pool.
///
/// Hands out word-aligned slots of one size in amortised constant time.
/// Not thread safe: callers serialise externally. Slot contents are never
/// zeroed or otherwise initialised.
pub struct Pool {
    /// Free runs threaded across all clusters, bucketed by length class.
    buckets: [LinkedList<FreeRun>; BUCKETS],
    /// Newest first, so the membership scan hits the busiest cluster early.
    clusters: Vec<Box<Cluster>>,
    /// Most recent cluster to become entirely free. Kept alive as hysteresis
    /// against alloc/free churn sitting exactly on a cluster boundary;
    /// released when a second cluster empties out. Identified by base
    /// address.
    linger: Option<NonNull<u8>>,
    geom: Geometry,
    free_slots: usize,
    clusters_allocated: usize,
    finalizer: Option<fn(NonNull<u8>)>,
    hooks: HeapHooks,
}

// Safety: the pool exclusively owns its clusters and every free-list node
// lives in slot storage of those clusters; hook and finalizer function
// pointers carry no thread affinity.
unsafe impl Send for Pool {}

impl Pool {
    /// Creates an empty pool for elements of `elem_size` bytes, grouped
    /// `slots_per_cluster` at a time.
    ///
    /// `elem_size` is rounded up to the free-run overlay size and to a word
    /// multiple. The optional `finalizer` runs on every slot still live when
    /// the pool is destroyed; it is never called on `free`.
    ///
    /// Cluster storage comes from the process-global hooks current at this
    /// call (see [`crate::set_global_hooks`]).
    ///
    /// # Panics
    ///
    /// Panics on a zero slot count or when the cluster size overflows.
    #[must_use]
    pub fn new(
        elem_size: usize,
        slots_per_cluster: usize,
        finalizer: Option<fn(NonNull<u8>)>,
    ) -> Pool {
        Self::with_hooks(elem_size, slots_per_cluster, finalizer, heap::global_hooks())
    }

    /// Like [`Pool::new`], with an explicit acquire/release pair.
    ///
    /// # Panics
    ///
    /// Panics on a zero slot count or when the cluster size overflows.
    #[must_use]
    pub fn with_hooks(
        elem_size: usize,
        slots_per_cluster: usize,
        finalizer: Option<fn(NonNull<u8>)>,
        hooks: HeapHooks,
    ) -> Pool {
        let pool = Pool {
            buckets: [LinkedList::new(); BUCKETS],
            clusters: Vec::new(),
            linger: None,
            geom: Geometry::new(elem_size, slots_per_cluster),
            free_slots: 0,
            clusters_allocated: 0,
            finalizer,
            hooks,
        };
        let hook = *INIT_HOOK.lock().unwrap();
        if let Some(hook) = hook {
            hook(&pool);
        }
        pool
    }

    /// Slots allocatable without acquiring another cluster.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free_slots
    }

    /// Clusters currently held.
    #[must_use]
    pub fn clusters(&self) -> usize {
        self.clusters_allocated
    }

    /// Element size after rounding.
    #[must_use]
    pub fn elem_size(&self) -> usize {
        self.geom.elem_size
    }

    #[must_use]
    pub fn slots_per_cluster(&self) -> usize {
        self.geom.slots
    }

    /// Acquires clusters until at least `count` slots are free.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::AcquireFailed`] when a cluster cannot be
    /// acquired before the quota is met. Clusters acquired up to that point
    /// stay in the pool and remain counted.
    pub fn reserve(&mut self, count: usize) -> Result<(), PoolError> {
        while self.free_slots < count {
            self.grow()?;
        }
        Ok(())
    }

    /// Allocates one slot.
    ///
    /// `near` is a locality hint: an address previously returned by this
    /// pool that the new slot should ideally sit close to. A hint also tells
    /// the pool the caller does not need an isolated cluster, so it only
    /// grows when it is completely out of slots. Without a hint the pool
    /// additionally grows whenever less than half a cluster is free.
    ///
    /// The returned slot is uninitialised.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::AcquireFailed`] when no slot is free and no new
    /// cluster can be acquired.
    pub fn alloc(&mut self, near: Option<NonNull<u8>>) -> Result<NonNull<u8>, PoolError> {
        let wants_cluster = self.free_slots == 0
            || (near.is_none() && self.free_slots < self.geom.slots / 2);
        if wants_cluster {
            match self.grow() {
                // A fresh cluster also voids the hint: nothing benefits from
                // proximity to a stranger.
                Ok(()) => {}
                Err(err) => {
                    if self.free_slots == 0 {
                        return Err(err);
                    }
                }
            }
        }
        // TODO: windowed bitmap scan around `near` to pick a neighbouring
        // run instead of the first bucket fit.

        let Some(node) = self.take_run(1) else {
            unreachable!("{} slots free but every bucket is empty", self.free_slots);
        };
        // Safety: bucket nodes are run heads living in free slot storage.
        let len = unsafe { node.as_ref() }.data.len;
        let addr = node.cast::<u8>();
        let ci = self
            .cluster_of(addr)
            .expect("free-list node outside every cluster");
        let geom = self.geom;
        let index = self.clusters[ci].index_of(&geom, addr);

        // Safety: the node is linked in the bucket matching its length.
        unsafe { self.buckets[bucket_index(len)].remove(node) };
        let cluster = &mut self.clusters[ci];
        cluster.clear_bit(&geom, index);

        if len > 1 {
            let rest = len - 1;
            let next = cluster.slot(&geom, index + 1);
            if rest == 1 {
                // The survivor was the run's tail, so its endpoint bit is
                // already set; it just becomes a run of its own.
                debug_assert!(cluster.bit(&geom, index + 1));
                // Safety: `next` is free slot storage we own.
                unsafe { self.buckets[bucket_index(1)].append(FreeRun { len: 1 }, next) };
            } else {
                cluster.set_bit(&geom, index + 1);
                // Safety: `next` heads the shortened run; the old tail keeps
                // its bit and must point at the new head.
                unsafe {
                    let head = self.buckets[bucket_index(rest)]
                        .append(FreeRun { len: rest }, next);
                    run::write_tail(cluster.slot(&geom, index + len - 1), head);
                }
            }
        }

        #[cfg(debug_assertions)]
        cluster.live.insert(index);
        self.free_slots -= 1;
        stats::SLOTS_LIVE.add(1);
        Ok(addr)
    }

    /// Returns a slot to the pool, merging it with any free neighbours.
    ///
    /// # Safety
    ///
    /// `slot` must have been returned by `alloc` on this pool and not freed
    /// since. Passing the slot by value is the hand-over: the caller must
    /// not keep any copy of the address.
    ///
    /// # Panics
    ///
    /// Panics when `slot` does not belong to this pool or is already free
    /// (double frees landing inside a run are caught in debug builds only).
    pub unsafe fn free(&mut self, slot: NonNull<u8>) {
        let geom = self.geom;
        let Some(ci) = self.cluster_of(slot) else {
            panic!("pointer {slot:p} does not belong to this pool");
        };
        let cluster = &mut self.clusters[ci];
        let index = cluster.index_of(&geom, slot);
        assert!(
            !cluster.bit(&geom, index),
            "double free: {slot:p} is already a free-run endpoint",
        );
        #[cfg(debug_assertions)]
        {
            assert!(
                cluster.live.contains(index),
                "double free: {slot:p} lies inside a free run",
            );
            cluster.live.set(index, false);
        }

        let mut start = index;
        let mut len = 1usize;

        // Merge with the run ending just before us.
        if index > 0 && cluster.bit(&geom, index - 1) {
            // Safety: the set bit makes index-1 a run endpoint with a valid
            // overlay.
            match unsafe { run::endpoint(cluster.slot(&geom, index - 1)) } {
                Endpoint::Head { len: prev_len } => {
                    // A head bordering a live slot can only be a run of one.
                    debug_assert_eq!(prev_len, 1);
                    let prev = cluster.slot(&geom, index - 1).cast::<RunNode>();
                    // Safety: run heads are linked in their length's bucket.
                    unsafe { self.buckets[bucket_index(prev_len)].remove(prev) };
                    start -= 1;
                    len += 1;
                    // Its bit survives: index-1 heads the merged run.
                }
                Endpoint::Tail { first } => {
                    // Safety: tails point back at a linked head.
                    let prev_len = unsafe { first.as_ref() }.data.len;
                    // Safety: see above.
                    unsafe { self.buckets[bucket_index(prev_len)].remove(first) };
                    cluster.clear_bit(&geom, index - 1);
                    start = cluster.index_of(&geom, first.cast::<u8>());
                    len += prev_len;
                }
            }
        } else {
            // No merge on the left: the freed slot is the new left endpoint.
            cluster.set_bit(&geom, index);
        }

        // Merge with the run starting just after us.
        let next = start + len;
        let mut merged_right = false;
        if next < geom.slots && cluster.bit(&geom, next) {
            merged_right = true;
            // Safety: endpoint bit set at `next`.
            match unsafe { run::endpoint(cluster.slot(&geom, next)) } {
                Endpoint::Head { len: next_len } => {
                    let head = cluster.slot(&geom, next).cast::<RunNode>();
                    // Safety: run heads are linked in their length's bucket.
                    unsafe { self.buckets[bucket_index(next_len)].remove(head) };
                    if next_len == 1 {
                        // The absorbed single keeps its bit and becomes the
                        // merged run's tail.
                        len += 1;
                    } else {
                        // The absorbed head turns interior; the absorbed
                        // run's tail bit already marks the merged end.
                        cluster.clear_bit(&geom, next);
                        len += next_len;
                    }
                }
                Endpoint::Tail { .. } => {
                    unreachable!("free run ends at the boundary of a live slot");
                }
            }
        }

        let end = start + len - 1;
        if !merged_right && len > 1 {
            cluster.set_bit(&geom, end);
        }

        // Re-encode the merged run and file it by its new length.
        let head_slot = cluster.slot(&geom, start);
        // Safety: `head_slot` is the first slot of a free run we own.
        let node = unsafe { self.buckets[bucket_index(len)].append(FreeRun { len }, head_slot) };
        if len > 1 {
            // Safety: `end` is the run's last slot.
            unsafe { run::write_tail(cluster.slot(&geom, end), node) };
        }

        self.free_slots += 1;
        stats::SLOTS_LIVE.sub(1);

        if len == geom.slots {
            self.retire(ci);
        }
    }

    /// Finalises every live slot, releases all clusters and resets the pool
    /// to its just-constructed state. The pool is reusable afterwards.
    ///
    /// Dropping the pool does the same.
    pub fn destroy(&mut self) {
        let hook = *DESTROY_HOOK.lock().unwrap();
        if let Some(hook) = hook {
            hook(self);
        }

        let geom = self.geom;
        let finalizer = self.finalizer;
        let hooks = self.hooks;
        let live_slots = self.clusters_allocated * geom.slots - self.free_slots;

        for cluster in self.clusters.drain(..) {
            if let Some(dtor) = finalizer {
                let mut i = 0;
                while i < geom.slots {
                    if cluster.bit(&geom, i) {
                        // Safety: reached from below, a set bit opens a free
                        // run, so the slot holds a head overlay.
                        match unsafe { run::endpoint(cluster.slot(&geom, i)) } {
                            Endpoint::Head { len } => i += len,
                            Endpoint::Tail { .. } => {
                                unreachable!("run tail without a preceding head")
                            }
                        }
                    } else {
                        dtor(cluster.slot(&geom, i));
                        i += 1;
                    }
                }
            }
            // Safety: pairs with the acquire in grow(); no slot of the
            // cluster is reachable once the lists are cleared below.
            unsafe { cluster.release(&geom, &hooks) };
        }

        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.linger = None;
        stats::CLUSTERS_LIVE.sub(self.clusters_allocated);
        stats::CLUSTER_BYTES.sub(self.clusters_allocated * geom.cluster_bytes);
        stats::SLOTS_LIVE.sub(live_slots);
        self.clusters_allocated = 0;
        self.free_slots = 0;
    }

    /// Exhaustive consistency check: walks every cluster's bitmap against
    /// every bucket. Intended for debug builds and stress tests; cost is
    /// proportional to pool size.
    ///
    /// # Panics
    ///
    /// Panics on any internal inconsistency.
    pub fn verify(&self) {
        let geom = self.geom;
        assert_eq!(
            self.clusters.len(),
            self.clusters_allocated,
            "cluster count out of sync",
        );
        if let Some(lingering) = self.linger {
            assert!(
                self.clusters.iter().any(|c| c.base() == lingering),
                "linger cluster missing from the cluster list",
            );
        }

        let bucket_nodes: usize = self.buckets.iter().map(LinkedList::len).sum();
        let mut runs_seen = 0usize;
        let mut free_sum = 0usize;

        for cluster in &self.clusters {
            let mut runs: Vec<(usize, usize)> = Vec::new();
            let mut bits_expected = 0usize;

            for (bi, bucket) in self.buckets.iter().enumerate() {
                for node in bucket.iter() {
                    let addr = node.cast::<u8>();
                    if !cluster.contains(&geom, addr) {
                        continue;
                    }
                    // Safety: bucket nodes are run heads in free slot
                    // storage.
                    let len = unsafe { node.as_ref() }.data.len;
                    assert_eq!(
                        bi,
                        bucket_index(len),
                        "run of length {len} filed in bucket {bi}",
                    );
                    let s = cluster.index_of(&geom, addr);
                    let e = s + len - 1;
                    assert!(e < geom.slots, "run [{s}, {e}] overruns its cluster");
                    assert!(cluster.bit(&geom, s), "run head at {s} has no endpoint bit");
                    for i in s + 1..e {
                        assert!(!cluster.bit(&geom, i), "interior endpoint bit at {i}");
                    }
                    if len == 1 {
                        bits_expected += 1;
                    } else {
                        assert!(cluster.bit(&geom, e), "run tail at {e} has no endpoint bit");
                        // Safety: `e` is the tail of a run of length >= 2.
                        match unsafe { run::endpoint(cluster.slot(&geom, e)) } {
                            Endpoint::Tail { first } => assert_eq!(
                                first, node,
                                "tail at {e} does not point back at its head",
                            ),
                            Endpoint::Head { .. } => {
                                panic!("tail slot at {e} reads as a head")
                            }
                        }
                        bits_expected += 2;
                    }
                    runs.push((s, e));
                    runs_seen += 1;
                    free_sum += len;
                }
            }

            assert_eq!(
                bits_expected,
                cluster.set_bits(&geom),
                "stray endpoint bits in cluster {:p}",
                cluster.base(),
            );
            runs.sort_unstable();
            for pair in runs.windows(2) {
                assert!(
                    pair[0].1 + 1 < pair[1].0,
                    "free runs {:?} and {:?} were not coalesced",
                    pair[0],
                    pair[1],
                );
            }
        }

        assert_eq!(bucket_nodes, runs_seen, "bucket node outside every cluster");
        assert_eq!(free_sum, self.free_slots, "free count out of sync with runs");
    }

    /// Acquires one cluster and seeds it as a single all-free run.
    fn grow(&mut self) -> Result<(), PoolError> {
        let geom = self.geom;
        let mut cluster = Cluster::acquire(&geom, &self.hooks)
            .ok_or(PoolError::AcquireFailed {
                bytes: geom.cluster_bytes,
            })?;

        let head_slot = cluster.slot(&geom, 0);
        // Safety: freshly acquired storage; slot 0 becomes the run head.
        let head = unsafe {
            self.buckets[bucket_index(geom.slots)].append(FreeRun { len: geom.slots }, head_slot)
        };
        cluster.set_bit(&geom, 0);
        if geom.slots > 1 {
            cluster.set_bit(&geom, geom.slots - 1);
            // Safety: the last slot becomes the run tail.
            unsafe { run::write_tail(cluster.slot(&geom, geom.slots - 1), head) };
        }

        self.clusters.insert(0, cluster);
        self.free_slots += geom.slots;
        self.clusters_allocated += 1;
        stats::CLUSTERS_LIVE.add(1);
        stats::CLUSTER_BYTES.add(geom.cluster_bytes);
        Ok(())
    }

    /// First run long enough for `want`, scanning buckets upward. Runs that
    /// fell below their bucket's floor through splitting are skipped by the
    /// length check.
    fn take_run(&self, want: usize) -> Option<NonNull<RunNode>> {
        for bucket in &self.buckets[bucket_index(want)..] {
            if bucket.is_empty() {
                continue;
            }
            for node in bucket.iter() {
                // Safety: bucket nodes are run heads in free slot storage.
                if unsafe { node.as_ref() }.data.len >= want {
                    return Some(node);
                }
            }
        }
        None
    }

    /// Index of the cluster whose address range contains `addr`.
    fn cluster_of(&self, addr: NonNull<u8>) -> Option<usize> {
        let geom = &self.geom;
        self.clusters.iter().position(|c| c.contains(geom, addr))
    }

    /// Called when cluster `ci` has just become entirely free. Keeps it as
    /// the lingering cluster; an older lingering cluster that is still
    /// entirely free is released.
    fn retire(&mut self, ci: usize) {
        let base = self.clusters[ci].base();
        if let Some(lingering) = self.linger {
            if lingering != base {
                let li = self
                    .clusters
                    .iter()
                    .position(|c| c.base() == lingering)
                    .expect("linger cluster missing from the cluster list");
                // Safety: between operations the cluster encoding is
                // consistent.
                if unsafe { self.clusters[li].fully_free(&self.geom) } {
                    self.release_cluster(li);
                }
            }
        }
        self.linger = Some(base);
    }

    /// Releases an entirely free cluster.
    fn release_cluster(&mut self, li: usize) {
        let geom = self.geom;
        let cluster = self.clusters.remove(li);
        let head = cluster.slot(&geom, 0).cast::<RunNode>();
        // Safety: the full-cluster run is headed at slot 0 and linked in the
        // bucket for its length; unlink before the storage goes away.
        unsafe { self.buckets[bucket_index(geom.slots)].remove(head) };
        self.free_slots -= geom.slots;
        self.clusters_allocated -= 1;
        stats::CLUSTERS_LIVE.sub(1);
        stats::CLUSTER_BYTES.sub(geom.cluster_bytes);
        // Safety: pairs with the acquire in grow().
        unsafe { cluster.release(&geom, &self.hooks) };
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.destroy();
    }
}
