use std::mem::size_of;
use std::ptr::NonNull;

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

use crate::heap::HeapHooks;
use crate::run::{self, Endpoint, SLOT_OVERLAY_SIZE};

const WORD_BITS: usize = usize::BITS as usize;

/// Sizing shared by every cluster of a pool, fixed at construction.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Geometry {
    /// Rounded element size: at least the free-run overlay, word aligned.
    pub elem_size: usize,
    /// Slots per cluster.
    pub slots: usize,
    /// Bytes of the endpoint bitmap at the front of every cluster block,
    /// rounded up to whole words.
    pub bitmap_bytes: usize,
    /// Total bytes per cluster block: bitmap plus slot array.
    pub cluster_bytes: usize,
}

impl Geometry {
    /// # Panics
    ///
    /// Panics on a zero slot count or when the cluster size overflows.
    pub fn new(elem_size: usize, slots: usize) -> Self {
        assert!(slots > 0, "a cluster needs at least one slot");

        // A free slot must be able to hold either run overlay, and slots are
        // addressed at word granularity.
        let elem_size = elem_size
            .max(SLOT_OVERLAY_SIZE)
            .next_multiple_of(size_of::<usize>());
        let bitmap_bytes = slots.div_ceil(WORD_BITS) * size_of::<usize>();
        let cluster_bytes = elem_size
            .checked_mul(slots)
            .and_then(|bytes| bytes.checked_add(bitmap_bytes))
            .expect("cluster size overflows usize");

        Self {
            elem_size,
            slots,
            bitmap_bytes,
            cluster_bytes,
        }
    }
}

/// Pool-side handle to one cluster block.
///
/// The block itself — the run-endpoint bitmap followed by the slot array —
/// is a single allocation from the pool's acquire hook and goes back through
/// the release hook in one piece, so instrumented heaps see every byte that
/// scales with the slot count.
///
/// The bitmap does not track occupancy: a set bit means the slot is the
/// first or last slot of a free run. Live slots and run interiors are clear.
pub(crate) struct Cluster {
    block: NonNull<u8>,
    /// Which slots are currently handed out. Only for catching double frees
    /// that land inside a run, where the endpoint bits cannot tell.
    #[cfg(debug_assertions)]
    pub(crate) live: FixedBitSet,
}

// Safety: Cluster exclusively owns its block.
unsafe impl Send for Cluster {}

impl Cluster {
    /// Acquires a block for a new cluster and clears its bitmap. The caller
    /// seeds the initial all-free run and links it into a bucket.
    pub fn acquire(geom: &Geometry, hooks: &HeapHooks) -> Option<Box<Cluster>> {
        let block = (hooks.acquire)(geom.cluster_bytes)?;
        // Only the bitmap needs clearing; slots start uninitialised.
        // Safety: the block spans cluster_bytes >= bitmap_bytes.
        unsafe { block.as_ptr().write_bytes(0, geom.bitmap_bytes) };
        Some(Box::new(Cluster {
            block,
            #[cfg(debug_assertions)]
            live: FixedBitSet::with_capacity(geom.slots),
        }))
    }

    /// Gives the block back to the hooks.
    ///
    /// # Safety
    ///
    /// `hooks` must be the pair the block was acquired with, and no slot of
    /// this cluster may be referenced afterwards.
    pub unsafe fn release(self: Box<Self>, geom: &Geometry, hooks: &HeapHooks) {
        // Safety: the block came from the paired acquire with the same size.
        unsafe { (hooks.release)(self.block, geom.cluster_bytes) }
    }

    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.block
    }

    /// Address-range membership test over the whole block.
    pub fn contains(&self, geom: &Geometry, addr: NonNull<u8>) -> bool {
        let addr = addr.as_ptr() as usize;
        let base = self.block.as_ptr() as usize;
        addr >= base && addr < base + geom.cluster_bytes
    }

    /// Slot index of an address inside this cluster.
    pub fn index_of(&self, geom: &Geometry, addr: NonNull<u8>) -> usize {
        debug_assert!(self.contains(geom, addr));
        let slots_base = self.block.as_ptr() as usize + geom.bitmap_bytes;
        debug_assert!(
            addr.as_ptr() as usize >= slots_base,
            "pointer {addr:p} points into the cluster bitmap",
        );
        let offset = (addr.as_ptr() as usize).wrapping_sub(slots_base);
        debug_assert!(
            offset.is_multiple_of(geom.elem_size),
            "pointer {addr:p} is not aligned to the element size",
        );
        offset / geom.elem_size
    }

    /// Address of slot `index`.
    pub fn slot(&self, geom: &Geometry, index: usize) -> NonNull<u8> {
        debug_assert!(index < geom.slots);
        // Safety: the offset stays inside the block.
        unsafe {
            NonNull::new_unchecked(
                self.block
                    .as_ptr()
                    .add(geom.bitmap_bytes + index * geom.elem_size),
            )
        }
    }

    fn word_ptr(&self, index: usize) -> *mut usize {
        // Safety: callers bound `index` by the slot count, and the hook
        // contract makes the block word aligned.
        unsafe { self.block.as_ptr().cast::<usize>().add(index / WORD_BITS) }
    }

    pub fn bit(&self, geom: &Geometry, index: usize) -> bool {
        debug_assert!(index < geom.slots);
        // Safety: the word lies in the bitmap area at the block's front.
        unsafe { *self.word_ptr(index) & (1usize << (index % WORD_BITS)) != 0 }
    }

    pub fn set_bit(&mut self, geom: &Geometry, index: usize) {
        debug_assert!(index < geom.slots);
        // Safety: see bit().
        unsafe { *self.word_ptr(index) |= 1usize << (index % WORD_BITS) };
    }

    pub fn clear_bit(&mut self, geom: &Geometry, index: usize) {
        debug_assert!(index < geom.slots);
        // Safety: see bit().
        unsafe { *self.word_ptr(index) &= !(1usize << (index % WORD_BITS)) };
    }

    /// Total set bits across the bitmap.
    pub fn set_bits(&self, geom: &Geometry) -> usize {
        let words = geom.bitmap_bytes / size_of::<usize>();
        (0..words)
            // Safety: every word index lies in the bitmap area.
            .map(|w| unsafe { *self.block.as_ptr().cast::<usize>().add(w) }.count_ones() as usize)
            .sum()
    }

    /// Whether a single free run spans the whole cluster.
    ///
    /// # Safety
    ///
    /// The cluster's bitmap and overlays must be consistent (always true
    /// between public pool operations).
    pub unsafe fn fully_free(&self, geom: &Geometry) -> bool {
        if !self.bit(geom, 0) {
            return false;
        }
        // Safety: bit 0 set makes slot 0 a run endpoint, and slot 0 can only
        // ever be a head.
        match unsafe { run::endpoint(self.slot(geom, 0)) } {
            Endpoint::Head { len } => len == geom.slots,
            Endpoint::Tail { .. } => false,
        }
    }
}
