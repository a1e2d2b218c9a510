//! Free-run encoding: the two shapes a free slot can take.
//!
//! A maximal range of adjacent free slots (a *run*) stores all of its
//! bookkeeping inside the slots themselves. The first slot carries the
//! bucket-list node and the run length; the last slot (runs of two or more)
//! carries a back-pointer to the first plus a zero mark:
//!
//! ```text
//! run head (first slot)        run tail (last slot, length >= 2)
//! +------------------+         +------------------+
//! | next free run    |         | ptr to run head  |
//! +------------------+         +------------------+
//! | prev free run    |         | (unused)         |
//! +------------------+         +------------------+
//! | run length >= 1  |         | 0                |
//! +------------------+         +------------------+
//! ```
//!
//! Word 2 tells the shapes apart: a head stores the run length there (never
//! zero), a tail stores zero. The cluster bitmap marks exactly the head and
//! tail indices of every run, so coalescing only ever inspects the slots at
//! `index - 1` and `index + run length`.

use std::mem::size_of;
use std::ptr::NonNull;

use crate::list::Node;

/// Number of free-list buckets. Bucket `i` holds runs of length `l` with
/// `2^i <= l < 2^(i+1)`; the last bucket is a catch-all for everything
/// longer.
pub const BUCKETS: usize = 8;

/// Payload of a run-head node: how many consecutive free slots the run
/// spans, itself included.
#[derive(Clone, Copy)]
pub(crate) struct FreeRun {
    pub len: usize,
}

pub(crate) type RunNode = Node<FreeRun>;

/// Tail overlay for runs of length >= 2. `mark == 0` is what distinguishes
/// a tail from a head when an endpoint slot is inspected blind.
#[repr(C)]
struct RunTail {
    first: NonNull<RunNode>,
    _reserved: usize,
    mark: usize,
}

/// Every slot must be able to hold either overlay.
pub(crate) const SLOT_OVERLAY_SIZE: usize = size_of::<RunNode>();

const _: () = assert!(size_of::<RunTail>() == size_of::<RunNode>());

const MARK_OFFSET: usize = 2 * size_of::<usize>();

/// What an endpoint slot turned out to be.
pub(crate) enum Endpoint {
    Head { len: usize },
    Tail { first: NonNull<RunNode> },
}

/// Inspects a run endpoint.
///
/// # Safety
///
/// `slot` must be a free slot whose bitmap bit is set, i.e. the first or
/// last slot of a free run, with its overlay fully written.
pub(crate) unsafe fn endpoint(slot: NonNull<u8>) -> Endpoint {
    // Safety: caller guarantees the slot holds one of the two overlays, both
    // of which have a meaningful word at MARK_OFFSET. The mark must be read
    // before anything else: word 0 of a head is zero whenever the run sits
    // at the end of its bucket, so only the mark says how to read the rest.
    let mark = unsafe { slot.as_ptr().add(MARK_OFFSET).cast::<usize>().read() };
    if mark == 0 {
        // Safety: mark zero identifies the tail overlay.
        let tail = unsafe { slot.as_ptr().cast::<RunTail>().read() };
        debug_assert_eq!(tail.mark, 0);
        Endpoint::Tail { first: tail.first }
    } else {
        Endpoint::Head { len: mark }
    }
}

/// Writes the tail overlay for a run of length >= 2.
///
/// # Safety
///
/// `slot` must be the last slot of the run headed by `first`, owned by the
/// pool and free.
pub(crate) unsafe fn write_tail(slot: NonNull<u8>, first: NonNull<RunNode>) {
    // Safety: caller guarantees the slot is writable free storage.
    unsafe {
        slot.as_ptr().cast::<RunTail>().write(RunTail {
            first,
            _reserved: 0,
            mark: 0,
        });
    }
}

/// Maps a run length to its free-list bucket.
pub(crate) fn bucket_index(len: usize) -> usize {
    debug_assert!(len >= 1);
    (len.ilog2() as usize).min(BUCKETS - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::LinkedList;

    #[test]
    fn test_bucket_index_ranges() {
        assert_eq!(bucket_index(1), 0);
        assert_eq!(bucket_index(2), 1);
        assert_eq!(bucket_index(3), 1);
        assert_eq!(bucket_index(4), 2);
        assert_eq!(bucket_index(7), 2);
        assert_eq!(bucket_index(127), 6);
        assert_eq!(bucket_index(128), 7);
        // Everything past the last bucket floor lands in the catch-all.
        assert_eq!(bucket_index(32000), 7);
        assert_eq!(bucket_index(usize::MAX), 7);
    }

    #[test]
    fn test_endpoint_discriminates_head_and_tail() {
        let mut head_mem = [0usize; 3];
        let mut tail_mem = [0usize; 3];
        let head_addr =
            NonNull::new(head_mem.as_mut_ptr().cast::<u8>()).unwrap();
        let tail_addr =
            NonNull::new(tail_mem.as_mut_ptr().cast::<u8>()).unwrap();

        let mut list = LinkedList::new();
        // Safety: head_mem is big enough for a RunNode and lives long enough.
        let node = unsafe { list.append(FreeRun { len: 5 }, head_addr) };
        // Safety: tail_mem is big enough for a RunTail.
        unsafe { write_tail(tail_addr, node) };

        // Safety: both overlays were just written.
        match unsafe { endpoint(head_addr) } {
            Endpoint::Head { len } => assert_eq!(len, 5),
            Endpoint::Tail { .. } => panic!("head read back as tail"),
        }
        // Safety: see above.
        match unsafe { endpoint(tail_addr) } {
            Endpoint::Tail { first } => assert_eq!(first, node),
            Endpoint::Head { .. } => panic!("tail read back as head"),
        }
    }

    #[test]
    fn test_single_slot_run_is_a_head() {
        let mut mem = [0usize; 3];
        let addr = NonNull::new(mem.as_mut_ptr().cast::<u8>()).unwrap();
        let mut list = LinkedList::new();
        // Safety: mem is big enough for a RunNode.
        unsafe { list.append(FreeRun { len: 1 }, addr) };

        // Safety: the overlay was just written.
        match unsafe { endpoint(addr) } {
            Endpoint::Head { len } => assert_eq!(len, 1),
            Endpoint::Tail { .. } => panic!("length-1 run must read as head"),
        }
    }
}
