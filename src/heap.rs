//! Raw cluster storage acquisition.
//!
//! The pool gets cluster blocks through a pair of function-pointer hooks so
//! tests and embedders can substitute an instrumented heap. Defaults wrap
//! `std::alloc`. Process-global defaults are read once per pool at
//! construction time and copied in; a pool built with explicit hooks ignores
//! the globals entirely, so instrumented heaps never cross-contaminate.

use std::alloc::{self, Layout};
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::Mutex;

/// Returns a word-aligned writable block of `bytes` bytes, or `None` when
/// the underlying heap is exhausted.
pub type AcquireFn = fn(bytes: usize) -> Option<NonNull<u8>>;

/// Releases a block previously returned by the paired [`AcquireFn`] with the
/// same `bytes`.
pub type ReleaseFn = unsafe fn(ptr: NonNull<u8>, bytes: usize);

/// The acquire/release pair a pool uses for cluster storage.
///
/// Hooks must behave like the system heap and must not re-enter the pool
/// they serve.
#[derive(Clone, Copy, Debug)]
pub struct HeapHooks {
    pub acquire: AcquireFn,
    pub release: ReleaseFn,
}

impl HeapHooks {
    /// Hooks backed by `std::alloc`.
    #[must_use]
    pub const fn system() -> Self {
        Self {
            acquire: system_acquire,
            release: system_release,
        }
    }
}

impl Default for HeapHooks {
    fn default() -> Self {
        Self::system()
    }
}

fn system_acquire(bytes: usize) -> Option<NonNull<u8>> {
    debug_assert!(bytes > 0);
    let layout = Layout::from_size_align(bytes, mem::align_of::<usize>()).ok()?;
    // Safety: layout has non-zero size.
    NonNull::new(unsafe { alloc::alloc(layout) })
}

unsafe fn system_release(ptr: NonNull<u8>, bytes: usize) {
    // Safety: the layout matches the one used in system_acquire, and the
    // caller guarantees `ptr` came from it.
    unsafe {
        let layout = Layout::from_size_align_unchecked(bytes, mem::align_of::<usize>());
        alloc::dealloc(ptr.as_ptr(), layout);
    }
}

static GLOBAL_HOOKS: Mutex<HeapHooks> = Mutex::new(HeapHooks::system());

/// Replaces the process-global default hooks consulted by [`crate::Pool::new`].
///
/// Pools already constructed keep the hooks they copied.
///
/// # Panics
///
/// Panics if the hook lock is poisoned.
pub fn set_global_hooks(hooks: HeapHooks) {
    *GLOBAL_HOOKS.lock().unwrap() = hooks;
}

/// Current process-global default hooks.
///
/// # Panics
///
/// Panics if the hook lock is poisoned.
#[must_use]
pub fn global_hooks() -> HeapHooks {
    *GLOBAL_HOOKS.lock().unwrap()
}

/// Failures a pool surfaces to its caller. Everything else (foreign or
/// doubly freed pointers, internal inconsistencies) is a programming error
/// and asserts instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The acquire hook could not produce a cluster block.
    AcquireFailed { bytes: usize },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::AcquireFailed { bytes } => {
                write!(f, "cluster acquire failed ({bytes} bytes)")
            }
        }
    }
}

impl std::error::Error for PoolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_hooks_round_trip() {
        let hooks = HeapHooks::system();
        let block = (hooks.acquire)(256).expect("system acquire failed");
        // Safety: freshly acquired block of 256 bytes.
        unsafe {
            block.as_ptr().write_bytes(0xA5, 256);
            assert_eq!(*block.as_ptr().add(255), 0xA5);
            (hooks.release)(block, 256);
        }
    }

    #[test]
    fn test_error_display() {
        let err = PoolError::AcquireFailed { bytes: 4096 };
        assert_eq!(err.to_string(), "cluster acquire failed (4096 bytes)");
    }
}
