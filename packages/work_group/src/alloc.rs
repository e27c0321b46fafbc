use std::alloc::{Layout, alloc, dealloc};
use std::fmt::Debug;
use std::ptr::NonNull;

use crate::{Error, Result};

/// Supplies the raw memory that holds enqueued loops.
///
/// Every allocation a storage makes is returned to the same allocator before the storage is
/// dropped, and a storage never returns memory it did not obtain from its allocator.
///
/// Storages clone the allocator when a pool hands its storage over to a group and starts a new
/// one, so the handle is expected to be cheap to clone (a zero-sized type or a reference-counted
/// handle to shared state).
///
/// Implementations must be [`Send`] and [`Sync`] because groups may execute on device queue
/// threads. The engine never calls the allocator while a batch executes.
pub trait Allocator: Clone + Debug + Send + Sync + 'static {
    /// Allocates a block of memory matching `layout`.
    ///
    /// `layout` always has a non-zero size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if the memory cannot be provided.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>>;

    /// Returns a block of memory to the allocator.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` was returned by [`allocate()`](Self::allocate) on this
    /// allocator (or a clone of it) with the same `layout`, and that it has not already been
    /// deallocated.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// An [`Allocator`] that uses the global heap of the process.
///
/// This is the default allocator of a [`WorkPool`][crate::WorkPool].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HostAllocator;

impl Allocator for HostAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        debug_assert!(layout.size() > 0);

        // SAFETY: The storages only request non-zero-sized layouts.
        let ptr = unsafe { alloc(layout) };

        NonNull::new(ptr).ok_or(Error::AllocationFailed {
            size: layout.size(),
            align: layout.align(),
        })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe {
            dealloc(ptr.as_ptr(), layout);
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(HostAllocator: Allocator, Send, Sync, Copy);

    #[test]
    fn host_allocator_round_trip() {
        let layout = Layout::from_size_align(64, 16).unwrap();
        let ptr = HostAllocator.allocate(layout).unwrap();

        assert_eq!(ptr.as_ptr() as usize % 16, 0);

        // SAFETY: The pointer was just allocated with this layout.
        unsafe {
            ptr.as_ptr().write_bytes(0xAB, layout.size());
            HostAllocator.deallocate(ptr, layout);
        }
    }
}
