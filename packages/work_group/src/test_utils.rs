//! Helpers shared by the unit tests of this crate.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{Allocator, Error, HostAllocator, Result};

/// Allocator that counts live and total allocations and can be told to fail after a number of
/// successful allocations.
#[derive(Clone, Debug, Default)]
pub(crate) struct CountingAllocator {
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
    live_bytes: AtomicUsize,
    fail_after: AtomicUsize,
}

impl CountingAllocator {
    pub(crate) fn new() -> Self {
        let allocator = Self::default();
        allocator
            .counters
            .fail_after
            .store(usize::MAX, Ordering::Relaxed);
        allocator
    }

    /// All allocation requests after the next `count` successful ones fail.
    pub(crate) fn fail_after(&self, count: usize) {
        let allowed = self.allocations().saturating_add(count);
        self.counters.fail_after.store(allowed, Ordering::Relaxed);
    }

    pub(crate) fn allocations(&self) -> usize {
        self.counters.allocations.load(Ordering::Relaxed)
    }

    pub(crate) fn deallocations(&self) -> usize {
        self.counters.deallocations.load(Ordering::Relaxed)
    }

    pub(crate) fn live_bytes(&self) -> usize {
        self.counters.live_bytes.load(Ordering::Relaxed)
    }
}

impl Allocator for CountingAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        if self.allocations() >= self.counters.fail_after.load(Ordering::Relaxed) {
            return Err(Error::AllocationFailed {
                size: layout.size(),
                align: layout.align(),
            });
        }

        let ptr = HostAllocator.allocate(layout)?;
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        self.counters
            .live_bytes
            .fetch_add(layout.size(), Ordering::Relaxed);
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.counters.deallocations.fetch_add(1, Ordering::Relaxed);
        self.counters
            .live_bytes
            .fetch_sub(layout.size(), Ordering::Relaxed);

        // SAFETY: Forwarding safety requirements to the caller.
        unsafe {
            HostAllocator.deallocate(ptr, layout);
        }
    }
}
