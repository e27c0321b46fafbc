use std::alloc::Layout;
use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::slice;

use crate::storage::{EntryHeader, EntryMarker, LoopEntry, destroy_entry, write_entry};
use crate::{Allocator, Error, LoopIndex, Result, Segment};

/// Stores every loop in its own allocation and keeps an array of owning pointers to them.
///
/// Entries never move once appended; growth only reallocates the pointer array.
pub(crate) struct PointerArray<I: LoopIndex, X, A: Allocator> {
    /// Owning pointers to the individually allocated entries, in append order, along with the
    /// layout each was allocated with.
    entries: Vec<(NonNull<u8>, Layout)>,

    /// Sum of the sizes of all entry allocations.
    storage_size: usize,

    allocator: A,

    _entries: EntryMarker<I, X>,
}

impl<I: LoopIndex, X, A: Allocator> PointerArray<I, X, A> {
    pub(crate) fn new(allocator: A) -> Self {
        Self {
            entries: Vec::new(),
            storage_size: 0,
            allocator,
            _entries: PhantomData,
        }
    }

    pub(crate) fn allocator(&self) -> &A {
        &self.allocator
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn storage_size(&self) -> usize {
        self.storage_size
    }

    /// Ensures the pointer array can hold `num_loops` entries without growing.
    ///
    /// Entries themselves are still allocated one by one as they are appended.
    pub(crate) fn reserve(&mut self, num_loops: usize) {
        self.entries
            .reserve(num_loops.saturating_sub(self.entries.len()));
    }

    pub(crate) fn append<F>(&mut self, segment: Segment<I>, operation: F) -> Result<()>
    where
        F: Fn(I, &X) + Send + Sync + 'static,
    {
        let (layout, body_offset) = entry_layout::<I, X>(Layout::new::<F>())?;

        // Grow the pointer array first so that a successful entry allocation is never lost.
        self.entries.reserve(1);

        let at = self.allocator.allocate(layout)?;

        // SAFETY: `at` was just allocated with a layout that fits the header at offset 0 and
        // the operation at `body_offset`, both correctly aligned.
        unsafe {
            write_entry::<I, X, F>(at, segment, operation, body_offset, layout.size());
        }

        self.entries.push((at, layout));

        // Cannot overflow because that would imply more live memory than the address space.
        self.storage_size = self.storage_size.wrapping_add(layout.size());

        Ok(())
    }

    pub(crate) fn iter(&self) -> Iter<'_, I, X> {
        Iter {
            inner: self.entries.iter(),
            _entries: PhantomData,
        }
    }
}

/// The allocation layout of an entry whose captured state has layout `body`, plus the offset of
/// the captured state within it.
fn entry_layout<I: LoopIndex, X>(body: Layout) -> Result<(Layout, usize)> {
    let (layout, body_offset) = EntryHeader::<I, X>::LAYOUT
        .extend(body)
        .map_err(|_| Error::AllocationFailed {
            size: body.size(),
            align: body.align(),
        })?;

    Ok((layout.pad_to_align(), body_offset))
}

impl<I: LoopIndex, X, A: Allocator> fmt::Debug for PointerArray<I, X, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("len", &self.entries.len())
            .field("storage_size", &self.storage_size)
            .finish_non_exhaustive()
    }
}

impl<I: LoopIndex, X, A: Allocator> Drop for PointerArray<I, X, A> {
    fn drop(&mut self) {
        for (at, layout) in self.entries.drain(..) {
            // SAFETY: Every pointer in the array holds a live entry that we own. We drop it
            // exactly once here and hand the memory back to the allocator it came from.
            unsafe {
                destroy_entry::<I, X>(at);
                self.allocator.deallocate(at, layout);
            }
        }
    }
}

// SAFETY: The array owns its entries exclusively. The stored operations are `Send + Sync`
// (enforced by `DispatchRecord::of()`), segments are `Send + Sync` via `LoopIndex` and the
// allocator is `Send + Sync` via `Allocator`.
unsafe impl<I: LoopIndex, X, A: Allocator> Send for PointerArray<I, X, A> {}

// SAFETY: Shared access only reads entries and invokes operations through `&self`.
unsafe impl<I: LoopIndex, X, A: Allocator> Sync for PointerArray<I, X, A> {}

/// Iterator over the entries of a [`PointerArray`].
pub(crate) struct Iter<'a, I, X> {
    inner: slice::Iter<'a, (NonNull<u8>, Layout)>,
    _entries: PhantomData<&'a EntryHeader<I, X>>,
}

impl<'a, I: LoopIndex, X> Iterator for Iter<'a, I, X> {
    type Item = LoopEntry<'a, I, X>;

    fn next(&mut self) -> Option<Self::Item> {
        let (at, _) = self.inner.next()?;

        // SAFETY: The array keeps the entry alive and in place while it is borrowed.
        Some(unsafe { LoopEntry::from_raw(*at) })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
