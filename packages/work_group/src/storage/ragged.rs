use std::alloc::Layout;
use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use tracing::trace;

use crate::storage::{
    EntryHeader, EntryMarker, LoopEntry, RawBuffer, destroy_entry, relocate_entry, write_entry,
};
use crate::{Allocator, Error, LoopIndex, Result, Segment};

/// Every entry starts at a multiple of this many bytes from the start of the buffer.
const ENTRY_ALIGN: usize = 16;

/// Smallest buffer allocated when growing on demand.
const MIN_CAPACITY: usize = 256;

/// Packs entries of any size back to back in one contiguous buffer.
///
/// Each entry records its own footprint, so the buffer can be walked from the start but not
/// indexed directly. Growing the buffer moves every entry to a new allocation.
pub(crate) struct RaggedArray<I: LoopIndex, X, A: Allocator> {
    buffer: RawBuffer,

    /// Bytes of the buffer occupied by entries, including padding between them.
    used: usize,

    len: usize,

    allocator: A,

    _entries: EntryMarker<I, X>,
}

impl<I: LoopIndex, X, A: Allocator> RaggedArray<I, X, A> {
    pub(crate) fn new(allocator: A) -> Self {
        Self {
            buffer: RawBuffer::empty(Self::base_align()),
            used: 0,
            len: 0,
            allocator,
            _entries: PhantomData,
        }
    }

    fn base_align() -> usize {
        EntryHeader::<I, X>::LAYOUT.align().max(ENTRY_ALIGN)
    }

    pub(crate) fn allocator(&self) -> &A {
        &self.allocator
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn storage_size(&self) -> usize {
        self.used
    }

    /// Ensures the buffer holds at least `storage_bytes` bytes.
    pub(crate) fn reserve(&mut self, storage_bytes: usize) -> Result<()> {
        if storage_bytes <= self.buffer.capacity() {
            return Ok(());
        }

        self.grow(storage_bytes, self.buffer.align())
    }

    pub(crate) fn append<F>(&mut self, segment: Segment<I>, operation: F) -> Result<()>
    where
        F: Fn(I, &X) + Send + Sync + 'static,
    {
        let body = Layout::new::<F>();
        let start = self.used;

        // The buffer alignment is at least the body alignment (we grow it if needed), so
        // aligning the offset within the buffer aligns the address.
        let body_start = start
            .checked_add(EntryHeader::<I, X>::LAYOUT.size())
            .map(|offset| offset.next_multiple_of(body.align()))
            .ok_or_else(|| too_large(usize::MAX, body.align()))?;
        let footprint = body_start
            .checked_add(body.size())
            .map(|end| end.next_multiple_of(ENTRY_ALIGN) - start)
            .ok_or_else(|| too_large(usize::MAX, body.align()))?;
        let end = start + footprint;

        let align = self.buffer.align().max(body.align());

        if end > self.buffer.capacity() || align > self.buffer.align() {
            let capacity = end
                .max(self.buffer.capacity().saturating_mul(2))
                .max(MIN_CAPACITY);
            self.grow(capacity, align)?;
        }

        // SAFETY: The buffer has room for `end` bytes, `start` is a multiple of ENTRY_ALIGN
        // (which satisfies the header alignment) and `body_start` is a multiple of the body
        // alignment within a buffer aligned to at least that.
        unsafe {
            write_entry::<I, X, F>(
                self.buffer.at(start),
                segment,
                operation,
                body_start - start,
                footprint,
            );
        }

        self.used = end;
        self.len += 1;

        Ok(())
    }

    /// Moves all entries into a new buffer of `capacity` bytes aligned to `align`.
    ///
    /// On failure the existing buffer and its entries are untouched.
    fn grow(&mut self, capacity: usize, align: usize) -> Result<()> {
        let layout =
            Layout::from_size_align(capacity, align).map_err(|_| too_large(capacity, align))?;
        let mut new_buffer = RawBuffer::allocate(&self.allocator, layout)?;

        trace!(
            old_capacity = self.buffer.capacity(),
            new_capacity = capacity,
            entries = self.len,
            "growing ragged loop storage"
        );

        let mut offset = 0;
        for _ in 0..self.len {
            // SAFETY: `offset` walks the chain of live entries in the old buffer. Entries keep
            // their offset, the new buffer is at least as large and at least as aligned, and the
            // two buffers are distinct allocations.
            unsafe {
                let src = self.buffer.at(offset);
                let footprint = src.cast::<EntryHeader<I, X>>().as_ref().footprint();
                relocate_entry::<I, X>(new_buffer.at(offset), src);
                offset += footprint;
            }
        }

        std::mem::swap(&mut self.buffer, &mut new_buffer);

        // SAFETY: Every entry was moved out, so only raw memory remains in the old buffer.
        unsafe {
            new_buffer.release(&self.allocator);
        }

        Ok(())
    }

    pub(crate) fn iter(&self) -> Iter<'_, I, X> {
        Iter {
            // SAFETY: Offset zero is always within the buffer.
            next: unsafe { self.buffer.at(0) },
            remaining: self.len,
            _entries: PhantomData,
        }
    }
}

fn too_large(size: usize, align: usize) -> Error {
    Error::AllocationFailed { size, align }
}

impl<I: LoopIndex, X, A: Allocator> fmt::Debug for RaggedArray<I, X, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("len", &self.len)
            .field("used", &self.used)
            .field("capacity", &self.buffer.capacity())
            .finish_non_exhaustive()
    }
}

impl<I: LoopIndex, X, A: Allocator> Drop for RaggedArray<I, X, A> {
    fn drop(&mut self) {
        let mut offset = 0;
        for _ in 0..self.len {
            // SAFETY: `offset` walks the chain of live entries, each dropped exactly once. The
            // footprint is read before the header is dropped.
            unsafe {
                let at = self.buffer.at(offset);
                offset += at.cast::<EntryHeader<I, X>>().as_ref().footprint();
                destroy_entry::<I, X>(at);
            }
        }

        self.len = 0;

        // SAFETY: The buffer came from our allocator and no live entries remain in it.
        unsafe {
            self.buffer.release(&self.allocator);
        }
    }
}

// SAFETY: The array owns its entries exclusively. The stored operations are `Send + Sync`
// (enforced by `DispatchRecord::of()`), segments are `Send + Sync` via `LoopIndex` and the
// allocator is `Send + Sync` via `Allocator`.
unsafe impl<I: LoopIndex, X, A: Allocator> Send for RaggedArray<I, X, A> {}

// SAFETY: Shared access only reads entries and invokes operations through `&self`.
unsafe impl<I: LoopIndex, X, A: Allocator> Sync for RaggedArray<I, X, A> {}

/// Iterator over the entries of a [`RaggedArray`].
pub(crate) struct Iter<'a, I, X> {
    next: NonNull<u8>,
    remaining: usize,
    _entries: PhantomData<&'a EntryHeader<I, X>>,
}

impl<'a, I: LoopIndex, X> Iterator for Iter<'a, I, X> {
    type Item = LoopEntry<'a, I, X>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        // SAFETY: While entries remain, `next` points at a live entry of the borrowed buffer.
        let entry = unsafe { LoopEntry::from_raw(self.next) };

        // SAFETY: The footprint of an entry never extends past the end of the used buffer.
        self.next = unsafe { self.next.byte_add(entry.footprint()) };
        self.remaining -= 1;

        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
