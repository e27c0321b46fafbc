use std::alloc::Layout;
use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZero;
use std::ptr::NonNull;

use tracing::trace;

use crate::storage::{
    EntryHeader, EntryMarker, LoopEntry, RawBuffer, destroy_entry, relocate_entry, write_entry,
};
use crate::{Allocator, Error, LoopIndex, Result, Segment};

/// Slots start at multiples of at least this many bytes from the start of the buffer.
const SLOT_ALIGN: usize = 16;

/// Smallest number of slots allocated when growing on demand.
const MIN_SLOTS: usize = 8;

/// The slot geometry, fixed once known.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Slots {
    /// Bytes per slot, header included.
    stride: usize,

    /// Alignment every slot start satisfies.
    align: usize,
}

/// Packs entries in equally sized slots of one contiguous buffer, so entry `n` lives at
/// `n * stride`.
///
/// The stride is derived from a declared maximum operation size or, failing that, from the first
/// appended operation. Operations that do not fit in a slot are rejected.
pub(crate) struct StrideArray<I: LoopIndex, X, A: Allocator> {
    buffer: RawBuffer,

    /// Maximum bytes of captured state per operation, if declared when the storage was created.
    declared_slot_bytes: Option<NonZero<usize>>,

    /// `None` until declared or fixed by the first append.
    slots: Option<Slots>,

    len: usize,

    allocator: A,

    _entries: EntryMarker<I, X>,
}

impl<I: LoopIndex, X, A: Allocator> StrideArray<I, X, A> {
    pub(crate) fn new(allocator: A, declared_slot_bytes: Option<NonZero<usize>>) -> Self {
        Self {
            buffer: RawBuffer::empty(Self::base_align()),
            declared_slot_bytes,
            slots: None,
            len: 0,
            allocator,
            _entries: PhantomData,
        }
    }

    fn base_align() -> usize {
        EntryHeader::<I, X>::LAYOUT.align().max(SLOT_ALIGN)
    }

    /// The slot geometry if it is already fixed or was declared up front.
    ///
    /// A declared slot too large to describe in memory is reported as an allocation failure.
    fn known_slots(&self) -> Result<Option<Slots>> {
        if self.slots.is_some() {
            return Ok(self.slots);
        }

        let Some(slot_bytes) = self.declared_slot_bytes else {
            return Ok(None);
        };

        let align = Self::base_align();

        EntryHeader::<I, X>::body_offset_for(align)
            .checked_add(slot_bytes.get())
            .and_then(|bytes| bytes.checked_next_multiple_of(align))
            .map(|stride| Some(Slots { stride, align }))
            .ok_or(Error::AllocationFailed {
                size: slot_bytes.get(),
                align,
            })
    }

    pub(crate) fn allocator(&self) -> &A {
        &self.allocator
    }

    pub(crate) fn declared_slot_bytes(&self) -> Option<NonZero<usize>> {
        self.declared_slot_bytes
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn storage_size(&self) -> usize {
        self.slots.map_or(0, |slots| slots.stride * self.len)
    }

    /// Ensures room for `num_loops` slots and at least `storage_bytes` bytes.
    ///
    /// Before the stride is known only the byte count can be honored.
    pub(crate) fn reserve(&mut self, num_loops: usize, storage_bytes: usize) -> Result<()> {
        let (slot_bytes, align) = self
            .known_slots()?
            .map_or((0, self.buffer.align()), |slots| (slots.stride, slots.align));

        let required = num_loops.saturating_mul(slot_bytes).max(storage_bytes);

        if required <= self.buffer.capacity() {
            return Ok(());
        }

        self.grow(required, align)
    }

    pub(crate) fn append<F>(&mut self, segment: Segment<I>, operation: F) -> Result<()>
    where
        F: Fn(I, &X) + Send + Sync + 'static,
    {
        let body = Layout::new::<F>();
        let body_offset = EntryHeader::<I, X>::body_offset_for(body.align());
        let required = body_offset.saturating_add(body.size());

        // The geometry is only committed once the entry has room, so a failed first append
        // leaves the stride open.
        let slots = match self.known_slots()? {
            Some(slots) => slots,
            None => {
                let align = Self::base_align().max(body.align());
                let stride = required
                    .checked_next_multiple_of(align)
                    .ok_or(Error::AllocationFailed {
                        size: required,
                        align,
                    })?;

                Slots { stride, align }
            }
        };

        if required > slots.stride || body.align() > slots.align {
            return Err(Error::CapacityExceeded {
                required,
                align: body.align(),
                stride: slots.stride,
            });
        }

        let end = slots.stride.saturating_mul(self.len + 1);

        if end > self.buffer.capacity() || slots.align > self.buffer.align() {
            let capacity = end
                .max(self.buffer.capacity().saturating_mul(2))
                .max(slots.stride.saturating_mul(MIN_SLOTS));
            self.grow(capacity, slots.align)?;
        }

        self.slots = Some(slots);

        let start = slots.stride * self.len;

        // SAFETY: The buffer has room for `end` bytes. Slot starts are multiples of a stride that
        // is itself a multiple of the slot alignment, which satisfies both the header and the
        // body alignment, and the body ends within the slot.
        unsafe {
            write_entry::<I, X, F>(
                self.buffer.at(start),
                segment,
                operation,
                body_offset,
                slots.stride,
            );
        }

        self.len += 1;

        Ok(())
    }

    /// Moves all entries into a new buffer of `capacity` bytes aligned to `align`.
    ///
    /// On failure the existing buffer and its entries are untouched.
    fn grow(&mut self, capacity: usize, align: usize) -> Result<()> {
        let layout = Layout::from_size_align(capacity, align)
            .map_err(|_| Error::AllocationFailed { size: capacity, align })?;
        let mut new_buffer = RawBuffer::allocate(&self.allocator, layout)?;

        trace!(
            old_capacity = self.buffer.capacity(),
            new_capacity = capacity,
            entries = self.len,
            "growing constant-stride loop storage"
        );

        if let Some(slots) = self.slots {
            for index in 0..self.len {
                let offset = slots.stride * index;

                // SAFETY: Slot `index` holds a live entry. The new buffer is at least as large
                // and at least as aligned, and the two buffers are distinct allocations.
                unsafe {
                    relocate_entry::<I, X>(new_buffer.at(offset), self.buffer.at(offset));
                }
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
            base: unsafe { self.buffer.at(0) },
            stride: self.slots.map_or(0, |slots| slots.stride),
            next: 0,
            len: self.len,
            _entries: PhantomData,
        }
    }
}

impl<I: LoopIndex, X, A: Allocator> fmt::Debug for StrideArray<I, X, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("len", &self.len)
            .field("slots", &self.slots)
            .field("declared_slot_bytes", &self.declared_slot_bytes)
            .field("capacity", &self.buffer.capacity())
            .finish_non_exhaustive()
    }
}

impl<I: LoopIndex, X, A: Allocator> Drop for StrideArray<I, X, A> {
    fn drop(&mut self) {
        if let Some(slots) = self.slots {
            for index in 0..self.len {
                // SAFETY: Slot `index` holds a live entry that is dropped exactly once.
                unsafe {
                    destroy_entry::<I, X>(self.buffer.at(slots.stride * index));
                }
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
unsafe impl<I: LoopIndex, X, A: Allocator> Send for StrideArray<I, X, A> {}

// SAFETY: Shared access only reads entries and invokes operations through `&self`.
unsafe impl<I: LoopIndex, X, A: Allocator> Sync for StrideArray<I, X, A> {}

/// Iterator over the entries of a [`StrideArray`].
pub(crate) struct Iter<'a, I, X> {
    base: NonNull<u8>,
    stride: usize,
    next: usize,
    len: usize,
    _entries: PhantomData<&'a EntryHeader<I, X>>,
}

impl<'a, I: LoopIndex, X> Iterator for Iter<'a, I, X> {
    type Item = LoopEntry<'a, I, X>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == self.len {
            return None;
        }

        // SAFETY: Slots below `len` hold live entries of the borrowed buffer.
        let entry = unsafe { LoopEntry::from_raw(self.base.byte_add(self.stride * self.next)) };
        self.next += 1;

        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len - self.next;
        (remaining, Some(remaining))
    }
}
