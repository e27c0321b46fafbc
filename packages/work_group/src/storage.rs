//! Type-erased storage of enqueued loops.
//!
//! Three interchangeable layouts hold the same kind of entry: an [`EntryHeader`] (segment,
//! dispatch record and placement metadata) followed by the captured state of the operation.
//!
//! * [`PointerArray`] allocates every entry individually and keeps a growable array of owning
//!   pointers.
//! * [`RaggedArray`] packs entries of any size back to back in one growable buffer.
//! * [`StrideArray`] packs entries in fixed-size slots of one growable buffer.

mod pointer_array;
mod ragged;
mod stride;

use std::alloc::Layout;
use std::marker::PhantomData;
use std::mem;
use std::num::NonZero;
use std::ptr::{self, NonNull};

pub(crate) use pointer_array::PointerArray;
pub(crate) use ragged::RaggedArray;
pub(crate) use stride::StrideArray;

use crate::{Allocator, DispatchRecord, LoopIndex, Result, Segment};

/// Selects the physical layout used to store enqueued loops.
///
/// The layout affects allocation count, memory locality and indexing cost, never the logical
/// result of running a batch.
///
/// # Examples
///
/// ```rust
/// use std::num::NonZero;
///
/// use work_group::{StoragePolicy, WorkPool};
///
/// let pool = WorkPool::<i32, ()>::builder()
///     .storage(StoragePolicy::constant_stride_with_slot(NonZero::new(64).unwrap()))
///     .build()
///     .unwrap();
///
/// assert!(pool.is_empty());
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum StoragePolicy {
    /// Every loop is allocated individually; the storage keeps a growable array of pointers.
    ///
    /// Suits few loops whose captured state varies a lot in size.
    ArrayOfPointers,

    /// Loops are packed back to back in one growable buffer, each preceded by its own size.
    ///
    /// Suits many small loops of varying size and minimizes the number of allocations. This is
    /// the default.
    #[default]
    RaggedArrayOfObjects,

    /// Loops are packed in equally sized slots of one growable buffer.
    ///
    /// The slot size is either declared up front (`slot_bytes`, the maximum size of the captured
    /// state of one operation) or fixed by the first appended operation. Operations that do not
    /// fit in a slot are rejected with [`Error::CapacityExceeded`][crate::Error::CapacityExceeded].
    ConstantStrideArrayOfObjects {
        /// Maximum bytes of captured state per operation, if declared up front.
        slot_bytes: Option<NonZero<usize>>,
    },
}

impl StoragePolicy {
    /// Constant-stride storage whose slot size is fixed by the first appended operation.
    #[must_use]
    pub fn constant_stride() -> Self {
        Self::ConstantStrideArrayOfObjects { slot_bytes: None }
    }

    /// Constant-stride storage whose slots hold operations of up to `slot_bytes` bytes of
    /// captured state.
    #[must_use]
    pub fn constant_stride_with_slot(slot_bytes: NonZero<usize>) -> Self {
        Self::ConstantStrideArrayOfObjects {
            slot_bytes: Some(slot_bytes),
        }
    }
}

/// Placement metadata written in front of the captured state of every stored operation.
pub(crate) struct EntryHeader<I, X> {
    segment: Segment<I>,
    dispatch: DispatchRecord<I, X>,

    /// Byte offset from the start of the header to the captured state.
    body_offset: usize,

    /// Bytes the entry occupies in its storage: up to the next entry (ragged layout), the whole
    /// slot (stride layout) or the whole allocation (pointer layout).
    footprint: usize,
}

impl<I: LoopIndex, X> EntryHeader<I, X> {
    pub(crate) const LAYOUT: Layout = Layout::new::<Self>();

    /// Byte offset of captured state with the given alignment, when the header starts at an
    /// address aligned to at least that alignment.
    pub(crate) fn body_offset_for(body_align: usize) -> usize {
        Self::LAYOUT.size().next_multiple_of(body_align)
    }

    pub(crate) fn footprint(&self) -> usize {
        self.footprint
    }
}

/// Writes a complete entry (header followed by the operation) at `at`.
///
/// # Safety
///
/// The caller must ensure that `at` is valid for writes of `footprint` bytes, that `at` is
/// aligned for the header and `at + body_offset` is aligned for `F`, and that
/// `body_offset + size_of::<F>() <= footprint`.
pub(crate) unsafe fn write_entry<I, X, F>(
    at: NonNull<u8>,
    segment: Segment<I>,
    operation: F,
    body_offset: usize,
    footprint: usize,
) where
    I: LoopIndex,
    F: Fn(I, &X) + Send + Sync + 'static,
{
    let header = EntryHeader {
        segment,
        dispatch: DispatchRecord::<I, X>::of::<F>(),
        body_offset,
        footprint,
    };

    // SAFETY: Forwarding placement requirements to the caller.
    unsafe {
        ptr::write(at.cast::<EntryHeader<I, X>>().as_ptr(), header);
        ptr::write(at.byte_add(body_offset).cast::<F>().as_ptr(), operation);
    }
}

/// Moves a complete entry from `src` to `dst`, leaving `src` logically uninitialized.
///
/// # Safety
///
/// The caller must ensure that `src` holds a live entry, that `dst` is valid for writes of the
/// entry footprint with at least the alignment `src` had, and that the two do not overlap.
pub(crate) unsafe fn relocate_entry<I: LoopIndex, X>(dst: NonNull<u8>, src: NonNull<u8>) {
    // SAFETY: Forwarding safety requirements to the caller.
    unsafe {
        let header = ptr::read(src.cast::<EntryHeader<I, X>>().as_ptr());
        header.dispatch.relocate(
            dst.byte_add(header.body_offset),
            src.byte_add(header.body_offset),
        );
        ptr::write(dst.cast::<EntryHeader<I, X>>().as_ptr(), header);
    }
}

/// Drops a complete entry in place.
///
/// # Safety
///
/// The caller must ensure that `at` holds a live entry that is never used again.
pub(crate) unsafe fn destroy_entry<I: LoopIndex, X>(at: NonNull<u8>) {
    // SAFETY: Forwarding safety requirements to the caller.
    unsafe {
        let header = at.cast::<EntryHeader<I, X>>();
        let (dispatch, body_offset) = {
            let header = header.as_ref();
            (header.dispatch, header.body_offset)
        };

        // Drop the header even if the operation panics while being dropped.
        let _drop_header = scopeguard::guard(header, |header| {
            ptr::drop_in_place(header.as_ptr());
        });

        dispatch.destroy(at.byte_add(body_offset));
    }
}

/// One loop held by a storage: its index segment plus the erased operation.
///
/// The entry borrows from the storage that holds it, so it can be invoked any number of times
/// while the storage is alive but never outlives it.
pub struct LoopEntry<'a, I, X> {
    header: &'a EntryHeader<I, X>,
    body: NonNull<u8>,
}

impl<'a, I: LoopIndex, X> LoopEntry<'a, I, X> {
    /// # Safety
    ///
    /// The caller must ensure that `at` holds a live entry that stays alive and unmoved for `'a`.
    pub(crate) unsafe fn from_raw(at: NonNull<u8>) -> Self {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe {
            let header = at.cast::<EntryHeader<I, X>>().as_ref();
            let body = at.byte_add(header.body_offset);

            Self { header, body }
        }
    }

    /// The indices this loop iterates over.
    #[must_use]
    pub fn segment(&self) -> &'a Segment<I> {
        &self.header.segment
    }

    /// The dispatch record of the stored operation.
    #[must_use]
    pub fn dispatch(&self) -> DispatchRecord<I, X> {
        self.header.dispatch
    }

    /// Bytes the entry occupies in its storage, including metadata and padding.
    #[must_use]
    pub fn footprint(&self) -> usize {
        self.header.footprint
    }

    /// Invokes the stored operation for one index.
    pub fn invoke(&self, index: I, xargs: &X) {
        // SAFETY: The entry borrows the storage, which keeps the operation alive and in place.
        unsafe {
            self.header.dispatch.invoke(self.body, index, xargs);
        }
    }

    /// Invokes the stored operation once for every index of its segment, in segment order.
    pub fn run(&self, xargs: &X) {
        for index in self.segment() {
            self.invoke(index, xargs);
        }
    }
}

impl<I, X> Clone for LoopEntry<'_, I, X> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I, X> Copy for LoopEntry<'_, I, X> {}

impl<I: LoopIndex, X> std::fmt::Debug for LoopEntry<'_, I, X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopEntry")
            .field("segment", &self.header.segment)
            .field("dispatch", &self.header.dispatch)
            .field("footprint", &self.header.footprint)
            .finish()
    }
}

// SAFETY: The operation behind `body` is `Send + Sync` (enforced by `DispatchRecord::of()`) and
// the header is only read through a shared reference.
unsafe impl<I: LoopIndex, X> Send for LoopEntry<'_, I, X> {}

// SAFETY: See above; invoking only requires shared access to the operation.
unsafe impl<I: LoopIndex, X> Sync for LoopEntry<'_, I, X> {}

/// A raw block of memory obtained from an [`Allocator`], or an empty placeholder.
#[derive(Debug)]
pub(crate) struct RawBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl RawBuffer {
    pub(crate) fn empty(align: usize) -> Self {
        Self {
            ptr: dangling(align),
            layout: Layout::from_size_align(0, align).expect("alignment is a power of two"),
        }
    }

    pub(crate) fn allocate<A: Allocator>(allocator: &A, layout: Layout) -> Result<Self> {
        if layout.size() == 0 {
            return Ok(Self::empty(layout.align()));
        }

        Ok(Self {
            ptr: allocator.allocate(layout)?,
            layout,
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.layout.size()
    }

    pub(crate) fn align(&self) -> usize {
        self.layout.align()
    }

    /// # Safety
    ///
    /// The caller must ensure that `offset` is within the buffer.
    pub(crate) unsafe fn at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.capacity());

        // SAFETY: Forwarding safety requirements to the caller.
        unsafe { self.ptr.byte_add(offset) }
    }

    /// Returns the memory to the allocator, leaving an empty buffer behind.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the buffer was allocated from `allocator` and that no live
    /// values remain in it.
    pub(crate) unsafe fn release<A: Allocator>(&mut self, allocator: &A) {
        let released = mem::replace(self, Self::empty(self.align()));

        if released.capacity() > 0 {
            // SAFETY: Forwarding safety requirements to the caller.
            unsafe {
                allocator.deallocate(released.ptr, released.layout);
            }
        }
    }
}

fn dangling(align: usize) -> NonNull<u8> {
    // A well-aligned non-null address that is never dereferenced for zero-sized buffers.
    NonNull::<u8>::dangling().with_addr(NonZero::new(align).expect("alignment is never zero"))
}

/// The storage held by a pool or group, in one of the three layouts.
pub(crate) enum WorkStorage<I: LoopIndex, X, A: Allocator> {
    Pointers(PointerArray<I, X, A>),
    Ragged(RaggedArray<I, X, A>),
    Stride(StrideArray<I, X, A>),
}

impl<I: LoopIndex, X, A: Allocator> WorkStorage<I, X, A> {
    pub(crate) fn new(policy: StoragePolicy, allocator: A) -> Self {
        match policy {
            StoragePolicy::ArrayOfPointers => Self::Pointers(PointerArray::new(allocator)),
            StoragePolicy::RaggedArrayOfObjects => Self::Ragged(RaggedArray::new(allocator)),
            StoragePolicy::ConstantStrideArrayOfObjects { slot_bytes } => {
                Self::Stride(StrideArray::new(allocator, slot_bytes))
            }
        }
    }

    /// Appends an operation, erasing its type.
    pub(crate) fn append<F>(&mut self, segment: Segment<I>, operation: F) -> Result<()>
    where
        F: Fn(I, &X) + Send + Sync + 'static,
    {
        match self {
            Self::Pointers(storage) => storage.append(segment, operation),
            Self::Ragged(storage) => storage.append(segment, operation),
            Self::Stride(storage) => storage.append(segment, operation),
        }
    }

    /// Ensures room for `num_loops` loops using `storage_bytes` bytes in total without further
    /// allocation (beyond per-entry allocations of the pointer layout).
    pub(crate) fn reserve(&mut self, num_loops: usize, storage_bytes: usize) -> Result<()> {
        match self {
            Self::Pointers(storage) => {
                storage.reserve(num_loops);
                Ok(())
            }
            Self::Ragged(storage) => storage.reserve(storage_bytes),
            Self::Stride(storage) => storage.reserve(num_loops, storage_bytes),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Pointers(storage) => storage.len(),
            Self::Ragged(storage) => storage.len(),
            Self::Stride(storage) => storage.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes occupied by stored entries.
    pub(crate) fn storage_size(&self) -> usize {
        match self {
            Self::Pointers(storage) => storage.storage_size(),
            Self::Ragged(storage) => storage.storage_size(),
            Self::Stride(storage) => storage.storage_size(),
        }
    }

    /// Creates an empty storage with the same layout configuration and allocator.
    pub(crate) fn empty_like(&self) -> Self {
        match self {
            Self::Pointers(storage) => Self::Pointers(PointerArray::new(storage.allocator().clone())),
            Self::Ragged(storage) => Self::Ragged(RaggedArray::new(storage.allocator().clone())),
            Self::Stride(storage) => Self::Stride(StrideArray::new(
                storage.allocator().clone(),
                storage.declared_slot_bytes(),
            )),
        }
    }

    /// Iterates over the stored loops in append order.
    pub(crate) fn iter(&self) -> Entries<'_, I, X> {
        match self {
            Self::Pointers(storage) => Entries::Pointers(storage.iter()),
            Self::Ragged(storage) => Entries::Ragged(storage.iter()),
            Self::Stride(storage) => Entries::Stride(storage.iter()),
        }
    }
}

impl<I: LoopIndex, X, A: Allocator> std::fmt::Debug for WorkStorage<I, X, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pointers(storage) => storage.fmt(f),
            Self::Ragged(storage) => storage.fmt(f),
            Self::Stride(storage) => storage.fmt(f),
        }
    }
}

/// Iterator over the loops of a [`WorkStorage`], in append order.
pub(crate) enum Entries<'a, I, X> {
    Pointers(pointer_array::Iter<'a, I, X>),
    Ragged(ragged::Iter<'a, I, X>),
    Stride(stride::Iter<'a, I, X>),
}

impl<'a, I: LoopIndex, X> Iterator for Entries<'a, I, X> {
    type Item = LoopEntry<'a, I, X>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Pointers(iter) => iter.next(),
            Self::Ragged(iter) => iter.next(),
            Self::Stride(iter) => iter.next(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            Self::Pointers(iter) => iter.size_hint(),
            Self::Ragged(iter) => iter.size_hint(),
            Self::Stride(iter) => iter.size_hint(),
        }
    }
}

impl<I: LoopIndex, X> ExactSizeIterator for Entries<'_, I, X> {}

/// Marker for storages that logically own `EntryHeader<I, X>` values.
pub(crate) type EntryMarker<I, X> = PhantomData<EntryHeader<I, X>>;
