use std::alloc::Layout;
use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use crate::LoopIndex;

/// Remembers how to invoke, move and destroy a loop operation while forgetting its type.
///
/// A dispatch record holds three monomorphized functions for one concrete operation type `F`:
///
/// * `invoke` calls `F(index, xargs)` on a value that lives at an untyped address.
/// * `relocate` moves an `F` from one address to another without running any of its logic.
/// * `destroy` drops an `F` in place.
///
/// Records are stateless, cheap to copy and never change after creation. The storage layouts
/// keep one next to every erased operation they hold.
pub struct DispatchRecord<I, X> {
    invoke: unsafe fn(NonNull<u8>, I, &X),
    relocate: unsafe fn(NonNull<u8>, NonNull<u8>),
    destroy: unsafe fn(NonNull<u8>),
    layout: Layout,
    type_name: &'static str,

    _xargs: PhantomData<fn(&X)>,
}

impl<I: LoopIndex, X> DispatchRecord<I, X> {
    /// Creates the dispatch record for operations of type `F`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::alloc::Layout;
    ///
    /// use work_group::DispatchRecord;
    ///
    /// fn record_of<F: Fn(i32, &()) + Send + Sync + 'static>(_: &F) -> DispatchRecord<i32, ()> {
    ///     DispatchRecord::of::<F>()
    /// }
    ///
    /// let offset = 10_u64;
    /// let record = record_of(&move |i: i32, (): &()| {
    ///     std::hint::black_box(offset + i as u64);
    /// });
    ///
    /// assert_eq!(record.layout(), Layout::new::<u64>());
    /// ```
    #[must_use]
    pub fn of<F>() -> Self
    where
        F: Fn(I, &X) + Send + Sync + 'static,
    {
        Self {
            invoke: invoke_fn::<I, X, F>,
            relocate: relocate_fn::<F>,
            destroy: destroy_fn::<F>,
            layout: Layout::new::<F>(),
            type_name: type_name::<F>(),
            _xargs: PhantomData,
        }
    }

    /// The memory layout of the captured state of the operation.
    #[must_use]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Calls the operation stored at `state` with one index and the extra arguments.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `state` points to a live value of the operation type this
    /// record was created for.
    pub(crate) unsafe fn invoke(&self, state: NonNull<u8>, index: I, xargs: &X) {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe { (self.invoke)(state, index, xargs) }
    }

    /// Moves the operation stored at `src` to `dst`.
    ///
    /// After this call `src` is logically uninitialized and must not be invoked or destroyed.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `src` points to a live value of the operation type this
    /// record was created for, that `dst` is valid for writes of that type and suitably
    /// aligned, and that the two do not overlap.
    pub(crate) unsafe fn relocate(&self, dst: NonNull<u8>, src: NonNull<u8>) {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe { (self.relocate)(dst, src) }
    }

    /// Drops the operation stored at `state` in place.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `state` points to a live value of the operation type this
    /// record was created for and that the value is not used again afterwards.
    pub(crate) unsafe fn destroy(&self, state: NonNull<u8>) {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe { (self.destroy)(state) }
    }
}

// Manual impls because derives would require `I: Copy + Debug` and `X: Copy + Debug` even
// though no values of those types are stored.
impl<I, X> Clone for DispatchRecord<I, X> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I, X> Copy for DispatchRecord<I, X> {}

impl<I, X> fmt::Debug for DispatchRecord<I, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("operation", &self.type_name)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

unsafe fn invoke_fn<I, X, F>(state: NonNull<u8>, index: I, xargs: &X)
where
    F: Fn(I, &X),
{
    // SAFETY: DispatchRecord::invoke() callers guarantee that a live F is stored at `state`.
    let operation = unsafe { state.cast::<F>().as_ref() };
    operation(index, xargs);
}

unsafe fn relocate_fn<F>(dst: NonNull<u8>, src: NonNull<u8>) {
    // SAFETY: DispatchRecord::relocate() callers guarantee a live F at `src`, a valid and
    // aligned F-sized destination at `dst` and no overlap. Reading transfers ownership.
    unsafe {
        let value = ptr::read(src.cast::<F>().as_ptr());
        ptr::write(dst.cast::<F>().as_ptr(), value);
    }
}

unsafe fn destroy_fn<F>(state: NonNull<u8>) {
    // SAFETY: DispatchRecord::destroy() callers guarantee a live F at `state` that is never
    // used again.
    unsafe {
        ptr::drop_in_place(state.cast::<F>().as_ptr());
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;
    use std::mem::{ManuallyDrop, MaybeUninit};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(DispatchRecord<i32, (u8, String)>: Send, Sync, Copy, fmt::Debug);

    fn record_of<I, X, F>(_: &F) -> DispatchRecord<I, X>
    where
        I: LoopIndex,
        F: Fn(I, &X) + Send + Sync + 'static,
    {
        DispatchRecord::of::<F>()
    }

    fn uninit_like<T>(_: &T) -> MaybeUninit<T> {
        MaybeUninit::uninit()
    }

    /// Operation that tracks how often it was called and whether it has been dropped.
    struct Tracked {
        calls: Arc<AtomicUsize>,
        drops: Arc<AtomicUsize>,
    }

    impl Tracked {
        fn call(&self, index: i64, scale: &i64) {
            self.calls
                .fetch_add(usize::try_from(index * scale).unwrap(), Ordering::Relaxed);
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn tracked() -> (Tracked, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));
        (
            Tracked {
                calls: Arc::clone(&calls),
                drops: Arc::clone(&drops),
            },
            calls,
            drops,
        )
    }

    #[test]
    fn invoke_calls_operation_with_index_and_xargs() {
        let (tracker, calls, drops) = tracked();
        let mut operation = ManuallyDrop::new(move |i: i64, scale: &i64| tracker.call(i, scale));
        let record = record_of::<i64, i64, _>(&*operation);

        let state = NonNull::from(&mut *operation).cast::<u8>();

        // SAFETY: `state` points to a live operation of the recorded type.
        unsafe {
            record.invoke(state, 3, &10);
            record.invoke(state, 4, &10);
        }

        assert_eq!(calls.load(Ordering::Relaxed), 70);

        // SAFETY: The operation is live and is not used after this.
        unsafe {
            record.destroy(state);
        }

        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn relocate_moves_without_dropping() {
        let (tracker, calls, drops) = tracked();
        let operation = move |i: i64, scale: &i64| tracker.call(i, scale);
        let record = record_of::<i64, i64, _>(&operation);

        let mut source = ManuallyDrop::new(operation);
        let mut target = uninit_like(&source);

        let src = NonNull::from(&mut *source).cast::<u8>();
        let dst = NonNull::from(&mut target).cast::<u8>();

        // SAFETY: `src` holds a live operation, `dst` is a distinct slot of the same type.
        unsafe {
            record.relocate(dst, src);
        }

        assert_eq!(drops.load(Ordering::Relaxed), 0);

        // SAFETY: The operation now lives at `dst`; `src` is never touched again.
        unsafe {
            record.invoke(dst, 1, &5);
            record.destroy(dst);
        }

        assert_eq!(calls.load(Ordering::Relaxed), 5);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn layout_matches_captured_state() {
        let captured = [0_u64; 4];
        let record = record_of::<u32, (), _>(&move |i: u32, (): &()| {
            std::hint::black_box(captured[i as usize]);
        });

        assert_eq!(record.layout(), Layout::new::<[u64; 4]>());
    }

    #[test]
    fn zero_sized_operation_is_supported() {
        thread_local! {
            static SEEN: Cell<u32> = const { Cell::new(0) };
        }

        fn operation(i: u32, (): &()) {
            SEEN.with(|seen| seen.set(seen.get() + i));
        }

        let record = record_of::<u32, (), _>(&operation);
        assert_eq!(record.layout().size(), 0);

        let mut slot = ManuallyDrop::new(operation);
        let state = NonNull::from(&mut *slot).cast::<u8>();

        // SAFETY: `state` points to a live (zero-sized) operation of the recorded type.
        unsafe {
            record.invoke(state, 7, &());
            record.destroy(state);
        }

        assert_eq!(SEEN.with(Cell::get), 7);
    }

    #[test]
    fn debug_output_names_operation_type() {
        let record = record_of::<i32, (), _>(&|_: i32, (): &()| {});
        let debug_output = format!("{record:?}");

        assert!(debug_output.contains("DispatchRecord"));
        assert!(debug_output.contains("closure"));
    }
}
