use std::marker::PhantomData;

use crate::{
    Allocator, ExecPolicy, HostAllocator, LoopIndex, OrderPolicy, Result, StoragePolicy, WorkPool,
};

/// Builder for creating an instance of [`WorkPool`].
///
/// Every setting is optional. By default the pool uses ragged storage, runs loops in enqueue
/// order on the calling thread and allocates from the global heap.
///
/// # Examples
///
/// ```
/// use work_group::{ExecPolicy, OrderPolicy, StoragePolicy, WorkPool};
///
/// let pool = WorkPool::<i64, ()>::builder()
///     .storage(StoragePolicy::ArrayOfPointers)
///     .order(OrderPolicy::ReverseOrdered)
///     .execution(ExecPolicy::host_parallel())
///     .reserve(16, 4096)
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.order(), OrderPolicy::ReverseOrdered);
/// ```
#[derive(Debug)]
#[must_use]
pub struct WorkPoolBuilder<I, X, A = HostAllocator> {
    storage: StoragePolicy,
    order: OrderPolicy,
    execution: ExecPolicy,
    allocator: A,
    reservation: Option<(usize, usize)>,

    _loops: PhantomData<fn(I, &X)>,
}

impl<I: LoopIndex, X> WorkPoolBuilder<I, X> {
    pub(crate) fn new() -> Self {
        Self {
            storage: StoragePolicy::default(),
            order: OrderPolicy::default(),
            execution: ExecPolicy::default(),
            allocator: HostAllocator,
            reservation: None,
            _loops: PhantomData,
        }
    }
}

impl<I: LoopIndex, X, A: Allocator> WorkPoolBuilder<I, X, A> {
    /// Sets the [storage layout][StoragePolicy] of the pool.
    pub fn storage(mut self, policy: StoragePolicy) -> Self {
        self.storage = policy;
        self
    }

    /// Sets the [order][OrderPolicy] in which groups of the pool run their loops.
    pub fn order(mut self, policy: OrderPolicy) -> Self {
        self.order = policy;
        self
    }

    /// Sets [where and how][ExecPolicy] groups of the pool run their loops.
    pub fn execution(mut self, policy: ExecPolicy) -> Self {
        self.execution = policy;
        self
    }

    /// Sets the allocator that provides the memory for enqueued loops.
    ///
    /// # Examples
    ///
    /// ```
    /// use work_group::{HostAllocator, WorkPool};
    ///
    /// let pool = WorkPool::<u32, ()>::builder()
    ///     .allocator(HostAllocator)
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn allocator<B: Allocator>(self, allocator: B) -> WorkPoolBuilder<I, X, B> {
        WorkPoolBuilder {
            storage: self.storage,
            order: self.order,
            execution: self.execution,
            allocator,
            reservation: self.reservation,
            _loops: PhantomData,
        }
    }

    /// Reserves room for `num_loops` loops occupying `storage_bytes` bytes when the pool is
    /// built.
    pub fn reserve(mut self, num_loops: usize, storage_bytes: usize) -> Self {
        self.reservation = Some((num_loops, storage_bytes));
        self
    }

    /// Builds the pool with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`][crate::Error::AllocationFailed] if the initial
    /// reservation cannot be allocated.
    pub fn build(self) -> Result<WorkPool<I, X, A>> {
        let mut pool =
            WorkPool::with_parts(self.storage, self.order, self.execution, self.allocator);

        if let Some((num_loops, storage_bytes)) = self.reservation {
            pool.reserve(num_loops, storage_bytes)?;
        }

        Ok(pool)
    }
}
