use std::any::type_name;
use std::fmt;
use std::mem;

use tracing::{debug, trace};

use crate::runner::Runner;
use crate::storage::WorkStorage;
use crate::{
    Allocator, ExecPolicy, HostAllocator, LoopIndex, OrderPolicy, Result, Segment, StoragePolicy,
    WorkGroup, WorkPoolBuilder,
};

/// Accumulates loops to be executed later as one batch.
///
/// Every loop is an index [`Segment`] plus an operation that is called once per index with the
/// index and a reference to the extra arguments `X` supplied when the batch runs. Operations of
/// different types can be mixed freely in one pool; their types are erased when they are
/// enqueued.
///
/// [`instantiate()`][Self::instantiate] moves the enqueued loops into a runnable [`WorkGroup`]
/// and leaves the pool empty, ready to accumulate the next batch. The pool remembers the largest
/// batch it has produced and reserves that much storage up front when the next batch starts, so
/// repeated batches of similar shape stop allocating after the first.
///
/// # Examples
///
/// ```rust
/// use std::sync::{Arc, Mutex};
///
/// use work_group::WorkPool;
///
/// let log = Arc::new(Mutex::new(Vec::new()));
/// let mut pool = WorkPool::<usize, ()>::new();
///
/// for id in 0..3 {
///     let log = Arc::clone(&log);
///     pool.enqueue(0..2, move |i, (): &()| log.lock().unwrap().push((id, i)))
///         .unwrap();
/// }
///
/// let group = pool.instantiate();
/// group.run(()).unwrap().synchronize().unwrap();
///
/// assert_eq!(log.lock().unwrap().len(), 6);
/// assert!(pool.is_empty());
/// assert_eq!(pool.max_num_loops(), 3);
/// ```
pub struct WorkPool<I: LoopIndex, X, A: Allocator = HostAllocator> {
    storage: WorkStorage<I, X, A>,
    runner: Runner,
    storage_policy: StoragePolicy,

    /// Largest number of loops ever instantiated from this pool.
    max_num_loops: usize,

    /// Largest storage size ever instantiated from this pool.
    max_storage_bytes: usize,
}

impl<I: LoopIndex, X> WorkPool<I, X> {
    /// Creates a pool with default policies and the host allocator.
    ///
    /// Use [`WorkPool::builder()`] to select policies, an allocator or an initial reservation.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(
            StoragePolicy::default(),
            OrderPolicy::default(),
            ExecPolicy::default(),
            HostAllocator,
        )
    }

    /// Creates a builder for configuring a pool.
    pub fn builder() -> WorkPoolBuilder<I, X> {
        WorkPoolBuilder::new()
    }
}

impl<I: LoopIndex, X> Default for WorkPool<I, X> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: LoopIndex, X, A: Allocator> WorkPool<I, X, A> {
    pub(crate) fn with_parts(
        storage_policy: StoragePolicy,
        order: OrderPolicy,
        exec: ExecPolicy,
        allocator: A,
    ) -> Self {
        Self {
            storage: WorkStorage::new(storage_policy, allocator),
            runner: Runner::new(order, exec),
            storage_policy,
            max_num_loops: 0,
            max_storage_bytes: 0,
        }
    }

    /// Ensures that `num_loops` loops occupying `storage_bytes` bytes in total can be enqueued
    /// without growing the storage.
    ///
    /// With [`StoragePolicy::ArrayOfPointers`] every loop is still allocated individually.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`][crate::Error::AllocationFailed] if the allocator
    /// cannot provide the memory. The pool is unchanged in that case.
    pub fn reserve(&mut self, num_loops: usize, storage_bytes: usize) -> Result<()> {
        self.storage.reserve(num_loops, storage_bytes)
    }

    /// Adds a loop that calls `operation` once for every index of `segment`.
    ///
    /// If the pool is empty, storage for the largest batch instantiated so far is reserved first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`][crate::Error::AllocationFailed] if the allocator
    /// cannot provide the memory and [`Error::CapacityExceeded`][crate::Error::CapacityExceeded]
    /// if constant-stride storage cannot fit the operation. The loop is not added in either case
    /// and previously enqueued loops are unaffected.
    pub fn enqueue<F>(&mut self, segment: impl Into<Segment<I>>, operation: F) -> Result<()>
    where
        F: Fn(I, &X) + Send + Sync + 'static,
    {
        if self.storage.is_empty() && (self.max_num_loops > 0 || self.max_storage_bytes > 0) {
            trace!(
                num_loops = self.max_num_loops,
                storage_bytes = self.max_storage_bytes,
                "reserving storage for next batch"
            );

            self.storage
                .reserve(self.max_num_loops, self.max_storage_bytes)?;
        }

        self.runner
            .enqueue(&mut self.storage, segment.into(), operation)
    }

    /// Moves every enqueued loop into a new [`WorkGroup`], leaving the pool empty.
    ///
    /// The group runs with the policies of the pool. The pool keeps accepting loops for the next
    /// batch. Instantiating an empty pool produces an empty group.
    #[must_use]
    pub fn instantiate(&mut self) -> WorkGroup<I, X, A> {
        self.max_num_loops = self.max_num_loops.max(self.storage.len());
        self.max_storage_bytes = self.max_storage_bytes.max(self.storage.storage_size());

        let fresh_storage = self.storage.empty_like();
        let storage = mem::replace(&mut self.storage, fresh_storage);

        let fresh_runner = self.runner.fresh();
        let runner = mem::replace(&mut self.runner, fresh_runner);

        debug!(
            loops = storage.len(),
            storage_bytes = storage.storage_size(),
            indices = runner.total_indices(),
            "instantiated work group"
        );

        WorkGroup::new(storage, runner)
    }

    /// Number of loops enqueued since the last instantiation.
    #[must_use]
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Whether no loops have been enqueued since the last instantiation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Bytes occupied by the loops enqueued since the last instantiation.
    #[must_use]
    pub fn storage_size(&self) -> usize {
        self.storage.storage_size()
    }

    /// Largest number of loops ever instantiated from this pool.
    #[must_use]
    pub fn max_num_loops(&self) -> usize {
        self.max_num_loops
    }

    /// Largest storage size, in bytes, ever instantiated from this pool.
    #[must_use]
    pub fn max_storage_bytes(&self) -> usize {
        self.max_storage_bytes
    }

    /// The storage layout of the pool.
    #[must_use]
    pub fn storage_policy(&self) -> StoragePolicy {
        self.storage_policy
    }

    /// The order policy that groups of this pool run with.
    #[must_use]
    pub fn order(&self) -> OrderPolicy {
        self.runner.order()
    }

    /// The execution policy that groups of this pool run with.
    #[must_use]
    pub fn execution(&self) -> &ExecPolicy {
        self.runner.exec()
    }
}

impl<I: LoopIndex, X, A: Allocator> fmt::Debug for WorkPool<I, X, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("storage", &self.storage)
            .field("runner", &self.runner)
            .field("storage_policy", &self.storage_policy)
            .field("max_num_loops", &self.max_num_loops)
            .field("max_storage_bytes", &self.max_storage_bytes)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::num::NonZero;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::Error;
    use crate::test_utils::CountingAllocator;

    assert_impl_all!(WorkPool<i32, ()>: Send, Sync, fmt::Debug, Default);
    assert_not_impl_any!(WorkPool<i32, ()>: Clone);

    fn enqueue_batch<A: Allocator>(pool: &mut WorkPool<i32, (), A>, count: u64) {
        for value in 0..count {
            pool.enqueue(0..4, move |_, (): &()| {
                std::hint::black_box(value);
            })
            .unwrap();
        }
    }

    #[test]
    fn instantiate_moves_loops_and_records_high_water_marks() {
        let mut pool = WorkPool::<i32, ()>::new();
        enqueue_batch(&mut pool, 5);

        let bytes = pool.storage_size();
        let group = pool.instantiate();

        assert_eq!(group.len(), 5);
        assert_eq!(group.storage_size(), bytes);
        assert!(pool.is_empty());
        assert_eq!(pool.storage_size(), 0);
        assert_eq!(pool.max_num_loops(), 5);
        assert_eq!(pool.max_storage_bytes(), bytes);

        enqueue_batch(&mut pool, 2);
        drop(pool.instantiate());

        assert_eq!(pool.max_num_loops(), 5);
        assert_eq!(pool.max_storage_bytes(), bytes);
    }

    #[test]
    fn instantiating_empty_pool_gives_empty_group() {
        let mut pool = WorkPool::<i32, ()>::new();
        let group = pool.instantiate();

        assert!(group.is_empty());
        group.run(()).unwrap().synchronize().unwrap();
    }

    #[test]
    fn reuse_allocates_only_the_reservation() {
        for policy in [
            StoragePolicy::RaggedArrayOfObjects,
            StoragePolicy::constant_stride(),
            StoragePolicy::constant_stride_with_slot(nz!(64)),
        ] {
            let allocator = CountingAllocator::new();
            let mut pool = WorkPool::<i32, ()>::builder()
                .storage(policy)
                .allocator(allocator.clone())
                .build()
                .unwrap();

            enqueue_batch(&mut pool, 40);
            drop(pool.instantiate());

            let before = allocator.allocations();
            enqueue_batch(&mut pool, 40);

            assert_eq!(allocator.allocations() - before, 1, "{policy:?}");
        }
    }

    #[test]
    fn pointer_storage_reuse_allocates_one_per_loop() {
        let allocator = CountingAllocator::new();
        let mut pool = WorkPool::<i32, ()>::builder()
            .storage(StoragePolicy::ArrayOfPointers)
            .allocator(allocator.clone())
            .build()
            .unwrap();

        enqueue_batch(&mut pool, 10);
        drop(pool.instantiate());

        let before = allocator.allocations();
        enqueue_batch(&mut pool, 10);

        assert_eq!(allocator.allocations() - before, 10);
    }

    #[test]
    fn failed_enqueue_keeps_previous_loops() {
        let mut pool = WorkPool::<i32, ()>::builder()
            .storage(StoragePolicy::constant_stride())
            .build()
            .unwrap();

        pool.enqueue(0..3, |_, (): &()| {}).unwrap();

        let payload = [0_u8; 512];
        let result = pool.enqueue(0..3, move |_, (): &()| {
            std::hint::black_box(payload);
        });

        assert!(matches!(result, Err(Error::CapacityExceeded { .. })));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.instantiate().total_indices(), 3);
    }

    #[test]
    fn oversized_declared_slot_fails_enqueue_instead_of_panicking() {
        let slot_bytes = NonZero::new(usize::MAX - 8).unwrap();

        let mut pool = WorkPool::<i32, ()>::builder()
            .storage(StoragePolicy::constant_stride_with_slot(slot_bytes))
            .build()
            .unwrap();

        let result = pool.enqueue(0..3, |_, (): &()| {});

        assert!(matches!(result, Err(Error::AllocationFailed { .. })));
        assert!(pool.is_empty());

        let reserved = WorkPool::<i32, ()>::builder()
            .storage(StoragePolicy::constant_stride_with_slot(slot_bytes))
            .reserve(1, 0)
            .build();

        assert!(matches!(reserved, Err(Error::AllocationFailed { .. })));
    }

    #[test]
    fn policies_are_kept_across_instantiation() {
        let mut pool = WorkPool::<i32, ()>::builder()
            .storage(StoragePolicy::ArrayOfPointers)
            .order(OrderPolicy::ReverseOrdered)
            .build()
            .unwrap();

        let group = pool.instantiate();

        assert_eq!(group.order(), OrderPolicy::ReverseOrdered);
        assert_eq!(pool.order(), OrderPolicy::ReverseOrdered);
        assert_eq!(pool.storage_policy(), StoragePolicy::ArrayOfPointers);
        assert!(matches!(pool.execution(), ExecPolicy::Sequential));
    }
}
