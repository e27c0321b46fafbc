use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crate::runner::Runner;
use crate::storage::{LoopEntry, WorkStorage};
use crate::{Allocator, ExecPolicy, HostAllocator, LoopIndex, OrderPolicy, Result, WorkSite};

/// An immutable batch of loops that can be run any number of times.
///
/// Created by [`WorkPool::instantiate()`][crate::WorkPool::instantiate], which moves the loops
/// enqueued so far into the group. The loops are never consumed by running them; they are
/// dropped together with the group.
///
/// # Lifetime
///
/// Every run returns a [`WorkSite`] that borrows the group, so the group cannot be dropped while
/// a site exists. Leaking a site of a run that is still executing on a device and then dropping
/// the group is detected and panics.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use work_group::WorkPool;
///
/// let mut pool = WorkPool::<u32, Arc<AtomicUsize>>::new();
///
/// pool.enqueue(0..10, |i, total: &Arc<AtomicUsize>| {
///     total.fetch_add(i as usize, Ordering::Relaxed);
/// })
/// .unwrap();
///
/// let group = pool.instantiate();
/// let total = Arc::new(AtomicUsize::new(0));
///
/// group.run(Arc::clone(&total)).unwrap().synchronize().unwrap();
/// group.run(Arc::clone(&total)).unwrap().synchronize().unwrap();
///
/// assert_eq!(total.load(Ordering::Relaxed), 90);
/// ```
pub struct WorkGroup<I: LoopIndex, X, A: Allocator = HostAllocator> {
    shared: Arc<GroupShared<I, X, A>>,
    runner: Runner,
}

/// The part of a group that in-flight device runs keep alive.
pub(crate) struct GroupShared<I: LoopIndex, X, A: Allocator> {
    pub(crate) storage: WorkStorage<I, X, A>,

    /// Device runs submitted but not yet finished (or dropped unexecuted by the device).
    pub(crate) pending_runs: AtomicUsize,
}

impl<I: LoopIndex, X, A: Allocator> WorkGroup<I, X, A> {
    pub(crate) fn new(storage: WorkStorage<I, X, A>, runner: Runner) -> Self {
        Self {
            shared: Arc::new(GroupShared {
                storage,
                pending_runs: AtomicUsize::new(0),
            }),
            runner,
        }
    }

    /// Runs every loop of the group once, passing `xargs` to every invocation.
    ///
    /// With sequential and host-parallel execution the run has finished when this returns. With
    /// device execution the run is only queued; synchronize the returned site to wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceSubmission`][crate::Error::DeviceSubmission] if the device queue
    /// rejects the batch. No site is created in that case.
    ///
    /// # Panics
    ///
    /// With sequential and host-parallel execution, a panic in an operation propagates out of
    /// this call.
    pub fn run(&self, xargs: X) -> Result<WorkSite<'_>>
    where
        X: Send + Sync + 'static,
    {
        let handle = self.runner.run(&self.shared, xargs)?;

        Ok(WorkSite::new(handle))
    }

    /// Number of loops in the group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.storage.len()
    }

    /// Whether the group contains no loops.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.storage.is_empty()
    }

    /// Bytes occupied by the stored loops.
    #[must_use]
    pub fn storage_size(&self) -> usize {
        self.shared.storage.storage_size()
    }

    /// Total number of indices over all loops, which is the number of operation invocations
    /// per run.
    #[must_use]
    pub fn total_indices(&self) -> usize {
        self.runner.total_indices()
    }

    /// The order policy the group runs with.
    #[must_use]
    pub fn order(&self) -> OrderPolicy {
        self.runner.order()
    }

    /// The execution policy the group runs with.
    #[must_use]
    pub fn execution(&self) -> &ExecPolicy {
        self.runner.exec()
    }

    /// Iterates over the loops of the group in the order they were enqueued.
    pub fn loops(&self) -> impl ExactSizeIterator<Item = LoopEntry<'_, I, X>> {
        self.shared.storage.iter()
    }
}

impl<I: LoopIndex, X, A: Allocator> fmt::Debug for WorkGroup<I, X, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("storage", &self.shared.storage)
            .field("pending_runs", &self.shared.pending_runs)
            .field("runner", &self.runner)
            .finish()
    }
}

impl<I: LoopIndex, X, A: Allocator> Drop for WorkGroup<I, X, A> {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }

        let pending_runs = self.shared.pending_runs.load(Ordering::Acquire);

        assert!(
            pending_runs == 0,
            "work group dropped while {pending_runs} of its runs are still executing - every WorkSite must be synchronized or dropped before its WorkGroup"
        );
    }
}
