use std::sync::Arc;
use std::sync::atomic::Ordering;

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::group::GroupShared;
use crate::order::Grid;
use crate::storage::{LoopEntry, WorkStorage};
use crate::{Allocator, ExecPolicy, LoopIndex, OrderPolicy, Result, Segment, SyncHandle};

/// Executes the loops of a storage according to an order and an execution policy.
///
/// The runner also keeps the bookkeeping that the order policies need, which is collected while
/// loops are enqueued.
#[derive(Debug)]
pub(crate) struct Runner {
    order: OrderPolicy,
    exec: ExecPolicy,

    /// Sum of the lengths of all enqueued segments.
    total_indices: usize,
}

impl Runner {
    pub(crate) fn new(order: OrderPolicy, exec: ExecPolicy) -> Self {
        Self {
            order,
            exec,
            total_indices: 0,
        }
    }

    /// A runner with the same policies and no enqueued loops.
    pub(crate) fn fresh(&self) -> Self {
        Self::new(self.order, self.exec.clone())
    }

    pub(crate) fn order(&self) -> OrderPolicy {
        self.order
    }

    pub(crate) fn exec(&self) -> &ExecPolicy {
        &self.exec
    }

    pub(crate) fn total_indices(&self) -> usize {
        self.total_indices
    }

    pub(crate) fn enqueue<I, X, A, F>(
        &mut self,
        storage: &mut WorkStorage<I, X, A>,
        segment: Segment<I>,
        operation: F,
    ) -> Result<()>
    where
        I: LoopIndex,
        A: Allocator,
        F: Fn(I, &X) + Send + Sync + 'static,
    {
        let len = segment.len();
        storage.append(segment, operation)?;

        // Cannot overflow: every index of every loop is visited, so the sum fits in memory.
        self.total_indices = self.total_indices.saturating_add(len);

        Ok(())
    }

    /// Executes every loop of the group once.
    ///
    /// Returns the completion handle of the run if it executes asynchronously, or `None` if the
    /// run has already finished.
    pub(crate) fn run<I, X, A>(
        &self,
        shared: &Arc<GroupShared<I, X, A>>,
        xargs: X,
    ) -> Result<Option<SyncHandle>>
    where
        I: LoopIndex,
        X: Send + Sync + 'static,
        A: Allocator,
    {
        let plan = Plan {
            order: self.order,
            total_indices: self.total_indices,
        };

        match &self.exec {
            ExecPolicy::Sequential => {
                trace!(loops = shared.storage.len(), "running batch sequentially");
                plan.execute(&shared.storage, Parallelism::Sequential, &xargs);
                Ok(None)
            }
            ExecPolicy::HostParallel { pool } => {
                trace!(loops = shared.storage.len(), "running batch on host threads");

                let execute = || plan.execute(&shared.storage, Parallelism::Parallel, &xargs);
                match pool {
                    Some(pool) => pool.install(execute),
                    None => execute(),
                }

                Ok(None)
            }
            ExecPolicy::Device(queue) => {
                shared.pending_runs.fetch_add(1, Ordering::AcqRel);

                // The guard travels with the job, so the run stops counting as pending once the
                // job has executed or the device has dropped it unexecuted.
                let shared = scopeguard::guard(Arc::clone(shared), |shared| {
                    shared.pending_runs.fetch_sub(1, Ordering::AcqRel);
                });
                let loops = shared.storage.len();

                let handle = queue.submit(Box::new(move || {
                    plan.execute(&shared.storage, Parallelism::Parallel, &xargs);
                }))?;

                debug!(device = queue.name(), loops, "batch submitted to device");

                Ok(Some(handle))
            }
        }
    }
}

/// Whether the indices of a loop may run concurrently.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Parallelism {
    Sequential,
    Parallel,
}

/// Everything a run needs besides the storage and the extra arguments.
#[derive(Clone, Copy, Debug)]
struct Plan {
    order: OrderPolicy,
    total_indices: usize,
}

impl Plan {
    fn execute<I, X, A>(self, storage: &WorkStorage<I, X, A>, parallelism: Parallelism, xargs: &X)
    where
        I: LoopIndex,
        X: Sync,
        A: Allocator,
    {
        match self.order {
            OrderPolicy::Ordered => {
                for entry in storage.iter() {
                    run_loop(entry, parallelism, xargs);
                }
            }
            OrderPolicy::ReverseOrdered => {
                // Ragged storage can only be walked forward.
                let entries = storage.iter().collect::<Vec<_>>();

                for entry in entries.into_iter().rev() {
                    run_loop(entry, parallelism, xargs);
                }
            }
            OrderPolicy::Distributed { block_size } => {
                let entries = storage.iter().collect::<Vec<_>>();
                let grid = Grid::new(entries.len(), self.total_indices, block_size);

                let run_item = |item: usize| {
                    let (block, loop_index) = grid.work_item(item);
                    let entry = entries
                        .get(loop_index)
                        .expect("grid only addresses existing loops");

                    for position in grid.positions(block, entry.segment().len()) {
                        entry.invoke(index_at(entry.segment(), position), xargs);
                    }
                };

                match parallelism {
                    Parallelism::Sequential => (0..grid.work_items()).for_each(run_item),
                    Parallelism::Parallel => (0..grid.work_items()).into_par_iter().for_each(run_item),
                }
            }
        }
    }
}

fn run_loop<I, X>(entry: LoopEntry<'_, I, X>, parallelism: Parallelism, xargs: &X)
where
    I: LoopIndex,
    X: Sync,
{
    match parallelism {
        Parallelism::Sequential => entry.run(xargs),
        Parallelism::Parallel => {
            let segment = entry.segment();

            (0..segment.len())
                .into_par_iter()
                .for_each(|position| entry.invoke(index_at(segment, position), xargs));
        }
    }
}

fn index_at<I: LoopIndex>(segment: &Segment<I>, position: usize) -> I {
    segment
        .get(position)
        .expect("positions are always within the segment")
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Mutex;

    use new_zealand::nz;

    use super::*;
    use crate::{HostAllocator, StoragePolicy};

    type Log = Arc<Mutex<Vec<(usize, i32)>>>;

    /// Enqueues loops over `[0, len)` for every length; each logs `(loop_id, index)`.
    fn enqueue_logging(
        runner: &mut Runner,
        storage: &mut WorkStorage<i32, (), HostAllocator>,
        lens: &[i32],
        log: &Log,
    ) {
        for (id, len) in lens.iter().copied().enumerate() {
            let log = Arc::clone(log);
            runner
                .enqueue(storage, Segment::range(0, len), move |i, (): &()| {
                    log.lock().unwrap().push((id, i));
                })
                .unwrap();
        }
    }

    fn execute(order: OrderPolicy, parallelism: Parallelism, lens: &[i32]) -> Vec<(usize, i32)> {
        let log = Log::default();
        let mut runner = Runner::new(order, ExecPolicy::Sequential);
        let mut storage = WorkStorage::new(StoragePolicy::default(), HostAllocator);

        enqueue_logging(&mut runner, &mut storage, lens, &log);

        Plan {
            order,
            total_indices: runner.total_indices(),
        }
        .execute(&storage, parallelism, &());

        let log = log.lock().unwrap();
        log.clone()
    }

    fn sorted(mut log: Vec<(usize, i32)>) -> Vec<(usize, i32)> {
        log.sort_unstable();
        log
    }

    fn every_index(lens: &[i32]) -> Vec<(usize, i32)> {
        lens.iter()
            .copied()
            .enumerate()
            .flat_map(|(id, len)| (0..len).map(move |i| (id, i)))
            .collect()
    }

    #[test]
    fn enqueue_counts_indices() {
        let mut runner = Runner::new(OrderPolicy::Ordered, ExecPolicy::Sequential);
        let mut storage = WorkStorage::new(StoragePolicy::default(), HostAllocator);

        enqueue_logging(&mut runner, &mut storage, &[5, 3, 4], &Log::default());

        assert_eq!(runner.total_indices(), 12);
        assert_eq!(runner.fresh().total_indices(), 0);
        assert_eq!(runner.fresh().order(), OrderPolicy::Ordered);
    }

    #[test]
    fn ordered_follows_append_order() {
        let log = execute(OrderPolicy::Ordered, Parallelism::Sequential, &[5, 3, 4]);

        assert_eq!(log, every_index(&[5, 3, 4]));
    }

    #[test]
    fn reverse_ordered_reverses_loops_only() {
        let log = execute(OrderPolicy::ReverseOrdered, Parallelism::Sequential, &[5, 3, 4]);

        let mut expected = Vec::new();
        for (id, len) in [(2, 4), (1, 3), (0, 5)] {
            expected.extend((0..len).map(|i| (id, i)));
        }

        assert_eq!(log, expected);
    }

    #[test]
    fn distributed_sequential_follows_grid_order() {
        // Average length 4 with block size 2: two blocks per loop, block-major.
        let log = execute(
            OrderPolicy::distributed(nz!(2)),
            Parallelism::Sequential,
            &[5, 3, 4],
        );

        let expected = [
            (0, 0),
            (0, 1),
            (0, 2),
            (1, 0),
            (1, 1),
            (2, 0),
            (2, 1),
            (0, 3),
            (0, 4),
            (1, 2),
            (2, 2),
            (2, 3),
        ];

        assert_eq!(log, expected);
    }

    #[test]
    fn parallel_visits_every_index_once() {
        let lens = [50, 0, 7, 130, 1];

        for order in [
            OrderPolicy::Ordered,
            OrderPolicy::ReverseOrdered,
            OrderPolicy::distributed(nz!(4)),
        ] {
            let log = execute(order, Parallelism::Parallel, &lens);

            assert_eq!(sorted(log), every_index(&lens), "{order:?}");
        }
    }

    #[test]
    fn parallel_ordered_finishes_each_loop_before_the_next() {
        let lens = [40, 40, 40];
        let log = execute(OrderPolicy::Ordered, Parallelism::Parallel, &lens);

        let ids = log.iter().map(|(id, _)| *id).collect::<Vec<_>>();
        let mut sorted_ids = ids.clone();
        sorted_ids.sort_unstable();

        assert_eq!(ids, sorted_ids);
    }

    #[test]
    fn list_segments_run_in_list_order() {
        let log = Log::default();
        let mut runner = Runner::new(OrderPolicy::Ordered, ExecPolicy::Sequential);
        let mut storage = WorkStorage::new(StoragePolicy::ArrayOfPointers, HostAllocator);

        runner
            .enqueue(&mut storage, Segment::list(vec![9, 2, 5]), {
                let log = Arc::clone(&log);
                move |i, (): &()| log.lock().unwrap().push((0, i))
            })
            .unwrap();

        Plan {
            order: OrderPolicy::Ordered,
            total_indices: runner.total_indices(),
        }
        .execute(&storage, Parallelism::Sequential, &());

        assert_eq!(*log.lock().unwrap(), [(0, 9), (0, 2), (0, 5)]);
    }
}
