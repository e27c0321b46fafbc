use std::sync::Arc;

use crate::DeviceQueue;

/// Determines where and with how much parallelism the loops of a batch execute.
///
/// # Examples
///
/// ```rust
/// use work_group::{DeviceQueue, ExecPolicy, WorkPool};
///
/// let queue = DeviceQueue::new().unwrap();
///
/// let pool = WorkPool::<usize, ()>::builder()
///     .execution(ExecPolicy::device(queue))
///     .build()
///     .unwrap();
///
/// assert!(matches!(pool.execution(), ExecPolicy::Device(_)));
/// ```
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub enum ExecPolicy {
    /// One index at a time on the thread that calls [`run()`][crate::WorkGroup::run]. This is the
    /// default.
    #[default]
    Sequential,

    /// Indices are spread over a rayon thread pool; `run()` returns once every loop has finished.
    ///
    /// Operations and extra arguments are read concurrently from several threads.
    HostParallel {
        /// Thread pool to execute on. The global rayon pool is used if `None`.
        pool: Option<Arc<rayon::ThreadPool>>,
    },

    /// The whole batch is submitted to a device queue; `run()` returns as soon as the batch is
    /// queued and completion is only guaranteed once the returned site is synchronized.
    Device(DeviceQueue),
}

impl ExecPolicy {
    /// Host-parallel execution on the global rayon thread pool.
    #[must_use]
    pub fn host_parallel() -> Self {
        Self::HostParallel { pool: None }
    }

    /// Host-parallel execution on a dedicated rayon thread pool.
    #[must_use]
    pub fn host_parallel_on(pool: Arc<rayon::ThreadPool>) -> Self {
        Self::HostParallel { pool: Some(pool) }
    }

    /// Asynchronous execution on a device queue.
    #[must_use]
    pub fn device(queue: DeviceQueue) -> Self {
        Self::Device(queue)
    }
}
