//! Asynchronous in-order execution queues that batches can be submitted to.
//!
//! A [`DeviceQueue`] accepts jobs and runs them one after another, in submission order, somewhere
//! other than the submitting thread. Every submission returns a [`SyncHandle`] that reports when
//! the job has finished.
//!
//! The built-in queue emulates a device stream on the host: a dedicated worker thread takes jobs
//! from a channel and runs them, optionally inside a dedicated rayon thread pool that provides
//! the parallelism of the device. Other backends plug in by implementing [`DeviceBackend`].

use std::any::{Any, type_name};
use std::fmt::{self, Debug};
use std::num::NonZero;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel;
use parking_lot::Mutex;
use tracing::debug;

use crate::{Error, Result};

/// A unit of work submitted to a device queue.
pub type DeviceJob = Box<dyn FnOnce() + Send + 'static>;

/// What a finished job reports: success or the payload of the panic that ended it.
type JobOutcome = thread::Result<()>;

/// Used to give every device queue built without an explicit name a distinct one.
static NEXT_DEVICE_ID: AtomicUsize = AtomicUsize::new(0);

/// An asynchronous execution queue that runs submitted jobs in submission order.
///
/// Implement this to run batches on a custom execution resource and wrap the implementation in a
/// [`DeviceQueue`] via [`DeviceQueue::from_backend()`].
///
/// # Examples
///
/// A backend that runs every job immediately on the submitting thread:
///
/// ```rust
/// use std::sync::Arc;
///
/// use work_group::{DeviceBackend, DeviceJob, DeviceQueue, Result, SyncHandle, completion_pair};
///
/// #[derive(Debug)]
/// struct Inline;
///
/// impl DeviceBackend for Inline {
///     fn name(&self) -> &str {
///         "inline"
///     }
///
///     fn submit(&self, job: DeviceJob) -> Result<SyncHandle> {
///         let (completion, handle) = completion_pair();
///         completion.run(job);
///         Ok(handle)
///     }
/// }
///
/// let queue = DeviceQueue::from_backend(Arc::new(Inline));
/// assert_eq!(queue.name(), "inline");
/// ```
pub trait DeviceBackend: Debug + Send + Sync + 'static {
    /// Name of the device, used in logs and errors.
    fn name(&self) -> &str;

    /// Queues a job for execution after every previously submitted job.
    ///
    /// Use [`completion_pair()`] to create the handle and report completion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceSubmission`] if the device cannot accept the job.
    fn submit(&self, job: DeviceJob) -> Result<SyncHandle>;

    /// Stops accepting jobs and waits for the jobs already queued to finish.
    ///
    /// The default implementation does nothing.
    fn shutdown(&self) {}
}

/// A cloneable handle to a device queue.
///
/// All clones refer to the same queue. Batches from any number of groups may be submitted to one
/// queue; the queue runs them one at a time in submission order.
///
/// The built-in queue stops when the last clone is dropped, after finishing every queued batch.
///
/// # Examples
///
/// ```rust
/// use new_zealand::nz;
/// use work_group::DeviceQueue;
///
/// let queue = DeviceQueue::builder()
///     .name("stream-0")
///     .threads(nz!(2))
///     .build()
///     .unwrap();
///
/// assert_eq!(queue.name(), "stream-0");
/// ```
#[derive(Clone, Debug)]
pub struct DeviceQueue {
    backend: Arc<dyn DeviceBackend>,
}

impl DeviceQueue {
    /// Starts a host-emulated device queue with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceStart`] if the worker thread cannot be started.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Creates a builder for a host-emulated device queue.
    #[must_use]
    pub fn builder() -> DeviceQueueBuilder {
        DeviceQueueBuilder::new()
    }

    /// Wraps a custom backend.
    #[must_use]
    pub fn from_backend(backend: Arc<dyn DeviceBackend>) -> Self {
        Self { backend }
    }

    /// Name of the device behind this queue.
    #[must_use]
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Stops the queue for every clone of this handle.
    ///
    /// Batches that were already submitted still complete. Later submissions fail with
    /// [`Error::DeviceSubmission`].
    pub fn shutdown(&self) {
        self.backend.shutdown();
    }

    pub(crate) fn submit(&self, job: DeviceJob) -> Result<SyncHandle> {
        self.backend.submit(job)
    }
}

/// Builder for a host-emulated [`DeviceQueue`].
#[derive(Debug)]
pub struct DeviceQueueBuilder {
    name: Option<String>,
    threads: Option<NonZero<usize>>,
}

impl DeviceQueueBuilder {
    fn new() -> Self {
        Self {
            name: None,
            threads: None,
        }
    }

    /// Sets the name of the device, used for its threads, logs and errors.
    ///
    /// Defaults to a unique generated name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Gives the device a dedicated rayon thread pool of this size for the parallel part of its
    /// batches.
    ///
    /// By default batches use the global rayon thread pool.
    #[must_use]
    pub fn threads(mut self, threads: NonZero<usize>) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Starts the device queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceThreadPool`] if the dedicated thread pool cannot be built and
    /// [`Error::DeviceStart`] if the worker thread cannot be started.
    pub fn build(self) -> Result<DeviceQueue> {
        let name = self.name.unwrap_or_else(|| {
            format!(
                "work_group-device-{}",
                NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed)
            )
        });

        let threads = self
            .threads
            .map(|threads| {
                let name = name.clone();
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads.get())
                    .thread_name(move |index| format!("{name}-t{index}"))
                    .build()
            })
            .transpose()
            .map_err(Error::DeviceThreadPool)?;

        let (command_tx, command_rx) = channel::unbounded::<Submission>();

        let worker = thread::Builder::new()
            .name(format!("{name}-worker"))
            .spawn({
                let name = name.clone();
                move || worker_entrypoint(&name, &command_rx, threads.as_ref())
            })
            .map_err(Error::DeviceStart)?;

        debug!(device = %name, threads = ?self.threads, "device queue started");

        Ok(DeviceQueue::from_backend(Arc::new(HostDevice {
            name,
            command_tx: Mutex::new(Some(command_tx)),
            worker: Mutex::new(Some(worker)),
        })))
    }
}

/// A device stream emulated by one worker thread that executes jobs in channel order.
#[derive(Debug)]
struct HostDevice {
    name: String,

    /// `None` once the device has been shut down.
    command_tx: Mutex<Option<channel::Sender<Submission>>>,

    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HostDevice {
    fn rejected(&self, reason: &str) -> Error {
        Error::DeviceSubmission {
            device: self.name.clone(),
            reason: reason.to_owned(),
        }
    }
}

impl DeviceBackend for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, job: DeviceJob) -> Result<SyncHandle> {
        let (completion, handle) = completion_pair();

        let command_tx = self.command_tx.lock();
        let Some(command_tx) = command_tx.as_ref() else {
            return Err(self.rejected("the device queue has been shut down"));
        };

        command_tx
            .send(Submission { job, completion })
            .map_err(|_disconnected| self.rejected("the device worker thread has exited"))?;

        Ok(handle)
    }

    #[cfg_attr(test, mutants::skip)] // Impractical to test that a thread stops existing.
    fn shutdown(&self) {
        // Closing the channel lets the worker drain the queue and exit.
        drop(self.command_tx.lock().take());

        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        if worker.thread().id() == thread::current().id() {
            // Shut down from inside one of our own jobs; the worker exits once that job returns.
            return;
        }

        if let Err(payload) = worker.join() {
            // Jobs run inside a panic trap, so this means the worker itself is broken.
            panic::resume_unwind(payload);
        }

        debug!(device = %self.name, "device queue stopped");
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        if thread::panicking() {
            // Joining may hide the original panic behind a second one.
            return;
        }

        self.shutdown();
    }
}

struct Submission {
    job: DeviceJob,
    completion: Completion,
}

#[cfg_attr(test, mutants::skip)] // Without the loop every waiter hangs forever.
fn worker_entrypoint(
    name: &str,
    commands: &channel::Receiver<Submission>,
    threads: Option<&rayon::ThreadPool>,
) {
    debug!(device = name, "device worker started");

    for Submission { job, completion } in commands {
        match threads {
            Some(pool) => pool.install(move || completion.run(job)),
            None => completion.run(job),
        }
    }

    debug!(device = name, "device worker exiting");
}

/// Creates the two ends of a job completion event.
///
/// A backend keeps the [`Completion`] with the job and hands the [`SyncHandle`] back to the
/// submitter. If the completion is dropped without running the job, waiting on the handle
/// reports [`Error::DeviceDisconnected`].
#[must_use]
pub fn completion_pair() -> (Completion, SyncHandle) {
    let (sender, receiver) = oneshot::channel();

    (
        Completion { sender },
        SyncHandle {
            state: HandleState::Pending(receiver),
        },
    )
}

/// The backend side of a job completion event.
pub struct Completion {
    sender: oneshot::Sender<JobOutcome>,
}

impl Completion {
    /// Runs the job and reports its outcome to the matching [`SyncHandle`].
    ///
    /// A panic in the job is caught and re-raised on the thread that waits on the handle.
    pub fn run(self, job: DeviceJob) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(job));

        // Nobody may be waiting anymore, which is fine.
        drop(self.sender.send(outcome));
    }
}

impl Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}

/// Reports when a job submitted to a device queue has finished.
///
/// # Examples
///
/// ```rust
/// use work_group::completion_pair;
///
/// let (completion, mut handle) = completion_pair();
/// assert!(!handle.is_complete());
///
/// completion.run(Box::new(|| {}));
///
/// assert!(handle.is_complete());
/// handle.wait().unwrap();
/// ```
pub struct SyncHandle {
    state: HandleState,
}

enum HandleState {
    Pending(oneshot::Receiver<JobOutcome>),
    Finished(JobOutcome),
    Disconnected,
}

impl SyncHandle {
    /// A handle for a job that has already finished successfully.
    #[must_use]
    pub fn completed() -> Self {
        Self {
            state: HandleState::Finished(Ok(())),
        }
    }

    /// Whether the job has finished (or can no longer finish). Never blocks.
    pub fn is_complete(&mut self) -> bool {
        let HandleState::Pending(receiver) = &self.state else {
            return true;
        };

        match receiver.try_recv() {
            Ok(outcome) => {
                self.state = HandleState::Finished(outcome);
                true
            }
            Err(oneshot::TryRecvError::Empty) => false,
            Err(oneshot::TryRecvError::Disconnected) => {
                self.state = HandleState::Disconnected;
                true
            }
        }
    }

    /// Blocks until the job has finished.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceDisconnected`] if the device dropped the job without running it.
    ///
    /// # Panics
    ///
    /// If the job panicked, the panic is resumed on the calling thread.
    pub fn wait(self) -> Result<()> {
        match self.into_outcome()? {
            Ok(()) => Ok(()),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Blocks until the job has finished and returns its outcome without resuming panics.
    pub(crate) fn into_outcome(self) -> Result<JobOutcome> {
        match self.state {
            HandleState::Pending(receiver) => {
                receiver.recv().map_err(|_disconnected| Error::DeviceDisconnected)
            }
            HandleState::Finished(outcome) => Ok(outcome),
            HandleState::Disconnected => Err(Error::DeviceDisconnected),
        }
    }
}

impl Debug for SyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            HandleState::Pending(_) => "pending",
            HandleState::Finished(Ok(())) => "finished",
            HandleState::Finished(Err(_)) => "panicked",
            HandleState::Disconnected => "disconnected",
        };

        f.debug_struct(type_name::<Self>())
            .field("state", &state)
            .finish()
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(DeviceQueue: Send, Sync, Clone, Debug);
    assert_impl_all!(SyncHandle: Send, Debug);
    assert_impl_all!(Completion: Send, Debug);

    #[test]
    fn jobs_run_in_submission_order_on_worker_thread() {
        let queue = DeviceQueue::builder().name("ordered").build().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let handles = (0..10)
            .map(|value| {
                let log = Arc::clone(&log);
                queue
                    .submit(Box::new(move || {
                        assert_eq!(thread::current().name(), Some("ordered-worker"));
                        log.lock().push(value);
                    }))
                    .unwrap()
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.wait().unwrap();
        }

        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn dedicated_threads_are_used_by_jobs() {
        let queue = DeviceQueue::builder().threads(nz!(3)).build().unwrap();
        let threads = Arc::new(AtomicUsize::new(0));

        queue
            .submit(Box::new({
                let threads = Arc::clone(&threads);
                move || threads.store(rayon::current_num_threads(), Ordering::Relaxed)
            }))
            .unwrap()
            .wait()
            .unwrap();

        assert_eq!(threads.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn generated_names_are_distinct() {
        let first = DeviceQueue::new().unwrap();
        let second = DeviceQueue::new().unwrap();

        assert_ne!(first.name(), second.name());
    }

    #[test]
    fn submission_after_shutdown_is_rejected() {
        let queue = DeviceQueue::builder().name("closed").build().unwrap();
        let clone = queue.clone();
        queue.shutdown();

        let result = clone.submit(Box::new(|| {}));

        assert!(matches!(
            result,
            Err(Error::DeviceSubmission { ref device, .. }) if device == "closed"
        ));
    }

    #[test]
    fn shutdown_finishes_queued_jobs() {
        let queue = DeviceQueue::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let handle = queue
            .submit(Box::new({
                let ran = Arc::clone(&ran);
                move || {
                    thread::sleep(Duration::from_millis(10));
                    ran.store(true, Ordering::Relaxed);
                }
            }))
            .unwrap();

        queue.shutdown();

        assert!(ran.load(Ordering::Relaxed));
        handle.wait().unwrap();
    }

    #[test]
    #[should_panic(expected = "job exploded")]
    fn wait_resumes_job_panic() {
        let queue = DeviceQueue::new().unwrap();

        let handle = queue
            .submit(Box::new(|| panic!("job exploded")))
            .unwrap();

        drop(handle.wait());
    }

    #[test]
    fn queue_survives_panicking_job() {
        let queue = DeviceQueue::new().unwrap();

        let failed = queue.submit(Box::new(|| panic!("first job fails"))).unwrap();
        let outcome = failed.into_outcome().unwrap();
        assert_eq!(
            panic_message(outcome.unwrap_err().as_ref()),
            "first job fails"
        );

        queue.submit(Box::new(|| {})).unwrap().wait().unwrap();
    }

    #[test]
    fn dropped_completion_disconnects_handle() {
        let (completion, mut handle) = completion_pair();
        drop(completion);

        assert!(handle.is_complete());
        assert!(matches!(handle.wait(), Err(Error::DeviceDisconnected)));
    }

    #[test]
    fn is_complete_tracks_job_progress() {
        let queue = DeviceQueue::new().unwrap();
        let (release_tx, release_rx) = channel::bounded::<()>(0);

        let mut handle = queue
            .submit(Box::new(move || {
                release_rx.recv().unwrap();
            }))
            .unwrap();

        assert!(!handle.is_complete());

        release_tx.send(()).unwrap();

        while !handle.is_complete() {
            thread::yield_now();
        }

        handle.wait().unwrap();
    }

    #[test]
    fn completed_handle_is_complete() {
        let mut handle = SyncHandle::completed();

        assert!(handle.is_complete());
        handle.wait().unwrap();
    }

    #[test]
    fn panic_message_handles_owned_and_unknown_payloads() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let unknown: Box<dyn Any + Send> = Box::new(42_u8);

        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(unknown.as_ref()), "unknown panic payload");
    }
}
