use thiserror::Error;

/// Errors that can occur when building, instantiating or running a batch of loops.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An operation does not fit in the fixed slot of a constant-stride storage.
    ///
    /// The slot stride is fixed either up front or by the first appended operation. An operation
    /// that needs more bytes, or a stricter alignment than the stride can honor, is rejected
    /// instead of being truncated or moved to a different storage layout.
    #[error(
        "operation needs {required} bytes aligned to {align} but the constant stride slot is {stride} bytes"
    )]
    CapacityExceeded {
        /// Bytes the entry (metadata plus captured state) would occupy in a slot.
        required: usize,

        /// Alignment required by the captured state of the operation.
        align: usize,

        /// The fixed slot stride of the storage.
        stride: usize,
    },

    /// The allocator could not satisfy a request for loop storage.
    ///
    /// The storage that made the request remains valid and keeps all previously appended loops.
    #[error("allocator could not provide {size} bytes aligned to {align}")]
    AllocationFailed {
        /// Requested allocation size in bytes.
        size: usize,

        /// Requested allocation alignment in bytes.
        align: usize,
    },

    /// The device rejected a batch submitted by `run()`. No site is created for the run.
    #[error("device '{device}' rejected the batch: {reason}")]
    DeviceSubmission {
        /// Name of the device queue that rejected the batch.
        device: String,

        /// A human-readable description of the problem.
        reason: String,
    },

    /// The device stopped before reporting completion of a submitted batch.
    #[error("device shut down before the batch completed")]
    DeviceDisconnected,

    /// The worker thread of a device queue could not be started.
    #[error("failed to start device queue worker thread")]
    DeviceStart(#[source] std::io::Error),

    /// The thread pool that executes the parallel part of device batches could not be built.
    #[error("failed to build device thread pool")]
    DeviceThreadPool(#[source] rayon::ThreadPoolBuildError),
}

/// A specialized `Result` type for work group operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
