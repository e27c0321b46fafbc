use std::marker::PhantomData;

use tracing::warn;

use crate::device::panic_message;
use crate::{Result, SyncHandle};

/// The resources of one run of a [`WorkGroup`][crate::WorkGroup].
///
/// A site borrows the group that created it, so the group cannot be dropped or moved before the
/// site is gone. Runs on a device may still be executing while the site exists; call
/// [`synchronize()`][Self::synchronize] before reading anything the run produces.
///
/// Dropping a site without synchronizing it waits for the run to finish. A failure of the run is
/// then logged instead of being reported.
#[derive(Debug)]
#[must_use = "a run is only guaranteed to be complete once its site has been synchronized"]
pub struct WorkSite<'g> {
    /// `None` once the run is known to have completed and its outcome has been reported.
    handle: Option<SyncHandle>,

    _group: PhantomData<&'g ()>,
}

impl WorkSite<'_> {
    pub(crate) fn new(handle: Option<SyncHandle>) -> Self {
        Self {
            handle,
            _group: PhantomData,
        }
    }

    /// Waits for the run to finish and releases its resources.
    ///
    /// Returns immediately for runs that executed on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceDisconnected`][crate::Error::DeviceDisconnected] if the device
    /// dropped the batch without running it.
    ///
    /// # Panics
    ///
    /// If an operation panicked while the batch executed on a device, the panic is resumed on
    /// the calling thread.
    pub fn synchronize(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.wait(),
            None => Ok(()),
        }
    }

    /// Whether the run has finished. Never blocks.
    #[must_use]
    pub fn is_complete(&mut self) -> bool {
        self.handle.as_mut().is_none_or(SyncHandle::is_complete)
    }
}

impl Drop for WorkSite<'_> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        match handle.into_outcome() {
            Ok(Ok(())) => {}
            Ok(Err(payload)) => {
                warn!(
                    panic_message = panic_message(payload.as_ref()),
                    "an operation panicked during a run whose site was dropped without being synchronized"
                );
            }
            Err(error) => {
                warn!(
                    %error,
                    "a run whose site was dropped without being synchronized did not complete"
                );
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{DeviceQueue, Error, ExecPolicy, WorkPool, completion_pair};

    assert_impl_all!(WorkSite<'static>: Send);

    #[test]
    fn completed_site_synchronizes_immediately() {
        let mut site = WorkSite::new(None);

        assert!(site.is_complete());
        site.synchronize().unwrap();
    }

    #[test]
    fn disconnected_run_is_reported() {
        let (completion, handle) = completion_pair();
        drop(completion);

        let site = WorkSite::new(Some(handle));

        assert!(matches!(site.synchronize(), Err(Error::DeviceDisconnected)));
    }

    #[test]
    fn dropping_site_waits_for_run() {
        let finished = Arc::new(AtomicBool::new(false));
        let mut pool = WorkPool::<i32, ()>::builder()
            .execution(ExecPolicy::device(DeviceQueue::new().unwrap()))
            .build()
            .unwrap();

        pool.enqueue(0..1, {
            let finished = Arc::clone(&finished);
            move |_, (): &()| {
                std::thread::sleep(std::time::Duration::from_millis(20));
                finished.store(true, Ordering::Relaxed);
            }
        })
        .unwrap();

        let group = pool.instantiate();
        drop(group.run(()).unwrap());

        assert!(finished.load(Ordering::Relaxed));
    }

    #[test]
    fn dropping_site_of_panicked_run_does_not_panic() {
        let mut pool = WorkPool::<i32, ()>::builder()
            .execution(ExecPolicy::device(DeviceQueue::new().unwrap()))
            .build()
            .unwrap();

        pool.enqueue(0..1, |_, (): &()| panic!("operation failed"))
            .unwrap();

        let group = pool.instantiate();
        drop(group.run(()).unwrap());
    }
}
