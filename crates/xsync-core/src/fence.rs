//! Fences

use crate::driver::{Driver, FenceStatus};
use crate::handle::{CommandQueueHandle, FenceHandle};
use crate::{Error, Result};

/// Attempts `sync_fence` makes on a not-ready fence before giving up.
pub const FENCE_SYNC_RETRIES: u32 = 5;

pub fn create_fence(driver: &Driver, queue: CommandQueueHandle) -> Result<FenceHandle> {
    driver.create_fence(queue)
}

pub fn destroy_fence(driver: &Driver, fence: FenceHandle) -> Result<()> {
    driver.destroy_fence(fence)
}

pub fn reset_fence(driver: &Driver, fence: FenceHandle) -> Result<()> {
    driver.reset_fence(fence)
}

pub fn query_fence(driver: &Driver, fence: FenceHandle) -> Result<FenceStatus> {
    driver.query_fence_status(fence)
}

/// Wait for `fence`, retrying not-ready up to [`FENCE_SYNC_RETRIES`] times with a yield in
/// between. Any other failure is returned at once.
pub fn sync_fence(driver: &Driver, fence: FenceHandle, timeout_ns: u64) -> Result<()> {
    for attempt in 1..=FENCE_SYNC_RETRIES {
        match driver.fence_host_synchronize(fence, timeout_ns) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_not_ready() => {
                tracing::trace!(%fence, attempt, "fence not ready");
                std::thread::yield_now();
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::RetriesExhausted {
        operation: "zeFenceHostSynchronize",
        attempts: FENCE_SYNC_RETRIES,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{BundleDesc, CommandBundle};
    use crate::harness::Harness;

    #[test]
    fn test_unsignaled_fence_exhausts_retries() {
        let h = Harness::reference().unwrap();
        let bundle = CommandBundle::create(
            h.driver(),
            h.context(),
            h.device(),
            &BundleDesc::default(),
        )
        .unwrap();
        let queue = bundle.queue().unwrap();
        let fence = create_fence(h.driver(), queue).unwrap();

        let err = sync_fence(h.driver(), fence, 0).unwrap_err();
        assert!(matches!(
            err,
            Error::RetriesExhausted {
                attempts: FENCE_SYNC_RETRIES,
                ..
            }
        ));
        destroy_fence(h.driver(), fence).unwrap();
    }

    #[test]
    fn test_sync_after_execute() {
        let h = Harness::reference().unwrap();
        let d = h.driver();
        let mut bundle =
            CommandBundle::create(d, h.context(), h.device(), &BundleDesc::default()).unwrap();
        let queue = bundle.queue().unwrap();
        let fence = create_fence(d, queue).unwrap();
        bundle.append_barrier(None, &[]).unwrap();
        bundle.close().unwrap();
        d.execute_command_lists(queue, &[bundle.list()], Some(fence)).unwrap();

        sync_fence(d, fence, u64::MAX).unwrap();
        assert_eq!(query_fence(d, fence).unwrap(), FenceStatus::Signaled);
        reset_fence(d, fence).unwrap();
        assert_eq!(query_fence(d, fence).unwrap(), FenceStatus::NotReady);
        destroy_fence(d, fence).unwrap();
    }

    #[test]
    fn test_invalid_fence_is_fatal() {
        let h = Harness::reference().unwrap();
        let err = sync_fence(h.driver(), FenceHandle::invalid(), 0).unwrap_err();
        assert!(matches!(err, Error::InvalidHandle("fence")));
    }
}
