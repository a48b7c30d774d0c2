//! Named counting semaphore in shared memory

use crate::shm::SharedMemory;
use crate::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[repr(C)]
struct SemaphoreLayout {
    magic: AtomicU32,
    count: AtomicU32,
}

const MAGIC: u32 = 0x5853_534D; // "XSSM"

/// Sleep between polls once spinning stops paying off.
const POLL_INTERVAL: Duration = Duration::from_millis(1);
const SPIN_POLLS: u32 = 64;

/// Counting semaphore shared by name between processes. Starts at zero.
pub struct NamedSemaphore {
    shm: SharedMemory,
}

impl NamedSemaphore {
    /// Segment name of the semaphore belonging to exchange `name`.
    pub fn segment_name(name: &str) -> String {
        format!("{}_sem", name)
    }

    /// Create the semaphore for `name` with a count of zero, replacing a stale one.
    pub fn create(name: &str) -> Result<Self> {
        let shm = SharedMemory::recreate(
            &Self::segment_name(name),
            std::mem::size_of::<SemaphoreLayout>(),
        )?;
        let sem = Self { shm };
        sem.layout().count.store(0, Ordering::Relaxed);
        sem.layout().magic.store(MAGIC, Ordering::Release);
        Ok(sem)
    }

    pub fn open(name: &str) -> Result<Self> {
        let shm = SharedMemory::open(&Self::segment_name(name))?;
        if shm.size() < std::mem::size_of::<SemaphoreLayout>() {
            return Err(Error::Protocol(format!("{} is not a semaphore", shm.name())));
        }
        let sem = Self { shm };
        if sem.layout().magic.load(Ordering::Acquire) != MAGIC {
            return Err(Error::Protocol(format!("{} is not a semaphore", sem.shm.name())));
        }
        Ok(sem)
    }

    /// Best-effort removal of the semaphore for `name`.
    pub fn remove(name: &str) {
        SharedMemory::remove(&Self::segment_name(name));
    }

    fn layout(&self) -> &SemaphoreLayout {
        // Safety: the mapping holds at least one `SemaphoreLayout` of atomics.
        unsafe { &*(self.shm.as_ptr() as *const SemaphoreLayout) }
    }

    pub fn post(&self) {
        self.layout().count.fetch_add(1, Ordering::Release);
    }

    /// Take one unit if available.
    pub fn try_wait(&self) -> bool {
        self.layout()
            .count
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Wait up to `timeout` for a unit; false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut polls = 0u32;
        loop {
            if self.try_wait() {
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            if polls < SPIN_POLLS {
                polls += 1;
                std::thread::yield_now();
            } else {
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }

    /// Wait without bound.
    pub fn wait(&self) {
        while !self.wait_timeout(Duration::from_secs(3600)) {}
    }

    /// Current count.
    pub fn value(&self) -> u32 {
        self.layout().count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn name(tag: &str) -> String {
        format!("/xsync_sem_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_counting() {
        let sem = NamedSemaphore::create(&name("count")).unwrap();
        assert!(!sem.try_wait());
        sem.post();
        sem.post();
        assert_eq!(sem.value(), 2);
        assert!(sem.try_wait());
        assert!(sem.wait_timeout(Duration::ZERO));
        assert!(!sem.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_post_from_other_mapping_wakes_waiter() {
        let name = name("wake");
        let owner = NamedSemaphore::create(&name).unwrap();
        let other = Arc::new(NamedSemaphore::open(&name).unwrap());
        let poster = Arc::clone(&other);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            poster.post();
        });
        assert!(owner.wait_timeout(Duration::from_secs(5)));
        t.join().unwrap();
        assert_eq!(other.value(), 0);
    }

    #[test]
    fn test_create_resets_stale_count() {
        let name = name("stale");
        let first = NamedSemaphore::create(&name).unwrap();
        first.post();
        std::mem::forget(first);
        let fresh = NamedSemaphore::create(&name).unwrap();
        assert_eq!(fresh.value(), 0);
    }
}
