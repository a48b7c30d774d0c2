//! POSIX shared memory wrapper

use crate::{Error, Result};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use shared_memory::{Shmem, ShmemConf};
use std::os::fd::OwnedFd;

/// Named shared memory region.
///
/// The creating side owns the name and unlinks it on drop; opened mappings only unmap.
pub struct SharedMemory {
    inner: Shmem,
    name: String,
    size: usize,
    owner: bool,
}

// Safety: the mapping stays valid for the lifetime of `inner` and is process-wide accessible.
// Concurrent access to its contents goes through atomics or an outer lock.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create a new shared memory region
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(name)
            .create()
            .map_err(|e| Error::SharedMemory(format!("create {}: {}", name, e)))?;

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
            owner: true,
        })
    }

    /// Remove a stale region of the same name, then create a fresh one.
    pub fn recreate(name: &str, size: usize) -> Result<Self> {
        Self::remove(name);
        Self::create(name, size)
    }

    /// Open an existing shared memory region
    pub fn open(name: &str) -> Result<Self> {
        let mut shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| Error::SharedMemory(format!("open {}: {}", name, e)))?;
        shmem.set_owner(false);

        let size = shmem.len();

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
            owner: false,
        })
    }

    /// Best-effort removal of a named region; failures are ignored.
    pub fn remove(name: &str) {
        if shm_unlink(name).is_ok() {
            tracing::debug!(name, "removed stale shared memory segment");
        }
    }

    /// Open a fresh descriptor on the backing object, for out-of-band transfer.
    pub fn descriptor(&self) -> Result<OwnedFd> {
        Ok(shm_open(self.name.as_str(), OFlag::O_RDONLY, Mode::empty())?)
    }

    /// Get the name of the shared memory region
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the size of the shared memory region
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether dropping this mapping unlinks the name.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Get a raw pointer to the shared memory
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    /// Get a mutable raw pointer to the shared memory
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.inner.as_ptr()
    }

    /// Get a slice view of the shared memory
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.size) }
    }

    /// Get a mutable slice view of the shared memory
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.size) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/xs_shm_{}", ts)
    }

    #[test]
    fn test_create_open_share_bytes() {
        let name = unique_name();
        let mut owner = SharedMemory::create(&name, 128).unwrap();
        owner.as_mut_slice()[..5].copy_from_slice(b"hello");

        let view = SharedMemory::open(&name).unwrap();
        assert!(!view.is_owner());
        assert_eq!(&view.as_slice()[..5], b"hello");
        assert!(view.size() >= 128);
    }

    #[test]
    fn test_recreate_replaces_stale_segment() {
        let name = unique_name();
        let stale = SharedMemory::create(&name, 64).unwrap();
        // A crashed run leaves the name behind.
        std::mem::forget(stale);

        assert!(SharedMemory::create(&name, 64).is_err());
        let fresh = SharedMemory::recreate(&name, 64).unwrap();
        assert!(fresh.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_remove_missing_is_ignored() {
        SharedMemory::remove(&unique_name());
    }
}
