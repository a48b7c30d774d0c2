//! Typed memory allocation and data patterns
//!
//! [`Buffer`] owns a local allocation and frees it on drop. [`ImportedBuffer`] owns the local
//! mapping of an allocation exported by another process and closes it on drop; the exporter
//! keeps sole ownership of the allocation itself.

use crate::driver::{Driver, IpcMemHandle, IpcMemoryFlags, MemoryKind};
use crate::handle::{ContextHandle, DeviceHandle, MemoryHandle};
use crate::{Error, Result};

/// Who may access a shared allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedScope {
    /// Bound to one device.
    SingleDevice,
    /// Accessible from every device of the driver.
    CrossDevice,
    /// Plain system memory the devices can use, where supported.
    SystemWide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Host,
    Device,
    Shared(SharedScope),
}

/// Bytes of the data pattern seeded with `seed`: `seed, 2*seed, 3*seed, ...` modulo 256.
pub fn data_pattern(size: usize, seed: u8) -> Vec<u8> {
    let mut dp = seed;
    (0..size)
        .map(|_| {
            let b = dp;
            dp = dp.wrapping_add(seed);
            b
        })
        .collect()
}

/// Check `data` against [`data_pattern`], reporting the first mismatch.
pub fn validate_data_pattern(data: &[u8], seed: u8) -> Result<()> {
    let expected = data_pattern(data.len(), seed);
    match data.iter().zip(&expected).position(|(a, e)| a != e) {
        Some(offset) => Err(Error::DataMismatch {
            offset,
            expected: expected[offset],
            actual: data[offset],
        }),
        None => Ok(()),
    }
}

/// Owned allocation, freed on drop.
pub struct Buffer {
    driver: Driver,
    context: ContextHandle,
    handle: MemoryHandle,
    size: usize,
    memory_type: MemoryType,
}

impl Buffer {
    pub fn allocate(
        driver: &Driver,
        context: ContextHandle,
        device: DeviceHandle,
        memory_type: MemoryType,
        size: usize,
    ) -> Result<Self> {
        let handle = match memory_type {
            MemoryType::Host => driver.allocate_host(context, size, 1)?,
            MemoryType::Device => driver.allocate_device(context, device, size, 1)?,
            MemoryType::Shared(SharedScope::SingleDevice) => {
                driver.allocate_shared(context, Some(device), size, 1)?
            }
            MemoryType::Shared(SharedScope::CrossDevice) => {
                driver.allocate_shared(context, None, size, 1)?
            }
            MemoryType::Shared(SharedScope::SystemWide) => {
                if !driver.device_properties(device)?.system_shared_allocations {
                    return Err(Error::Unsupported(format!(
                        "{} cannot use shared system allocations",
                        device
                    )));
                }
                driver.allocate_shared_system(context, size, 1)?
            }
        };
        tracing::trace!(%handle, ?memory_type, size, "buffer allocated");
        Ok(Self {
            driver: driver.clone(),
            context,
            handle,
            size,
            memory_type,
        })
    }

    pub fn host(driver: &Driver, context: ContextHandle, size: usize) -> Result<Self> {
        let handle = driver.allocate_host(context, size, 1)?;
        Ok(Self {
            driver: driver.clone(),
            context,
            handle,
            size,
            memory_type: MemoryType::Host,
        })
    }

    pub fn device(
        driver: &Driver,
        context: ContextHandle,
        device: DeviceHandle,
        size: usize,
    ) -> Result<Self> {
        Self::allocate(driver, context, device, MemoryType::Device, size)
    }

    pub fn shared(
        driver: &Driver,
        context: ContextHandle,
        device: DeviceHandle,
        scope: SharedScope,
        size: usize,
    ) -> Result<Self> {
        Self::allocate(driver, context, device, MemoryType::Shared(scope), size)
    }

    pub fn handle(&self) -> MemoryHandle {
        self.handle
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn is_host_accessible(&self) -> bool {
        self.memory_type != MemoryType::Device
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.driver.host_write(self.handle, offset, data)
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.driver.host_read(self.handle, offset, out)
    }

    /// Full contents.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.size];
        self.read(0, &mut out)?;
        Ok(out)
    }

    pub fn write_pattern(&self, seed: u8) -> Result<()> {
        self.write(0, &data_pattern(self.size, seed))
    }

    pub fn validate_pattern(&self, seed: u8) -> Result<()> {
        validate_data_pattern(&self.to_vec()?, seed)
    }

    /// Export the allocation. Each call must be matched by at most one
    /// [`put_ipc_handle`](Self::put_ipc_handle); puts never free the buffer.
    pub fn ipc_handle(&self) -> Result<IpcMemHandle> {
        self.driver.mem_get_ipc_handle(self.context, self.handle)
    }

    pub fn put_ipc_handle(&self, handle: IpcMemHandle) -> Result<()> {
        self.driver.mem_put_ipc_handle(self.context, handle)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Err(e) = self.driver.free_memory(self.context, self.handle) {
            tracing::warn!(handle = %self.handle, error = %e, "failed to free buffer");
        }
    }
}

/// Local mapping of an exported allocation, closed on drop.
pub struct ImportedBuffer {
    driver: Driver,
    context: ContextHandle,
    handle: MemoryHandle,
    size: usize,
}

impl ImportedBuffer {
    pub fn open(
        driver: &Driver,
        context: ContextHandle,
        device: DeviceHandle,
        ipc: IpcMemHandle,
        flags: IpcMemoryFlags,
    ) -> Result<Self> {
        let handle = driver.mem_open_ipc_handle(context, device, ipc, flags)?;
        let props = driver.memory_properties(handle)?;
        debug_assert!(props.imported && props.kind == MemoryKind::Device);
        tracing::debug!(%handle, size = props.size, "opened IPC memory");
        Ok(Self {
            driver: driver.clone(),
            context,
            handle,
            size: props.size,
        })
    }

    pub fn handle(&self) -> MemoryHandle {
        self.handle
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Close the mapping now and report failures.
    pub fn close(mut self) -> Result<()> {
        let handle = std::mem::replace(&mut self.handle, MemoryHandle::invalid());
        self.driver.mem_close_ipc_handle(self.context, handle)
    }
}

impl Drop for ImportedBuffer {
    fn drop(&mut self) {
        if !self.handle.is_valid() {
            return;
        }
        if let Err(e) = self.driver.mem_close_ipc_handle(self.context, self.handle) {
            tracing::warn!(handle = %self.handle, error = %e, "failed to close IPC memory");
        }
    }
}
