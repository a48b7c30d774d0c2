//! Memory allocation, host access and IPC memory export/import

use super::ipc::{Export, IpcHandle, IpcHandleData, IpcHandleKind, IpcMemHandle};
use super::{fail, segment_name, Driver, State, ZeResult};
use crate::handle::{ContextHandle, DeviceHandle, MemoryHandle};
use crate::shm::SharedMemory;
use crate::{Error, Result};
use bitflags::bitflags;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Host,
    Device,
    Shared,
}

bitflags! {
    /// Cache hints for an imported allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IpcMemoryFlags: u32 {
        const BIAS_CACHED = 1 << 0;
        const BIAS_UNCACHED = 1 << 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryProperties {
    pub kind: MemoryKind,
    pub size: usize,
    /// Owning device; `None` for host and system allocations.
    pub device: Option<DeviceHandle>,
    /// Opened from an IPC handle rather than allocated locally.
    pub imported: bool,
}

enum Backing {
    Heap(Vec<u8>),
    Shared(SharedMemory),
}

impl Backing {
    fn bytes(&mut self) -> &mut [u8] {
        match self {
            Backing::Heap(v) => v.as_mut_slice(),
            Backing::Shared(shm) => shm.as_mut_slice(),
        }
    }
}

/// Storage of one allocation. Local allocations start on the heap and move to a named segment
/// on first export.
pub(crate) struct Allocation {
    pub(crate) id: u64,
    pub(crate) kind: MemoryKind,
    pub(crate) size: usize,
    pub(crate) device: Option<DeviceHandle>,
    backing: Mutex<Backing>,
}

impl Allocation {
    fn lock(&self) -> MutexGuard<'_, Backing> {
        self.backing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn range(&self, offset: usize, len: usize) -> Option<std::ops::Range<usize>> {
        let end = offset.checked_add(len)?;
        (end <= self.size).then_some(offset..end)
    }

    pub(crate) fn read(&self, offset: usize, out: &mut [u8]) -> bool {
        match self.range(offset, out.len()) {
            Some(r) => {
                out.copy_from_slice(&self.lock().bytes()[r]);
                true
            }
            None => false,
        }
    }

    pub(crate) fn write(&self, offset: usize, data: &[u8]) -> bool {
        match self.range(offset, data.len()) {
            Some(r) => {
                self.lock().bytes()[r].copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// Repeat `pattern` over `len` bytes starting at `offset`.
    pub(crate) fn fill(&self, offset: usize, len: usize, pattern: &[u8]) -> bool {
        match self.range(offset, len) {
            Some(r) if !pattern.is_empty() => {
                let mut backing = self.lock();
                for (dst, src) in backing.bytes()[r].iter_mut().zip(pattern.iter().cycle()) {
                    *dst = *src;
                }
                true
            }
            _ => false,
        }
    }

    /// Apply `f` to every byte in range.
    pub(crate) fn update(&self, offset: usize, len: usize, f: impl Fn(u8) -> u8) -> bool {
        match self.range(offset, len) {
            Some(r) => {
                for b in &mut self.lock().bytes()[r] {
                    *b = f(*b);
                }
                true
            }
            None => false,
        }
    }

    /// Move the contents into a named segment so another process can map them.
    fn export(&self, name: &str) -> Result<SharedMemory> {
        let mut backing = self.lock();
        if let Backing::Shared(shm) = &*backing {
            return SharedMemory::open(shm.name());
        }
        let mut shm = SharedMemory::create(name, self.size)?;
        if let Backing::Heap(v) = &*backing {
            shm.as_mut_slice()[..self.size].copy_from_slice(v);
        }
        let name = shm.name().to_string();
        *backing = Backing::Shared(shm);
        SharedMemory::open(&name)
    }

    fn segment_name(&self) -> Option<String> {
        match &*self.lock() {
            Backing::Shared(shm) => Some(shm.name().to_string()),
            Backing::Heap(_) => None,
        }
    }
}

pub(crate) struct AllocationEntry {
    pub(crate) alloc: Arc<Allocation>,
    pub(crate) context: u64,
    pub(crate) imported: bool,
}

impl Driver {
    pub fn allocate_host(
        &self,
        context: ContextHandle,
        size: usize,
        alignment: usize,
    ) -> Result<MemoryHandle> {
        self.allocate(context, MemoryKind::Host, None, size, alignment, "zeMemAllocHost")
    }

    pub fn allocate_device(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        size: usize,
        alignment: usize,
    ) -> Result<MemoryHandle> {
        self.device_record(device, "zeMemAllocDevice")?;
        self.allocate(
            context,
            MemoryKind::Device,
            Some(device),
            size,
            alignment,
            "zeMemAllocDevice",
        )
    }

    /// Shared allocation; `device` of `None` makes it accessible from every device.
    pub fn allocate_shared(
        &self,
        context: ContextHandle,
        device: Option<DeviceHandle>,
        size: usize,
        alignment: usize,
    ) -> Result<MemoryHandle> {
        if let Some(device) = device {
            self.device_record(device, "zeMemAllocShared")?;
        }
        self.allocate(context, MemoryKind::Shared, device, size, alignment, "zeMemAllocShared")
    }

    /// System allocation usable by devices, where the driver supports it.
    pub fn allocate_shared_system(
        &self,
        context: ContextHandle,
        size: usize,
        alignment: usize,
    ) -> Result<MemoryHandle> {
        if !self.shared.config.system_shared_allocations {
            return fail("malloc (shared system)", ZeResult::UnsupportedFeature);
        }
        self.allocate(context, MemoryKind::Shared, None, size, alignment, "malloc (shared system)")
    }

    fn allocate(
        &self,
        context: ContextHandle,
        kind: MemoryKind,
        device: Option<DeviceHandle>,
        size: usize,
        alignment: usize,
        call: &'static str,
    ) -> Result<MemoryHandle> {
        if alignment != 0 && !alignment.is_power_of_two() {
            return fail(call, ZeResult::InvalidArgument);
        }
        if size == 0 || size > self.shared.config.max_mem_alloc_size {
            return fail(call, ZeResult::InvalidSize);
        }
        let raw = self.next_raw();
        let mut state = self.state();
        let context = Self::check_context(&state, context, call)?;
        let alloc = Arc::new(Allocation {
            id: raw.get(),
            kind,
            size,
            device,
            backing: Mutex::new(Backing::Heap(vec![0u8; size])),
        });
        state.allocations.insert(
            raw.get(),
            AllocationEntry {
                alloc,
                context,
                imported: false,
            },
        );
        tracing::trace!(id = raw.get(), ?kind, size, "allocated");
        Ok(MemoryHandle::from_raw(raw))
    }

    /// Free a local allocation. Outstanding exports of it are dropped.
    pub fn free_memory(&self, context: ContextHandle, mem: MemoryHandle) -> Result<()> {
        let raw = mem.raw()?;
        let mut state = self.state();
        let context = Self::check_context(&state, context, "zeMemFree")?;
        match state.allocations.get(&raw) {
            Some(entry) if entry.context == context && !entry.imported => {}
            _ => return fail("zeMemFree", ZeResult::InvalidArgument),
        }
        state.allocations.remove(&raw);
        if state.memory_exports.remove(&raw).is_some() {
            tracing::debug!(id = raw, "freed allocation with outstanding IPC exports");
        }
        Ok(())
    }

    pub fn memory_properties(&self, mem: MemoryHandle) -> Result<MemoryProperties> {
        let raw = mem.raw()?;
        let state = self.state();
        match state.allocations.get(&raw) {
            Some(entry) => Ok(MemoryProperties {
                kind: entry.alloc.kind,
                size: entry.alloc.size,
                device: entry.alloc.device,
                imported: entry.imported,
            }),
            None => fail("zeMemGetAllocProperties", ZeResult::InvalidArgument),
        }
    }

    /// Read host-accessible memory.
    pub fn host_read(&self, mem: MemoryHandle, offset: usize, out: &mut [u8]) -> Result<()> {
        let alloc = self.host_accessible(mem, "host read")?;
        if !alloc.read(offset, out) {
            return fail("host read", ZeResult::InvalidSize);
        }
        Ok(())
    }

    /// Write host-accessible memory.
    pub fn host_write(&self, mem: MemoryHandle, offset: usize, data: &[u8]) -> Result<()> {
        let alloc = self.host_accessible(mem, "host write")?;
        if !alloc.write(offset, data) {
            return fail("host write", ZeResult::InvalidSize);
        }
        Ok(())
    }

    fn host_accessible(&self, mem: MemoryHandle, call: &'static str) -> Result<Arc<Allocation>> {
        let alloc = Self::allocation(&self.state(), mem, call)?;
        if alloc.kind == MemoryKind::Device {
            return fail(call, ZeResult::InvalidArgument);
        }
        Ok(alloc)
    }

    pub(crate) fn allocation(
        state: &State,
        mem: MemoryHandle,
        call: &'static str,
    ) -> Result<Arc<Allocation>> {
        let raw = mem.raw()?;
        match state.allocations.get(&raw) {
            Some(entry) => Ok(Arc::clone(&entry.alloc)),
            None => fail(call, ZeResult::InvalidArgument),
        }
    }

    // ---- IPC -----------------------------------------------------------------------------

    /// Export an allocation. Every get must be balanced by at most one put; puts never free
    /// the allocation.
    pub fn mem_get_ipc_handle(
        &self,
        context: ContextHandle,
        mem: MemoryHandle,
    ) -> Result<IpcMemHandle> {
        let raw = mem.raw()?;
        let mut state = self.state();
        let context = Self::check_context(&state, context, "zeMemGetIpcHandle")?;
        let alloc = match state.allocations.get(&raw) {
            Some(entry) if entry.context == context && !entry.imported => Arc::clone(&entry.alloc),
            _ => return fail("zeMemGetIpcHandle", ZeResult::InvalidArgument),
        };

        if !state.memory_exports.contains_key(&raw) {
            let view = alloc.export(&segment_name("m"))?;
            let fd = view.descriptor()?;
            state.memory_exports.insert(raw, Export { fd, gets: 0 });
        }
        let export = match state.memory_exports.get_mut(&raw) {
            Some(export) => export,
            None => return fail("zeMemGetIpcHandle", ZeResult::InvalidArgument),
        };
        export.gets += 1;
        let name = alloc.segment_name().unwrap_or_default();
        let data = IpcHandleData::new(
            IpcHandleKind::Memory,
            export.fd.as_raw_fd(),
            alloc.id,
            alloc.size as u64,
            &name,
        )?;
        tracing::debug!(id = alloc.id, gets = export.gets, "exported allocation");
        Ok(IpcMemHandle::from_data_unchecked(data))
    }

    /// Release one get of an exported allocation.
    pub fn mem_put_ipc_handle(&self, context: ContextHandle, handle: IpcMemHandle) -> Result<()> {
        let mut state = self.state();
        Self::check_context(&state, context, "zeMemPutIpcHandle")?;
        let data = handle.data();
        if data.pid() != std::process::id() {
            return fail("zeMemPutIpcHandle", ZeResult::InvalidArgument);
        }
        let id = data.object_id();
        let remaining = match state.memory_exports.get_mut(&id) {
            Some(export) => {
                export.gets -= 1;
                export.gets
            }
            None => return fail("zeMemPutIpcHandle", ZeResult::InvalidArgument),
        };
        if remaining == 0 {
            state.memory_exports.remove(&id);
        }
        tracing::debug!(id, remaining, "released IPC handle");
        Ok(())
    }

    /// Map an allocation exported by another process (or this one).
    pub fn mem_open_ipc_handle(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        handle: IpcMemHandle,
        flags: IpcMemoryFlags,
    ) -> Result<MemoryHandle> {
        self.device_record(device, "zeMemOpenIpcHandle")?;
        let data = *handle.data();
        let shm = SharedMemory::open(data.name()?).map_err(|e| {
            tracing::warn!(error = %e, "IPC memory segment is gone");
            Error::driver("zeMemOpenIpcHandle", ZeResult::InvalidArgument)
        })?;
        let size = data.size() as usize;
        if shm.size() < size {
            return fail("zeMemOpenIpcHandle", ZeResult::InvalidSize);
        }
        let raw = self.next_raw();
        let mut state = self.state();
        let context = Self::check_context(&state, context, "zeMemOpenIpcHandle")?;
        let alloc = Arc::new(Allocation {
            id: raw.get(),
            kind: MemoryKind::Device,
            size,
            device: Some(device),
            backing: Mutex::new(Backing::Shared(shm)),
        });
        state.allocations.insert(
            raw.get(),
            AllocationEntry {
                alloc,
                context,
                imported: true,
            },
        );
        tracing::debug!(id = raw.get(), size, ?flags, "opened IPC memory");
        Ok(MemoryHandle::from_raw(raw))
    }

    /// Unmap an imported allocation.
    pub fn mem_close_ipc_handle(&self, context: ContextHandle, mem: MemoryHandle) -> Result<()> {
        let raw = mem.raw()?;
        let mut state = self.state();
        let context = Self::check_context(&state, context, "zeMemCloseIpcHandle")?;
        match state.allocations.get(&raw) {
            Some(entry) if entry.context == context && entry.imported => {}
            _ => return fail("zeMemCloseIpcHandle", ZeResult::InvalidArgument),
        }
        state.allocations.remove(&raw);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::driver;
    use super::*;

    #[test]
    fn test_host_read_write() {
        let driver = driver();
        let ctx = driver.create_context().unwrap();
        let mem = driver.allocate_host(ctx, 64, 8).unwrap();
        driver.host_write(mem, 4, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 5];
        driver.host_read(mem, 3, &mut out).unwrap();
        assert_eq!(out, [0, 1, 2, 3, 0]);
        assert!(driver.host_read(mem, 62, &mut out).is_err());
        driver.free_memory(ctx, mem).unwrap();
        assert!(driver.free_memory(ctx, mem).is_err());
    }

    #[test]
    fn test_device_memory_is_not_host_accessible() {
        let driver = driver();
        let ctx = driver.create_context().unwrap();
        let dev = driver.devices()[0];
        let mem = driver.allocate_device(ctx, dev, 16, 0).unwrap();
        let err = driver.host_write(mem, 0, &[1]).unwrap_err();
        assert!(matches!(
            err,
            Error::Driver {
                result: ZeResult::InvalidArgument,
                ..
            }
        ));
        assert_eq!(driver.memory_properties(mem).unwrap().device, Some(dev));
    }

    #[test]
    fn test_bad_sizes_and_alignment() {
        let driver = driver();
        let ctx = driver.create_context().unwrap();
        assert!(driver.allocate_host(ctx, 0, 0).is_err());
        assert!(driver.allocate_host(ctx, 16, 3).is_err());
        assert!(driver.allocate_host(ContextHandle::invalid(), 16, 0).is_err());
    }

    #[test]
    fn test_shared_system_needs_capability() {
        let driver = driver();
        let ctx = driver.create_context().unwrap();
        let err = driver.allocate_shared_system(ctx, 16, 0).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_ipc_get_put_counting() {
        let driver = driver();
        let ctx = driver.create_context().unwrap();
        let mem = driver.allocate_shared(ctx, None, 256, 0).unwrap();
        driver.host_write(mem, 0, &[0xAB; 4]).unwrap();

        let h1 = driver.mem_get_ipc_handle(ctx, mem).unwrap();
        let h2 = driver.mem_get_ipc_handle(ctx, mem).unwrap();
        assert_eq!(h1.data().name().unwrap(), h2.data().name().unwrap());
        driver.mem_put_ipc_handle(ctx, h1).unwrap();
        driver.mem_put_ipc_handle(ctx, h2).unwrap();
        assert!(driver.mem_put_ipc_handle(ctx, h2).is_err());

        // The allocation survives every put and keeps its contents.
        let mut out = [0u8; 4];
        driver.host_read(mem, 0, &mut out).unwrap();
        assert_eq!(out, [0xAB; 4]);

        let h3 = driver.mem_get_ipc_handle(ctx, mem).unwrap();
        driver.mem_put_ipc_handle(ctx, h3).unwrap();
        driver.free_memory(ctx, mem).unwrap();
    }

    #[test]
    fn test_open_sees_exporter_writes() {
        let driver = driver();
        let ctx = driver.create_context().unwrap();
        let mem = driver.allocate_host(ctx, 32, 0).unwrap();
        driver.host_write(mem, 0, b"before").unwrap();
        let handle = driver.mem_get_ipc_handle(ctx, mem).unwrap();

        let importer = super::super::tests::driver();
        let ictx = importer.create_context().unwrap();
        let dev = importer.devices()[0];
        let imported = importer
            .mem_open_ipc_handle(ictx, dev, handle, IpcMemoryFlags::empty())
            .unwrap();
        assert!(importer.memory_properties(imported).unwrap().imported);
        assert!(importer.free_memory(ictx, imported).is_err());

        driver.host_write(mem, 0, b"after!").unwrap();
        let alloc = Driver::allocation(&importer.state(), imported, "test").unwrap();
        let mut out = [0u8; 6];
        assert!(alloc.read(0, &mut out));
        assert_eq!(&out, b"after!");

        importer.mem_close_ipc_handle(ictx, imported).unwrap();
        driver.mem_put_ipc_handle(ctx, handle).unwrap();
        driver.free_memory(ctx, mem).unwrap();
    }

    #[test]
    fn test_exports_of_two_drivers_stay_apart() {
        let a = driver();
        let b = driver();
        let (actx, bctx) = (a.create_context().unwrap(), b.create_context().unwrap());
        let amem = a.allocate_host(actx, 16, 0).unwrap();
        let bmem = b.allocate_host(bctx, 16, 0).unwrap();
        a.host_write(amem, 0, &[1; 16]).unwrap();
        b.host_write(bmem, 0, &[7; 16]).unwrap();
        let ah = a.mem_get_ipc_handle(actx, amem).unwrap();
        let bh = b.mem_get_ipc_handle(bctx, bmem).unwrap();
        assert_ne!(ah.data().name().unwrap(), bh.data().name().unwrap());

        let importer = super::super::tests::driver();
        let ictx = importer.create_context().unwrap();
        let dev = importer.devices()[0];
        let imported = importer
            .mem_open_ipc_handle(ictx, dev, ah, IpcMemoryFlags::empty())
            .unwrap();
        let alloc = Driver::allocation(&importer.state(), imported, "test").unwrap();
        let mut out = [0u8; 16];
        assert!(alloc.read(0, &mut out));
        assert_eq!(out, [1; 16]);
        drop(alloc);

        // Freeing the other driver's export leaves this one mapped.
        b.mem_put_ipc_handle(bctx, bh).unwrap();
        b.free_memory(bctx, bmem).unwrap();
        importer.mem_close_ipc_handle(ictx, imported).unwrap();
        let reopened = importer
            .mem_open_ipc_handle(ictx, dev, ah, IpcMemoryFlags::empty())
            .unwrap();
        importer.mem_close_ipc_handle(ictx, reopened).unwrap();

        a.mem_put_ipc_handle(actx, ah).unwrap();
        a.free_memory(actx, amem).unwrap();
    }
}
