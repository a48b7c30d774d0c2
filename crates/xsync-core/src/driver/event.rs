//! Event pools, events and kernel timestamp storage
//!
//! Every event occupies one fixed-size slot of its pool. IPC-capable pools keep their slots in
//! a named shared memory segment behind a small header, so that an importing process observes
//! signals and timestamps written by the exporter and vice versa.

use super::device::MAX_TILES;
use super::ipc::{Export, IpcEventPoolHandle, IpcHandle, IpcHandleData, IpcHandleKind};
use super::{fail, segment_name, Driver, State, ZeResult};
use crate::handle::{ContextHandle, DeviceHandle, EventHandle, EventPoolHandle};
use crate::shm::SharedMemory;
use crate::timestamp::{KernelTimestamp, SynchronizedTimestamp, TimestampData};
use crate::{Error, Result};
use bitflags::bitflags;
use std::collections::HashSet;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventPoolFlags: u32 {
        /// Events can be signaled and reset from the host.
        const HOST_VISIBLE = 1 << 0;
        /// The pool can be exported to another process.
        const IPC = 1 << 1;
        const KERNEL_TIMESTAMP = 1 << 2;
        /// Per-dispatch timestamps with host-synchronized counterparts.
        const KERNEL_MAPPED_TIMESTAMP = 1 << 3;
    }
}

bitflags! {
    /// Memory scope made coherent on signal or wait.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventScope: u32 {
        const SUBDEVICE = 1 << 0;
        const DEVICE = 1 << 1;
        const HOST = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPoolDesc {
    pub flags: EventPoolFlags,
    /// Number of event slots.
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDesc {
    /// Slot in the pool; unique among live events of the pool.
    pub index: u32,
    pub signal: EventScope,
    pub wait: EventScope,
}

impl EventDesc {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            signal: EventScope::HOST,
            wait: EventScope::HOST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    NotReady,
    Signaled,
}

const NOT_SIGNALED: u32 = 0;
const SIGNALED: u32 = 1;

/// One event slot. Timestamps are written before the state is released, so a reader that
/// observes `SIGNALED` with acquire ordering sees complete timestamps.
#[repr(C)]
#[derive(Default)]
pub(crate) struct EventSlot {
    state: AtomicU32,
    count: AtomicU32,
    /// Global start, global end, context start, context end; one row per tile.
    kernel: [[AtomicU64; 4]; MAX_TILES],
    synced: [[AtomicU64; 4]; MAX_TILES],
}

impl EventSlot {
    pub(crate) fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.state.store(NOT_SIGNALED, Ordering::Release);
    }

    pub(crate) fn signal(&self) {
        self.state.store(SIGNALED, Ordering::Release);
    }

    pub(crate) fn is_signaled(&self) -> bool {
        self.state.load(Ordering::Acquire) == SIGNALED
    }

    /// Record timestamps for one dispatch and signal.
    pub(crate) fn record(&self, kernel: &[KernelTimestamp], synced: &[SynchronizedTimestamp]) {
        let n = kernel.len().min(MAX_TILES);
        for i in 0..n {
            store(&self.kernel[i], &kernel[i].global, &kernel[i].context);
            if let Some(s) = synced.get(i) {
                store(&self.synced[i], &s.global, &s.context);
            }
        }
        self.count.store(n as u32, Ordering::Relaxed);
        self.signal();
    }

    fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    fn kernel(&self, i: usize) -> KernelTimestamp {
        let (global, context) = load(&self.kernel[i]);
        KernelTimestamp { global, context }
    }

    fn synced(&self, i: usize) -> SynchronizedTimestamp {
        let (global, context) = load(&self.synced[i]);
        SynchronizedTimestamp { global, context }
    }
}

fn store(row: &[AtomicU64; 4], global: &TimestampData, context: &TimestampData) {
    row[0].store(global.start, Ordering::Relaxed);
    row[1].store(global.end, Ordering::Relaxed);
    row[2].store(context.start, Ordering::Relaxed);
    row[3].store(context.end, Ordering::Relaxed);
}

fn load(row: &[AtomicU64; 4]) -> (TimestampData, TimestampData) {
    (
        TimestampData {
            start: row[0].load(Ordering::Relaxed),
            end: row[1].load(Ordering::Relaxed),
        },
        TimestampData {
            start: row[2].load(Ordering::Relaxed),
            end: row[3].load(Ordering::Relaxed),
        },
    )
}

/// Header of an exported pool segment
#[repr(C)]
struct PoolHeader {
    magic: AtomicU32,
    version: AtomicU32,
    capacity: AtomicU32,
    flags: AtomicU32,
}

const POOL_MAGIC: u32 = 0x5853_4550; // "XSEP"
const POOL_VERSION: u32 = 1;

enum PoolBacking {
    Heap(Box<[EventSlot]>),
    Shared(SharedMemory),
}

pub(crate) struct EventPoolStorage {
    flags: EventPoolFlags,
    capacity: u32,
    backing: PoolBacking,
}

impl EventPoolStorage {
    fn calc_size(capacity: u32) -> usize {
        std::mem::size_of::<PoolHeader>() + capacity as usize * std::mem::size_of::<EventSlot>()
    }

    fn heap(flags: EventPoolFlags, capacity: u32) -> Self {
        let slots = (0..capacity).map(|_| EventSlot::default()).collect();
        Self {
            flags,
            capacity,
            backing: PoolBacking::Heap(slots),
        }
    }

    fn create_shared(name: &str, flags: EventPoolFlags, capacity: u32) -> Result<Self> {
        let shm = SharedMemory::create(name, Self::calc_size(capacity))?;
        // A fresh segment is zero-filled, which is a valid unsignaled slot array.
        let header = unsafe { &*(shm.as_ptr() as *const PoolHeader) };
        header.capacity.store(capacity, Ordering::Relaxed);
        header.flags.store(flags.bits(), Ordering::Relaxed);
        header.version.store(POOL_VERSION, Ordering::Relaxed);
        header.magic.store(POOL_MAGIC, Ordering::Release);
        Ok(Self {
            flags,
            capacity,
            backing: PoolBacking::Shared(shm),
        })
    }

    fn open_shared(name: &str) -> Result<Self> {
        let shm = SharedMemory::open(name)?;
        if shm.size() < std::mem::size_of::<PoolHeader>() {
            return Err(Error::SharedMemory(format!("{} is too small for an event pool", name)));
        }
        let header = unsafe { &*(shm.as_ptr() as *const PoolHeader) };
        if header.magic.load(Ordering::Acquire) != POOL_MAGIC {
            return Err(Error::SharedMemory("invalid magic number".to_string()));
        }
        let version = header.version.load(Ordering::Relaxed);
        if version != POOL_VERSION {
            return Err(Error::SharedMemory(format!(
                "version mismatch: expected {}, got {}",
                POOL_VERSION, version
            )));
        }
        let capacity = header.capacity.load(Ordering::Relaxed);
        if shm.size() < Self::calc_size(capacity) {
            return Err(Error::SharedMemory(format!("{} is truncated", name)));
        }
        let flags = EventPoolFlags::from_bits_truncate(header.flags.load(Ordering::Relaxed));
        Ok(Self {
            flags,
            capacity,
            backing: PoolBacking::Shared(shm),
        })
    }

    pub(crate) fn flags(&self) -> EventPoolFlags {
        self.flags
    }

    /// Slot `index`; callers validate the index against the capacity at event creation.
    pub(crate) fn slot(&self, index: u32) -> &EventSlot {
        match &self.backing {
            PoolBacking::Heap(slots) => &slots[index as usize],
            PoolBacking::Shared(shm) => {
                debug_assert!(index < self.capacity);
                let offset = std::mem::size_of::<PoolHeader>()
                    + index as usize * std::mem::size_of::<EventSlot>();
                // Safety: the segment was sized by `calc_size(capacity)`, is page aligned and
                // the slot only holds atomics.
                unsafe { &*(shm.as_ptr().add(offset) as *const EventSlot) }
            }
        }
    }

    fn shm(&self) -> Option<&SharedMemory> {
        match &self.backing {
            PoolBacking::Shared(shm) => Some(shm),
            PoolBacking::Heap(_) => None,
        }
    }
}

pub(crate) struct PoolEntry {
    storage: Arc<EventPoolStorage>,
    context: u64,
    imported: bool,
    live: HashSet<u32>,
    export: Option<Export>,
}

pub(crate) struct EventEntry {
    pool: u64,
    index: u32,
    storage: Arc<EventPoolStorage>,
}

/// Resolved reference to an event slot, used by command execution.
#[derive(Clone)]
pub(crate) struct EventRef {
    pub(crate) event: u64,
    pub(crate) index: u32,
    pub(crate) storage: Arc<EventPoolStorage>,
}

impl EventRef {
    pub(crate) fn slot(&self) -> &EventSlot {
        self.storage.slot(self.index)
    }
}

/// Poll `ready` until it holds or `timeout_ns` elapses. `u64::MAX` waits forever.
pub(crate) fn poll_until(timeout_ns: u64, mut ready: impl FnMut() -> bool) -> bool {
    if ready() {
        return true;
    }
    if timeout_ns == 0 {
        return false;
    }
    let deadline = (timeout_ns != u64::MAX)
        .then(|| Instant::now().checked_add(Duration::from_nanos(timeout_ns)))
        .flatten();
    let mut spins = 0u32;
    loop {
        if ready() {
            return true;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return false;
            }
        }
        if spins < 64 {
            spins += 1;
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_micros(50));
        }
    }
}

impl Driver {
    /// Create an event pool visible to `devices` (every device when empty).
    pub fn create_event_pool(
        &self,
        context: ContextHandle,
        desc: &EventPoolDesc,
        devices: &[DeviceHandle],
    ) -> Result<EventPoolHandle> {
        const CALL: &str = "zeEventPoolCreate";
        if desc.count == 0 {
            return fail(CALL, ZeResult::InvalidSize);
        }
        let flags = desc.flags;
        let both = EventPoolFlags::KERNEL_TIMESTAMP | EventPoolFlags::KERNEL_MAPPED_TIMESTAMP;
        if flags.contains(both) {
            return fail(CALL, ZeResult::InvalidArgument);
        }
        if flags.contains(EventPoolFlags::KERNEL_MAPPED_TIMESTAMP)
            && !self.shared.config.mapped_timestamps
        {
            return fail(CALL, ZeResult::UnsupportedFeature);
        }
        for &device in devices {
            self.device_record(device, CALL)?;
        }

        let raw = self.next_raw();
        let storage = if flags.contains(EventPoolFlags::IPC) {
            EventPoolStorage::create_shared(&segment_name("p"), flags, desc.count)?
        } else {
            EventPoolStorage::heap(flags, desc.count)
        };

        let mut state = self.state();
        let context = Self::check_context(&state, context, CALL)?;
        state.pools.insert(
            raw.get(),
            PoolEntry {
                storage: Arc::new(storage),
                context,
                imported: false,
                live: HashSet::new(),
                export: None,
            },
        );
        tracing::trace!(pool = raw.get(), count = desc.count, ?flags, "event pool created");
        Ok(EventPoolHandle::from_raw(raw))
    }

    /// Destroy a local pool. All of its events must have been destroyed.
    pub fn destroy_event_pool(&self, pool: EventPoolHandle) -> Result<()> {
        let raw = pool.raw()?;
        let mut state = self.state();
        match state.pools.get(&raw) {
            None => fail("zeEventPoolDestroy", ZeResult::InvalidArgument),
            Some(entry) if entry.imported => fail("zeEventPoolDestroy", ZeResult::InvalidArgument),
            Some(entry) if !entry.live.is_empty() => {
                fail("zeEventPoolDestroy", ZeResult::HandleObjectInUse)
            }
            Some(_) => {
                state.pools.remove(&raw);
                Ok(())
            }
        }
    }

    pub fn create_event(&self, pool: EventPoolHandle, desc: &EventDesc) -> Result<EventHandle> {
        const CALL: &str = "zeEventCreate";
        let pool_raw = pool.raw()?;
        let raw = self.next_raw();
        let mut state = self.state();
        let entry = match state.pools.get_mut(&pool_raw) {
            Some(entry) => entry,
            None => return fail(CALL, ZeResult::InvalidArgument),
        };
        if desc.index >= entry.storage.capacity || entry.live.contains(&desc.index) {
            return fail(CALL, ZeResult::InvalidArgument);
        }
        entry.live.insert(desc.index);
        // An importer attaches to whatever state the exporter left in the slot.
        if !entry.imported {
            entry.storage.slot(desc.index).reset();
        }
        let storage = Arc::clone(&entry.storage);
        state.events.insert(
            raw.get(),
            EventEntry {
                pool: pool_raw,
                index: desc.index,
                storage,
            },
        );
        Ok(EventHandle::from_raw(raw))
    }

    pub fn destroy_event(&self, event: EventHandle) -> Result<()> {
        let raw = event.raw()?;
        let mut state = self.state();
        let entry = match state.events.remove(&raw) {
            Some(entry) => entry,
            None => return fail("zeEventDestroy", ZeResult::InvalidArgument),
        };
        if let Some(pool) = state.pools.get_mut(&entry.pool) {
            pool.live.remove(&entry.index);
        }
        Ok(())
    }

    pub(crate) fn event_ref(
        state: &State,
        event: EventHandle,
        call: &'static str,
    ) -> Result<EventRef> {
        let raw = event.raw()?;
        match state.events.get(&raw) {
            Some(entry) => Ok(EventRef {
                event: raw,
                index: entry.index,
                storage: Arc::clone(&entry.storage),
            }),
            None => fail(call, ZeResult::InvalidArgument),
        }
    }

    pub fn event_host_signal(&self, event: EventHandle) -> Result<()> {
        let ev = Self::event_ref(&self.state(), event, "zeEventHostSignal")?;
        if !ev.storage.flags().contains(EventPoolFlags::HOST_VISIBLE) {
            return fail("zeEventHostSignal", ZeResult::InvalidArgument);
        }
        ev.slot().signal();
        Ok(())
    }

    /// Block until `event` is signaled or `timeout_ns` passes (`NOT_READY`).
    pub fn event_host_synchronize(&self, event: EventHandle, timeout_ns: u64) -> Result<()> {
        let ev = Self::event_ref(&self.state(), event, "zeEventHostSynchronize")?;
        if poll_until(timeout_ns, || ev.slot().is_signaled()) {
            Ok(())
        } else {
            fail("zeEventHostSynchronize", ZeResult::NotReady)
        }
    }

    pub fn event_host_reset(&self, event: EventHandle) -> Result<()> {
        let ev = Self::event_ref(&self.state(), event, "zeEventHostReset")?;
        ev.slot().reset();
        Ok(())
    }

    pub fn event_query_status(&self, event: EventHandle) -> Result<EventStatus> {
        let ev = Self::event_ref(&self.state(), event, "zeEventQueryStatus")?;
        Ok(if ev.slot().is_signaled() {
            EventStatus::Signaled
        } else {
            EventStatus::NotReady
        })
    }

    /// Timestamp of the dispatch that signaled `event`.
    pub fn event_query_kernel_timestamp(&self, event: EventHandle) -> Result<KernelTimestamp> {
        const CALL: &str = "zeEventQueryKernelTimestamp";
        let ev = Self::event_ref(&self.state(), event, CALL)?;
        let timestamped =
            EventPoolFlags::KERNEL_TIMESTAMP | EventPoolFlags::KERNEL_MAPPED_TIMESTAMP;
        if !ev.storage.flags().intersects(timestamped) {
            return fail(CALL, ZeResult::InvalidArgument);
        }
        let slot = ev.slot();
        if !slot.is_signaled() {
            return fail(CALL, ZeResult::NotReady);
        }
        if slot.count() == 0 {
            return Ok(KernelTimestamp::default());
        }
        Ok(slot.kernel(0))
    }

    fn mapped_slot(
        &self,
        event: EventHandle,
        device: DeviceHandle,
        call: &'static str,
    ) -> Result<EventRef> {
        self.device_record(device, call)?;
        let ev = Self::event_ref(&self.state(), event, call)?;
        if !ev.storage.flags().contains(EventPoolFlags::KERNEL_MAPPED_TIMESTAMP) {
            return fail(call, ZeResult::InvalidArgument);
        }
        if !ev.slot().is_signaled() {
            return fail(call, ZeResult::NotReady);
        }
        Ok(ev)
    }

    /// Number of per-dispatch timestamps recorded for `event`.
    pub fn event_query_timestamp_count(
        &self,
        event: EventHandle,
        device: DeviceHandle,
    ) -> Result<u32> {
        let ev = self.mapped_slot(event, device, "zeEventQueryTimestampsExp")?;
        Ok(ev.slot().count())
    }

    /// Fill both slices (which must be the same length) and return the number written.
    pub fn event_query_mapped_timestamps(
        &self,
        event: EventHandle,
        device: DeviceHandle,
        kernel: &mut [KernelTimestamp],
        synced: &mut [SynchronizedTimestamp],
    ) -> Result<u32> {
        const CALL: &str = "zeEventQueryTimestampsExp";
        if kernel.len() != synced.len() {
            return fail(CALL, ZeResult::InvalidArgument);
        }
        let ev = self.mapped_slot(event, device, CALL)?;
        let slot = ev.slot();
        let n = (slot.count() as usize).min(kernel.len());
        for i in 0..n {
            kernel[i] = slot.kernel(i);
            synced[i] = slot.synced(i);
        }
        Ok(n as u32)
    }

    // ---- IPC -----------------------------------------------------------------------------

    pub fn event_pool_get_ipc_handle(&self, pool: EventPoolHandle) -> Result<IpcEventPoolHandle> {
        const CALL: &str = "zeEventPoolGetIpcHandle";
        let raw = pool.raw()?;
        let mut state = self.state();
        let entry = match state.pools.get_mut(&raw) {
            Some(entry) if !entry.imported => entry,
            _ => return fail(CALL, ZeResult::InvalidArgument),
        };
        let shm = match entry.storage.shm() {
            Some(shm) if entry.storage.flags().contains(EventPoolFlags::IPC) => shm,
            _ => return fail(CALL, ZeResult::InvalidArgument),
        };
        if entry.export.is_none() {
            entry.export = Some(Export {
                fd: shm.descriptor()?,
                gets: 0,
            });
        }
        let (fd, gets) = match entry.export.as_mut() {
            Some(export) => {
                export.gets += 1;
                (export.fd.as_raw_fd(), export.gets)
            }
            None => return fail(CALL, ZeResult::InvalidArgument),
        };
        let data = IpcHandleData::new(
            IpcHandleKind::EventPool,
            fd,
            raw,
            shm.size() as u64,
            shm.name(),
        )?;
        tracing::debug!(pool = raw, gets, "exported event pool");
        Ok(IpcEventPoolHandle::from_data_unchecked(data))
    }

    pub fn event_pool_put_ipc_handle(
        &self,
        context: ContextHandle,
        handle: IpcEventPoolHandle,
    ) -> Result<()> {
        const CALL: &str = "zeEventPoolPutIpcHandle";
        let mut state = self.state();
        let context = Self::check_context(&state, context, CALL)?;
        let data = handle.data();
        if data.pid() != std::process::id() {
            return fail(CALL, ZeResult::InvalidArgument);
        }
        let entry = match state.pools.get_mut(&data.object_id()) {
            Some(entry) if entry.context == context => entry,
            _ => return fail(CALL, ZeResult::InvalidArgument),
        };
        let remaining = match entry.export.as_mut() {
            Some(export) => {
                export.gets -= 1;
                export.gets
            }
            None => return fail(CALL, ZeResult::InvalidArgument),
        };
        if remaining == 0 {
            entry.export = None;
        }
        Ok(())
    }

    pub fn event_pool_open_ipc_handle(
        &self,
        context: ContextHandle,
        handle: IpcEventPoolHandle,
    ) -> Result<EventPoolHandle> {
        const CALL: &str = "zeEventPoolOpenIpcHandle";
        let storage = EventPoolStorage::open_shared(handle.data().name()?).map_err(|e| {
            tracing::warn!(error = %e, "cannot map exported event pool");
            Error::driver(CALL, ZeResult::InvalidArgument)
        })?;
        let raw = self.next_raw();
        let mut state = self.state();
        let context = Self::check_context(&state, context, CALL)?;
        state.pools.insert(
            raw.get(),
            PoolEntry {
                storage: Arc::new(storage),
                context,
                imported: true,
                live: HashSet::new(),
                export: None,
            },
        );
        Ok(EventPoolHandle::from_raw(raw))
    }

    /// Unmap an imported pool. Events created on it must be destroyed first.
    pub fn event_pool_close_ipc_handle(&self, pool: EventPoolHandle) -> Result<()> {
        const CALL: &str = "zeEventPoolCloseIpcHandle";
        let raw = pool.raw()?;
        let mut state = self.state();
        match state.pools.get(&raw) {
            Some(entry) if entry.imported && entry.live.is_empty() => {
                state.pools.remove(&raw);
                Ok(())
            }
            Some(entry) if entry.imported => fail(CALL, ZeResult::HandleObjectInUse),
            _ => fail(CALL, ZeResult::InvalidArgument),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::driver;
    use super::*;

    fn pool(driver: &Driver, flags: EventPoolFlags, count: u32) -> EventPoolHandle {
        let ctx = driver.create_context().unwrap();
        driver
            .create_event_pool(ctx, &EventPoolDesc { flags, count }, &[])
            .unwrap()
    }

    #[test]
    fn test_status_round_trip() {
        let driver = driver();
        let pool = pool(&driver, EventPoolFlags::HOST_VISIBLE, 4);
        let ev = driver.create_event(pool, &EventDesc::new(0)).unwrap();

        assert_eq!(driver.event_query_status(ev).unwrap(), EventStatus::NotReady);
        driver.event_host_signal(ev).unwrap();
        assert_eq!(driver.event_query_status(ev).unwrap(), EventStatus::Signaled);
        driver.event_host_reset(ev).unwrap();
        assert_eq!(driver.event_query_status(ev).unwrap(), EventStatus::NotReady);

        assert!(driver.event_host_synchronize(ev, 0).unwrap_err().is_not_ready());
        driver.event_host_signal(ev).unwrap();
        driver.event_host_synchronize(ev, u64::MAX).unwrap();
    }

    #[test]
    fn test_index_rules() {
        let driver = driver();
        let pool = pool(&driver, EventPoolFlags::HOST_VISIBLE, 2);
        let ev = driver.create_event(pool, &EventDesc::new(1)).unwrap();
        assert!(driver.create_event(pool, &EventDesc::new(1)).is_err());
        assert!(driver.create_event(pool, &EventDesc::new(2)).is_err());

        let err = driver.destroy_event_pool(pool).unwrap_err();
        assert!(matches!(
            err,
            Error::Driver {
                result: ZeResult::HandleObjectInUse,
                ..
            }
        ));
        driver.destroy_event(ev).unwrap();
        let again = driver.create_event(pool, &EventDesc::new(1)).unwrap();
        driver.destroy_event(again).unwrap();
        driver.destroy_event_pool(pool).unwrap();
    }

    #[test]
    fn test_host_signal_needs_host_visible_pool() {
        let driver = driver();
        let pool = pool(&driver, EventPoolFlags::empty(), 1);
        let ev = driver.create_event(pool, &EventDesc::new(0)).unwrap();
        assert!(driver.event_host_signal(ev).is_err());
    }

    #[test]
    fn test_timestamp_flags() {
        let driver = driver();
        let ctx = driver.create_context().unwrap();
        let both = EventPoolDesc {
            flags: EventPoolFlags::KERNEL_TIMESTAMP | EventPoolFlags::KERNEL_MAPPED_TIMESTAMP,
            count: 1,
        };
        assert!(driver.create_event_pool(ctx, &both, &[]).is_err());

        let no_mapped = Driver::init(super::super::DriverConfig {
            mapped_timestamps: false,
            ..Default::default()
        })
        .unwrap();
        let ctx = no_mapped.create_context().unwrap();
        let desc = EventPoolDesc {
            flags: EventPoolFlags::KERNEL_MAPPED_TIMESTAMP,
            count: 1,
        };
        assert!(no_mapped.create_event_pool(ctx, &desc, &[]).unwrap_err().is_unsupported());
    }

    #[test]
    fn test_unsignaled_timestamp_is_not_ready() {
        let driver = driver();
        let pool = pool(&driver, EventPoolFlags::KERNEL_TIMESTAMP, 1);
        let ev = driver.create_event(pool, &EventDesc::new(0)).unwrap();
        assert!(driver.event_query_kernel_timestamp(ev).unwrap_err().is_not_ready());
    }

    #[test]
    fn test_slot_records_timestamps() {
        let driver = driver();
        let dev = driver.devices()[0];
        let pool = pool(&driver, EventPoolFlags::KERNEL_MAPPED_TIMESTAMP, 1);
        let ev = driver.create_event(pool, &EventDesc::new(0)).unwrap();
        let ts = KernelTimestamp {
            global: TimestampData { start: 5, end: 9 },
            context: TimestampData { start: 6, end: 8 },
        };
        let r = Driver::event_ref(&driver.state(), ev, "test").unwrap();
        r.slot().record(&[ts, ts], &[SynchronizedTimestamp::default(); 2]);

        assert_eq!(driver.event_query_kernel_timestamp(ev).unwrap(), ts);
        assert_eq!(driver.event_query_timestamp_count(ev, dev).unwrap(), 2);
        let mut k = [KernelTimestamp::default(); 2];
        let mut s = [SynchronizedTimestamp::default(); 1];
        assert!(driver.event_query_mapped_timestamps(ev, dev, &mut k, &mut s).is_err());
    }

    #[test]
    fn test_ipc_pool_shares_signals() {
        let exporter = driver();
        let ctx = exporter.create_context().unwrap();
        let desc = EventPoolDesc {
            flags: EventPoolFlags::HOST_VISIBLE | EventPoolFlags::IPC,
            count: 4,
        };
        let pool = exporter.create_event_pool(ctx, &desc, &[]).unwrap();
        let ev = exporter.create_event(pool, &EventDesc::new(2)).unwrap();
        let handle = exporter.event_pool_get_ipc_handle(pool).unwrap();

        let importer = driver();
        let ictx = importer.create_context().unwrap();
        let remote_pool = importer.event_pool_open_ipc_handle(ictx, handle).unwrap();
        let remote = importer.create_event(remote_pool, &EventDesc::new(2)).unwrap();

        exporter.event_host_signal(ev).unwrap();
        importer.event_host_synchronize(remote, 1_000_000_000).unwrap();

        assert!(importer.event_pool_close_ipc_handle(remote_pool).is_err());
        importer.destroy_event(remote).unwrap();
        importer.event_pool_close_ipc_handle(remote_pool).unwrap();

        exporter.event_pool_put_ipc_handle(ctx, handle).unwrap();
        assert!(exporter.event_pool_put_ipc_handle(ctx, handle).is_err());
        exporter.destroy_event(ev).unwrap();
        exporter.destroy_event_pool(pool).unwrap();
    }

    #[test]
    fn test_ipc_put_from_other_context_is_rejected() {
        let driver = driver();
        let ctx = driver.create_context().unwrap();
        let other = driver.create_context().unwrap();
        let desc = EventPoolDesc {
            flags: EventPoolFlags::HOST_VISIBLE | EventPoolFlags::IPC,
            count: 2,
        };
        let pool = driver.create_event_pool(ctx, &desc, &[]).unwrap();
        let handle = driver.event_pool_get_ipc_handle(pool).unwrap();

        let err = driver.event_pool_put_ipc_handle(other, handle).unwrap_err();
        assert!(matches!(
            err,
            Error::Driver {
                result: ZeResult::InvalidArgument,
                ..
            }
        ));
        driver.event_pool_put_ipc_handle(ctx, handle).unwrap();
        driver.destroy_event_pool(pool).unwrap();
    }

    #[test]
    fn test_poll_until_times_out() {
        let start = Instant::now();
        assert!(!poll_until(2_000_000, || false));
        assert!(start.elapsed() >= Duration::from_millis(2));
        assert!(poll_until(0, || true));
    }
}
