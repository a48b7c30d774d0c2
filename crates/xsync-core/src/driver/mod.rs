//! Reference accelerator driver
//!
//! A CPU-backed implementation of the driver service the harness drives: device and context
//! enumeration, memory, command lists and queues, fences, event pools, kernel timestamps and
//! IPC export/import. Exportable objects live in POSIX shared memory so that a second process
//! running its own `Driver` can open them.
//!
//! Each command queue and each immediate command list owns one worker thread that executes
//! submitted batches in order. The driver itself is `Send + Sync`.

mod command;
mod device;
mod event;
mod ipc;
mod memory;
mod queue;

pub use command::{CommandListDesc, CommandListFlags, Kernel};
pub use device::{
    DeviceClock, DeviceProperties, DriverConfig, QueueGroupFlags, QueueGroupProperties,
};
pub use event::{EventDesc, EventPoolDesc, EventPoolFlags, EventScope, EventStatus};
pub use ipc::{
    IpcEventPoolHandle, IpcHandle, IpcHandleData, IpcHandleKind, IpcMemHandle, IPC_HANDLE_SIZE,
};
pub use memory::{IpcMemoryFlags, MemoryKind, MemoryProperties};
pub use queue::{
    CommandQueueDesc, CommandQueueFlags, CommandQueueMode, CommandQueuePriority, FenceStatus,
};

use crate::handle::{ContextHandle, DeviceHandle};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Driver result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeResult {
    NotReady,
    Uninitialized,
    InvalidArgument,
    InvalidNullHandle,
    InvalidSize,
    InvalidSynchronizationObject,
    HandleObjectInUse,
    UnsupportedFeature,
    OutOfDeviceMemory,
}

impl fmt::Display for ZeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ZeResult::NotReady => "ZE_RESULT_NOT_READY",
            ZeResult::Uninitialized => "ZE_RESULT_ERROR_UNINITIALIZED",
            ZeResult::InvalidArgument => "ZE_RESULT_ERROR_INVALID_ARGUMENT",
            ZeResult::InvalidNullHandle => "ZE_RESULT_ERROR_INVALID_NULL_HANDLE",
            ZeResult::InvalidSize => "ZE_RESULT_ERROR_INVALID_SIZE",
            ZeResult::InvalidSynchronizationObject => {
                "ZE_RESULT_ERROR_INVALID_SYNCHRONIZATION_OBJECT"
            }
            ZeResult::HandleObjectInUse => "ZE_RESULT_ERROR_HANDLE_OBJECT_IN_USE",
            ZeResult::UnsupportedFeature => "ZE_RESULT_ERROR_UNSUPPORTED_FEATURE",
            ZeResult::OutOfDeviceMemory => "ZE_RESULT_ERROR_OUT_OF_DEVICE_MEMORY",
        };
        f.write_str(name)
    }
}

pub(crate) fn fail<T>(call: &'static str, result: ZeResult) -> Result<T> {
    Err(Error::driver(call, result))
}

/// Handle to the reference driver. Cheap to clone; all clones share one driver instance.
#[derive(Clone)]
pub struct Driver {
    shared: Arc<Shared>,
}

struct Shared {
    config: DriverConfig,
    clock: DeviceClock,
    devices: Vec<device::DeviceRecord>,
    next_id: AtomicU64,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    contexts: HashSet<u64>,
    allocations: HashMap<u64, memory::AllocationEntry>,
    memory_exports: HashMap<u64, ipc::Export>,
    lists: HashMap<u64, command::ListEntry>,
    queues: HashMap<u64, queue::QueueEntry>,
    fences: HashMap<u64, queue::FenceEntry>,
    pools: HashMap<u64, event::PoolEntry>,
    events: HashMap<u64, event::EventEntry>,
}

impl Driver {
    /// Initialise a driver instance with the given topology and capabilities.
    pub fn init(config: DriverConfig) -> Result<Self> {
        config.validate()?;
        let clock = DeviceClock::new(
            config.timer_resolution,
            config.kernel_timestamp_valid_bits,
            config.timestamp_valid_bits,
        );
        let next_id = AtomicU64::new(0);
        let devices = device::build_topology(&config, || next_raw(&next_id));
        tracing::debug!(
            devices = config.devices,
            sub_devices = config.sub_devices,
            "reference driver initialised"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                clock,
                devices,
                next_id,
                state: Mutex::new(State::default()),
            }),
        })
    }

    /// Configuration this driver was initialised with.
    pub fn config(&self) -> &DriverConfig {
        &self.shared.config
    }

    /// Device clock shared by every device of this driver.
    pub fn clock(&self) -> &DeviceClock {
        &self.shared.clock
    }

    fn next_raw(&self) -> NonZeroU64 {
        next_raw(&self.shared.next_id)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ---- devices -------------------------------------------------------------------------

    /// Root devices, in enumeration order.
    pub fn devices(&self) -> Vec<DeviceHandle> {
        self.shared
            .devices
            .iter()
            .filter(|d| d.parent.is_none())
            .map(|d| d.handle)
            .collect()
    }

    /// Sub-devices of a root device; empty for devices without partitions.
    pub fn sub_devices(&self, device: DeviceHandle) -> Result<Vec<DeviceHandle>> {
        Ok(self.device_record(device, "zeDeviceGetSubDevices")?.subs.clone())
    }

    pub fn device_properties(&self, device: DeviceHandle) -> Result<DeviceProperties> {
        Ok(self
            .device_record(device, "zeDeviceGetProperties")?
            .properties
            .clone())
    }

    /// Host and device clocks sampled together: `(host_ns, device_ticks)`.
    pub fn device_global_timestamps(&self, device: DeviceHandle) -> Result<(u64, u64)> {
        self.device_record(device, "zeDeviceGetGlobalTimestamps")?;
        Ok(self.shared.clock.global_timestamps())
    }

    fn device_record(
        &self,
        device: DeviceHandle,
        call: &'static str,
    ) -> Result<&device::DeviceRecord> {
        let raw = device.raw()?;
        match self.shared.devices.iter().find(|d| d.raw == raw) {
            Some(record) => Ok(record),
            None => fail(call, ZeResult::InvalidArgument),
        }
    }

    /// Number of timestamp-producing partitions behind `device`.
    fn tiles(&self, device: DeviceHandle) -> u32 {
        self.device_record(device, "tiles")
            .map(|d| d.subs.len().max(1) as u32)
            .unwrap_or(1)
    }

    // ---- contexts ------------------------------------------------------------------------

    pub fn create_context(&self) -> Result<ContextHandle> {
        let raw = self.next_raw();
        self.state().contexts.insert(raw.get());
        Ok(ContextHandle::from_raw(raw))
    }

    pub fn destroy_context(&self, context: ContextHandle) -> Result<()> {
        let raw = context.raw()?;
        if !self.state().contexts.remove(&raw) {
            return fail("zeContextDestroy", ZeResult::InvalidArgument);
        }
        Ok(())
    }

    fn check_context(state: &State, context: ContextHandle, call: &'static str) -> Result<u64> {
        let raw = context.raw()?;
        if !state.contexts.contains(&raw) {
            return fail(call, ZeResult::InvalidArgument);
        }
        Ok(raw)
    }
}

fn next_raw(counter: &AtomicU64) -> NonZeroU64 {
    NonZeroU64::MIN.saturating_add(counter.fetch_add(1, Ordering::Relaxed))
}

/// Shared by every `Driver` in the process, so export names never repeat within it.
static NEXT_SEGMENT: AtomicU64 = AtomicU64::new(0);

/// Unique name for an exported segment of this process.
fn segment_name(kind: &str) -> String {
    let n = NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed);
    format!("/xs_{}_{}_{}", kind, std::process::id(), n)
}

/// Raw ids of live objects, for leak checks in tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LiveObjects {
    pub allocations: usize,
    pub command_lists: usize,
    pub command_queues: usize,
    pub fences: usize,
    pub event_pools: usize,
    pub events: usize,
}

impl Driver {
    /// Counts of live driver objects.
    pub fn live_objects(&self) -> LiveObjects {
        let state = self.state();
        LiveObjects {
            allocations: state.allocations.len(),
            command_lists: state.lists.len(),
            command_queues: state.queues.len(),
            fences: state.fences.len(),
            event_pools: state.pools.len(),
            events: state.events.len(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn driver() -> Driver {
        Driver::init(DriverConfig::default()).unwrap()
    }

    #[test]
    fn test_topology() {
        let driver = driver();
        let devices = driver.devices();
        assert_eq!(devices.len(), 2);
        let subs = driver.sub_devices(devices[0]).unwrap();
        assert_eq!(subs.len(), 2);
        assert!(driver.sub_devices(subs[0]).unwrap().is_empty());

        let props = driver.device_properties(subs[1]).unwrap();
        assert!(props.is_sub_device);
        assert_eq!(props.sub_device_id, Some(1));
    }

    #[test]
    fn test_invalid_device_handle() {
        let driver = driver();
        let err = driver.device_properties(DeviceHandle::invalid()).unwrap_err();
        assert!(matches!(err, Error::InvalidHandle("device")));
    }

    #[test]
    fn test_context_lifecycle() {
        let driver = driver();
        let ctx = driver.create_context().unwrap();
        driver.destroy_context(ctx).unwrap();
        let err = driver.destroy_context(ctx).unwrap_err();
        assert!(matches!(
            err,
            Error::Driver {
                result: ZeResult::InvalidArgument,
                ..
            }
        ));
    }
}
