//! Canned producer/consumer exchanges
//!
//! Each producer runner performs its half of the device work, hands an IPC handle to the
//! helper executable and only releases the handle once the helper has exited cleanly. The
//! helper runs [`run_consumer`], which dispatches on the test case in the record.

use super::exchange::{ConsumerReport, Exchange, ExchangePeer};
use super::record::{ExchangeRequest, TestCase, Transport};
use crate::bundle::{BundleDesc, CommandBundle};
use crate::config::HarnessConfig;
use crate::driver::{
    EventDesc, EventPoolFlags, IpcEventPoolHandle, IpcHandle, IpcMemHandle, IpcMemoryFlags, Kernel,
};
use crate::event::{host_synchronize, EventPool};
use crate::handle::{DeviceHandle, EventHandle, EventPoolHandle, MemoryHandle};
use crate::harness::Harness;
use crate::memory::{Buffer, ImportedBuffer};
use crate::timestamp::{get_kernel_timestamp, KernelTimestamp};
use crate::{Error, Result};
use std::path::Path;
use std::time::Duration;

/// Bound on every blocking wait inside the consumer.
pub const CONSUMER_TIMEOUT: Duration = Duration::from_secs(30);

/// Slots in exported event pools.
pub const IPC_POOL_SIZE: u32 = 10;

/// Slot both processes use for the shared event.
pub const DEFAULT_EVENT_INDEX: u32 = 5;

const KERNEL_DURATION: Duration = Duration::from_millis(1);

fn consumer_timeout_ns() -> u64 {
    CONSUMER_TIMEOUT.as_nanos() as u64
}

/// Parameters of a memory exchange.
#[derive(Debug, Clone, Copy)]
pub struct MemoryScenario {
    pub test_case: TestCase,
    pub transport: Transport,
    pub size: usize,
    pub flags: IpcMemoryFlags,
    pub immediate: bool,
    pub pattern: u8,
}

impl MemoryScenario {
    pub fn new(test_case: TestCase) -> Self {
        Self {
            test_case,
            transport: Transport::Socket,
            size: 4096,
            flags: IpcMemoryFlags::BIAS_CACHED,
            immediate: false,
            pattern: 1,
        }
    }
}

/// Who signals the shared event in an event exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    Host,
    Device,
}

/// Parameters of an event exchange.
#[derive(Debug, Clone, Copy)]
pub struct EventScenario {
    pub test_case: TestCase,
    pub transport: Transport,
    pub signal: SignalSource,
    pub immediate: bool,
    pub event_index: u32,
}

impl EventScenario {
    pub fn new(test_case: TestCase, signal: SignalSource) -> Self {
        Self {
            test_case,
            transport: Transport::Socket,
            signal,
            immediate: false,
            event_index: DEFAULT_EVENT_INDEX,
        }
    }
}

/// Result of a timestamp exchange.
#[derive(Debug)]
pub struct TimestampOutcome {
    pub report: ConsumerReport,
    /// Timestamp the consumer read through its own mapping of the pool.
    pub timestamp: KernelTimestamp,
}

fn run_bundle(
    harness: &Harness,
    device: DeviceHandle,
    immediate: bool,
    timeout_ns: u64,
    record: impl FnOnce(&mut CommandBundle) -> Result<()>,
) -> Result<()> {
    let mut bundle = CommandBundle::create(
        harness.driver(),
        harness.context(),
        device,
        &BundleDesc::new(immediate),
    )?;
    record(&mut bundle)?;
    bundle.close()?;
    bundle.execute_and_synchronize(timeout_ns)?;
    bundle.destroy()
}

fn copy_to_host(
    harness: &Harness,
    device: DeviceHandle,
    immediate: bool,
    src: MemoryHandle,
    host: &Buffer,
) -> Result<()> {
    host.write(0, &vec![0u8; host.size()])?;
    run_bundle(harness, device, immediate, u64::MAX, |b| {
        b.append_memory_copy(host.handle(), src, host.size(), None, &[])
    })
}

// ---- producers -------------------------------------------------------------------------

/// Export device memory holding the data pattern and have the consumer validate it.
pub fn run_memory_producer(
    harness: &Harness,
    helper: &Path,
    scenario: &MemoryScenario,
) -> Result<ConsumerReport> {
    if !scenario.test_case.is_memory() {
        return Err(Error::Config(format!("{:?} is not a memory exchange", scenario.test_case)));
    }
    let (driver, context, device) = (harness.driver(), harness.context(), harness.device());
    let size = scenario.size;

    let source = Buffer::host(driver, context, size)?;
    source.write_pattern(scenario.pattern)?;
    let memory = Buffer::device(driver, context, device, size)?;
    run_bundle(harness, device, scenario.immediate, u64::MAX, |b| {
        b.append_memory_copy(memory.handle(), source.handle(), size, None, &[])
    })?;

    let handle = memory.ipc_handle()?;
    let extra = match scenario.test_case {
        TestCase::MemoryPutHandle => Some(memory.ipc_handle()?),
        _ => None,
    };

    let request = ExchangeRequest {
        size: size as u64,
        flags: scenario.flags.bits(),
        is_immediate: scenario.immediate,
        pattern: scenario.pattern,
        ..ExchangeRequest::new(scenario.test_case, scenario.transport)
    };
    let exchange = Exchange::create(&Exchange::unique_name("xsync_mem"), &request)?;
    let consumer = exchange.launch(helper, handle.data())?;
    let report = consumer.wait()?;

    memory.put_ipc_handle(handle)?;
    if let Some(extra) = extra {
        memory.put_ipc_handle(extra)?;
        // Puts release exports, never the allocation.
        let check = Buffer::host(driver, context, size)?;
        copy_to_host(harness, device, scenario.immediate, memory.handle(), &check)?;
        check.validate_pattern(scenario.pattern)?;
    }
    tracing::info!(
        test_case = ?scenario.test_case,
        transport = ?scenario.transport,
        size,
        "memory exchange passed"
    );
    Ok(report)
}

/// Share an event through an exported pool and signal it after the consumer has the pool.
pub fn run_event_producer(
    harness: &Harness,
    helper: &Path,
    scenario: &EventScenario,
) -> Result<ConsumerReport> {
    if !scenario.test_case.is_event_read() {
        return Err(Error::Config(format!("{:?} is not an event exchange", scenario.test_case)));
    }
    let driver = harness.driver();
    if scenario.test_case.needs_multiple_devices() && driver.devices().len() < 2 {
        return Err(Error::Unsupported(format!(
            "{:?} needs at least two devices",
            scenario.test_case
        )));
    }
    let flags = EventPoolFlags::HOST_VISIBLE | EventPoolFlags::IPC;
    let mut pool = EventPool::create(driver, harness.context(), IPC_POOL_SIZE, flags, &[])?;
    let ipc = pool.ipc_handle()?;
    let event = pool.create_event_with_desc(&EventDesc::new(scenario.event_index))?;

    let request = ExchangeRequest {
        flags: flags.bits(),
        is_immediate: scenario.immediate,
        event_index: scenario.event_index,
        ..ExchangeRequest::new(scenario.test_case, scenario.transport)
    };
    let exchange = Exchange::create(&Exchange::unique_name("xsync_evt"), &request)?;
    let consumer = exchange.launch(helper, ipc.data())?;

    match scenario.signal {
        SignalSource::Host => driver.event_host_signal(event)?,
        SignalSource::Device => {
            run_bundle(harness, harness.device(), scenario.immediate, u64::MAX, |b| {
                b.append_signal_event(event)
            })?
        }
    }
    let report = consumer.wait()?;

    pool.put_ipc_handle(ipc)?;
    pool.destroy_event(event)?;
    tracing::info!(
        test_case = ?scenario.test_case,
        signal = ?scenario.signal,
        "event exchange passed"
    );
    Ok(report)
}

/// Run a kernel that signals a timestamp event, tell the consumer it finished, and check
/// that the consumer read the same timestamp through its mapping of the pool.
pub fn run_timestamp_producer(
    harness: &Harness,
    helper: &Path,
    transport: Transport,
    immediate: bool,
) -> Result<TimestampOutcome> {
    let driver = harness.driver();
    let flags =
        EventPoolFlags::HOST_VISIBLE | EventPoolFlags::IPC | EventPoolFlags::KERNEL_TIMESTAMP;
    let mut pool = EventPool::create(driver, harness.context(), IPC_POOL_SIZE, flags, &[])?;
    let ipc = pool.ipc_handle()?;
    let event = pool.create_event_with_desc(&EventDesc::new(DEFAULT_EVENT_INDEX))?;

    let request = ExchangeRequest {
        flags: flags.bits(),
        is_immediate: immediate,
        event_index: DEFAULT_EVENT_INDEX,
        ..ExchangeRequest::new(TestCase::EventTimestamp, transport)
    };
    let exchange = Exchange::create(&Exchange::unique_name("xsync_ts"), &request)?;
    let consumer = exchange.launch(helper, ipc.data())?;

    let kernel = Kernel::Spin {
        duration: KERNEL_DURATION,
    };
    run_bundle(harness, harness.device(), immediate, u64::MAX, |b| {
        b.append_launch_kernel(&kernel, Some(event), &[])
    })?;
    let local = get_kernel_timestamp(driver, event)?;
    exchange.semaphore().post();

    let report = consumer.wait()?;
    let timestamp = exchange
        .record()
        .reply()
        .ok_or_else(|| Error::Protocol("consumer wrote no timestamp".into()))?;
    if timestamp != local {
        return Err(Error::Protocol(format!(
            "consumer read {:?}, producer recorded {:?}",
            timestamp, local
        )));
    }

    pool.put_ipc_handle(ipc)?;
    pool.destroy_event(event)?;
    tracing::info!(?timestamp, "timestamp exchange passed");
    Ok(TimestampOutcome { report, timestamp })
}

// ---- consumer --------------------------------------------------------------------------

/// Consumer entry point: join the exchange named in the environment and run its test case.
pub fn run_consumer(config: HarnessConfig) -> Result<()> {
    let peer = ExchangePeer::from_env()?;
    let harness = Harness::init(config)?;
    let request = peer.request()?;
    tracing::info!(exchange = peer.name(), test_case = ?request.test_case, "consumer started");

    match request.test_case {
        TestCase::MemoryDeviceAccess
        | TestCase::MemorySubDeviceAccess
        | TestCase::MemoryPutHandle => consume_memory(&harness, &peer, &request),
        TestCase::EventHostReads
        | TestCase::EventDeviceReads
        | TestCase::EventSecondDeviceReads
        | TestCase::EventMultiDeviceReads
        | TestCase::EventTimestamp => consume_event(&harness, &peer, &request),
    }
}

fn consume_memory(harness: &Harness, peer: &ExchangePeer, request: &ExchangeRequest) -> Result<()> {
    let (driver, context) = (harness.driver(), harness.context());
    let received = peer.receive_handle()?;
    let ipc = IpcMemHandle::from_data(received.data())?;
    let flags = IpcMemoryFlags::from_bits_truncate(request.flags);
    let size = request.size as usize;

    // Always opened on the root device, then used from each target device.
    let imported = ImportedBuffer::open(driver, context, harness.device(), ipc, flags)?;
    if imported.size() < size {
        return Err(Error::Protocol(format!(
            "imported {} bytes, expected {}",
            imported.size(),
            size
        )));
    }
    let targets = match request.test_case {
        TestCase::MemorySubDeviceAccess => harness.sub_devices()?,
        _ => vec![harness.device()],
    };
    if targets.is_empty() {
        tracing::info!("device has no sub-devices, nothing to validate");
    }

    let host = Buffer::host(driver, context, size)?;
    for device in targets {
        copy_to_host(harness, device, request.is_immediate, imported.handle(), &host)?;
        host.validate_pattern(request.pattern)?;
        tracing::debug!(%device, "validated buffer received correctly");
    }
    imported.close()
}

fn consume_event(harness: &Harness, peer: &ExchangePeer, request: &ExchangeRequest) -> Result<()> {
    let driver = harness.driver();
    let received = peer.receive_handle()?;
    let ipc = IpcEventPoolHandle::from_data(received.data())?;
    let pool = driver.event_pool_open_ipc_handle(harness.context(), ipc)?;

    let result = consume_pool_event(harness, peer, request, pool);
    let closed = driver.event_pool_close_ipc_handle(pool);
    result.and(closed)
}

fn consume_pool_event(
    harness: &Harness,
    peer: &ExchangePeer,
    request: &ExchangeRequest,
    pool: EventPoolHandle,
) -> Result<()> {
    let driver = harness.driver();
    let event = driver.create_event(pool, &EventDesc::new(request.event_index))?;
    let result = wait_on_shared_event(harness, peer, request, event);
    let destroyed = driver.destroy_event(event);
    result.and(destroyed)
}

fn wait_on_shared_event(
    harness: &Harness,
    peer: &ExchangePeer,
    request: &ExchangeRequest,
    event: EventHandle,
) -> Result<()> {
    let driver = harness.driver();
    let device_waits = |device: DeviceHandle| {
        run_bundle(
            harness,
            device,
            request.is_immediate,
            consumer_timeout_ns(),
            |b| b.append_wait_on_events(&[event]),
        )
    };
    match request.test_case {
        TestCase::EventHostReads => host_synchronize(driver, event, consumer_timeout_ns()),
        TestCase::EventDeviceReads => device_waits(harness.device()),
        TestCase::EventSecondDeviceReads => match driver.devices().get(1) {
            Some(&second) => device_waits(second),
            None => Err(Error::Unsupported("no second device".into())),
        },
        TestCase::EventMultiDeviceReads => {
            for device in driver.devices() {
                device_waits(device)?;
                tracing::debug!(%device, "device observed the shared event");
            }
            Ok(())
        }
        TestCase::EventTimestamp => {
            if !peer.semaphore().wait_timeout(CONSUMER_TIMEOUT) {
                return Err(Error::Protocol("producer never reported the kernel finished".into()));
            }
            let timestamp = get_kernel_timestamp(driver, event)?;
            tracing::debug!(?timestamp, "read kernel timestamp");
            peer.record().write_reply(&timestamp)
        }
        other => Err(Error::Protocol(format!("{:?} is not an event exchange", other))),
    }
}
