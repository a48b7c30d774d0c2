//! Kernel timestamps and tick/wall-time conversion
//!
//! Device timestamps are raw counter values that are only `valid_bits` wide, so a counter that
//! rolls over between start and end yields `end < start`. Durations account for one rollover.

use crate::driver::{DeviceProperties, Driver};
use crate::handle::{DeviceHandle, EventHandle};
use crate::{Error, Result};

/// Device timer resolution as reported by device properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerResolution {
    /// Nanoseconds per tick (v1.0 property layout).
    NanosPerTick(u64),
    /// Ticks per second (v1.2 property layout).
    TicksPerSecond(u64),
}

impl TimerResolution {
    /// Length of one tick in nanoseconds.
    pub fn tick_period_ns(&self) -> f64 {
        match *self {
            TimerResolution::NanosPerTick(ns) => ns as f64,
            TimerResolution::TicksPerSecond(0) => 0.0,
            TimerResolution::TicksPerSecond(hz) => 1_000_000_000.0 / hz as f64,
        }
    }

    /// Tick count elapsed after `ns` nanoseconds, unmasked.
    pub fn ns_to_ticks(&self, ns: u64) -> u64 {
        match *self {
            TimerResolution::NanosPerTick(0) | TimerResolution::TicksPerSecond(0) => 0,
            TimerResolution::NanosPerTick(per) => ns / per,
            TimerResolution::TicksPerSecond(hz) => {
                (ns as u128 * hz as u128 / 1_000_000_000) as u64
            }
        }
    }
}

/// Largest counter value representable in `valid_bits` bits.
pub fn valid_bits_mask(valid_bits: u32) -> u64 {
    if valid_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << valid_bits) - 1
    }
}

/// Start/end counter pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimestampData {
    pub start: u64,
    pub end: u64,
}

impl TimestampData {
    /// Elapsed ticks, allowing for one counter rollover.
    ///
    /// Bits above `valid_bits` are ignored.
    pub fn elapsed_ticks(&self, valid_bits: u32) -> u64 {
        let max = valid_bits_mask(valid_bits);
        let (start, end) = (self.start & max, self.end & max);
        if end >= start {
            end - start
        } else {
            (max - start).wrapping_add(end).wrapping_add(1)
        }
    }
}

/// Kernel timestamp in device ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelTimestamp {
    pub global: TimestampData,
    pub context: TimestampData,
}

/// Kernel timestamp converted to host-comparable nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SynchronizedTimestamp {
    pub global: TimestampData,
    pub context: TimestampData,
}

/// Duration in nanoseconds of a tick interval.
pub fn timestamp_time_ns(
    data: &TimestampData,
    resolution: TimerResolution,
    valid_bits: u32,
) -> f64 {
    data.elapsed_ticks(valid_bits) as f64 * resolution.tick_period_ns()
}

/// Duration of the global interval, in nanoseconds, on `device`'s clock.
pub fn get_timestamp_global_duration(
    driver: &Driver,
    device: DeviceHandle,
    timestamp: &KernelTimestamp,
) -> Result<f64> {
    let props = driver.device_properties(device)?;
    Ok(duration_ns(&timestamp.global, &props))
}

/// Duration of the context interval, in nanoseconds, on `device`'s clock.
pub fn get_timestamp_context_duration(
    driver: &Driver,
    device: DeviceHandle,
    timestamp: &KernelTimestamp,
) -> Result<f64> {
    let props = driver.device_properties(device)?;
    Ok(duration_ns(&timestamp.context, &props))
}

fn duration_ns(data: &TimestampData, props: &DeviceProperties) -> f64 {
    timestamp_time_ns(
        data,
        props.timer_resolution,
        props.kernel_timestamp_valid_bits,
    )
}

/// Kernel timestamp of a signaled event from a timestamp pool.
///
/// The event must have been synchronized first; an unsignaled event yields a not-ready error.
pub fn get_kernel_timestamp(driver: &Driver, event: EventHandle) -> Result<KernelTimestamp> {
    driver.event_query_kernel_timestamp(event)
}

/// Number of mapped timestamps recorded for `event` on `device`.
pub fn get_timestamp_count(
    driver: &Driver,
    event: EventHandle,
    device: DeviceHandle,
) -> Result<u32> {
    driver.event_query_timestamp_count(event, device)
}

/// Per-dispatch kernel timestamps and their host-synchronized counterparts.
///
/// Both vectors always have the same, non-zero length.
pub fn get_mapped_timestamps(
    driver: &Driver,
    event: EventHandle,
    device: DeviceHandle,
) -> Result<(Vec<KernelTimestamp>, Vec<SynchronizedTimestamp>)> {
    let count = get_timestamp_count(driver, event, device)?;
    if count == 0 {
        return Err(Error::Protocol(format!("{} recorded no mapped timestamps", event)));
    }
    let mut kernel = vec![KernelTimestamp::default(); count as usize];
    let mut synced = vec![SynchronizedTimestamp::default(); count as usize];
    let written = driver.event_query_mapped_timestamps(event, device, &mut kernel, &mut synced)?;
    kernel.truncate(written as usize);
    synced.truncate(written as usize);
    tracing::trace!(%event, count = written, "mapped timestamps");
    Ok((kernel, synced))
}
