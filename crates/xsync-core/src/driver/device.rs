//! Device topology, properties and the device clock

use crate::handle::DeviceHandle;
use crate::timestamp::{valid_bits_mask, TimerResolution};
use crate::{Error, Result};
use bitflags::bitflags;
use nix::time::{clock_gettime, ClockId};
use std::num::NonZeroU64;

/// Upper bound on partitions per device; also the per-event mapped timestamp capacity.
pub(crate) const MAX_TILES: usize = 8;

/// Reference driver topology and capabilities.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Root devices.
    pub devices: u32,
    /// Sub-devices per root device (0 for unpartitioned devices).
    pub sub_devices: u32,
    pub timer_resolution: TimerResolution,
    pub kernel_timestamp_valid_bits: u32,
    pub timestamp_valid_bits: u32,
    /// Queues in the compute group (ordinal 0).
    pub compute_queues: u32,
    /// Queues in the copy group (ordinal 1).
    pub copy_queues: u32,
    /// Device-mapped kernel timestamp pools.
    pub mapped_timestamps: bool,
    /// System allocations usable by the device.
    pub system_shared_allocations: bool,
    pub max_mem_alloc_size: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            devices: 2,
            sub_devices: 2,
            timer_resolution: TimerResolution::TicksPerSecond(19_200_000),
            kernel_timestamp_valid_bits: 32,
            timestamp_valid_bits: 36,
            compute_queues: 4,
            copy_queues: 2,
            mapped_timestamps: true,
            system_shared_allocations: false,
            max_mem_alloc_size: 1 << 30,
        }
    }
}

impl DriverConfig {
    /// Defaults overlaid with `XSYNC_REF_DEVICES` and `XSYNC_REF_SUB_DEVICES`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(devices) = env_u32("XSYNC_REF_DEVICES")? {
            config.devices = devices;
        }
        if let Some(subs) = env_u32("XSYNC_REF_SUB_DEVICES")? {
            config.sub_devices = subs;
        }
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.devices == 0 {
            return Err(Error::Config("at least one device is required".into()));
        }
        if self.sub_devices as usize > MAX_TILES {
            return Err(Error::Config(format!(
                "{} sub-devices exceeds the limit of {}",
                self.sub_devices, MAX_TILES
            )));
        }
        for bits in [self.kernel_timestamp_valid_bits, self.timestamp_valid_bits] {
            if bits == 0 || bits > 64 {
                return Err(Error::Config(format!("invalid timestamp width {}", bits)));
            }
        }
        if self.compute_queues == 0 {
            return Err(Error::Config("compute queue group cannot be empty".into()));
        }
        Ok(())
    }
}

fn env_u32(key: &str) -> Result<Option<u32>> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{}={:?} is not a number", key, v))),
        Err(_) => Ok(None),
    }
}

bitflags! {
    /// Engine capabilities of a command queue group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueGroupFlags: u32 {
        const COMPUTE = 1 << 0;
        const COPY = 1 << 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueGroupProperties {
    pub flags: QueueGroupFlags,
    pub num_queues: u32,
}

#[derive(Debug, Clone)]
pub struct DeviceProperties {
    pub name: String,
    pub is_sub_device: bool,
    pub sub_device_id: Option<u32>,
    pub timer_resolution: TimerResolution,
    pub kernel_timestamp_valid_bits: u32,
    pub timestamp_valid_bits: u32,
    /// Indexed by queue group ordinal.
    pub queue_groups: Vec<QueueGroupProperties>,
    pub max_mem_alloc_size: usize,
    pub mapped_timestamps: bool,
    pub system_shared_allocations: bool,
}

pub(crate) struct DeviceRecord {
    pub(crate) raw: u64,
    pub(crate) handle: DeviceHandle,
    pub(crate) parent: Option<DeviceHandle>,
    pub(crate) subs: Vec<DeviceHandle>,
    pub(crate) properties: DeviceProperties,
}

pub(crate) fn build_topology(
    config: &DriverConfig,
    mut next: impl FnMut() -> NonZeroU64,
) -> Vec<DeviceRecord> {
    let mut records = Vec::new();
    for d in 0..config.devices {
        let root_raw = next();
        let root = DeviceHandle::from_raw(root_raw);
        let mut subs = Vec::new();
        let mut sub_records = Vec::new();
        for s in 0..config.sub_devices {
            let raw = next();
            let handle = DeviceHandle::from_raw(raw);
            subs.push(handle);
            sub_records.push(DeviceRecord {
                raw: raw.get(),
                handle,
                parent: Some(root),
                subs: Vec::new(),
                properties: properties(config, format!("Reference GPU {}.{}", d, s), Some(s)),
            });
        }
        records.push(DeviceRecord {
            raw: root_raw.get(),
            handle: root,
            parent: None,
            subs,
            properties: properties(config, format!("Reference GPU {}", d), None),
        });
        records.extend(sub_records);
    }
    records
}

fn properties(config: &DriverConfig, name: String, sub_device_id: Option<u32>) -> DeviceProperties {
    let mut queue_groups = vec![QueueGroupProperties {
        flags: QueueGroupFlags::COMPUTE | QueueGroupFlags::COPY,
        num_queues: config.compute_queues,
    }];
    if config.copy_queues > 0 {
        queue_groups.push(QueueGroupProperties {
            flags: QueueGroupFlags::COPY,
            num_queues: config.copy_queues,
        });
    }
    DeviceProperties {
        name,
        is_sub_device: sub_device_id.is_some(),
        sub_device_id,
        timer_resolution: config.timer_resolution,
        kernel_timestamp_valid_bits: config.kernel_timestamp_valid_bits,
        timestamp_valid_bits: config.timestamp_valid_bits,
        queue_groups,
        max_mem_alloc_size: config.max_mem_alloc_size,
        mapped_timestamps: config.mapped_timestamps,
        system_shared_allocations: config.system_shared_allocations,
    }
}

/// Device time base derived from the system monotonic clock.
///
/// Every process on the host derives identical tick values for the same instant, which keeps
/// timestamps written by one process comparable with clocks sampled in another.
#[derive(Debug, Clone, Copy)]
pub struct DeviceClock {
    resolution: TimerResolution,
    kernel_mask: u64,
    global_mask: u64,
}

impl DeviceClock {
    pub fn new(resolution: TimerResolution, kernel_valid_bits: u32, valid_bits: u32) -> Self {
        Self {
            resolution,
            kernel_mask: valid_bits_mask(kernel_valid_bits),
            global_mask: valid_bits_mask(valid_bits),
        }
    }

    pub fn resolution(&self) -> TimerResolution {
        self.resolution
    }

    /// Host monotonic time in nanoseconds.
    pub fn host_ns(&self) -> u64 {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => (ts.tv_sec() as u64)
                .saturating_mul(1_000_000_000)
                .saturating_add(ts.tv_nsec() as u64),
            Err(_) => 0,
        }
    }

    /// Kernel timestamp tick value for the host instant `host_ns`.
    pub fn kernel_ticks(&self, host_ns: u64) -> u64 {
        self.resolution.ns_to_ticks(host_ns) & self.kernel_mask
    }

    /// `(host_ns, device_ticks)` sampled together.
    pub fn global_timestamps(&self) -> (u64, u64) {
        let host = self.host_ns();
        (host, self.resolution.ns_to_ticks(host) & self.global_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(DriverConfig::default().validate().is_ok());

        let bad = DriverConfig {
            kernel_timestamp_valid_bits: 65,
            ..DriverConfig::default()
        };
        assert!(matches!(bad.validate(), Err(Error::Config(_))));

        let too_many = DriverConfig {
            sub_devices: MAX_TILES as u32 + 1,
            ..DriverConfig::default()
        };
        assert!(too_many.validate().is_err());
    }

    #[test]
    fn test_kernel_ticks_are_masked() {
        let clock = DeviceClock::new(TimerResolution::NanosPerTick(1), 8, 36);
        assert_eq!(clock.kernel_ticks(0x1234), 0x34);
        let (host, device) = clock.global_timestamps();
        assert!(host > 0);
        assert!(device <= valid_bits_mask(36));
    }

    #[test]
    fn test_queue_groups_follow_config() {
        let config = DriverConfig {
            copy_queues: 0,
            ..DriverConfig::default()
        };
        let p = properties(&config, "dev".into(), None);
        assert_eq!(p.queue_groups.len(), 1);
        assert_eq!(p.queue_groups[0].num_queues, config.compute_queues);
    }
}
