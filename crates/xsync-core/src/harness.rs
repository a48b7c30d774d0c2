//! Process-wide test context
//!
//! One `Harness` is built at start-up and passed by reference to everything that needs the
//! driver, the device under test or the default context.

use crate::config::HarnessConfig;
use crate::driver::Driver;
use crate::handle::{ContextHandle, DeviceHandle};
use crate::{logging, Error, Result};

pub struct Harness {
    config: HarnessConfig,
    driver: Driver,
    device: DeviceHandle,
    context: ContextHandle,
}

impl Harness {
    /// Initialise the driver, select the device and create the default context.
    pub fn init(config: HarnessConfig) -> Result<Self> {
        logging::init(&config.log_filter);
        let driver = Driver::init(config.driver.clone())?;
        let device = select_device(&driver, &config)?;
        let context = driver.create_context()?;
        tracing::info!(%device, "harness ready");
        Ok(Self {
            config,
            driver,
            device,
            context,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::init(HarnessConfig::from_env()?)
    }

    /// Harness over the default reference topology.
    pub fn reference() -> Result<Self> {
        Self::init(HarnessConfig::default())
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }

    /// Sub-devices of the device under test.
    pub fn sub_devices(&self) -> Result<Vec<DeviceHandle>> {
        self.driver.sub_devices(self.device)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Err(e) = self.driver.destroy_context(self.context) {
            tracing::warn!(error = %e, "failed to destroy default context");
        }
    }
}

fn select_device(driver: &Driver, config: &HarnessConfig) -> Result<DeviceHandle> {
    let devices = driver.devices();
    if let Some(name) = &config.device_name {
        for &device in &devices {
            if driver.device_properties(device)?.name.contains(name.as_str()) {
                return Ok(device);
            }
        }
        return Err(Error::Config(format!("no device named {:?}", name)));
    }
    devices.get(config.device_index).copied().ok_or_else(|| {
        Error::Config(format!(
            "device index {} out of range ({} devices)",
            config.device_index,
            devices.len()
        ))
    })
}
