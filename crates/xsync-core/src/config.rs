//! Harness configuration
//!
//! | variable                | meaning                                   |
//! |-------------------------|-------------------------------------------|
//! | `XSYNC_DEVICE_INDEX`    | root device to test (default 0)           |
//! | `XSYNC_DEVICE_NAME`     | substring of the device name; wins over the index |
//! | `XSYNC_LOG`             | log filter (default `info`)               |
//! | `XSYNC_REF_DEVICES`     | reference driver root devices             |
//! | `XSYNC_REF_SUB_DEVICES` | reference driver sub-devices per device   |

use crate::driver::DriverConfig;
use crate::logging::DEFAULT_FILTER;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub device_index: usize,
    pub device_name: Option<String>,
    pub log_filter: String,
    pub driver: DriverConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            device_name: None,
            log_filter: DEFAULT_FILTER.to_string(),
            driver: DriverConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Defaults overlaid with the `XSYNC_*` environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            driver: DriverConfig::from_env()?,
            ..Self::default()
        };
        if let Ok(index) = std::env::var("XSYNC_DEVICE_INDEX") {
            config.device_index = index.trim().parse().map_err(|_| {
                Error::Config(format!("XSYNC_DEVICE_INDEX={:?} is not a number", index))
            })?;
        }
        if let Ok(name) = std::env::var("XSYNC_DEVICE_NAME") {
            if !name.is_empty() {
                config.device_name = Some(name);
            }
        }
        if let Ok(filter) = std::env::var("XSYNC_LOG") {
            config.log_filter = filter;
        }
        Ok(config)
    }
}
