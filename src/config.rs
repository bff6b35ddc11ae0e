use std::time::Duration;

use serde::Deserialize;

use crate::calibrate::TrimSettings;
use crate::cmd::DevboardError;
use crate::usb::BusyRetry;
use crate::{DEVBOARD_PID, DEVBOARD_VID};

/// Settings for finding and driving a board, usually read from a TOML file.
///
/// ```toml
/// product_id = 0x0006
/// supply_voltage = 3.3
/// trim_tolerance_hz = 25
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BoardConfig {
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "default_product_id")]
    pub product_id: u16,
    #[serde(default = "default_busy_retry_interval")]
    pub busy_retry_interval_ms: u64,
    #[serde(default)]
    pub busy_retry_max_attempts: Option<u32>,
    #[serde(default = "default_supply_voltage")]
    pub supply_voltage: f64,
    #[serde(default = "default_trim_tolerance")]
    pub trim_tolerance_hz: u32,
    #[serde(default = "default_trim_max_iterations")]
    pub trim_max_iterations: u32,
}

fn default_vendor_id() -> u16 {
    DEVBOARD_VID
}

fn default_product_id() -> u16 {
    DEVBOARD_PID
}

fn default_busy_retry_interval() -> u64 {
    100
}

fn default_supply_voltage() -> f64 {
    3.3
}

fn default_trim_tolerance() -> u32 {
    TrimSettings::default().tolerance_hz
}

fn default_trim_max_iterations() -> u32 {
    TrimSettings::default().max_iterations
}

impl Default for BoardConfig {
    fn default() -> Self {
        BoardConfig {
            vendor_id: default_vendor_id(),
            product_id: default_product_id(),
            busy_retry_interval_ms: default_busy_retry_interval(),
            busy_retry_max_attempts: None,
            supply_voltage: default_supply_voltage(),
            trim_tolerance_hz: default_trim_tolerance(),
            trim_max_iterations: default_trim_max_iterations(),
        }
    }
}

impl BoardConfig {
    pub fn from_toml(content: &str) -> Result<Self, DevboardError> {
        Ok(toml::from_str(content)?)
    }

    pub fn busy_retry(&self) -> BusyRetry {
        BusyRetry {
            interval: Duration::from_millis(self.busy_retry_interval_ms),
            max_attempts: self.busy_retry_max_attempts,
        }
    }

    pub fn trim_settings(&self) -> TrimSettings {
        TrimSettings {
            tolerance_hz: self.trim_tolerance_hz,
            max_iterations: self.trim_max_iterations,
        }
    }
}
