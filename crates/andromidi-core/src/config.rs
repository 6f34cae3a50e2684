//! Registry configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_OPEN_DELAY_MS: u64 = 60_000;

/// Confirmation delays applied to freshly opened devices.
///
/// A device is only listed once it has survived its delay without being
/// removed or unpaired. Bluetooth links get longer to settle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub wired_open_delay_ms: u64,
    pub bluetooth_open_delay_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            wired_open_delay_ms: 100,
            bluetooth_open_delay_ms: 2000,
        }
    }
}

impl RegistryConfig {
    pub fn wired_open_delay(&self) -> Duration {
        Duration::from_millis(self.wired_open_delay_ms)
    }

    pub fn bluetooth_open_delay(&self) -> Duration {
        Duration::from_millis(self.bluetooth_open_delay_ms)
    }

    pub fn open_delay(&self, bluetooth: bool) -> Duration {
        if bluetooth {
            self.bluetooth_open_delay()
        } else {
            self.wired_open_delay()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.wired_open_delay_ms > MAX_OPEN_DELAY_MS
            || self.bluetooth_open_delay_ms > MAX_OPEN_DELAY_MS
        {
            return Err(Error::InvalidConfig(format!(
                "open delays must not exceed {MAX_OPEN_DELAY_MS} ms (wired={}, bluetooth={})",
                self.wired_open_delay_ms, self.bluetooth_open_delay_ms
            )));
        }
        if self.bluetooth_open_delay_ms < self.wired_open_delay_ms {
            return Err(Error::InvalidConfig(format!(
                "bluetooth_open_delay_ms {} is shorter than wired_open_delay_ms {}",
                self.bluetooth_open_delay_ms, self.wired_open_delay_ms
            )));
        }
        Ok(())
    }
}
