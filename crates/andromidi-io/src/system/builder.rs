//! MidiDeviceSystem builder for wiring platform services together.

use std::sync::Arc;

use andromidi_core::{
    BluetoothAdapter, DeviceListObserver, Error, MidiPlatform, RegistryConfig, Result, Scheduler,
};
use tracing::debug;

use super::MidiDeviceSystem;
use crate::registry::DeviceRegistry;
use crate::scanner::BluetoothScanner;
use crate::timer::TimerThread;

#[derive(Default)]
pub struct MidiDeviceSystemBuilder {
    pub(super) platform: Option<Arc<dyn MidiPlatform>>,
    pub(super) bluetooth: Option<Arc<dyn BluetoothAdapter>>,
    pub(super) scheduler: Option<Arc<dyn Scheduler>>,
    pub(super) config: RegistryConfig,
    pub(super) observers: Vec<Arc<dyn DeviceListObserver>>,
}

impl MidiDeviceSystemBuilder {
    pub fn platform(mut self, platform: Arc<dyn MidiPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Enables Bluetooth pairing and LE scanning.
    pub fn bluetooth(mut self, adapter: Arc<dyn BluetoothAdapter>) -> Self {
        self.bluetooth = Some(adapter);
        self
    }

    /// Replaces the default [`TimerThread`].
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn DeviceListObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> Result<MidiDeviceSystem> {
        let platform = self
            .platform
            .filter(|platform| platform.is_available())
            .ok_or_else(|| Error::ServiceUnavailable("midi".to_string()))?;
        self.config.validate()?;

        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TimerThread::new()?),
        };

        let registry = DeviceRegistry::new(platform, self.bluetooth.clone(), scheduler, self.config);
        for observer in self.observers {
            registry.add_observer(observer);
        }
        registry.initialize();

        // Scanning needs an LE scanner; pairing by address works without one
        let bluetooth = self.bluetooth.and_then(|adapter| {
            if adapter.le_scanner().is_none() {
                debug!("Bluetooth adapter has no LE scanner");
                return None;
            }
            Some(BluetoothScanner::new(adapter, &registry))
        });

        Ok(MidiDeviceSystem {
            bluetooth,
            registry,
        })
    }
}
