//! Device-port manager root.
//!
//! ## Quick Start
//!
//! ```ignore
//! use andromidi_io::{MidiDeviceSystem, VirtualPlatform};
//!
//! let platform = VirtualPlatform::new();
//! let system = MidiDeviceSystem::builder()
//!     .platform(Arc::new(platform.clone()))
//!     .bluetooth(Arc::new(platform))
//!     .observer(Arc::new(|change: &DeviceListChange| println!("{change:?}")))
//!     .build()?;
//!
//! for port in system.list_output_ports() {
//!     let output = system.open_output(port.id)?;
//!     output.send_midi(&[0x90, 60, 100]);
//! }
//!
//! if let Some(bluetooth) = system.bluetooth() {
//!     bluetooth.start_stop_scan(true);
//! }
//! ```

mod builder;

pub use builder::MidiDeviceSystemBuilder;

use crate::port::{MidiInputPort, MidiOutputPort};
use crate::registry::DeviceRegistry;
use crate::scanner::BluetoothScanner;
use andromidi_core::{
    DeviceListObserver, DeviceSummary, MidiReceiver, PortId, PortInfo, Result,
};
use std::sync::Arc;

// ============================================================================
// MidiDeviceSystem - Main Entry Point
// ============================================================================

/// Owns the device registry and, when available, the Bluetooth scanner.
///
/// Dropping the system stops scanning and tears the registry down.
pub struct MidiDeviceSystem {
    // Declared first so the scan stops before the registry goes away
    pub(crate) bluetooth: Option<BluetoothScanner>,
    pub(crate) registry: DeviceRegistry,
}

impl MidiDeviceSystem {
    pub fn builder() -> MidiDeviceSystemBuilder {
        MidiDeviceSystemBuilder::default()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// `None` without a Bluetooth adapter or LE scanner.
    pub fn bluetooth(&self) -> Option<&BluetoothScanner> {
        self.bluetooth.as_ref()
    }

    // ==================== Devices ====================

    pub fn devices(&self) -> Vec<DeviceSummary> {
        self.registry.devices()
    }

    pub fn add_observer(&self, observer: Arc<dyn DeviceListObserver>) {
        self.registry.add_observer(observer);
    }

    // ==================== Ports ====================

    pub fn list_input_ports(&self) -> Vec<PortInfo> {
        self.registry.list_input_ports()
    }

    pub fn list_output_ports(&self) -> Vec<PortInfo> {
        self.registry.list_output_ports()
    }

    pub fn open_input(&self, id: PortId, receiver: Arc<dyn MidiReceiver>) -> Result<MidiInputPort> {
        self.registry.open_input(id, receiver)
    }

    pub fn open_output(&self, id: PortId) -> Result<MidiOutputPort> {
        self.registry.open_output(id)
    }
}

impl std::fmt::Debug for MidiDeviceSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiDeviceSystem")
            .field("registry", &self.registry)
            .field("bluetooth", &self.bluetooth)
            .finish()
    }
}
