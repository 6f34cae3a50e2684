//! # andromidi - MIDI device manager
//!
//! Keeps a live registry of MIDI devices reported by the platform, hands out
//! exclusive input and output port handles, and pairs Bluetooth LE MIDI
//! peripherals.
//!
//! ## Architecture
//!
//! andromidi is an umbrella crate over:
//! - **andromidi-core** - Port identity, device descriptions, configuration, platform traits
//! - **andromidi-io** - Device registry, Bluetooth pairing and scanning, port handles, timer
//!
//! A platform backend implements the traits in [`platform`]; the `virtual`
//! feature ships an in-process one.
//!
//! ## Quick Start
//!
//! ```ignore
//! use andromidi::prelude::*;
//!
//! let platform = VirtualPlatform::new();
//! let system = MidiDeviceSystem::builder()
//!     .platform(Arc::new(platform.clone()))
//!     .bluetooth(Arc::new(platform))
//!     .build()?;
//!
//! let receiver: Arc<dyn MidiReceiver> = Arc::new(|bytes: &[u8], timestamp: u64| {
//!     println!("{timestamp}: {bytes:02x?}");
//! });
//! if let Some(port) = system.list_input_ports().first() {
//!     let input = system.open_input(port.id, receiver)?;
//!     input.start();
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `default` - Virtual platform included
//! - `virtual` - In-process platform and manual scheduler

/// Re-export of andromidi-core for direct access
pub use andromidi_core as core;

/// Traits a platform backend implements.
pub use andromidi_core::platform;

// Core types
pub use andromidi_core::{
    BluetoothStatus,
    DeviceId,
    DeviceInfo,
    DeviceKind,
    DeviceListChange,
    DeviceListObserver,
    DeviceSummary,
    DeviceTransport,

    // Error
    Error,
    // Ports
    PortDescriptor,
    PortDirection,
    PortId,
    PortInfo,
    PortPath,
    RegistryConfig,
    Result,
    MAX_PORT_INDEX,
};

// Device manager
pub use andromidi_io::{
    BluetoothScanner, DeviceRegistry, MidiDeviceSystem, MidiDeviceSystemBuilder, MidiInputPort,
    MidiOutputPort, TimerThread,
};

#[cfg(feature = "virtual")]
pub use andromidi_io::{ManualScheduler, VirtualPlatform};

/// Convenience prelude for common imports
pub mod prelude {
    // Main entry point
    pub use crate::{MidiDeviceSystem, MidiDeviceSystemBuilder};

    // Ports
    pub use crate::{MidiInputPort, MidiOutputPort, PortDirection, PortId, PortInfo, PortPath};

    // Devices
    pub use crate::{
        BluetoothStatus, DeviceListChange, DeviceListObserver, DeviceSummary, RegistryConfig,
    };

    pub use crate::platform::MidiReceiver;
    pub use crate::{Error, Result};

    #[cfg(feature = "virtual")]
    pub use crate::{ManualScheduler, VirtualPlatform};

    pub use std::sync::Arc;
}
