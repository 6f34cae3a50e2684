//! Core types for the andromidi device manager.
//!
//! Pure data and traits shared by the registry and by platform backends:
//!
//! - [`PortPath`] / [`PortId`]: internal port key and the opaque identifier handed to hosts
//! - [`DeviceInfo`] / [`DeviceSummary`]: what a platform reports and what hosts are told
//! - [`RegistryConfig`]: confirmation delays
//! - [`platform`]: the traits a backend (JNI glue, the virtual platform, a test double) implements
//!
//! Nothing in this crate spawns threads or takes locks.

pub mod error;
pub use error::{Error, Result};

mod config;
pub use config::RegistryConfig;

mod path;
pub use path::{DeviceId, PortDirection, PortId, PortPath, MAX_PORT_INDEX};

mod device;
pub use device::{
    BluetoothStatus, DeviceInfo, DeviceKind, DeviceListChange, DeviceListObserver, DeviceSummary,
    DeviceTransport, PortDescriptor, PortInfo,
};

pub mod platform;
pub use platform::{
    BluetoothAdapter, CallbackId, DeviceCallback, DeviceEvent, GattCallback, GattConnection,
    GattEvent, GattState, LeScanner, MidiDevice, MidiPlatform, MidiReceiver, ScanCallback,
    ScanEvent, ScanFilter, ScanMatch, Scheduler, SinkPort, SourcePort, Task,
    BLE_MIDI_SERVICE_UUID,
};
