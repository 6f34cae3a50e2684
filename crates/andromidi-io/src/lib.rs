//! MIDI device-port manager.
//!
//! Tracks platform MIDI devices, confirms them after a settling delay, hands
//! out exclusive port handles, and pairs Bluetooth LE MIDI peripherals.
//!
//! Feature gates: `virtual` (in-process platform and manual scheduler).

pub use andromidi_core::{
    BluetoothStatus, DeviceId, DeviceInfo, DeviceKind, DeviceListChange, DeviceListObserver,
    DeviceSummary, DeviceTransport, Error, MidiReceiver, PortDirection, PortId, PortInfo,
    PortPath, RegistryConfig, Result,
};

mod system;
pub use system::{MidiDeviceSystem, MidiDeviceSystemBuilder};

pub(crate) mod registry;
pub use registry::DeviceRegistry;

pub(crate) mod port;
pub use port::{MidiInputPort, MidiOutputPort};

mod scanner;
pub use scanner::BluetoothScanner;

mod timer;
pub use timer::TimerThread;

#[cfg(feature = "virtual")]
pub mod virtual_platform;

#[cfg(feature = "virtual")]
pub use virtual_platform::{ManualScheduler, VirtualPlatform};
