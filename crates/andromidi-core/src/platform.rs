//! Platform seam.
//!
//! A backend implements these traits: the Android JNI glue, the in-process
//! virtual platform, or a test double. Callback traits each have a single
//! ingress method taking a closed event enum; receivers dispatch with `match`.
//!
//! Port naming follows the host's point of view: a [`SourcePort`] produces
//! MIDI for the host, a [`SinkPort`] consumes MIDI sent by the host.

use crate::device::{DeviceInfo, DeviceTransport};
use crate::path::DeviceId;
use crate::Result;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Bluetooth LE MIDI service UUID used to filter scans.
pub const BLE_MIDI_SERVICE_UUID: &str = "03B80E5A-EDE8-4B33-A751-6CE34EC4C700";

// ============================================================================
// MIDI data path
// ============================================================================

/// Sink for incoming MIDI bytes.
pub trait MidiReceiver: Send + Sync {
    /// `timestamp` is in nanoseconds on the platform's monotonic clock.
    fn on_send(&self, bytes: &[u8], timestamp: u64);
}

impl<F> MidiReceiver for F
where
    F: Fn(&[u8], u64) + Send + Sync,
{
    fn on_send(&self, bytes: &[u8], timestamp: u64) {
        self(bytes, timestamp)
    }
}

pub trait SourcePort: Send + Sync {
    fn port_index(&self) -> u32;
    fn connect(&self, receiver: Arc<dyn MidiReceiver>);
    fn disconnect(&self, receiver: &Arc<dyn MidiReceiver>);
    fn close(&self) -> io::Result<()>;
}

pub trait SinkPort: Send + Sync {
    fn port_index(&self) -> u32;
    fn send(&self, bytes: &[u8], timestamp: u64) -> io::Result<()>;
    fn close(&self) -> io::Result<()>;
}

/// An opened platform device.
pub trait MidiDevice: Send + Sync {
    fn info(&self) -> &DeviceInfo;
    fn open_source_port(&self, index: u32) -> Option<Box<dyn SourcePort>>;
    fn open_sink_port(&self, index: u32) -> Option<Box<dyn SinkPort>>;
    fn close(&self) -> io::Result<()>;
}

// ============================================================================
// Device discovery
// ============================================================================

pub enum DeviceEvent {
    Added {
        info: DeviceInfo,
        transport: DeviceTransport,
    },
    Removed {
        id: DeviceId,
    },
    /// Answer to an open request.
    Opened(Arc<dyn MidiDevice>),
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceEvent::Added { info, transport } => f
                .debug_struct("Added")
                .field("id", &info.id)
                .field("kind", &info.kind)
                .field("transport", transport)
                .finish(),
            DeviceEvent::Removed { id } => f.debug_struct("Removed").field("id", id).finish(),
            DeviceEvent::Opened(device) => f.debug_tuple("Opened").field(&device.info().id).finish(),
        }
    }
}

pub trait DeviceCallback: Send + Sync {
    fn on_device_event(&self, event: DeviceEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u64);

pub trait MidiPlatform: Send + Sync {
    /// False when the platform has no MIDI service at all.
    fn is_available(&self) -> bool {
        true
    }

    fn devices(&self, transport: DeviceTransport) -> Vec<DeviceInfo>;

    fn register_device_callback(&self, callback: Arc<dyn DeviceCallback>) -> CallbackId;

    fn unregister_device_callback(&self, id: CallbackId);

    /// Requests an open; the result arrives later as [`DeviceEvent::Opened`] on `listener`.
    fn open_device(&self, info: &DeviceInfo, listener: Arc<dyn DeviceCallback>) -> Result<()>;

    /// Requests an open of a Bluetooth MIDI peripheral by address.
    fn open_bluetooth_device(&self, address: &str, listener: Arc<dyn DeviceCallback>)
        -> Result<()>;
}

// ============================================================================
// Bluetooth
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

pub enum GattEvent {
    ConnectionStateChanged {
        gatt: Arc<dyn GattConnection>,
        status: i32,
        state: GattState,
    },
}

impl fmt::Debug for GattEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattEvent::ConnectionStateChanged {
                gatt,
                status,
                state,
            } => f
                .debug_struct("ConnectionStateChanged")
                .field("address", &gatt.address())
                .field("status", status)
                .field("state", state)
                .finish(),
        }
    }
}

pub trait GattCallback: Send + Sync {
    fn on_gatt_event(&self, event: GattEvent);
}

pub trait GattConnection: Send + Sync {
    fn address(&self) -> &str;
    fn request_high_priority(&self) -> bool;
    fn disconnect(&self);
    fn close(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub service_uuid: String,
}

impl ScanFilter {
    pub fn ble_midi() -> Self {
        Self {
            service_uuid: BLE_MIDI_SERVICE_UUID.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanMatch {
    AllMatches,
    FirstMatch,
    MatchLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Result {
        kind: ScanMatch,
        address: Option<String>,
    },
    /// Batched results, treated as all-matches.
    Batch(Vec<String>),
    Failed(i32),
}

pub trait ScanCallback: Send + Sync {
    fn on_scan_event(&self, event: ScanEvent);
}

pub trait LeScanner: Send + Sync {
    fn start_scan(&self, filter: &ScanFilter, callback: Arc<dyn ScanCallback>);
    fn stop_scan(&self);
}

pub trait BluetoothAdapter: Send + Sync {
    fn remote_device_name(&self, address: &str) -> Option<String>;

    /// Starts a GATT connection; `None` when the platform does not need or
    /// cannot create one.
    fn connect_gatt(
        &self,
        address: &str,
        callback: Arc<dyn GattCallback>,
    ) -> Option<Arc<dyn GattConnection>>;

    fn le_scanner(&self) -> Option<Arc<dyn LeScanner>>;
}

// ============================================================================
// Scheduling
// ============================================================================

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// One-shot delayed execution.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: Task);
}
