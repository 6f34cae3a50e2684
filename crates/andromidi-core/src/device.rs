//! Device descriptions and host-facing notifications.

use crate::path::{DeviceId, PortDirection, PortId, PortPath};
use serde::{Deserialize, Serialize};

const UNKNOWN_DEVICE_NAME: &str = "Unknown device";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Usb,
    Virtual,
    Bluetooth,
}

/// Wire transport the platform uses for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceTransport {
    #[default]
    ByteStream,
    Ump,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BluetoothStatus {
    #[default]
    Unpaired,
    Pairing,
    Paired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub direction: PortDirection,
    pub index: u32,
    pub name: String,
}

/// A device as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub kind: DeviceKind,
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub bluetooth_address: Option<String>,
    pub ports: Vec<PortDescriptor>,
    /// Only reported by platforms with UMP support.
    pub default_protocol: Option<i32>,
}

impl DeviceInfo {
    pub fn new(id: DeviceId, kind: DeviceKind) -> Self {
        Self {
            id,
            kind,
            name: None,
            manufacturer: None,
            product: None,
            serial_number: None,
            bluetooth_address: None,
            ports: Vec::new(),
            default_protocol: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn with_bluetooth_address(mut self, address: impl Into<String>) -> Self {
        self.bluetooth_address = Some(address.into());
        self
    }

    pub fn with_port(
        mut self,
        direction: PortDirection,
        index: u32,
        name: impl Into<String>,
    ) -> Self {
        self.ports.push(PortDescriptor {
            direction,
            index,
            name: name.into(),
        });
        self
    }

    #[inline]
    pub fn is_bluetooth(&self) -> bool {
        self.kind == DeviceKind::Bluetooth
    }

    /// The Bluetooth address, for Bluetooth devices that report a non-empty one.
    pub fn bluetooth_address(&self) -> Option<&str> {
        if !self.is_bluetooth() {
            return None;
        }
        self.bluetooth_address
            .as_deref()
            .filter(|address| !address.is_empty())
    }

    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_DEVICE_NAME)
    }

    pub fn ports_in(&self, direction: PortDirection) -> impl Iterator<Item = &PortDescriptor> {
        self.ports
            .iter()
            .filter(move |port| port.direction == direction)
    }

    pub fn port_count(&self, direction: PortDirection) -> usize {
        self.ports_in(direction).count()
    }

    /// `"<device> <port>"`, falling back to `"In N"` / `"Out N"` for unnamed
    /// ports, where `position` is 1-based among the device's ports of that direction.
    pub fn port_display_name(&self, port: &PortDescriptor, position: usize) -> String {
        if port.name.is_empty() {
            let prefix = if port.direction.is_input() { "In" } else { "Out" };
            format!("{} {} {}", self.display_name(), prefix, position)
        } else {
            format!("{} {}", self.display_name(), port.name)
        }
    }

    fn port_names(&self, direction: PortDirection) -> Vec<String> {
        // Port numbers may be sparse; gaps stay empty
        let len = self
            .ports_in(direction)
            .map(|port| port.index as usize + 1)
            .max()
            .unwrap_or(0);
        let mut names = vec![String::new(); len];
        for port in self.ports_in(direction) {
            names[port.index as usize].clone_from(&port.name);
        }
        names
    }
}

/// A listed port: what hosts pick from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub id: PortId,
    pub path: PortPath,
    pub name: String,
}

/// Snapshot of a confirmed device, delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub kind: DeviceKind,
    pub transport: DeviceTransport,
    pub name: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub default_protocol: Option<i32>,
    /// Indexed by port number.
    pub input_port_names: Vec<String>,
    /// Indexed by port number.
    pub output_port_names: Vec<String>,
}

impl DeviceSummary {
    pub fn from_info(info: &DeviceInfo, transport: DeviceTransport) -> Self {
        Self {
            id: info.id,
            kind: info.kind,
            transport,
            name: info.display_name().to_string(),
            manufacturer: info.manufacturer.clone(),
            product: info.product.clone(),
            serial_number: info.serial_number.clone(),
            default_protocol: info.default_protocol,
            input_port_names: info.port_names(PortDirection::Input),
            output_port_names: info.port_names(PortDirection::Output),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceListChange {
    Added(DeviceSummary),
    Removed(DeviceId),
}

/// Receives device-list changes. Called from platform and timer threads,
/// never while registry state is locked.
pub trait DeviceListObserver: Send + Sync {
    fn on_device_list_changed(&self, change: &DeviceListChange);
}

impl<F> DeviceListObserver for F
where
    F: Fn(&DeviceListChange) + Send + Sync,
{
    fn on_device_list_changed(&self, change: &DeviceListChange) {
        self(change)
    }
}
