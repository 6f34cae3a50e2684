//! Port identity.
//!
//! [`PortPath`] is the registry's internal key for a logical port. [`PortId`] is
//! the integer handed across to hosts; it packs a path losslessly:
//!
//! ```text
//! bits 63..32  device id (two's-complement bits)
//! bit  31      direction (1 = input)
//! bits 30..0   port index
//! ```
//!
//! Platform port numbers are non-negative signed 32-bit values, so every real
//! port index fits in 31 bits.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type DeviceId = i32;

/// Largest port index representable in a [`PortId`].
pub const MAX_PORT_INDEX: u32 = i32::MAX as u32;

const DIRECTION_BIT: u64 = 1 << 31;
const INDEX_MASK: u64 = DIRECTION_BIT - 1;

/// Direction as seen from the host: an input port delivers MIDI to the host,
/// an output port carries MIDI from the host to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

impl PortDirection {
    #[inline]
    pub fn is_input(self) -> bool {
        matches!(self, PortDirection::Input)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortPath {
    pub device_id: DeviceId,
    pub direction: PortDirection,
    pub port_index: u32,
}

impl PortPath {
    pub fn new(device_id: DeviceId, direction: PortDirection, port_index: u32) -> Self {
        Self {
            device_id,
            direction,
            port_index,
        }
    }

    pub fn input(device_id: DeviceId, port_index: u32) -> Self {
        Self::new(device_id, PortDirection::Input, port_index)
    }

    pub fn output(device_id: DeviceId, port_index: u32) -> Self {
        Self::new(device_id, PortDirection::Output, port_index)
    }

    #[inline]
    pub fn is_input(&self) -> bool {
        self.direction.is_input()
    }

    pub fn id(&self) -> Result<PortId> {
        PortId::try_from(*self)
    }
}

impl fmt::Display for PortPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.is_input() { "in" } else { "out" };
        write!(f, "{}/{}/{}", self.device_id, direction, self.port_index)
    }
}

/// Opaque port identifier exposed to hosts.
///
/// Hosts must not build these themselves; obtain them from a port listing and
/// hand them back to the registry to open a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId(u64);

impl PortId {
    #[inline]
    pub fn as_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Decodes the path this id was built from.
    pub fn path(self) -> PortPath {
        let device_id = (self.0 >> 32) as u32 as i32;
        let direction = if self.0 & DIRECTION_BIT != 0 {
            PortDirection::Input
        } else {
            PortDirection::Output
        };
        PortPath::new(device_id, direction, (self.0 & INDEX_MASK) as u32)
    }
}

impl TryFrom<PortPath> for PortId {
    type Error = Error;

    fn try_from(path: PortPath) -> Result<Self> {
        if path.port_index > MAX_PORT_INDEX {
            return Err(Error::PortIndexOutOfRange(path.port_index));
        }
        let device = (path.device_id as u32 as u64) << 32;
        let direction = if path.is_input() { DIRECTION_BIT } else { 0 };
        Ok(Self(device | direction | path.port_index as u64))
    }
}

impl From<PortId> for PortPath {
    fn from(id: PortId) -> Self {
        id.path()
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
