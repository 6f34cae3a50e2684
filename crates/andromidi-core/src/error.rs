//! Error types for the device manager.

use crate::path::{PortId, PortPath};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Unknown MIDI port: {0}")]
    UnknownPort(PortId),

    #[error("MIDI port already open: {0}")]
    PortInUse(PortPath),

    #[error("Failed to open MIDI port: {0}")]
    PortOpenFailed(PortPath),

    #[error("Port index {0} cannot be encoded in a port id")]
    PortIndexOutOfRange(u32),

    #[error("MIDI device error: {0}")]
    MidiDevice(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Device registry has been torn down")]
    TornDown,
}

pub type Result<T> = std::result::Result<T, Error>;
