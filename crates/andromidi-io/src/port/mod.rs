//! Port handles handed to hosts.

mod input;
mod output;

pub use input::MidiInputPort;
pub use output::MidiOutputPort;

pub(crate) use input::InputPortShared;
pub(crate) use output::OutputPortShared;

use crate::registry::RegistryInner;
use andromidi_core::PortPath;
use std::sync::Weak;

/// What the registry needs from an open port to close it in bulk.
pub(crate) trait OpenPort: Send + Sync {
    fn path(&self) -> PortPath;
    fn close(&self);
}

/// Deregisters a closing port from its owner, if the owner is still alive.
fn release(owner: Option<Weak<RegistryInner>>, path: &PortPath, port: *const ()) {
    if let Some(owner) = owner.and_then(|owner| owner.upgrade()) {
        owner.release_port(path, port);
    }
}
