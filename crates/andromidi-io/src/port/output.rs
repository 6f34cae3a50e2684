use super::{release, OpenPort};
use crate::registry::RegistryInner;
use andromidi_core::{PortId, PortPath, SinkPort};
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

struct OutputState {
    owner: Option<Weak<RegistryInner>>,
    port: Option<Box<dyn SinkPort>>,
}

pub(crate) struct OutputPortShared {
    path: PortPath,
    id: PortId,
    /// Sends share the read side; close takes the write side.
    state: RwLock<OutputState>,
}

impl OutputPortShared {
    pub(crate) fn new(
        path: PortPath,
        id: PortId,
        owner: Weak<RegistryInner>,
        port: Box<dyn SinkPort>,
    ) -> Self {
        Self {
            path,
            id,
            state: RwLock::new(OutputState {
                owner: Some(owner),
                port: Some(port),
            }),
        }
    }

    fn send(&self, bytes: &[u8], timestamp: u64) {
        let state = self.state.read();
        let Some(port) = &state.port else {
            return;
        };
        if let Err(e) = port.send(bytes, timestamp) {
            warn!(path = %self.path, "Failed to send MIDI message: {}", e);
        }
    }

    fn is_open(&self) -> bool {
        self.state.read().port.is_some()
    }
}

impl OpenPort for OutputPortShared {
    fn path(&self) -> PortPath {
        self.path
    }

    fn close(&self) {
        let (owner, port) = {
            let mut state = self.state.write();
            (state.owner.take(), state.port.take())
        };

        if let Some(port) = port {
            if let Err(e) = port.close() {
                debug!(path = %self.path, "IO error closing MIDI output port: {}", e);
            }
        }
        release(owner, &self.path, self as *const Self as *const ());
    }
}

/// An open output port.
///
/// Output ports have no running state: `start` and `stop` do nothing and
/// `is_active` is always false. Closes on drop.
pub struct MidiOutputPort {
    shared: Arc<OutputPortShared>,
}

impl MidiOutputPort {
    pub(crate) fn from_shared(shared: Arc<OutputPortShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> PortId {
        self.shared.id
    }

    pub fn path(&self) -> PortPath {
        self.shared.path
    }

    pub fn start(&self) {}

    pub fn stop(&self) {}

    pub fn is_active(&self) -> bool {
        false
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Sends one message for immediate delivery. Dropped silently once closed;
    /// transport errors are logged, not returned.
    pub fn send_midi(&self, bytes: &[u8]) {
        self.shared.send(bytes, 0);
    }

    /// Sends one message scheduled at `timestamp` (platform nanoseconds).
    pub fn send_midi_at(&self, bytes: &[u8], timestamp: u64) {
        self.shared.send(bytes, timestamp);
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for MidiOutputPort {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl fmt::Debug for MidiOutputPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MidiOutputPort")
            .field("path", &self.shared.path)
            .field("open", &self.is_open())
            .finish()
    }
}
