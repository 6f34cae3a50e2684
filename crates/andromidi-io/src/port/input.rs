use super::{release, OpenPort};
use crate::registry::RegistryInner;
use andromidi_core::{MidiReceiver, PortId, PortPath, SourcePort};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Drops zero-length messages before they reach the host.
struct Forwarder {
    receiver: Arc<dyn MidiReceiver>,
}

impl MidiReceiver for Forwarder {
    fn on_send(&self, bytes: &[u8], timestamp: u64) {
        if bytes.is_empty() {
            return;
        }
        self.receiver.on_send(bytes, timestamp);
    }
}

struct InputState {
    owner: Option<Weak<RegistryInner>>,
    port: Option<Box<dyn SourcePort>>,
    connected: bool,
}

pub(crate) struct InputPortShared {
    path: PortPath,
    id: PortId,
    forwarder: Arc<dyn MidiReceiver>,
    state: Mutex<InputState>,
}

impl InputPortShared {
    pub(crate) fn new(
        path: PortPath,
        id: PortId,
        owner: Weak<RegistryInner>,
        port: Box<dyn SourcePort>,
        receiver: Arc<dyn MidiReceiver>,
    ) -> Self {
        Self {
            path,
            id,
            forwarder: Arc::new(Forwarder { receiver }),
            state: Mutex::new(InputState {
                owner: Some(owner),
                port: Some(port),
                connected: false,
            }),
        }
    }

    fn start(&self) {
        let mut state = self.state.lock();
        if state.connected {
            return;
        }
        let attached = state
            .owner
            .as_ref()
            .is_some_and(|owner| owner.strong_count() > 0);
        if !attached {
            return;
        }
        if let Some(port) = &state.port {
            port.connect(self.forwarder.clone());
            state.connected = true;
            debug!(path = %self.path, "MIDI input started");
        }
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        if !state.connected {
            return;
        }
        if let Some(port) = &state.port {
            port.disconnect(&self.forwarder);
        }
        state.connected = false;
        debug!(path = %self.path, "MIDI input stopped");
    }

    fn is_active(&self) -> bool {
        self.state.lock().connected
    }

    fn is_open(&self) -> bool {
        self.state.lock().port.is_some()
    }
}

impl OpenPort for InputPortShared {
    fn path(&self) -> PortPath {
        self.path
    }

    fn close(&self) {
        let (owner, port, connected) = {
            let mut state = self.state.lock();
            let connected = std::mem::take(&mut state.connected);
            (state.owner.take(), state.port.take(), connected)
        };

        if let Some(port) = port {
            if connected {
                port.disconnect(&self.forwarder);
            }
            if let Err(e) = port.close() {
                debug!(path = %self.path, "IO error closing MIDI input port: {}", e);
            }
        }
        release(owner, &self.path, self as *const Self as *const ());
    }
}

/// An open input port. Incoming messages reach the receiver between
/// [`start`](Self::start) and [`stop`](Self::stop).
///
/// Closes on drop.
pub struct MidiInputPort {
    shared: Arc<InputPortShared>,
}

impl MidiInputPort {
    pub(crate) fn from_shared(shared: Arc<InputPortShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> PortId {
        self.shared.id
    }

    pub fn path(&self) -> PortPath {
        self.shared.path
    }

    /// Connects the receiver. No-op when already started, closed, or the
    /// registry is gone.
    pub fn start(&self) {
        self.shared.start();
    }

    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Closes the platform port and frees the port for reopening. Repeated
    /// calls do nothing.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for MidiInputPort {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl fmt::Debug for MidiInputPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MidiInputPort")
            .field("path", &self.shared.path)
            .field("active", &self.is_active())
            .field("open", &self.is_open())
            .finish()
    }
}
