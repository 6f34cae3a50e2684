//! Pending device confirmation.

use super::{close_device, close_gatt};
use andromidi_core::{DeviceId, DeviceTransport, GattConnection, MidiDevice};
use parking_lot::Mutex;
use std::sync::Arc;

struct OpenTaskState {
    device: Option<Arc<dyn MidiDevice>>,
    gatt: Option<Arc<dyn GattConnection>>,
}

/// An opened device waiting out its confirmation delay.
///
/// Owns the device handle and, for Bluetooth devices, the GATT link until it
/// is either promoted into the registry or cancelled. Both resources are
/// released exactly once.
pub(crate) struct OpenTask {
    device_id: DeviceId,
    bluetooth_address: Option<String>,
    transport: DeviceTransport,
    state: Mutex<OpenTaskState>,
}

impl OpenTask {
    pub(crate) fn new(
        device: Arc<dyn MidiDevice>,
        gatt: Option<Arc<dyn GattConnection>>,
        transport: DeviceTransport,
    ) -> Self {
        Self {
            device_id: device.info().id,
            bluetooth_address: device.info().bluetooth_address().map(str::to_string),
            transport,
            state: Mutex::new(OpenTaskState {
                device: Some(device),
                gatt,
            }),
        }
    }

    pub(crate) fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub(crate) fn bluetooth_address(&self) -> Option<&str> {
        self.bluetooth_address.as_deref()
    }

    pub(crate) fn transport(&self) -> DeviceTransport {
        self.transport
    }

    /// True when `device` is the very handle this task owns.
    pub(crate) fn holds(&self, device: &Arc<dyn MidiDevice>) -> bool {
        self.state
            .lock()
            .device
            .as_ref()
            .is_some_and(|held| Arc::ptr_eq(held, device))
    }

    /// Attaches a GATT link that arrived after the device opened. Hands it
    /// back when the task already has one or was already finished.
    pub(crate) fn attach_gatt(
        &self,
        gatt: Arc<dyn GattConnection>,
    ) -> Option<Arc<dyn GattConnection>> {
        let mut state = self.state.lock();
        if state.device.is_none() || state.gatt.is_some() {
            return Some(gatt);
        }
        state.gatt = Some(gatt);
        None
    }

    /// Takes ownership of the device and GATT link for promotion.
    pub(crate) fn take(&self) -> Option<(Arc<dyn MidiDevice>, Option<Arc<dyn GattConnection>>)> {
        let mut state = self.state.lock();
        let device = state.device.take()?;
        Some((device, state.gatt.take()))
    }

    /// Releases whatever the task still owns. Returns false when there was
    /// nothing left to release.
    pub(crate) fn cancel(&self) -> bool {
        let (device, gatt) = {
            let mut state = self.state.lock();
            (state.device.take(), state.gatt.take())
        };
        if let Some(gatt) = &gatt {
            close_gatt(&**gatt);
        }
        match device {
            Some(device) => {
                close_device(&*device);
                true
            }
            None => gatt.is_some(),
        }
    }
}
