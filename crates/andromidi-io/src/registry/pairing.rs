//! Bluetooth pairing.
//!
//! `pair` records the address and starts a GATT connection. Once the link is
//! up (or immediately, when the platform hands back no GATT object) the
//! registry asks the platform to open the peripheral; the open answer then
//! goes through the normal device-opened path with the Bluetooth delay.

use super::{close_gatt, RegistryInner};
use andromidi_core::{BluetoothStatus, GattConnection, GattEvent, GattState};
use std::sync::Arc;
use tracing::{debug, info, warn};

impl RegistryInner {
    pub(crate) fn bluetooth_status(&self, address: &str) -> BluetoothStatus {
        if address.is_empty() {
            return BluetoothStatus::Unpaired;
        }
        if self.find_device_for_address(address).is_some() {
            return BluetoothStatus::Paired;
        }
        let tables = self.tables.lock();
        let opening = tables
            .open_tasks
            .values()
            .any(|task| task.bluetooth_address() == Some(address));
        if tables.pairing.contains_key(address) || opening {
            BluetoothStatus::Pairing
        } else {
            BluetoothStatus::Unpaired
        }
    }

    pub(crate) fn pair(&self, address: &str) -> bool {
        if address.is_empty() {
            return false;
        }
        let Some(adapter) = self.bluetooth.clone() else {
            debug!(address, "Bluetooth pairing not supported");
            return false;
        };

        {
            let mut tables = self.tables.lock();
            if tables.torn_down {
                return false;
            }
            let opening = tables
                .open_tasks
                .values()
                .any(|task| task.bluetooth_address() == Some(address));
            if opening
                || tables.pairing.contains_key(address)
                || self.find_device_for_address(address).is_some()
            {
                return false;
            }
            tables.pairing.insert(address.to_string(), None);
        }

        info!(address, "Pairing Bluetooth MIDI device");
        match adapter.connect_gatt(address, self.gatt_listener()) {
            Some(gatt) => self.store_gatt(address, gatt),
            None => self.open_bluetooth(address),
        }
        true
    }

    /// Parks a GATT link wherever the handshake for `address` currently lives.
    fn store_gatt(&self, address: &str, gatt: Arc<dyn GattConnection>) {
        let rejected = {
            let mut tables = self.tables.lock();
            if let Some(slot) = tables.pairing.get_mut(address) {
                if slot.is_some() {
                    Some(gatt)
                } else {
                    *slot = Some(gatt);
                    None
                }
            } else if let Some(task) = tables
                .open_tasks
                .values()
                .find(|task| task.bluetooth_address() == Some(address))
            {
                task.attach_gatt(gatt)
            } else if let Some(record) = self.find_device_for_address(address) {
                record.attach_gatt(gatt)
            } else {
                debug!(address, "Pairing abandoned before GATT link was stored");
                Some(gatt)
            }
        };

        if let Some(gatt) = rejected {
            close_gatt(&*gatt);
        }
    }

    /// Second pairing step: ask the platform to open the peripheral.
    fn open_bluetooth(&self, address: &str) {
        if let Err(e) = self
            .platform
            .open_bluetooth_device(address, self.device_listener())
        {
            warn!(address, "Failed to open Bluetooth MIDI device: {}", e);
            self.abort_pairing(address);
        }
    }

    fn abort_pairing(&self, address: &str) {
        let gatt = self.tables.lock().pairing.remove(address).flatten();
        if let Some(gatt) = gatt {
            close_gatt(&*gatt);
        }
    }

    pub(super) fn handle_gatt_event(&self, event: GattEvent) {
        match event {
            GattEvent::ConnectionStateChanged { gatt, status, state } => {
                debug!(address = gatt.address(), status, ?state, "GATT connection state changed");
                if state != GattState::Connected {
                    return;
                }

                let address = gatt.address().to_string();
                if !self.tables.lock().pairing.contains_key(&address) {
                    debug!(%address, "GATT connected for an address that is not pairing");
                    return;
                }

                if !gatt.request_high_priority() {
                    debug!(%address, "High connection priority request was refused");
                }
                self.open_bluetooth(&address);
            }
        }
    }

    pub(crate) fn unpair(&self, address: &str) {
        if address.is_empty() {
            return;
        }

        // Both handshake stages go in one section, so an open answer cannot
        // slip in between and revive the pairing.
        let (task, gatt) = {
            let mut tables = self.tables.lock();
            let id = tables
                .open_tasks
                .iter()
                .find(|(_, task)| task.bluetooth_address() == Some(address))
                .map(|(id, _)| *id);
            let task = id.and_then(|id| tables.open_tasks.remove(&id));
            (task, tables.pairing.remove(address).flatten())
        };
        if let Some(gatt) = gatt {
            close_gatt(&*gatt);
        }
        if let Some(task) = task {
            task.cancel();
        }

        if let Some(record) = self.find_device_for_address(address) {
            info!(address, "Unpairing Bluetooth MIDI device");
            self.on_device_removed(record.id());
        }
    }
}
