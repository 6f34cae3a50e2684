//! Bluetooth LE discovery of MIDI peripherals.

use crate::registry::{DeviceRegistry, RegistryInner};
use andromidi_core::{
    BluetoothAdapter, BluetoothStatus, LeScanner, ScanCallback, ScanEvent, ScanFilter, ScanMatch,
};
use dashmap::DashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Registered with the LE scanner so the scan never keeps the scanner state alive.
struct ScanForwarder {
    scanner: Weak<ScannerInner>,
}

impl ScanCallback for ScanForwarder {
    fn on_scan_event(&self, event: ScanEvent) {
        if let Some(scanner) = self.scanner.upgrade() {
            scanner.handle_scan_event(event);
        }
    }
}

struct ScannerInner {
    adapter: Arc<dyn BluetoothAdapter>,
    registry: Weak<RegistryInner>,
    addresses: DashSet<String>,
    forwarder: Arc<ScanForwarder>,
    scanning: AtomicBool,
}

impl ScannerInner {
    fn le_scanner(&self) -> Option<Arc<dyn LeScanner>> {
        let scanner = self.adapter.le_scanner();
        if scanner.is_none() {
            debug!("Could not get Bluetooth LE scanner");
        }
        scanner
    }

    fn handle_scan_event(&self, event: ScanEvent) {
        match event {
            ScanEvent::Result {
                kind: ScanMatch::AllMatches | ScanMatch::FirstMatch,
                address,
            } => {
                if let Some(address) = address {
                    self.found(address);
                }
            }
            ScanEvent::Result {
                kind: ScanMatch::MatchLost,
                address,
            } => {
                if let Some(address) = address {
                    self.lost(&address);
                }
            }
            ScanEvent::Batch(addresses) => {
                for address in addresses {
                    self.found(address);
                }
            }
            ScanEvent::Failed(code) => warn!(code, "Bluetooth LE scan failed"),
        }
    }

    fn found(&self, address: String) {
        if address.is_empty() {
            return;
        }
        if self.addresses.insert(address.clone()) {
            debug!(%address, "Bluetooth MIDI peripheral found");
        }
    }

    fn lost(&self, address: &str) {
        debug!(address, "Bluetooth MIDI peripheral lost");
        self.addresses.remove(address);
        if let Some(registry) = self.registry.upgrade() {
            registry.unpair(address);
        }
    }

    fn stop(&self) {
        if !self.scanning.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(scanner) = self.le_scanner() {
            scanner.stop_scan();
        }
    }
}

/// Tracks advertising BLE-MIDI peripherals and drives pairing for hosts.
///
/// Stops any running scan on drop.
pub struct BluetoothScanner {
    inner: Arc<ScannerInner>,
}

impl BluetoothScanner {
    pub fn new(adapter: Arc<dyn BluetoothAdapter>, registry: &DeviceRegistry) -> Self {
        let inner = Arc::new_cyclic(|scanner| ScannerInner {
            adapter,
            registry: registry.downgrade(),
            addresses: DashSet::new(),
            forwarder: Arc::new(ScanForwarder {
                scanner: scanner.clone(),
            }),
            scanning: AtomicBool::new(false),
        });
        Self { inner }
    }

    /// Starts or stops the service-filtered LE scan. Without an LE scanner
    /// this only logs.
    pub fn start_stop_scan(&self, should_start: bool) {
        if !should_start {
            self.inner.stop();
            return;
        }
        if self.inner.scanning.load(Ordering::SeqCst) {
            return;
        }
        let Some(scanner) = self.inner.le_scanner() else {
            return;
        };
        let callback: Arc<dyn ScanCallback> = self.inner.forwarder.clone();
        scanner.start_scan(&ScanFilter::ble_midi(), callback);
        self.inner.scanning.store(true, Ordering::SeqCst);
        info!("Bluetooth MIDI scan started");
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    /// Addresses seen advertising the MIDI service, sorted.
    pub fn midi_bluetooth_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self
            .inner
            .addresses
            .iter()
            .map(|address| address.key().clone())
            .collect();
        addresses.sort();
        addresses
    }

    pub fn human_readable_name(&self, address: &str) -> Option<String> {
        self.inner.adapter.remote_device_name(address)
    }

    pub fn bluetooth_status(&self, address: &str) -> BluetoothStatus {
        self.inner
            .registry
            .upgrade()
            .map(|registry| registry.bluetooth_status(address))
            .unwrap_or_default()
    }

    pub fn pair(&self, address: &str) -> bool {
        self.inner
            .registry
            .upgrade()
            .is_some_and(|registry| registry.pair(address))
    }

    pub fn unpair(&self, address: &str) {
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.unpair(address);
        }
    }

    pub fn handle_scan_event(&self, event: ScanEvent) {
        self.inner.handle_scan_event(event);
    }
}

impl Drop for BluetoothScanner {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl std::fmt::Debug for BluetoothScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluetoothScanner")
            .field("scanning", &self.is_scanning())
            .field("num_addresses", &self.inner.addresses.len())
            .finish()
    }
}
