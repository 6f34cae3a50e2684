//! In-process platform: virtual wired devices, simulated BLE peripherals and a
//! manually advanced scheduler.
//!
//! Open requests are answered synchronously unless deferred with
//! [`VirtualPlatform::set_defer_opens`]. GATT links only report connected when
//! [`VirtualPlatform::complete_gatt_connection`] is called, and scan results
//! only arrive through [`VirtualPlatform::advertise`] and
//! [`VirtualPlatform::lose_peripheral`].

use andromidi_core::{
    BluetoothAdapter, CallbackId, DeviceCallback, DeviceEvent, DeviceId, DeviceInfo,
    DeviceTransport, Error, GattCallback, GattConnection, GattEvent, GattState, LeScanner,
    MidiDevice, MidiPlatform, MidiReceiver, PortDirection, PortPath, Result, ScanCallback,
    ScanEvent, ScanFilter, ScanMatch, Scheduler, SinkPort, SourcePort, Task,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

// ============================================================================
// Platform state
// ============================================================================

struct Peripheral {
    info: DeviceInfo,
    gatt_supported: bool,
}

struct Listener {
    port: u64,
    path: PortPath,
    receiver: Arc<dyn MidiReceiver>,
}

struct DeferredOpen {
    info: DeviceInfo,
    listener: Arc<dyn DeviceCallback>,
}

#[derive(Default)]
struct VirtualState {
    unavailable: bool,
    no_le_scanner: bool,
    fail_sends: bool,
    fail_port_opens: bool,
    defer_opens: bool,
    /// A device can be reported over both transports.
    devices: BTreeMap<DeviceId, (DeviceInfo, Vec<DeviceTransport>)>,
    peripherals: BTreeMap<String, Peripheral>,
    callbacks: Vec<(CallbackId, Arc<dyn DeviceCallback>)>,
    /// Open device handles by serial.
    handles: HashMap<u64, DeviceId>,
    /// Open ports by serial.
    ports: HashMap<u64, PortPath>,
    listeners: Vec<Listener>,
    sent: Vec<(PortPath, Vec<u8>)>,
    gatts: Vec<Arc<VirtualGatt>>,
    scan: Option<(ScanFilter, Arc<dyn ScanCallback>)>,
    deferred: Vec<DeferredOpen>,
    open_requests: usize,
}

#[derive(Default)]
struct VirtualInner {
    state: Mutex<VirtualState>,
    next_serial: AtomicU64,
}

impl VirtualInner {
    fn serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }
}

/// Loopback MIDI platform for tests and desktop runs.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct VirtualPlatform {
    inner: Arc<VirtualInner>,
}

impl VirtualPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn callbacks(&self) -> Vec<Arc<dyn DeviceCallback>> {
        self.inner
            .state
            .lock()
            .callbacks
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect()
    }

    fn broadcast(&self, event: impl Fn() -> DeviceEvent) {
        for callback in self.callbacks() {
            callback.on_device_event(event());
        }
    }

    fn new_handle(&self, info: DeviceInfo) -> Arc<dyn MidiDevice> {
        let serial = self.inner.serial();
        self.inner.state.lock().handles.insert(serial, info.id);
        Arc::new(VirtualDevice {
            serial,
            info,
            platform: Arc::downgrade(&self.inner),
            closed: AtomicBool::new(false),
        })
    }

    // ==================== Wired devices ====================

    pub fn set_available(&self, available: bool) {
        self.inner.state.lock().unavailable = !available;
    }

    pub fn add_device(&self, info: DeviceInfo) {
        self.add_device_with_transport(info, DeviceTransport::ByteStream);
    }

    /// Adds a device and announces it to registered callbacks.
    pub fn add_device_with_transport(&self, info: DeviceInfo, transport: DeviceTransport) {
        {
            let mut state = self.inner.state.lock();
            let entry = state
                .devices
                .entry(info.id)
                .or_insert_with(|| (info.clone(), Vec::new()));
            entry.0 = info.clone();
            if !entry.1.contains(&transport) {
                entry.1.push(transport);
            }
        }
        self.broadcast(|| DeviceEvent::Added {
            info: info.clone(),
            transport,
        });
    }

    pub fn remove_device(&self, id: DeviceId) {
        let removed = self.inner.state.lock().devices.remove(&id).is_some();
        if removed {
            self.broadcast(|| DeviceEvent::Removed { id });
        }
    }

    /// Opens a handle directly, bypassing callbacks.
    pub fn open_handle(&self, id: DeviceId) -> Option<Arc<dyn MidiDevice>> {
        let info = self.inner.state.lock().devices.get(&id).map(|(info, _)| info.clone())?;
        Some(self.new_handle(info))
    }

    /// Delivers an unsolicited open answer to every registered callback.
    pub fn deliver_opened(&self, id: DeviceId) -> bool {
        let Some(device) = self.open_handle(id) else {
            return false;
        };
        self.broadcast(|| DeviceEvent::Opened(device.clone()));
        true
    }

    /// Holds open answers until [`complete_pending_opens`](Self::complete_pending_opens).
    pub fn set_defer_opens(&self, defer: bool) {
        self.inner.state.lock().defer_opens = defer;
    }

    pub fn complete_pending_opens(&self) -> usize {
        let deferred = std::mem::take(&mut self.inner.state.lock().deferred);
        let count = deferred.len();
        for open in deferred {
            let device = self.new_handle(open.info);
            open.listener.on_device_event(DeviceEvent::Opened(device));
        }
        count
    }

    /// Feeds bytes into every receiver connected to the input port at `path`.
    pub fn inject(&self, path: PortPath, bytes: &[u8], timestamp: u64) {
        let receivers: Vec<_> = self
            .inner
            .state
            .lock()
            .listeners
            .iter()
            .filter(|listener| listener.path == path)
            .map(|listener| listener.receiver.clone())
            .collect();
        for receiver in receivers {
            receiver.on_send(bytes, timestamp);
        }
    }

    /// Messages delivered to the output port at `path`.
    pub fn sent(&self, path: PortPath) -> Vec<Vec<u8>> {
        self.inner
            .state
            .lock()
            .sent
            .iter()
            .filter(|(sent_to, _)| *sent_to == path)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.state.lock().fail_sends = fail;
    }

    pub fn set_fail_port_opens(&self, fail: bool) {
        self.inner.state.lock().fail_port_opens = fail;
    }

    // ==================== Counters ====================

    pub fn open_request_count(&self) -> usize {
        self.inner.state.lock().open_requests
    }

    pub fn callback_count(&self) -> usize {
        self.inner.state.lock().callbacks.len()
    }

    /// Device handles for `id` that have not been closed.
    pub fn open_device_handles(&self, id: DeviceId) -> usize {
        self.inner
            .state
            .lock()
            .handles
            .values()
            .filter(|handle| **handle == id)
            .count()
    }

    /// Platform ports that have not been closed.
    pub fn open_port_count(&self) -> usize {
        self.inner.state.lock().ports.len()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().listeners.len()
    }

    // ==================== Bluetooth ====================

    /// Registers a BLE-MIDI peripheral reachable by its Bluetooth address.
    pub fn add_peripheral(&self, info: DeviceInfo) {
        let Some(address) = info.bluetooth_address().map(str::to_string) else {
            debug!(device = info.id, "Ignoring peripheral without Bluetooth address");
            return;
        };
        self.inner.state.lock().peripherals.insert(
            address,
            Peripheral {
                info,
                gatt_supported: true,
            },
        );
    }

    /// Without GATT support `connect_gatt` returns nothing.
    pub fn set_gatt_supported(&self, address: &str, supported: bool) {
        if let Some(peripheral) = self.inner.state.lock().peripherals.get_mut(address) {
            peripheral.gatt_supported = supported;
        }
    }

    pub fn set_le_scanner_available(&self, available: bool) {
        self.inner.state.lock().no_le_scanner = !available;
    }

    pub fn scan_filter(&self) -> Option<ScanFilter> {
        self.inner
            .state
            .lock()
            .scan
            .as_ref()
            .map(|(filter, _)| filter.clone())
    }

    fn scan_callback(&self) -> Option<Arc<dyn ScanCallback>> {
        self.inner
            .state
            .lock()
            .scan
            .as_ref()
            .map(|(_, callback)| callback.clone())
    }

    pub fn advertise(&self, address: &str) {
        if let Some(callback) = self.scan_callback() {
            callback.on_scan_event(ScanEvent::Result {
                kind: ScanMatch::AllMatches,
                address: Some(address.to_string()),
            });
        }
    }

    pub fn lose_peripheral(&self, address: &str) {
        if let Some(callback) = self.scan_callback() {
            callback.on_scan_event(ScanEvent::Result {
                kind: ScanMatch::MatchLost,
                address: Some(address.to_string()),
            });
        }
    }

    fn latest_gatt(&self, address: &str) -> Option<Arc<VirtualGatt>> {
        self.inner
            .state
            .lock()
            .gatts
            .iter()
            .rev()
            .find(|gatt| gatt.address == address)
            .cloned()
    }

    /// Reports the newest GATT link for `address` as connected. False when
    /// there is no live link.
    pub fn complete_gatt_connection(&self, address: &str) -> bool {
        let Some(gatt) = self.latest_gatt(address) else {
            return false;
        };
        if gatt.closed.load(Ordering::SeqCst) {
            return false;
        }
        gatt.connected.store(true, Ordering::SeqCst);
        let callback = gatt.callback.clone();
        callback.on_gatt_event(GattEvent::ConnectionStateChanged {
            gatt,
            status: 0,
            state: GattState::Connected,
        });
        true
    }

    pub fn gatt_high_priority(&self, address: &str) -> bool {
        self.latest_gatt(address)
            .is_some_and(|gatt| gatt.high_priority.load(Ordering::SeqCst))
    }

    /// True when the newest GATT link for `address` was disconnected and closed.
    pub fn gatt_closed(&self, address: &str) -> bool {
        self.latest_gatt(address).is_some_and(|gatt| {
            gatt.closed.load(Ordering::SeqCst) && !gatt.connected.load(Ordering::SeqCst)
        })
    }
}

impl std::fmt::Debug for VirtualPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("VirtualPlatform")
            .field("num_devices", &state.devices.len())
            .field("num_peripherals", &state.peripherals.len())
            .field("num_open_handles", &state.handles.len())
            .finish()
    }
}

impl MidiPlatform for VirtualPlatform {
    fn is_available(&self) -> bool {
        !self.inner.state.lock().unavailable
    }

    fn devices(&self, transport: DeviceTransport) -> Vec<DeviceInfo> {
        self.inner
            .state
            .lock()
            .devices
            .values()
            .filter(|(_, transports)| transports.contains(&transport))
            .map(|(info, _)| info.clone())
            .collect()
    }

    fn register_device_callback(&self, callback: Arc<dyn DeviceCallback>) -> CallbackId {
        let id = CallbackId(self.inner.serial());
        self.inner.state.lock().callbacks.push((id, callback));
        id
    }

    fn unregister_device_callback(&self, id: CallbackId) {
        self.inner
            .state
            .lock()
            .callbacks
            .retain(|(registered, _)| *registered != id);
    }

    fn open_device(&self, info: &DeviceInfo, listener: Arc<dyn DeviceCallback>) -> Result<()> {
        let info = {
            let mut state = self.inner.state.lock();
            let Some((known, _)) = state.devices.get(&info.id) else {
                return Err(Error::MidiDevice(format!("no virtual device {}", info.id)));
            };
            let known = known.clone();
            state.open_requests += 1;
            if state.defer_opens {
                state.deferred.push(DeferredOpen {
                    info: known,
                    listener,
                });
                return Ok(());
            }
            known
        };

        let device = self.new_handle(info);
        listener.on_device_event(DeviceEvent::Opened(device));
        Ok(())
    }

    fn open_bluetooth_device(
        &self,
        address: &str,
        listener: Arc<dyn DeviceCallback>,
    ) -> Result<()> {
        let info = {
            let mut state = self.inner.state.lock();
            let Some(peripheral) = state.peripherals.get(address) else {
                return Err(Error::MidiDevice(format!(
                    "no Bluetooth MIDI peripheral at {address}"
                )));
            };
            let info = peripheral.info.clone();
            state.open_requests += 1;
            if state.defer_opens {
                state.deferred.push(DeferredOpen { info, listener });
                return Ok(());
            }
            info
        };

        let device = self.new_handle(info);
        listener.on_device_event(DeviceEvent::Opened(device));
        Ok(())
    }
}

impl BluetoothAdapter for VirtualPlatform {
    fn remote_device_name(&self, address: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .peripherals
            .get(address)
            .map(|peripheral| peripheral.info.display_name().to_string())
    }

    fn connect_gatt(
        &self,
        address: &str,
        callback: Arc<dyn GattCallback>,
    ) -> Option<Arc<dyn GattConnection>> {
        let mut state = self.inner.state.lock();
        let supported = state
            .peripherals
            .get(address)
            .is_some_and(|peripheral| peripheral.gatt_supported);
        if !supported {
            return None;
        }
        let gatt = Arc::new(VirtualGatt {
            address: address.to_string(),
            callback,
            connected: AtomicBool::new(false),
            high_priority: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        state.gatts.push(gatt.clone());
        Some(gatt)
    }

    fn le_scanner(&self) -> Option<Arc<dyn LeScanner>> {
        if self.inner.state.lock().no_le_scanner {
            return None;
        }
        Some(Arc::new(self.clone()))
    }
}

impl LeScanner for VirtualPlatform {
    fn start_scan(&self, filter: &ScanFilter, callback: Arc<dyn ScanCallback>) {
        self.inner.state.lock().scan = Some((filter.clone(), callback));
    }

    fn stop_scan(&self) {
        self.inner.state.lock().scan = None;
    }
}

// ============================================================================
// Handles
// ============================================================================

struct VirtualDevice {
    serial: u64,
    info: DeviceInfo,
    platform: Weak<VirtualInner>,
    closed: AtomicBool,
}

impl VirtualDevice {
    fn has_port(&self, direction: PortDirection, index: u32) -> bool {
        self.info
            .ports_in(direction)
            .any(|port| port.index == index)
    }

    fn open_port(&self, direction: PortDirection, index: u32) -> Option<(u64, Arc<VirtualInner>)> {
        if self.closed.load(Ordering::SeqCst) || !self.has_port(direction, index) {
            return None;
        }
        let platform = self.platform.upgrade()?;
        let serial = platform.serial();
        {
            let mut state = platform.state.lock();
            if state.fail_port_opens {
                return None;
            }
            state
                .ports
                .insert(serial, PortPath::new(self.info.id, direction, index));
        }
        Some((serial, platform))
    }
}

impl MidiDevice for VirtualDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn open_source_port(&self, index: u32) -> Option<Box<dyn SourcePort>> {
        let (serial, platform) = self.open_port(PortDirection::Input, index)?;
        Some(Box::new(VirtualSourcePort {
            serial,
            path: PortPath::input(self.info.id, index),
            platform: Arc::downgrade(&platform),
        }))
    }

    fn open_sink_port(&self, index: u32) -> Option<Box<dyn SinkPort>> {
        let (serial, platform) = self.open_port(PortDirection::Output, index)?;
        Some(Box::new(VirtualSinkPort {
            serial,
            path: PortPath::output(self.info.id, index),
            platform: Arc::downgrade(&platform),
        }))
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(platform) = self.platform.upgrade() {
            platform.state.lock().handles.remove(&self.serial);
        }
        Ok(())
    }
}

struct VirtualSourcePort {
    serial: u64,
    path: PortPath,
    platform: Weak<VirtualInner>,
}

impl SourcePort for VirtualSourcePort {
    fn port_index(&self) -> u32 {
        self.path.port_index
    }

    fn connect(&self, receiver: Arc<dyn MidiReceiver>) {
        if let Some(platform) = self.platform.upgrade() {
            platform.state.lock().listeners.push(Listener {
                port: self.serial,
                path: self.path,
                receiver,
            });
        }
    }

    fn disconnect(&self, receiver: &Arc<dyn MidiReceiver>) {
        if let Some(platform) = self.platform.upgrade() {
            platform.state.lock().listeners.retain(|listener| {
                listener.port != self.serial || !Arc::ptr_eq(&listener.receiver, receiver)
            });
        }
    }

    fn close(&self) -> io::Result<()> {
        let platform = self
            .platform
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "platform gone"))?;
        let mut state = platform.state.lock();
        state.listeners.retain(|listener| listener.port != self.serial);
        state.ports.remove(&self.serial);
        Ok(())
    }
}

struct VirtualSinkPort {
    serial: u64,
    path: PortPath,
    platform: Weak<VirtualInner>,
}

impl SinkPort for VirtualSinkPort {
    fn port_index(&self) -> u32 {
        self.path.port_index
    }

    fn send(&self, bytes: &[u8], _timestamp: u64) -> io::Result<()> {
        let platform = self
            .platform
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "platform gone"))?;
        let mut state = platform.state.lock();
        if state.fail_sends {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "virtual send failure"));
        }
        state.sent.push((self.path, bytes.to_vec()));
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        if let Some(platform) = self.platform.upgrade() {
            platform.state.lock().ports.remove(&self.serial);
        }
        Ok(())
    }
}

struct VirtualGatt {
    address: String,
    callback: Arc<dyn GattCallback>,
    connected: AtomicBool,
    high_priority: AtomicBool,
    closed: AtomicBool,
}

impl GattConnection for VirtualGatt {
    fn address(&self) -> &str {
        &self.address
    }

    fn request_high_priority(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        self.high_priority.store(true, Ordering::SeqCst);
        true
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// ManualScheduler
// ============================================================================

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_seq: u64,
    pending: Vec<(Duration, u64, Task)>,
}

/// Scheduler driven by an explicit virtual clock.
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Moves the clock forward by `by`, running every task that falls due in
    /// deadline order. Tasks scheduled while advancing run too if they fall
    /// inside the window.
    pub fn advance(&self, by: Duration) {
        let target = self.state.lock().now + by;
        loop {
            let task = {
                let mut state = self.state.lock();
                let next = state
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, (due, _, _))| *due <= target)
                    .min_by_key(|(_, (due, seq, _))| (*due, *seq))
                    .map(|(position, _)| position);
                match next {
                    Some(position) => {
                        let (due, _, task) = state.pending.swap_remove(position);
                        state.now = due;
                        task
                    }
                    None => {
                        state.now = target;
                        break;
                    }
                }
            };
            task();
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        let mut state = self.state.lock();
        let due = state.now + delay;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push((due, seq, task));
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualScheduler")
            .field("now", &state.now)
            .field("pending", &state.pending.len())
            .finish()
    }
}
