//! Device Registry
//!
//! Single source of truth for confirmed devices and open ports. Platform
//! callbacks, timer firings and host calls all land here from unrelated
//! threads; one mutex guards every table. The confirmed device list is also
//! published through arc-swap so port listings read an immutable snapshot.
//!
//! The lock is never held while closing a port handle, closing a platform
//! device, tearing down a GATT link, asking the platform to open a device, or
//! notifying observers. Port handles re-enter the registry on close, so bulk
//! closes scan for one entry, act on it, and rescan. Opening a port is the one
//! platform call made under the lock, which keeps port ownership exclusive.

mod open_task;
mod pairing;

use open_task::OpenTask;

use crate::port::{InputPortShared, MidiInputPort, MidiOutputPort, OpenPort, OutputPortShared};
use andromidi_core::{
    CallbackId, DeviceCallback, DeviceEvent, DeviceId, DeviceInfo, DeviceListChange,
    DeviceListObserver, DeviceSummary, DeviceTransport, Error, GattCallback, GattConnection,
    GattEvent, MidiDevice, MidiPlatform, MidiReceiver, PortDirection, PortId, PortInfo, PortPath,
    RegistryConfig, Result, Scheduler,
};
use andromidi_core::{BluetoothAdapter, BluetoothStatus};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

// ============================================================================
// Records and tables
// ============================================================================

/// A confirmed device.
pub(crate) struct DeviceRecord {
    device: Arc<dyn MidiDevice>,
    gatt: Mutex<Option<Arc<dyn GattConnection>>>,
    transport: DeviceTransport,
}

impl DeviceRecord {
    fn new(
        device: Arc<dyn MidiDevice>,
        gatt: Option<Arc<dyn GattConnection>>,
        transport: DeviceTransport,
    ) -> Self {
        Self {
            device,
            gatt: Mutex::new(gatt),
            transport,
        }
    }

    pub(crate) fn device(&self) -> &dyn MidiDevice {
        &*self.device
    }

    fn info(&self) -> &DeviceInfo {
        self.device.info()
    }

    fn id(&self) -> DeviceId {
        self.info().id
    }

    fn summary(&self) -> DeviceSummary {
        DeviceSummary::from_info(self.info(), self.transport)
    }

    /// Hands back `gatt` if the record already owns one.
    fn attach_gatt(&self, gatt: Arc<dyn GattConnection>) -> Option<Arc<dyn GattConnection>> {
        let mut slot = self.gatt.lock();
        if slot.is_some() {
            return Some(gatt);
        }
        *slot = Some(gatt);
        None
    }

    fn close_gatt(&self) {
        let gatt = self.gatt.lock().take();
        if let Some(gatt) = gatt {
            close_gatt(&*gatt);
        }
    }

    fn close(&self) {
        self.close_gatt();
        close_device(&*self.device);
    }
}

#[derive(Default)]
struct Tables {
    open_ports: HashMap<PortPath, Weak<dyn OpenPort>>,
    open_tasks: HashMap<DeviceId, Arc<OpenTask>>,
    /// Bluetooth address -> GATT link while the handshake is in flight.
    pairing: HashMap<String, Option<Arc<dyn GattConnection>>>,
    transports: HashMap<DeviceId, DeviceTransport>,
    callback_id: Option<CallbackId>,
    torn_down: bool,
}

pub(crate) fn close_gatt(gatt: &dyn GattConnection) {
    gatt.disconnect();
    gatt.close();
}

pub(crate) fn close_device(device: &dyn MidiDevice) {
    if let Err(e) = device.close() {
        debug!(device = device.info().id, "IO error while closing MIDI device: {}", e);
    }
}

#[inline]
fn same_object<T: ?Sized, U: ?Sized>(a: *const T, b: *const U) -> bool {
    a as *const () == b as *const ()
}

// ============================================================================
// Platform callback ingress
// ============================================================================

/// Registered with the platform in place of the registry itself so the
/// platform never keeps the registry alive.
struct RegistryCallback {
    registry: Weak<RegistryInner>,
}

impl DeviceCallback for RegistryCallback {
    fn on_device_event(&self, event: DeviceEvent) {
        match self.registry.upgrade() {
            Some(registry) => registry.handle_device_event(event),
            None => {
                if let DeviceEvent::Opened(device) = event {
                    close_device(&*device);
                }
            }
        }
    }
}

impl GattCallback for RegistryCallback {
    fn on_gatt_event(&self, event: GattEvent) {
        match self.registry.upgrade() {
            Some(registry) => registry.handle_gatt_event(event),
            None => match event {
                GattEvent::ConnectionStateChanged { gatt, .. } => close_gatt(&*gatt),
            },
        }
    }
}

// ============================================================================
// RegistryInner
// ============================================================================

pub(crate) struct RegistryInner {
    platform: Arc<dyn MidiPlatform>,
    bluetooth: Option<Arc<dyn BluetoothAdapter>>,
    scheduler: Arc<dyn Scheduler>,
    config: RegistryConfig,
    callback: Arc<RegistryCallback>,
    observers: RwLock<Vec<Arc<dyn DeviceListObserver>>>,
    /// Replaced only while `tables` is locked.
    devices: ArcSwap<Vec<Arc<DeviceRecord>>>,
    tables: Mutex<Tables>,
}

impl RegistryInner {
    fn device_listener(&self) -> Arc<dyn DeviceCallback> {
        self.callback.clone()
    }

    fn gatt_listener(&self) -> Arc<dyn GattCallback> {
        self.callback.clone()
    }

    fn find_device(&self, id: DeviceId) -> Option<Arc<DeviceRecord>> {
        self.devices
            .load()
            .iter()
            .find(|record| record.id() == id)
            .cloned()
    }

    fn find_device_for_address(&self, address: &str) -> Option<Arc<DeviceRecord>> {
        self.devices
            .load()
            .iter()
            .find(|record| record.info().bluetooth_address() == Some(address))
            .cloned()
    }

    /// Copy-on-write update of the published device list. Requires the table lock.
    fn update_devices(&self, _locked: &Tables, update: impl FnOnce(&mut Vec<Arc<DeviceRecord>>)) {
        let mut next = (**self.devices.load()).clone();
        update(&mut next);
        self.devices.store(Arc::new(next));
    }

    fn notify(&self, change: DeviceListChange) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.on_device_list_changed(&change);
        }
    }

    // ==================== Lifecycle ====================

    fn initialize(&self) {
        if self.tables.lock().callback_id.is_some() {
            return;
        }

        let mut seen = HashSet::new();
        for transport in [DeviceTransport::Ump, DeviceTransport::ByteStream] {
            for info in self.platform.devices(transport) {
                if seen.insert(info.id) {
                    self.on_device_added(info, transport);
                }
            }
        }

        let callback_id = self.platform.register_device_callback(self.device_listener());
        let mut tables = self.tables.lock();
        if tables.torn_down {
            drop(tables);
            self.platform.unregister_device_callback(callback_id);
            return;
        }
        tables.callback_id = Some(callback_id);
        debug!("MIDI device registry initialized with {} known devices", seen.len());
    }

    fn teardown(&self) {
        let (callback_id, tasks, ports, pairing, records) = {
            let mut tables = self.tables.lock();
            if tables.torn_down {
                return;
            }
            tables.torn_down = true;
            tables.transports.clear();

            let tasks: Vec<_> = tables.open_tasks.drain().map(|(_, task)| task).collect();
            let ports: Vec<_> = tables
                .open_ports
                .drain()
                .filter_map(|(_, port)| port.upgrade())
                .collect();
            let pairing: Vec<_> = tables.pairing.drain().filter_map(|(_, gatt)| gatt).collect();
            let records = self.devices.swap(Arc::new(Vec::new()));
            (tables.callback_id.take(), tasks, ports, pairing, records)
        };

        if let Some(id) = callback_id {
            self.platform.unregister_device_callback(id);
        }
        for task in tasks {
            task.cancel();
        }
        for port in ports {
            port.close();
        }
        for gatt in pairing {
            close_gatt(&*gatt);
        }
        for record in records.iter() {
            record.close();
        }
        debug!("MIDI device registry torn down");
    }

    // ==================== Device events ====================

    fn handle_device_event(self: &Arc<Self>, event: DeviceEvent) {
        match event {
            DeviceEvent::Added { info, transport } => self.on_device_added(info, transport),
            DeviceEvent::Removed { id } => self.on_device_removed(id),
            DeviceEvent::Opened(device) => self.on_device_opened(device),
        }
    }

    fn on_device_added(&self, info: DeviceInfo, transport: DeviceTransport) {
        {
            let mut tables = self.tables.lock();
            if tables.torn_down {
                return;
            }
            tables.transports.insert(info.id, transport);
        }

        // Bluetooth devices come in through pairing
        if info.is_bluetooth() {
            debug!(device = info.id, "Not auto-opening Bluetooth MIDI device");
            return;
        }

        if let Err(e) = self.platform.open_device(&info, self.device_listener()) {
            warn!(device = info.id, "Failed to request MIDI device open: {}", e);
        }
    }

    fn on_device_opened(self: &Arc<Self>, device: Arc<dyn MidiDevice>) {
        let info = device.info();
        let id = info.id;
        let bluetooth = info.is_bluetooth();

        let task = {
            let mut tables = self.tables.lock();
            let task = if tables.torn_down {
                None
            } else if let Some(pending) = tables.open_tasks.get(&id) {
                if pending.holds(&device) {
                    return;
                }
                debug!(device = id, "Device is already being opened, dropping duplicate");
                None
            } else if self.find_device(id).is_some() {
                debug!(device = id, "Device already confirmed, dropping duplicate open");
                None
            } else if bluetooth {
                match info.bluetooth_address() {
                    Some(address) => match tables.pairing.remove(address) {
                        Some(gatt) => {
                            let transport = tables.transports.get(&id).copied().unwrap_or_default();
                            Some(Arc::new(OpenTask::new(device.clone(), gatt, transport)))
                        }
                        None => {
                            debug!(device = id, address, "Bluetooth device opened without pairing");
                            None
                        }
                    },
                    None => {
                        warn!(device = id, "Bluetooth device has no address");
                        None
                    }
                }
            } else {
                match tables.transports.get(&id).copied() {
                    Some(transport) => Some(Arc::new(OpenTask::new(device.clone(), None, transport))),
                    None => {
                        debug!(device = id, "Device was removed before its open completed");
                        None
                    }
                }
            };

            if let Some(task) = &task {
                tables.open_tasks.insert(id, task.clone());
            }
            task
        };

        let Some(task) = task else {
            close_device(&*device);
            return;
        };

        let delay = self.config.open_delay(bluetooth);
        debug!(device = id, ?delay, "Scheduling MIDI device confirmation");
        let registry = Arc::downgrade(self);
        self.scheduler.schedule(
            delay,
            Box::new(move || match registry.upgrade() {
                Some(registry) => registry.on_device_opened_delayed(&task),
                None => {
                    task.cancel();
                }
            }),
        );
    }

    fn on_device_opened_delayed(&self, task: &Arc<OpenTask>) {
        let id = task.device_id();

        let promoted = {
            let mut tables = self.tables.lock();
            let registered = tables
                .open_tasks
                .get(&id)
                .is_some_and(|pending| Arc::ptr_eq(pending, task));

            if !registered || tables.torn_down {
                None
            } else {
                tables.open_tasks.remove(&id);
                if self.find_device(id).is_some() {
                    debug!(device = id, "Device already confirmed");
                    None
                } else {
                    task.take().map(|(device, gatt)| {
                        let record = Arc::new(DeviceRecord::new(device, gatt, task.transport()));
                        let summary = record.summary();
                        self.update_devices(&tables, |devices| devices.push(record));
                        summary
                    })
                }
            }
        };

        match promoted {
            Some(summary) => {
                info!(device = id, name = %summary.name, "MIDI device confirmed");
                self.notify(DeviceListChange::Added(summary));
            }
            None => {
                // Unpaired, removed or duplicated while waiting
                task.cancel();
            }
        }
    }

    fn on_device_removed(&self, id: DeviceId) {
        let (task, record) = {
            let mut tables = self.tables.lock();
            tables.transports.remove(&id);
            let task = tables.open_tasks.remove(&id);
            let record = self.find_device(id);
            if record.is_some() {
                self.update_devices(&tables, |devices| devices.retain(|r| r.id() != id));
            }
            (task, record)
        };

        if let Some(task) = task {
            debug!(device = id, "Cancelling pending open of removed device");
            task.cancel();
        }

        let Some(record) = record else {
            return;
        };

        self.close_ports_for_device(id);
        record.close();
        info!(device = id, "MIDI device removed");
        self.notify(DeviceListChange::Removed(id));
    }

    fn close_ports_for_device(&self, id: DeviceId) {
        loop {
            let port = {
                let mut tables = self.tables.lock();
                let Some(path) = tables.open_ports.keys().find(|p| p.device_id == id).copied()
                else {
                    break;
                };
                tables.open_ports.remove(&path).and_then(|port| port.upgrade())
            };
            if let Some(port) = port {
                debug!(path = %port.path(), "Closing port of removed device");
                port.close();
            }
        }
    }

    // ==================== Ports ====================

    fn list_ports(&self, direction: PortDirection) -> Vec<PortInfo> {
        let devices = self.devices.load_full();
        let mut ports = Vec::new();

        for record in devices.iter() {
            let info = record.info();
            for (position, port) in info.ports_in(direction).enumerate() {
                let path = PortPath::new(info.id, direction, port.index);
                match PortId::try_from(path) {
                    Ok(id) => ports.push(PortInfo {
                        id,
                        path,
                        name: info.port_display_name(port, position + 1),
                    }),
                    Err(e) => warn!(%path, "Skipping MIDI port: {}", e),
                }
            }
        }
        ports
    }

    fn open_port<P, F>(self: &Arc<Self>, id: PortId, direction: PortDirection, open: F) -> Result<Arc<P>>
    where
        P: OpenPort + 'static,
        F: FnOnce(&DeviceRecord, PortPath, Weak<RegistryInner>) -> Option<Arc<P>>,
    {
        let path = self
            .list_ports(direction)
            .into_iter()
            .find(|port| port.id == id)
            .map(|port| port.path)
            .ok_or(Error::UnknownPort(id))?;

        let mut tables = self.tables.lock();
        if tables.torn_down {
            return Err(Error::TornDown);
        }
        if let Some(existing) = tables.open_ports.get(&path) {
            if existing.strong_count() > 0 {
                debug!(%path, "MIDI port already open");
                return Err(Error::PortInUse(path));
            }
        }
        let record = self.find_device(path.device_id).ok_or(Error::UnknownPort(id))?;

        let Some(port) = open(&*record, path, Arc::downgrade(self)) else {
            warn!(%path, "Platform failed to open MIDI port");
            return Err(Error::PortOpenFailed(path));
        };

        let entry: Arc<dyn OpenPort> = port.clone();
        tables.open_ports.insert(path, Arc::downgrade(&entry));
        debug!(%path, "Opened MIDI port");
        Ok(port)
    }

    fn open_input(
        self: &Arc<Self>,
        id: PortId,
        receiver: Arc<dyn MidiReceiver>,
    ) -> Result<Arc<InputPortShared>> {
        self.open_port(id, PortDirection::Input, |record, path, owner| {
            let port = record.device().open_source_port(path.port_index)?;
            Some(Arc::new(InputPortShared::new(path, id, owner, port, receiver)))
        })
    }

    fn open_output(self: &Arc<Self>, id: PortId) -> Result<Arc<OutputPortShared>> {
        self.open_port(id, PortDirection::Output, |record, path, owner| {
            let port = record.device().open_sink_port(path.port_index)?;
            Some(Arc::new(OutputPortShared::new(path, id, owner, port)))
        })
    }

    fn remove_port(&self, path: &PortPath) {
        self.tables.lock().open_ports.remove(path);
    }

    /// Deregisters `path` only if it is still bound to `port`.
    pub(crate) fn release_port(&self, path: &PortPath, port: *const ()) {
        let mut tables = self.tables.lock();
        let owned = tables
            .open_ports
            .get(path)
            .is_some_and(|entry| same_object(entry.as_ptr(), port));
        if owned {
            tables.open_ports.remove(path);
        }
    }
}

// ============================================================================
// DeviceRegistry - public handle
// ============================================================================

/// Owns every known device, pending open and open port.
///
/// Not `Clone`: the registry has one owner, and dropping it tears everything
/// down. Platform callbacks, timer tasks and port handles only hold weak links.
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new(
        platform: Arc<dyn MidiPlatform>,
        bluetooth: Option<Arc<dyn BluetoothAdapter>>,
        scheduler: Arc<dyn Scheduler>,
        config: RegistryConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|registry| RegistryInner {
            platform,
            bluetooth,
            scheduler,
            config,
            callback: Arc::new(RegistryCallback {
                registry: registry.clone(),
            }),
            observers: RwLock::new(Vec::new()),
            devices: ArcSwap::from_pointee(Vec::new()),
            tables: Mutex::new(Tables::default()),
        });
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn add_observer(&self, observer: Arc<dyn DeviceListObserver>) {
        self.inner.observers.write().push(observer);
    }

    /// Feeds already-present devices through the device-added path, then
    /// subscribes to live notifications. Calling it again is a no-op.
    pub fn initialize(&self) {
        self.inner.initialize();
    }

    /// Every port of `direction` on every confirmed device.
    pub fn list_ports(&self, direction: PortDirection) -> Vec<PortInfo> {
        self.inner.list_ports(direction)
    }

    pub fn list_input_ports(&self) -> Vec<PortInfo> {
        self.list_ports(PortDirection::Input)
    }

    pub fn list_output_ports(&self) -> Vec<PortInfo> {
        self.list_ports(PortDirection::Output)
    }

    pub fn devices(&self) -> Vec<DeviceSummary> {
        self.inner
            .devices
            .load()
            .iter()
            .map(|record| record.summary())
            .collect()
    }

    /// Opens an input port; incoming non-empty messages go to `receiver` once
    /// the handle is started.
    pub fn open_input(&self, id: PortId, receiver: Arc<dyn MidiReceiver>) -> Result<MidiInputPort> {
        self.inner
            .open_input(id, receiver)
            .map(MidiInputPort::from_shared)
    }

    pub fn open_output(&self, id: PortId) -> Result<MidiOutputPort> {
        self.inner.open_output(id).map(MidiOutputPort::from_shared)
    }

    /// Forgets the open port bound to `path`. Handles call this on close.
    pub fn remove_port(&self, path: &PortPath) {
        self.inner.remove_port(path);
    }

    pub fn open_port_count(&self) -> usize {
        self.inner
            .tables
            .lock()
            .open_ports
            .values()
            .filter(|port| port.strong_count() > 0)
            .count()
    }

    pub fn bluetooth_status(&self, address: &str) -> BluetoothStatus {
        self.inner.bluetooth_status(address)
    }

    /// Starts pairing a Bluetooth MIDI peripheral. False when the address is
    /// empty, pairing is unsupported, or the address is already pairing or paired.
    pub fn pair(&self, address: &str) -> bool {
        self.inner.pair(address)
    }

    /// Drops every trace of `address`: handshake, pending open, confirmed device.
    pub fn unpair(&self, address: &str) {
        self.inner.unpair(address);
    }

    pub fn handle_device_event(&self, event: DeviceEvent) {
        self.inner.handle_device_event(event);
    }

    pub fn handle_gatt_event(&self, event: GattEvent) {
        self.inner.handle_gatt_event(event);
    }

    /// Unsubscribes, cancels pending opens, closes ports and devices. Runs once.
    pub fn teardown(&self) {
        self.inner.teardown();
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.inner.tables.lock();
        f.debug_struct("DeviceRegistry")
            .field("num_devices", &self.inner.devices.load().len())
            .field("num_open_ports", &tables.open_ports.len())
            .field("num_open_tasks", &tables.open_tasks.len())
            .field("num_pairing", &tables.pairing.len())
            .finish()
    }
}
