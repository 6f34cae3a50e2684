//! Integration tests for andromidi-io.
//!
//! Everything runs against the virtual platform. Confirmation delays are
//! driven by a manual scheduler unless a test is about the timer thread.

#![cfg(feature = "virtual")]

use andromidi_io::{
    BluetoothStatus, DeviceInfo, DeviceKind, DeviceListChange, DeviceTransport, Error,
    ManualScheduler, MidiDeviceSystem, MidiReceiver, PortDirection, PortId, PortPath,
    RegistryConfig, VirtualPlatform,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const WIRED_DELAY: Duration = Duration::from_millis(100);
const BLUETOOTH_DELAY: Duration = Duration::from_millis(2000);
const BLE_ADDRESS: &str = "D4:3B:04:11:22:33";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct Fixture {
    platform: VirtualPlatform,
    scheduler: Arc<ManualScheduler>,
    changes: Arc<Mutex<Vec<DeviceListChange>>>,
    system: MidiDeviceSystem,
}

impl Fixture {
    fn new() -> Self {
        init_tracing();
        let platform = VirtualPlatform::new();
        let scheduler = Arc::new(ManualScheduler::new());
        let changes = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&changes);

        let system = MidiDeviceSystem::builder()
            .platform(Arc::new(platform.clone()))
            .bluetooth(Arc::new(platform.clone()))
            .scheduler(scheduler.clone())
            .observer(Arc::new(move |change: &DeviceListChange| {
                recorder.lock().push(change.clone());
            }))
            .build()
            .unwrap();

        Self {
            platform,
            scheduler,
            changes,
            system,
        }
    }

    fn changes(&self) -> Vec<DeviceListChange> {
        self.changes.lock().clone()
    }

    fn add_confirmed(&self, info: DeviceInfo) {
        self.platform.add_device(info);
        self.scheduler.advance(WIRED_DELAY);
    }

    fn output_id(&self, device: i32, index: u32) -> PortId {
        PortPath::output(device, index).id().unwrap()
    }

    fn input_id(&self, device: i32, index: u32) -> PortId {
        PortPath::input(device, index).id().unwrap()
    }
}

fn interface(id: i32) -> DeviceInfo {
    DeviceInfo::new(id, DeviceKind::Usb)
        .with_name("MIDI Interface")
        .with_manufacturer("Acme")
        .with_port(PortDirection::Input, 0, "")
        .with_port(PortDirection::Output, 0, "")
        .with_port(PortDirection::Output, 1, "Thru")
}

fn ble_keys() -> DeviceInfo {
    DeviceInfo::new(60, DeviceKind::Bluetooth)
        .with_name("BLE Keys")
        .with_bluetooth_address(BLE_ADDRESS)
        .with_port(PortDirection::Input, 0, "")
        .with_port(PortDirection::Output, 0, "")
}

fn collecting_receiver() -> (Arc<dyn MidiReceiver>, Arc<Mutex<Vec<(Vec<u8>, u64)>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let receiver: Arc<dyn MidiReceiver> = Arc::new(move |bytes: &[u8], timestamp: u64| {
        sink.lock().push((bytes.to_vec(), timestamp));
    });
    (receiver, received)
}

// ---------------------------------------------------------------------------
// 1. Exclusive port ownership
// ---------------------------------------------------------------------------

#[test]
fn test_second_open_fails_until_close() {
    let fx = Fixture::new();
    fx.add_confirmed(interface(1));
    let id = fx.output_id(1, 0);

    let first = fx.system.open_output(id).unwrap();
    let second = fx.system.open_output(id);
    assert!(matches!(second, Err(Error::PortInUse(path)) if path == PortPath::output(1, 0)));

    first.close();
    let reopened = fx.system.open_output(id).unwrap();
    assert!(reopened.is_open());
}

#[test]
fn test_drop_frees_port() {
    let fx = Fixture::new();
    fx.add_confirmed(interface(1));
    let id = fx.input_id(1, 0);
    let (receiver, _) = collecting_receiver();

    let port = fx.system.open_input(id, receiver.clone()).unwrap();
    drop(port);
    assert!(fx.system.open_input(id, receiver).is_ok());
}

#[test]
fn test_directions_and_indices_are_independent() {
    let fx = Fixture::new();
    fx.add_confirmed(interface(1));
    let (receiver, _) = collecting_receiver();

    let _input = fx.system.open_input(fx.input_id(1, 0), receiver).unwrap();
    let _out0 = fx.system.open_output(fx.output_id(1, 0)).unwrap();
    let _out1 = fx.system.open_output(fx.output_id(1, 1)).unwrap();
    assert_eq!(fx.system.registry().open_port_count(), 3);
}

#[test]
fn test_remove_port_forgets_binding() {
    let fx = Fixture::new();
    fx.add_confirmed(interface(1));
    let id = fx.output_id(1, 0);

    let port = fx.system.open_output(id).unwrap();
    fx.system.registry().remove_port(&port.path());
    assert_eq!(fx.system.registry().open_port_count(), 0);

    // The old handle closing later must not evict the new owner
    let replacement = fx.system.open_output(id).unwrap();
    port.close();
    assert_eq!(fx.system.registry().open_port_count(), 1);
    assert!(replacement.is_open());
}

// ---------------------------------------------------------------------------
// 2. Idempotent close
// ---------------------------------------------------------------------------

#[test]
fn test_close_twice_then_drop() {
    let fx = Fixture::new();
    fx.add_confirmed(interface(1));

    let port = fx.system.open_output(fx.output_id(1, 1)).unwrap();
    assert_eq!(fx.platform.open_port_count(), 1);

    port.close();
    port.close();
    drop(port);
    assert_eq!(fx.platform.open_port_count(), 0);
    assert_eq!(fx.system.registry().open_port_count(), 0);
}

#[test]
fn test_close_disconnects_running_input() {
    let fx = Fixture::new();
    fx.add_confirmed(interface(1));
    let (receiver, _) = collecting_receiver();

    let port = fx.system.open_input(fx.input_id(1, 0), receiver).unwrap();
    port.start();
    assert_eq!(fx.platform.listener_count(), 1);

    port.close();
    assert!(!port.is_active());
    assert_eq!(fx.platform.listener_count(), 0);
    port.start();
    assert!(!port.is_active());
}

// ---------------------------------------------------------------------------
// 3. Debounce: removal before confirmation
// ---------------------------------------------------------------------------

#[test]
fn test_removed_before_timer_never_listed() {
    let fx = Fixture::new();
    fx.platform.add_device(interface(2));
    assert_eq!(fx.platform.open_device_handles(2), 1);

    fx.scheduler.advance(WIRED_DELAY / 2);
    fx.platform.remove_device(2);
    assert_eq!(fx.platform.open_device_handles(2), 0);

    fx.scheduler.advance(WIRED_DELAY);
    assert!(fx.system.list_output_ports().is_empty());
    assert!(fx.system.devices().is_empty());
    assert!(fx.changes().is_empty());
}

#[test]
fn test_removed_before_open_answer_closes_late_device() {
    let fx = Fixture::new();
    fx.platform.set_defer_opens(true);
    fx.platform.add_device(interface(3));
    fx.platform.remove_device(3);

    assert_eq!(fx.platform.complete_pending_opens(), 1);
    assert_eq!(fx.platform.open_device_handles(3), 0);
    assert_eq!(fx.scheduler.pending(), 0);
}

#[test]
fn test_readded_device_gets_fresh_delay() {
    let fx = Fixture::new();
    fx.platform.add_device(interface(4));
    fx.platform.remove_device(4);
    fx.scheduler.advance(WIRED_DELAY / 2);
    fx.platform.add_device(interface(4));

    // The first task fires at 100ms and must not promote the second open
    fx.scheduler.advance(WIRED_DELAY / 2);
    assert!(fx.system.devices().is_empty());

    fx.scheduler.advance(WIRED_DELAY / 2);
    assert_eq!(fx.system.devices().len(), 1);
    assert_eq!(fx.platform.open_device_handles(4), 1);
}

#[test]
fn test_duplicate_open_answer_is_closed() {
    let fx = Fixture::new();
    fx.platform.add_device(interface(5));
    assert!(fx.platform.deliver_opened(5));
    assert_eq!(fx.platform.open_device_handles(5), 1);

    fx.scheduler.advance(WIRED_DELAY);
    assert!(fx.platform.deliver_opened(5));
    assert_eq!(fx.platform.open_device_handles(5), 1);
    assert_eq!(fx.system.devices().len(), 1);
}

// ---------------------------------------------------------------------------
// 4. Unpair without state
// ---------------------------------------------------------------------------

#[test]
fn test_unpair_unknown_address_is_silent() {
    let fx = Fixture::new();
    fx.add_confirmed(interface(1));

    fx.system.registry().unpair("11:22:33:44:55:66");
    fx.system.registry().unpair("");
    assert_eq!(fx.changes().len(), 1);
    assert_eq!(fx.system.devices().len(), 1);
    assert_eq!(
        fx.system.registry().bluetooth_status("11:22:33:44:55:66"),
        BluetoothStatus::Unpaired
    );
}

// ---------------------------------------------------------------------------
// 5. Identifier round-trip
// ---------------------------------------------------------------------------

#[test]
fn test_listed_ids_round_trip() {
    let fx = Fixture::new();
    fx.add_confirmed(interface(1));
    fx.add_confirmed(
        DeviceInfo::new(2, DeviceKind::Virtual)
            .with_port(PortDirection::Input, 128, "")
            .with_port(PortDirection::Input, 200, ""),
    );

    let ports: Vec<_> = fx
        .system
        .list_input_ports()
        .into_iter()
        .chain(fx.system.list_output_ports())
        .collect();
    assert_eq!(ports.len(), 5);
    for port in &ports {
        assert_eq!(port.id.path(), port.path);
        assert_eq!(PortId::try_from(port.path).unwrap(), port.id);
    }

    let mut ids: Vec<_> = ports.iter().map(|port| port.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);
}

#[test]
fn test_unknown_id_rejected() {
    let fx = Fixture::new();
    fx.add_confirmed(interface(1));

    let missing = PortPath::output(1, 9).id().unwrap();
    assert!(matches!(fx.system.open_output(missing), Err(Error::UnknownPort(id)) if id == missing));

    // An input id is not an output port
    let input = fx.input_id(1, 0);
    assert!(matches!(fx.system.open_output(input), Err(Error::UnknownPort(_))));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_every_listed_port_round_trips(
        device_id in any::<i32>(),
        indices in proptest::collection::btree_set(0u32..100_000, 1..8),
    ) {
        let platform = VirtualPlatform::new();
        let scheduler = Arc::new(ManualScheduler::new());
        let system = MidiDeviceSystem::builder()
            .platform(Arc::new(platform.clone()))
            .scheduler(scheduler.clone())
            .build()
            .unwrap();

        let mut info = DeviceInfo::new(device_id, DeviceKind::Usb);
        for index in &indices {
            info = info.with_port(PortDirection::Output, *index, "");
        }
        platform.add_device(info);
        scheduler.advance(WIRED_DELAY);

        let ports = system.list_output_ports();
        prop_assert_eq!(ports.len(), indices.len());
        for port in ports {
            prop_assert_eq!(port.id.path(), port.path);
            prop_assert!(indices.contains(&port.path.port_index));
            let handle = system.open_output(port.id);
            prop_assert!(handle.is_ok());
        }
    }
}

// ---------------------------------------------------------------------------
// 6. Wired device lifecycle
// ---------------------------------------------------------------------------

#[test]
fn test_wired_device_lifecycle() {
    let fx = Fixture::new();
    fx.platform.add_device(interface(7));
    assert!(fx.system.list_output_ports().is_empty());

    fx.scheduler.advance(WIRED_DELAY - Duration::from_millis(1));
    assert!(fx.system.list_output_ports().is_empty());

    fx.scheduler.advance(Duration::from_millis(1));
    let outputs = fx.system.list_output_ports();
    let names: Vec<_> = outputs.iter().map(|port| port.name.as_str()).collect();
    assert_eq!(names, vec!["MIDI Interface Out 1", "MIDI Interface Thru"]);

    let changes = fx.changes();
    assert_eq!(changes.len(), 1);
    let DeviceListChange::Added(summary) = &changes[0] else {
        panic!("expected Added, got {:?}", changes[0]);
    };
    assert_eq!(summary.id, 7);
    assert_eq!(summary.manufacturer.as_deref(), Some("Acme"));
    assert_eq!(summary.output_port_names, vec!["".to_string(), "Thru".to_string()]);

    let port = fx.system.open_output(outputs[0].id).unwrap();
    fx.platform.remove_device(7);
    assert!(!port.is_open());
    assert!(fx.system.list_output_ports().is_empty());
    assert_eq!(fx.platform.open_device_handles(7), 0);
    assert_eq!(fx.changes().last(), Some(&DeviceListChange::Removed(7)));
}

#[test]
fn test_existing_devices_found_at_startup() {
    init_tracing();
    let platform = VirtualPlatform::new();
    platform.add_device_with_transport(interface(1), DeviceTransport::Ump);
    platform.add_device(interface(2));
    // Bluetooth devices are never auto-opened
    platform.add_device(ble_keys());

    let scheduler = Arc::new(ManualScheduler::new());
    let system = MidiDeviceSystem::builder()
        .platform(Arc::new(platform.clone()))
        .scheduler(scheduler.clone())
        .build()
        .unwrap();
    scheduler.advance(WIRED_DELAY);

    let mut devices = system.devices();
    devices.sort_by_key(|device| device.id);
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].transport, DeviceTransport::Ump);
    assert_eq!(devices[1].transport, DeviceTransport::ByteStream);
    assert_eq!(platform.open_request_count(), 2);
}

#[test]
fn test_message_flow() {
    let fx = Fixture::new();
    fx.add_confirmed(interface(1));
    let (receiver, received) = collecting_receiver();

    let input = fx.system.open_input(fx.input_id(1, 0), receiver).unwrap();
    fx.platform.inject(PortPath::input(1, 0), &[0x90, 60, 100], 1);
    assert!(received.lock().is_empty());

    input.start();
    input.start();
    assert!(input.is_active());
    assert_eq!(fx.platform.listener_count(), 1);
    fx.platform.inject(PortPath::input(1, 0), &[0x90, 60, 100], 2);
    fx.platform.inject(PortPath::input(1, 0), &[], 3);
    fx.platform.inject(PortPath::input(1, 0), &[0x80, 60, 0], 4);

    input.stop();
    input.stop();
    fx.platform.inject(PortPath::input(1, 0), &[0xF8], 5);

    assert_eq!(
        *received.lock(),
        vec![(vec![0x90, 60, 100], 2), (vec![0x80, 60, 0], 4)]
    );

    let output = fx.system.open_output(fx.output_id(1, 1)).unwrap();
    output.send_midi(&[0xB0, 7, 127]);
    output.send_midi_at(&[0xB0, 7, 0], 1_000_000);
    assert_eq!(
        fx.platform.sent(PortPath::output(1, 1)),
        vec![vec![0xB0, 7, 127], vec![0xB0, 7, 0]]
    );
}

#[test]
fn test_output_send_failure_is_swallowed() {
    let fx = Fixture::new();
    fx.add_confirmed(interface(1));
    let output = fx.system.open_output(fx.output_id(1, 0)).unwrap();

    fx.platform.set_fail_sends(true);
    output.send_midi(&[0x90, 60, 100]);
    assert!(output.is_open());

    fx.platform.set_fail_sends(false);
    output.send_midi(&[0x80, 60, 0]);
    assert_eq!(fx.platform.sent(PortPath::output(1, 0)), vec![vec![0x80, 60, 0]]);
}

#[test]
fn test_platform_port_failure() {
    let fx = Fixture::new();
    fx.add_confirmed(interface(1));

    fx.platform.set_fail_port_opens(true);
    let id = fx.output_id(1, 0);
    assert!(matches!(fx.system.open_output(id), Err(Error::PortOpenFailed(_))));

    fx.platform.set_fail_port_opens(false);
    assert!(fx.system.open_output(id).is_ok());
}

// ---------------------------------------------------------------------------
// 7. Bluetooth pairing lifecycle
// ---------------------------------------------------------------------------

#[test]
fn test_bluetooth_lifecycle() {
    let fx = Fixture::new();
    fx.platform.add_peripheral(ble_keys());
    let registry = fx.system.registry();
    let bluetooth = fx.system.bluetooth().unwrap();

    bluetooth.start_stop_scan(true);
    fx.platform.advertise(BLE_ADDRESS);
    assert_eq!(bluetooth.midi_bluetooth_addresses(), vec![BLE_ADDRESS]);
    assert_eq!(bluetooth.bluetooth_status(BLE_ADDRESS), BluetoothStatus::Unpaired);

    assert!(bluetooth.pair(BLE_ADDRESS));
    assert_eq!(registry.bluetooth_status(BLE_ADDRESS), BluetoothStatus::Pairing);
    assert!(!bluetooth.pair(BLE_ADDRESS));

    assert!(fx.platform.complete_gatt_connection(BLE_ADDRESS));
    assert!(fx.platform.gatt_high_priority(BLE_ADDRESS));
    assert_eq!(registry.bluetooth_status(BLE_ADDRESS), BluetoothStatus::Pairing);

    // Bluetooth devices wait longer than wired ones
    fx.scheduler.advance(WIRED_DELAY);
    assert!(fx.system.list_input_ports().is_empty());

    fx.scheduler.advance(BLUETOOTH_DELAY - WIRED_DELAY);
    assert_eq!(registry.bluetooth_status(BLE_ADDRESS), BluetoothStatus::Paired);
    let inputs = fx.system.list_input_ports();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].name, "BLE Keys In 1");

    let (receiver, _) = collecting_receiver();
    let input = fx.system.open_input(inputs[0].id, receiver).unwrap();
    input.start();

    bluetooth.unpair(BLE_ADDRESS);
    assert_eq!(registry.bluetooth_status(BLE_ADDRESS), BluetoothStatus::Unpaired);
    assert!(fx.system.list_input_ports().is_empty());
    assert!(!input.is_open());
    assert!(fx.platform.gatt_closed(BLE_ADDRESS));
    assert_eq!(fx.platform.open_device_handles(60), 0);
    assert_eq!(fx.changes().last(), Some(&DeviceListChange::Removed(60)));

    // Unpairing again changes nothing
    let before = fx.changes().len();
    bluetooth.unpair(BLE_ADDRESS);
    assert_eq!(fx.changes().len(), before);
}

#[test]
fn test_unpair_during_confirmation_delay() {
    let fx = Fixture::new();
    fx.platform.add_peripheral(ble_keys());
    let registry = fx.system.registry();

    assert!(registry.pair(BLE_ADDRESS));
    fx.platform.complete_gatt_connection(BLE_ADDRESS);
    fx.scheduler.advance(BLUETOOTH_DELAY / 2);

    registry.unpair(BLE_ADDRESS);
    assert!(fx.platform.gatt_closed(BLE_ADDRESS));
    assert_eq!(fx.platform.open_device_handles(60), 0);

    fx.scheduler.advance(BLUETOOTH_DELAY);
    assert!(fx.system.devices().is_empty());
    assert!(fx.changes().is_empty());
    assert_eq!(registry.bluetooth_status(BLE_ADDRESS), BluetoothStatus::Unpaired);
}

#[test]
fn test_pair_again_after_unpair() {
    let fx = Fixture::new();
    fx.platform.add_peripheral(ble_keys());
    let registry = fx.system.registry();

    assert!(registry.pair(BLE_ADDRESS));
    registry.unpair(BLE_ADDRESS);
    assert!(registry.pair(BLE_ADDRESS));
    assert!(fx.platform.complete_gatt_connection(BLE_ADDRESS));
    fx.scheduler.advance(BLUETOOTH_DELAY);
    assert_eq!(registry.bluetooth_status(BLE_ADDRESS), BluetoothStatus::Paired);
}

// ---------------------------------------------------------------------------
// 8. Teardown
// ---------------------------------------------------------------------------

#[test]
fn test_drop_system_releases_everything() {
    let fx = Fixture::new();
    fx.platform.add_peripheral(ble_keys());
    fx.add_confirmed(interface(1));
    fx.platform.add_device(interface(2));
    assert!(fx.system.registry().pair(BLE_ADDRESS));
    fx.system.bluetooth().unwrap().start_stop_scan(true);

    let (receiver, _) = collecting_receiver();
    let input = fx.system.open_input(fx.input_id(1, 0), receiver).unwrap();
    input.start();
    let output = fx.system.open_output(fx.output_id(1, 0)).unwrap();

    let Fixture {
        platform,
        scheduler,
        system,
        ..
    } = fx;
    drop(system);

    assert!(!input.is_open());
    assert!(!output.is_open());
    assert_eq!(platform.open_port_count(), 0);
    assert_eq!(platform.listener_count(), 0);
    assert_eq!(platform.open_device_handles(1), 0);
    assert_eq!(platform.open_device_handles(2), 0);
    assert_eq!(platform.callback_count(), 0);
    assert!(platform.gatt_closed(BLE_ADDRESS));
    assert_eq!(platform.scan_filter(), None);

    // Timers left behind find nothing to do
    scheduler.advance(WIRED_DELAY);
    assert_eq!(platform.open_device_handles(2), 0);

    drop(input);
    drop(output);
}

#[test]
fn test_events_after_teardown_are_ignored() {
    let fx = Fixture::new();
    fx.system.registry().teardown();
    fx.system.registry().teardown();

    fx.platform.add_device(interface(1));
    fx.scheduler.advance(WIRED_DELAY);
    assert!(fx.system.devices().is_empty());
    assert!(!fx.system.registry().pair(BLE_ADDRESS));
}

// ---------------------------------------------------------------------------
// 9. Timer thread
// ---------------------------------------------------------------------------

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn test_timer_thread_confirms_devices() {
    init_tracing();
    let platform = VirtualPlatform::new();
    let system = MidiDeviceSystem::builder()
        .platform(Arc::new(platform.clone()))
        .config(RegistryConfig {
            wired_open_delay_ms: 5,
            bluetooth_open_delay_ms: 10,
        })
        .build()
        .unwrap();

    platform.add_device(interface(1));
    assert!(wait_until(Duration::from_secs(2), || system.devices().len() == 1));
    assert_eq!(system.list_output_ports().len(), 2);
}

// ---------------------------------------------------------------------------
// 10. Concurrent hosts
// ---------------------------------------------------------------------------

const RACERS: usize = 8;

#[test]
fn test_concurrent_opens_have_one_winner() {
    let fx = Fixture::new();
    fx.add_confirmed(interface(1));
    let id = fx.output_id(1, 0);
    let barrier = Barrier::new(RACERS);

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..RACERS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    fx.system.open_output(id)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(Error::PortInUse(path)) if *path == PortPath::output(1, 0)))
            .count(),
        RACERS - 1
    );
    assert_eq!(fx.system.registry().open_port_count(), 1);
    assert_eq!(fx.platform.open_port_count(), 1);

    drop(results);
    assert_eq!(fx.system.registry().open_port_count(), 0);
}

#[test]
fn test_removal_races_open_and_close() {
    let fx = Fixture::new();
    fx.add_confirmed(interface(1));
    let id = fx.input_id(1, 0);
    let barrier = Barrier::new(3);

    thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| {
                barrier.wait();
                for _ in 0..200 {
                    let (receiver, _) = collecting_receiver();
                    match fx.system.open_input(id, receiver) {
                        Ok(input) => {
                            input.start();
                            input.close();
                        }
                        Err(Error::PortInUse(_)) => {}
                        Err(Error::UnknownPort(_)) => break,
                        Err(e) => panic!("unexpected open error: {e}"),
                    }
                }
            });
        }
        scope.spawn(|| {
            barrier.wait();
            thread::yield_now();
            fx.platform.remove_device(1);
        });
    });

    assert!(fx.system.devices().is_empty());
    assert_eq!(fx.system.registry().open_port_count(), 0);
    assert_eq!(fx.platform.open_port_count(), 0);
    assert_eq!(fx.platform.open_device_handles(1), 0);
}

#[test]
fn test_unpair_races_open_answer() {
    for _ in 0..50 {
        let fx = Fixture::new();
        fx.platform.add_peripheral(ble_keys());
        fx.platform.set_defer_opens(true);
        let registry = fx.system.registry();

        assert!(registry.pair(BLE_ADDRESS));
        assert!(fx.platform.complete_gatt_connection(BLE_ADDRESS));
        let barrier = Barrier::new(2);

        thread::scope(|scope| {
            scope.spawn(|| {
                barrier.wait();
                registry.unpair(BLE_ADDRESS);
            });
            scope.spawn(|| {
                barrier.wait();
                fx.platform.complete_pending_opens();
            });
        });

        // Whichever side won, nothing may survive the unpair
        fx.scheduler.advance(BLUETOOTH_DELAY);
        assert_eq!(registry.bluetooth_status(BLE_ADDRESS), BluetoothStatus::Unpaired);
        assert!(fx.system.devices().is_empty());
        assert_eq!(fx.platform.open_device_handles(60), 0);
        assert!(fx.platform.gatt_closed(BLE_ADDRESS));
    }
}
