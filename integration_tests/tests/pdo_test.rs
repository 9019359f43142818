use std::sync::{Arc, Mutex};
use std::time::Duration;

use ocan_common::objects::Value;
use ocan_master::pdo::PdoError;

mod utils;
use utils::{setup, NODE_ID};

#[test]
fn test_pack_statusword_and_velocity() {
    let (_network, _bus, _server, node) = setup();
    let map = node.tpdo.get(1).unwrap();
    map.clear();
    map.add_variable(0x6041, 0).unwrap();
    map.add_variable(0x606C, 0).unwrap();

    map.variable_by_name("Statusword")
        .unwrap()
        .set_raw(0x0237u16);
    map.variable_by_name("Velocity actual value")
        .unwrap()
        .set_raw(-250i32);

    assert_eq!(vec![0x37, 0x02, 0x06, 0xFF, 0xFF, 0xFF], map.data());

    // Unpacking the packed frame returns the original values
    assert_eq!(
        Value::Unsigned(0x0237),
        map.variable_by_name("Statusword").unwrap().raw()
    );
    assert_eq!(
        Value::Integer(-250),
        map.variable_by_name("Velocity actual value").unwrap().raw()
    );
}

#[test]
fn test_map_size_limit() {
    let (_network, _bus, _server, node) = setup();
    let map = node.tpdo.get(1).unwrap();
    map.clear();
    map.add_variable(0x606C, 0).unwrap();
    map.add_variable(0x60FF, 0).unwrap();
    // 64 bits are in use; one more bit does not fit
    assert_eq!(
        PdoError::MapTooLong,
        map.add_variable(0x6041, 0).unwrap_err()
    );
}

#[test]
fn test_unmappable_variable_rejected() {
    let (_network, _bus, _server, node) = setup();
    let map = node.tpdo.get(1).unwrap();
    assert_eq!(
        PdoError::NotMappable {
            index: 0x1017,
            sub: 0
        },
        map.add_variable(0x1017, 0).unwrap_err()
    );
}

#[test]
fn test_read_configuration() {
    let (_network, _bus, server, node) = setup();
    {
        let mut server = server.lock().unwrap();
        server.insert(0x1800, 1, &0x185u32.to_le_bytes());
        server.insert(0x1800, 2, &[254]);
        server.insert(0x1800, 3, &10u16.to_le_bytes());
        server.insert(0x1800, 5, &100u16.to_le_bytes());
        server.insert(0x1800, 6, &[0]);
        server.insert(0x1A00, 0, &[2]);
        server.insert(0x1A00, 1, &0x6041_0010u32.to_le_bytes());
        server.insert(0x1A00, 2, &0x606C_0020u32.to_le_bytes());
    }

    let map = node.tpdo.get(1).unwrap();
    map.read().unwrap();

    assert_eq!(Some(0x185), map.cob_id());
    assert!(map.enabled());
    assert_eq!(Some(254), map.trans_type());
    assert_eq!(Some(10), map.inhibit_time());
    assert_eq!(Some(100), map.event_timer());
    let mapped = map.mapped();
    assert_eq!(2, mapped.len());
    assert_eq!("Statusword", mapped[0].od.name);
    assert_eq!(0, mapped[0].offset);
    assert_eq!(16, mapped[0].length);
    assert_eq!("Velocity actual value", mapped[1].od.name);
    assert_eq!(16, mapped[1].offset);
    assert_eq!(32, mapped[1].length);
}

#[test]
fn test_disabled_pdo_detected_on_read() {
    let (_network, _bus, server, node) = setup();
    {
        let mut server = server.lock().unwrap();
        server.insert(0x1800, 1, &(0x185u32 | 1 << 31).to_le_bytes());
        server.insert(0x1800, 2, &[1]);
        server.insert(0x1A00, 0, &[0]);
    }
    let map = node.tpdo.get(1).unwrap();
    map.read().unwrap();
    assert!(!map.enabled());
}

#[test]
fn test_reception_wait_and_callback() {
    let (network, _bus, server, node) = setup();
    {
        let mut server = server.lock().unwrap();
        server.insert(0x1800, 1, &0x185u32.to_le_bytes());
        server.insert(0x1800, 2, &[255]);
        server.insert(0x1800, 3, &[0, 0]);
        server.insert(0x1800, 5, &[0, 0]);
        server.insert(0x1800, 6, &[0]);
        server.insert(0x1A00, 0, &[2]);
        server.insert(0x1A00, 1, &0x6041_0010u32.to_le_bytes());
        server.insert(0x1A00, 2, &0x606C_0020u32.to_le_bytes());
    }
    let map = node.tpdo.get(1).unwrap();
    map.read().unwrap();

    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    map.add_callback(Box::new(move |map| {
        seen_cb.lock().unwrap().push(map.data());
    }));

    let handle = network.handle();
    let injector = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        handle.notify(
            0x185,
            &[0x37, 0x02, 0x06, 0xFF, 0xFF, 0xFF, 0, 0],
            std::time::Instant::now(),
        );
    });

    let timestamp = map.wait_for_reception(Duration::from_secs(1));
    injector.join().unwrap();
    assert!(timestamp.is_some());
    assert_eq!(
        Value::Unsigned(0x0237),
        map.variable_by_name("Statusword").unwrap().raw()
    );
    assert_eq!(
        Value::Integer(-250),
        map.variable_by_name("Velocity actual value").unwrap().raw()
    );
    assert_eq!(1, seen.lock().unwrap().len());

    // Without further frames the wait times out
    assert!(map.wait_for_reception(Duration::from_millis(50)).is_none());
}

#[test]
fn test_save_sequence() {
    let (_network, bus, server, node) = setup();
    let map = node.tpdo.get(1).unwrap();
    map.set_cob_id(0x185);
    map.set_enabled(true);
    map.set_trans_type(254);
    map.clear();
    map.add_variable(0x6041, 0).unwrap();
    map.add_variable(0x606C, 0).unwrap();
    bus.take_sent();

    map.save().unwrap();

    // The node's records now hold the new configuration
    {
        let server = server.lock().unwrap();
        assert_eq!(Some(&0x185u32.to_le_bytes().to_vec()), server.get(0x1800, 1));
        assert_eq!(Some(&vec![254]), server.get(0x1800, 2));
        assert_eq!(Some(&vec![2]), server.get(0x1A00, 0));
        assert_eq!(
            Some(&0x6041_0010u32.to_le_bytes().to_vec()),
            server.get(0x1A00, 1)
        );
        assert_eq!(
            Some(&0x606C_0020u32.to_le_bytes().to_vec()),
            server.get(0x1A00, 2)
        );
    }

    // The COB-ID entry is written twice: disabled first, enabled last
    let com_writes: Vec<[u8; 8]> = utils::sdo_requests(&bus)
        .into_iter()
        .filter(|frame| {
            frame[0] == 0x23 && frame[1] == 0x00 && frame[2] == 0x18 && frame[3] == 1
        })
        .collect();
    assert_eq!(2, com_writes.len());
    assert_eq!(0x80, com_writes[0][7] & 0x80, "first write must disable");
    assert_eq!(0x00, com_writes[1][7] & 0x80, "last write must enable");

    // The map count is zeroed before the entries are rewritten
    let count_writes: Vec<[u8; 8]> = utils::sdo_requests(&bus)
        .into_iter()
        .filter(|frame| {
            frame[0] == 0x2F && frame[1] == 0x00 && frame[2] == 0x1A && frame[3] == 0
        })
        .collect();
    assert_eq!(vec![0u8, 2u8], vec![count_writes[0][4], count_writes[1][4]]);
}

#[test]
fn test_sync_triggered_transmission() {
    let (network, bus, _server, node) = setup();
    let map = node.rpdo.get(1).unwrap();
    map.set_enabled(true);
    map.set_trans_type(1);
    map.clear();
    map.add_variable(0x60FF, 0).unwrap();
    map.subscribe().unwrap();
    map.variable_by_name("Target velocity")
        .unwrap()
        .set_raw(-250i32);
    bus.take_sent();

    // Every SYNC triggers a transmission-type-1 map
    network.sync.transmit(None).unwrap();
    let sent = bus.take_sent();
    assert!(sent.iter().any(|m| m.id().raw() == 0x80));
    let pdo_frame = sent
        .iter()
        .find(|m| m.id().raw() == 0x205)
        .expect("no RPDO transmitted on SYNC");
    assert_eq!(&[0x06, 0xFF, 0xFF, 0xFF], pdo_frame.data());
}

#[test]
fn test_change_triggered_sync_transmission() {
    let (network, bus, _server, node) = setup();
    let map = node.rpdo.get(1).unwrap();
    map.set_enabled(true);
    map.set_trans_type(0);
    map.clear();
    map.add_variable(0x60FF, 0).unwrap();
    map.subscribe().unwrap();
    bus.take_sent();

    // No change since the last SYNC: nothing goes out
    network.sync.transmit(None).unwrap();
    assert!(!bus.take_sent().iter().any(|m| m.id().raw() == 0x205));

    map.variable_by_name("Target velocity").unwrap().set_raw(99i32);
    network.sync.transmit(None).unwrap();
    assert!(bus.take_sent().iter().any(|m| m.id().raw() == 0x205));

    // The change was consumed by the transmission
    network.sync.transmit(None).unwrap();
    assert!(!bus.take_sent().iter().any(|m| m.id().raw() == 0x205));
}

#[test]
fn test_inhibit_time_drops_colliding_transmissions() {
    let (network, bus, _server, node) = setup();
    let map = node.rpdo.get(1).unwrap();
    map.set_enabled(true);
    map.set_trans_type(1);
    // 50 ms in units of 100 us
    map.set_inhibit_time(500);
    map.clear();
    map.add_variable(0x60FF, 0).unwrap();
    map.subscribe().unwrap();
    bus.take_sent();

    network.sync.transmit(None).unwrap();
    network.sync.transmit(None).unwrap();
    let count = bus
        .take_sent()
        .iter()
        .filter(|m| m.id().raw() == 0x205)
        .count();
    assert_eq!(1, count, "second transmission within the inhibit window");
}

#[test]
fn test_periodic_transmission() {
    let (_network, bus, _server, node) = setup();
    let map = node.rpdo.get(1).unwrap();
    map.set_enabled(true);
    map.clear();
    map.add_variable(0x60FF, 0).unwrap();
    map.start(Some(Duration::from_millis(20))).unwrap();
    std::thread::sleep(Duration::from_millis(110));
    map.stop();

    let count = bus
        .take_sent()
        .iter()
        .filter(|m| m.id().raw() == 0x205)
        .count();
    assert!(count >= 3, "only {count} periodic transmissions seen");

    // stop() guarantees silence afterwards
    std::thread::sleep(Duration::from_millis(60));
    assert!(!bus.take_sent().iter().any(|m| m.id().raw() == 0x205));
}

#[test]
fn test_remote_request() {
    let (_network, bus, _server, node) = setup();
    let map = node.tpdo.get(1).unwrap();
    map.set_enabled(true);
    bus.take_sent();
    map.remote_request().unwrap();

    let sent = bus.take_sent();
    assert_eq!(1, sent.len());
    assert_eq!(0x180 + NODE_ID as u32, sent[0].id().raw());
    assert!(sent[0].is_rtr());
}

#[test]
fn test_lookup_by_cob_id_and_injection() {
    let (network, _bus, _server, node) = setup();
    let map = node.tpdo.get(1).unwrap();
    map.set_enabled(true);
    map.clear();
    map.add_variable(0x6041, 0).unwrap();
    map.subscribe().unwrap();

    let cob_id = 0x180 + NODE_ID as u32;
    assert!(node.tpdo.by_cob_id(cob_id).is_some());

    network.notify(cob_id, &[0x37, 0x02], std::time::Instant::now());
    assert_eq!(vec![0x37, 0x02], map.data());
}
