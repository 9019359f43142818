use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ocan_common::messages::{NmtCommandSpecifier, NmtState};
use ocan_common::{CanId, CanMessage};

mod utils;
use utils::{setup, NODE_ID};

#[test]
fn test_nmt_broadcast_start() {
    let (network, bus, _server, _node) = setup();
    bus.take_sent();
    network.nmt.set_state("OPERATIONAL").unwrap();

    let sent = bus.take_sent();
    assert_eq!(1, sent.len());
    assert_eq!(0x000, sent[0].id().raw());
    assert_eq!(&[0x01, 0x00], sent[0].data());
}

#[test]
fn test_nmt_node_commands() {
    let (_network, bus, _server, node) = setup();
    bus.take_sent();
    node.nmt.send_command(NmtCommandSpecifier::ResetNode).unwrap();
    node.nmt.set_state("STOPPED").unwrap();
    assert!(node.nmt.set_state("SLEEPWALKING").is_err());

    let sent = bus.take_sent();
    assert_eq!(&[0x81, NODE_ID], sent[0].data());
    assert_eq!(&[0x02, NODE_ID], sent[1].data());
}

#[test]
fn test_heartbeat_updates_state() {
    let (network, _bus, _server, node) = setup();
    assert_eq!(None, node.nmt.state());

    let handle = network.handle();
    let injector = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        handle.notify(0x700 + NODE_ID as u32, &[0x05], Instant::now());
    });

    let state = node.nmt.wait_for_heartbeat(Duration::from_secs(1)).unwrap();
    injector.join().unwrap();
    assert_eq!(NmtState::Operational, state);
    assert_eq!(Some(NmtState::Operational), node.nmt.state());
    assert!(node.nmt.is_alive());

    // Waiting again without further heartbeats must time out
    assert!(node
        .nmt
        .wait_for_heartbeat(Duration::from_millis(50))
        .is_err());
}

#[test]
fn test_heartbeat_timeout_marks_unreachable() {
    let (network, _bus, _server, node) = setup();
    node.nmt.set_heartbeat_timeout(Duration::from_millis(50));
    network
        .handle()
        .notify(0x700 + NODE_ID as u32, &[0x7F], Instant::now());
    // The handler runs synchronously in notify
    assert_eq!(Some(NmtState::PreOperational), node.nmt.state());

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(None, node.nmt.state());
    assert!(!node.nmt.is_alive());
}

#[test]
fn test_wait_for_bootup() {
    let (network, _bus, _server, node) = setup();
    let handle = network.handle();
    let injector = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        handle.notify(0x700 + NODE_ID as u32, &[0x00], Instant::now());
    });
    node.nmt.wait_for_bootup(Duration::from_secs(1)).unwrap();
    injector.join().unwrap();
}

#[test]
fn test_node_guarding() {
    let (network, bus, _server, node) = setup();
    bus.take_sent();
    node.nmt.start_node_guarding(Duration::from_millis(20));
    std::thread::sleep(Duration::from_millis(90));
    node.nmt.stop_node_guarding();

    let polls = bus
        .take_sent()
        .into_iter()
        .filter(|m| m.id().raw() == 0x700 + NODE_ID as u32 && m.is_rtr())
        .count();
    assert!(polls >= 2, "only {polls} guard polls seen");

    // The guarded node answers with its state and a toggle bit
    network
        .handle()
        .notify(0x700 + NODE_ID as u32, &[0x85], Instant::now());
    assert_eq!(Some(NmtState::Operational), node.nmt.state());
}

#[test]
fn test_emcy_active_and_log() {
    let (_network, bus, _server, node) = setup();
    bus.inject(CanMessage::new(
        CanId::std(0x080 + NODE_ID as u16),
        &[0x10, 0x82, 0x20, 0, 0, 0, 0, 0],
    ));
    assert!(utils::wait_until(Duration::from_secs(1), || {
        node.emcy.active().len() == 1
    }));
    let entry = node.emcy.log()[0];
    assert_eq!(0x8210, entry.code);
    assert_eq!(0x20, entry.register);
    assert_eq!(Some("Monitoring"), entry.description());

    // A non-zero code with a zero high byte is an ordinary emergency,
    // not an error reset
    bus.inject(CanMessage::new(
        CanId::std(0x080 + NODE_ID as u16),
        &[0x05, 0x00, 0x01, 0, 0, 0, 0, 0],
    ));
    assert!(utils::wait_until(Duration::from_secs(1), || {
        node.emcy.active().len() == 2
    }));
    assert_eq!(0x0005, node.emcy.active()[1].code);

    // Only the exact code 0x0000 clears the active list, and it still
    // lands in the log
    bus.inject(CanMessage::new(
        CanId::std(0x080 + NODE_ID as u16),
        &[0, 0, 0, 0, 0, 0, 0, 0],
    ));
    assert!(utils::wait_until(Duration::from_secs(1), || {
        node.emcy.active().is_empty() && node.emcy.log().len() == 3
    }));

    node.emcy.reset();
    assert!(node.emcy.log().is_empty());
}

#[test]
fn test_emcy_wait() {
    let (network, _bus, _server, node) = setup();
    let handle = network.handle();
    let injector = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        handle.notify(
            0x080 + NODE_ID as u32,
            &[0x00, 0x30, 0x04, 1, 2, 3, 4, 5],
            Instant::now(),
        );
    });
    let entry = node.emcy.wait(Duration::from_secs(1)).expect("no EMCY seen");
    injector.join().unwrap();
    assert_eq!(0x3000, entry.code);
    assert_eq!([1, 2, 3, 4, 5], entry.vendor);

    // Nothing further arrives
    assert!(node.emcy.wait(Duration::from_millis(50)).is_none());
}

#[test]
fn test_emcy_callback() {
    let (network, _bus, _server, node) = setup();
    let codes: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(Vec::new()));
    let codes_cb = codes.clone();
    node.emcy.add_callback(Box::new(move |emcy| {
        codes_cb.lock().unwrap().push(emcy.code);
    }));

    network.handle().notify(
        0x080 + NODE_ID as u32,
        &[0x00, 0x10, 0x01, 0, 0, 0, 0, 0],
        Instant::now(),
    );
    assert_eq!(vec![0x1000], *codes.lock().unwrap());
}
