use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, UNIX_EPOCH};

use integration_tests::mock_node::{responder, SdoServerSim};
use integration_tests::sim_bus::SimBus;
use ocan_common::objects::Value;
use ocan_common::traits::TransportError;
use ocan_common::NodeId;
use ocan_master::sdo::SdoClientError;
use ocan_master::Network;

mod utils;
use utils::{setup, wait_until, NODE_ID};

#[test]
fn test_dispatch_order_and_unsubscribe() {
    let network = Network::new();
    let calls: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

    let handle = network.handle();
    let calls_a = calls.clone();
    let sub_a = handle.subscribe(0x123, Arc::new(move |_, _, _| calls_a.lock().unwrap().push(1)));
    let calls_b = calls.clone();
    let _sub_b = handle.subscribe(0x123, Arc::new(move |_, _, _| calls_b.lock().unwrap().push(2)));

    network.notify(0x123, &[], Instant::now());
    assert_eq!(vec![1, 2], *calls.lock().unwrap());

    handle.unsubscribe(&sub_a);
    network.notify(0x123, &[], Instant::now());
    assert_eq!(vec![1, 2, 2], *calls.lock().unwrap());
}

#[test]
fn test_send_without_connection_fails() {
    let network = Network::new();
    assert_eq!(
        Err(TransportError::NotConnected),
        network.send(0x123, &[1, 2])
    );
}

#[test]
fn test_scanner_passive_discovery() {
    let (network, bus, _server, _node) = setup();
    let scanner = network.scanner();

    bus.inject(ocan_common::CanMessage::new(
        ocan_common::CanId::std(0x705),
        &[0x05],
    ));
    bus.inject(ocan_common::CanMessage::new(
        ocan_common::CanId::std(0x586),
        &[0x43, 0, 0x10, 0, 0, 0, 0, 0],
    ));
    // SYNC carries no node ID and must not register anything
    bus.inject(ocan_common::CanMessage::new(
        ocan_common::CanId::std(0x080),
        &[],
    ));

    assert!(wait_until(Duration::from_secs(1), || {
        scanner.nodes() == vec![5, 6]
    }));

    scanner.reset();
    assert!(scanner.nodes().is_empty());
}

#[test]
fn test_scanner_search() {
    let (network, bus, _server, _node) = setup();
    bus.take_sent();
    network.scanner().search(10).unwrap();

    let sent = bus.take_sent();
    assert_eq!(10, sent.len());
    for (i, msg) in sent.iter().enumerate() {
        assert_eq!(0x601 + i as u32, msg.id().raw());
        assert_eq!(&[0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0], msg.data());
    }
}

#[test]
fn test_periodic_sync_producer() {
    let (network, bus, _server, _node) = setup();
    bus.take_sent();
    network.sync.start(Duration::from_millis(20));
    std::thread::sleep(Duration::from_millis(110));
    network.sync.stop();

    let count = bus
        .take_sent()
        .iter()
        .filter(|m| m.id().raw() == 0x080)
        .count();
    assert!(count >= 3, "only {count} SYNC frames seen");

    // stop() is synchronous; nothing more is transmitted
    std::thread::sleep(Duration::from_millis(60));
    assert!(!bus.take_sent().iter().any(|m| m.id().raw() == 0x080));
}

#[test]
fn test_sync_counter() {
    let (network, bus, _server, _node) = setup();
    bus.take_sent();
    network.sync.transmit(Some(3)).unwrap();
    let sent = bus.take_sent();
    assert_eq!(0x080, sent[0].id().raw());
    assert_eq!(&[3], sent[0].data());
}

#[test]
fn test_time_producer() {
    let (network, bus, _server, _node) = setup();
    bus.take_sent();

    // One day and one second past the 1984-01-01 epoch
    let time = UNIX_EPOCH + Duration::from_secs(441_763_200 + 86_400 + 1);
    network.time.transmit_at(time).unwrap();

    let sent = bus.take_sent();
    assert_eq!(0x100, sent[0].id().raw());
    assert_eq!(&[0xE8, 0x03, 0x00, 0x00, 0x01, 0x00], sent[0].data());
}

#[test]
fn test_disconnect_releases_waiters() {
    // A bus with nothing attached, so the request stays unanswered
    let bus = SimBus::new();
    let mut network = Network::new();
    let (tx, rx) = bus.endpoints();
    network.connect(Box::new(tx), Box::new(rx)).unwrap();
    let node = network
        .add_node(NodeId::new(NODE_ID).unwrap(), integration_tests::demo_dictionary())
        .clone();
    // Make the pending transfer wait far longer than the test
    node.sdo.client().set_response_timeout(Duration::from_secs(10));
    node.sdo.client().set_max_retries(0);

    let waiter = {
        let node = node.clone();
        std::thread::spawn(move || node.sdo.upload(0x7000, 0))
    };
    // Let the request go out and block on its response
    std::thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    network.disconnect();
    let result = waiter.join().unwrap();
    assert!(
        matches!(result, Err(SdoClientError::Transport { .. })),
        "waiter finished with {result:?}"
    );
    assert!(start.elapsed() < Duration::from_secs(2));

    // No further frames leave the host
    assert_eq!(
        Err(TransportError::NotConnected),
        network.send(0x123, &[0])
    );
}

#[test]
fn test_node_from_eds_file() {
    const EDS: &str = r#"
[1000]
ParameterName=Device type
ObjectType=0x7
DataType=0x0007
AccessType=ro

[DeviceComissioning]
NodeID=5
Baudrate=500
"#;
    let od = ocan_eds::load_str(EDS, None).unwrap();
    assert_eq!(Some(5), od.node_id);
    assert_eq!(Some(500_000), od.bitrate);

    let bus = SimBus::new();
    let server = Arc::new(Mutex::new(SdoServerSim::new(NODE_ID)));
    server.lock().unwrap().insert(0x1000, 0, &[0x92, 0x01, 0x02, 0x00]);
    bus.add_responder(responder(server));

    let mut network = Network::new();
    let (tx, rx) = bus.endpoints();
    network.connect(Box::new(tx), Box::new(rx)).unwrap();
    let node_id = od.node_id.unwrap();
    let node = network.add_node(NodeId::new(node_id).unwrap(), od).clone();

    assert_eq!(
        Value::Unsigned(0x00020192),
        node.sdo.variable_by_name("Device type").unwrap().raw().unwrap()
    );
}

#[test]
fn test_remove_node_releases_subscriptions() {
    let (mut network, bus, server, _node) = setup();
    server
        .lock()
        .unwrap()
        .insert(0x1000, 0, &[1, 0, 0, 0]);

    network.remove_node(NODE_ID);
    assert!(network.node(NODE_ID).is_none());

    // Responses for the removed node are simply dropped
    bus.inject(ocan_common::CanMessage::new(
        ocan_common::CanId::std(0x580 + NODE_ID as u16),
        &[0x43, 0, 0x10, 0, 1, 0, 0, 0],
    ));
    std::thread::sleep(Duration::from_millis(50));
}

#[test]
fn test_store_parameters_magic() {
    let (_network, _bus, server, node) = setup();
    node.store_parameters().unwrap();
    assert_eq!(
        Some(&b"save".to_vec()),
        server.lock().unwrap().get(0x1010, 1)
    );
    node.restore_parameters().unwrap();
    assert_eq!(
        Some(&b"load".to_vec()),
        server.lock().unwrap().get(0x1011, 1)
    );
}

#[test]
fn test_node_config_apply() {
    let (_network, _bus, server, node) = setup();
    let config = ocan_master::node_config::NodeConfig::load_from_str(
        r#"
        [tpdo.1]
        transmission_type = 254
        event_timer = 50
        mappings = [
            { index = 0x6041, sub = 0 },
            { index = 0x606C, sub = 0 },
        ]

        [[store]]
        index = 0x1017
        sub = 0
        value = { U16 = 1000 }
        "#,
    )
    .unwrap();

    config.apply(&node).unwrap();

    let server = server.lock().unwrap();
    assert_eq!(Some(&vec![254]), server.get(0x1800, 2));
    assert_eq!(Some(&50u16.to_le_bytes().to_vec()), server.get(0x1800, 5));
    assert_eq!(Some(&vec![2]), server.get(0x1A00, 0));
    assert_eq!(
        Some(&0x6041_0010u32.to_le_bytes().to_vec()),
        server.get(0x1A00, 1)
    );
    assert_eq!(Some(&1000u16.to_le_bytes().to_vec()), server.get(0x1017, 0));
}
