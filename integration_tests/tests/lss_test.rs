use std::sync::{Arc, Mutex};
use std::time::Duration;

use integration_tests::mock_node::{responder, LssSlaveSim};
use integration_tests::sim_bus::SimBus;
use ocan_common::lss::{LssIdentity, LssState};
use ocan_master::lss::LssError;
use ocan_master::Network;

fn setup_with_slave(identity: LssIdentity) -> (Network, SimBus, Arc<Mutex<LssSlaveSim>>) {
    let bus = SimBus::new();
    let slave = Arc::new(Mutex::new(LssSlaveSim::new(identity)));
    bus.add_responder(responder(slave.clone()));

    let mut network = Network::new();
    let (tx, rx) = bus.endpoints();
    network.connect(Box::new(tx), Box::new(rx)).unwrap();
    (network, bus, slave)
}

#[test]
fn test_fastscan_finds_slave() {
    let identity = LssIdentity::new(0x11, 0x22, 0x33, 0x44);
    let (network, bus, slave) = setup_with_slave(identity);

    let found = network
        .lss
        .fast_scan_with_timeout(Duration::from_millis(5))
        .unwrap();
    assert_eq!(identity, found);
    assert_eq!(LssState::Configuration, slave.lock().unwrap().state);

    // One presence probe, then 32 bit probes and a confirm per word
    let probes = bus
        .sent()
        .iter()
        .filter(|m| m.id().raw() == 0x7E5 && m.data()[0] == 0x51)
        .count();
    assert!(probes <= 1 + 4 * 33, "{probes} probes used");

    // The selected slave accepts a node ID and reports it back
    network.lss.configure_node_id(42).unwrap();
    assert_eq!(Some(42), slave.lock().unwrap().node_id);
    assert_eq!(42, network.lss.inquire_node_id().unwrap());
}

#[test]
fn test_fastscan_with_nothing_to_find() {
    let bus = SimBus::new();
    let mut network = Network::new();
    let (tx, rx) = bus.endpoints();
    network.connect(Box::new(tx), Box::new(rx)).unwrap();

    assert_eq!(
        LssError::NoSlaveFound,
        network
            .lss
            .fast_scan_with_timeout(Duration::from_millis(5))
            .unwrap_err()
    );
}

#[test]
fn test_fastscan_skips_configured_slaves() {
    let identity = LssIdentity::new(1, 2, 3, 4);
    let (network, _bus, slave) = setup_with_slave(identity);
    slave.lock().unwrap().node_id = Some(10);

    assert_eq!(
        LssError::NoSlaveFound,
        network
            .lss
            .fast_scan_with_timeout(Duration::from_millis(5))
            .unwrap_err()
    );
}

#[test]
fn test_selective_switch_and_inquiries() {
    let identity = LssIdentity::new(0xCAFE, 1032, 1, 987654);
    let (network, _bus, slave) = setup_with_slave(identity);

    network.lss.send_switch_state_selective(&identity).unwrap();
    assert_eq!(LssState::Configuration, slave.lock().unwrap().state);

    assert_eq!(0xCAFE, network.lss.inquire_vendor_id().unwrap());
    assert_eq!(1032, network.lss.inquire_product_code().unwrap());
    assert_eq!(1, network.lss.inquire_revision().unwrap());
    assert_eq!(987654, network.lss.inquire_serial().unwrap());

    network.lss.configure_bit_timing(0, 2).unwrap();
    network.lss.store_configuration().unwrap();
}

#[test]
fn test_selective_switch_wrong_identity() {
    let (network, _bus, _slave) = setup_with_slave(LssIdentity::new(1, 2, 3, 4));
    let wrong = LssIdentity::new(1, 2, 3, 5);
    assert_eq!(
        LssError::Timeout,
        network.lss.send_switch_state_selective(&wrong).unwrap_err()
    );
}

#[test]
fn test_switch_state_global() {
    let (network, bus, slave) = setup_with_slave(LssIdentity::new(1, 2, 3, 4));
    network
        .lss
        .send_switch_state_global(LssState::Configuration)
        .unwrap();
    assert_eq!(LssState::Configuration, slave.lock().unwrap().state);

    let frame = bus
        .sent()
        .into_iter()
        .find(|m| m.id().raw() == 0x7E5)
        .unwrap();
    assert_eq!(&[0x04, 0x01, 0, 0, 0, 0, 0, 0], frame.data());
}
