#![allow(dead_code)]
use std::sync::{Arc, Mutex};

use integration_tests::demo_dictionary;
use integration_tests::mock_node::{responder, SdoServerSim};
use integration_tests::sim_bus::SimBus;
use ocan_common::NodeId;
use ocan_master::{Network, RemoteNode};

pub const NODE_ID: u8 = 5;

/// Bring up a network on a simulated bus with one scripted SDO server
pub fn setup() -> (Network, SimBus, Arc<Mutex<SdoServerSim>>, Arc<RemoteNode>) {
    let bus = SimBus::new();
    let server = Arc::new(Mutex::new(SdoServerSim::new(NODE_ID)));
    bus.add_responder(responder(server.clone()));

    let mut network = Network::new();
    let (tx, rx) = bus.endpoints();
    network.connect(Box::new(tx), Box::new(rx)).unwrap();
    let node = network
        .add_node(NodeId::new(NODE_ID).unwrap(), demo_dictionary())
        .clone();
    (network, bus, server, node)
}

/// Poll a condition until it holds or the timeout expires
pub fn wait_until(timeout: std::time::Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    condition()
}

/// Frames sent to the node's SDO request COB-ID
pub fn sdo_requests(bus: &SimBus) -> Vec<[u8; 8]> {
    bus.sent()
        .iter()
        .filter(|msg| msg.id().raw() == 0x600 + NODE_ID as u32)
        .map(|msg| {
            let mut frame = [0u8; 8];
            frame[0..msg.data().len()].copy_from_slice(msg.data());
            frame
        })
        .collect()
}
