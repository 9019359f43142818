use std::time::Duration;

use integration_tests::mock_node::{responder, SdoServerSim};
use integration_tests::sim_bus::SimBus;
use integration_tests::demo_dictionary;
use ocan_common::objects::Value;
use ocan_common::sdo::{AbortCode, RawAbortCode};
use ocan_common::NodeId;
use ocan_master::sdo::SdoClientError;
use ocan_master::Network;

mod utils;
use utils::{sdo_requests, setup, NODE_ID};

#[test]
fn test_expedited_read() {
    let (_network, bus, server, node) = setup();
    server
        .lock()
        .unwrap()
        .insert(0x1000, 0, &0x00020192u32.to_le_bytes());
    bus.take_sent();

    let value = node.sdo.variable(0x1000, 0).unwrap().raw().unwrap();
    assert_eq!(Value::Unsigned(0x00020192), value);

    // The read must have gone out as a plain initiate upload
    let requests = sdo_requests(&bus);
    assert_eq!(vec![[0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0]], requests);
}

#[test]
fn test_expedited_write() {
    let (_network, _bus, server, node) = setup();
    node.sdo
        .variable(0x1017, 0)
        .unwrap()
        .set_raw(1000u16)
        .unwrap();
    assert_eq!(
        Some(&vec![0xE8, 0x03]),
        server.lock().unwrap().get(0x1017, 0)
    );
}

#[test]
fn test_segmented_download_frames() {
    let (_network, bus, server, node) = setup();
    bus.take_sent();

    node.sdo.download(0x2000, 0, b"Hello World!").unwrap();

    assert_eq!(
        Some(&b"Hello World!".to_vec()),
        server.lock().unwrap().get(0x2000, 0)
    );
    let requests = sdo_requests(&bus);
    assert_eq!(
        vec![
            [0x21, 0x00, 0x20, 0x00, 12, 0, 0, 0],
            [0x00, b'H', b'e', b'l', b'l', b'o', b' ', b'W'],
            [0x15, b'o', b'r', b'l', b'd', b'!', 0, 0],
        ],
        requests
    );
}

#[test]
fn test_segmented_upload() {
    let (_network, _bus, server, node) = setup();
    server.lock().unwrap().insert(0x2000, 0, b"Hello World!");

    assert_eq!(b"Hello World!".to_vec(), node.sdo.upload(0x2000, 0).unwrap());
    assert_eq!(
        Value::String("Hello World!".to_string()),
        node.sdo.variable(0x2000, 0).unwrap().raw().unwrap()
    );
}

#[test]
fn test_force_segment_for_short_data() {
    let (_network, bus, server, node) = setup();
    bus.take_sent();

    node.sdo
        .client()
        .download(0x2000, 0, b"ab", true)
        .unwrap();

    assert_eq!(Some(&b"ab".to_vec()), server.lock().unwrap().get(0x2000, 0));
    // Initiate must not carry the expedited bit
    let requests = sdo_requests(&bus);
    assert_eq!([0x21, 0x00, 0x20, 0x00, 2, 0, 0, 0], requests[0]);
    // Single final segment: 5 unused bytes, last bit set
    assert_eq!([0x0B, b'a', b'b', 0, 0, 0, 0, 0], requests[1]);
}

#[test]
fn test_block_download() {
    let (_network, _bus, server, node) = setup();
    // Small granted block size forces several ack round trips
    server.lock().unwrap().blksize = 16;

    let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
    node.sdo.client().block_download(0x2000, 0, &data).unwrap();

    assert_eq!(Some(&data), server.lock().unwrap().get(0x2000, 0));
}

#[test]
fn test_block_upload() {
    let (_network, _bus, server, node) = setup();
    let data: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
    server.lock().unwrap().insert(0x2000, 0, &data);

    assert_eq!(data, node.sdo.client().block_upload(0x2000, 0).unwrap());
}

#[test]
fn test_streamed_block_write() {
    let (_network, _bus, server, node) = setup();
    let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();

    let mut stream = node
        .sdo
        .client()
        .open_write(0x2000, 0, Some(data.len()), true, false)
        .unwrap();
    for chunk in data.chunks(13) {
        stream.write_chunk(chunk).unwrap();
    }
    stream.finish().unwrap();

    assert_eq!(Some(&data), server.lock().unwrap().get(0x2000, 0));
}

#[test]
fn test_server_abort() {
    let (_network, _bus, _server, node) = setup();
    let err = node.sdo.upload(0x7777, 0).unwrap_err();
    assert_eq!(
        SdoClientError::ServerAbort {
            index: 0x7777,
            sub: 0,
            code: RawAbortCode::Valid(AbortCode::NoSuchObject),
        },
        err
    );
}

#[test]
fn test_timeout_sends_abort_and_recovers() {
    // A bus with no SDO server at all
    let bus = SimBus::new();
    let mut network = Network::new();
    let (tx, rx) = bus.endpoints();
    network.connect(Box::new(tx), Box::new(rx)).unwrap();
    let node = network
        .add_node(NodeId::new(NODE_ID).unwrap(), demo_dictionary())
        .clone();
    node.sdo.client().set_response_timeout(Duration::from_millis(50));

    assert_eq!(SdoClientError::Timeout, node.sdo.upload(0x1000, 0).unwrap_err());

    // The client must have torn the transfer down with a timeout abort
    let abort = sdo_requests(&bus)
        .into_iter()
        .find(|frame| frame[0] == 0x80)
        .expect("no abort was sent");
    assert_eq!([0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x04, 0x05], abort);

    // A server coming up afterwards is reachable with no stale state
    let server = std::sync::Arc::new(std::sync::Mutex::new(SdoServerSim::new(NODE_ID)));
    server.lock().unwrap().insert(0x1000, 0, &[0x92, 0x01, 0x02, 0x00]);
    bus.add_responder(responder(server));
    assert_eq!(
        vec![0x92, 0x01, 0x02, 0x00],
        node.sdo.upload(0x1000, 0).unwrap()
    );
}

#[test]
fn test_second_transfer_rejected_while_busy() {
    let (_network, _bus, server, node) = setup();
    server.lock().unwrap().insert(0x2000, 0, b"Hello World!");

    // An open stream holds the node's single transfer slot
    let stream = node.sdo.client().open_read(0x2000, 0, false).unwrap();
    node.sdo.client().set_block_on_busy(false);
    assert_eq!(
        SdoClientError::Busy,
        node.sdo.upload(0x1000, 0).unwrap_err()
    );
    drop(stream);

    // Released after the stream is gone
    server.lock().unwrap().insert(0x1000, 0, &[1, 0, 0, 0]);
    assert_eq!(vec![1, 0, 0, 0], node.sdo.upload(0x1000, 0).unwrap());
}

#[test]
fn test_phys_desc_bits_views() {
    let (_network, _bus, server, node) = setup();

    // Physical view applies the declared factor
    let velocity = node.sdo.variable_by_name("Profile velocity").unwrap();
    velocity.set_phys(100.0).unwrap();
    assert_eq!(Some(&vec![0xC8, 0x00]), server.lock().unwrap().get(0x6081, 0));
    assert_eq!(100.0, velocity.phys().unwrap());

    // Symbolic view maps through the value descriptions
    let mode = node.sdo.variable_by_name("Modes of operation").unwrap();
    mode.set_desc("Profile velocity").unwrap();
    assert_eq!(Some(&vec![0x03]), server.lock().unwrap().get(0x6060, 0));
    assert_eq!("Profile velocity", mode.desc().unwrap());
    assert_eq!(Value::Integer(3), mode.raw().unwrap());

    // Bit view reads named bits
    server.lock().unwrap().insert(0x6041, 0, &[0x08, 0x00]);
    let statusword = node.sdo.variable(0x6041, 0).unwrap();
    assert_eq!(1, statusword.bits_by_name("FAULT").unwrap());
    statusword.set_bits(&[3], 0).unwrap();
    assert_eq!(Some(&vec![0x00, 0x00]), server.lock().unwrap().get(0x6041, 0));
}

#[test]
fn test_upload_truncates_to_dictionary_size() {
    let (_network, _bus, server, node) = setup();
    // Device answers with four bytes although the object is a u16
    server.lock().unwrap().insert(0x1017, 0, &[0xE8, 0x03, 0, 0]);
    assert_eq!(vec![0xE8, 0x03], node.sdo.upload(0x1017, 0).unwrap());
}
