//! Passive node discovery

use std::sync::{Arc, Mutex};

use ocan_common::traits::TransportError;

use crate::network::NetworkHandle;

/// Function codes whose per-node COB-IDs reveal a node's presence:
/// EMCY, TPDO1-4, SDO responses and heartbeat
const SERVICES: [u32; 7] = [0x080, 0x180, 0x280, 0x380, 0x480, 0x580, 0x700];

#[derive(Debug, Default)]
pub(crate) struct ScanState {
    nodes: Vec<u8>,
}

impl ScanState {
    /// Record the node implied by an observed COB-ID, if any
    pub(crate) fn on_frame(state: &Arc<Mutex<ScanState>>, cob_id: u32) {
        let service = cob_id & 0x780;
        let node_id = (cob_id & 0x7F) as u8;
        if node_id == 0 || !SERVICES.contains(&service) {
            return;
        }
        let mut state = state.lock().unwrap();
        if !state.nodes.contains(&node_id) {
            log::info!("Discovered node {node_id}");
            state.nodes.push(node_id);
        }
    }
}

/// Observes which nodes are present on the bus
///
/// Discovery is passive: every frame seen by the dispatcher whose COB-ID
/// belongs to a per-node service implies that node's existence. A
/// [search](Scanner::search) can be used to actively provoke responses.
#[derive(Debug, Clone)]
pub struct Scanner {
    network: NetworkHandle,
}

impl Scanner {
    pub(crate) fn new(network: NetworkHandle) -> Self {
        Self { network }
    }

    /// The node IDs discovered so far, in discovery order
    pub fn nodes(&self) -> Vec<u8> {
        self.network.scan_state().lock().unwrap().nodes.clone()
    }

    /// Forget all discovered nodes
    pub fn reset(&self) {
        self.network.scan_state().lock().unwrap().nodes.clear();
    }

    /// Actively search for nodes
    ///
    /// Sends an SDO upload request for object 0x1000 (device type) to every
    /// node ID up to `limit`. Responding nodes are picked up by the passive
    /// discovery when their SDO responses arrive.
    pub fn search(&self, limit: u8) -> Result<(), TransportError> {
        let request = [0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0];
        for node_id in 1..=limit.min(127) {
            self.network.send(0x600 + node_id as u32, &request)?;
        }
        Ok(())
    }
}
