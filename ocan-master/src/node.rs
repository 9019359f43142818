//! Remote node container

use std::sync::Arc;

use ocan_common::constants::{object_ids, values};
use ocan_common::od::ObjectDictionary;
use ocan_common::NodeId;

use crate::emcy::EmcyConsumer;
use crate::network::NetworkHandle;
use crate::nmt::NmtMaster;
use crate::pdo::{PdoKind, PdoMaps, PdoVariable};
use crate::sdo::{SdoClient, SdoClientError, SdoNode};

/// One remote node on the network
///
/// Bundles the per-node protocol endpoints: the SDO client, the transmit
/// and receive PDO maps, the NMT master with its heartbeat consumer, and
/// the EMCY consumer. Created through
/// [Network::add_node](crate::Network::add_node).
#[derive(Debug)]
pub struct RemoteNode {
    id: NodeId,
    od: Arc<ObjectDictionary>,
    /// Dictionary-aware SDO access
    pub sdo: SdoNode,
    /// PDOs the node transmits to the host
    pub tpdo: PdoMaps,
    /// PDOs the host transmits to the node
    pub rpdo: PdoMaps,
    /// NMT master and heartbeat consumer for this node
    pub nmt: NmtMaster,
    /// EMCY consumer for this node
    pub emcy: EmcyConsumer,
}

impl RemoteNode {
    pub(crate) fn new(network: NetworkHandle, id: NodeId, od: ObjectDictionary) -> Arc<Self> {
        let od = Arc::new(od);
        let client = Arc::new(SdoClient::new_std(network.clone(), id.raw(), od.clone()));
        Arc::new(Self {
            id,
            sdo: SdoNode::new(client.clone()),
            tpdo: PdoMaps::new(
                PdoKind::Tx,
                id.raw(),
                network.clone(),
                client.clone(),
                od.clone(),
            ),
            rpdo: PdoMaps::new(
                PdoKind::Rx,
                id.raw(),
                network.clone(),
                client.clone(),
                od.clone(),
            ),
            nmt: NmtMaster::new(network.clone(), id.raw()),
            emcy: EmcyConsumer::new(network, id.raw()),
            od,
        })
    }

    /// The node's ID
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The node's object dictionary
    pub fn od(&self) -> &Arc<ObjectDictionary> {
        &self.od
    }

    /// Find a mapped variable by name across all PDOs of this node
    pub fn pdo_variable(&self, name: &str) -> Option<PdoVariable> {
        self.tpdo
            .variable(name)
            .or_else(|| self.rpdo.variable(name))
    }

    /// Read the configuration of every PDO from the node
    pub fn read_pdos(&self) -> Result<(), crate::pdo::PdoError> {
        self.tpdo.read()?;
        self.rpdo.read()
    }

    /// Write the configuration of every PDO to the node
    pub fn save_pdos(&self) -> Result<(), crate::pdo::PdoError> {
        self.tpdo.save()?;
        self.rpdo.save()
    }

    /// Make the node persist its parameters (writes "save" to 0x1010)
    pub fn store_parameters(&self) -> Result<(), SdoClientError> {
        self.sdo
            .download(object_ids::STORE_PARAMETERS, 1, &values::STORE_MAGIC)
    }

    /// Make the node restore its default parameters (writes "load" to
    /// 0x1011)
    pub fn restore_parameters(&self) -> Result<(), SdoClientError> {
        self.sdo
            .download(object_ids::RESTORE_PARAMETERS, 1, &values::RESTORE_MAGIC)
    }

    /// Stop all background transmissions owned by this node
    pub(crate) fn shutdown(&self) {
        self.tpdo.stop();
        self.rpdo.stop();
        self.nmt.stop_node_guarding();
    }

    /// Stop background work and release every subscription
    pub(crate) fn detach(&self) {
        self.shutdown();
        self.tpdo.detach();
        self.rpdo.detach();
        self.nmt.detach();
        self.emcy.detach();
        self.sdo.client().detach();
    }
}
