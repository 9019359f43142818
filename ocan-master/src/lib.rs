//! A host-side CANopen (CiA 301) master stack
//!
//! This crate lets an application talk to a fieldbus of up to 127 CANopen
//! nodes:
//!
//! - A [Network] owning the bus connection, the receive thread and the
//!   broadcast services (NMT, SYNC, TIME, LSS, node scanner)
//! - Per-node [RemoteNode] handles with an [SDO client](sdo::SdoClient)
//!   for object dictionary access, [PDO maps](pdo::PdoMap) for cyclic
//!   process data, an [NMT master](nmt::NmtMaster) with heartbeat
//!   consumer, and an [EMCY consumer](emcy::EmcyConsumer)
//! - Object dictionaries loaded from EDS/DCF files via the re-exported
//!   [eds] crate, with raw/physical/symbolic value conversion
//! - A TOML [node configuration](node_config::NodeConfig) format for
//!   commissioning
//!
//! The transport is pluggable through the
//! [CanSender](common::CanSender)/[CanReceiver](common::CanReceiver)
//! traits; the `socketcan` feature provides the Linux SocketCAN transport.
#![warn(missing_docs)]

pub mod emcy;
pub mod lss;
mod network;
pub mod nmt;
mod node;
pub mod node_config;
pub mod pdo;
mod periodic;
pub mod scanner;
pub mod sdo;
mod sync;
mod time;

pub use ocan_common as common;
pub use ocan_eds as eds;

pub use network::{FrameHandler, Network, NetworkHandle, Subscription};
pub use node::RemoteNode;
pub use periodic::PeriodicTask;
pub use scanner::Scanner;
pub use sync::SyncProducer;
pub use time::TimeProducer;
