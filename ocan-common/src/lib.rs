//! Shared protocol definitions for the ocan CANopen master stack.
//!
//! This crate holds everything the higher layers agree on:
//!
//! - [CanMessage] and the [CanSender]/[CanReceiver](traits::CanReceiver)
//!   transport seam
//! - Wire codecs for the broadcast services ([messages]), SDO transfers
//!   ([sdo]) and LSS ([lss])
//! - The object dictionary data model ([od]) with raw/physical/symbolic
//!   value conversion ([objects])
//!
//! Most applications will depend on `ocan-master` instead, which re-exports
//! this crate as `ocan_master::common`.
#![warn(missing_docs, missing_copy_implementations)]

pub mod constants;
pub mod lss;
pub mod messages;
pub mod node_id;
pub mod objects;
pub mod od;
pub mod sdo;
pub mod traits;

#[cfg(feature = "socketcan")]
mod socketcan;

#[cfg(feature = "socketcan")]
pub use socketcan::open_socketcan;

pub use messages::{CanId, CanMessage};
pub use node_id::NodeId;
pub use traits::{CanReceiver, CanSender, RecvError, TransportError};
