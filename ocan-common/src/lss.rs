//! LSS (Layer Setting Services) wire protocol
//!
//! Message types for the LSS master/slave exchange on COB-IDs 0x7E5 and
//! 0x7E4. All LSS frames are 8 bytes with the command specifier in byte 0;
//! unused bytes are reserved and transmitted as zero.

use crate::constants::{LSS_REQ_ID, LSS_RESP_ID};
use crate::messages::{CanId, CanMessage, MessageError};

/// LSS command specifier values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LssCommandSpecifier {
    /// Switch every slave to the given mode
    SwitchModeGlobal = 0x04,
    /// Set the node ID of the slave in configuration mode
    ConfigureNodeId = 0x11,
    /// Set the bit timing of the slave in configuration mode
    ConfigureBitTiming = 0x13,
    /// Activate previously configured bit timing
    ActivateBitTiming = 0x15,
    /// Persist node ID and bit timing on the slave
    StoreConfiguration = 0x17,
    /// Selective switch: vendor ID word
    SwitchStateVendor = 0x40,
    /// Selective switch: product code word
    SwitchStateProduct = 0x41,
    /// Selective switch: revision number word
    SwitchStateRevision = 0x42,
    /// Selective switch: serial number word
    SwitchStateSerial = 0x43,
    /// Slave confirmation of a completed selective switch
    SwitchStateResponse = 0x44,
    /// Slave response to a matching fastscan probe
    IdentifySlave = 0x4F,
    /// Fastscan probe
    FastScan = 0x51,
    /// Read the vendor ID of the slave in configuration mode
    InquireVendor = 0x5A,
    /// Read the product code of the slave in configuration mode
    InquireProduct = 0x5B,
    /// Read the revision number of the slave in configuration mode
    InquireRevision = 0x5C,
    /// Read the serial number of the slave in configuration mode
    InquireSerial = 0x5D,
    /// Read the node ID of the slave in configuration mode
    InquireNodeId = 0x5E,
}

impl LssCommandSpecifier {
    /// Decode a command specifier byte
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        use LssCommandSpecifier::*;
        match b {
            0x04 => Ok(SwitchModeGlobal),
            0x11 => Ok(ConfigureNodeId),
            0x13 => Ok(ConfigureBitTiming),
            0x15 => Ok(ActivateBitTiming),
            0x17 => Ok(StoreConfiguration),
            0x40 => Ok(SwitchStateVendor),
            0x41 => Ok(SwitchStateProduct),
            0x42 => Ok(SwitchStateRevision),
            0x43 => Ok(SwitchStateSerial),
            0x44 => Ok(SwitchStateResponse),
            0x4F => Ok(IdentifySlave),
            0x51 => Ok(FastScan),
            0x5A => Ok(InquireVendor),
            0x5B => Ok(InquireProduct),
            0x5C => Ok(InquireRevision),
            0x5D => Ok(InquireSerial),
            0x5E => Ok(InquireNodeId),
            _ => Err(MessageError::UnexpectedLssCommand { value: b }),
        }
    }
}

/// Special `bit_check` value which resets the slave fastscan state machines
/// and asks every unconfigured slave to confirm its presence
pub const LSS_FASTSCAN_CONFIRM: u8 = 0x80;

/// The LSS slave mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LssState {
    /// Normal operation; configuration commands are ignored
    Waiting = 0,
    /// The slave accepts configuration commands
    Configuration = 1,
}

impl LssState {
    /// Decode a mode byte
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            0 => Ok(Self::Waiting),
            1 => Ok(Self::Configuration),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// The 128-bit LSS identity of a slave, as held in object 0x1018
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LssIdentity {
    /// Vendor ID
    pub vendor_id: u32,
    /// Product code
    pub product_code: u32,
    /// Revision number
    pub revision: u32,
    /// Serial number
    pub serial: u32,
}

impl LssIdentity {
    /// Create an identity from its four words
    pub fn new(vendor_id: u32, product_code: u32, revision: u32, serial: u32) -> Self {
        Self {
            vendor_id,
            product_code,
            revision,
            serial,
        }
    }

    /// Get an identity word by its fastscan sub index (0-3)
    pub fn word(&self, sub: u8) -> u32 {
        match sub {
            0 => self.vendor_id,
            1 => self.product_code,
            2 => self.revision,
            3 => self.serial,
            _ => panic!("Invalid LSS identity sub index"),
        }
    }
}

impl core::fmt::Display for LssIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:08X}:{:08X}:{:08X}:{:08X}",
            self.vendor_id, self.product_code, self.revision, self.serial
        )
    }
}

/// A request frame sent from LSS master to slave on COB-ID 0x7E5
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LssRequest {
    /// Switch every slave to the given mode; no response is generated
    SwitchModeGlobal {
        /// The requested [LssState] as a byte
        mode: u8,
    },
    /// Selective switch: vendor ID word
    SwitchStateVendor {
        /// The vendor ID to match
        vendor_id: u32,
    },
    /// Selective switch: product code word
    SwitchStateProduct {
        /// The product code to match
        product_code: u32,
    },
    /// Selective switch: revision word
    SwitchStateRevision {
        /// The revision number to match
        revision: u32,
    },
    /// Selective switch: serial word; a fully matched slave responds
    SwitchStateSerial {
        /// The serial number to match
        serial: u32,
    },
    /// Set the node ID of the slave in configuration mode
    ConfigureNodeId {
        /// The new node ID
        node_id: u8,
    },
    /// Set the bit timing of the slave in configuration mode
    ConfigureBitTiming {
        /// Bit timing table selector; 0 is the standard CiA table
        /// (0: 1M, 1: 800k, 2: 500k, 3: 250k, 4: 125k, 5: 100k, 6: 50k,
        /// 7: 20k, 8: 10k bit/s)
        table: u8,
        /// Index into the selected table
        index: u8,
    },
    /// Persist node ID and bit timing on the slave
    StoreConfiguration,
    /// Read an identity word or the node ID of the slave in configuration
    /// mode
    Inquire {
        /// One of the `Inquire*` command specifiers
        cs: LssCommandSpecifier,
    },
    /// Fastscan probe
    FastScan {
        /// The guessed identity word
        id: u32,
        /// Number of unchecked low bits; slaves compare only bits above it
        bit_check: u8,
        /// The identity word being scanned (0-3)
        sub: u8,
        /// The identity word the next probe will scan
        next: u8,
    },
}

impl LssRequest {
    /// Encode to the 8-byte frame payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0u8; 8];
        match self {
            LssRequest::SwitchModeGlobal { mode } => {
                payload[0] = LssCommandSpecifier::SwitchModeGlobal as u8;
                payload[1] = mode;
            }
            LssRequest::SwitchStateVendor { vendor_id } => {
                payload[0] = LssCommandSpecifier::SwitchStateVendor as u8;
                payload[1..5].copy_from_slice(&vendor_id.to_le_bytes());
            }
            LssRequest::SwitchStateProduct { product_code } => {
                payload[0] = LssCommandSpecifier::SwitchStateProduct as u8;
                payload[1..5].copy_from_slice(&product_code.to_le_bytes());
            }
            LssRequest::SwitchStateRevision { revision } => {
                payload[0] = LssCommandSpecifier::SwitchStateRevision as u8;
                payload[1..5].copy_from_slice(&revision.to_le_bytes());
            }
            LssRequest::SwitchStateSerial { serial } => {
                payload[0] = LssCommandSpecifier::SwitchStateSerial as u8;
                payload[1..5].copy_from_slice(&serial.to_le_bytes());
            }
            LssRequest::ConfigureNodeId { node_id } => {
                payload[0] = LssCommandSpecifier::ConfigureNodeId as u8;
                payload[1] = node_id;
            }
            LssRequest::ConfigureBitTiming { table, index } => {
                payload[0] = LssCommandSpecifier::ConfigureBitTiming as u8;
                payload[1] = table;
                payload[2] = index;
            }
            LssRequest::StoreConfiguration => {
                payload[0] = LssCommandSpecifier::StoreConfiguration as u8;
            }
            LssRequest::Inquire { cs } => {
                payload[0] = cs as u8;
            }
            LssRequest::FastScan {
                id,
                bit_check,
                sub,
                next,
            } => {
                payload[0] = LssCommandSpecifier::FastScan as u8;
                payload[1..5].copy_from_slice(&id.to_le_bytes());
                payload[5] = bit_check;
                payload[6] = sub;
                payload[7] = next;
            }
        }
        payload
    }

    /// Encode to a CAN frame on the master-to-slave COB-ID
    pub fn to_can_message(self) -> CanMessage {
        CanMessage::new(CanId::Std(LSS_REQ_ID as u16), &self.to_bytes())
    }
}

impl TryFrom<&[u8]> for LssRequest {
    type Error = MessageError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(MessageError::MessageTooShort);
        }
        let cs = LssCommandSpecifier::from_byte(value[0])?;
        let word = u32::from_le_bytes(value[1..5].try_into().unwrap());
        use LssCommandSpecifier::*;
        match cs {
            SwitchModeGlobal => Ok(Self::SwitchModeGlobal { mode: value[1] }),
            SwitchStateVendor => Ok(Self::SwitchStateVendor { vendor_id: word }),
            SwitchStateProduct => Ok(Self::SwitchStateProduct {
                product_code: word,
            }),
            SwitchStateRevision => Ok(Self::SwitchStateRevision { revision: word }),
            SwitchStateSerial => Ok(Self::SwitchStateSerial { serial: word }),
            ConfigureNodeId => Ok(Self::ConfigureNodeId { node_id: value[1] }),
            ConfigureBitTiming => Ok(Self::ConfigureBitTiming {
                table: value[1],
                index: value[2],
            }),
            StoreConfiguration => Ok(Self::StoreConfiguration),
            InquireVendor | InquireProduct | InquireRevision | InquireSerial
            | InquireNodeId => Ok(Self::Inquire { cs }),
            FastScan => Ok(Self::FastScan {
                id: word,
                bit_check: value[5],
                sub: value[6],
                next: value[7],
            }),
            SwitchStateResponse | IdentifySlave | ActivateBitTiming => {
                Err(MessageError::UnexpectedLssCommand { value: value[0] })
            }
        }
    }
}

impl TryFrom<CanMessage> for LssRequest {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        if msg.id().raw() != LSS_REQ_ID {
            return Err(MessageError::UnexpectedId {
                cob_id: msg.id().raw(),
            });
        }
        msg.data().try_into()
    }
}

/// A response frame sent from LSS slave to master on COB-ID 0x7E4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LssResponse {
    /// Confirmation of a completed selective switch
    SwitchStateResponse,
    /// Response to a matching fastscan probe
    IdentifySlave,
    /// Result of a [LssRequest::ConfigureNodeId]
    ConfigureNodeIdAck {
        /// 0 on success, 1 for an inadmissible node ID, 0xFF for a
        /// manufacturer specific error in `spec_error`
        error: u8,
        /// Manufacturer specific error code, valid when `error` is 0xFF
        spec_error: u8,
    },
    /// Result of a [LssRequest::ConfigureBitTiming]
    ConfigureBitTimingAck {
        /// 0 on success, 1 for an unsupported bit timing, 0xFF for a
        /// manufacturer specific error in `spec_error`
        error: u8,
        /// Manufacturer specific error code, valid when `error` is 0xFF
        spec_error: u8,
    },
    /// Result of a [LssRequest::StoreConfiguration]
    StoreConfigurationAck {
        /// 0 on success, 1 when storing is not supported, 2 on a storage
        /// access problem, 0xFF for a manufacturer specific error
        error: u8,
        /// Manufacturer specific error code, valid when `error` is 0xFF
        spec_error: u8,
    },
    /// Reply to one of the identity word inquiries
    InquireReply {
        /// The echoed `Inquire*` command specifier
        cs: LssCommandSpecifier,
        /// The inquired identity word
        value: u32,
    },
    /// Reply to a node ID inquiry
    InquireNodeIdReply {
        /// The currently configured node ID
        node_id: u8,
    },
}

impl LssResponse {
    /// Encode to the 8-byte frame payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0u8; 8];
        match self {
            LssResponse::SwitchStateResponse => {
                payload[0] = LssCommandSpecifier::SwitchStateResponse as u8;
            }
            LssResponse::IdentifySlave => {
                payload[0] = LssCommandSpecifier::IdentifySlave as u8;
            }
            LssResponse::ConfigureNodeIdAck { error, spec_error } => {
                payload[0] = LssCommandSpecifier::ConfigureNodeId as u8;
                payload[1] = error;
                payload[2] = spec_error;
            }
            LssResponse::ConfigureBitTimingAck { error, spec_error } => {
                payload[0] = LssCommandSpecifier::ConfigureBitTiming as u8;
                payload[1] = error;
                payload[2] = spec_error;
            }
            LssResponse::StoreConfigurationAck { error, spec_error } => {
                payload[0] = LssCommandSpecifier::StoreConfiguration as u8;
                payload[1] = error;
                payload[2] = spec_error;
            }
            LssResponse::InquireReply { cs, value } => {
                payload[0] = cs as u8;
                payload[1..5].copy_from_slice(&value.to_le_bytes());
            }
            LssResponse::InquireNodeIdReply { node_id } => {
                payload[0] = LssCommandSpecifier::InquireNodeId as u8;
                payload[1] = node_id;
            }
        }
        payload
    }

    /// Encode to a CAN frame on the slave-to-master COB-ID
    pub fn to_can_message(self) -> CanMessage {
        CanMessage::new(CanId::Std(LSS_RESP_ID as u16), &self.to_bytes())
    }
}

impl TryFrom<&[u8]> for LssResponse {
    type Error = MessageError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(MessageError::MessageTooShort);
        }
        let cs = LssCommandSpecifier::from_byte(value[0])?;
        use LssCommandSpecifier::*;
        match cs {
            SwitchStateResponse => Ok(Self::SwitchStateResponse),
            IdentifySlave => Ok(Self::IdentifySlave),
            ConfigureNodeId | ConfigureBitTiming | StoreConfiguration => {
                if value.len() < 3 {
                    return Err(MessageError::MessageTooShort);
                }
                let (error, spec_error) = (value[1], value[2]);
                Ok(match cs {
                    ConfigureNodeId => Self::ConfigureNodeIdAck { error, spec_error },
                    ConfigureBitTiming => Self::ConfigureBitTimingAck { error, spec_error },
                    _ => Self::StoreConfigurationAck { error, spec_error },
                })
            }
            InquireVendor | InquireProduct | InquireRevision | InquireSerial => {
                if value.len() < 5 {
                    return Err(MessageError::MessageTooShort);
                }
                Ok(Self::InquireReply {
                    cs,
                    value: u32::from_le_bytes(value[1..5].try_into().unwrap()),
                })
            }
            InquireNodeId => {
                if value.len() < 2 {
                    return Err(MessageError::MessageTooShort);
                }
                Ok(Self::InquireNodeIdReply { node_id: value[1] })
            }
            _ => Err(MessageError::UnexpectedLssCommand { value: value[0] }),
        }
    }
}

impl TryFrom<CanMessage> for LssResponse {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        if msg.id().raw() != LSS_RESP_ID {
            return Err(MessageError::UnexpectedId {
                cob_id: msg.id().raw(),
            });
        }
        msg.data().try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_selective_encoding() {
        let req = LssRequest::SwitchStateVendor { vendor_id: 0x11 };
        assert_eq!([0x40, 0x11, 0, 0, 0, 0, 0, 0], req.to_bytes());
        let msg = req.to_can_message();
        assert_eq!(0x7E5, msg.id().raw());
    }

    #[test]
    fn test_fastscan_round_trip() {
        let req = LssRequest::FastScan {
            id: 0xAABBCCDD,
            bit_check: 31,
            sub: 2,
            next: 2,
        };
        let bytes = req.to_bytes();
        assert_eq!([0x51, 0xDD, 0xCC, 0xBB, 0xAA, 31, 2, 2], bytes);
        assert_eq!(Ok(req), LssRequest::try_from(&bytes[..]));
    }

    #[test]
    fn test_inquire_node_id_reply() {
        let resp = LssResponse::try_from(&[0x5Eu8, 42, 0, 0, 0, 0, 0, 0][..]).unwrap();
        assert_eq!(LssResponse::InquireNodeIdReply { node_id: 42 }, resp);
    }

    #[test]
    fn test_identity_words() {
        let id = LssIdentity::new(1, 2, 3, 4);
        assert_eq!(1, id.word(0));
        assert_eq!(4, id.word(3));
    }
}
