//! CAN frame type and broadcast service messages
//!
//! Defines [CanMessage], the frame type used throughout the stack, plus
//! typed representations of the single-frame broadcast services: NMT
//! commands, heartbeats, SYNC, TIME and EMCY.

use snafu::Snafu;

use crate::constants::{EMCY_BASE, HEARTBEAT_BASE, NMT_CMD_ID, SYNC_ID, TIME_ID};

/// A CAN identifier, standard (11-bit) or extended (29-bit)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CanId {
    /// 29-bit extended identifier
    Extended(u32),
    /// 11-bit standard identifier
    Std(u16),
}

impl CanId {
    /// Create an extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the identifier value regardless of addressing mode
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Returns true for extended (29-bit) identifiers
    pub fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }
}

const MAX_DATA_LENGTH: usize = 8;

/// A classic CAN frame with up to 8 data bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanMessage {
    /// Frame payload; only the first `dlc` bytes are valid
    pub data: [u8; MAX_DATA_LENGTH],
    /// Number of valid payload bytes
    pub dlc: u8,
    /// Frame identifier
    pub id: CanId,
    /// Remote transmission request flag
    pub rtr: bool,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
            rtr: false,
        }
    }
}

impl CanMessage {
    /// Create a new data frame
    ///
    /// Panics if data exceeds 8 bytes.
    pub fn new(id: CanId, data: &[u8]) -> Self {
        if data.len() > MAX_DATA_LENGTH {
            panic!(
                "Data length exceeds maximum size of {} bytes",
                MAX_DATA_LENGTH
            );
        }
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..data.len()].copy_from_slice(data);
        Self {
            id,
            dlc: data.len() as u8,
            data: buf,
            rtr: false,
        }
    }

    /// Create a new remote (RTR) frame
    pub fn new_rtr(id: CanId) -> Self {
        Self {
            id,
            rtr: true,
            ..Default::default()
        }
    }

    /// Get the frame identifier
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get the valid payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }

    /// Returns true for remote (RTR) frames
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }
}

/// Error produced when decoding a typed message from a raw frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum MessageError {
    /// The frame payload is shorter than the message requires
    MessageTooShort,
    /// The frame COB-ID does not belong to the expected service
    #[snafu(display("Unexpected COB-ID 0x{cob_id:03X}"))]
    UnexpectedId {
        /// The offending COB-ID
        cob_id: u32,
    },
    /// A field in the message holds a value outside its defined set
    InvalidField,
    /// The NMT state byte is not a defined state
    #[snafu(display("Invalid NMT state byte 0x{value:02X}"))]
    InvalidNmtState {
        /// The offending byte
        value: u8,
    },
    /// The LSS command specifier is unknown
    #[snafu(display("Unexpected LSS command specifier 0x{value:02X}"))]
    UnexpectedLssCommand {
        /// The offending byte
        value: u8,
    },
}

/// NMT command specifiers sent by the master on COB-ID 0x000
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommandSpecifier {
    /// Transition the node to OPERATIONAL
    Start = 0x01,
    /// Transition the node to STOPPED
    Stop = 0x02,
    /// Transition the node to PRE-OPERATIONAL
    EnterPreOperational = 0x80,
    /// Reset the node application
    ResetNode = 0x81,
    /// Reset the node communication stack
    ResetComm = 0x82,
}

impl NmtCommandSpecifier {
    /// Decode a command specifier byte
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            0x01 => Ok(Self::Start),
            0x02 => Ok(Self::Stop),
            0x80 => Ok(Self::EnterPreOperational),
            0x81 => Ok(Self::ResetNode),
            0x82 => Ok(Self::ResetComm),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// An NMT command addressed to one node, or to all nodes when `node` is 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmtCommand {
    /// The commanded transition
    pub specifier: NmtCommandSpecifier,
    /// Target node ID; 0 addresses every node
    pub node: u8,
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        CanMessage::new(
            CanId::Std(NMT_CMD_ID as u16),
            &[cmd.specifier as u8, cmd.node],
        )
    }
}

impl TryFrom<CanMessage> for NmtCommand {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        if msg.id().raw() != NMT_CMD_ID {
            return Err(MessageError::UnexpectedId {
                cob_id: msg.id().raw(),
            });
        }
        let payload = msg.data();
        if payload.len() < 2 {
            return Err(MessageError::MessageTooShort);
        }
        Ok(NmtCommand {
            specifier: NmtCommandSpecifier::from_byte(payload[0])?,
            node: payload[1],
        })
    }
}

/// NMT states reported in heartbeat messages
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtState {
    /// One-shot boot-up message, sent on the transition to PRE-OPERATIONAL
    Bootup = 0,
    /// Only NMT and heartbeat are serviced
    Stopped = 4,
    /// Fully operating, PDOs are exchanged
    Operational = 5,
    /// SDO access is available but PDOs are disabled
    PreOperational = 0x7F,
}

impl TryFrom<u8> for NmtState {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NmtState::Bootup),
            4 => Ok(NmtState::Stopped),
            5 => Ok(NmtState::Operational),
            0x7F => Ok(NmtState::PreOperational),
            _ => Err(MessageError::InvalidNmtState { value }),
        }
    }
}

impl NmtState {
    /// The conventional display string for this state
    pub fn as_str(&self) -> &'static str {
        match self {
            NmtState::Bootup => "INITIALISING",
            NmtState::Stopped => "STOPPED",
            NmtState::Operational => "OPERATIONAL",
            NmtState::PreOperational => "PRE-OPERATIONAL",
        }
    }
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A heartbeat message as observed on 0x700 + node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// The producing node
    pub node: u8,
    /// The reported NMT state
    pub state: NmtState,
    /// The node guarding toggle bit (bit 7 of the payload)
    pub toggle: bool,
}

impl TryFrom<CanMessage> for Heartbeat {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let raw = msg.id().raw();
        let node = (raw & 0x7F) as u8;
        if raw & !0x7F != HEARTBEAT_BASE || node == 0 {
            return Err(MessageError::UnexpectedId { cob_id: raw });
        }
        let payload = msg.data();
        if payload.is_empty() {
            return Err(MessageError::MessageTooShort);
        }
        Ok(Heartbeat {
            node,
            state: NmtState::try_from(payload[0] & 0x7F)?,
            toggle: payload[0] & 0x80 != 0,
        })
    }
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        let mut state = value.state as u8;
        if value.toggle {
            state |= 0x80;
        }
        CanMessage::new(
            CanId::Std((HEARTBEAT_BASE as u16) | value.node as u16),
            &[state],
        )
    }
}

/// A SYNC object, optionally carrying a counter byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncMessage {
    /// Optional SYNC counter (1-240, wrapping back to 1)
    pub count: Option<u8>,
}

impl From<SyncMessage> for CanMessage {
    fn from(value: SyncMessage) -> Self {
        match value.count {
            Some(count) => CanMessage::new(CanId::Std(SYNC_ID as u16), &[count]),
            None => CanMessage::new(CanId::Std(SYNC_ID as u16), &[]),
        }
    }
}

impl TryFrom<CanMessage> for SyncMessage {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        if msg.id().raw() != SYNC_ID {
            return Err(MessageError::UnexpectedId {
                cob_id: msg.id().raw(),
            });
        }
        Ok(SyncMessage {
            count: msg.data().first().copied(),
        })
    }
}

/// Number of seconds between the Unix epoch and 1984-01-01, the CANopen epoch
pub const TIME_OF_DAY_EPOCH_OFFSET: u64 = 441_763_200;

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// The 6-byte TIME-OF-DAY structure broadcast on COB-ID 0x100
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    /// Milliseconds since midnight
    pub millis: u32,
    /// Days since 1984-01-01
    pub days: u16,
}

impl TimeOfDay {
    /// Build a TIME-OF-DAY value from a count of milliseconds since the
    /// CANopen epoch (1984-01-01)
    pub fn from_epoch_millis(millis: u64) -> Self {
        Self {
            days: (millis / MILLIS_PER_DAY) as u16,
            millis: (millis % MILLIS_PER_DAY) as u32,
        }
    }
}

impl From<TimeOfDay> for CanMessage {
    fn from(value: TimeOfDay) -> Self {
        let mut data = [0u8; 6];
        data[0..4].copy_from_slice(&value.millis.to_le_bytes());
        data[4..6].copy_from_slice(&value.days.to_le_bytes());
        CanMessage::new(CanId::Std(TIME_ID as u16), &data)
    }
}

impl TryFrom<CanMessage> for TimeOfDay {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let payload = msg.data();
        if payload.len() < 6 {
            return Err(MessageError::MessageTooShort);
        }
        Ok(TimeOfDay {
            millis: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            days: u16::from_le_bytes(payload[4..6].try_into().unwrap()),
        })
    }
}

/// An emergency message as produced on 0x080 + node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmcyMessage {
    /// The producing node
    pub node: u8,
    /// 16-bit emergency error code
    pub code: u16,
    /// Contents of the error register (object 0x1001)
    pub register: u8,
    /// Manufacturer specific data
    pub vendor: [u8; 5],
}

impl TryFrom<CanMessage> for EmcyMessage {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let raw = msg.id().raw();
        let node = (raw & 0x7F) as u8;
        // Node 0 would be the SYNC object
        if raw & !0x7F != EMCY_BASE || node == 0 {
            return Err(MessageError::UnexpectedId { cob_id: raw });
        }
        let payload = msg.data();
        if payload.len() < 8 {
            return Err(MessageError::MessageTooShort);
        }
        Ok(EmcyMessage {
            node,
            code: u16::from_le_bytes(payload[0..2].try_into().unwrap()),
            register: payload[2],
            vendor: payload[3..8].try_into().unwrap(),
        })
    }
}

impl From<EmcyMessage> for CanMessage {
    fn from(value: EmcyMessage) -> Self {
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&value.code.to_le_bytes());
        data[2] = value.register;
        data[3..8].copy_from_slice(&value.vendor);
        CanMessage::new(CanId::Std((EMCY_BASE as u16) | value.node as u16), &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nmt_command_round_trip() {
        let msg: CanMessage = NmtCommand {
            specifier: NmtCommandSpecifier::Start,
            node: 0,
        }
        .into();
        assert_eq!(0x000, msg.id().raw());
        assert_eq!(&[0x01, 0x00], msg.data());

        let parsed: NmtCommand = msg.try_into().unwrap();
        assert_eq!(NmtCommandSpecifier::Start, parsed.specifier);
        assert_eq!(0, parsed.node);
    }

    #[test]
    fn test_heartbeat_parse() {
        let msg = CanMessage::new(CanId::std(0x705), &[0x05]);
        let hb: Heartbeat = msg.try_into().unwrap();
        assert_eq!(5, hb.node);
        assert_eq!(NmtState::Operational, hb.state);
        assert!(!hb.toggle);

        // Node guarding response carries the toggle bit
        let msg = CanMessage::new(CanId::std(0x705), &[0x85]);
        let hb: Heartbeat = msg.try_into().unwrap();
        assert!(hb.toggle);
        assert_eq!(NmtState::Operational, hb.state);

        let msg = CanMessage::new(CanId::std(0x705), &[0x33]);
        assert_eq!(
            Err(MessageError::InvalidNmtState { value: 0x33 }),
            Heartbeat::try_from(msg)
        );
    }

    #[test]
    fn test_emcy_parse() {
        let msg = CanMessage::new(
            CanId::std(0x086),
            &[0x10, 0x82, 0x20, 0, 0, 0, 0, 0],
        );
        let emcy: EmcyMessage = msg.try_into().unwrap();
        assert_eq!(6, emcy.node);
        assert_eq!(0x8210, emcy.code);
        assert_eq!(0x20, emcy.register);
        assert_eq!([0; 5], emcy.vendor);
    }

    #[test]
    fn test_time_of_day() {
        // 1984-01-02 00:00:01.500
        let tod = TimeOfDay::from_epoch_millis(MILLIS_PER_DAY + 1500);
        assert_eq!(1, tod.days);
        assert_eq!(1500, tod.millis);

        let msg: CanMessage = tod.into();
        assert_eq!(0x100, msg.id().raw());
        assert_eq!(&[0xDC, 0x05, 0, 0, 0x01, 0], msg.data());
        assert_eq!(Ok(tod), TimeOfDay::try_from(msg));
    }
}
