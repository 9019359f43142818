//! COB-ID allocation and standard object indices
//!
//! The function code bases follow the pre-defined connection set of CiA 301.

/// COB-ID of NMT commands (master to all nodes)
pub const NMT_CMD_ID: u32 = 0x000;
/// COB-ID of the SYNC object
pub const SYNC_ID: u32 = 0x080;
/// Base COB-ID for emergency messages (node ID is added)
pub const EMCY_BASE: u32 = 0x080;
/// COB-ID of the TIME object
pub const TIME_ID: u32 = 0x100;
/// Base COB-IDs of the four predefined transmit PDOs (node ID is added)
pub const TPDO_BASES: [u32; 4] = [0x180, 0x280, 0x380, 0x480];
/// Base COB-IDs of the four predefined receive PDOs (node ID is added)
pub const RPDO_BASES: [u32; 4] = [0x200, 0x300, 0x400, 0x500];
/// Base COB-ID for SDO responses, server to client (node ID is added)
pub const SDO_RESP_BASE: u32 = 0x580;
/// Base COB-ID for SDO requests, client to server (node ID is added)
pub const SDO_REQ_BASE: u32 = 0x600;
/// Base COB-ID for heartbeat messages (node ID is added)
pub const HEARTBEAT_BASE: u32 = 0x700;
/// COB-ID for LSS responses, slave to master
pub const LSS_RESP_ID: u32 = 0x7E4;
/// COB-ID for LSS requests, master to slave
pub const LSS_REQ_ID: u32 = 0x7E5;

/// Indices of standard objects every node is expected to implement
pub mod object_ids {
    /// Device type
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// Error register
    pub const ERROR_REGISTER: u16 = 0x1001;
    /// Manufacturer device name
    pub const DEVICE_NAME: u16 = 0x1008;
    /// Manufacturer hardware version
    pub const HARDWARE_VERSION: u16 = 0x1009;
    /// Manufacturer software version
    pub const SOFTWARE_VERSION: u16 = 0x100A;
    /// Store parameters command
    pub const STORE_PARAMETERS: u16 = 0x1010;
    /// Restore default parameters command
    pub const RESTORE_PARAMETERS: u16 = 0x1011;
    /// Producer heartbeat time
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// Identity object
    pub const IDENTITY: u16 = 0x1018;
    /// First RPDO communication parameter record
    pub const RPDO_COM_BASE: u16 = 0x1400;
    /// First RPDO mapping parameter record
    pub const RPDO_MAP_BASE: u16 = 0x1600;
    /// First TPDO communication parameter record
    pub const TPDO_COM_BASE: u16 = 0x1800;
    /// First TPDO mapping parameter record
    pub const TPDO_MAP_BASE: u16 = 0x1A00;
}

/// Magic values written to the store/restore command objects
pub mod values {
    /// ASCII "save", written to 0x1010 to persist parameters
    pub const STORE_MAGIC: [u8; 4] = *b"save";
    /// ASCII "load", written to 0x1011 to restore defaults
    pub const RESTORE_MAGIC: [u8; 4] = *b"load";
}

/// Set in a PDO COB-ID entry when the PDO is disabled
pub const PDO_NOT_VALID: u32 = 1 << 31;
/// Set in a PDO COB-ID entry when remote transmit requests are not allowed
pub const PDO_RTR_NOT_ALLOWED: u32 = 1 << 30;
