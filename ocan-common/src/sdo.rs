//! SDO wire protocol
//!
//! Message types for all three SDO transfer subprotocols (expedited,
//! segmented and block), the abort codes, and the block transfer CRC.
//!
//! Block data segments carry a bare sequence number instead of a command
//! specifier, so they cannot be told apart from other frames without
//! knowing the transfer state. [SdoRequest] and [SdoResponse] carry
//! variants for them for encoding purposes; decoding them is left to the
//! transfer logic which knows a block data phase is active.

use int_enum::IntEnum;

use crate::messages::{CanId, CanMessage};

/// Client command specifier (CCS) values, bits 5-7 of a request
#[derive(Copy, Clone, Debug)]
#[repr(u8)]
enum ClientCommand {
    DownloadSegment = 0,
    InitiateDownload = 1,
    InitiateUpload = 2,
    UploadSegmentRequest = 3,
    Abort = 4,
    BlockUpload = 5,
    BlockDownload = 6,
}

/// Server command specifier (SCS) values, bits 5-7 of a response
#[derive(Copy, Clone, Debug)]
#[repr(u8)]
enum ServerCommand {
    UploadSegment = 0,
    DownloadSegmentAck = 1,
    UploadResponse = 2,
    DownloadAck = 3,
    Abort = 4,
    BlockDownloadResponse = 5,
    BlockUploadResponse = 6,
}

/// Block transfer subcommand values, bits 0-1
mod block_sub {
    pub const INITIATE: u8 = 0;
    pub const END: u8 = 1;
    pub const ACK: u8 = 2;
    pub const START: u8 = 3;
}

/// SDO abort codes
///
/// The reasons a transfer can be refused or torn down, as carried in the
/// last four bytes of an abort frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    Timeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Invalid block size (block mode only)
    InvalidBlockSize = 0x0504_0002,
    /// Invalid sequence number (block mode only)
    InvalidSequenceNumber = 0x0504_0003,
    /// CRC error (block mode only)
    CrcError = 0x0504_0004,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    UnmappableObject = 0x0604_0041,
    /// The number and length of objects would exceed the PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to a hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Value of parameter too high (download only)
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter too low (download only)
    ValueTooLow = 0x0609_0032,
    /// Resource is not available
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be transferred because of local control
    CantStoreLocalControl = 0x0800_0021,
    /// Data cannot be transferred because of the device state
    CantStoreDeviceState = 0x0800_0022,
    /// No object dictionary is present
    NoObjectDict = 0x0800_0023,
    /// No data available
    NoData = 0x0800_0024,
}

impl AbortCode {
    /// A human readable description of the abort reason
    pub fn description(&self) -> &'static str {
        use AbortCode::*;
        match self {
            ToggleNotAlternated => "Toggle bit not alternated",
            Timeout => "SDO protocol timed out",
            InvalidCommandSpecifier => "Client/server command specifier not valid or unknown",
            InvalidBlockSize => "Invalid block size",
            InvalidSequenceNumber => "Invalid sequence number",
            CrcError => "CRC error",
            OutOfMemory => "Out of memory",
            UnsupportedAccess => "Unsupported access to an object",
            WriteOnly => "Attempt to read a write only object",
            ReadOnly => "Attempt to write a read only object",
            NoSuchObject => "Object does not exist in the object dictionary",
            UnmappableObject => "Object cannot be mapped to the PDO",
            PdoTooLong => "The number and length of the objects would exceed the PDO length",
            IncompatibleParameter => "General parameter incompatibility",
            HardwareError => "Access failed due to a hardware error",
            DataTypeMismatch => "Data type does not match, length of service parameter does not match",
            DataTypeMismatchLengthHigh => "Data type does not match, length of service parameter too high",
            DataTypeMismatchLengthLow => "Data type does not match, length of service parameter too low",
            NoSuchSubIndex => "Sub-index does not exist",
            InvalidValue => "Invalid value for parameter",
            ValueTooHigh => "Value of parameter written too high",
            ValueTooLow => "Value of parameter written too low",
            ResourceNotAvailable => "Resource not available",
            GeneralError => "General error",
            CantStore => "Data cannot be transferred or stored to the application",
            CantStoreLocalControl => {
                "Data cannot be transferred or stored to the application because of local control"
            }
            CantStoreDeviceState => {
                "Data cannot be transferred or stored to the application because of the device state"
            }
            NoObjectDict => "No object dictionary is present",
            NoData => "No data available",
        }
    }
}

/// A 32-bit abort code which may or may not be one of the defined codes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawAbortCode {
    /// A defined abort code
    Valid(AbortCode),
    /// A code outside the defined set
    Unknown(u32),
}

impl RawAbortCode {
    /// The numeric abort code
    pub fn code(&self) -> u32 {
        match self {
            RawAbortCode::Valid(c) => (*c).into(),
            RawAbortCode::Unknown(c) => *c,
        }
    }
}

impl From<u32> for RawAbortCode {
    fn from(value: u32) -> Self {
        match AbortCode::try_from(value) {
            Ok(code) => RawAbortCode::Valid(code),
            Err(_) => RawAbortCode::Unknown(value),
        }
    }
}

impl core::fmt::Display for RawAbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RawAbortCode::Valid(code) => {
                write!(f, "0x{:08X} ({})", u32::from(*code), code.description())
            }
            RawAbortCode::Unknown(code) => write!(f, "0x{code:08X}"),
        }
    }
}

/// A request frame sent from SDO client to server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdoRequest {
    /// Begin a download, writing data to an object on the server
    InitiateDownload {
        /// Number of unused bytes in `data` (expedited only)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size indicated flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Inline value when expedited, total size when `e=0, s=1`
        data: [u8; 4],
    },
    /// One segment of a segmented download
    DownloadSegment {
        /// Toggle bit
        t: bool,
        /// Number of unused bytes in `data`
        n: u8,
        /// Last segment flag
        c: bool,
        /// Segment payload
        data: [u8; 7],
    },
    /// Begin an upload, reading an object from the server
    InitiateUpload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Request the next segment of a segmented upload
    UploadSegmentRequest {
        /// Toggle bit
        t: bool,
    },
    /// Tear down the active transfer
    Abort {
        /// Object index of the active transfer
        index: u16,
        /// Object sub-index of the active transfer
        sub: u8,
        /// The abort reason
        code: u32,
    },
    /// Begin a block download
    InitiateBlockDownload {
        /// Client supports CRC generation
        crc: bool,
        /// Total transfer size, when known
        size: Option<u32>,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// One data segment of a block download (no command specifier on the wire)
    BlockDownloadSegment {
        /// Sequence number within the current block, 1-127
        seqno: u8,
        /// Last segment of the whole transfer
        last: bool,
        /// Segment payload
        data: [u8; 7],
    },
    /// Finish a block download
    EndBlockDownload {
        /// Number of bytes in the final segment which held no data
        n: u8,
        /// CRC-16 over the transferred bytes
        crc: u16,
    },
    /// Begin a block upload
    InitiateBlockUpload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Number of segments per block the client will accept, 1-127
        blksize: u8,
        /// Protocol switch threshold; 0 to always use block transfer
        pst: u8,
        /// Client supports CRC generation
        crc: bool,
    },
    /// Ask the server to start streaming blocks
    StartBlockUpload,
    /// Acknowledge received segments of a block upload
    BlockUploadAck {
        /// Last successfully received sequence number
        ackseq: u8,
        /// Number of segments per block for the next block
        blksize: u8,
    },
    /// Confirm the end of a block upload
    EndBlockUpload,
}

impl SdoRequest {
    /// Create an abort request
    pub fn abort(index: u16, sub: u8, code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            code: code.into(),
        }
    }

    /// Create an expedited download carrying up to 4 bytes inline
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        let mut buf = [0u8; 4];
        buf[0..data.len()].copy_from_slice(data);
        SdoRequest::InitiateDownload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: buf,
        }
    }

    /// Create a segmented download initiation
    pub fn initiate_download(index: u16, sub: u8, size: Option<u32>) -> Self {
        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data: size.unwrap_or(0).to_le_bytes(),
        }
    }

    /// Create a download segment holding up to 7 bytes
    pub fn download_segment(toggle: bool, last: bool, segment: &[u8]) -> Self {
        let mut data = [0u8; 7];
        data[0..segment.len()].copy_from_slice(segment);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: (7 - segment.len()) as u8,
            c: last,
            data,
        }
    }

    /// Create an upload initiation
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create an upload segment request
    pub fn upload_segment_request(toggle: bool) -> Self {
        SdoRequest::UploadSegmentRequest { t: toggle }
    }

    /// Create a block download initiation
    pub fn initiate_block_download(index: u16, sub: u8, size: Option<u32>) -> Self {
        SdoRequest::InitiateBlockDownload {
            crc: true,
            size,
            index,
            sub,
        }
    }

    /// Create a block download data segment holding up to 7 bytes
    pub fn block_download_segment(seqno: u8, last: bool, segment: &[u8]) -> Self {
        let mut data = [0u8; 7];
        data[0..segment.len()].copy_from_slice(segment);
        SdoRequest::BlockDownloadSegment { seqno, last, data }
    }

    /// Create a block download end request
    pub fn end_block_download(unused: u8, crc: u16) -> Self {
        SdoRequest::EndBlockDownload { n: unused, crc }
    }

    /// Create a block upload initiation
    pub fn initiate_block_upload(index: u16, sub: u8, blksize: u8) -> Self {
        SdoRequest::InitiateBlockUpload {
            index,
            sub,
            blksize,
            pst: 0,
            crc: true,
        }
    }

    /// Encode to the 8-byte frame payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0u8; 8];
        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ClientCommand::InitiateDownload as u8) << 5)
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                payload[0] = ((ClientCommand::DownloadSegment as u8) << 5)
                    | ((t as u8) << 4)
                    | ((n & 0x7) << 1)
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = (ClientCommand::InitiateUpload as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoRequest::UploadSegmentRequest { t } => {
                payload[0] =
                    ((ClientCommand::UploadSegmentRequest as u8) << 5) | ((t as u8) << 4);
            }
            SdoRequest::Abort { index, sub, code } => {
                payload[0] = (ClientCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&code.to_le_bytes());
            }
            SdoRequest::InitiateBlockDownload {
                crc,
                size,
                index,
                sub,
            } => {
                payload[0] = ((ClientCommand::BlockDownload as u8) << 5)
                    | ((crc as u8) << 2)
                    | ((size.is_some() as u8) << 1)
                    | block_sub::INITIATE;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&size.unwrap_or(0).to_le_bytes());
            }
            SdoRequest::BlockDownloadSegment { seqno, last, data } => {
                payload[0] = (seqno & 0x7F) | ((last as u8) << 7);
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::EndBlockDownload { n, crc } => {
                payload[0] = ((ClientCommand::BlockDownload as u8) << 5)
                    | ((n & 0x7) << 2)
                    | block_sub::END;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoRequest::InitiateBlockUpload {
                index,
                sub,
                blksize,
                pst,
                crc,
            } => {
                payload[0] = ((ClientCommand::BlockUpload as u8) << 5)
                    | ((crc as u8) << 2)
                    | block_sub::INITIATE;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4] = blksize;
                payload[5] = pst;
            }
            SdoRequest::StartBlockUpload => {
                payload[0] = ((ClientCommand::BlockUpload as u8) << 5) | block_sub::START;
            }
            SdoRequest::BlockUploadAck { ackseq, blksize } => {
                payload[0] = ((ClientCommand::BlockUpload as u8) << 5) | block_sub::ACK;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoRequest::EndBlockUpload => {
                payload[0] = ((ClientCommand::BlockUpload as u8) << 5) | block_sub::END;
            }
        }
        payload
    }

    /// Encode to a CAN frame using the given COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

/// A response frame sent from SDO server to client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdoResponse {
    /// Response to an [SdoRequest::InitiateUpload]
    UploadResponse {
        /// Number of unused bytes in `data` (expedited with size)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size indicated flag
        s: bool,
        /// Echoed object index
        index: u16,
        /// Echoed sub-index
        sub: u8,
        /// Inline value when expedited, total size when `e=0, s=1`
        data: [u8; 4],
    },
    /// One segment of a segmented upload
    UploadSegment {
        /// Toggle bit
        t: bool,
        /// Number of unused bytes in `data`
        n: u8,
        /// Last segment flag
        c: bool,
        /// Segment payload
        data: [u8; 7],
    },
    /// Acknowledge an [SdoRequest::InitiateDownload]
    DownloadAck {
        /// Echoed object index
        index: u16,
        /// Echoed sub-index
        sub: u8,
    },
    /// Acknowledge an [SdoRequest::DownloadSegment]
    DownloadSegmentAck {
        /// Toggle bit
        t: bool,
    },
    /// Tear down the active transfer
    Abort {
        /// Object index of the active transfer
        index: u16,
        /// Object sub-index of the active transfer
        sub: u8,
        /// The abort reason
        code: u32,
    },
    /// Acknowledge an [SdoRequest::InitiateBlockDownload]
    BlockDownloadInitAck {
        /// Echoed object index
        index: u16,
        /// Echoed sub-index
        sub: u8,
        /// Number of segments per block the server will accept, 1-127
        blksize: u8,
        /// Server supports CRC generation
        crc: bool,
    },
    /// Acknowledge a completed block of a block download
    BlockDownloadAck {
        /// Last successfully received sequence number
        ackseq: u8,
        /// Number of segments per block for the next block
        blksize: u8,
    },
    /// Acknowledge an [SdoRequest::EndBlockDownload]
    BlockDownloadEndAck,
    /// Response to an [SdoRequest::InitiateBlockUpload]
    BlockUploadInitResponse {
        /// Echoed object index
        index: u16,
        /// Echoed sub-index
        sub: u8,
        /// Total transfer size, when indicated
        size: Option<u32>,
        /// Server supports CRC generation
        crc: bool,
    },
    /// One data segment of a block upload (no command specifier on the wire)
    BlockUploadSegment {
        /// Sequence number within the current block, 1-127
        seqno: u8,
        /// Last segment of the whole transfer
        last: bool,
        /// Segment payload
        data: [u8; 7],
    },
    /// Finish a block upload
    BlockUploadEnd {
        /// Number of bytes in the final segment which held no data
        n: u8,
        /// CRC-16 over the transferred bytes
        crc: u16,
    },
}

impl SdoResponse {
    /// Create an expedited upload response carrying up to 4 bytes inline
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> Self {
        let mut buf = [0u8; 4];
        buf[0..data.len()].copy_from_slice(data);
        SdoResponse::UploadResponse {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: buf,
        }
    }

    /// Create a segmented upload initiation response declaring the size
    pub fn upload_acknowledge(index: u16, sub: u8, size: u32) -> Self {
        SdoResponse::UploadResponse {
            n: 0,
            e: false,
            s: true,
            index,
            sub,
            data: size.to_le_bytes(),
        }
    }

    /// Create an upload segment holding up to 7 bytes
    pub fn upload_segment(t: bool, c: bool, segment: &[u8]) -> Self {
        let mut data = [0u8; 7];
        data[0..segment.len()].copy_from_slice(segment);
        SdoResponse::UploadSegment {
            t,
            n: (7 - segment.len()) as u8,
            c,
            data,
        }
    }

    /// Create a download acknowledge
    pub fn download_acknowledge(index: u16, sub: u8) -> Self {
        SdoResponse::DownloadAck { index, sub }
    }

    /// Create a download segment acknowledge
    pub fn download_segment_acknowledge(t: bool) -> Self {
        SdoResponse::DownloadSegmentAck { t }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, code: AbortCode) -> Self {
        SdoResponse::Abort {
            index,
            sub,
            code: code.into(),
        }
    }

    /// Create a block upload data segment holding up to 7 bytes
    pub fn block_upload_segment(seqno: u8, last: bool, segment: &[u8]) -> Self {
        let mut data = [0u8; 7];
        data[0..segment.len()].copy_from_slice(segment);
        SdoResponse::BlockUploadSegment { seqno, last, data }
    }

    /// Encode to the 8-byte frame payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0u8; 8];
        match self {
            SdoResponse::UploadResponse {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ServerCommand::UploadResponse as u8) << 5)
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                payload[0] = ((ServerCommand::UploadSegment as u8) << 5)
                    | ((t as u8) << 4)
                    | ((n & 0x7) << 1)
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::DownloadAck { index, sub } => {
                payload[0] = (ServerCommand::DownloadAck as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoResponse::DownloadSegmentAck { t } => {
                payload[0] =
                    ((ServerCommand::DownloadSegmentAck as u8) << 5) | ((t as u8) << 4);
            }
            SdoResponse::Abort { index, sub, code } => {
                payload[0] = (ServerCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&code.to_le_bytes());
            }
            SdoResponse::BlockDownloadInitAck {
                index,
                sub,
                blksize,
                crc,
            } => {
                payload[0] = ((ServerCommand::BlockDownloadResponse as u8) << 5)
                    | ((crc as u8) << 2)
                    | block_sub::INITIATE;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4] = blksize;
            }
            SdoResponse::BlockDownloadAck { ackseq, blksize } => {
                payload[0] =
                    ((ServerCommand::BlockDownloadResponse as u8) << 5) | block_sub::ACK;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoResponse::BlockDownloadEndAck => {
                payload[0] =
                    ((ServerCommand::BlockDownloadResponse as u8) << 5) | block_sub::END;
            }
            SdoResponse::BlockUploadInitResponse {
                index,
                sub,
                size,
                crc,
            } => {
                payload[0] = ((ServerCommand::BlockUploadResponse as u8) << 5)
                    | ((crc as u8) << 2)
                    | ((size.is_some() as u8) << 1)
                    | block_sub::INITIATE;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&size.unwrap_or(0).to_le_bytes());
            }
            SdoResponse::BlockUploadSegment { seqno, last, data } => {
                payload[0] = (seqno & 0x7F) | ((last as u8) << 7);
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::BlockUploadEnd { n, crc } => {
                payload[0] = ((ServerCommand::BlockUploadResponse as u8) << 5)
                    | ((n & 0x7) << 2)
                    | block_sub::END;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
        }
        payload
    }

    /// Encode to a CAN frame using the given COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

/// Error returned when a frame cannot be decoded as an [SdoResponse]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MalformedResponseError;

impl TryFrom<&[u8]> for SdoResponse {
    type Error = MalformedResponseError;

    /// Decode a command-specifier bearing response frame
    ///
    /// Block upload data segments are not handled here; they carry no
    /// command specifier and must be decoded by the transfer in progress.
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(MalformedResponseError);
        }
        let scs = value[0] >> 5;
        let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
        let sub = value[3];
        let word = u32::from_le_bytes(value[4..8].try_into().unwrap());
        match scs {
            0 => Ok(SdoResponse::UploadSegment {
                t: value[0] & 0x10 != 0,
                n: (value[0] >> 1) & 0x7,
                c: value[0] & 0x1 != 0,
                data: value[1..8].try_into().unwrap(),
            }),
            1 => Ok(SdoResponse::DownloadSegmentAck {
                t: value[0] & 0x10 != 0,
            }),
            2 => Ok(SdoResponse::UploadResponse {
                n: (value[0] >> 2) & 0x3,
                e: value[0] & 0x2 != 0,
                s: value[0] & 0x1 != 0,
                index,
                sub,
                data: value[4..8].try_into().unwrap(),
            }),
            3 => Ok(SdoResponse::DownloadAck { index, sub }),
            4 => Ok(SdoResponse::Abort {
                index,
                sub,
                code: word,
            }),
            5 => match value[0] & 0x3 {
                block_sub::INITIATE => Ok(SdoResponse::BlockDownloadInitAck {
                    index,
                    sub,
                    blksize: value[4],
                    crc: value[0] & 0x4 != 0,
                }),
                block_sub::ACK => Ok(SdoResponse::BlockDownloadAck {
                    ackseq: value[1],
                    blksize: value[2],
                }),
                block_sub::END => Ok(SdoResponse::BlockDownloadEndAck),
                _ => Err(MalformedResponseError),
            },
            6 => match value[0] & 0x1 {
                0 => Ok(SdoResponse::BlockUploadInitResponse {
                    index,
                    sub,
                    size: if value[0] & 0x2 != 0 { Some(word) } else { None },
                    crc: value[0] & 0x4 != 0,
                }),
                _ => Ok(SdoResponse::BlockUploadEnd {
                    n: (value[0] >> 2) & 0x7,
                    crc: u16::from_le_bytes(value[1..3].try_into().unwrap()),
                }),
            },
            _ => Err(MalformedResponseError),
        }
    }
}

impl TryFrom<CanMessage> for SdoResponse {
    type Error = MalformedResponseError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        msg.data().try_into()
    }
}

/// Running CRC-16 over the data bytes of a block transfer
///
/// Polynomial 0x1021, initial value 0 (the XMODEM parameters).
pub struct BlockCrc(crc16::State<crc16::XMODEM>);

impl Default for BlockCrc {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for BlockCrc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockCrc").finish()
    }
}

impl BlockCrc {
    /// Start a new CRC computation
    pub fn new() -> Self {
        Self(crc16::State::new())
    }

    /// Feed transferred data bytes
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Get the final CRC value
    pub fn finish(self) -> u16 {
        self.0.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiate_upload_encoding() {
        let req = SdoRequest::initiate_upload(0x1000, 0);
        assert_eq!([0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0], req.to_bytes());
    }

    #[test]
    fn test_expedited_upload_response_decoding() {
        let frame = [0x43u8, 0x00, 0x10, 0x00, 0x92, 0x01, 0x02, 0x00];
        let resp = SdoResponse::try_from(&frame[..]).unwrap();
        assert_eq!(
            SdoResponse::UploadResponse {
                n: 0,
                e: true,
                s: true,
                index: 0x1000,
                sub: 0,
                data: [0x92, 0x01, 0x02, 0x00],
            },
            resp
        );
    }

    #[test]
    fn test_segmented_download_encoding() {
        // 12 byte transfer: initiate with size, then two segments
        let req = SdoRequest::initiate_download(0x2000, 1, Some(12));
        assert_eq!([0x21, 0x00, 0x20, 0x01, 12, 0, 0, 0], req.to_bytes());

        let req = SdoRequest::download_segment(false, false, b"Hello W");
        assert_eq!(
            [0x00, b'H', b'e', b'l', b'l', b'o', b' ', b'W'],
            req.to_bytes()
        );

        let req = SdoRequest::download_segment(true, true, b"orld!");
        // toggle set, 2 unused bytes, last segment
        assert_eq!(
            [0x15, b'o', b'r', b'l', b'd', b'!', 0, 0],
            req.to_bytes()
        );
    }

    #[test]
    fn test_expedited_download_encoding() {
        let req = SdoRequest::expedited_download(0x6040, 0, &[0x06, 0x00]);
        assert_eq!([0x2B, 0x40, 0x60, 0x00, 0x06, 0x00, 0, 0], req.to_bytes());
    }

    #[test]
    fn test_abort_round_trip() {
        let req = SdoRequest::abort(0x1234, 5, AbortCode::Timeout);
        assert_eq!(
            [0x80, 0x34, 0x12, 0x05, 0x00, 0x00, 0x04, 0x05],
            req.to_bytes()
        );

        let resp = SdoResponse::try_from(&req.to_bytes()[..]).unwrap();
        assert_eq!(
            SdoResponse::Abort {
                index: 0x1234,
                sub: 5,
                code: 0x0504_0000,
            },
            resp
        );
    }

    #[test]
    fn test_block_download_frames() {
        let req = SdoRequest::initiate_block_download(0x3006, 0, Some(128));
        assert_eq!([0xC6, 0x06, 0x30, 0x00, 128, 0, 0, 0], req.to_bytes());

        let ack = SdoResponse::try_from(&[0xA4u8, 0x06, 0x30, 0x00, 127, 0, 0, 0][..]).unwrap();
        assert_eq!(
            SdoResponse::BlockDownloadInitAck {
                index: 0x3006,
                sub: 0,
                blksize: 127,
                crc: true,
            },
            ack
        );

        let seg = SdoRequest::block_download_segment(3, true, &[1, 2, 3]);
        assert_eq!([0x83, 1, 2, 3, 0, 0, 0, 0], seg.to_bytes());

        let end = SdoRequest::end_block_download(4, 0xBEEF);
        assert_eq!([0xD1, 0xEF, 0xBE, 0, 0, 0, 0, 0], end.to_bytes());

        let ack = SdoResponse::try_from(&[0xA2u8, 3, 127, 0, 0, 0, 0, 0][..]).unwrap();
        assert_eq!(
            SdoResponse::BlockDownloadAck {
                ackseq: 3,
                blksize: 127,
            },
            ack
        );
    }

    #[test]
    fn test_block_upload_frames() {
        let req = SdoRequest::initiate_block_upload(0x3006, 0, 127);
        assert_eq!([0xA4, 0x06, 0x30, 0x00, 127, 0, 0, 0], req.to_bytes());

        let resp =
            SdoResponse::try_from(&[0xC6u8, 0x06, 0x30, 0x00, 0x40, 0, 0, 0][..]).unwrap();
        assert_eq!(
            SdoResponse::BlockUploadInitResponse {
                index: 0x3006,
                sub: 0,
                size: Some(0x40),
                crc: true,
            },
            resp
        );

        let end = SdoResponse::try_from(&[0xC9u8, 0xEF, 0xBE, 0, 0, 0, 0, 0][..]).unwrap();
        assert_eq!(SdoResponse::BlockUploadEnd { n: 2, crc: 0xBEEF }, end);
    }

    #[test]
    fn test_block_crc() {
        let mut crc = BlockCrc::new();
        crc.update(b"123456789");
        assert_eq!(0x31C3, crc.finish());
    }

    #[test]
    fn test_abort_code_conversion() {
        assert_eq!(
            RawAbortCode::Valid(AbortCode::NoSuchObject),
            RawAbortCode::from(0x0602_0000)
        );
        assert_eq!(
            RawAbortCode::Unknown(0xDEAD_BEEF),
            RawAbortCode::from(0xDEAD_BEEF)
        );
        assert_eq!(0x0602_0000, RawAbortCode::from(0x0602_0000).code());
    }
}
