//! Scripted slave models attached to the simulated bus as responders

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ocan_common::lss::{LssIdentity, LssRequest, LssResponse, LssState, LSS_FASTSCAN_CONFIRM};
use ocan_common::sdo::{AbortCode, BlockCrc, SdoResponse};
use ocan_common::{CanId, CanMessage};

use crate::sim_bus::Responder;

/// Wrap a shared slave model as a bus responder
pub fn responder<T: SlaveModel + Send + 'static>(model: Arc<Mutex<T>>) -> Responder {
    Box::new(move |msg| model.lock().unwrap().handle(msg))
}

/// Anything that consumes frames and produces replies
pub trait SlaveModel {
    /// Handle one observed frame, returning any reply frames
    fn handle(&mut self, msg: &CanMessage) -> Vec<CanMessage>;
}

#[derive(Debug)]
enum SdoState {
    Idle,
    SegUpload {
        data: Vec<u8>,
        pos: usize,
        toggle: bool,
    },
    SegDownload {
        index: u16,
        sub: u8,
        buffer: Vec<u8>,
        toggle: bool,
    },
    BlockDownload {
        index: u16,
        sub: u8,
        buffer: Vec<u8>,
        crc: bool,
        next_seq: u8,
        blksize: u8,
        seen_last: bool,
    },
    BlockDownloadEnd {
        index: u16,
        sub: u8,
        buffer: Vec<u8>,
        crc: bool,
    },
    BlockUpload {
        data: Vec<u8>,
        pos: usize,
        blksize: u8,
        segments_sent: u8,
        last_chunk_len: usize,
        finished: bool,
    },
}

/// A scripted SDO server holding a set of objects
///
/// Supports expedited, segmented and block transfers in both directions,
/// with CRC verification on block downloads. Unknown objects are refused
/// with abort 0x06020000.
pub struct SdoServerSim {
    node_id: u8,
    /// The server's object store, writable by tests for setup and
    /// inspection
    pub objects: HashMap<(u16, u8), Vec<u8>>,
    state: SdoState,
    /// Block size granted to clients on block downloads
    pub blksize: u8,
}

impl SdoServerSim {
    /// Create a server for the given node ID
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id,
            objects: HashMap::new(),
            state: SdoState::Idle,
            blksize: 127,
        }
    }

    /// Define an object's value
    pub fn insert(&mut self, index: u16, sub: u8, data: &[u8]) {
        self.objects.insert((index, sub), data.to_vec());
    }

    /// Read an object's value back
    pub fn get(&self, index: u16, sub: u8) -> Option<&Vec<u8>> {
        self.objects.get(&(index, sub))
    }

    fn reply(&self, response: SdoResponse) -> Vec<CanMessage> {
        vec![response.to_can_message(CanId::std(0x580 + self.node_id as u16))]
    }

    fn reply_frame(&self, frame: [u8; 8]) -> CanMessage {
        CanMessage::new(CanId::std(0x580 + self.node_id as u16), &frame)
    }

    fn abort(&mut self, index: u16, sub: u8, code: AbortCode) -> Vec<CanMessage> {
        self.state = SdoState::Idle;
        self.reply(SdoResponse::abort(index, sub, code))
    }

    fn handle_initiate_download(&mut self, frame: [u8; 8]) -> Vec<CanMessage> {
        let index = u16::from_le_bytes(frame[1..3].try_into().unwrap());
        let sub = frame[3];
        let e = frame[0] & 0x2 != 0;
        let s = frame[0] & 0x1 != 0;
        if e {
            let n = ((frame[0] >> 2) & 0x3) as usize;
            let len = if s { 4 - n } else { 4 };
            self.objects.insert((index, sub), frame[4..4 + len].to_vec());
        } else {
            self.state = SdoState::SegDownload {
                index,
                sub,
                buffer: Vec::new(),
                toggle: false,
            };
        }
        self.reply(SdoResponse::download_acknowledge(index, sub))
    }

    fn handle_download_segment(&mut self, frame: [u8; 8]) -> Vec<CanMessage> {
        let t = frame[0] & 0x10 != 0;
        let n = ((frame[0] >> 1) & 0x7) as usize;
        let c = frame[0] & 0x1 != 0;
        let toggle_ok = match &mut self.state {
            SdoState::SegDownload { buffer, toggle, .. } => {
                if t != *toggle {
                    false
                } else {
                    buffer.extend_from_slice(&frame[1..8 - n]);
                    *toggle = !*toggle;
                    true
                }
            }
            _ => return self.abort(0, 0, AbortCode::InvalidCommandSpecifier),
        };
        if !toggle_ok {
            return self.abort(0, 0, AbortCode::ToggleNotAlternated);
        }
        if c {
            if let SdoState::SegDownload {
                index, sub, buffer, ..
            } = std::mem::replace(&mut self.state, SdoState::Idle)
            {
                self.objects.insert((index, sub), buffer);
            }
        }
        self.reply(SdoResponse::download_segment_acknowledge(t))
    }

    fn handle_initiate_upload(&mut self, frame: [u8; 8]) -> Vec<CanMessage> {
        let index = u16::from_le_bytes(frame[1..3].try_into().unwrap());
        let sub = frame[3];
        match self.objects.get(&(index, sub)).cloned() {
            None => self.abort(index, sub, AbortCode::NoSuchObject),
            Some(data) if data.len() <= 4 => {
                self.reply(SdoResponse::expedited_upload(index, sub, &data))
            }
            Some(data) => {
                let size = data.len() as u32;
                self.state = SdoState::SegUpload {
                    data,
                    pos: 0,
                    toggle: false,
                };
                self.reply(SdoResponse::upload_acknowledge(index, sub, size))
            }
        }
    }

    fn handle_upload_segment_request(&mut self, frame: [u8; 8]) -> Vec<CanMessage> {
        let t = frame[0] & 0x10 != 0;
        let mut result = None;
        if let SdoState::SegUpload { data, pos, toggle } = &mut self.state {
            if t != *toggle {
                result = None;
            } else {
                let chunk_len = (data.len() - *pos).min(7);
                let chunk = data[*pos..*pos + chunk_len].to_vec();
                *pos += chunk_len;
                let c = *pos >= data.len();
                *toggle = !*toggle;
                result = Some((chunk, c));
            }
        } else {
            return self.abort(0, 0, AbortCode::InvalidCommandSpecifier);
        }
        match result {
            None => self.abort(0, 0, AbortCode::ToggleNotAlternated),
            Some((chunk, c)) => {
                if c {
                    self.state = SdoState::Idle;
                }
                self.reply(SdoResponse::upload_segment(t, c, &chunk))
            }
        }
    }

    fn handle_block_download_control(&mut self, frame: [u8; 8]) -> Vec<CanMessage> {
        let index = u16::from_le_bytes(frame[1..3].try_into().unwrap());
        let sub = frame[3];
        if frame[0] & 0x1 == 0 {
            // Initiate
            let crc = frame[0] & 0x4 != 0;
            self.state = SdoState::BlockDownload {
                index,
                sub,
                buffer: Vec::new(),
                crc,
                next_seq: 1,
                blksize: self.blksize,
                seen_last: false,
            };
            self.reply(SdoResponse::BlockDownloadInitAck {
                index,
                sub,
                blksize: self.blksize,
                crc,
            })
        } else {
            // End
            let SdoState::BlockDownloadEnd {
                index,
                sub,
                mut buffer,
                crc,
            } = std::mem::replace(&mut self.state, SdoState::Idle)
            else {
                return self.abort(0, 0, AbortCode::InvalidCommandSpecifier);
            };
            let n = ((frame[0] >> 2) & 0x7) as usize;
            let client_crc = u16::from_le_bytes(frame[1..3].try_into().unwrap());
            buffer.truncate(buffer.len() - n);
            if crc {
                let mut block_crc = BlockCrc::new();
                block_crc.update(&buffer);
                if block_crc.finish() != client_crc {
                    return self.abort(index, sub, AbortCode::CrcError);
                }
            }
            self.objects.insert((index, sub), buffer);
            self.reply(SdoResponse::BlockDownloadEndAck)
        }
    }

    fn handle_block_data(&mut self, frame: [u8; 8]) -> Vec<CanMessage> {
        // A client abort tears the transfer down
        if frame[0] == 0x80 {
            self.state = SdoState::Idle;
            return Vec::new();
        }
        let seqno = frame[0] & 0x7F;
        let last = frame[0] & 0x80 != 0;
        let granted = self.blksize;
        let mut ackseq = None;
        if let SdoState::BlockDownload {
            buffer,
            next_seq,
            blksize,
            seen_last,
            ..
        } = &mut self.state
        {
            if seqno == *next_seq {
                buffer.extend_from_slice(&frame[1..8]);
                *next_seq += 1;
                if last {
                    *seen_last = true;
                }
            }
            if seqno >= *blksize || last {
                ackseq = Some(*next_seq - 1);
            }
        }
        let Some(ackseq) = ackseq else {
            return Vec::new();
        };
        let complete =
            matches!(&self.state, SdoState::BlockDownload { seen_last: true, .. }) && ackseq == seqno;
        if let SdoState::BlockDownload {
            index,
            sub,
            buffer,
            crc,
            ..
        } = std::mem::replace(&mut self.state, SdoState::Idle)
        {
            self.state = if complete {
                SdoState::BlockDownloadEnd {
                    index,
                    sub,
                    buffer,
                    crc,
                }
            } else {
                SdoState::BlockDownload {
                    index,
                    sub,
                    buffer,
                    crc,
                    next_seq: 1,
                    blksize: granted,
                    seen_last: false,
                }
            };
        }
        self.reply(SdoResponse::BlockDownloadAck {
            ackseq,
            blksize: granted,
        })
    }

    fn handle_block_upload_control(&mut self, frame: [u8; 8]) -> Vec<CanMessage> {
        let index = u16::from_le_bytes(frame[1..3].try_into().unwrap());
        let sub = frame[3];
        match frame[0] & 0x3 {
            // Initiate
            0 => {
                let blksize = frame[4].clamp(1, 127);
                match self.objects.get(&(index, sub)).cloned() {
                    None => self.abort(index, sub, AbortCode::NoSuchObject),
                    Some(data) => {
                        let size = data.len() as u32;
                        self.state = SdoState::BlockUpload {
                            data,
                            pos: 0,
                            blksize,
                            segments_sent: 0,
                            last_chunk_len: 0,
                            finished: false,
                        };
                        self.reply(SdoResponse::BlockUploadInitResponse {
                            index,
                            sub,
                            size: Some(size),
                            crc: frame[0] & 0x4 != 0,
                        })
                    }
                }
            }
            // Start
            3 => self.stream_block(),
            // Block ack
            2 => {
                let client_ackseq = frame[1];
                let new_blksize = frame[2].clamp(1, 127);
                let mut outcome = None;
                if let SdoState::BlockUpload {
                    data,
                    blksize,
                    segments_sent,
                    last_chunk_len,
                    finished,
                    ..
                } = &mut self.state
                {
                    if client_ackseq == *segments_sent {
                        *blksize = new_blksize;
                        let mut block_crc = BlockCrc::new();
                        block_crc.update(data);
                        outcome =
                            Some((*finished, (7 - *last_chunk_len) as u8, block_crc.finish()));
                    }
                } else {
                    return Vec::new();
                }
                match outcome {
                    // No loss is simulated, so a sequence mismatch is a bug
                    None => self.abort(0, 0, AbortCode::InvalidSequenceNumber),
                    Some((true, n, crc)) => self.reply(SdoResponse::BlockUploadEnd { n, crc }),
                    Some((false, _, _)) => self.stream_block(),
                }
            }
            // End from the client
            1 => {
                self.state = SdoState::Idle;
                Vec::new()
            }
            _ => self.abort(0, 0, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn stream_block(&mut self) -> Vec<CanMessage> {
        let mut frames: Vec<[u8; 8]> = Vec::new();
        if let SdoState::BlockUpload {
            data,
            pos,
            blksize,
            segments_sent,
            last_chunk_len,
            finished,
        } = &mut self.state
        {
            let mut seq = 0u8;
            while seq < *blksize {
                seq += 1;
                let chunk_len = (data.len() - *pos).min(7);
                let last = *pos + chunk_len >= data.len();
                frames.push(
                    SdoResponse::block_upload_segment(seq, last, &data[*pos..*pos + chunk_len])
                        .to_bytes(),
                );
                *pos += chunk_len;
                *last_chunk_len = chunk_len;
                *segments_sent = seq;
                if last {
                    *finished = true;
                    break;
                }
            }
        }
        frames
            .into_iter()
            .map(|frame| self.reply_frame(frame))
            .collect()
    }
}

impl SlaveModel for SdoServerSim {
    fn handle(&mut self, msg: &CanMessage) -> Vec<CanMessage> {
        if msg.id().raw() != 0x600 + self.node_id as u32 || msg.is_rtr() {
            return Vec::new();
        }
        let mut frame = [0u8; 8];
        frame[0..msg.data().len()].copy_from_slice(msg.data());

        // During the block download data phase the first byte is a
        // sequence number, not a command specifier
        if matches!(self.state, SdoState::BlockDownload { .. }) {
            return self.handle_block_data(frame);
        }

        match frame[0] >> 5 {
            0 => self.handle_download_segment(frame),
            1 => self.handle_initiate_download(frame),
            2 => self.handle_initiate_upload(frame),
            3 => self.handle_upload_segment_request(frame),
            4 => {
                self.state = SdoState::Idle;
                Vec::new()
            }
            5 => self.handle_block_upload_control(frame),
            6 => self.handle_block_download_control(frame),
            _ => {
                let index = u16::from_le_bytes(frame[1..3].try_into().unwrap());
                self.abort(index, frame[3], AbortCode::InvalidCommandSpecifier)
            }
        }
    }
}

/// A scripted LSS slave with a fixed identity
pub struct LssSlaveSim {
    /// The slave's 128-bit identity
    pub identity: LssIdentity,
    /// The slave's current LSS state
    pub state: LssState,
    /// The node ID assigned over LSS, if any
    pub node_id: Option<u8>,
    fastscan_sub: u8,
    selective_progress: u8,
}

impl LssSlaveSim {
    /// Create a slave in waiting state
    pub fn new(identity: LssIdentity) -> Self {
        Self {
            identity,
            state: LssState::Waiting,
            node_id: None,
            fastscan_sub: 0,
            selective_progress: 0,
        }
    }

    fn respond(&self, response: LssResponse) -> Vec<CanMessage> {
        vec![response.to_can_message()]
    }

    fn handle_fastscan(&mut self, id: u32, bit_check: u8, sub: u8, next: u8) -> Vec<CanMessage> {
        if self.state != LssState::Waiting || self.node_id.is_some() {
            return Vec::new();
        }
        if bit_check == LSS_FASTSCAN_CONFIRM {
            self.fastscan_sub = 0;
            return self.respond(LssResponse::IdentifySlave);
        }
        if self.fastscan_sub != sub || bit_check >= 32 {
            return Vec::new();
        }
        let mask = 0xFFFF_FFFFu32 << bit_check;
        if self.identity.word(sub) & mask == id & mask {
            self.fastscan_sub = next;
            if bit_check == 0 && next < sub {
                // All four words matched; the slave is selected
                self.state = LssState::Configuration;
            }
            self.respond(LssResponse::IdentifySlave)
        } else {
            Vec::new()
        }
    }
}

impl SlaveModel for LssSlaveSim {
    fn handle(&mut self, msg: &CanMessage) -> Vec<CanMessage> {
        if msg.id().raw() != 0x7E5 {
            return Vec::new();
        }
        let request = match LssRequest::try_from(msg.data()) {
            Ok(request) => request,
            Err(_) => return Vec::new(),
        };
        match request {
            LssRequest::SwitchModeGlobal { mode } => {
                if let Ok(state) = LssState::from_byte(mode) {
                    self.state = state;
                }
                Vec::new()
            }
            LssRequest::FastScan {
                id,
                bit_check,
                sub,
                next,
            } => self.handle_fastscan(id, bit_check, sub, next),
            LssRequest::SwitchStateVendor { vendor_id } => {
                self.selective_progress = if vendor_id == self.identity.vendor_id {
                    1
                } else {
                    0
                };
                Vec::new()
            }
            LssRequest::SwitchStateProduct { product_code } => {
                self.selective_progress =
                    if self.selective_progress == 1 && product_code == self.identity.product_code {
                        2
                    } else {
                        0
                    };
                Vec::new()
            }
            LssRequest::SwitchStateRevision { revision } => {
                self.selective_progress =
                    if self.selective_progress == 2 && revision == self.identity.revision {
                        3
                    } else {
                        0
                    };
                Vec::new()
            }
            LssRequest::SwitchStateSerial { serial } => {
                if self.selective_progress == 3 && serial == self.identity.serial {
                    self.selective_progress = 0;
                    self.state = LssState::Configuration;
                    self.respond(LssResponse::SwitchStateResponse)
                } else {
                    self.selective_progress = 0;
                    Vec::new()
                }
            }
            LssRequest::ConfigureNodeId { node_id } => {
                if self.state != LssState::Configuration {
                    return Vec::new();
                }
                if (1..=127).contains(&node_id) {
                    self.node_id = Some(node_id);
                    self.respond(LssResponse::ConfigureNodeIdAck {
                        error: 0,
                        spec_error: 0,
                    })
                } else {
                    self.respond(LssResponse::ConfigureNodeIdAck {
                        error: 1,
                        spec_error: 0,
                    })
                }
            }
            LssRequest::ConfigureBitTiming { .. } => {
                if self.state != LssState::Configuration {
                    return Vec::new();
                }
                self.respond(LssResponse::ConfigureBitTimingAck {
                    error: 0,
                    spec_error: 0,
                })
            }
            LssRequest::StoreConfiguration => {
                if self.state != LssState::Configuration {
                    return Vec::new();
                }
                self.respond(LssResponse::StoreConfigurationAck {
                    error: 0,
                    spec_error: 0,
                })
            }
            LssRequest::Inquire { cs } => {
                if self.state != LssState::Configuration {
                    return Vec::new();
                }
                use ocan_common::lss::LssCommandSpecifier::*;
                match cs {
                    InquireNodeId => self.respond(LssResponse::InquireNodeIdReply {
                        node_id: self.node_id.unwrap_or(0xFF),
                    }),
                    InquireVendor => self.respond(LssResponse::InquireReply {
                        cs,
                        value: self.identity.vendor_id,
                    }),
                    InquireProduct => self.respond(LssResponse::InquireReply {
                        cs,
                        value: self.identity.product_code,
                    }),
                    InquireRevision => self.respond(LssResponse::InquireReply {
                        cs,
                        value: self.identity.revision,
                    }),
                    InquireSerial => self.respond(LssResponse::InquireReply {
                        cs,
                        value: self.identity.serial,
                    }),
                    _ => Vec::new(),
                }
            }
        }
    }
}
