//! SDO transfer streams
//!
//! One type per transfer direction and subprotocol. Each stream owns the
//! node's transfer lock for its lifetime, so no second transfer can start
//! while a stream is open.

use std::sync::MutexGuard;
use std::time::Instant;

use ocan_common::sdo::{AbortCode, BlockCrc, SdoRequest, SdoResponse};

use crate::sdo::client::{Result, SdoClient, SdoClientError, TransferChannel};

/// Block size requested from servers during block upload
const CLIENT_BLKSIZE: u8 = 127;

fn check_echo(index: u16, sub: u8, resp_index: u16, resp_sub: u8) -> Result<()> {
    if resp_index != index || resp_sub != sub {
        return Err(SdoClientError::EchoMismatch {
            index: resp_index,
            sub: resp_sub,
            expected_index: index,
            expected_sub: sub,
        });
    }
    Ok(())
}

/// Reader for expedited and segmented uploads
pub struct SdoReader<'a> {
    client: &'a SdoClient,
    chan: MutexGuard<'a, TransferChannel>,
    index: u16,
    sub: u8,
    size: Option<u32>,
    exp_data: Option<Vec<u8>>,
    toggle: bool,
    done: bool,
}

impl<'a> SdoReader<'a> {
    pub(crate) fn begin(
        client: &'a SdoClient,
        mut chan: MutexGuard<'a, TransferChannel>,
        index: u16,
        sub: u8,
    ) -> Result<Self> {
        log::debug!("Reading 0x{index:04X}sub{sub}");
        let frame = client.request_response(
            &mut chan,
            SdoRequest::initiate_upload(index, sub).to_bytes(),
            index,
            sub,
        )?;
        let mut size = None;
        let mut exp_data = None;
        match SdoResponse::try_from(&frame[..]) {
            Ok(SdoResponse::UploadResponse {
                n,
                e,
                s,
                index: resp_index,
                sub: resp_sub,
                data,
            }) => {
                check_echo(index, sub, resp_index, resp_sub)?;
                if e {
                    // Expedited: the whole value is in this frame
                    let len = if s { 4 - n as usize } else { 4 };
                    exp_data = Some(data[0..len].to_vec());
                    size = Some(len as u32);
                } else if s {
                    size = Some(u32::from_le_bytes(data));
                    log::debug!("Using segmented transfer of {} bytes", size.unwrap());
                }
            }
            _ => {
                client.abort_transfer(index, sub, AbortCode::InvalidCommandSpecifier);
                return Err(SdoClientError::UnexpectedResponse { command: frame[0] });
            }
        }
        Ok(Self {
            client,
            chan,
            index,
            sub,
            size,
            exp_data,
            toggle: false,
            done: false,
        })
    }

    /// The total size declared by the server, when known
    pub fn size(&self) -> Option<u32> {
        self.size
    }

    /// Read the next segment of up to 7 bytes; None at the end of data
    pub fn read_segment(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        if let Some(data) = self.exp_data.take() {
            self.done = true;
            return Ok(Some(data));
        }
        let frame = self.client.request_response(
            &mut self.chan,
            SdoRequest::upload_segment_request(self.toggle).to_bytes(),
            self.index,
            self.sub,
        )?;
        match SdoResponse::try_from(&frame[..]) {
            Ok(SdoResponse::UploadSegment { t, n, c, data }) => {
                if t != self.toggle {
                    self.client
                        .abort_transfer(self.index, self.sub, AbortCode::ToggleNotAlternated);
                    return Err(SdoClientError::ToggleMismatch);
                }
                self.toggle = !self.toggle;
                if c {
                    self.done = true;
                }
                Ok(Some(data[0..7 - n as usize].to_vec()))
            }
            _ => {
                self.client
                    .abort_transfer(self.index, self.sub, AbortCode::InvalidCommandSpecifier);
                Err(SdoClientError::UnexpectedResponse { command: frame[0] })
            }
        }
    }
}

/// Writer for expedited and segmented downloads
pub struct SdoWriter<'a> {
    client: &'a SdoClient,
    chan: MutexGuard<'a, TransferChannel>,
    index: u16,
    sub: u8,
    size: Option<usize>,
    expedited: bool,
    pending: Vec<u8>,
    toggle: bool,
    pos: usize,
    done: bool,
}

impl<'a> SdoWriter<'a> {
    pub(crate) fn begin(
        client: &'a SdoClient,
        mut chan: MutexGuard<'a, TransferChannel>,
        index: u16,
        sub: u8,
        size: Option<usize>,
        force_segment: bool,
    ) -> Result<Self> {
        let expedited = matches!(size, Some(1..=4)) && !force_segment;
        if !expedited {
            let frame = client.request_response(
                &mut chan,
                SdoRequest::initiate_download(index, sub, size.map(|s| s as u32)).to_bytes(),
                index,
                sub,
            )?;
            match SdoResponse::try_from(&frame[..]) {
                Ok(SdoResponse::DownloadAck {
                    index: resp_index,
                    sub: resp_sub,
                }) => check_echo(index, sub, resp_index, resp_sub)?,
                _ => {
                    client.abort_transfer(index, sub, AbortCode::InvalidCommandSpecifier);
                    return Err(SdoClientError::UnexpectedResponse { command: frame[0] });
                }
            }
        }
        Ok(Self {
            client,
            chan,
            index,
            sub,
            size,
            expedited,
            pending: Vec::new(),
            toggle: false,
            pos: 0,
            done: false,
        })
    }

    /// Append data to the transfer
    ///
    /// Complete 7-byte segments are sent immediately; a trailing partial
    /// segment is held back until [finish](SdoWriter::finish) marks it as
    /// the last one.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if self.done {
            return Err(SdoClientError::TransferClosed);
        }
        self.pending.extend_from_slice(data);
        if self.expedited {
            let size = self.size.expect("expedited transfer without size");
            if self.pending.len() >= size {
                self.send_expedited()?;
            }
            return Ok(());
        }
        while self.pending.len() > 7 {
            let segment: [u8; 7] = self.pending[0..7].try_into().unwrap();
            self.pending.drain(0..7);
            self.send_segment(&segment, false)?;
        }
        Ok(())
    }

    fn send_expedited(&mut self) -> Result<()> {
        let size = self.size.expect("expedited transfer without size");
        let data: Vec<u8> = self.pending.drain(0..size).collect();
        let frame = self.client.request_response(
            &mut self.chan,
            SdoRequest::expedited_download(self.index, self.sub, &data).to_bytes(),
            self.index,
            self.sub,
        )?;
        match SdoResponse::try_from(&frame[..]) {
            Ok(SdoResponse::DownloadAck {
                index: resp_index,
                sub: resp_sub,
            }) => check_echo(self.index, self.sub, resp_index, resp_sub)?,
            _ => {
                self.client
                    .abort_transfer(self.index, self.sub, AbortCode::InvalidCommandSpecifier);
                return Err(SdoClientError::UnexpectedResponse { command: frame[0] });
            }
        }
        self.pos += size;
        self.done = true;
        Ok(())
    }

    fn send_segment(&mut self, segment: &[u8], last: bool) -> Result<()> {
        let frame = self.client.request_response(
            &mut self.chan,
            SdoRequest::download_segment(self.toggle, last, segment).to_bytes(),
            self.index,
            self.sub,
        )?;
        match SdoResponse::try_from(&frame[..]) {
            Ok(SdoResponse::DownloadSegmentAck { t }) => {
                if t != self.toggle {
                    self.client
                        .abort_transfer(self.index, self.sub, AbortCode::ToggleNotAlternated);
                    return Err(SdoClientError::ToggleMismatch);
                }
            }
            _ => {
                self.client
                    .abort_transfer(self.index, self.sub, AbortCode::InvalidCommandSpecifier);
                return Err(SdoClientError::UnexpectedResponse { command: frame[0] });
            }
        }
        self.toggle = !self.toggle;
        self.pos += segment.len();
        if last {
            self.done = true;
        }
        Ok(())
    }

    /// Complete the transfer
    ///
    /// Sends the held-back final segment (an empty one when the data size
    /// was a multiple of 7) and verifies the declared size was honored.
    pub fn finish(&mut self) -> Result<()> {
        if self.expedited {
            if !self.done {
                let size = self.size.expect("expedited transfer without size");
                if self.pending.len() != size {
                    return Err(SdoClientError::SizeMismatch {
                        expected: size,
                        actual: self.pending.len(),
                    });
                }
                self.send_expedited()?;
            }
            return Ok(());
        }
        if !self.done {
            while self.pending.len() > 7 {
                let segment: [u8; 7] = self.pending[0..7].try_into().unwrap();
                self.pending.drain(0..7);
                self.send_segment(&segment, false)?;
            }
            let segment: Vec<u8> = self.pending.drain(..).collect();
            self.send_segment(&segment, true)?;
        }
        if let Some(size) = self.size {
            if self.pos != size {
                return Err(SdoClientError::SizeMismatch {
                    expected: size,
                    actual: self.pos,
                });
            }
        }
        Ok(())
    }
}

/// Reader for block uploads
pub struct BlockReader<'a> {
    client: &'a SdoClient,
    chan: MutexGuard<'a, TransferChannel>,
    index: u16,
    sub: u8,
    size: Option<u32>,
    blksize: u8,
    ackseq: u8,
    crc_enabled: bool,
    crc: Option<BlockCrc>,
    done: bool,
}

impl<'a> BlockReader<'a> {
    pub(crate) fn begin(
        client: &'a SdoClient,
        mut chan: MutexGuard<'a, TransferChannel>,
        index: u16,
        sub: u8,
    ) -> Result<Self> {
        log::debug!("Block reading 0x{index:04X}sub{sub}");
        let frame = client.request_response(
            &mut chan,
            SdoRequest::initiate_block_upload(index, sub, CLIENT_BLKSIZE).to_bytes(),
            index,
            sub,
        )?;
        let (size, crc_enabled) = match SdoResponse::try_from(&frame[..]) {
            Ok(SdoResponse::BlockUploadInitResponse {
                index: resp_index,
                sub: resp_sub,
                size,
                crc,
            }) => {
                check_echo(index, sub, resp_index, resp_sub)?;
                (size, crc)
            }
            _ => {
                client.abort_transfer(index, sub, AbortCode::InvalidCommandSpecifier);
                return Err(SdoClientError::UnexpectedResponse { command: frame[0] });
            }
        };
        client.send_request(SdoRequest::StartBlockUpload.to_bytes())?;
        Ok(Self {
            client,
            chan,
            index,
            sub,
            size,
            blksize: CLIENT_BLKSIZE,
            ackseq: 0,
            crc_enabled,
            crc: Some(BlockCrc::new()),
            done: false,
        })
    }

    /// The total size declared by the server, when known
    pub fn size(&self) -> Option<u32> {
        self.size
    }

    fn fail_if_abort(&self, frame: &[u8; 8]) -> Result<()> {
        // In the data phase only an exact 0x80 can be an abort; any other
        // value of the first byte is a sequence number
        if frame[0] == 0x80 {
            self.client.check_abort(frame)?;
        }
        Ok(())
    }

    fn send_block_ack(&mut self) -> Result<()> {
        self.client.send_request(
            SdoRequest::BlockUploadAck {
                ackseq: self.ackseq,
                blksize: self.blksize,
            }
            .to_bytes(),
        )?;
        if self.ackseq == self.blksize {
            self.ackseq = 0;
        }
        Ok(())
    }

    /// Re-acknowledge the last good sequence and wait for the server to
    /// rewind
    fn retransmit(&mut self) -> Result<[u8; 8]> {
        log::info!(
            "Only {} sequences were received, requesting retransmission",
            self.ackseq
        );
        let deadline = Instant::now() + self.client.response_timeout();
        self.client.send_request(
            SdoRequest::BlockUploadAck {
                ackseq: self.ackseq,
                blksize: self.blksize,
            }
            .to_bytes(),
        )?;
        while Instant::now() < deadline {
            let frame = self.client.read_frame(&mut self.chan)?;
            self.fail_if_abort(&frame)?;
            if frame[0] & 0x7F == self.ackseq + 1 {
                self.ackseq += 1;
                return Ok(frame);
            }
        }
        self.client
            .abort_transfer(self.index, self.sub, AbortCode::Timeout);
        Err(SdoClientError::Timeout)
    }

    /// Read the next segment of up to 7 bytes; None at the end of data
    pub fn read_segment(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        let mut frame = match self.client.read_frame(&mut self.chan) {
            Ok(frame) => frame,
            Err(SdoClientError::Timeout) => self.retransmit()?,
            Err(e) => return Err(e),
        };
        self.fail_if_abort(&frame)?;
        let seqno = frame[0] & 0x7F;
        if seqno == self.ackseq + 1 {
            self.ackseq = seqno;
        } else {
            frame = self.retransmit()?;
        }
        let last = frame[0] & 0x80 != 0;
        if self.ackseq >= self.blksize || last {
            self.send_block_ack()?;
        }
        let data = if last {
            let end = self.client.read_response(&mut self.chan)?;
            let (n, server_crc) = match SdoResponse::try_from(&end[..]) {
                Ok(SdoResponse::BlockUploadEnd { n, crc }) => (n, crc),
                _ => {
                    self.client
                        .abort_transfer(self.index, self.sub, AbortCode::InvalidCommandSpecifier);
                    return Err(SdoClientError::UnexpectedResponse { command: end[0] });
                }
            };
            let data = frame[1..8 - n as usize].to_vec();
            let mut crc = self.crc.take().expect("CRC consumed twice");
            crc.update(&data);
            let computed = crc.finish();
            if self.crc_enabled && computed != server_crc {
                self.client
                    .abort_transfer(self.index, self.sub, AbortCode::CrcError);
                return Err(SdoClientError::CrcMismatch {
                    server: server_crc,
                    computed,
                });
            }
            self.client
                .send_request(SdoRequest::EndBlockUpload.to_bytes())?;
            self.done = true;
            data
        } else {
            let data = frame[1..8].to_vec();
            if let Some(crc) = self.crc.as_mut() {
                crc.update(&data);
            }
            data
        };
        Ok(Some(data))
    }
}

/// Writer for block downloads
pub struct BlockWriter<'a> {
    client: &'a SdoClient,
    chan: MutexGuard<'a, TransferChannel>,
    index: u16,
    sub: u8,
    size: Option<usize>,
    blksize: u8,
    seqno: u8,
    crc_enabled: bool,
    crc: Option<BlockCrc>,
    pending: Vec<u8>,
    current_block: Vec<(usize, [u8; 7])>,
    last_seg_len: usize,
    retransmitting: bool,
    pos: usize,
    done: bool,
}

impl<'a> BlockWriter<'a> {
    pub(crate) fn begin(
        client: &'a SdoClient,
        mut chan: MutexGuard<'a, TransferChannel>,
        index: u16,
        sub: u8,
        size: Option<usize>,
    ) -> Result<Self> {
        log::debug!("Block writing 0x{index:04X}sub{sub}");
        let frame = client.request_response(
            &mut chan,
            SdoRequest::initiate_block_download(index, sub, size.map(|s| s as u32)).to_bytes(),
            index,
            sub,
        )?;
        let (blksize, crc_enabled) = match SdoResponse::try_from(&frame[..]) {
            Ok(SdoResponse::BlockDownloadInitAck {
                index: resp_index,
                sub: resp_sub,
                blksize,
                crc,
            }) => {
                check_echo(index, sub, resp_index, resp_sub)?;
                (blksize, crc)
            }
            _ => {
                client.abort_transfer(index, sub, AbortCode::InvalidCommandSpecifier);
                return Err(SdoClientError::UnexpectedResponse { command: frame[0] });
            }
        };
        if !(1..=127).contains(&blksize) {
            client.abort_transfer(index, sub, AbortCode::InvalidBlockSize);
            return Err(SdoClientError::UnexpectedResponse { command: frame[0] });
        }
        log::debug!("Server requested a block size of {blksize}");
        Ok(Self {
            client,
            chan,
            index,
            sub,
            size,
            blksize,
            seqno: 0,
            crc_enabled,
            crc: Some(BlockCrc::new()),
            pending: Vec::new(),
            current_block: Vec::new(),
            last_seg_len: 0,
            retransmitting: false,
            pos: 0,
            done: false,
        })
    }

    /// Append data to the transfer
    ///
    /// Complete 7-byte segments are sent immediately; a trailing partial
    /// segment is held back until [finish](BlockWriter::finish) marks it
    /// as the last one.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if self.done {
            return Err(SdoClientError::TransferClosed);
        }
        self.pending.extend_from_slice(data);
        while self.pending.len() > 7 {
            let segment: [u8; 7] = self.pending[0..7].try_into().unwrap();
            self.pending.drain(0..7);
            self.send_segment(&segment, false)?;
        }
        Ok(())
    }

    fn send_segment(&mut self, segment: &[u8], last: bool) -> Result<()> {
        self.seqno += 1;
        self.client.send_request(
            SdoRequest::block_download_segment(self.seqno, last, segment).to_bytes(),
        )?;
        self.pos += segment.len();
        self.last_seg_len = segment.len();
        let mut padded = [0u8; 7];
        padded[0..segment.len()].copy_from_slice(segment);
        self.current_block.push((segment.len(), padded));
        if !self.retransmitting {
            if let Some(crc) = self.crc.as_mut() {
                crc.update(segment);
            }
        }
        if last {
            self.done = true;
            // The ack for a final partial block covers only the sent count
            self.blksize = self.seqno;
        }
        if self.seqno >= self.blksize {
            self.wait_block_ack()?;
        }
        Ok(())
    }

    fn wait_block_ack(&mut self) -> Result<()> {
        let frame = self.client.read_response(&mut self.chan)?;
        match SdoResponse::try_from(&frame[..]) {
            Ok(SdoResponse::BlockDownloadAck { ackseq, blksize }) => {
                if ackseq != self.blksize {
                    self.retransmit(ackseq, blksize)?;
                } else {
                    log::debug!("All {ackseq} sequences were received successfully");
                    self.current_block.clear();
                    self.blksize = blksize.clamp(1, 127);
                    self.seqno = 0;
                }
                Ok(())
            }
            _ => {
                self.client
                    .abort_transfer(self.index, self.sub, AbortCode::InvalidCommandSpecifier);
                Err(SdoClientError::UnexpectedResponse { command: frame[0] })
            }
        }
    }

    /// Resend the segments the server did not acknowledge
    fn retransmit(&mut self, ackseq: u8, blksize: u8) -> Result<()> {
        log::info!(
            "{ackseq} of {} sequences were received, retransmitting",
            self.blksize
        );
        let resend: Vec<(usize, [u8; 7])> = self.current_block[ackseq as usize..].to_vec();
        for (len, _) in &resend {
            self.pos -= len;
        }
        self.current_block.clear();
        self.seqno = 0;
        self.blksize = blksize.clamp(1, 127);
        self.done = false;
        self.retransmitting = true;
        let result = (|| {
            for (len, data) in &resend {
                let last = self.size.is_some_and(|s| self.pos + len == s);
                self.send_segment(&data[0..*len], last)?;
            }
            Ok(())
        })();
        self.retransmitting = false;
        result
    }

    /// Complete the transfer: final segment, block ack, end frame with CRC
    pub fn finish(&mut self) -> Result<()> {
        if !self.done {
            if let Some(size) = self.size {
                if self.pos + self.pending.len() != size {
                    return Err(SdoClientError::SizeMismatch {
                        expected: size,
                        actual: self.pos + self.pending.len(),
                    });
                }
            }
            let segment: Vec<u8> = self.pending.drain(..).collect();
            self.send_segment(&segment, true)?;
        }
        let n = (7 - self.last_seg_len) as u8;
        let crc = self.crc.take().map(BlockCrc::finish).unwrap_or(0);
        let frame = self.client.request_response(
            &mut self.chan,
            SdoRequest::end_block_download(n, if self.crc_enabled { crc } else { 0 }).to_bytes(),
            self.index,
            self.sub,
        )?;
        match SdoResponse::try_from(&frame[..]) {
            Ok(SdoResponse::BlockDownloadEndAck) => {
                log::debug!("Block download of 0x{:04X}sub{} complete", self.index, self.sub);
                Ok(())
            }
            _ => {
                self.client
                    .abort_transfer(self.index, self.sub, AbortCode::InvalidCommandSpecifier);
                Err(SdoClientError::UnexpectedResponse { command: frame[0] })
            }
        }
    }
}
