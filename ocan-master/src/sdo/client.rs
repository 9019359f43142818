//! SDO client transfer machinery

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use snafu::Snafu;

use ocan_common::constants::{SDO_REQ_BASE, SDO_RESP_BASE};
use ocan_common::od::{ObjectDictionary, ObjectDictionaryError};
use ocan_common::sdo::{AbortCode, RawAbortCode, SdoRequest};
use ocan_common::traits::TransportError;

use crate::network::{NetworkHandle, Subscription};
use crate::sdo::streams::{BlockReader, BlockWriter, SdoReader, SdoWriter};
use crate::sdo::{SdoReadStream, SdoWriteStream};

/// Default time to wait for a response from the server
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(300);

/// Default number of retries after a response timeout
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Number of response frames buffered between the receive thread and a
/// waiting transfer; must hold a full 127-segment block plus its end frame
const RESPONSE_QUEUE_DEPTH: usize = 160;

/// Error produced by SDO client operations
#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum SdoClientError {
    /// The server refused the transfer with an abort code
    #[snafu(display("Server aborted transfer of 0x{index:04X}sub{sub}: {code}"))]
    ServerAbort {
        /// Index of the aborted transfer
        index: u16,
        /// Subindex of the aborted transfer
        sub: u8,
        /// The abort reason
        code: RawAbortCode,
    },
    /// No response arrived before the deadline
    #[snafu(display("No SDO response received"))]
    Timeout,
    /// The server responded with an unexpected command specifier
    #[snafu(display("Unexpected response 0x{command:02X}"))]
    UnexpectedResponse {
        /// The offending command byte
        command: u8,
    },
    /// The server echoed a different object than was requested
    #[snafu(display(
        "Server answered for 0x{index:04X}sub{sub} instead of 0x{expected_index:04X}sub{expected_sub}; \
         is another client active on the same channel?"
    ))]
    EchoMismatch {
        /// Echoed index
        index: u16,
        /// Echoed subindex
        sub: u8,
        /// Requested index
        expected_index: u16,
        /// Requested subindex
        expected_sub: u8,
    },
    /// The toggle bit did not alternate
    #[snafu(display("Toggle bit mismatch"))]
    ToggleMismatch,
    /// The block transfer CRC did not match
    #[snafu(display("Block CRC mismatch: server 0x{server:04X}, computed 0x{computed:04X}"))]
    CrcMismatch {
        /// CRC reported by the server
        server: u16,
        /// CRC computed over the received data
        computed: u16,
    },
    /// The transfer carried a different number of bytes than declared
    #[snafu(display("Transfer size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch {
        /// Declared size
        expected: usize,
        /// Actual size
        actual: usize,
    },
    /// The stream has already completed
    #[snafu(display("Transfer is already complete"))]
    TransferClosed,
    /// Another transfer is in flight for this node
    #[snafu(display("Another SDO transfer is in flight for this node"))]
    Busy,
    /// The bus is gone
    #[snafu(display("{source}"))]
    Transport {
        /// The underlying transport error
        source: TransportError,
    },
    /// An object dictionary lookup or conversion failed
    #[snafu(display("{source}"))]
    Dictionary {
        /// The underlying dictionary error
        source: ObjectDictionaryError,
    },
}

impl From<ObjectDictionaryError> for SdoClientError {
    fn from(source: ObjectDictionaryError) -> Self {
        SdoClientError::Dictionary { source }
    }
}

pub(crate) type Result<T> = std::result::Result<T, SdoClientError>;

/// The response queue of the single transfer allowed per node
pub(crate) struct TransferChannel {
    responses: Receiver<[u8; 8]>,
}

impl TransferChannel {
    /// Discard stale frames left over from a previous transfer
    pub(crate) fn drain(&mut self) {
        while self.responses.try_recv().is_ok() {}
    }
}

/// SDO client for one server node
///
/// Talks to the server on 0x600+node / 0x580+node. At most one transfer is
/// in flight at a time; a second caller either blocks until the first
/// transfer completes or fails with [SdoClientError::Busy], depending on
/// [set_block_on_busy](SdoClient::set_block_on_busy).
pub struct SdoClient {
    network: NetworkHandle,
    req_cobid: u32,
    resp_cobid: u32,
    od: Arc<ObjectDictionary>,
    channel: Mutex<TransferChannel>,
    subscription: Subscription,
    block_on_busy: AtomicBool,
    timeout_millis: AtomicU64,
    retries: AtomicU32,
}

impl core::fmt::Debug for SdoClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdoClient")
            .field("req_cobid", &self.req_cobid)
            .field("resp_cobid", &self.resp_cobid)
            .finish()
    }
}

impl SdoClient {
    /// Create a client for the standard SDO channel of a node
    pub fn new_std(network: NetworkHandle, node_id: u8, od: Arc<ObjectDictionary>) -> Self {
        let req_cobid = SDO_REQ_BASE + node_id as u32;
        let resp_cobid = SDO_RESP_BASE + node_id as u32;
        let (tx, rx): (SyncSender<[u8; 8]>, Receiver<[u8; 8]>) =
            sync_channel(RESPONSE_QUEUE_DEPTH);
        let subscription = network.subscribe(
            resp_cobid,
            Arc::new(move |_cob_id, data, _timestamp| {
                if data.len() < 8 {
                    log::warn!("Dropping short SDO response ({} bytes)", data.len());
                    return;
                }
                let frame: [u8; 8] = data[0..8].try_into().unwrap();
                if tx.try_send(frame).is_err() {
                    log::warn!("Dropped SDO response due to overflow");
                }
            }),
        );
        Self {
            network,
            req_cobid,
            resp_cobid,
            od,
            channel: Mutex::new(TransferChannel { responses: rx }),
            subscription,
            block_on_busy: AtomicBool::new(true),
            timeout_millis: AtomicU64::new(DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64),
            retries: AtomicU32::new(DEFAULT_MAX_RETRIES),
        }
    }

    /// The object dictionary used to interpret transfers
    pub fn od(&self) -> &Arc<ObjectDictionary> {
        &self.od
    }

    /// Change the response timeout
    pub fn set_response_timeout(&self, timeout: Duration) {
        self.timeout_millis
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Change the number of retries after a response timeout
    pub fn set_max_retries(&self, retries: u32) {
        self.retries.store(retries, Ordering::Relaxed);
    }

    /// Select whether a concurrent request blocks (default) or fails with
    /// [SdoClientError::Busy]
    pub fn set_block_on_busy(&self, block: bool) {
        self.block_on_busy.store(block, Ordering::Relaxed);
    }

    pub(crate) fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis.load(Ordering::Relaxed))
    }

    /// Acquire the single-transfer-per-node lock
    pub(crate) fn lock_transfer(&self) -> Result<MutexGuard<'_, TransferChannel>> {
        if self.block_on_busy.load(Ordering::Relaxed) {
            Ok(self.channel.lock().unwrap())
        } else {
            match self.channel.try_lock() {
                Ok(guard) => Ok(guard),
                Err(TryLockError::WouldBlock) => Err(SdoClientError::Busy),
                Err(TryLockError::Poisoned(e)) => panic!("SDO channel poisoned: {e}"),
            }
        }
    }

    /// Send one request frame
    pub(crate) fn send_request(&self, frame: [u8; 8]) -> Result<()> {
        self.network
            .send(self.req_cobid, &frame)
            .map_err(|source| SdoClientError::Transport { source })
    }

    /// Wait for the next raw response frame
    ///
    /// Abort frames are detected here and fail the transfer immediately.
    pub(crate) fn read_response(&self, chan: &mut TransferChannel) -> Result<[u8; 8]> {
        let frame = self.read_frame(chan)?;
        self.check_abort(&frame)?;
        Ok(frame)
    }

    /// Wait for the next raw response frame without abort detection
    ///
    /// Used during the block upload data phase, where a sequence number
    /// occupies the command specifier position.
    pub(crate) fn read_frame(&self, chan: &mut TransferChannel) -> Result<[u8; 8]> {
        match chan.responses.recv_timeout(self.response_timeout()) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(SdoClientError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(SdoClientError::Transport {
                source: TransportError::NotConnected,
            }),
        }
    }

    /// Fail with [SdoClientError::ServerAbort] if the frame is an abort
    pub(crate) fn check_abort(&self, frame: &[u8; 8]) -> Result<()> {
        if frame[0] & 0xE0 == 0x80 {
            let index = u16::from_le_bytes(frame[1..3].try_into().unwrap());
            let sub = frame[3];
            let code = u32::from_le_bytes(frame[4..8].try_into().unwrap());
            return Err(SdoClientError::ServerAbort {
                index,
                sub,
                code: code.into(),
            });
        }
        Ok(())
    }

    /// Send a request and wait for its response, retrying on timeout
    ///
    /// After the final timeout an abort is sent so the server does not keep
    /// a half-open transfer, and the stale response queue is drained by the
    /// next request, so a late response cannot corrupt a later transfer.
    pub(crate) fn request_response(
        &self,
        chan: &mut TransferChannel,
        request: [u8; 8],
        index: u16,
        sub: u8,
    ) -> Result<[u8; 8]> {
        chan.drain();
        let mut attempts = self.retries.load(Ordering::Relaxed) + 1;
        loop {
            self.send_request(request)?;
            match self.read_response(chan) {
                Err(SdoClientError::Timeout) => {
                    attempts -= 1;
                    if attempts == 0 {
                        self.abort_transfer(index, sub, AbortCode::Timeout);
                        return Err(SdoClientError::Timeout);
                    }
                    log::warn!("No SDO response received, retrying");
                }
                other => return other,
            }
        }
    }

    /// Send an abort for the current transfer, best effort
    pub(crate) fn abort_transfer(&self, index: u16, sub: u8, code: AbortCode) {
        let frame = SdoRequest::abort(index, sub, code).to_bytes();
        if let Err(e) = self.network.send(self.req_cobid, &frame) {
            log::error!("Failed to send SDO abort: {e}");
        }
        log::error!(
            "Transfer of 0x{index:04X}sub{sub} aborted by client with code 0x{:08X}",
            u32::from(code)
        );
    }

    /// Read the full value of an object
    ///
    /// For fixed-size dictionary types the result is truncated to the
    /// declared size; some devices answer with 32-bit frames regardless of
    /// the object's actual width.
    pub fn upload(&self, index: u16, sub: u8) -> Result<Vec<u8>> {
        let chan = self.lock_transfer()?;
        let mut reader = SdoReader::begin(self, chan, index, sub)?;
        let mut data = Vec::new();
        while let Some(segment) = reader.read_segment()? {
            data.extend_from_slice(&segment);
        }
        drop(reader);

        if let Ok(var) = self.od.variable(index, sub) {
            if let Some(bits) = var.data_type.bit_length() {
                let od_size = bits.div_ceil(8);
                if od_size < data.len() {
                    data.truncate(od_size);
                }
            }
        }
        Ok(data)
    }

    /// Write the full value of an object
    ///
    /// Data up to 4 bytes is transferred expedited unless `force_segment`
    /// is set.
    pub fn download(&self, index: u16, sub: u8, data: &[u8], force_segment: bool) -> Result<()> {
        let chan = self.lock_transfer()?;
        let mut writer =
            SdoWriter::begin(self, chan, index, sub, Some(data.len()), force_segment)?;
        writer.write_chunk(data)?;
        writer.finish()
    }

    /// Read the full value of an object using block transfer
    pub fn block_upload(&self, index: u16, sub: u8) -> Result<Vec<u8>> {
        let chan = self.lock_transfer()?;
        let mut reader = BlockReader::begin(self, chan, index, sub)?;
        let mut data = Vec::new();
        while let Some(segment) = reader.read_segment()? {
            data.extend_from_slice(&segment);
        }
        Ok(data)
    }

    /// Write the full value of an object using block transfer
    pub fn block_download(&self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        let chan = self.lock_transfer()?;
        let mut writer = BlockWriter::begin(self, chan, index, sub, Some(data.len()))?;
        writer.write_chunk(data)?;
        writer.finish()
    }

    /// Open an object for streamed reading
    ///
    /// The stream also implements [std::io::Read], so it can be wrapped in
    /// a [std::io::BufReader] for buffered access.
    pub fn open_read(&self, index: u16, sub: u8, block_transfer: bool) -> Result<SdoReadStream<'_>> {
        let chan = self.lock_transfer()?;
        if block_transfer {
            Ok(SdoReadStream::block(BlockReader::begin(
                self, chan, index, sub,
            )?))
        } else {
            Ok(SdoReadStream::segmented(SdoReader::begin(
                self, chan, index, sub,
            )?))
        }
    }

    /// Open an object for streamed writing
    ///
    /// The stream also implements [std::io::Write]. The transfer is not
    /// complete until [finish](SdoWriteStream::finish) is called.
    pub fn open_write(
        &self,
        index: u16,
        sub: u8,
        size: Option<usize>,
        block_transfer: bool,
        force_segment: bool,
    ) -> Result<SdoWriteStream<'_>> {
        let chan = self.lock_transfer()?;
        if block_transfer {
            Ok(SdoWriteStream::block(BlockWriter::begin(
                self, chan, index, sub, size,
            )?))
        } else {
            Ok(SdoWriteStream::segmented(SdoWriter::begin(
                self,
                chan,
                index,
                sub,
                size,
                force_segment,
            )?))
        }
    }

    /// Release the response subscription
    pub(crate) fn detach(&self) {
        self.network.unsubscribe(&self.subscription);
    }
}
