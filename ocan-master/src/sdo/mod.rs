//! SDO client
//!
//! [SdoClient] drives the wire protocol; [SdoNode] layers the object
//! dictionary on top of it, giving typed access to entries by index or
//! name with `raw`/`phys`/`desc`/`bits` views.

mod client;
mod streams;
mod variables;

pub use client::{SdoClient, SdoClientError, DEFAULT_MAX_RETRIES, DEFAULT_RESPONSE_TIMEOUT};
pub use streams::{BlockReader, BlockWriter, SdoReader, SdoWriter};
pub use variables::{SdoArray, SdoEntry, SdoNode, SdoRecord, SdoVariable};

use client::Result;

/// A readable SDO stream, segmented or block
///
/// Obtained from [SdoClient::open_read]. Also implements [std::io::Read].
pub struct SdoReadStream<'a> {
    inner: ReadKind<'a>,
    buffer: Vec<u8>,
}

enum ReadKind<'a> {
    Segmented(SdoReader<'a>),
    Block(BlockReader<'a>),
}

impl<'a> SdoReadStream<'a> {
    pub(crate) fn segmented(reader: SdoReader<'a>) -> Self {
        Self {
            inner: ReadKind::Segmented(reader),
            buffer: Vec::new(),
        }
    }

    pub(crate) fn block(reader: BlockReader<'a>) -> Self {
        Self {
            inner: ReadKind::Block(reader),
            buffer: Vec::new(),
        }
    }

    /// The total size declared by the server, when known
    pub fn size(&self) -> Option<u32> {
        match &self.inner {
            ReadKind::Segmented(r) => r.size(),
            ReadKind::Block(r) => r.size(),
        }
    }

    /// Read the next segment of up to 7 bytes; None at the end of data
    pub fn read_segment(&mut self) -> Result<Option<Vec<u8>>> {
        match &mut self.inner {
            ReadKind::Segmented(r) => r.read_segment(),
            ReadKind::Block(r) => r.read_segment(),
        }
    }

    /// Read the remaining data to the end
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut data = std::mem::take(&mut self.buffer);
        while let Some(segment) = self.read_segment()? {
            data.extend_from_slice(&segment);
        }
        Ok(data)
    }
}

impl std::io::Read for SdoReadStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.buffer.is_empty() {
            match self.read_segment() {
                Ok(Some(segment)) => self.buffer = segment,
                Ok(None) => return Ok(0),
                Err(e) => return Err(std::io::Error::other(e)),
            }
        }
        let n = buf.len().min(self.buffer.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.drain(..n);
        Ok(n)
    }
}

/// A writable SDO stream, segmented or block
///
/// Obtained from [SdoClient::open_write]. Also implements
/// [std::io::Write]. The transfer is only complete once
/// [finish](SdoWriteStream::finish) has been called.
pub struct SdoWriteStream<'a> {
    inner: WriteKind<'a>,
}

enum WriteKind<'a> {
    Segmented(SdoWriter<'a>),
    Block(BlockWriter<'a>),
}

impl<'a> SdoWriteStream<'a> {
    pub(crate) fn segmented(writer: SdoWriter<'a>) -> Self {
        Self {
            inner: WriteKind::Segmented(writer),
        }
    }

    pub(crate) fn block(writer: BlockWriter<'a>) -> Self {
        Self {
            inner: WriteKind::Block(writer),
        }
    }

    /// Append data to the transfer
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.inner {
            WriteKind::Segmented(w) => w.write_chunk(data),
            WriteKind::Block(w) => w.write_chunk(data),
        }
    }

    /// Complete the transfer
    pub fn finish(mut self) -> Result<()> {
        match &mut self.inner {
            WriteKind::Segmented(w) => w.finish(),
            WriteKind::Block(w) => w.finish(),
        }
    }
}

impl std::io::Write for SdoWriteStream<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_chunk(buf)
            .map(|_| buf.len())
            .map_err(std::io::Error::other)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
