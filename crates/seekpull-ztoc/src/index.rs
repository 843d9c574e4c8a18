//! Span index: decoder checkpoints taken at DEFLATE block boundaries.

use std::io::{self, Read};

use flate2::Crc;
use seekpull_core::{SeekpullError, SeekpullResult, SpanId};
use tracing::{debug, trace};

use crate::gzip::{self, GzipHeader};
use crate::inflate::{Inflater, Pause, WINDOW_SIZE};

const INPUT_BUF_SIZE: usize = 32 * 1024;

/// Decoder state saved at the start of a span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub span_id: SpanId,
    /// First byte none of whose bits the decoder had consumed.
    pub compressed_offset: u64,
    /// Unconsumed high bits in byte `compressed_offset - 1`, 0 when aligned.
    pub bit_offset: u8,
    pub uncompressed_offset: u64,
    /// The `min(32 KiB, uncompressed_offset)` bytes of output before this point.
    pub window: Vec<u8>,
}

/// Ordered checkpoints over one gzip-compressed layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanIndex {
    pub(crate) span_size: u64,
    pub(crate) compressed_size: u64,
    pub(crate) uncompressed_size: u64,
    pub(crate) checkpoints: Vec<Checkpoint>,
}

impl SpanIndex {
    /// Assemble an index, checking the invariants every consumer relies on.
    pub fn from_parts(
        span_size: u64,
        compressed_size: u64,
        uncompressed_size: u64,
        checkpoints: Vec<Checkpoint>,
    ) -> SeekpullResult<Self> {
        if span_size == 0 {
            return Err(SeekpullError::config("span size must be positive"));
        }
        let first = checkpoints
            .first()
            .ok_or_else(|| SeekpullError::decode("span index has no checkpoints"))?;
        if first.uncompressed_offset != 0 {
            return Err(SeekpullError::decode("first checkpoint is not at offset 0"));
        }

        for (i, cp) in checkpoints.iter().enumerate() {
            if cp.span_id as usize != i {
                return Err(SeekpullError::decode(format!(
                    "checkpoint {i} carries span id {}",
                    cp.span_id
                )));
            }
            if cp.bit_offset >= 8 {
                return Err(SeekpullError::decode(format!(
                    "checkpoint {i} has bit offset {}",
                    cp.bit_offset
                )));
            }
            if cp.bit_offset > 0 && cp.compressed_offset == 0 {
                return Err(SeekpullError::decode(format!(
                    "checkpoint {i} has bits before the start of the stream"
                )));
            }
            let window = cp.uncompressed_offset.min(WINDOW_SIZE as u64);
            if cp.window.len() as u64 != window {
                return Err(SeekpullError::decode(format!(
                    "checkpoint {i} window is {} bytes, expected {window}",
                    cp.window.len()
                )));
            }
            if cp.compressed_offset > compressed_size || cp.uncompressed_offset > uncompressed_size
            {
                return Err(SeekpullError::decode(format!(
                    "checkpoint {i} lies beyond the end of the layer"
                )));
            }
            if i > 0 {
                let prev = &checkpoints[i - 1];
                if cp.compressed_offset <= prev.compressed_offset
                    || cp.uncompressed_offset <= prev.uncompressed_offset
                {
                    return Err(SeekpullError::decode(format!(
                        "checkpoint {i} does not advance past checkpoint {}",
                        i - 1
                    )));
                }
            }
        }

        Ok(SpanIndex {
            span_size,
            compressed_size,
            uncompressed_size,
            checkpoints,
        })
    }

    pub fn span_size(&self) -> u64 {
        self.span_size
    }

    /// Total length of the gzip file, header and trailer included.
    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn span_count(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn max_span_id(&self) -> SpanId {
        (self.checkpoints.len() - 1) as SpanId
    }

    pub fn checkpoint(&self, id: SpanId) -> SeekpullResult<&Checkpoint> {
        self.checkpoints.get(id as usize).ok_or_else(|| {
            SeekpullError::config(format!(
                "span id {id} out of range (max {})",
                self.max_span_id()
            ))
        })
    }
}

/// Builds a [`SpanIndex`] while handing the decompressed stream to a reader.
///
/// The builder is itself a [`Read`]: whatever consumes it (a tar walker, a
/// hasher, `io::copy`) drives decompression, and checkpoints are recorded
/// along the way. Call [`finish`](Self::finish) once the consumer is done.
pub struct SpanIndexBuilder<R> {
    reader: R,
    input: Vec<u8>,
    in_pos: usize,
    in_len: usize,
    eof: bool,
    /// Absolute offset just past the last byte pulled from `reader`
    loaded: u64,
    inflater: Inflater,
    header: GzipHeader,
    span_size: u64,
    checkpoints: Vec<Checkpoint>,
    crc: Crc,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<R: Read> SpanIndexBuilder<R> {
    pub fn new(mut reader: R, span_size: u64) -> SeekpullResult<Self> {
        if span_size == 0 {
            return Err(SeekpullError::config("span size must be positive"));
        }
        let header = gzip::read_header(&mut reader)?;
        trace!(header_len = header.len, name = ?header.name, "gzip header");
        let first = Checkpoint {
            span_id: 0,
            compressed_offset: header.len,
            bit_offset: 0,
            uncompressed_offset: 0,
            window: Vec::new(),
        };
        Ok(SpanIndexBuilder {
            reader,
            input: vec![0; INPUT_BUF_SIZE],
            in_pos: 0,
            in_len: 0,
            eof: false,
            loaded: header.len,
            inflater: Inflater::new(header.len),
            header,
            span_size,
            checkpoints: vec![first],
            crc: Crc::new(),
            pending: Vec::new(),
            pending_pos: 0,
        })
    }

    pub fn header(&self) -> &GzipHeader {
        &self.header
    }

    fn refill(&mut self) -> SeekpullResult<()> {
        let n = loop {
            match self.reader.read(&mut self.input) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        self.in_pos = 0;
        self.in_len = n;
        self.loaded += n as u64;
        self.eof = n == 0;
        Ok(())
    }

    fn checkpoint_if_due(&mut self) -> SeekpullResult<()> {
        let out = self.inflater.total_out();
        let last = self
            .checkpoints
            .last()
            .map_or(0, |cp| cp.uncompressed_offset);
        if out - last < self.span_size {
            return Ok(());
        }
        let pos = self.inflater.position()?;
        let cp = Checkpoint {
            span_id: self.checkpoints.len() as SpanId,
            compressed_offset: pos.offset,
            bit_offset: pos.bits,
            uncompressed_offset: out,
            window: self.inflater.window(),
        };
        trace!(
            span_id = cp.span_id,
            compressed_offset = cp.compressed_offset,
            bit_offset = cp.bit_offset,
            uncompressed_offset = cp.uncompressed_offset,
            "checkpoint"
        );
        self.checkpoints.push(cp);
        Ok(())
    }

    /// Decode until there is fresh output in `pending`. Returns false at end
    /// of stream.
    fn advance(&mut self) -> SeekpullResult<bool> {
        loop {
            if self.inflater.is_finished() {
                return Ok(false);
            }
            if self.in_pos == self.in_len && !self.eof {
                self.refill()?;
            }
            let (consumed, pause) = self
                .inflater
                .step(&self.input[self.in_pos..self.in_len], !self.eof)?;
            self.in_pos += consumed;

            let out = self.inflater.output();
            self.crc.update(out);
            self.pending.clear();
            self.pending.extend_from_slice(out);
            self.pending_pos = 0;

            match pause {
                Pause::BlockBoundary => self.checkpoint_if_due()?,
                Pause::NeedsInput if self.eof => {
                    return Err(SeekpullError::decode("unexpected end of compressed data"))
                }
                Pause::NeedsInput | Pause::Output | Pause::Finished => {}
            }
            if !self.pending.is_empty() {
                return Ok(true);
            }
        }
    }

    fn read_trailer(&mut self) -> SeekpullResult<[u8; 8]> {
        let mut trailer = [0u8; 8];
        let mut filled = 0;
        while filled < trailer.len() {
            if self.in_pos == self.in_len {
                if self.eof {
                    return Err(SeekpullError::decode("truncated gzip trailer"));
                }
                self.refill()?;
                continue;
            }
            let n = (self.in_len - self.in_pos).min(trailer.len() - filled);
            trailer[filled..filled + n].copy_from_slice(&self.input[self.in_pos..self.in_pos + n]);
            self.in_pos += n;
            filled += n;
        }
        Ok(trailer)
    }

    /// Decompress whatever the consumer left unread, verify the gzip trailer,
    /// and return the finished index.
    pub fn finish(mut self) -> SeekpullResult<SpanIndex> {
        while self.advance()? {}

        let (crc, isize) = gzip::parse_trailer(self.read_trailer()?);
        if crc != self.crc.sum() {
            return Err(SeekpullError::decode(format!(
                "gzip CRC mismatch: trailer {crc:08x}, computed {:08x}",
                self.crc.sum()
            )));
        }
        let out = self.inflater.total_out();
        if isize != out as u32 {
            return Err(SeekpullError::decode(format!(
                "gzip ISIZE mismatch: trailer {isize}, decoded {out}"
            )));
        }
        while !self.eof {
            self.refill()?;
        }
        let compressed_size = self.loaded;

        debug!(
            spans = self.checkpoints.len(),
            compressed_size,
            uncompressed_size = out,
            span_size = self.span_size,
            "built span index"
        );
        SpanIndex::from_parts(self.span_size, compressed_size, out, self.checkpoints)
    }
}

impl<R: Read> Read for SpanIndexBuilder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending_pos == self.pending.len() {
            if !self.advance().map_err(into_io)? {
                return Ok(0);
            }
        }
        let n = (self.pending.len() - self.pending_pos).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
        self.pending_pos += n;
        Ok(n)
    }
}

fn into_io(err: SeekpullError) -> io::Error {
    match err {
        SeekpullError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Recover a [`SeekpullError`] that travelled through an `io::Error`.
pub(crate) fn from_io(err: io::Error) -> SeekpullError {
    if err
        .get_ref()
        .is_some_and(|inner| inner.is::<SeekpullError>())
    {
        if let Some(Ok(inner)) = err.into_inner().map(|e| e.downcast::<SeekpullError>()) {
            return *inner;
        }
        return SeekpullError::decode("unrecoverable wrapped error");
    }
    SeekpullError::Io(err)
}

/// Index a gzip stream without looking at its contents.
pub fn build_index<R: Read>(reader: R, span_size: u64) -> SeekpullResult<SpanIndex> {
    SpanIndexBuilder::new(reader, span_size)?.finish()
}
