//! Binary `.ztoc` artifact.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic "SPZT" | version u32
//! span_size u64 | compressed_size u64 | uncompressed_size u64
//! checkpoint_count u32
//!   compressed_offset u64 | uncompressed_offset u64 | bit_offset u8
//!   window_len u32 | window bytes
//! entry_count u32
//!   kind u8 | mode u32 | uncompressed_offset u64 | uncompressed_size u64
//!   span_start u32 | span_end u32
//!   path_len u32 | path | link_len u32 | link (link_len == u32::MAX: none)
//! ```
//!
//! Span ids are implicit: checkpoint `i` is span `i`.

use bytes::{Buf, BufMut};
use seekpull_core::{SeekpullError, SeekpullResult};

use crate::index::{Checkpoint, SpanIndex};
use crate::toc::{EntryKind, TocEntry, Ztoc};

pub const MAGIC: &[u8; 4] = b"SPZT";
pub const VERSION: u32 = 1;

const NO_LINK: u32 = u32::MAX;

fn need(buf: &&[u8], n: usize, what: &str) -> SeekpullResult<()> {
    if buf.remaining() < n {
        return Err(SeekpullError::decode(format!(
            "truncated ztoc: {what} needs {n} bytes, {} left",
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_u8(buf: &mut &[u8], what: &str) -> SeekpullResult<u8> {
    need(buf, 1, what)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8], what: &str) -> SeekpullResult<u32> {
    need(buf, 4, what)?;
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut &[u8], what: &str) -> SeekpullResult<u64> {
    need(buf, 8, what)?;
    Ok(buf.get_u64_le())
}

fn get_bytes(buf: &mut &[u8], len: usize, what: &str) -> SeekpullResult<Vec<u8>> {
    need(buf, len, what)?;
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

fn get_string(buf: &mut &[u8], len: usize, what: &str) -> SeekpullResult<String> {
    String::from_utf8(get_bytes(buf, len, what)?)
        .map_err(|e| SeekpullError::decode(format!("{what} is not UTF-8: {e}")))
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.put_u32_le(s.len() as u32);
    out.put_slice(s.as_bytes());
}

impl Ztoc {
    pub fn to_bytes(&self) -> Vec<u8> {
        let index = &self.index;
        let windows: usize = index.checkpoints().iter().map(|c| c.window.len() + 21).sum();
        let mut out = Vec::with_capacity(64 + windows + self.toc.len() * 64);

        out.put_slice(MAGIC);
        out.put_u32_le(VERSION);
        out.put_u64_le(index.span_size());
        out.put_u64_le(index.compressed_size());
        out.put_u64_le(index.uncompressed_size());

        out.put_u32_le(index.checkpoints().len() as u32);
        for cp in index.checkpoints() {
            out.put_u64_le(cp.compressed_offset);
            out.put_u64_le(cp.uncompressed_offset);
            out.put_u8(cp.bit_offset);
            out.put_u32_le(cp.window.len() as u32);
            out.put_slice(&cp.window);
        }

        out.put_u32_le(self.toc.len() as u32);
        for e in &self.toc {
            out.put_u8(e.kind.code());
            out.put_u32_le(e.mode);
            out.put_u64_le(e.uncompressed_offset);
            out.put_u64_le(e.uncompressed_size);
            out.put_u32_le(e.span_start);
            out.put_u32_le(e.span_end);
            put_str(&mut out, &e.path);
            match &e.link_name {
                Some(link) => put_str(&mut out, link),
                None => out.put_u32_le(NO_LINK),
            }
        }
        out
    }

    pub fn from_bytes(mut buf: &[u8]) -> SeekpullResult<Self> {
        let buf = &mut buf;
        let magic = get_bytes(buf, 4, "magic")?;
        if magic != MAGIC {
            return Err(SeekpullError::decode("not a ztoc file (bad magic)"));
        }
        let version = get_u32(buf, "version")?;
        if version != VERSION {
            return Err(SeekpullError::decode(format!(
                "unsupported ztoc version {version}"
            )));
        }
        let span_size = get_u64(buf, "span size")?;
        let compressed_size = get_u64(buf, "compressed size")?;
        let uncompressed_size = get_u64(buf, "uncompressed size")?;

        let count = get_u32(buf, "checkpoint count")? as usize;
        // each checkpoint takes at least 21 bytes
        need(buf, count.saturating_mul(21), "checkpoints")?;
        let mut checkpoints = Vec::with_capacity(count);
        for span_id in 0..count {
            let compressed_offset = get_u64(buf, "compressed offset")?;
            let uncompressed_offset = get_u64(buf, "uncompressed offset")?;
            let bit_offset = get_u8(buf, "bit offset")?;
            let window_len = get_u32(buf, "window length")? as usize;
            let window = get_bytes(buf, window_len, "window")?;
            checkpoints.push(Checkpoint {
                span_id: span_id as u32,
                compressed_offset,
                bit_offset,
                uncompressed_offset,
                window,
            });
        }
        let index =
            SpanIndex::from_parts(span_size, compressed_size, uncompressed_size, checkpoints)?;

        let entries = get_u32(buf, "entry count")? as usize;
        need(buf, entries.saturating_mul(37), "entries")?;
        let mut toc = Vec::with_capacity(entries);
        for _ in 0..entries {
            let kind = EntryKind::from_code(get_u8(buf, "entry kind")?)?;
            let mode = get_u32(buf, "mode")?;
            let uncompressed_offset = get_u64(buf, "entry offset")?;
            let uncompressed_size = get_u64(buf, "entry size")?;
            let span_start = get_u32(buf, "span start")?;
            let span_end = get_u32(buf, "span end")?;
            let path_len = get_u32(buf, "path length")? as usize;
            let path = get_string(buf, path_len, "path")?;
            let link_name = match get_u32(buf, "link length")? {
                NO_LINK => None,
                len => Some(get_string(buf, len as usize, "link name")?),
            };
            if span_start > span_end || span_end > index.max_span_id() {
                return Err(SeekpullError::decode(format!(
                    "entry {path} references spans {span_start}..={span_end} of {}",
                    index.span_count()
                )));
            }
            toc.push(TocEntry {
                path,
                kind,
                link_name,
                mode,
                uncompressed_offset,
                uncompressed_size,
                span_start,
                span_end,
            });
        }

        if buf.has_remaining() {
            return Err(SeekpullError::decode(format!(
                "{} trailing bytes after ztoc",
                buf.remaining()
            )));
        }
        Ok(Ztoc { index, toc })
    }

    /// BLAKE3 digest of the serialized artifact.
    pub fn digest(&self) -> blake3::Hash {
        blake3::hash(&self.to_bytes())
    }
}
