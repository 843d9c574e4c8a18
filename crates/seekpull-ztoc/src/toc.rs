//! Table of contents: where each tar entry lives in the uncompressed stream.

use std::io::Read;

use serde::{Deserialize, Serialize};
use tar::EntryType;
use tracing::debug;

use seekpull_core::{FileMetadata, ReadAt, SeekpullError, SeekpullResult, SpanId};

use crate::extract::extract;
use crate::index::{from_io, SpanIndex, SpanIndexBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Hardlink,
    Other,
}

impl EntryKind {
    pub(crate) fn code(self) -> u8 {
        match self {
            EntryKind::File => 0,
            EntryKind::Dir => 1,
            EntryKind::Symlink => 2,
            EntryKind::Hardlink => 3,
            EntryKind::Other => 4,
        }
    }

    pub(crate) fn from_code(code: u8) -> SeekpullResult<Self> {
        Ok(match code {
            0 => EntryKind::File,
            1 => EntryKind::Dir,
            2 => EntryKind::Symlink,
            3 => EntryKind::Hardlink,
            4 => EntryKind::Other,
            _ => return Err(SeekpullError::decode(format!("unknown entry kind {code}"))),
        })
    }
}

impl From<EntryType> for EntryKind {
    fn from(t: EntryType) -> Self {
        if t.is_file() {
            EntryKind::File
        } else if t.is_dir() {
            EntryKind::Dir
        } else if t.is_symlink() {
            EntryKind::Symlink
        } else if t.is_hard_link() {
            EntryKind::Hardlink
        } else {
            EntryKind::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    pub path: String,
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_name: Option<String>,
    pub mode: u32,
    pub uncompressed_offset: u64,
    pub uncompressed_size: u64,
    pub span_start: SpanId,
    pub span_end: SpanId,
}

impl TocEntry {
    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            uncompressed_offset: self.uncompressed_offset,
            uncompressed_size: self.uncompressed_size,
            span_start: self.span_start,
            span_end: self.span_end,
        }
    }
}

/// Span index plus table of contents for one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ztoc {
    pub index: SpanIndex,
    pub toc: Vec<TocEntry>,
}

/// `./a/b/` and `/a/b` both become `a/b`.
pub fn normalize_path(path: &str) -> String {
    let mut p = path;
    loop {
        if let Some(rest) = p.strip_prefix("./") {
            p = rest;
        } else if let Some(rest) = p.strip_prefix('/') {
            p = rest;
        } else {
            break;
        }
    }
    p.trim_end_matches('/').to_string()
}

impl Ztoc {
    pub fn without_toc(index: SpanIndex) -> Self {
        Ztoc {
            index,
            toc: Vec::new(),
        }
    }

    pub fn lookup(&self, path: &str) -> Option<&TocEntry> {
        let wanted = normalize_path(path);
        // a later entry for the same path replaces earlier ones
        self.toc.iter().rev().find(|e| e.path == wanted)
    }

    /// Fetch and decode a regular file by path.
    pub async fn extract_file<R: ReadAt>(&self, reader: &R, path: &str) -> SeekpullResult<Vec<u8>> {
        let entry = self.lookup(path).ok_or_else(|| {
            SeekpullError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{path} not found in layer"),
            ))
        })?;
        if entry.kind != EntryKind::File {
            return Err(SeekpullError::config(format!(
                "{path} is a {:?}, not a regular file",
                entry.kind
            )));
        }
        extract(reader, &self.index, &entry.metadata()).await
    }
}

/// Decompress a gzip'd tar once, recording checkpoints every `span_size`
/// bytes and the position of every entry.
pub fn build_ztoc<R: Read>(reader: R, span_size: u64) -> SeekpullResult<Ztoc> {
    let mut builder = SpanIndexBuilder::new(reader, span_size)?;
    let mut raw = Vec::new();
    {
        let mut archive = tar::Archive::new(&mut builder);
        for entry in archive.entries().map_err(from_io)? {
            let entry = entry.map_err(from_io)?;
            let path = normalize_path(&entry.path().map_err(from_io)?.to_string_lossy());
            let link_name = entry
                .link_name()
                .map_err(from_io)?
                .map(|l| l.to_string_lossy().into_owned());
            let header = entry.header();
            raw.push((
                path,
                EntryKind::from(header.entry_type()),
                link_name,
                header.mode().map_err(from_io)?,
                entry.raw_file_position(),
                entry.size(),
            ));
        }
    }
    let index = builder.finish()?;

    let toc: Vec<TocEntry> = raw
        .into_iter()
        .map(|(path, kind, link_name, mode, offset, size)| {
            let meta = index.file_metadata(offset, size);
            TocEntry {
                path,
                kind,
                link_name,
                mode,
                uncompressed_offset: offset,
                uncompressed_size: size,
                span_start: meta.span_start,
                span_end: meta.span_end,
            }
        })
        .collect();
    debug!(entries = toc.len(), spans = index.span_count(), "built ztoc");
    Ok(Ztoc { index, toc })
}
