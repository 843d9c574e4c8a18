//! Range extraction: fetch the compressed spans covering a file and decode
//! only those.

use seekpull_core::{FileMetadata, ReadAt, Region, SeekpullError, SeekpullResult};
use tracing::debug;

use crate::index::SpanIndex;
use crate::inflate::{Inflater, InputPosition, Pause};

/// Compressed regions to fetch for `file`, one per span, in span order.
///
/// Regions are adjacent and never overlap. When the first span starts
/// mid-byte its region also takes the byte before the checkpoint.
pub fn span_regions(index: &SpanIndex, file: &FileMetadata) -> SeekpullResult<Vec<Region>> {
    validate(index, file)?;
    let mut regions = (file.span_start..=file.span_end)
        .map(|id| index.span_region(id))
        .collect::<SeekpullResult<Vec<_>>>()?;
    if index.has_bits(file.span_start) {
        if let Some(first) = regions.first_mut() {
            *first = Region::new(first.begin - 1, first.end);
        }
    }
    Ok(regions)
}

fn validate(index: &SpanIndex, file: &FileMetadata) -> SeekpullResult<()> {
    if file.span_start > file.span_end || file.span_end > index.max_span_id() {
        return Err(SeekpullError::config(format!(
            "span range {}..={} invalid for index with {} spans",
            file.span_start,
            file.span_end,
            index.span_count()
        )));
    }
    let end = file
        .uncompressed_offset
        .checked_add(file.uncompressed_size)
        .filter(|&end| end <= index.uncompressed_size())
        .ok_or_else(|| {
            SeekpullError::config(format!(
                "file range {}+{} exceeds layer size {}",
                file.uncompressed_offset,
                file.uncompressed_size,
                index.uncompressed_size()
            ))
        })?;
    let start_cp = index.uncompressed_offset(file.span_start)?;
    let next_cp = index
        .checkpoints()
        .get(file.span_end as usize + 1)
        .map_or(index.uncompressed_size(), |cp| cp.uncompressed_offset);
    if file.uncompressed_offset < start_cp || end > next_cp {
        return Err(SeekpullError::config(format!(
            "file range {}..{end} is not covered by spans {}..={}",
            file.uncompressed_offset, file.span_start, file.span_end
        )));
    }
    Ok(())
}

/// Decode `file` out of the concatenated compressed bytes of its spans.
///
/// `compressed` must hold exactly the regions returned by [`span_regions`],
/// back to back.
pub fn decompress_spans(
    index: &SpanIndex,
    file: &FileMetadata,
    compressed: &[u8],
) -> SeekpullResult<Vec<u8>> {
    validate(index, file)?;
    let cp = index.checkpoint(file.span_start)?;
    let (partial, mut input) = if cp.bit_offset > 0 {
        let (&first, rest) = compressed
            .split_first()
            .ok_or_else(|| SeekpullError::decode("no compressed bytes for span"))?;
        (Some(first), rest)
    } else {
        (None, compressed)
    };

    let at = InputPosition {
        offset: cp.compressed_offset,
        bits: cp.bit_offset,
    };
    let mut inflater = Inflater::resume(at, partial, cp.uncompressed_offset, &cp.window)?;
    let skip = file.uncompressed_offset - cp.uncompressed_offset;
    let want = file.uncompressed_size as usize;
    let mut out = Vec::with_capacity(want);
    let mut produced = 0u64;

    while out.len() < want {
        let (consumed, pause) = inflater.step(input, false)?;
        input = &input[consumed..];

        let chunk = inflater.output();
        let chunk_start = produced;
        produced += chunk.len() as u64;
        if produced > skip {
            let from = skip.saturating_sub(chunk_start) as usize;
            let take = (chunk.len() - from).min(want - out.len());
            out.extend_from_slice(&chunk[from..from + take]);
        }
        if matches!(pause, Pause::NeedsInput | Pause::Finished) {
            break;
        }
    }

    if out.len() != want {
        return Err(SeekpullError::decode(format!(
            "decoded {} of {want} bytes for file at offset {}",
            out.len(),
            file.uncompressed_offset
        )));
    }
    Ok(out)
}

/// Read one file's bytes out of a compressed layer.
///
/// Each span's compressed range is requested from `reader` concurrently
/// (or merged, if the reader prefers); decoding starts at the first span's
/// checkpoint and stops as soon as the file is complete.
pub async fn extract<R: ReadAt>(
    reader: &R,
    index: &SpanIndex,
    file: &FileMetadata,
) -> SeekpullResult<Vec<u8>> {
    if file.uncompressed_size == 0 {
        return Ok(Vec::new());
    }
    let regions = span_regions(index, file)?;
    let total: u64 = regions.iter().map(Region::size).sum();
    let mut compressed = vec![0u8; total as usize];
    reader.read_regions(&regions, &mut compressed).await?;
    debug!(
        offset = file.uncompressed_offset,
        size = file.uncompressed_size,
        span_start = file.span_start,
        span_end = file.span_end,
        compressed_bytes = total,
        "extracting file"
    );
    decompress_spans(index, file, &compressed)
}
