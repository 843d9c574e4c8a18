//! Offset arithmetic over a [`SpanIndex`].

use seekpull_core::{FileMetadata, Region, SeekpullResult, SpanId};

use crate::index::SpanIndex;

impl SpanIndex {
    /// Greatest span whose checkpoint starts at or before `offset`.
    ///
    /// Offsets past the end of the stream land in the last span.
    pub fn locate(&self, uncompressed_offset: u64) -> SpanId {
        let after = self
            .checkpoints
            .partition_point(|cp| cp.uncompressed_offset <= uncompressed_offset);
        after.saturating_sub(1) as SpanId
    }

    pub fn compressed_offset(&self, id: SpanId) -> SeekpullResult<u64> {
        Ok(self.checkpoint(id)?.compressed_offset)
    }

    pub fn uncompressed_offset(&self, id: SpanId) -> SeekpullResult<u64> {
        Ok(self.checkpoint(id)?.uncompressed_offset)
    }

    /// Whether span `id` starts partway through a byte.
    pub fn has_bits(&self, id: SpanId) -> bool {
        self.checkpoints
            .get(id as usize)
            .is_some_and(|cp| cp.bit_offset > 0)
    }

    /// Compressed bytes holding span `id`'s blocks.
    ///
    /// Runs from the checkpoint to the byte before the next span's checkpoint
    /// (which, when that span starts mid-byte, also carries its first bits),
    /// or to the end of the file for the last span. A span that itself starts
    /// mid-byte needs the byte before its checkpoint too; callers reading from
    /// that span add it (see [`span_regions`](crate::extract::span_regions)).
    pub fn span_region(&self, id: SpanId) -> SeekpullResult<Region> {
        let cp = self.checkpoint(id)?;
        let end = match self.checkpoints.get(id as usize + 1) {
            Some(next) => next.compressed_offset - 1,
            None => self.compressed_size - 1,
        };
        Ok(Region::new(cp.compressed_offset, end))
    }

    /// Spans touched by the uncompressed range `[offset, offset + size)`.
    pub fn file_metadata(&self, uncompressed_offset: u64, uncompressed_size: u64) -> FileMetadata {
        let span_start = self.locate(uncompressed_offset);
        let span_end = if uncompressed_size == 0 {
            span_start
        } else {
            self.locate(uncompressed_offset + uncompressed_size - 1)
        };
        FileMetadata {
            uncompressed_offset,
            uncompressed_size,
            span_start,
            span_end,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::extract::span_regions;
    use crate::index::{build_index, Checkpoint, SpanIndex};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use proptest::prelude::*;
    use seekpull_core::{Region, SeekpullError};
    use std::io::Write;

    fn index() -> SpanIndex {
        let cps = [(10u64, 0u8, 0u64), (500, 3, 1000), (900, 0, 2000), (1400, 7, 3000)];
        let checkpoints = cps
            .iter()
            .enumerate()
            .map(|(i, &(c, bits, u))| Checkpoint {
                span_id: i as u32,
                compressed_offset: c,
                bit_offset: bits,
                uncompressed_offset: u,
                window: vec![0; u.min(32 * 1024) as usize],
            })
            .collect();
        SpanIndex::from_parts(1000, 2000, 3500, checkpoints).unwrap()
    }

    #[test]
    fn locate_uses_greatest_checkpoint_at_or_before() {
        let idx = index();
        assert_eq!(idx.locate(0), 0);
        assert_eq!(idx.locate(999), 0);
        assert_eq!(idx.locate(1000), 1);
        assert_eq!(idx.locate(2999), 2);
        assert_eq!(idx.locate(3000), 3);
        assert_eq!(idx.locate(u64::MAX), 3);
    }

    #[test]
    fn offsets_by_span_id() {
        let idx = index();
        assert_eq!(idx.compressed_offset(2).unwrap(), 900);
        assert_eq!(idx.uncompressed_offset(3).unwrap(), 3000);
        assert!(matches!(
            idx.compressed_offset(4),
            Err(SeekpullError::Config(_))
        ));
        assert!(idx.has_bits(1));
        assert!(!idx.has_bits(2));
        assert!(!idx.has_bits(99));
    }

    #[test]
    fn span_regions_tile_the_stream() {
        let idx = index();
        assert_eq!(idx.span_region(0).unwrap(), Region::new(10, 499));
        assert_eq!(idx.span_region(1).unwrap(), Region::new(500, 899));
        assert_eq!(idx.span_region(2).unwrap(), Region::new(900, 1399));
        assert_eq!(idx.span_region(3).unwrap(), Region::new(1400, 1999));
    }

    #[test]
    fn only_the_first_region_reaches_back_for_a_partial_byte() {
        let idx = index();
        let file = idx.file_metadata(1500, 1800);
        assert_eq!((file.span_start, file.span_end), (1, 3));
        let regions = span_regions(&idx, &file).unwrap();
        assert_eq!(
            regions,
            vec![
                Region::new(499, 899),
                Region::new(900, 1399),
                Region::new(1400, 1999),
            ]
        );

        let file = idx.file_metadata(2500, 900);
        let regions = span_regions(&idx, &file).unwrap();
        assert_eq!(regions, vec![Region::new(900, 1399), Region::new(1400, 1999)]);
    }

    #[test]
    fn file_metadata_spans() {
        let idx = index();
        let m = idx.file_metadata(950, 100);
        assert_eq!((m.span_start, m.span_end), (0, 1));
        let m = idx.file_metadata(1000, 1000);
        assert_eq!((m.span_start, m.span_end), (1, 1));
        let m = idx.file_metadata(2500, 0);
        assert_eq!((m.span_start, m.span_end), (2, 2));
    }

    fn layer(seed: u32, alphabet: u8, len: usize) -> Vec<u8> {
        let mut x = seed | 1;
        let data: Vec<u8> = (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                b'!' + (x % alphabet as u32) as u8
            })
            .collect();
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&data).unwrap();
        enc.finish().unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn built_indexes_are_monotonic(
            seed in any::<u32>(),
            alphabet in 2u8..=90,
            len in 0usize..200_000,
            span_size in 1u64..50_000,
        ) {
            let gz = layer(seed, alphabet, len);
            let idx = build_index(gz.as_slice(), span_size).unwrap();
            let max = idx.max_span_id();

            for id in 0..max {
                prop_assert!(idx.uncompressed_offset(id).unwrap() <= idx.uncompressed_offset(id + 1).unwrap());
                prop_assert!(idx.compressed_offset(id).unwrap() <= idx.compressed_offset(id + 1).unwrap());
            }
            for id in 0..=max {
                prop_assert_eq!(idx.locate(idx.uncompressed_offset(id).unwrap()), id);
            }
            // span regions are non-empty and tile the deflate data
            let regions: Vec<Region> = (0..=max).map(|id| idx.span_region(id).unwrap()).collect();
            for pair in regions.windows(2) {
                prop_assert_eq!(pair[0].end + 1, pair[1].begin);
            }
            prop_assert_eq!(regions[max as usize].end, idx.compressed_size() - 1);
        }
    }
}
