//! Raw DEFLATE inflation that can pause between blocks and later resume.
//!
//! Wraps `miniz_oxide`'s low-level decompressor with a wrapping 64 KiB output
//! ring. While indexing, the decoder stops on every block boundary so the
//! caller can record the input position and the trailing 32 KiB of output. A
//! fresh decoder resumes from such a point given that window and, when the
//! boundary fell mid-byte, the partial byte before it (the `zran` sync-point
//! technique).

use miniz_oxide::inflate::core::{
    decompress, inflate_flags, BlockBoundaryState, DecompressorOxide,
};
use miniz_oxide::inflate::TINFLStatus;
use seekpull_core::{SeekpullError, SeekpullResult};

/// DEFLATE max back-reference distance
pub const WINDOW_SIZE: usize = 32 * 1024;

// power of two, at least one window
const OUTPUT_BUF_SIZE: usize = 64 * 1024;
const OUTPUT_MASK: usize = OUTPUT_BUF_SIZE - 1;

/// Where the decoder stands in the compressed stream.
///
/// `offset` is the first byte none of whose bits have been consumed. When
/// `bits` is non-zero, the high `bits` bits of byte `offset - 1` still belong
/// to the upcoming block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputPosition {
    pub offset: u64,
    pub bits: u8,
}

/// Why [`Inflater::step`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pause {
    /// The output ring filled up; call again.
    Output,
    /// Between two blocks. Only reported by decoders built with [`Inflater::new`].
    BlockBoundary,
    /// All input given so far is consumed.
    NeedsInput,
    /// The final block is done.
    Finished,
}

pub struct Inflater {
    state: Box<DecompressorOxide>,
    output: Vec<u8>,
    /// Write cursor into `output`
    out_pos: usize,
    last_start: usize,
    last_len: usize,
    total_in: u64,
    total_out: u64,
    flags: u32,
    finished: bool,
}

impl Inflater {
    /// Decoder for a raw DEFLATE stream whose first byte sits at `offset`.
    /// Pauses on every block boundary.
    pub fn new(offset: u64) -> Self {
        Inflater {
            state: Box::new(DecompressorOxide::new()),
            output: vec![0; OUTPUT_BUF_SIZE],
            out_pos: 0,
            last_start: 0,
            last_len: 0,
            total_in: offset,
            total_out: 0,
            flags: inflate_flags::TINFL_FLAG_STOP_ON_BLOCK_BOUNDARY,
            finished: false,
        }
    }

    /// Decoder resuming at a block boundary recorded by [`position`](Self::position).
    ///
    /// `window` must be the `min(32 KiB, uncompressed_offset)` bytes of output
    /// that preceded the boundary. When `at.bits > 0`, `partial` is byte
    /// `at.offset - 1` of the compressed stream; input then continues at
    /// `at.offset`.
    pub fn resume(
        at: InputPosition,
        partial: Option<u8>,
        uncompressed_offset: u64,
        window: &[u8],
    ) -> SeekpullResult<Self> {
        let expected = uncompressed_offset.min(WINDOW_SIZE as u64) as usize;
        if window.len() != expected {
            return Err(SeekpullError::decode(format!(
                "resume window is {} bytes, expected {expected}",
                window.len()
            )));
        }
        let boundary = match (at.bits, partial) {
            (0, _) => BlockBoundaryState::default(),
            (bits @ 1..=7, Some(byte)) => BlockBoundaryState {
                num_bits: bits,
                bit_buf: byte >> (8 - bits),
                ..Default::default()
            },
            (1..=7, None) => {
                return Err(SeekpullError::decode(
                    "resuming mid-byte needs the partial byte",
                ))
            }
            (bits, _) => {
                return Err(SeekpullError::decode(format!(
                    "bit offset {bits} out of range"
                )))
            }
        };

        let mut output = vec![0; OUTPUT_BUF_SIZE];
        output[..window.len()].copy_from_slice(window);
        Ok(Inflater {
            state: Box::new(DecompressorOxide::from_block_boundary_state(&boundary)),
            output,
            out_pos: window.len(),
            last_start: 0,
            last_len: 0,
            total_in: at.offset,
            total_out: uncompressed_offset,
            flags: 0,
            finished: false,
        })
    }

    /// Feed `input` to the decoder and run until it pauses.
    ///
    /// Returns how many bytes of `input` were consumed; the output produced by
    /// this call is available from [`output`](Self::output) until the next
    /// step. Pass `more_input = false` once `input` reaches the end of what
    /// will ever be available.
    pub fn step(&mut self, input: &[u8], more_input: bool) -> SeekpullResult<(usize, Pause)> {
        self.last_len = 0;
        if self.finished {
            return Ok((0, Pause::Finished));
        }
        let flags = if more_input {
            self.flags | inflate_flags::TINFL_FLAG_HAS_MORE_INPUT
        } else {
            self.flags
        };
        let (status, consumed, produced) =
            decompress(&mut self.state, input, &mut self.output, self.out_pos, flags);

        self.last_start = self.out_pos;
        self.last_len = produced;
        self.out_pos = (self.out_pos + produced) & OUTPUT_MASK;
        self.total_in += consumed as u64;
        self.total_out += produced as u64;

        let pause = match status {
            TINFLStatus::HasMoreOutput => Pause::Output,
            TINFLStatus::BlockBoundary => Pause::BlockBoundary,
            TINFLStatus::NeedsMoreInput | TINFLStatus::FailedCannotMakeProgress => {
                Pause::NeedsInput
            }
            TINFLStatus::Done => {
                self.finished = true;
                Pause::Finished
            }
            other => {
                return Err(SeekpullError::decode(format!(
                    "inflate failed near compressed offset {}: {other:?}",
                    self.total_in
                )))
            }
        };
        Ok((consumed, pause))
    }

    /// Output of the most recent [`step`](Self::step).
    pub fn output(&self) -> &[u8] {
        &self.output[self.last_start..self.last_start + self.last_len]
    }

    /// Exact input position. Only meaningful right after a
    /// [`Pause::BlockBoundary`].
    pub fn position(&self) -> SeekpullResult<InputPosition> {
        let boundary = self
            .state
            .block_boundary_state()
            .ok_or_else(|| SeekpullError::decode("decoder is not between blocks"))?;
        Ok(InputPosition {
            offset: self.total_in,
            bits: boundary.num_bits,
        })
    }

    /// The last `min(32 KiB, total_out)` bytes of output.
    pub fn window(&self) -> Vec<u8> {
        let len = self.total_out.min(WINDOW_SIZE as u64) as usize;
        let start = (self.out_pos + OUTPUT_BUF_SIZE - len) & OUTPUT_MASK;
        if start + len <= OUTPUT_BUF_SIZE {
            self.output[start..start + len].to_vec()
        } else {
            let mut window = self.output[start..].to_vec();
            window.extend_from_slice(&self.output[..self.out_pos]);
            window
        }
    }

    /// Absolute offset of the next unconsumed input byte.
    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    pub fn total_out(&self) -> u64 {
        self.total_out
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use proptest::prelude::*;
    use std::io::Write;

    fn deflate(data: &[u8], level: Compression) -> Vec<u8> {
        let mut enc = DeflateEncoder::new(Vec::new(), level);
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn drive(inflater: &mut Inflater, mut input: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let (consumed, pause) = inflater.step(input, false).unwrap();
            input = &input[consumed..];
            out.extend_from_slice(inflater.output());
            match pause {
                Pause::Finished => return out,
                Pause::NeedsInput => panic!("stream ended early"),
                Pause::Output | Pause::BlockBoundary => {}
            }
        }
    }

    fn inflate_all(compressed: &[u8]) -> Vec<u8> {
        drive(&mut Inflater::new(0), compressed)
    }

    fn sample(len: usize) -> Vec<u8> {
        let mut state = 0x2545_f491_u32;
        (0..len)
            .map(|i| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                if i % 7 < 4 {
                    b"layer data "[i % 11]
                } else {
                    (state % 64) as u8 + b' '
                }
            })
            .collect()
    }

    #[test]
    fn empty_stream() {
        assert!(inflate_all(&deflate(b"", Compression::default())).is_empty());
    }

    #[test]
    fn stored_blocks() {
        let data = sample(200_000);
        assert_eq!(inflate_all(&deflate(&data, Compression::none())), data);
    }

    #[test]
    fn fixed_and_dynamic_blocks() {
        let short = b"abcabcabcabcabc";
        assert_eq!(inflate_all(&deflate(short, Compression::fast())), short);
        let data = sample(300_000);
        assert_eq!(inflate_all(&deflate(&data, Compression::best())), data);
    }

    #[test]
    fn resume_from_every_block_boundary() {
        let data = sample(400_000);
        let compressed = deflate(&data, Compression::default());

        let mut inflater = Inflater::new(0);
        let mut input = compressed.as_slice();
        let mut boundaries = Vec::new();
        loop {
            let (consumed, pause) = inflater.step(input, false).unwrap();
            input = &input[consumed..];
            match pause {
                Pause::BlockBoundary => boundaries.push((
                    inflater.position().unwrap(),
                    inflater.total_out(),
                    inflater.window(),
                )),
                Pause::Finished => break,
                Pause::NeedsInput => panic!("stream ended early"),
                Pause::Output => {}
            }
        }
        assert!(boundaries.len() > 1, "sample should span several blocks");

        for (pos, out, window) in boundaries {
            let start = out as usize;
            assert_eq!(window, &data[start - start.min(WINDOW_SIZE)..start]);
            let partial = (pos.bits > 0).then(|| compressed[pos.offset as usize - 1]);
            let mut resumed = Inflater::resume(pos, partial, out, &window).unwrap();
            let rest = drive(&mut resumed, &compressed[pos.offset as usize..]);
            assert_eq!(rest, &data[start..]);
        }
    }

    #[test]
    fn position_outside_a_boundary_is_an_error() {
        let inflater = Inflater::new(0);
        assert!(matches!(inflater.position(), Err(SeekpullError::Decode(_))));
    }

    #[test]
    fn resume_rejects_inconsistent_state() {
        let at = InputPosition { offset: 10, bits: 3 };
        assert!(Inflater::resume(at, None, 0, &[]).is_err());
        let at = InputPosition { offset: 10, bits: 0 };
        assert!(Inflater::resume(at, None, 100, &[0; 10]).is_err());
    }

    #[test]
    fn truncated_input_stops_short() {
        let data = sample(100_000);
        let compressed = deflate(&data, Compression::default());
        let mut inflater = Inflater::new(0);
        let mut input = &compressed[..compressed.len() / 2];
        let mut produced = 0;
        loop {
            let (consumed, pause) = inflater.step(input, false).unwrap();
            input = &input[consumed..];
            produced += inflater.output().len();
            match pause {
                Pause::NeedsInput => break,
                Pause::Finished => panic!("half a stream must not finish"),
                Pause::Output | Pause::BlockBoundary => {}
            }
        }
        assert!(produced < data.len());
        assert!(!inflater.is_finished());
    }

    #[test]
    fn block_type_three_is_rejected() {
        // BFINAL=1, BTYPE=11
        let mut inflater = Inflater::new(0);
        assert!(matches!(
            inflater.step(&[0b0000_0111u8], false),
            Err(SeekpullError::Decode(_))
        ));
    }

    proptest! {
        #[test]
        fn matches_reference_encoder(
            data in proptest::collection::vec(any::<u8>(), 0..=20_000),
            level in 0u32..=9,
        ) {
            let compressed = deflate(&data, Compression::new(level));
            prop_assert_eq!(inflate_all(&compressed), data);
        }
    }
}
