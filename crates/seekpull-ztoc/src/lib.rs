//! seekpull-ztoc: random access into gzip-compressed tar layers
//!
//! # Overview
//! - `inflate`: `miniz_oxide` inflation that pauses and resumes on block boundaries
//! - `index`: span index built in one pass; checkpoints every `span_size` output bytes
//! - `locator`: offset-to-span arithmetic
//! - `extract`: fetch only the spans a file touches and decode them
//! - `toc`: tar entry positions, recorded during the same pass
//! - `artifact`: the `.ztoc` binary format and its BLAKE3 digest

pub mod artifact;
pub mod extract;
pub mod gzip;
pub mod index;
pub mod inflate;
pub mod local;
pub mod locator;
pub mod toc;

pub use extract::{decompress_spans, extract, span_regions};
pub use index::{build_index, Checkpoint, SpanIndex, SpanIndexBuilder};
pub use inflate::{InputPosition, Inflater, Pause, WINDOW_SIZE};
pub use local::LocalFile;
pub use toc::{build_ztoc, normalize_path, EntryKind, TocEntry, Ztoc};
