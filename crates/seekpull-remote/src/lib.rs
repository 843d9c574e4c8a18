//! seekpull-remote: range reads against registry blobs over HTTP
//!
//! # Overview
//! - `blob`: shared, concurrently readable blob handle with auth refresh and single-range fallback
//! - `fetcher`: resolved blob URL plus range GETs
//! - `multipart`: `Content-Range` and `multipart/byteranges` parsing
//! - `region_set`: merged byte-region bookkeeping
//! - `retry`: exponential backoff with jitter

pub mod blob;
pub mod fetcher;
pub mod multipart;
pub mod redact;
pub mod region_set;
mod retry;

pub use blob::Blob;
pub use fetcher::{HttpFetcher, Transport};
pub use multipart::{parse_content_range, MultipartParts, Part};
pub use redact::redact_url;
pub use region_set::RegionSet;
