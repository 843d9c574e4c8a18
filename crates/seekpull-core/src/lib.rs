pub mod config;
pub mod error;
pub mod read_at;
pub mod types;

pub use error::{SeekpullError, SeekpullResult};
pub use read_at::ReadAt;
pub use types::{FileMetadata, Region, SpanId};
