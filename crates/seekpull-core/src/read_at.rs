//! Positional reads over a compressed layer, local or remote.

use std::future::Future;

use bytes::Bytes;
use futures::future::try_join_all;

use crate::error::{SeekpullError, SeekpullResult};
use crate::types::Region;

/// Random access to an immutable byte object.
///
/// Implementations must be safe to call concurrently from many tasks.
pub trait ReadAt: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns fewer bytes than requested only when the object ends first,
    /// and `0` when `offset` is at or past the end.
    fn read_at(
        &self,
        buf: &mut [u8],
        offset: u64,
    ) -> impl Future<Output = SeekpullResult<usize>> + Send;

    /// Fill `buf` with the contents of `regions`, laid out back to back in order.
    ///
    /// The default issues one `read_at` per region and drives them concurrently.
    /// Every region must be read in full.
    fn read_regions(
        &self,
        regions: &[Region],
        buf: &mut [u8],
    ) -> impl Future<Output = SeekpullResult<()>> + Send {
        async move {
            let want: u64 = regions.iter().map(Region::size).sum();
            if want != buf.len() as u64 {
                return Err(SeekpullError::protocol(format!(
                    "buffer of {} bytes for regions totalling {want}",
                    buf.len()
                )));
            }

            let mut rest = buf;
            let mut reads = Vec::with_capacity(regions.len());
            for region in regions {
                let (head, tail) = std::mem::take(&mut rest).split_at_mut(region.size() as usize);
                rest = tail;
                let offset = region.begin;
                reads.push(async move {
                    let expected = head.len();
                    let n = self.read_at(head, offset).await?;
                    if n != expected {
                        return Err(SeekpullError::ShortRead {
                            expected: expected as u64,
                            actual: n as u64,
                        });
                    }
                    Ok(())
                });
            }
            try_join_all(reads).await?;
            Ok(())
        }
    }
}

fn copy_at(src: &[u8], buf: &mut [u8], offset: u64) -> usize {
    let Ok(start) = usize::try_from(offset) else {
        return 0;
    };
    if start >= src.len() {
        return 0;
    }
    let n = buf.len().min(src.len() - start);
    buf[..n].copy_from_slice(&src[start..start + n]);
    n
}

impl ReadAt for Vec<u8> {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> SeekpullResult<usize> {
        Ok(copy_at(self, buf, offset))
    }
}

impl ReadAt for Bytes {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> SeekpullResult<usize> {
        Ok(copy_at(self, buf, offset))
    }
}
