use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use seekpull_core::{ReadAt, SeekpullError, SeekpullResult};

/// A compressed layer on local disk.
///
/// Positional reads run on the blocking pool, so concurrent span reads do
/// not share a file cursor.
#[derive(Debug, Clone)]
pub struct LocalFile {
    file: Arc<File>,
    size: u64,
}

impl LocalFile {
    pub fn open(path: &Path) -> SeekpullResult<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(LocalFile {
            file: Arc::new(file),
            size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

impl ReadAt for LocalFile {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> SeekpullResult<usize> {
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min((self.size - offset) as usize);
        let file = self.file.clone();
        let data = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut data = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                match pread(&file, &mut data[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            data.truncate(filled);
            Ok(data)
        })
        .await
        .map_err(|e| SeekpullError::Io(std::io::Error::other(e)))??;

        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}
