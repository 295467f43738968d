//! Random-access scratch file holding the partially assembled target

use crate::error::{Error, Result};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Block-addressed byte store backed by a temporary file.
///
/// Created with a random-suffixed name in a caller-supplied directory,
/// renamed to `<target>.part` once seeding starts, and finally promoted
/// to the target name by the session. Writes past EOF are allowed; the
/// final `truncate` pins the exact length.
#[derive(Debug)]
pub struct ScratchStore {
    file: File,
    path: PathBuf,
}

impl ScratchStore {
    /// Create a fresh scratch file inside `dir`.
    pub async fn create_in(dir: &Path) -> Result<Self> {
        let named = tempfile::Builder::new()
            .prefix("rangesync-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| Error::scratch("creating scratch file", e))?;
        let (std_file, temp_path) = named.into_parts();
        let path = temp_path
            .keep()
            .map_err(|e| Error::scratch("keeping scratch file", e.error))?;

        tracing::debug!(path = %path.display(), "created scratch file");
        Ok(Self {
            file: File::from_std(std_file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `data` at the absolute byte `offset`.
    pub async fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::scratch("seeking scratch file", e))?;
        self.file
            .write_all(data)
            .await
            .map_err(|e| Error::scratch("writing scratch file", e))?;
        Ok(())
    }

    /// Read exactly `len` bytes at the absolute byte `offset`.
    pub async fn read_bytes(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::scratch("seeking scratch file", e))?;
        let mut buf = vec![0u8; len];
        self.file
            .read_exact(&mut buf)
            .await
            .map_err(|e| Error::scratch("reading scratch file", e))?;
        Ok(buf)
    }

    /// Move the scratch file to `new_path`, keeping the open handle.
    pub async fn rename(&mut self, new_path: &Path) -> Result<()> {
        tokio::fs::rename(&self.path, new_path)
            .await
            .map_err(|e| Error::scratch("renaming scratch file", e))?;
        self.path = new_path.to_path_buf();
        Ok(())
    }

    /// Pin the file to exactly `len` bytes.
    pub async fn truncate(&mut self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .await
            .map_err(|e| Error::scratch("truncating scratch file", e))?;
        Ok(())
    }

    /// Flush file contents to stable storage.
    pub async fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .await
            .map_err(|e| Error::scratch("syncing scratch file", e))
    }

    /// Close the handle and hand the on-disk file over to the caller.
    pub fn detach(self) -> PathBuf {
        self.path
    }

    /// Close and remove the scratch file.
    pub async fn release(self) -> Result<()> {
        drop(self.file);
        tokio::fs::remove_file(&self.path)
            .await
            .map_err(|e| Error::scratch("removing scratch file", e))
    }
}
