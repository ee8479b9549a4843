use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::util::checked_range;
use crate::{DiskError, Result};

/// Positional byte storage underneath a [`crate::BackendStream`].
///
/// Backends have no cursor. Reads past the current length fail with
/// [`DiskError::OutOfBounds`]; writes past the end grow the backend.
pub trait StorageBackend: Send {
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn set_len(&mut self, len: u64) -> Result<()>;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        false
    }
}

/// In-memory backend, mostly used for descriptor buffers and tests.
#[derive(Debug, Default, Clone)]
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: u64) -> Result<Self> {
        let len = usize::try_from(len).map_err(|_| DiskError::OffsetOverflow)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| DiskError::Io(format!("unable to allocate {len} bytes")))?;
        data.resize(len, 0);
        Ok(Self { data })
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl StorageBackend for MemBackend {
    fn len(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len = usize::try_from(len).map_err(|_| DiskError::OffsetOverflow)?;
        self.data.resize(len, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        let end = usize::try_from(end).map_err(|_| DiskError::OffsetOverflow)?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        let start = offset as usize;
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }
}

/// Backend over a host file.
///
/// Uses positional I/O where the platform offers it, so the file cursor is never disturbed.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
    path: Option<PathBuf>,
    read_only: bool,
}

impl FileBackend {
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| open_error(path, e))?;
        Ok(Self {
            file,
            path: Some(path.to_path_buf()),
            read_only: true,
        })
    }

    pub fn open_read_write(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| open_error(path, e))?;
        Ok(Self {
            file,
            path: Some(path.to_path_buf()),
            read_only: false,
        })
    }

    pub fn from_file(file: File) -> Self {
        Self {
            file,
            path: None,
            read_only: false,
        }
    }

    pub fn from_file_with_path(file: File, path: impl AsRef<Path>) -> Self {
        Self {
            file,
            path: Some(path.as_ref().to_path_buf()),
            read_only: false,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn into_file(self) -> File {
        self.file
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(DiskError::NotSupported("backend is read-only".into()));
        }
        Ok(())
    }
}

fn open_error(path: &Path, err: std::io::Error) -> DiskError {
    if err.kind() == std::io::ErrorKind::NotFound {
        DiskError::ResourceNotFound(path.display().to_string())
    } else {
        DiskError::Io(format!("{}: {err}", path.display()))
    }
}

impl StorageBackend for FileBackend {
    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.ensure_writable()?;
        self.file.set_len(len)?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let capacity = self.len()?;
        checked_range(offset, buf.len(), capacity)?;
        read_exact_at(&self.file, offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        offset
            .checked_add(buf.len() as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        write_all_at(&self.file, offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.sync_data()?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)?;
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, offset: u64, buf: &[u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)?;
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(DiskError::Io("unexpected end of file".into()));
        }
        buf = &mut std::mem::take(&mut buf)[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut offset: u64, mut buf: &[u8]) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(DiskError::Io("failed to write whole buffer".into()));
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}
