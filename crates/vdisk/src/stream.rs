//! Cursor-based streams.
//!
//! A [`Stream`] is the unit that disks expose as their content and that image builders hand out
//! as lazily-produced file contents. Streams are single-cursor and unsynchronized; sharing one
//! between several owners goes through [`SharedStream`].

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{DiskError, Result, StorageBackend};

const COPY_CHUNK_BYTES: usize = 1024 * 1024; // 1 MiB

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeekOrigin {
    Start,
    Current,
    End,
}

pub trait Stream: Send {
    fn can_read(&self) -> bool;

    fn can_write(&self) -> bool;

    fn can_seek(&self) -> bool;

    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn position(&self) -> u64;

    /// Moves the cursor directly.
    ///
    /// Implementations may be stricter here than in [`Stream::seek`].
    fn set_position(&mut self, position: u64) -> Result<()>;

    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<u64>;

    /// Reads up to `buf.len()` bytes at the cursor, returning 0 at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes all of `buf` at the cursor or nothing at all.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    fn set_len(&mut self, len: u64) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

/// A stream with more than one owner. The parent keeps a single cursor, so users must
/// reposition it under the lock before every transfer.
pub type SharedStream = Arc<Mutex<dyn Stream>>;

pub fn shared<S: Stream + 'static>(stream: S) -> SharedStream {
    Arc::new(Mutex::new(stream))
}

pub fn shared_boxed(stream: Box<dyn Stream>) -> SharedStream {
    Arc::new(Mutex::new(BoxedStream(stream)))
}

/// Locks a shared stream.
///
/// A poisoned lock only means another user panicked mid-transfer; the cursor is always
/// repositioned before use, so the stream itself remains usable.
pub fn lock(stream: &SharedStream) -> MutexGuard<'_, dyn Stream + 'static> {
    stream
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolves a seek request against `base`, rejecting targets before the start of the stream.
pub(crate) fn resolve_seek(offset: i64, base: u64) -> Result<u64> {
    let target = i128::from(base) + i128::from(offset);
    if target < 0 {
        return Err(DiskError::OutOfRange("attempt to move before start of stream"));
    }
    u64::try_from(target).map_err(|_| DiskError::OffsetOverflow)
}

pub(crate) fn seek_base(origin: SeekOrigin, position: u64, len: u64) -> u64 {
    match origin {
        SeekOrigin::Start => 0,
        SeekOrigin::Current => position,
        SeekOrigin::End => len,
    }
}

struct BoxedStream(Box<dyn Stream>);

impl Stream for BoxedStream {
    fn can_read(&self) -> bool {
        self.0.can_read()
    }

    fn can_write(&self) -> bool {
        self.0.can_write()
    }

    fn can_seek(&self) -> bool {
        self.0.can_seek()
    }

    fn len(&self) -> Result<u64> {
        self.0.len()
    }

    fn position(&self) -> u64 {
        self.0.position()
    }

    fn set_position(&mut self, position: u64) -> Result<()> {
        self.0.set_position(position)
    }

    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<u64> {
        self.0.seek(offset, origin)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.0.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.0.write(buf)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.0.set_len(len)
    }

    fn flush(&mut self) -> Result<()> {
        self.0.flush()
    }
}

/// Cursor over a positional [`StorageBackend`].
///
/// Seeking past the end is allowed; reads there return 0 and writes extend the backend.
pub struct BackendStream<B> {
    backend: B,
    position: u64,
    read_only: bool,
}

impl<B: StorageBackend> BackendStream<B> {
    pub fn new(backend: B) -> Self {
        let read_only = backend.is_read_only();
        Self {
            backend,
            position: 0,
            read_only,
        }
    }

    pub fn read_only(backend: B) -> Self {
        Self {
            backend,
            position: 0,
            read_only: true,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(DiskError::NotSupported("stream is read-only".into()));
        }
        Ok(())
    }
}

impl<B: StorageBackend> Stream for BackendStream<B> {
    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        !self.read_only
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn len(&self) -> Result<u64> {
        self.backend.len()
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> Result<()> {
        self.position = position;
        Ok(())
    }

    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<u64> {
        let base = seek_base(origin, self.position, self.backend.len()?);
        self.position = resolve_seek(offset, base)?;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = self.backend.len()?;
        if self.position >= len || buf.is_empty() {
            return Ok(0);
        }
        let n = (len - self.position).min(buf.len() as u64) as usize;
        self.backend.read_at(self.position, &mut buf[..n])?;
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let end = self
            .position
            .checked_add(buf.len() as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        self.backend.write_at(self.position, buf)?;
        self.position = end;
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.ensure_writable()?;
        self.backend.set_len(len)
    }

    fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }
}

/// Fills `buf` completely or fails.
pub fn read_exact(stream: &mut dyn Stream, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(DiskError::Io(format!(
                "unexpected end of stream after {filled} of {} bytes",
                buf.len()
            )));
        }
        filled += n;
    }
    Ok(())
}

/// Reads `buf.len()` bytes at `offset` without disturbing the shared cursor.
pub fn read_fully_at(stream: &SharedStream, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut guard = lock(stream);
    let saved = i64::try_from(guard.position()).map_err(|_| DiskError::OffsetOverflow)?;
    let result = guard
        .set_position(offset)
        .and_then(|()| read_exact(&mut *guard, buf));
    let restored = guard.seek(saved, SeekOrigin::Start).map(|_| ());
    result.and(restored)
}

/// Writes `buf` at `offset` without disturbing the shared cursor.
pub fn write_fully_at(stream: &SharedStream, offset: u64, buf: &[u8]) -> Result<()> {
    let mut guard = lock(stream);
    let saved = i64::try_from(guard.position()).map_err(|_| DiskError::OffsetOverflow)?;
    let result = guard.set_position(offset).and_then(|()| guard.write(buf));
    let restored = guard.seek(saved, SeekOrigin::Start).map(|_| ());
    result.and(restored)
}

/// Reads the rest of the stream, refusing to buffer more than `limit` bytes.
pub fn read_to_end(stream: &mut dyn Stream, limit: u64) -> Result<Vec<u8>> {
    let remaining = stream.len()?.saturating_sub(stream.position());
    if remaining > limit {
        return Err(DiskError::InvalidArgument(format!(
            "stream holds {remaining} bytes, more than the {limit} byte limit"
        )));
    }
    let mut out = vec![0u8; remaining as usize];
    read_exact(stream, &mut out)?;
    Ok(out)
}

/// Drains the stream from its cursor into `writer`, returning the number of bytes copied.
pub fn copy_to_writer(stream: &mut dyn Stream, writer: &mut dyn io::Write) -> Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK_BYTES];
    let mut total = 0u64;
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}

/// `std::io::Read` adapter so streams can feed anything in the std I/O ecosystem.
pub struct StreamReader<'a> {
    stream: &'a mut dyn Stream,
}

impl<'a> StreamReader<'a> {
    pub fn new(stream: &'a mut dyn Stream) -> Self {
        Self { stream }
    }
}

impl io::Read for StreamReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).map_err(io::Error::other)
    }
}
