use std::sync::Arc;

use crate::stream::{read_exact, resolve_seek, seek_base};
use crate::{DiskError, Result, SeekOrigin, Stream};

/// One contiguous piece of a [`CompositeStream`].
pub enum Region {
    /// Literal bytes (headers, tables, descriptor text).
    Bytes(Arc<[u8]>),
    /// A run of zeros that is never stored.
    Zero(u64),
    /// Another stream, read from its start. Usually a [`crate::SubStream`] window.
    Stream(Box<dyn Stream>),
}

impl Region {
    fn len(&self) -> Result<u64> {
        match self {
            Region::Bytes(bytes) => Ok(bytes.len() as u64),
            Region::Zero(len) => Ok(*len),
            Region::Stream(stream) => stream.len(),
        }
    }
}

struct Entry {
    start: u64,
    len: u64,
    region: Region,
}

impl Entry {
    fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// A fixed-length stream stitched together from ordered regions.
///
/// Reads never copy more than the caller asked for, so a composite over a multi-gigabyte
/// content stream stays cheap. Writes are only accepted when the composite was made writable,
/// and only when every byte lands in a [`Region::Stream`].
pub struct CompositeStream {
    entries: Vec<Entry>,
    length: u64,
    position: u64,
    writable: bool,
}

impl Default for CompositeStream {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositeStream {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            length: 0,
            position: 0,
            writable: false,
        }
    }

    pub fn from_regions(regions: impl IntoIterator<Item = Region>) -> Result<Self> {
        let mut stream = Self::new();
        for region in regions {
            stream.push(region)?;
        }
        Ok(stream)
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Appends `region` at the current end of the stream.
    pub fn push(&mut self, region: Region) -> Result<()> {
        let len = region.len()?;
        if len == 0 {
            return Ok(());
        }
        let end = self
            .length
            .checked_add(len)
            .ok_or(DiskError::OffsetOverflow)?;
        self.entries.push(Entry {
            start: self.length,
            len,
            region,
        });
        self.length = end;
        Ok(())
    }

    pub fn region_count(&self) -> usize {
        self.entries.len()
    }

    fn entry_index(&self, offset: u64) -> usize {
        self.entries.partition_point(|e| e.end() <= offset)
    }
}

impl Stream for CompositeStream {
    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        self.writable
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn len(&self) -> Result<u64> {
        Ok(self.length)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> Result<()> {
        self.position = position;
        Ok(())
    }

    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<u64> {
        let base = seek_base(origin, self.position, self.length);
        self.position = resolve_seek(offset, base)?;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let available = self.length.saturating_sub(self.position);
        let count = available.min(buf.len() as u64) as usize;

        let mut done = 0usize;
        let mut idx = self.entry_index(self.position);
        while done < count {
            let abs = self.position + done as u64;
            let entry = &mut self.entries[idx];
            let within = abs - entry.start;
            let chunk = ((entry.len - within) as usize).min(count - done);
            let dst = &mut buf[done..done + chunk];

            match &mut entry.region {
                Region::Bytes(bytes) => {
                    let start = within as usize;
                    dst.copy_from_slice(&bytes[start..start + chunk]);
                }
                Region::Zero(_) => dst.fill(0),
                Region::Stream(stream) => {
                    stream.set_position(within)?;
                    read_exact(stream.as_mut(), dst)?;
                }
            }

            done += chunk;
            idx += 1;
        }

        self.position += count as u64;
        Ok(count)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(DiskError::NotSupported("composite stream is read-only".into()));
        }
        let end = self
            .position
            .checked_add(buf.len() as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        if end > self.length {
            return Err(DiskError::OutOfRange("attempt to write beyond end of stream"));
        }
        if buf.is_empty() {
            return Ok(());
        }

        let first = self.entry_index(self.position);
        let last = self.entry_index(end - 1);
        let all_backed = self.entries[first..=last]
            .iter()
            .all(|e| matches!(&e.region, Region::Stream(s) if s.can_write()));
        if !all_backed {
            return Err(DiskError::NotSupported(
                "write touches a region without backing storage".into(),
            ));
        }

        let mut done = 0usize;
        for entry in &mut self.entries[first..=last] {
            let abs = self.position + done as u64;
            let within = abs - entry.start;
            let chunk = ((entry.len - within) as usize).min(buf.len() - done);
            if let Region::Stream(stream) = &mut entry.region {
                stream.set_position(within)?;
                stream.write(&buf[done..done + chunk])?;
            }
            done += chunk;
        }

        self.position = end;
        Ok(())
    }

    fn set_len(&mut self, _len: u64) -> Result<()> {
        Err(DiskError::NotSupported(
            "attempt to change length of a composite stream".into(),
        ))
    }

    fn flush(&mut self) -> Result<()> {
        for entry in &mut self.entries {
            if let Region::Stream(stream) = &mut entry.region {
                stream.flush()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_to_end, BackendStream, MemBackend};

    fn sample() -> CompositeStream {
        CompositeStream::from_regions([
            Region::Bytes(Arc::from(&b"head"[..])),
            Region::Zero(3),
            Region::Stream(Box::new(BackendStream::new(MemBackend::from_vec(
                b"tail".to_vec(),
            )))),
        ])
        .unwrap()
    }

    #[test]
    fn reads_span_region_boundaries() {
        let mut stream = sample();
        assert_eq!(stream.len().unwrap(), 11);
        assert_eq!(read_to_end(&mut stream, 64).unwrap(), b"head\0\0\0tail");

        stream.set_position(2).unwrap();
        let mut buf = [0xffu8; 7];
        assert_eq!(stream.read(&mut buf).unwrap(), 7);
        assert_eq!(&buf, b"ad\0\0\0ta");
    }

    #[test]
    fn empty_regions_are_skipped() {
        let stream =
            CompositeStream::from_regions([Region::Zero(0), Region::Bytes(Arc::from(&b"x"[..]))])
                .unwrap();
        assert_eq!(stream.region_count(), 1);
    }

    #[test]
    fn writes_require_a_writable_stream_region() {
        let mut stream = sample();
        assert!(matches!(
            stream.write(b"x").unwrap_err(),
            DiskError::NotSupported(_)
        ));

        let mut stream = sample().writable(true);
        stream.set_position(3).unwrap();
        assert!(matches!(
            stream.write(b"xx").unwrap_err(),
            DiskError::NotSupported(_)
        ));

        stream.set_position(8).unwrap();
        stream.write(b"AI").unwrap();
        stream.set_position(0).unwrap();
        assert_eq!(read_to_end(&mut stream, 64).unwrap(), b"head\0\0\0tAIl");

        stream.set_position(10).unwrap();
        assert!(matches!(
            stream.write(b"zz").unwrap_err(),
            DiskError::OutOfRange(_)
        ));
    }
}
