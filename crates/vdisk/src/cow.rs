use std::collections::BTreeMap;

use crate::stream::{resolve_seek, seek_base};
use crate::util::checked_range;
use crate::{
    read_fully_at, shared, DiskError, Geometry, LayerKind, MemBackend, Result, SeekOrigin,
    SharedStream, StorageBackend, Stream, VirtualDisk, VirtualDiskLayer, SECTOR_SIZE,
};

/// Copy-on-write disk: a writable block overlay on top of a parent disk.
///
/// Reads consult the overlay first; if the relevant overlay block is unallocated the data is
/// read from the parent. Writes always go to the overlay, so the parent's content is never
/// modified.
///
/// The block map lives in memory. The overlay backend only holds block payloads and is
/// truncated when the disk is created.
pub struct DifferencingDisk {
    parent: Box<dyn VirtualDisk>,
    content: SharedStream,
    layer: OverlayLayer,
}

struct OverlayLayer {
    capacity: u64,
    name: Option<String>,
}

impl VirtualDiskLayer for OverlayLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Differencing
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl DifferencingDisk {
    pub fn new(
        parent: Box<dyn VirtualDisk>,
        mut overlay: Box<dyn StorageBackend>,
        block_size_bytes: u32,
    ) -> Result<Self> {
        if block_size_bytes == 0 || block_size_bytes as usize % SECTOR_SIZE != 0 {
            return Err(DiskError::InvalidArgument(format!(
                "overlay block size {block_size_bytes} must be a non-zero multiple of {SECTOR_SIZE}"
            )));
        }
        if overlay.is_read_only() {
            return Err(DiskError::NotSupported("overlay backend is read-only".into()));
        }
        overlay.set_len(0)?;

        let capacity = parent.capacity()?;
        let content = shared(CowStream {
            parent: parent.content(),
            overlay,
            block_size: u64::from(block_size_bytes),
            capacity,
            blocks: BTreeMap::new(),
            next_free: 0,
            position: 0,
        });
        Ok(Self {
            parent,
            content,
            layer: OverlayLayer {
                capacity,
                name: None,
            },
        })
    }

    pub fn in_memory(parent: Box<dyn VirtualDisk>, block_size_bytes: u32) -> Result<Self> {
        Self::new(parent, Box::new(MemBackend::new()), block_size_bytes)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.layer.name = Some(name.into());
        self
    }

    pub fn parent(&self) -> &dyn VirtualDisk {
        self.parent.as_ref()
    }

    pub fn into_parent(self) -> Box<dyn VirtualDisk> {
        self.parent
    }
}

impl VirtualDisk for DifferencingDisk {
    fn geometry(&self) -> Geometry {
        self.parent.geometry()
    }

    fn content(&self) -> SharedStream {
        self.content.clone()
    }

    fn layers(&self) -> Vec<&dyn VirtualDiskLayer> {
        let mut layers: Vec<&dyn VirtualDiskLayer> = vec![&self.layer];
        layers.extend(self.parent.layers());
        layers
    }

    fn capacity(&self) -> Result<u64> {
        Ok(self.layer.capacity)
    }
}

struct CowStream {
    parent: SharedStream,
    overlay: Box<dyn StorageBackend>,
    block_size: u64,
    capacity: u64,
    /// Block index -> byte offset of its payload in the overlay backend.
    blocks: BTreeMap<u64, u64>,
    next_free: u64,
    position: u64,
}

impl CowStream {
    /// Length of block `block_idx`; the final block may be short.
    fn block_len(&self, block_idx: u64) -> u64 {
        let start = block_idx * self.block_size;
        (self.capacity - start).min(self.block_size)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let block_idx = abs / self.block_size;
            let within = abs % self.block_size;
            let chunk_len = ((self.block_size - within) as usize).min(buf.len() - pos);
            let chunk = &mut buf[pos..pos + chunk_len];

            match self.blocks.get(&block_idx) {
                Some(&phys) => self.overlay.read_at(phys + within, chunk)?,
                None => read_fully_at(&self.parent, abs, chunk)?,
            }

            pos += chunk_len;
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let block_idx = abs / self.block_size;
            let within = abs % self.block_size;
            let chunk_len = ((self.block_size - within) as usize).min(buf.len() - pos);
            let chunk = &buf[pos..pos + chunk_len];

            if let Some(&phys) = self.blocks.get(&block_idx) {
                self.overlay.write_at(phys + within, chunk)?;
                pos += chunk_len;
                continue;
            }

            let block_len = self.block_len(block_idx);
            let phys = self.next_free;
            let next_free = phys
                .checked_add(self.block_size)
                .ok_or(DiskError::OffsetOverflow)?;
            let mut block = vec![0u8; self.block_size as usize];

            // A partial write must preserve the parent's bytes around it.
            let full_block_write = within == 0 && chunk_len as u64 == block_len;
            if !full_block_write {
                let block_start = block_idx * self.block_size;
                read_fully_at(&self.parent, block_start, &mut block[..block_len as usize])?;
            }

            let within = within as usize;
            block[within..within + chunk_len].copy_from_slice(chunk);
            self.overlay.write_at(phys, &block)?;

            // Only a fully written block may shadow the parent.
            self.blocks.insert(block_idx, phys);
            self.next_free = next_free;
            pos += chunk_len;
        }
        Ok(())
    }
}

impl Stream for CowStream {
    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        true
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn len(&self) -> Result<u64> {
        Ok(self.capacity)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> Result<()> {
        self.position = position;
        Ok(())
    }

    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<u64> {
        let base = seek_base(origin, self.position, self.capacity);
        self.position = resolve_seek(offset, base)?;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let available = self.capacity.saturating_sub(self.position);
        let count = available.min(buf.len() as u64) as usize;
        if count == 0 {
            return Ok(0);
        }
        self.read_at(self.position, &mut buf[..count])?;
        self.position += count as u64;
        Ok(count)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        checked_range(self.position, buf.len(), self.capacity)?;
        self.write_at(self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn set_len(&mut self, _len: u64) -> Result<()> {
        Err(DiskError::NotSupported(
            "attempt to resize a differencing disk".into(),
        ))
    }

    fn flush(&mut self) -> Result<()> {
        // The parent is never written through this stream.
        self.overlay.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lock, write_fully_at, RawDisk};

    fn patterned_parent(len: usize) -> (SharedStream, RawDisk) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let content = shared(crate::BackendStream::new(MemBackend::from_vec(data)));
        let disk = RawDisk::new(content.clone()).unwrap().with_name("base.img");
        (content, disk)
    }

    #[test]
    fn rejects_bad_block_sizes() {
        let (_, parent) = patterned_parent(4096);
        assert!(matches!(
            DifferencingDisk::in_memory(Box::new(parent), 1000).err(),
            Some(DiskError::InvalidArgument(_))
        ));
    }

    #[test]
    fn writes_land_in_overlay_and_preserve_surrounding_parent_bytes() {
        let (parent_content, parent) = patterned_parent(8192);
        let disk = DifferencingDisk::in_memory(Box::new(parent), 1024).unwrap();
        let content = disk.content();

        write_fully_at(&content, 1000, &[0xee; 100]).unwrap();

        let mut buf = vec![0u8; 2048];
        read_fully_at(&content, 0, &mut buf).unwrap();
        for (i, &b) in buf.iter().enumerate() {
            let expected = if (1000..1100).contains(&i) {
                0xee
            } else {
                (i % 251) as u8
            };
            assert_eq!(b, expected, "byte {i}");
        }

        let mut untouched = [0u8; 4];
        read_fully_at(&parent_content, 1000, &mut untouched).unwrap();
        assert_eq!(untouched, [1000 % 251, 1001 % 251, 1002 % 251, 1003 % 251].map(|v| v as u8));
    }

    #[test]
    fn short_final_block_is_handled() {
        let (_, parent) = patterned_parent(1536);
        let disk = DifferencingDisk::in_memory(Box::new(parent), 1024).unwrap();
        let content = disk.content();

        write_fully_at(&content, 1024, &[7u8; 512]).unwrap();
        let mut buf = [0u8; 512];
        read_fully_at(&content, 1024, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 512]);

        let err = write_fully_at(&content, 1500, &[1u8; 64]).unwrap_err();
        assert!(matches!(err, DiskError::OutOfBounds { .. }));
        assert_eq!(lock(&content).len().unwrap(), 1536);
    }

    #[test]
    fn layers_are_most_derived_first() {
        let (_, parent) = patterned_parent(4096);
        let disk = DifferencingDisk::in_memory(Box::new(parent), 512)
            .unwrap()
            .with_name("child.img");
        let kinds: Vec<_> = disk
            .layers()
            .iter()
            .map(|l| (l.kind(), l.name().map(str::to_owned)))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (LayerKind::Differencing, Some("child.img".to_owned())),
                (LayerKind::Base, Some("base.img".to_owned())),
            ]
        );
        assert_eq!(disk.geometry(), disk.parent().geometry());
    }

    /// Parent that fails its next read once, then behaves.
    struct FlakyParent {
        inner: crate::BackendStream<MemBackend>,
        fail_next_read: bool,
    }

    impl Stream for FlakyParent {
        fn can_read(&self) -> bool {
            true
        }
        fn can_write(&self) -> bool {
            false
        }
        fn can_seek(&self) -> bool {
            true
        }
        fn len(&self) -> Result<u64> {
            self.inner.len()
        }
        fn position(&self) -> u64 {
            self.inner.position()
        }
        fn set_position(&mut self, position: u64) -> Result<()> {
            self.inner.set_position(position)
        }
        fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<u64> {
            self.inner.seek(offset, origin)
        }
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            if std::mem::take(&mut self.fail_next_read) {
                return Err(DiskError::Io("transient".into()));
            }
            self.inner.read(buf)
        }
        fn write(&mut self, _buf: &[u8]) -> Result<()> {
            Err(DiskError::NotSupported("read-only parent".into()))
        }
        fn set_len(&mut self, _len: u64) -> Result<()> {
            Err(DiskError::NotSupported("read-only parent".into()))
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_seed_read_leaves_block_reading_through_to_parent() {
        let parent_content = shared(FlakyParent {
            inner: crate::BackendStream::new(MemBackend::from_vec(vec![0x5a; 2048])),
            fail_next_read: true,
        });
        let parent = RawDisk::new(parent_content).unwrap();
        let disk = DifferencingDisk::in_memory(Box::new(parent), 1024).unwrap();
        let content = disk.content();

        let err = write_fully_at(&content, 10, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, DiskError::Io(_)));

        let mut buf = [0u8; 8];
        read_fully_at(&content, 0, &mut buf).unwrap();
        assert_eq!(buf, [0x5a; 8]);

        // The retried write seeds correctly and only changes the written bytes.
        write_fully_at(&content, 10, &[1, 2, 3]).unwrap();
        let mut block = vec![0u8; 1024];
        read_fully_at(&content, 0, &mut block).unwrap();
        assert_eq!(&block[10..13], &[1, 2, 3]);
        assert!(block[..10].iter().chain(&block[13..]).all(|&b| b == 0x5a));
    }
}
