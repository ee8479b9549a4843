use serde::Serialize;

use crate::{
    lock, shared, shared_boxed, BackendStream, BiosPartitionTable, Geometry, MemBackend,
    PartitionTable, Result, SharedStream, Stream,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    /// Holds a complete image.
    Base,
    /// Records changes relative to the next layer down.
    Differencing,
}

/// One constituent of a [`VirtualDisk`].
pub trait VirtualDiskLayer: Send {
    fn kind(&self) -> LayerKind;

    /// Logical size of the layer in bytes.
    fn capacity(&self) -> u64;

    /// Backing file name, when the layer has one.
    fn name(&self) -> Option<&str> {
        None
    }
}

/// A block device assembled from one or more layers.
///
/// Implementations supply the geometry, the composed content stream and the layer stack
/// (most-derived first). The partition view is never cached: every call to
/// [`VirtualDisk::partitions`] parses the content as it is at that moment.
pub trait VirtualDisk: Send {
    fn geometry(&self) -> Geometry;

    fn content(&self) -> SharedStream;

    fn layers(&self) -> Vec<&dyn VirtualDiskLayer>;

    fn capacity(&self) -> Result<u64> {
        let content = self.content();
        let len = lock(&content).len()?;
        Ok(len)
    }

    /// Builds a fresh partition-table view over the current content.
    fn partitions(&self) -> Result<Box<dyn PartitionTable>> {
        let table = BiosPartitionTable::open(self.content(), self.geometry())?;
        Ok(Box::new(table))
    }
}

/// Serializable summary of a layer, as reported by tools.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerInfo {
    pub kind: LayerKind,
    pub capacity: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

pub fn describe_layers(disk: &dyn VirtualDisk) -> Vec<LayerInfo> {
    disk.layers()
        .into_iter()
        .map(|layer| LayerInfo {
            kind: layer.kind(),
            capacity: layer.capacity(),
            name: layer.name().map(str::to_owned),
        })
        .collect()
}

struct RawLayer {
    capacity: u64,
    name: Option<String>,
}

impl VirtualDiskLayer for RawLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Base
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// A single-layer disk whose content is a plain stream.
pub struct RawDisk {
    content: SharedStream,
    geometry: Geometry,
    layer: RawLayer,
}

impl RawDisk {
    /// Wraps a stream the caller keeps a handle to; dropping the disk leaves it alive.
    pub fn new(content: SharedStream) -> Result<Self> {
        let capacity = lock(&content).len()?;
        Ok(Self {
            content,
            geometry: Geometry::from_capacity(capacity),
            layer: RawLayer {
                capacity,
                name: None,
            },
        })
    }

    /// Takes ownership of `content`; it is released with the disk.
    pub fn from_stream(content: Box<dyn Stream>) -> Result<Self> {
        Self::new(shared_boxed(content))
    }

    /// A zero-filled in-memory disk of `capacity` bytes.
    pub fn in_memory(capacity: u64) -> Result<Self> {
        Self::new(shared(BackendStream::new(MemBackend::with_len(capacity)?)))
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.layer.name = Some(name.into());
        self
    }
}

impl VirtualDisk for RawDisk {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn content(&self) -> SharedStream {
        self.content.clone()
    }

    fn layers(&self) -> Vec<&dyn VirtualDiskLayer> {
        vec![&self.layer]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{partition_type, write_fully_at, DiskError, SECTOR_SIZE};

    #[test]
    fn raw_disk_derives_geometry_and_a_single_base_layer() {
        let disk = RawDisk::in_memory(1024 * 1024).unwrap().with_name("disk.img");
        assert_eq!(disk.geometry(), Geometry::new(1, 64, 32));
        assert_eq!(disk.capacity().unwrap(), 1024 * 1024);
        assert_eq!(
            describe_layers(&disk),
            vec![LayerInfo {
                kind: LayerKind::Base,
                capacity: 1024 * 1024,
                name: Some("disk.img".into()),
            }]
        );
    }

    #[test]
    fn partitions_reflect_content_at_call_time() {
        let disk = RawDisk::in_memory(2048 * SECTOR_SIZE as u64).unwrap();
        assert!(matches!(
            disk.partitions().err(),
            Some(DiskError::CorruptImage(_))
        ));

        let mut table =
            BiosPartitionTable::initialize(disk.content(), disk.geometry(), 0xfeed).unwrap();
        assert!(disk.partitions().unwrap().partitions().is_empty());

        table.create(2048 - 100, 100, partition_type::LINUX, false).unwrap();
        assert_eq!(disk.partitions().unwrap().partitions().len(), 1);

        // Wipe the entry behind the table's back; the next view must see it gone.
        write_fully_at(&disk.content(), 446, &[0u8; 16]).unwrap();
        assert!(disk.partitions().unwrap().partitions().is_empty());
    }

    #[test]
    fn dropping_a_borrowing_disk_keeps_the_stream() {
        let content = shared(BackendStream::new(MemBackend::with_len(4096).unwrap()));
        let disk = RawDisk::new(Arc::clone(&content)).unwrap();
        assert_eq!(Arc::strong_count(&content), 2);
        drop(disk);
        assert_eq!(Arc::strong_count(&content), 1);
    }
}
