use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::descriptor::{DescriptorFile, ExtentType};
use super::sparse::VmfsSparseStream;
use crate::util::sectors_to_bytes;
use crate::{
    read_to_end, shared, BackendStream, CompositeStream, DiskError, DiskImageFileSpecification,
    FileBackend, Geometry, LayerKind, Region, Result, SharedStream, Stream, SubStream,
    VirtualDisk, VirtualDiskLayer,
};

const MAX_DESCRIPTOR_BYTES: u64 = 1024 * 1024;
const MAX_PARENT_DEPTH: usize = 16;

/// Resolves the file names a descriptor refers to.
pub trait FileLocator: Send + Sync {
    /// Opens `name` for reading.
    fn open(&self, name: &str) -> Result<Box<dyn Stream>>;
}

/// Files in a host directory.
#[derive(Clone, Debug)]
pub struct DirLocator {
    dir: PathBuf,
}

impl DirLocator {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl FileLocator for DirLocator {
    fn open(&self, name: &str) -> Result<Box<dyn Stream>> {
        let backend = FileBackend::open_read_only(self.dir.join(name))?;
        Ok(Box::new(BackendStream::new(backend)))
    }
}

/// Files held in memory, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct MemLocator {
    files: BTreeMap<String, Arc<[u8]>>,
}

impl MemLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        self.files.insert(name.into(), bytes.into());
    }

    /// Materializes every specification of a build.
    pub fn from_specs(specs: &[DiskImageFileSpecification]) -> Result<Self> {
        let mut locator = Self::new();
        for spec in specs {
            let mut bytes = Vec::new();
            spec.write_to(&mut bytes)?;
            locator.insert(spec.name(), bytes);
        }
        Ok(locator)
    }
}

impl FileLocator for MemLocator {
    fn open(&self, name: &str) -> Result<Box<dyn Stream>> {
        let bytes = self
            .files
            .get(name)
            .ok_or_else(|| DiskError::ResourceNotFound(name.to_owned()))?;
        Ok(Box::new(CompositeStream::from_regions([Region::Bytes(
            Arc::clone(bytes),
        )])?))
    }
}

struct VmdkLayer {
    kind: LayerKind,
    capacity: u64,
    name: String,
}

impl VirtualDiskLayer for VmdkLayer {
    fn kind(&self) -> LayerKind {
        self.kind
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// A VMDK image opened for reading.
///
/// The content is composed from the descriptor's extents. VMFSSPARSE extents fall through to
/// the parent disk named by `parentFileNameHint`, which is opened through the same locator.
pub struct VmdkDisk {
    descriptor: DescriptorFile,
    content: SharedStream,
    geometry: Geometry,
    layer: VmdkLayer,
    parent: Option<Box<VmdkDisk>>,
}

impl VmdkDisk {
    pub fn open(locator: &dyn FileLocator, descriptor_name: &str) -> Result<Self> {
        Self::open_at_depth(locator, descriptor_name, 0)
    }

    fn open_at_depth(locator: &dyn FileLocator, name: &str, depth: usize) -> Result<Self> {
        if depth >= MAX_PARENT_DEPTH {
            return Err(DiskError::InvalidDescriptor(format!(
                "parent chain longer than {MAX_PARENT_DEPTH} descriptors at {name:?}"
            )));
        }

        let mut file = locator.open(name)?;
        let descriptor = DescriptorFile::from_bytes(&read_to_end(
            file.as_mut(),
            MAX_DESCRIPTOR_BYTES,
        )?)?;
        drop(file);

        let parent = match descriptor.parent_file_name_hint() {
            Some(hint) => {
                let parent = Self::open_at_depth(locator, hint, depth + 1)?;
                // Derived ids hash descriptor text only, so this misses swapped data.
                if parent.descriptor.content_id() != descriptor.parent_content_id() {
                    tracing::warn!(
                        child = name,
                        parent = hint,
                        "parent content id does not match; parent may have changed"
                    );
                }
                Some(Box::new(parent))
            }
            None => None,
        };

        let parent_content = parent.as_ref().map(|p| p.content());
        let (content, capacity) = compose_extents(locator, &descriptor, parent_content)?;
        let geometry = descriptor
            .geometry()
            .unwrap_or_else(|| Geometry::from_capacity(capacity));

        tracing::debug!(
            name,
            create_type = %descriptor.create_type(),
            extents = descriptor.extents().len(),
            has_parent = parent.is_some(),
            "opened vmdk"
        );
        Ok(Self {
            layer: VmdkLayer {
                kind: if parent.is_some() {
                    LayerKind::Differencing
                } else {
                    LayerKind::Base
                },
                capacity,
                name: name.to_owned(),
            },
            descriptor,
            content: shared(content),
            geometry,
            parent,
        })
    }

    pub fn descriptor(&self) -> &DescriptorFile {
        &self.descriptor
    }

    pub fn parent(&self) -> Option<&VmdkDisk> {
        self.parent.as_deref()
    }
}

fn compose_extents(
    locator: &dyn FileLocator,
    descriptor: &DescriptorFile,
    parent: Option<SharedStream>,
) -> Result<(CompositeStream, u64)> {
    let mut content = CompositeStream::new();
    let mut logical = 0u64;

    for extent in descriptor.extents() {
        let bytes = sectors_to_bytes(extent.size_in_sectors())?;
        let file_name = || {
            extent.file_name().ok_or_else(|| {
                DiskError::InvalidDescriptor(format!(
                    "{} extent without a file name",
                    extent.extent_type().as_str()
                ))
            })
        };

        let region = match extent.extent_type() {
            ExtentType::Flat | ExtentType::Vmfs => {
                let file = locator.open(file_name()?)?;
                let first = sectors_to_bytes(extent.offset())?;
                Region::Stream(Box::new(SubStream::owning(file, first, bytes)?))
            }
            ExtentType::Zero => Region::Zero(bytes),
            ExtentType::VmfsSparse => {
                let file = locator.open(file_name()?)?;
                let fallthrough = parent
                    .as_ref()
                    .map(|p| SubStream::new(Arc::clone(p), logical, bytes).map(shared))
                    .transpose()?;
                let sparse = VmfsSparseStream::open(file, fallthrough)?;
                if sparse.header().capacity_bytes() != bytes {
                    return Err(DiskError::CorruptImage(
                        "sparse extent capacity does not match descriptor",
                    ));
                }
                Region::Stream(Box::new(sparse))
            }
            ExtentType::Sparse => {
                return Err(DiskError::NotImplemented("reading hosted SPARSE extents"));
            }
            other @ (ExtentType::VmfsRdm | ExtentType::VmfsRaw) => {
                return Err(DiskError::NotSupported(format!(
                    "reading {} extents",
                    other.as_str()
                )));
            }
        };

        content.push(region)?;
        logical = logical
            .checked_add(bytes)
            .ok_or(DiskError::OffsetOverflow)?;
    }

    Ok((content, logical))
}

impl VirtualDisk for VmdkDisk {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn content(&self) -> SharedStream {
        self.content.clone()
    }

    fn layers(&self) -> Vec<&dyn VirtualDiskLayer> {
        let mut layers: Vec<&dyn VirtualDiskLayer> = vec![&self.layer];
        if let Some(parent) = &self.parent {
            layers.extend(parent.layers());
        }
        layers
    }

    fn capacity(&self) -> Result<u64> {
        Ok(self.layer.capacity)
    }
}
