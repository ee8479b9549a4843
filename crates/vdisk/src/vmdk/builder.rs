use std::sync::Arc;

use super::descriptor::{
    AdapterType, DescriptorFile, DiskCreateType, ExtentAccess, ExtentDescriptor, ExtentType,
};
use super::sparse::{SparseExtentEncoder, VmfsSparseEncoder};
use super::VMDK_EXTENSION;
use crate::builder::{
    DiskImageBuilder, DiskImageFileSpecification, GenericAdapterType, PassthroughStreamBuilder,
    StreamBuilder,
};
use crate::util::div_ceil_u64;
use crate::{lock, DiskError, Geometry, Result, SharedStream, SECTOR_SIZE};

/// Largest extent written for `twoGbMaxExtentFlat` images.
pub const DEFAULT_MAX_EXTENT_BYTES: u64 = 0x7fff_0000;

/// How the content ends up on disk. Every supported create type maps to exactly one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Encoding {
    /// Whole content in one raw extent of the given type.
    Flat(ExtentType),
    /// Raw extents of at most `max_extent_bytes` each.
    SplitFlat,
    Sparse,
}

impl Encoding {
    fn for_create_type(create_type: DiskCreateType) -> Result<Self> {
        match create_type {
            DiskCreateType::Vmfs => Ok(Encoding::Flat(ExtentType::Vmfs)),
            DiskCreateType::MonolithicFlat => Ok(Encoding::Flat(ExtentType::Flat)),
            DiskCreateType::TwoGbMaxExtentFlat => Ok(Encoding::SplitFlat),
            DiskCreateType::VmfsSparse => Ok(Encoding::Sparse),
            other => Err(DiskError::NotSupported(format!(
                "creating {other} disks is not supported"
            ))),
        }
    }
}

/// Creates VMDK images by wrapping an existing content stream.
///
/// Nothing is copied or written while building: the returned specifications produce the
/// descriptor from memory and the extents from windows over the content.
pub struct DiskBuilder {
    content: Option<SharedStream>,
    geometry: Option<Geometry>,
    bios_geometry: Option<Geometry>,
    disk_type: DiskCreateType,
    adapter_type: AdapterType,
    content_id: Option<u32>,
    max_extent_bytes: u64,
    sparse_encoder: Arc<dyn SparseExtentEncoder>,
}

impl Default for DiskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskBuilder {
    pub fn new() -> Self {
        Self {
            content: None,
            geometry: None,
            bios_geometry: None,
            disk_type: DiskCreateType::Vmfs,
            adapter_type: AdapterType::LsiLogicScsi,
            content_id: None,
            max_extent_bytes: DEFAULT_MAX_EXTENT_BYTES,
            sparse_encoder: Arc::new(VmfsSparseEncoder::default()),
        }
    }

    pub fn disk_type(&self) -> DiskCreateType {
        self.disk_type
    }

    pub fn set_disk_type(&mut self, disk_type: DiskCreateType) {
        self.disk_type = disk_type;
    }

    pub fn adapter_type(&self) -> AdapterType {
        self.adapter_type
    }

    pub fn set_adapter_type(&mut self, adapter_type: AdapterType) {
        self.adapter_type = adapter_type;
    }

    /// Fixes the descriptor's `CID`. By default it is derived from the descriptor text alone
    /// (see [`DescriptorFile::derived_content_id`]); callers that need the id to change with
    /// the data must set it here.
    pub fn set_content_id(&mut self, content_id: u32) {
        self.content_id = Some(content_id);
    }

    pub fn set_max_extent_bytes(&mut self, max_extent_bytes: u64) {
        self.max_extent_bytes = max_extent_bytes;
    }

    pub fn set_sparse_encoder(&mut self, encoder: Arc<dyn SparseExtentEncoder>) {
        self.sparse_encoder = encoder;
    }

    fn validate(&self, base_name: &str) -> Result<(SharedStream, Encoding, u64)> {
        if base_name.is_empty() {
            return Err(DiskError::InvalidArgument("invalid base file name".into()));
        }
        if base_name.contains(&['"', '/', '\\', '\n'][..]) {
            return Err(DiskError::InvalidArgument(format!(
                "base file name {base_name:?} contains reserved characters"
            )));
        }
        let content = self
            .content
            .clone()
            .ok_or_else(|| DiskError::InvalidState("no content stream specified".into()))?;
        let encoding = Encoding::for_create_type(self.disk_type)?;

        let length = lock(&content).len()?;
        if length % SECTOR_SIZE as u64 != 0 {
            return Err(DiskError::InvalidArgument(format!(
                "content length {length} is not a multiple of {SECTOR_SIZE}"
            )));
        }
        if encoding == Encoding::Sparse {
            self.sparse_encoder.check_capacity(length)?;
        }
        if encoding == Encoding::SplitFlat
            && (self.max_extent_bytes == 0 || self.max_extent_bytes % SECTOR_SIZE as u64 != 0)
        {
            return Err(DiskError::InvalidArgument(format!(
                "max extent size {} must be a non-zero multiple of {SECTOR_SIZE}",
                self.max_extent_bytes
            )));
        }
        Ok((content, encoding, length))
    }

    /// Extent entries and their file specifications, in descriptor order.
    fn plan_extents(
        &self,
        base_name: &str,
        encoding: Encoding,
        content: &SharedStream,
        length: u64,
    ) -> Result<Vec<(ExtentDescriptor, DiskImageFileSpecification)>> {
        let sectors = length / SECTOR_SIZE as u64;
        let planned = match encoding {
            Encoding::Flat(extent_type) => {
                let name = format!("{base_name}-flat.{VMDK_EXTENSION}");
                let builder = PassthroughStreamBuilder::window(Arc::clone(content), 0, length)?;
                vec![extent_file(name, sectors, extent_type, Box::new(builder))]
            }
            Encoding::SplitFlat => {
                let count = div_ceil_u64(length, self.max_extent_bytes)?.max(1);
                let mut planned = Vec::with_capacity(count as usize);
                for i in 0..count {
                    let first = i * self.max_extent_bytes;
                    let len = (length - first).min(self.max_extent_bytes);
                    let name = format!("{base_name}-f{:03}.{VMDK_EXTENSION}", i + 1);
                    let builder =
                        PassthroughStreamBuilder::window(Arc::clone(content), first, len)?;
                    planned.push(extent_file(
                        name,
                        len / SECTOR_SIZE as u64,
                        ExtentType::Flat,
                        Box::new(builder),
                    ));
                }
                planned
            }
            Encoding::Sparse => {
                let name = format!("{base_name}-sparse.{VMDK_EXTENSION}");
                let builder = self
                    .sparse_encoder
                    .extent_builder(Arc::clone(content), length)?;
                vec![extent_file(
                    name,
                    sectors,
                    self.sparse_encoder.extent_type(),
                    builder,
                )]
            }
        };
        Ok(planned)
    }
}

fn extent_file(
    name: String,
    sectors: u64,
    extent_type: ExtentType,
    builder: Box<dyn StreamBuilder>,
) -> (ExtentDescriptor, DiskImageFileSpecification) {
    (
        ExtentDescriptor::new(ExtentAccess::ReadWrite, sectors, extent_type, name.clone(), 0),
        DiskImageFileSpecification::new(name, builder),
    )
}

impl DiskImageBuilder for DiskBuilder {
    fn set_content(&mut self, content: SharedStream) {
        self.content = Some(content);
    }

    fn content(&self) -> Option<&SharedStream> {
        self.content.as_ref()
    }

    fn set_geometry(&mut self, geometry: Geometry) {
        self.geometry = Some(geometry);
    }

    fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    fn set_bios_geometry(&mut self, geometry: Geometry) {
        self.bios_geometry = Some(geometry);
    }

    fn bios_geometry(&self) -> Option<Geometry> {
        self.bios_geometry
    }

    fn set_generic_adapter_type(&mut self, adapter: GenericAdapterType) {
        self.adapter_type = match adapter {
            GenericAdapterType::Ide => AdapterType::Ide,
            GenericAdapterType::Scsi => AdapterType::LsiLogicScsi,
        };
    }

    fn build(&self, base_name: &str) -> Result<Vec<DiskImageFileSpecification>> {
        let (content, encoding, length) = self.validate(base_name)?;
        tracing::debug!(base_name, disk_type = %self.disk_type, length, "vmdk build validated");

        let geometry = self
            .geometry
            .unwrap_or_else(|| Geometry::from_capacity(length));
        let mut descriptor = DescriptorFile::new_simple(geometry, self.disk_type, self.adapter_type);
        if let Some(bios) = self.bios_geometry {
            descriptor.disk_database_mut().bios_geometry = Some(bios);
        }
        tracing::debug!(%geometry, adapter = %self.adapter_type, "vmdk descriptor composed");

        let planned = self.plan_extents(base_name, encoding, &content, length)?;
        tracing::debug!(extents = planned.len(), "vmdk extents planned");

        let mut extent_specs = Vec::with_capacity(planned.len());
        for (extent, spec) in planned {
            descriptor.append_extent(extent);
            extent_specs.push(spec);
        }
        let content_id = self
            .content_id
            .unwrap_or_else(|| descriptor.derived_content_id());
        descriptor.set_content_id(content_id);

        let mut specs = Vec::with_capacity(extent_specs.len() + 1);
        specs.push(DiskImageFileSpecification::new(
            format!("{base_name}.{VMDK_EXTENSION}"),
            Box::new(PassthroughStreamBuilder::from_bytes(descriptor.to_bytes())),
        ));
        specs.extend(extent_specs);

        tracing::debug!(
            files = specs.len(),
            content_id,
            "vmdk build done"
        );
        Ok(specs)
    }
}
