//! VMware VMDK images: text descriptors, the image builder, VMFS sparse extents and a reader.

mod builder;
mod descriptor;
mod disk;
mod sparse;

pub use builder::{DiskBuilder, DEFAULT_MAX_EXTENT_BYTES};
pub use descriptor::{
    AdapterType, DescriptorFile, DiskCreateType, DiskDatabase, ExtentAccess, ExtentDescriptor,
    ExtentType, NO_PARENT_CONTENT_ID,
};
pub use disk::{DirLocator, FileLocator, MemLocator, VmdkDisk};
pub use sparse::{
    CowdHeader, SparseExtentEncoder, VmfsSparseEncoder, VmfsSparseExtentBuilder,
    VmfsSparseStream, COWD_MAGIC, GRAIN_TABLE_ENTRIES,
};

/// File extension of every file in a VMDK image.
pub const VMDK_EXTENSION: &str = "vmdk";
