//! Layered virtual disks and disk image construction.
//!
//! The crate is built around a cursor-based [`Stream`] abstraction. Disks expose their logical
//! content as a stream, and image builders hand out the files of a new image as lazily-produced
//! streams, so nothing has to pass through a real filesystem until the caller decides to write it.
//!
//! - [`SubStream`]: bounded, non-copying window over a parent stream
//! - [`VirtualDisk`]: geometry, content, layers and an on-demand partition view
//! - [`RawDisk`] / [`DifferencingDisk`]: base disk and copy-on-write overlay
//! - [`DiskImageBuilder`]: turns a content stream into named output files
//! - [`vmdk`]: VMDK descriptors, image builder, VMFS sparse extents and a reader

mod backend;
mod builder;
mod composite;
mod cow;
mod disk;
mod error;
mod geometry;
mod partitions;
mod stream;
mod substream;
pub mod util;
pub mod vmdk;

pub use backend::{FileBackend, MemBackend, StorageBackend};
pub use builder::{
    DiskImageBuilder, DiskImageFileSpecification, GenericAdapterType, PassthroughStreamBuilder,
    StreamBuilder,
};
pub use composite::{CompositeStream, Region};
pub use cow::DifferencingDisk;
pub use disk::{describe_layers, LayerInfo, LayerKind, RawDisk, VirtualDisk, VirtualDiskLayer};
pub use error::{DiskError, Result};
pub use geometry::{ChsAddress, Geometry};
pub use partitions::{partition_type, BiosPartitionTable, PartitionInfo, PartitionTable};
pub use stream::{
    copy_to_writer, lock, read_exact, read_fully_at, read_to_end, shared, shared_boxed,
    write_fully_at, BackendStream, SeekOrigin, SharedStream, Stream, StreamReader,
};
pub use substream::SubStream;

/// Logical sector size used throughout the crate.
pub const SECTOR_SIZE: usize = 512;

#[cfg(test)]
mod proptests;
