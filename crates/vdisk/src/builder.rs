//! Generic image-building contract.
//!
//! A [`DiskImageBuilder`] turns a content stream into the set of files that make up an image.
//! Each file is a [`DiskImageFileSpecification`]: a name plus a [`StreamBuilder`] that produces
//! the file's bytes on demand. Builders never write to storage themselves.

use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    copy_to_writer, CompositeStream, DiskError, Geometry, Region, Result, SharedStream, Stream,
    SubStream,
};

/// Produces a fresh stream each time it is asked; nothing is computed until then.
pub trait StreamBuilder: Send {
    fn build(&self) -> Result<Box<dyn Stream>>;
}

enum PassthroughSource {
    Bytes(Arc<[u8]>),
    Window {
        stream: SharedStream,
        first: u64,
        length: u64,
    },
}

/// Hands out the source unchanged: either literal bytes or a window over a shared stream.
pub struct PassthroughStreamBuilder {
    source: PassthroughSource,
}

impl PassthroughStreamBuilder {
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            source: PassthroughSource::Bytes(bytes.into()),
        }
    }

    /// Passes through `[first, first + length)` of `stream`.
    pub fn window(stream: SharedStream, first: u64, length: u64) -> Result<Self> {
        first
            .checked_add(length)
            .ok_or(DiskError::OffsetOverflow)?;
        Ok(Self {
            source: PassthroughSource::Window {
                stream,
                first,
                length,
            },
        })
    }
}

impl StreamBuilder for PassthroughStreamBuilder {
    fn build(&self) -> Result<Box<dyn Stream>> {
        match &self.source {
            PassthroughSource::Bytes(bytes) => Ok(Box::new(CompositeStream::from_regions([
                Region::Bytes(Arc::clone(bytes)),
            ])?)),
            PassthroughSource::Window {
                stream,
                first,
                length,
            } => Ok(Box::new(SubStream::new(
                Arc::clone(stream),
                *first,
                *length,
            )?)),
        }
    }
}

/// One output file of an image build.
pub struct DiskImageFileSpecification {
    name: String,
    builder: Box<dyn StreamBuilder>,
}

impl DiskImageFileSpecification {
    pub fn new(name: impl Into<String>, builder: Box<dyn StreamBuilder>) -> Self {
        Self {
            name: name.into(),
            builder,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn open_stream(&self) -> Result<Box<dyn Stream>> {
        self.builder.build()
    }

    /// Materializes the file into `writer`, returning the number of bytes written.
    pub fn write_to(&self, writer: &mut dyn io::Write) -> Result<u64> {
        let mut stream = self.open_stream()?;
        copy_to_writer(stream.as_mut(), writer)
    }
}

impl std::fmt::Debug for DiskImageFileSpecification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImageFileSpecification")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Format-neutral controller family, mapped onto each format's own adapter tags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenericAdapterType {
    Ide,
    #[default]
    Scsi,
}

pub trait DiskImageBuilder {
    fn set_content(&mut self, content: SharedStream);

    fn content(&self) -> Option<&SharedStream>;

    /// Physical geometry. When unset, builders derive it from the content length.
    fn set_geometry(&mut self, geometry: Geometry);

    fn geometry(&self) -> Option<Geometry>;

    fn set_bios_geometry(&mut self, geometry: Geometry);

    fn bios_geometry(&self) -> Option<Geometry>;

    fn set_generic_adapter_type(&mut self, adapter: GenericAdapterType);

    /// Produces the output files for an image called `base_name`.
    ///
    /// Either every specification is returned or an error is; validation failures never yield
    /// partial output.
    fn build(&self, base_name: &str) -> Result<Vec<DiskImageFileSpecification>>;
}
