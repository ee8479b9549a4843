use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

/// Unified error type for stream, disk and image-building operations.
///
/// Stream window violations (`OutOfRange`) are always reported before any I/O reaches the
/// underlying stream, so a failed call never leaves a partial write behind.
///
/// [`DiskError::Io`] carries the rendered message rather than `std::io::Error`, so streams with
/// no OS file behind them report failures the same way.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("out of range: {0}")]
    OutOfRange(&'static str),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("corrupt disk image: {0}")]
    CorruptImage(&'static str),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// Host I/O failure, or a stream ending early.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DiskError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}
