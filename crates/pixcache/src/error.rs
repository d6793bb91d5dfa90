//! Error types for pixcache

use std::fmt;
use std::io;

/// Result type alias for pixcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for cache and loader operations
#[derive(Debug)]
pub enum Error {
    /// A handle was used after `close()`; indicates a reference counting bug
    UseAfterClose,

    /// Invalid cache or loader configuration
    Configuration(String),

    /// Image data could not be decoded or encoded
    Decode(String),

    /// Disk cache failure
    DiskIo(pixstore::Error),

    /// I/O error outside the disk cache
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UseAfterClose => write!(f, "Handle used after close"),
            Error::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Error::Decode(msg) => write!(f, "Decode error: {}", msg),
            Error::DiskIo(e) => write!(f, "Disk cache error: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::DiskIo(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<pixstore::Error> for Error {
    fn from(err: pixstore::Error) -> Self {
        Error::DiskIo(err)
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Decode(err.to_string())
    }
}
