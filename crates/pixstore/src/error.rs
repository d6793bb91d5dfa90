//! Error types for pixstore

use std::fmt;
use std::io;

/// Result type alias for pixstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for store operations
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(io::Error),

    /// Journal parse error
    Parse(String),

    /// Key is not a valid entry name (`[a-z0-9_-]{1,64}`)
    InvalidKey(String),

    /// Editor was already committed or aborted
    EditorFinished,

    /// Store is closed
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Parse(msg) => write!(f, "Journal parse error: {}", msg),
            Error::InvalidKey(key) => {
                write!(f, "Invalid key {:?}: keys must match [a-z0-9_-]{{1,64}}", key)
            }
            Error::EditorFinished => write!(f, "Editor already committed or aborted"),
            Error::Closed => write!(f, "Store is closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
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

impl From<nom::Err<nom::error::Error<&[u8]>>> for Error {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        Error::Parse(format!("{:?}", err))
    }
}
