//! Byte sources for image URIs

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use url::Url;

/// Turns a URI into a stream of encoded image bytes
///
/// Called from worker threads. Errors are treated as decode failures by
/// the loader and never propagate to the caller.
pub trait Source: Send + Sync {
    /// Open `uri` for reading
    fn open(&self, uri: &str) -> io::Result<Box<dyn Read + Send>>;
}

/// Reads local files given as plain paths or `file://` URIs
#[derive(Debug, Clone, Default)]
pub struct FileSource {
    root: Option<PathBuf>,
}

impl FileSource {
    /// Resolve relative paths against the working directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative paths against `root`
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// Filesystem path for `uri`
    pub fn resolve(&self, uri: &str) -> io::Result<PathBuf> {
        if let Ok(url) = Url::parse(uri) {
            if url.scheme() == "file" {
                return url.to_file_path().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, format!("bad file URI: {}", uri))
                });
            }
            // Windows drive letters parse as a one-letter scheme
            if url.scheme().len() > 1 {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("unsupported scheme: {}", url.scheme()),
                ));
            }
        }

        let path = Path::new(uri);
        Ok(match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        })
    }
}

impl Source for FileSource {
    fn open(&self, uri: &str) -> io::Result<Box<dyn Read + Send>> {
        let path = self.resolve(uri)?;
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }
}
