//! Cache keys and load requests

use std::fmt;

use sha2::{Digest, Sha256};
use url::Url;

/// Identity of logical image content
///
/// Two requests with equal keys share cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Use `key` verbatim
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive the key from a source URI: its path for absolute URIs,
    /// the string itself otherwise
    pub fn from_uri(uri: &str) -> Self {
        match Url::parse(uri) {
            Ok(url) if !url.cannot_be_a_base() => Self(url.path().to_string()),
            _ => Self(uri.to_string()),
        }
    }

    /// Key for a variant of the same content, e.g. `".thumb"`
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self(format!("{}{}", self.0, suffix))
    }

    /// The key string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe identity used by the disk cache
    pub fn disk_id(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// One image to load: where to read it and how to cache it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    uri: String,
    key: CacheKey,
}

impl ImageRequest {
    /// Request `uri`, keyed by [`CacheKey::from_uri`]
    pub fn new(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let key = CacheKey::from_uri(&uri);
        Self { uri, key }
    }

    /// Override the cache key
    pub fn with_key(mut self, key: CacheKey) -> Self {
        self.key = key;
        self
    }

    /// Source URI handed to the [`Source`](crate::Source)
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Cache key
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl From<&str> for ImageRequest {
    fn from(uri: &str) -> Self {
        Self::new(uri)
    }
}

impl From<String> for ImageRequest {
    fn from(uri: String) -> Self {
        Self::new(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_uri_uses_path() {
        assert_eq!(
            CacheKey::from_uri("file:///photos/cat.jpg").as_str(),
            "/photos/cat.jpg"
        );
        assert_eq!(
            CacheKey::from_uri("https://example.com/a/b.png?size=large").as_str(),
            "/a/b.png"
        );
    }

    #[test]
    fn test_key_from_plain_path() {
        assert_eq!(CacheKey::from_uri("/tmp/cat.jpg").as_str(), "/tmp/cat.jpg");
        assert_eq!(CacheKey::from_uri("relative.png").as_str(), "relative.png");
    }

    #[test]
    fn test_thumbnail_variant() {
        let key = CacheKey::from_uri("file:///a.png");
        let thumb = key.with_suffix(".thumb");

        assert_eq!(thumb.as_str(), "/a.png.thumb");
        assert_ne!(key, thumb);
        assert_ne!(key.disk_id(), thumb.disk_id());
    }

    #[test]
    fn test_disk_id_is_stable_and_safe() {
        let id = CacheKey::new("/a.png").disk_id();

        assert_eq!(id, CacheKey::new("/a.png").disk_id());
        assert_eq!(id.len(), 64);
        assert!(pixstore::is_valid_key(&id));
    }

    #[test]
    fn test_request_key_override() {
        let request = ImageRequest::new("file:///a.png").with_key(CacheKey::new("custom"));

        assert_eq!(request.uri(), "file:///a.png");
        assert_eq!(request.key().as_str(), "custom");
    }
}
