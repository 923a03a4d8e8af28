//! Preview artifact storage and transcoding for the ProjectLoupe preview service
//!
//! This crate owns the two leaf collaborators of the rendering pipeline: the
//! artifact store that keeps rendered previews keyed by (content hash, size),
//! and the transcoder that turns source images (including camera RAW) into
//! resized JPEG previews.
//!
//! # Features
//!
//! - **Standard tiers**: 300px and 1024px long edge, rendered together in one pass
//! - **Dual storage**: In-memory LRU with a byte budget in front of a write-once disk store
//! - **RAW support**: Leverages exiftool's JpgFromRaw and PreviewImage extraction
//! - **Orientation**: EXIF orientation is applied before resizing

pub mod lru;
pub mod source;
pub mod store;
pub mod transcode;

pub use lru::LruCache;
pub use source::{find_sidecar, SourceFormat};
pub use store::{ArtifactStore, DiskArtifactStore, MemoryArtifactStore, StoreStats};
pub use transcode::{render_tiers, ImageTranscoder, SourceImage, Transcoder};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Long-edge sizes rendered for every generated source.
pub const STANDARD_TIERS: [u32; 2] = [300, 1024];

/// Identity of a cached artifact. Files with identical bytes share artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PreviewKey {
    pub hash: String,
    pub size: u32,
}

impl PreviewKey {
    pub fn new(hash: impl Into<String>, size: u32) -> Self {
        Self {
            hash: hash.into(),
            size,
        }
    }
}

impl fmt::Display for PreviewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash, self.size)
    }
}

/// Rendering and storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub tier_sizes: Vec<u32>,
    pub tier_quality: u8,
    pub original_quality: u8,
    pub memory_budget: usize,
    /// Defaults to ~/.projectloupe/previews when unset
    pub cache_dir: Option<PathBuf>,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            tier_sizes: STANDARD_TIERS.to_vec(),
            tier_quality: 80,
            original_quality: 90,
            memory_budget: 256 * 1024 * 1024, // 256MB
            cache_dir: None,
        }
    }
}

/// SHA-256 of the full source content, lowercase hex
pub fn hash_content(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_content() {
        let h1 = hash_content(b"test content");
        let h2 = hash_content(b"test content");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);

        // Different bytes, different key
        assert_ne!(h1, hash_content(b"different content"));
    }

    #[test]
    fn test_default_config_uses_standard_tiers() {
        let config = PreviewConfig::default();
        assert_eq!(config.tier_sizes, vec![300, 1024]);
        assert_eq!(config.tier_quality, 80);
        assert_eq!(config.original_quality, 90);
    }

    #[test]
    fn test_preview_key_display() {
        let key = PreviewKey::new("abc123", 300);
        assert_eq!(key.to_string(), "abc123@300");
    }
}
