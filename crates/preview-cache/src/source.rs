//! Source file classification and RAW sidecar lookup

use std::fs;
use std::path::{Path, PathBuf};

/// Camera RAW extensions the transcoder extracts embedded JPEGs from
const RAW_EXTENSIONS: &[&str] = &[
    "cr2", "cr3", "nef", "arw", "raf", "dng", "rw2", "orf", "pef", "srw",
];

/// Lossless formats that are re-encoded when served at original size
const LOSSLESS_EXTENSIONS: &[&str] = &["png", "tif", "tiff", "bmp"];

/// Sidecar extensions preferred over decoding RAW data
const SIDECAR_EXTENSIONS: &[&str] = &["jpg", "jpeg"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Raw,
    Lossless,
    Standard,
}

impl SourceFormat {
    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.to_lowercase();
        if RAW_EXTENSIONS.contains(&ext.as_str()) {
            SourceFormat::Raw
        } else if LOSSLESS_EXTENSIONS.contains(&ext.as_str()) {
            SourceFormat::Lossless
        } else {
            SourceFormat::Standard
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(SourceFormat::Standard)
    }

    /// Whether an original-size request must be decoded and re-encoded
    /// rather than served byte-for-byte
    pub fn needs_normalization(&self) -> bool {
        matches!(self, SourceFormat::Raw | SourceFormat::Lossless)
    }
}

/// Find a JPEG sitting next to a RAW file with the same stem.
/// Extension matching is case-insensitive; the first match in name order wins.
pub fn find_sidecar(raw_path: &Path) -> Option<PathBuf> {
    let stem = raw_path.file_stem()?;
    let dir = raw_path.parent()?;

    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path != raw_path && path.file_stem() == Some(stem))
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| SIDECAR_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .filter(|path| path.is_file())
        .collect();

    candidates.sort();
    candidates.into_iter().next()
}
