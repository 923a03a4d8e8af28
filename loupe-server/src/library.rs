//! Registering library folders in the catalog

use anyhow::{Context, Result};
use catalog_db::SqliteCatalog;
use std::path::{Path, PathBuf};
use tracing::info;

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "tif", "tiff", "bmp", "webp", "cr3", "cr2", "nef", "arw", "raf", "dng",
    "rw2", "orf", "pef", "srw",
];

/// Recursively scan a folder for supported image files
fn scan_folder(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();

    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            paths.extend(scan_folder(&path)?);
        } else if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
                paths.push(path);
            }
        }
    }

    Ok(paths)
}

/// File ids are the root id plus the path relative to the root, with `/`
/// separators, so they stay stable across rescans.
fn file_id(root_id: &str, root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    format!("{}/{}", root_id, parts.join("/"))
}

/// Register every image under `root`. Returns the number of files.
pub fn register_root(catalog: &SqliteCatalog, root: &Path, root_id: Option<&str>) -> Result<usize> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Library folder not found: {}", root.display()))?;
    let root_id = match root_id {
        Some(id) => id.to_string(),
        None => root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "library".to_string()),
    };

    let mut paths = scan_folder(&root)?;
    paths.sort();
    let files: Vec<(String, PathBuf)> = paths
        .into_iter()
        .map(|path| (file_id(&root_id, &root, &path), path))
        .collect();

    catalog.add_root(&root_id, &root)?;
    catalog.upsert_files(&root_id, &files)?;
    info!(root = %root.display(), root_id = %root_id, files = files.len(), "registered library folder");
    Ok(files.len())
}
