//! Artifact storage for rendered previews
//!
//! Artifacts are write-once: a key that already exists is never rewritten.
//! The disk store keeps an in-memory LRU in front of the files so hot
//! previews are served without touching the filesystem.

use crate::lru::LruCache;
use crate::{PreviewConfig, PreviewKey};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Storage of rendered artifacts keyed by (content hash, size)
pub trait ArtifactStore: Send + Sync {
    fn get(&self, key: &PreviewKey) -> Option<Vec<u8>>;

    fn put(&self, key: &PreviewKey, data: &[u8]) -> Result<()>;

    fn exists(&self, key: &PreviewKey) -> bool;

    /// Release in-memory copies down to `fraction` of the memory budget.
    /// Returns the number of entries dropped.
    fn trim_memory(&self, _fraction: f64) -> usize {
        0
    }
}

/// Memory usage of a store, for monitoring and debugging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub memory_items: usize,
    pub memory_bytes: usize,
    pub memory_max_bytes: usize,
}

impl StoreStats {
    pub fn memory_usage_percent(&self) -> f64 {
        if self.memory_max_bytes == 0 {
            0.0
        } else {
            (self.memory_bytes as f64 / self.memory_max_bytes as f64) * 100.0
        }
    }
}

/// Disk-backed store: `<root>/<size>/<hash[..2]>/<hash>.jpg`
pub struct DiskArtifactStore {
    root: PathBuf,
    memory: LruCache<PreviewKey, Vec<u8>>,
}

impl DiskArtifactStore {
    pub fn open(config: &PreviewConfig) -> Result<Self> {
        let root = match &config.cache_dir {
            Some(dir) => dir.clone(),
            None => Self::default_root()?,
        };
        Self::open_at(&root, config.memory_budget)
    }

    pub fn open_at(root: &Path, memory_budget: usize) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create preview directory: {}", root.display()))?;

        Ok(Self {
            root: root.to_path_buf(),
            memory: LruCache::new(memory_budget),
        })
    }

    fn default_root() -> Result<PathBuf> {
        let home_dir = dirs::home_dir().context("Unable to find home directory")?;
        Ok(home_dir.join(".projectloupe").join("previews"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &PreviewKey) -> PathBuf {
        let shard = key.hash.get(..2).unwrap_or("__");
        self.root
            .join(key.size.to_string())
            .join(shard)
            .join(format!("{}.jpg", key.hash))
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            memory_items: self.memory.len(),
            memory_bytes: self.memory.total_bytes(),
            memory_max_bytes: self.memory.max_bytes(),
        }
    }
}

impl ArtifactStore for DiskArtifactStore {
    fn get(&self, key: &PreviewKey) -> Option<Vec<u8>> {
        if let Some(data) = self.memory.get(key) {
            return Some(data);
        }

        let data = fs::read(self.path_for(key)).ok()?;
        self.memory.insert(key.clone(), data.clone(), data.len());
        Some(data)
    }

    fn put(&self, key: &PreviewKey, data: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            debug!(key = %key, "artifact already stored, keeping existing bytes");
            return Ok(());
        }

        let dir = path.parent().context("artifact path has no parent")?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create artifact directory: {}", dir.display()))?;

        // Write beside the target and rename so readers never see a partial file
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        if let Err(e) = tmp.persist_noclobber(&path) {
            if !path.exists() {
                return Err(e.error)
                    .with_context(|| format!("Failed to write artifact: {}", path.display()));
            }
        }

        self.memory.insert(key.clone(), data.to_vec(), data.len());
        Ok(())
    }

    fn exists(&self, key: &PreviewKey) -> bool {
        self.memory.contains(key) || self.path_for(key).exists()
    }

    fn trim_memory(&self, fraction: f64) -> usize {
        let target = (self.memory.max_bytes() as f64 * fraction.clamp(0.0, 1.0)) as usize;
        self.memory.trim_to(target)
    }
}

/// Unbounded in-memory store, for tests and memory-only runs
#[derive(Default)]
pub struct MemoryArtifactStore {
    artifacts: RwLock<HashMap<PreviewKey, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn get(&self, key: &PreviewKey) -> Option<Vec<u8>> {
        self.artifacts.read().get(key).cloned()
    }

    fn put(&self, key: &PreviewKey, data: &[u8]) -> Result<()> {
        self.artifacts
            .write()
            .entry(key.clone())
            .or_insert_with(|| data.to_vec());
        Ok(())
    }

    fn exists(&self, key: &PreviewKey) -> bool {
        self.artifacts.read().contains_key(key)
    }
}
