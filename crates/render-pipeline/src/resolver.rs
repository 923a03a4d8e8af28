//! Turns (file id, size) into preview bytes
//!
//! Originals (size 0) are served from the source file, normalized to JPEG only
//! when the source is RAW or lossless. Every other size is served from the
//! artifact store; a miss decodes the source once under the per-hash lock and
//! writes all standard tiers, plus the requested size if it is not one of
//! them, before any waiter is answered.

use crate::error::{PipelineError, Result};
use crate::locks::GenerationLocks;
use crate::memory::MemoryMonitor;
use crate::notify::{Event, EventKind, NotificationBus};
use bytes::Bytes;
use catalog_db::Catalog;
use preview_cache::{
    find_sidecar, hash_content, render_tiers, ArtifactStore, PreviewConfig, PreviewKey,
    SourceFormat, Transcoder,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

pub struct GenerationResolver {
    store: Arc<dyn ArtifactStore>,
    catalog: Arc<dyn Catalog>,
    transcoder: Arc<dyn Transcoder>,
    notifications: Arc<NotificationBus>,
    locks: GenerationLocks,
    memory: MemoryMonitor,
    config: PreviewConfig,
}

/// Source bytes read while hashing, reused for decoding
struct LoadedSource {
    path: PathBuf,
    data: Vec<u8>,
}

impl GenerationResolver {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        catalog: Arc<dyn Catalog>,
        transcoder: Arc<dyn Transcoder>,
        notifications: Arc<NotificationBus>,
    ) -> Self {
        Self {
            store,
            catalog,
            transcoder,
            notifications,
            locks: GenerationLocks::new(),
            memory: MemoryMonitor::new(None),
            config: PreviewConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PreviewConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_memory_monitor(mut self, memory: MemoryMonitor) -> Self {
        self.memory = memory;
        self
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn memory(&self) -> &MemoryMonitor {
        &self.memory
    }

    /// Hashes with generation in flight or waiting
    pub fn pending_generations(&self) -> usize {
        self.locks.len()
    }

    /// Resolve to bytes. Failures are logged and yield an empty payload.
    pub async fn resolve(&self, file_id: &str, size: u32) -> Bytes {
        match self.try_resolve(file_id, size).await {
            Ok(bytes) => bytes,
            Err(PipelineError::NotFound(what)) => {
                debug!(file_id, size, missing = %what, "source not found");
                Bytes::new()
            }
            Err(e) => {
                warn!(file_id, size, error = %e, "preview generation failed");
                Bytes::new()
            }
        }
    }

    pub async fn try_resolve(&self, file_id: &str, size: u32) -> Result<Bytes> {
        if size == 0 {
            self.original(file_id).await
        } else {
            self.preview(file_id, size).await
        }
    }

    /// Store lookup using only an already known hash. Never hashes, decodes
    /// or waits on a lock, so it is safe on the request path.
    pub async fn lookup_cached(&self, file_id: &str, size: u32) -> Option<Bytes> {
        if size == 0 {
            return None;
        }
        let hash = match self.known_hash(file_id).await {
            Ok(hash) => hash?,
            Err(e) => {
                debug!(file_id, error = %e, "hash lookup failed");
                return None;
            }
        };
        self.cached(PreviewKey::new(hash, size)).await.ok().flatten()
    }

    async fn original(&self, file_id: &str) -> Result<Bytes> {
        let mut path = self.source_path(file_id).await?;
        let mut format = SourceFormat::from_path(&path);

        if format == SourceFormat::Raw {
            let raw = path.clone();
            if let Some(sidecar) = spawn_blocking(move || find_sidecar(&raw)).await? {
                debug!(file_id, sidecar = %sidecar.display(), "serving sidecar for RAW original");
                format = SourceFormat::from_path(&sidecar);
                path = sidecar;
            }
        }

        let data = read_source(&path).await?;
        if !format.needs_normalization() {
            return Ok(Bytes::from(data));
        }

        let _ticket = self.memory.begin_decode();
        self.memory.relieve_pressure(self.store.as_ref());

        let transcoder = Arc::clone(&self.transcoder);
        let quality = self.config.original_quality;
        let encoded = spawn_blocking(move || {
            let source = transcoder.decode(&data, format)?;
            let image = transcoder.auto_orient(source);
            transcoder.encode(&image, quality)
        })
        .await?
        .map_err(|source| PipelineError::Transcode {
            file_id: file_id.to_string(),
            source,
        })?;

        Ok(Bytes::from(encoded))
    }

    async fn preview(&self, file_id: &str, size: u32) -> Result<Bytes> {
        let (hash, loaded) = match self.known_hash(file_id).await? {
            Some(hash) => (hash, None),
            None => {
                let (hash, loaded) = self.hash_source(file_id).await?;
                (hash, Some(loaded))
            }
        };

        let key = PreviewKey::new(hash.clone(), size);
        if let Some(bytes) = self.cached(key.clone()).await? {
            debug!(file_id, key = %key, "preview cache hit");
            return Ok(bytes);
        }

        let _guard = self.locks.acquire(&hash).await;
        if let Some(bytes) = self.cached(key.clone()).await? {
            debug!(file_id, key = %key, "preview generated by another request");
            return Ok(bytes);
        }

        let root_id = self.owning_root(file_id).await;
        self.notifications.publish(Event::new(
            EventKind::GenerationStarted,
            file_id,
            root_id.clone(),
        ));
        let result = self.generate(file_id, &hash, size, loaded).await;
        self.notifications.publish(Event::new(
            EventKind::GenerationFinished,
            file_id,
            root_id,
        ));
        result
    }

    /// Decode once and write every tier. Runs under the generation lock.
    async fn generate(
        &self,
        file_id: &str,
        hash: &str,
        size: u32,
        loaded: Option<LoadedSource>,
    ) -> Result<Bytes> {
        let LoadedSource { path, data } = match loaded {
            Some(loaded) => loaded,
            None => {
                let path = self.source_path(file_id).await?;
                let data = read_source(&path).await?;
                LoadedSource { path, data }
            }
        };
        let format = SourceFormat::from_path(&path);

        let mut sizes = self.config.tier_sizes.clone();
        if !sizes.contains(&size) {
            sizes.push(size);
        }

        let _ticket = self.memory.begin_decode();
        self.memory.relieve_pressure(self.store.as_ref());
        info!(file_id, hash, ?sizes, "generating previews");

        let transcoder = Arc::clone(&self.transcoder);
        let quality = self.config.tier_quality;
        let rendered = spawn_blocking(move || -> anyhow::Result<_> {
            let source = transcoder.decode(&data, format)?;
            let image = transcoder.auto_orient(source);
            Ok(render_tiers(transcoder.as_ref(), &image, &sizes, quality))
        })
        .await?
        .map_err(|source| PipelineError::Transcode {
            file_id: file_id.to_string(),
            source,
        })?;

        let store = Arc::clone(&self.store);
        let owned_hash = hash.to_string();
        let owned_id = file_id.to_string();
        let requested = spawn_blocking(move || {
            let mut requested = None;
            for (tier, encoded) in rendered {
                let key = PreviewKey::new(owned_hash.clone(), tier);
                match encoded {
                    Ok(bytes) => {
                        if let Err(e) = store.put(&key, &bytes) {
                            warn!(file_id = %owned_id, key = %key, error = %e, "failed to store preview");
                        }
                        if tier == size {
                            requested = Some(bytes);
                        }
                    }
                    Err(e) => {
                        warn!(file_id = %owned_id, key = %key, error = %e, "failed to encode tier");
                    }
                }
            }
            requested
        })
        .await?;

        requested
            .map(Bytes::from)
            .ok_or_else(|| PipelineError::Transcode {
                file_id: file_id.to_string(),
                source: anyhow::anyhow!("no output for size {}", size),
            })
    }

    /// Hash the full source on demand and record it in the catalog
    async fn hash_source(&self, file_id: &str) -> Result<(String, LoadedSource)> {
        let path = self.source_path(file_id).await?;
        let data = read_source(&path).await?;
        let (data, hash) = spawn_blocking(move || {
            let hash = hash_content(&data);
            (data, hash)
        })
        .await?;

        let id = file_id.to_string();
        let recorded = hash.clone();
        if let Err(e) = self
            .catalog_call(move |catalog| catalog.set_hash(&id, &recorded))
            .await
        {
            warn!(file_id, error = %e, "failed to record content hash");
        }
        debug!(file_id, hash = %hash, "hashed source on demand");

        Ok((hash, LoadedSource { path, data }))
    }

    async fn cached(&self, key: PreviewKey) -> Result<Option<Bytes>> {
        let store = Arc::clone(&self.store);
        let found = spawn_blocking(move || store.get(&key)).await?;
        Ok(found.map(Bytes::from))
    }

    async fn known_hash(&self, file_id: &str) -> Result<Option<String>> {
        let id = file_id.to_string();
        self.catalog_call(move |catalog| catalog.get_hash(&id)).await
    }

    async fn source_path(&self, file_id: &str) -> Result<PathBuf> {
        let id = file_id.to_string();
        self.catalog_call(move |catalog| catalog.resolve_path(&id))
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("file id {}", file_id)))
    }

    async fn owning_root(&self, file_id: &str) -> Option<String> {
        let id = file_id.to_string();
        match self
            .catalog_call(move |catalog| catalog.resolve_owning_root(&id))
            .await
        {
            Ok(root) => root,
            Err(e) => {
                debug!(file_id, error = %e, "owning root lookup failed");
                None
            }
        }
    }

    async fn catalog_call<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Catalog) -> anyhow::Result<T> + Send + 'static,
    {
        let catalog = Arc::clone(&self.catalog);
        spawn_blocking(move || call(catalog.as_ref()))
            .await?
            .map_err(PipelineError::Catalog)
    }
}

async fn read_source(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| PipelineError::NotFound(format!("{}: {}", path.display(), e)))
}
