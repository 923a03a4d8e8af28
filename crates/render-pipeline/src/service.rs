//! The pipeline coordinator
//!
//! Owns the scheduler, worker pool, resolver and notification bus. Created
//! once at service start with [`PipelineService::start`] and torn down with
//! [`PipelineService::shutdown`]; both transports go through [`PipelineService::fetch`].

use crate::error::{PipelineError, Result};
use crate::job::{Job, JobOutcome};
use crate::memory::MemoryMonitor;
use crate::notify::NotificationBus;
use crate::protocol::ImageRequest;
use crate::resolver::GenerationResolver;
use crate::scheduler::PriorityScheduler;
use crate::worker::WorkerPool;
use bytes::Bytes;
use catalog_db::Catalog;
use parking_lot::Mutex;
use preview_cache::{ArtifactStore, PreviewConfig, Transcoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Worker and memory settings for the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Defaults to half the available cores
    pub workers: Option<usize>,
    /// Process RSS above which the preview memory tier is trimmed
    pub memory_high_water: Option<u64>,
    /// Priority given to pull requests, which carry none of their own
    pub pull_priority: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: None,
            memory_high_water: Some(2 * 1024 * 1024 * 1024), // 2GB
            pull_priority: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub workers: usize,
    pub queued: usize,
    pub pending_generations: usize,
    pub active_decodes: usize,
    pub push_clients: usize,
    pub memory_hints: u64,
}

pub struct PipelineService {
    scheduler: Arc<PriorityScheduler>,
    resolver: Arc<GenerationResolver>,
    notifications: Arc<NotificationBus>,
    workers: Mutex<Option<WorkerPool>>,
    worker_count: usize,
    config: PipelineConfig,
}

impl PipelineService {
    /// Build the pipeline and start its workers. Must be called inside a
    /// tokio runtime.
    pub fn start(
        store: Arc<dyn ArtifactStore>,
        catalog: Arc<dyn Catalog>,
        transcoder: Arc<dyn Transcoder>,
        preview: PreviewConfig,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let notifications = Arc::new(NotificationBus::new());
        let resolver = Arc::new(
            GenerationResolver::new(store, catalog, transcoder, Arc::clone(&notifications))
                .with_config(preview)
                .with_memory_monitor(MemoryMonitor::new(config.memory_high_water)),
        );
        let scheduler = Arc::new(PriorityScheduler::new());

        let count = config.workers.unwrap_or_else(WorkerPool::default_size);
        let pool = WorkerPool::start(count, Arc::clone(&scheduler), Arc::clone(&resolver));
        let worker_count = pool.size();

        Arc::new(Self {
            scheduler,
            resolver,
            notifications,
            workers: Mutex::new(Some(pool)),
            worker_count,
            config,
        })
    }

    /// Serve a request: straight from the store when the preview exists,
    /// otherwise through the scheduler. Returns `Cancelled` once `liveness`
    /// is cancelled; an empty payload means unavailable.
    pub async fn fetch(&self, request: &ImageRequest, liveness: &CancellationToken) -> Result<Bytes> {
        if let Some(bytes) = self
            .resolver
            .lookup_cached(&request.file_id, request.size)
            .await
        {
            debug!(
                file_id = %request.file_id,
                size = request.size,
                request_id = request.request_id,
                "fast path hit"
            );
            return Ok(bytes);
        }
        if liveness.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let (job, handle) = Job::new(request.clone(), liveness.clone());
        self.scheduler.enqueue(job, request.priority);
        debug!(
            file_id = %request.file_id,
            size = request.size,
            priority = request.priority,
            queued = self.scheduler.len(),
            "job enqueued"
        );

        tokio::select! {
            outcome = handle.wait() => match outcome {
                JobOutcome::Ready(bytes) => Ok(bytes),
                JobOutcome::Cancelled => Err(PipelineError::Cancelled),
            },
            _ = liveness.cancelled() => Err(PipelineError::Cancelled),
        }
    }

    pub fn notifications(&self) -> &Arc<NotificationBus> {
        &self.notifications
    }

    pub fn resolver(&self) -> &Arc<GenerationResolver> {
        &self.resolver
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            workers: self.worker_count,
            queued: self.scheduler.len(),
            pending_generations: self.resolver.pending_generations(),
            active_decodes: self.resolver.memory().active(),
            push_clients: self.notifications.len(),
            memory_hints: self.resolver.memory().hints_issued(),
        }
    }

    /// Stop the workers and cancel queued jobs. Later fetches that miss the
    /// store resolve as cancelled.
    pub async fn shutdown(&self) {
        let pool = self.workers.lock().take();
        if let Some(pool) = pool {
            info!(queued = self.scheduler.len(), "shutting down render pipeline");
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_db::MemoryCatalog;
    use preview_cache::{ImageTranscoder, MemoryArtifactStore, PreviewKey};
    use std::fs;

    fn service(catalog: Arc<MemoryCatalog>, store: Arc<MemoryArtifactStore>) -> Arc<PipelineService> {
        PipelineService::start(
            store,
            catalog,
            Arc::new(ImageTranscoder::new()),
            PreviewConfig::default(),
            PipelineConfig {
                workers: Some(2),
                ..PipelineConfig::default()
            },
        )
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: PipelineConfig = serde_json::from_str(r#"{"workers": 3}"#).unwrap();
        assert_eq!(config.workers, Some(3));
        assert_eq!(config.memory_high_water, Some(2 * 1024 * 1024 * 1024));
        assert_eq!(config.pull_priority, 0.0);
    }

    #[tokio::test]
    async fn test_fast_path_serves_stored_preview() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert("f1", "root", "/nowhere/f1.jpg");
        catalog.set_hash("f1", "abc").unwrap();
        let store = Arc::new(MemoryArtifactStore::new());
        store.put(&PreviewKey::new("abc", 300), b"stored").unwrap();

        let service = service(catalog, store);
        let bytes = service
            .fetch(&ImageRequest::new(1, "f1", 300, 0.0), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"stored");
        assert_eq!(service.stats().workers, 2);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_liveness_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        fs::write(&path, b"jpeg").unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert("a", "root", &path);

        let service = service(catalog, Arc::new(MemoryArtifactStore::new()));
        let token = CancellationToken::new();
        token.cancel();
        let result = service.fetch(&ImageRequest::new(1, "a", 0, 0.0), &token).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_fetch_after_shutdown_is_cancelled() {
        let service = service(Arc::new(MemoryCatalog::new()), Arc::new(MemoryArtifactStore::new()));
        service.shutdown().await;
        // Second shutdown is a no-op
        service.shutdown().await;

        let result = service
            .fetch(&ImageRequest::new(1, "x", 300, 0.0), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}
