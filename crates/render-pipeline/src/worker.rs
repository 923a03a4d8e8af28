//! Fixed pool of workers draining the scheduler

use crate::resolver::GenerationResolver;
use crate::scheduler::PriorityScheduler;
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub struct WorkerPool {
    scheduler: Arc<PriorityScheduler>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Half the available cores, at least one
    pub fn default_size() -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cores / 2).max(1)
    }

    pub fn start(
        count: usize,
        scheduler: Arc<PriorityScheduler>,
        resolver: Arc<GenerationResolver>,
    ) -> Self {
        let count = count.max(1);
        info!(workers = count, "starting render workers");

        let workers = (0..count)
            .map(|index| {
                let scheduler = Arc::clone(&scheduler);
                let resolver = Arc::clone(&resolver);
                tokio::spawn(run_worker(index, scheduler, resolver))
            })
            .collect();

        Self { scheduler, workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Close the scheduler, cancel queued jobs and wait for workers to finish
    pub async fn shutdown(self) {
        self.scheduler.close();
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "render worker ended abnormally");
            }
        }
        info!("render workers stopped");
    }
}

async fn run_worker(
    index: usize,
    scheduler: Arc<PriorityScheduler>,
    resolver: Arc<GenerationResolver>,
) {
    while let Some(job) = scheduler.dequeue().await {
        let request = job.request().clone();
        if !job.is_live() {
            debug!(
                worker = index,
                file_id = %request.file_id,
                request_id = request.request_id,
                "dropping abandoned job"
            );
            job.cancel();
            continue;
        }

        debug!(
            worker = index,
            file_id = %request.file_id,
            size = request.size,
            queued_ms = job.queued_for().as_millis() as u64,
            "job dequeued"
        );

        // Run in its own task so a panic costs one job, not the worker
        let task = {
            let resolver = Arc::clone(&resolver);
            let file_id = request.file_id.clone();
            let size = request.size;
            tokio::spawn(async move { resolver.resolve(&file_id, size).await })
        };
        let payload = match task.await {
            Ok(payload) => payload,
            Err(e) => {
                error!(worker = index, file_id = %request.file_id, error = %e, "render job panicked");
                Bytes::new()
            }
        };
        job.complete(payload);
    }
    debug!(worker = index, "render worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobOutcome};
    use crate::notify::NotificationBus;
    use crate::protocol::ImageRequest;
    use catalog_db::MemoryCatalog;
    use preview_cache::{ImageTranscoder, MemoryArtifactStore};
    use std::fs;
    use tokio_util::sync::CancellationToken;

    fn pool_with(catalog: MemoryCatalog, workers: usize) -> (Arc<PriorityScheduler>, WorkerPool) {
        let resolver = Arc::new(GenerationResolver::new(
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(catalog),
            Arc::new(ImageTranscoder::new()),
            Arc::new(NotificationBus::new()),
        ));
        let scheduler = Arc::new(PriorityScheduler::new());
        let pool = WorkerPool::start(workers, Arc::clone(&scheduler), resolver);
        (scheduler, pool)
    }

    #[test]
    fn test_default_size() {
        assert!(WorkerPool::default_size() >= 1);
    }

    #[tokio::test]
    async fn test_failures_complete_with_empty_payload() {
        let (scheduler, pool) = pool_with(MemoryCatalog::new(), 1);
        assert_eq!(pool.size(), 1);

        for id in 0..3 {
            let (job, handle) = Job::new(
                ImageRequest::new(id, "missing", 300, 1.0),
                CancellationToken::new(),
            );
            scheduler.enqueue(job, 1.0);
            // The worker keeps going after each failure
            assert_eq!(handle.wait().await, JobOutcome::Ready(Bytes::new()));
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_dead_jobs_are_cancelled_without_work() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        fs::write(&path, b"bytes").unwrap();
        let catalog = MemoryCatalog::new();
        catalog.insert("a", "root", &path);
        let (scheduler, pool) = pool_with(catalog, 1);

        let token = CancellationToken::new();
        let (job, handle) = Job::new(ImageRequest::new(1, "a", 0, 1.0), token.clone());
        token.cancel();
        scheduler.enqueue(job, 1.0);
        assert_eq!(handle.wait().await, JobOutcome::Cancelled);

        let (job, handle) = Job::new(ImageRequest::new(2, "a", 0, 1.0), CancellationToken::new());
        scheduler.enqueue(job, 1.0);
        assert_eq!(
            handle.wait().await,
            JobOutcome::Ready(Bytes::from_static(b"bytes"))
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_jobs() {
        let (scheduler, pool) = pool_with(MemoryCatalog::new(), 1);
        pool.shutdown().await;

        let (job, handle) = Job::new(ImageRequest::new(1, "x", 300, 1.0), CancellationToken::new());
        scheduler.enqueue(job, 1.0);
        assert_eq!(handle.wait().await, JobOutcome::Cancelled);
    }
}
