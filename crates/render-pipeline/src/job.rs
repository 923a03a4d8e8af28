//! Queued render jobs and their one-shot result delivery

use crate::protocol::ImageRequest;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Rendered bytes; empty when the source is missing or failed to transcode
    Ready(Bytes),
    Cancelled,
}

/// A request waiting in the scheduler.
///
/// `complete` and `cancel` consume the job, so its result is delivered at
/// most once. Dropping an unresolved job closes the channel, which the
/// waiting side observes as `Cancelled`, so it is never left without one.
#[derive(Debug)]
pub struct Job {
    request: ImageRequest,
    enqueued_at: Instant,
    liveness: CancellationToken,
    sink: oneshot::Sender<JobOutcome>,
}

/// The caller's half of a job
#[derive(Debug)]
pub struct JobHandle {
    rx: oneshot::Receiver<JobOutcome>,
}

impl Job {
    /// `liveness` is cancelled when the originating connection goes away
    pub fn new(request: ImageRequest, liveness: CancellationToken) -> (Job, JobHandle) {
        let (sink, rx) = oneshot::channel();
        let job = Job {
            request,
            enqueued_at: Instant::now(),
            liveness,
            sink,
        };
        (job, JobHandle { rx })
    }

    pub fn request(&self) -> &ImageRequest {
        &self.request
    }

    /// False once the connection closed or the caller stopped waiting
    pub fn is_live(&self) -> bool {
        !self.liveness.is_cancelled() && !self.sink.is_closed()
    }

    pub fn queued_for(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    pub fn complete(self, payload: Bytes) {
        let _ = self.sink.send(JobOutcome::Ready(payload));
    }

    pub fn cancel(self) {
        let _ = self.sink.send(JobOutcome::Cancelled);
    }
}

impl JobHandle {
    pub async fn wait(self) -> JobOutcome {
        self.rx.await.unwrap_or(JobOutcome::Cancelled)
    }
}
