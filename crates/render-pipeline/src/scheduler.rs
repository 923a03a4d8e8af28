//! Priority scheduler: an unbounded heap behind a counting gate
//!
//! Every `enqueue` pushes one job and then releases one permit, so the number
//! of permits never exceeds the number of queued jobs and each permit taken by
//! `dequeue` is matched by exactly one job. Higher priority is served first;
//! equal priorities are served in enqueue order.

use crate::job::Job;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::Semaphore;
use tracing::debug;

struct Queued {
    priority: f64,
    seq: u64,
    job: Job,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            // earlier sequence wins among equals
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Queued>,
    closed: bool,
}

pub struct PriorityScheduler {
    queue: Mutex<Queue>,
    gate: Semaphore,
    next_seq: AtomicU64,
}

impl PriorityScheduler {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            gate: Semaphore::new(0),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Queue a job and wake one waiting worker. NaN priorities count as 0.
    pub fn enqueue(&self, job: Job, priority: f64) {
        let priority = if priority.is_nan() { 0.0 } else { priority };
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);

        let mut queue = self.queue.lock();
        if queue.closed {
            drop(queue);
            debug!(file_id = %job.request().file_id, "scheduler closed, cancelling job");
            job.cancel();
            return;
        }
        queue.heap.push(Queued { priority, seq, job });
        drop(queue);

        self.gate.add_permits(1);
    }

    /// Wait for the highest-priority job. Returns `None` once closed.
    pub async fn dequeue(&self) -> Option<Job> {
        let permit = self.gate.acquire().await.ok()?;
        permit.forget();
        self.queue.lock().heap.pop().map(|queued| queued.job)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out jobs and cancel everything still queued
    pub fn close(&self) {
        let drained: Vec<Queued> = {
            let mut queue = self.queue.lock();
            queue.closed = true;
            queue.heap.drain().collect()
        };
        self.gate.close();
        if !drained.is_empty() {
            debug!(count = drained.len(), "cancelling queued jobs on shutdown");
        }
        for queued in drained {
            queued.job.cancel();
        }
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}
