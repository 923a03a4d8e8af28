//! On-demand preview rendering and delivery for ProjectLoupe
//!
//! Requests for "file X at size Y" arrive over a push or pull connection. A
//! preview already in the artifact store is answered immediately; anything
//! else becomes a job in a priority queue drained by a small worker pool.
//! Workers decode each source at most once at a time, write every standard
//! tier in one pass, and answer all callers waiting on that source.
//!
//! # Features
//!
//! - **Priority scheduling**: Highest priority first, FIFO among equals
//! - **Coalescing**: Concurrent misses for the same content hash share one decode
//! - **Fast path**: Store hits never enter the queue
//! - **Cancellation**: Jobs from closed connections are dropped before decoding
//! - **Notifications**: Generation progress is broadcast to push clients

pub mod channel;
pub mod error;
pub mod job;
pub mod locks;
pub mod memory;
pub mod notify;
pub mod protocol;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod worker;

pub use channel::{serve_pull, serve_push, SinkWriter};
pub use error::{PipelineError, Result};
pub use job::{Job, JobHandle, JobOutcome};
pub use locks::{GenerationGuard, GenerationLocks};
pub use memory::{DecodeTicket, MemoryMonitor};
pub use notify::{ChannelWriter, ClientId, Event, EventKind, NotificationBus};
pub use protocol::{decode_frame, encode_frame, ChannelCodec, ImageRequest, WireMessage};
pub use resolver::GenerationResolver;
pub use scheduler::PriorityScheduler;
pub use service::{PipelineConfig, PipelineService, PipelineStats};
pub use worker::WorkerPool;
