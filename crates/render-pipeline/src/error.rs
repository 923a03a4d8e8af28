use thiserror::Error;

/// Failures inside the rendering pipeline.
///
/// None of these escape a worker or the scheduler: the resolver turns
/// `NotFound` and `Transcode` into an empty payload, `Cancelled` drops the
/// job, and `Channel` is confined to the connection it happened on.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source not found: {0}")]
    NotFound(String),

    #[error("transcode failed for {file_id}: {source}")]
    Transcode {
        file_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error("channel fault: {0}")]
    Channel(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("catalog error: {0}")]
    Catalog(#[source] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
