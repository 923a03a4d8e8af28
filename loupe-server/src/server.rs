//! TCP listeners for the push and pull channels

use render_pipeline::{serve_pull, serve_push, PipelineService};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub async fn accept_push(
    listener: TcpListener,
    service: Arc<PipelineService>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "push connection accepted");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                    }
                    let service = Arc::clone(&service);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        serve_push(service, stream, &shutdown).await;
                    });
                }
                Err(e) => warn!(error = %e, "push accept failed"),
            }
        }
    }
}

pub async fn accept_pull(
    listener: TcpListener,
    service: Arc<PipelineService>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let service = Arc::clone(&service);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_pull(service, stream, &shutdown).await {
                            warn!(%peer, error = %e, "pull request failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "pull accept failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_db::MemoryCatalog;
    use preview_cache::{ImageTranscoder, MemoryArtifactStore, PreviewConfig};
    use render_pipeline::PipelineConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_pull_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"original bytes").unwrap();
        let catalog = MemoryCatalog::new();
        catalog.insert("a", "root", &path);

        let service = PipelineService::start(
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(catalog),
            Arc::new(ImageTranscoder::new()),
            PreviewConfig::default(),
            PipelineConfig {
                workers: Some(1),
                ..PipelineConfig::default()
            },
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let acceptor = tokio::spawn(accept_pull(listener, Arc::clone(&service), shutdown.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"{\"fileId\": \"a\", \"size\": 0}\n")
            .await
            .unwrap();
        let mut body = Vec::new();
        client.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"original bytes");

        shutdown.cancel();
        acceptor.await.unwrap();
        service.shutdown().await;
    }
}
