//! ProjectLoupe preview server
//!
//! Serves rendered previews to the web client over a persistent push channel
//! and a one-shot pull channel.

use anyhow::{Context, Result};
use catalog_db::{Catalog, SqliteCatalog};
use clap::{Parser, Subcommand};
use preview_cache::{ArtifactStore, DiskArtifactStore, ImageTranscoder, MemoryArtifactStore};
use render_pipeline::PipelineService;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod config;
mod library;
mod logging;
mod server;

use config::ServerConfig;

#[derive(Parser)]
#[command(name = "loupe-server")]
#[command(about = "Preview rendering server for ProjectLoupe")]
struct Cli {
    /// Config file (default: ~/.projectloupe/server.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Catalog database (default: ~/.projectloupe/catalog.db)
    #[arg(long, global = true, value_name = "FILE")]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the preview server (default)
    Serve {
        /// Address for push connections
        #[arg(long)]
        push_addr: Option<String>,
        /// Address for pull requests
        #[arg(long)]
        pull_addr: Option<String>,
        /// Keep previews in memory only
        #[arg(long)]
        memory_only: bool,
    },
    /// Register the images under a folder in the catalog
    Register {
        /// Library folder to scan
        #[arg(long)]
        root: PathBuf,
        /// Root id (default: the folder name)
        #[arg(long)]
        id: Option<String>,
    },
    /// Print catalog statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(ServerConfig::default_path);
    let mut config = match &config_path {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(catalog) = cli.catalog {
        config.catalog_path = Some(catalog);
    }

    logging::init_logging(&config.log_level);

    match cli.command.unwrap_or(Commands::Serve {
        push_addr: None,
        pull_addr: None,
        memory_only: false,
    }) {
        Commands::Serve {
            push_addr,
            pull_addr,
            memory_only,
        } => {
            if let Some(addr) = push_addr {
                config.push_addr = addr;
            }
            if let Some(addr) = pull_addr {
                config.pull_addr = addr;
            }
            config.memory_only |= memory_only;
            serve(config).await
        }
        Commands::Register { root, id } => {
            let catalog = open_catalog(&config)?;
            let count = library::register_root(&catalog, &root, id.as_deref())?;
            println!("Registered {} files from {}", count, root.display());
            Ok(())
        }
        Commands::Stats => {
            let catalog = open_catalog(&config)?;
            println!("Catalog: {}", catalog.path().display());
            println!("  Files:  {}", catalog.file_count()?);
            println!("  Hashed: {}", catalog.hashed_count()?);
            Ok(())
        }
    }
}

fn open_catalog(config: &ServerConfig) -> Result<SqliteCatalog> {
    match &config.catalog_path {
        Some(path) => SqliteCatalog::open_at(path),
        None => SqliteCatalog::open_default(),
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    let catalog: Arc<dyn Catalog> = Arc::new(open_catalog(&config)?);
    let store: Arc<dyn ArtifactStore> = if config.memory_only {
        info!("keeping previews in memory only");
        Arc::new(MemoryArtifactStore::new())
    } else {
        let store = DiskArtifactStore::open(&config.preview)?;
        info!(dir = %store.root().display(), "preview cache opened");
        Arc::new(store)
    };

    let push = TcpListener::bind(&config.push_addr)
        .await
        .with_context(|| format!("Failed to bind push address {}", config.push_addr))?;
    let pull = TcpListener::bind(&config.pull_addr)
        .await
        .with_context(|| format!("Failed to bind pull address {}", config.pull_addr))?;

    let service = PipelineService::start(
        store,
        catalog,
        Arc::new(ImageTranscoder::new()),
        config.preview.clone(),
        config.pipeline.clone(),
    );
    info!(
        push = %config.push_addr,
        pull = %config.pull_addr,
        workers = service.stats().workers,
        "preview server listening"
    );

    let shutdown = CancellationToken::new();
    let push_task = tokio::spawn(server::accept_push(
        push,
        Arc::clone(&service),
        shutdown.clone(),
    ));
    let pull_task = tokio::spawn(server::accept_pull(
        pull,
        Arc::clone(&service),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    shutdown.cancel();
    let _ = push_task.await;
    let _ = pull_task.await;
    service.shutdown().await;

    let stats = service.stats();
    info!(
        push_clients = stats.push_clients,
        memory_hints = stats.memory_hints,
        "preview server stopped"
    );
    Ok(())
}
