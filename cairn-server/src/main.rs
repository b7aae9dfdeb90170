mod config;

use anyhow::{Context, bail};
use cairn_core::{
    BlobStore, Client, DownloadFileOperationOutcome, DownloadFileOperationRequest, FileSink,
    FsBlobStore, InMemoryMemberRegistry, NodeRole, NodeService, NodeServiceConfig,
    QueryFileOperationOutcome, UploadFileOperationRequest, spawn_heartbeat,
};
use clap::{Parser, Subcommand};
use crate::config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "cairn")]
#[command(about = "Tracker/storage distributed file store")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "cairn.yaml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a storage or tracker node
    Node,
    /// Upload a local file and print its storage path
    Upload {
        file: PathBuf,
        /// Only store into this group
        #[arg(short, long, default_value = "")]
        group: String,
        /// Upload even if a tracker already knows the content
        #[arg(long)]
        skip_check: bool,
    },
    /// Download a stored file
    Download {
        path: String,
        out: PathBuf,
        #[arg(long, default_value_t = 0)]
        start: u64,
        /// Bytes to read, 0 for the rest of the file
        #[arg(long, default_value_t = 0)]
        length: u64,
        /// Try the instance named in the path first
        #[arg(long)]
        from_source: bool,
    },
    /// Ask the trackers about a storage path or content hash
    Query { target: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cairn=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let cfg = match Config::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Node => run_node(cfg).await,
        Commands::Upload {
            file,
            group,
            skip_check,
        } => run_upload(cfg, file, group, skip_check).await,
        Commands::Download {
            path,
            out,
            start,
            length,
            from_source,
        } => run_download(cfg, path, out, start, length, from_source).await,
        Commands::Query { target } => run_query(cfg, target).await,
    };

    if let Err(error) = result {
        tracing::error!("{:#}", error);
        std::process::exit(1);
    }
}

async fn run_node(cfg: Config) -> anyhow::Result<()> {
    let node = cfg
        .node
        .clone()
        .context("config has no `node` section")?;
    tracing::info!(
        "Starting {:?} node group={} instance={} data_dir={}",
        node.role,
        node.group,
        node.instance,
        node.data_dir.display()
    );

    let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(
        node.data_dir.clone(),
        &node.group,
        &node.instance,
    )?);
    let stored = store.list().await.context("listing stored files")?;
    let registry = Arc::new(InMemoryMemberRegistry::with_members(cfg.members.clone()));

    let service = NodeService::bind(
        NodeServiceConfig {
            bind_addr: node.bind_addr.clone(),
            descriptor: node.descriptor()?,
            role: node.role,
            secret: cfg.client.secret.clone(),
            expiry_interval: node.expiry_interval(),
        },
        store,
        registry,
    )
    .await?;

    let heartbeat = match node.role {
        NodeRole::Storage if !cfg.client.trackers.is_empty() => {
            // Trackers learn about files already on disk with the first heartbeat.
            let reports = service.file_reports();
            tracing::info!("reporting {} stored files to trackers", stored.len());
            reports.extend(stored);
            Some(spawn_heartbeat(
                service.descriptor().clone(),
                cfg.client.trackers.clone(),
                cfg.client.secret.clone(),
                node.heartbeat_interval(),
                reports,
            ))
        }
        _ => None,
    };

    let served = service.serve().await;
    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }
    served?;
    Ok(())
}

/// A static `members` list wins; otherwise storage members are synced from the trackers.
fn new_client(cfg: &Config) -> Client {
    if cfg.members.is_empty() && !cfg.client.trackers.is_empty() {
        return Client::with_tracker_members(cfg.client.clone());
    }
    let registry = Arc::new(InMemoryMemberRegistry::with_members(cfg.members.clone()));
    Client::new(cfg.client.clone(), registry)
}

async fn run_upload(
    cfg: Config,
    file: PathBuf,
    group: String,
    skip_check: bool,
) -> anyhow::Result<()> {
    let client = new_client(&cfg);
    let outcome = client
        .upload(UploadFileOperationRequest {
            local_path: file.clone(),
            group,
            skip_dedup_check: skip_check || cfg.client.skip_dedup_check,
        })
        .await
        .with_context(|| format!("uploading {}", file.display()))?;

    if outcome.deduplicated {
        tracing::info!("content already stored, nothing sent");
    }
    println!("{}", outcome.path);
    Ok(())
}

async fn run_download(
    cfg: Config,
    path: String,
    out: PathBuf,
    start: u64,
    length: u64,
    from_source: bool,
) -> anyhow::Result<()> {
    let client = new_client(&cfg);
    let mut sink = FileSink::new(&out);
    let outcome = client
        .download(
            DownloadFileOperationRequest {
                path: path.clone(),
                start,
                length,
                from_source,
            },
            &mut sink,
        )
        .await
        .with_context(|| format!("downloading {}", path))?;

    match outcome {
        DownloadFileOperationOutcome::Downloaded {
            server_uuid, bytes, ..
        } => {
            tracing::info!(
                "saved {} bytes from {} to {}",
                bytes,
                server_uuid,
                out.display()
            );
            Ok(())
        }
        DownloadFileOperationOutcome::NotFound { server_uuid, .. } => {
            bail!("{} not found on {}", path, server_uuid)
        }
    }
}

async fn run_query(cfg: Config, target: String) -> anyhow::Result<()> {
    let client = new_client(&cfg);
    match client.query_file(&target).await? {
        QueryFileOperationOutcome::Found { file, tracker_uuid } => {
            tracing::debug!("answered by tracker {}", tracker_uuid);
            println!("{}", serde_json::to_string_pretty(&file)?);
            Ok(())
        }
        QueryFileOperationOutcome::NotFound => bail!("{} is not known to any tracker", target),
    }
}
