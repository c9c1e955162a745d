//! Subcommand implementations.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use canload_client::{
    DownloadDriver, LocalEndpoint, TransferEndpoint, TransferEvent, UploadDriver, WsEndpoint,
    check_destination, check_health, check_source,
};
use canload_protocol::messages::FileDetailsRequest;
use canload_protocol::Namespace;
use canload_server::{ServerConfig, StoreHandler, StoreServer};
use canload_store::{Store, StoreConfig};

use crate::config::{CliConfig, Target, TransferFlags};

/// Options shared by `upload` and `download`.
pub struct TransferOptions {
    pub target: Option<String>,
    pub chunksize: Option<u64>,
    pub flags: TransferFlags,
}

/// Opens the endpoint a command talks to.
fn open_endpoint(
    config: &CliConfig,
    target: Option<&str>,
    identity: Option<String>,
) -> anyhow::Result<Box<dyn TransferEndpoint>> {
    match config.resolve_target(target)? {
        Target::Remote(url) => Ok(Box::new(WsEndpoint::new(url, identity))),
        Target::Local(root) => {
            let store = Store::open(StoreConfig {
                root: root.clone(),
                admins: Vec::new(),
            })
            .with_context(|| format!("failed to open store at {}", root.display()))?;
            Ok(Box::new(LocalEndpoint::new(Arc::new(store), identity)))
        }
    }
}

/// Logs driver events until the driver drops its sender.
fn spawn_reporter() -> (mpsc::Sender<TransferEvent>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<TransferEvent>(64);
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                TransferEvent::Started {
                    name,
                    direction,
                    total,
                    resume_from,
                } => info!(%name, %direction, ?total, resume_from, "started"),
                TransferEvent::Progress {
                    name,
                    offset,
                    total,
                    bytes_per_second,
                    ..
                } => {
                    let percent = total
                        .filter(|t| *t > 0)
                        .map(|t| offset as f64 * 100.0 / t as f64);
                    info!(
                        %name,
                        offset,
                        ?total,
                        percent = percent.map(|p| format!("{p:.1}")),
                        kib_per_sec = format!("{:.1}", bytes_per_second / 1024.0),
                        "progress"
                    );
                }
                TransferEvent::Activating { name } => info!(%name, "loading model"),
                TransferEvent::Completed { .. } | TransferEvent::Failed { .. } => {}
            }
        }
    });
    (tx, handle)
}

fn remote_name_for(local: &Path, remote_name: Option<String>) -> anyhow::Result<String> {
    match remote_name {
        Some(name) => Ok(name),
        None => local
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("cannot derive a remote name from {}", local.display())),
    }
}

fn local_path_for(remote_name: &str, local_path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match local_path {
        Some(path) => Ok(path),
        None => Path::new(remote_name)
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("cannot derive a local path from {remote_name:?}")),
    }
}

pub async fn upload(
    config: &CliConfig,
    identity: Option<String>,
    local: &Path,
    remote_name: Option<String>,
    opts: TransferOptions,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let remote_name = remote_name_for(local, remote_name)?;
    // Local problems are reported before the remote is contacted.
    check_source(local).await?;
    let endpoint = open_endpoint(config, opts.target.as_deref(), identity)?;
    let transfer = config.transfer_config(opts.flags)?;
    let chunksize = opts.chunksize.unwrap_or(config.chunksize);

    check_health(endpoint.as_ref(), &transfer.retry, &cancel).await?;

    let (tx, reporter) = spawn_reporter();
    let driver = UploadDriver::new(endpoint.as_ref(), &transfer, cancel).with_events(tx);
    let result = driver.upload(local, &remote_name, chunksize).await;
    drop(driver);
    let _ = reporter.await;

    let record = result?;
    println!(
        "{}  {} bytes  sha256 {}",
        record.filename, record.filesize, record.filesha256
    );
    Ok(())
}

pub async fn download(
    config: &CliConfig,
    identity: Option<String>,
    remote_name: &str,
    local_path: Option<PathBuf>,
    opts: TransferOptions,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let local_path = local_path_for(remote_name, local_path)?;
    check_destination(&local_path).await?;
    let endpoint = open_endpoint(config, opts.target.as_deref(), identity)?;
    let transfer = config.transfer_config(opts.flags)?;
    let chunksize = opts.chunksize.unwrap_or(config.chunksize);

    check_health(endpoint.as_ref(), &transfer.retry, &cancel).await?;

    let (tx, reporter) = spawn_reporter();
    let driver = DownloadDriver::new(endpoint.as_ref(), &transfer, cancel).with_events(tx);
    let result = driver.download(remote_name, &local_path, chunksize).await;
    drop(driver);
    let _ = reporter.await;

    let summary = result?;
    match &summary.filesha256 {
        Some(sha) => println!(
            "{}  {} bytes  sha256 {sha}",
            summary.local_path.display(),
            summary.bytes
        ),
        None => println!("{}  {} bytes", summary.local_path.display(), summary.bytes),
    }
    Ok(())
}

pub async fn details(
    config: &CliConfig,
    identity: Option<String>,
    remote_name: &str,
    target: Option<&str>,
    prompt_cache: bool,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let endpoint = open_endpoint(config, target, identity)?;
    let req = FileDetailsRequest {
        filename: remote_name.to_string(),
        namespace: if prompt_cache {
            Namespace::PromptCache
        } else {
            Namespace::Files
        },
    };
    let record = config
        .retry_policy()
        .call("uploaded_file_details", &cancel, || {
            endpoint.uploaded_file_details(&req)
        })
        .await?
        .map_err(|e| anyhow!("uploaded_file_details of {remote_name} refused: {e}"))?;

    println!(
        "{}  {} bytes  sha256 {}",
        record.filename, record.filesize, record.filesha256
    );
    Ok(())
}

pub struct ServeOptions {
    pub root: PathBuf,
    pub host: IpAddr,
    pub port: u16,
    pub max_in_flight: usize,
    pub admins: Vec<String>,
}

pub async fn serve(opts: ServeOptions, cancel: CancellationToken) -> anyhow::Result<()> {
    let store = Store::open(StoreConfig {
        root: opts.root.clone(),
        admins: opts.admins,
    })
    .with_context(|| format!("failed to open store at {}", opts.root.display()))?;

    let server = StoreServer::new(
        ServerConfig {
            host: opts.host,
            port: opts.port,
            max_in_flight: opts.max_in_flight,
        },
        StoreHandler::new(Arc::new(store)),
    );

    let shutdown = Arc::clone(&server);
    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown.shutdown();
    });

    server.run().await?;
    Ok(())
}
