//! canload command line entry point.

mod commands;
mod config;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use commands::{ServeOptions, TransferOptions};
use config::{CliConfig, DEFAULT_PORT, TransferFlags};

/// Chunked file transfers to and from a remote compute service.
#[derive(Parser)]
#[command(name = "canload")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/canload/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Caller identity sent with every request.
    #[arg(long, global = true)]
    identity: Option<String>,

    /// More logging (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct TargetArgs {
    /// Configured target name, ws:// URL or local:DIR.
    #[arg(long)]
    target: Option<String>,

    /// Use the per-caller prompt-cache namespace.
    #[arg(long)]
    prompt_cache: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a local file, then load it as a model when it is one.
    ///
    /// Empty files are refused with an error and nothing is created on the
    /// remote.
    Upload {
        local: PathBuf,
        /// Name on the remote (default: the local file name).
        #[arg(long)]
        remote_name: Option<String>,
        /// Bytes per chunk.
        #[arg(long)]
        chunksize: Option<u64>,
        #[command(flatten)]
        target: TargetArgs,
        /// Skip model activation after the upload.
        #[arg(long)]
        no_activate: bool,
        /// Compare the local SHA-256 with the remote record afterwards.
        #[arg(long)]
        verify: bool,
        /// Resume from a saved checkpoint when one matches.
        #[arg(long)]
        resume: bool,
    },

    /// Download a remote file.
    Download {
        remote: String,
        /// Destination (default: the remote file name in the current directory).
        #[arg(long)]
        local_path: Option<PathBuf>,
        #[arg(long)]
        chunksize: Option<u64>,
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        verify: bool,
        #[arg(long)]
        resume: bool,
    },

    /// Show the stored size and SHA-256 of a remote file.
    Details {
        remote: String,
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Serve a store directory over WebSocket.
    Serve {
        /// Store directory.
        #[arg(long)]
        root: PathBuf,
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
        host: IpAddr,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Requests served at once before answering busy.
        #[arg(long, default_value_t = 8)]
        max_in_flight: usize,
        /// Caller allowed to write files and load models (repeatable).
        #[arg(long = "admin")]
        admins: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = CliConfig::load(cli.config.as_deref())?;
    let identity = cli.identity.or_else(|| config.identity.clone());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, stopping");
            on_signal.cancel();
        }
    });

    match cli.command {
        Command::Upload {
            local,
            remote_name,
            chunksize,
            target,
            no_activate,
            verify,
            resume,
        } => {
            let opts = TransferOptions {
                target: target.target,
                chunksize,
                flags: TransferFlags {
                    prompt_cache: target.prompt_cache,
                    no_activate,
                    verify,
                    resume,
                },
            };
            commands::upload(&config, identity, &local, remote_name, opts, cancel).await
        }
        Command::Download {
            remote,
            local_path,
            chunksize,
            target,
            verify,
            resume,
        } => {
            let opts = TransferOptions {
                target: target.target,
                chunksize,
                flags: TransferFlags {
                    prompt_cache: target.prompt_cache,
                    verify,
                    resume,
                    ..Default::default()
                },
            };
            commands::download(&config, identity, &remote, local_path, opts, cancel).await
        }
        Command::Details { remote, target } => {
            commands::details(
                &config,
                identity,
                &remote,
                target.target.as_deref(),
                target.prompt_cache,
                cancel,
            )
            .await
        }
        Command::Serve {
            root,
            host,
            port,
            max_in_flight,
            admins,
        } => {
            let opts = ServeOptions {
                root,
                host,
                port,
                max_in_flight,
                admins,
            };
            commands::serve(opts, cancel).await
        }
    }
}
