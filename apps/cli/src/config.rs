//! CLI configuration.
//!
//! Read from `--config FILE` or `~/.config/canload/config.toml`. A missing
//! default file means built-in defaults; command line flags override both.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use canload_client::{ActivationConfig, TransferConfig};
use canload_protocol::Namespace;
use canload_protocol::constants::DEFAULT_CHUNK_SIZE;
use canload_transfer::{CheckpointStore, RetryPolicy};

/// Port used by `serve` and by the fallback target.
pub const DEFAULT_PORT: u16 = 8765;

/// Retry settings as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            delay_ms: policy.delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Caller identity sent with every request.
    pub identity: Option<String>,
    /// Target used when `--target` is not given.
    pub default_target: Option<String>,
    /// Named targets: name to WebSocket URL.
    pub targets: BTreeMap<String, String>,
    pub chunksize: u64,
    pub retry: RetrySettings,
    pub retry_downloads: bool,
    pub activation_suffixes: Vec<String>,
    /// Where resume checkpoints are kept.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            identity: None,
            default_target: None,
            targets: BTreeMap::new(),
            chunksize: DEFAULT_CHUNK_SIZE,
            retry: RetrySettings::default(),
            retry_downloads: true,
            activation_suffixes: ActivationConfig::default().suffixes,
            checkpoint_dir: None,
        }
    }
}

/// Where a command sends its requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A store server reachable over WebSocket.
    Remote(String),
    /// A store directory opened in this process.
    Local(PathBuf),
}

/// Transfer options taken from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferFlags {
    pub prompt_cache: bool,
    pub no_activate: bool,
    pub verify: bool,
    pub resume: bool,
}

impl CliConfig {
    /// Loads `path`, or the default config file when `path` is `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: CliConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Resolves `--target` (or the configured default) to an endpoint.
    ///
    /// Accepts a configured target name, a `ws://`/`wss://` URL or
    /// `local:DIR` for an in-process store.
    pub fn resolve_target(&self, target: Option<&str>) -> anyhow::Result<Target> {
        let Some(target) = target.or(self.default_target.as_deref()) else {
            return Ok(Target::Remote(format!("ws://127.0.0.1:{DEFAULT_PORT}")));
        };

        if let Some(url) = self.targets.get(target) {
            return Ok(Target::Remote(url.clone()));
        }
        if target.starts_with("ws://") || target.starts_with("wss://") {
            return Ok(Target::Remote(target.to_string()));
        }
        if let Some(dir) = target.strip_prefix("local:") {
            if dir.is_empty() {
                bail!("local target needs a directory: local:DIR");
            }
            return Ok(Target::Local(PathBuf::from(dir)));
        }
        bail!("unknown target {target:?}: not a configured name, ws:// URL or local:DIR")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            delay: Duration::from_millis(self.retry.delay_ms),
        }
    }

    /// Builds the driver configuration for one command.
    pub fn transfer_config(&self, flags: TransferFlags) -> anyhow::Result<TransferConfig> {
        let checkpoints = if flags.resume {
            let dir = match &self.checkpoint_dir {
                Some(dir) => dir.clone(),
                None => default_checkpoint_dir()
                    .context("cannot locate a checkpoint directory; set checkpoint_dir")?,
            };
            Some(CheckpointStore::new(dir))
        } else {
            None
        };

        Ok(TransferConfig {
            retry: self.retry_policy(),
            retry_downloads: self.retry_downloads,
            activation: ActivationConfig {
                enabled: !flags.no_activate,
                suffixes: self.activation_suffixes.clone(),
            },
            verify_hash: flags.verify,
            namespace: if flags.prompt_cache {
                Namespace::PromptCache
            } else {
                Namespace::Files
            },
            checkpoints,
        })
    }
}

fn config_base_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config"))
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    config_base_dir().map(|d| d.join("canload").join("config.toml"))
}

fn default_checkpoint_dir() -> Option<PathBuf> {
    config_base_dir().map(|d| d.join("canload").join("checkpoints"))
}
