//! Application configuration.
//!
//! Loaded from a TOML file with environment overrides (`CHATRUN_` prefix,
//! `__` path separator). A default config file is written on first run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Project registry: id -> settings. Only listed projects can be run.
    #[serde(default)]
    pub projects: HashMap<String, ProjectConfig>,
    #[serde(default)]
    pub exec: ExecConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8990,
        }
    }
}

/// Run store settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database. Defaults to the platform data dir.
    pub path: Option<String>,
}

impl DatabaseConfig {
    /// Resolve the database path, expanding `~` and env vars.
    pub fn resolve_path(&self) -> Result<PathBuf> {
        if let Some(ref raw) = self.path {
            let expanded = shellexpand::full(raw)
                .with_context(|| format!("expanding database path {raw}"))?;
            return Ok(PathBuf::from(expanded.as_ref()));
        }
        let base = dirs::data_local_dir()
            .context("could not determine platform data directory")?;
        Ok(base.join("chatrun").join("runs.db"))
    }
}

/// Chat gateway (transport collaborator) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL of the gateway HTTP API.
    pub base_url: String,
    /// Bearer token sent with every gateway request.
    pub token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8991".to_string(),
            token: None,
        }
    }
}

/// Allowlist authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// User ids permitted to enqueue runs. Empty list rejects everyone
    /// unless `open` is set.
    #[serde(default)]
    pub allowed_users: Vec<String>,
    /// Disable the allowlist entirely (development only).
    #[serde(default)]
    pub open: bool,
}

/// A single registered project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Working directory commands run in. Must exist.
    pub path: String,
}

/// Execution pipeline tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Maximum non-cancelled queue entries per conversation.
    pub queue_capacity: usize,
    /// Seconds an idle consumer waits for work before retiring.
    pub dequeue_wait_secs: u64,
    /// Overall run deadline in seconds.
    pub run_timeout_secs: u64,
    /// Seconds to wait for a prompt response before cancelling the run.
    pub prompt_timeout_secs: u64,
    /// Minimum seconds between visible output updates per run.
    pub publish_interval_secs: u64,
    /// Transport per-message size limit in bytes.
    pub message_limit: usize,
    /// Output buffer cap in bytes; oldest content is evicted first.
    pub output_buffer_cap: usize,
    /// Byte cap for the persisted result text (newest content kept).
    pub result_cap: usize,
    /// Runs retained per conversation by the pruning task.
    pub keep_runs: u32,
    /// Seconds between pruning passes.
    pub prune_interval_secs: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            dequeue_wait_secs: 300,
            run_timeout_secs: 600,
            prompt_timeout_secs: 300,
            publish_interval_secs: 2,
            message_limit: 4000,
            output_buffer_cap: 64 * 1024,
            result_cap: 4000,
            keep_runs: 100,
            prune_interval_secs: 3600,
        }
    }
}

/// Default config file location.
pub fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("could not determine platform config directory")?;
    Ok(base.join("chatrun").join("config.toml"))
}

/// Load configuration from the given file (or the default location),
/// layering environment overrides on top.
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let config_file = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    let built = Config::builder()
        .add_source(
            File::from(config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix("CHATRUN").separator("__"))
        .build()
        .context("building configuration")?;

    let config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;

    Ok(config)
}

/// Write a default config file if none exists.
pub fn write_default(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }
    let rendered = toml::to_string_pretty(&AppConfig::default())
        .context("serializing default configuration")?;
    std::fs::write(path, rendered)
        .with_context(|| format!("writing default config to {}", path.display()))?;
    Ok(())
}
