use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub extractors: ExtractorsConfig,
}

/// Wiki source credentials and endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Site base URL, e.g. `https://acme.atlassian.net`. A trailing `/wiki`
    /// is tolerated and stripped.
    pub base_url: String,
    pub email: String,
    /// API token; falls back to the `SOURCE_API_TOKEN` environment variable
    /// when omitted from the file.
    #[serde(default)]
    pub api_token: Option<String>,
}

/// Knowledge-base destination credentials and endpoint.
///
/// The API key is an explicit configuration value handed to the gateway
/// constructor — one gateway instance per process, no module-level secret.
#[derive(Debug, Deserialize, Clone)]
pub struct DestinationConfig {
    /// API root, e.g. `http://kb.internal:6860/v1`.
    pub base_url: String,
    /// Dataset-scoped API key; falls back to `DEST_API_KEY` when omitted.
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Listing page size for source pagination.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Retry attempts for transient destination failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Upper bound on in-flight attachment transfers.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Directory holding per-collection state files.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            max_concurrency: default_max_concurrency(),
            state_dir: default_state_dir(),
        }
    }
}

fn default_page_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    4
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_concurrency() -> usize {
    4
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

/// Optional external extractor endpoints.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExtractorsConfig {
    /// OpenAI-compatible vision endpoint used to describe image attachments.
    /// When absent, image attachments are skipped with a notice.
    pub image: Option<ImageExtractorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImageExtractorConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_image_max_tokens")]
    pub max_tokens: u32,
}

fn default_image_max_tokens() -> u32 {
    1024
}

impl SourceConfig {
    /// Site root with any trailing slash or `/wiki` suffix removed.
    pub fn site_root(&self) -> String {
        let trimmed = self.base_url.trim_end_matches('/');
        trimmed.strip_suffix("/wiki").unwrap_or(trimmed).to_string()
    }

    /// Short host prefix used in collection names, e.g. `"acme"` for
    /// `https://acme.atlassian.net`.
    pub fn host_prefix(&self) -> String {
        let root = self.site_root();
        let host = root
            .strip_prefix("https://")
            .or_else(|| root.strip_prefix("http://"))
            .unwrap_or(&root);
        host.split('.').next().unwrap_or(host).to_string()
    }

    pub fn resolved_api_token(&self) -> Result<String> {
        resolve_secret(self.api_token.as_deref(), "SOURCE_API_TOKEN")
            .context("source.api_token not set (config or SOURCE_API_TOKEN)")
    }
}

impl DestinationConfig {
    pub fn resolved_api_key(&self) -> Result<String> {
        resolve_secret(self.api_key.as_deref(), "DEST_API_KEY")
            .context("destination.api_key not set (config or DEST_API_KEY)")
    }
}

fn resolve_secret(inline: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(value) = inline {
        if !value.is_empty() {
            return Ok(value.to_string());
        }
    }
    Ok(std::env::var(env_var)?)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.source.base_url.trim().is_empty() {
        anyhow::bail!("source.base_url must not be empty");
    }
    if config.destination.base_url.trim().is_empty() {
        anyhow::bail!("destination.base_url must not be empty");
    }
    if config.sync.page_size == 0 {
        anyhow::bail!("sync.page_size must be > 0");
    }
    if config.sync.max_concurrency == 0 {
        anyhow::bail!("sync.max_concurrency must be >= 1");
    }

    Ok(config)
}
