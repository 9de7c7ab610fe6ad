use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::archive::DEFAULT_INLINE_THRESHOLD;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Largest request body accepted, in bytes.  Uploaded archives arrive as
    /// the raw request body, so this bounds the archive size as well.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_body_bytes() -> usize {
    50 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Upstream (GitHub)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Full URL to the GitHub API root (e.g. `https://api.github.com` or
    /// `https://ghe.corp.example.com/api/v3`).
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// `User-Agent` sent with every API call.  GitHub rejects requests
    /// without one.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Per-call timeout in seconds.  Expiry surfaces as a remote error.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_user_agent() -> String {
    concat!("forgepush/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_request_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Archive extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Files smaller than this are listed with their text content.
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            inline_threshold: default_inline_threshold(),
        }
    }
}

fn default_inline_threshold() -> usize {
    DEFAULT_INLINE_THRESHOLD
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    /// Branch used when a push request names none.
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Upper bound on blob uploads in flight for a single push.
    #[serde(default = "default_max_concurrent_blob_uploads")]
    pub max_concurrent_blob_uploads: usize,
    /// When `true`, only "branch not found" answers (404 / 409) during the
    /// initial branch lookup are read as "first push"; any other failure
    /// aborts the push.  When `false` (the default), every lookup failure is
    /// read as "first push".
    #[serde(default)]
    pub strict_branch_lookup: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            default_branch: default_branch(),
            max_concurrent_blob_uploads: default_max_concurrent_blob_uploads(),
            strict_branch_lookup: false,
        }
    }
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_max_concurrent_blob_uploads() -> usize {
    16
}

fn bool_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local maps; records vanish on restart.
    #[default]
    Memory,
    /// KeyDB / Redis.
    Keydb,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Required when `backend` is `keydb`.
    pub keydb: Option<KeyDbConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default = "bool_true")]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Parse and validate YAML config text.
pub fn parse_config(contents: &str) -> Result<Config> {
    // An empty document deserialises to unit, not to an empty mapping.
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents).context("invalid YAML")?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.upstream.api_url.starts_with("http://")
            || config.upstream.api_url.starts_with("https://"),
        "upstream.api_url must be an http(s) URL"
    );
    anyhow::ensure!(
        config.upstream.request_timeout_secs > 0,
        "upstream.request_timeout_secs must be greater than 0"
    );
    anyhow::ensure!(
        !config.publish.default_branch.trim().is_empty(),
        "publish.default_branch must not be empty"
    );
    anyhow::ensure!(
        config.publish.max_concurrent_blob_uploads > 0,
        "publish.max_concurrent_blob_uploads must be greater than 0"
    );
    anyhow::ensure!(
        config.server.max_body_bytes > 0,
        "server.max_body_bytes must be greater than 0"
    );
    if config.store.backend == StoreBackend::Keydb {
        anyhow::ensure!(
            config.store.keydb.is_some(),
            "store.keydb must be set when store.backend is keydb"
        );
    }
    Ok(())
}
