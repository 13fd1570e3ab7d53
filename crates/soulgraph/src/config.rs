use crate::crdt::DEFAULT_FUTURE_GRACE_MS;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const HOUR_MS: u64 = 60 * 60 * 1000;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Node configuration. Every section has defaults, so an empty source is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub crdt: CrdtConfig,
    #[serde(default)]
    pub federation: FederationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub http_addr: String,
    pub db_path: PathBuf,
    pub sse_keepalive_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "soulgraph".to_string(),
            http_addr: "127.0.0.1:8765".to_string(),
            db_path: PathBuf::from("./data/soulgraph.db"),
            sse_keepalive_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub sqlite_cache_size: i32,
    pub sqlite_busy_timeout: i32,
    pub pool_size: u32,
    /// Nodes with more fields than this are stored one row per field.
    pub wide_node_threshold: usize,
    pub max_put_attempts: u32,
    pub compress: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_cache_size: 10000,
            sqlite_busy_timeout: 5000,
            pool_size: 5,
            wide_node_threshold: 1100,
            max_put_attempts: 64,
            compress: false,
        }
    }
}

impl StorageConfig {
    /// Page size of ranged reads over wide nodes.
    pub fn get_max_keys(&self) -> usize {
        self.wide_node_threshold + 10
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrdtConfig {
    pub future_grace_ms: i64,
}

impl Default for CrdtConfig {
    fn default() -> Self {
        Self {
            future_grace_ms: DEFAULT_FUTURE_GRACE_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub peers_file: PathBuf,
    pub sync_interval_ms: u64,
    pub back_sync_ms: u64,
    pub max_staleness_ms: u64,
    pub batch_interval_ms: u64,
    pub prune_interval_ms: u64,
    pub changelog_retention_ms: u64,
    pub maintain_changelog: bool,
    pub put_to_peers: bool,
    pub peer_timeout_ms: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            peers_file: PathBuf::from("./peers.yaml"),
            sync_interval_ms: 1000,
            back_sync_ms: DAY_MS,
            max_staleness_ms: DAY_MS,
            batch_interval_ms: 500,
            prune_interval_ms: HOUR_MS,
            changelog_retention_ms: DAY_MS,
            maintain_changelog: true,
            put_to_peers: true,
            peer_timeout_ms: 30_000,
        }
    }
}

impl Config {
    /// Load from an optional file, then apply `SOULGRAPH_*` environment overrides.
    ///
    /// Sections are separated by `__`, e.g. `SOULGRAPH_FEDERATION__BATCH_INTERVAL_MS`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("SOULGRAPH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

/// Read the YAML list of peer base URLs. A missing file means no peers.
pub fn load_peers(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        debug!("No peers file at {:?}", path);
        return Ok(Vec::new());
    }

    let text = std::fs::read_to_string(path)?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let peers: Option<Vec<String>> = serde_yaml::from_str(&text)?;
    let peers: Vec<String> = peers
        .unwrap_or_default()
        .into_iter()
        .map(|p| p.trim_end_matches('/').to_string())
        .filter(|p| !p.is_empty())
        .collect();

    info!("Loaded {} peers from {:?}", peers.len(), path);
    Ok(peers)
}
