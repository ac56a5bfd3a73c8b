//! Layered configuration for the knowledge base.
//!
//! Sources, lowest priority first:
//! - built-in defaults
//! - `.bugscout/settings.toml`, searched upward from the current directory
//! - environment variables
//!
//! # Environment Variables
//!
//! Environment variables are prefixed with `BUGSCOUT_` and use double
//! underscores to separate nested levels:
//! - `BUGSCOUT_VECTOR__N_TREES=20` sets `vector.n_trees`
//! - `BUGSCOUT_STAGING__BATCH_THRESHOLD=128` sets `staging.batch_threshold`
//! - `BUGSCOUT_DEBUG=true` sets `debug`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{KbError, KbResult};
use crate::search::GroupWeights;
use crate::storage::RetryPolicy;
use crate::vector::{DEFAULT_LEAF_SIZE, DEFAULT_SEED, Metric, VECTOR_DIMENSION_384, VectorDimension};

const CONFIG_DIR: &str = ".bugscout";
const CONFIG_FILE: &str = "settings.toml";
const ENV_PREFIX: &str = "BUGSCOUT_";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory holding the facet indices and metadata.json
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Workspace root directory (where .bugscout is located)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,

    /// Global debug mode
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub vector: VectorConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub staging: StagingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct VectorConfig {
    /// Embedding dimension every facet vector must have
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Distance metric: angular (cosine), euclidean or manhattan
    #[serde(default = "default_metric")]
    pub metric: String,

    /// Trees per facet forest
    #[serde(default = "default_n_trees")]
    pub n_trees: usize,

    #[serde(default = "default_leaf_size")]
    pub leaf_size: usize,

    /// Seed for tree construction
    #[serde(default = "default_seed")]
    pub seed: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SearchConfig {
    #[serde(default = "default_results")]
    pub default_results: usize,

    /// Lower bound on neighbours fetched per facet
    #[serde(default = "default_min_candidates")]
    pub min_candidates: usize,

    /// Neighbours fetched per facet as a multiple of the result count
    #[serde(default = "default_oversample")]
    pub oversample: usize,

    /// Similarity at or above which a hit counts as a duplicate
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Group weights of the mixed profile
    #[serde(default)]
    pub mixed_weights: GroupWeights,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Where model files are cached; the user cache directory when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageConfig {
    /// Scratch directory for staged writes, relative to data_dir
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    #[serde(default = "default_swap_retries")]
    pub swap_retries: u32,

    #[serde(default = "default_swap_backoff_ms")]
    pub swap_backoff_ms: u64,

    /// Start empty instead of failing when metadata.json cannot be parsed
    #[serde(default)]
    pub recover_corrupt_metadata: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StagingConfig {
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_version() -> u32 {
    1
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".bugscout/data")
}
fn default_dimension() -> usize {
    VECTOR_DIMENSION_384
}
fn default_metric() -> String {
    Metric::Angular.as_str().to_string()
}
fn default_n_trees() -> usize {
    10
}
fn default_leaf_size() -> usize {
    DEFAULT_LEAF_SIZE
}
fn default_seed() -> u64 {
    DEFAULT_SEED
}
fn default_results() -> usize {
    5
}
fn default_min_candidates() -> usize {
    50
}
fn default_oversample() -> usize {
    10
}
fn default_similarity_threshold() -> f32 {
    0.85
}
fn default_embedding_model() -> String {
    "AllMiniLML6V2".to_string()
}
fn default_scratch_dir() -> PathBuf {
    PathBuf::from("tmp")
}
fn default_swap_retries() -> u32 {
    3
}
fn default_swap_backoff_ms() -> u64 {
    25
}
fn default_batch_threshold() -> usize {
    64
}
fn default_flush_interval_ms() -> u64 {
    2000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            data_dir: default_data_dir(),
            workspace_root: None,
            debug: false,
            vector: VectorConfig::default(),
            search: SearchConfig::default(),
            embedding: EmbeddingConfig::default(),
            storage: StorageConfig::default(),
            staging: StagingConfig::default(),
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            metric: default_metric(),
            n_trees: default_n_trees(),
            leaf_size: default_leaf_size(),
            seed: default_seed(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_results: default_results(),
            min_candidates: default_min_candidates(),
            oversample: default_oversample(),
            similarity_threshold: default_similarity_threshold(),
            mixed_weights: GroupWeights::mixed_default(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            cache_dir: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            swap_retries: default_swap_retries(),
            swap_backoff_ms: default_swap_backoff_ms(),
            recover_corrupt_metadata: false,
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            batch_threshold: default_batch_threshold(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));

        Self::figment(&config_path)
            .extract()
            .map_err(Box::new)
            .map(|mut settings: Settings| {
                if settings.workspace_root.is_none() {
                    settings.workspace_root = Self::workspace_root();
                }
                settings
            })
    }

    /// Load configuration from a specific file
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Self::figment(path.as_ref()).extract().map_err(Box::new)
    }

    fn figment(config_path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_path))
            // Double underscore (__) separates nested levels
            .merge(Env::prefixed(ENV_PREFIX).map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
    }

    /// Find settings.toml by looking for .bugscout from the current
    /// directory up to root
    fn find_workspace_config() -> Option<PathBuf> {
        Self::workspace_root().map(|root| root.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Get the workspace root directory (where .bugscout is located)
    pub fn workspace_root() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        current
            .ancestors()
            .find(|ancestor| ancestor.join(CONFIG_DIR).is_dir())
            .map(Path::to_path_buf)
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file in the current directory
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let current_dir = std::env::current_dir()?;
        Self::init_config_file_in(&current_dir, force)
    }

    /// Create a default settings file with helpful comments under `root`
    pub fn init_config_file_in(
        root: &Path,
        force: bool,
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = root.join(CONFIG_DIR).join(CONFIG_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mixed = GroupWeights::mixed_default();
        let template = format!(
            r#"# bugscout configuration

# Version of the configuration schema
version = 1

# Facet indices and metadata.json (relative to the workspace root)
data_dir = ".bugscout/data"

# Global debug mode
debug = false

[vector]
# Must match the embedding model
dimension = {dimension}
# angular (cosine), euclidean or manhattan
metric = "angular"
# More trees: better recall, slower rebuilds
n_trees = {n_trees}
leaf_size = {leaf_size}
seed = {seed}

[search]
default_results = 5
min_candidates = 50
oversample = 10
# Hits at or above this similarity are reported as duplicates
similarity_threshold = 0.85

[search.mixed_weights]
summary = {summary}
code = {code}
test_info = {test_info}
log_info = {log_info}
environment = {environment}

[embedding]
# AllMiniLML6V2, AllMiniLML12V2, BGESmallENV15, BGEBaseENV15, MultilingualE5Small
model = "AllMiniLML6V2"
# cache_dir = "~/.cache/bugscout/models"

[storage]
# Staged writes land here before being renamed into place
scratch_dir = "tmp"
swap_retries = 3
swap_backoff_ms = 25
recover_corrupt_metadata = false

[staging]
batch_threshold = 64
flush_interval_ms = 2000
"#,
            dimension = VECTOR_DIMENSION_384,
            n_trees = default_n_trees(),
            leaf_size = DEFAULT_LEAF_SIZE,
            seed = DEFAULT_SEED,
            summary = mixed.summary,
            code = mixed.code,
            test_info = mixed.test_info,
            log_info = mixed.log_info,
            environment = mixed.environment,
        );

        std::fs::write(&config_path, template)?;
        Ok(config_path)
    }

    /// Absolute location of the data directory.
    pub fn data_path(&self) -> PathBuf {
        match &self.workspace_root {
            Some(root) if self.data_dir.is_relative() => root.join(&self.data_dir),
            _ => self.data_dir.clone(),
        }
    }

    pub fn scratch_path(&self) -> PathBuf {
        if self.storage.scratch_dir.is_absolute() {
            self.storage.scratch_dir.clone()
        } else {
            self.data_path().join(&self.storage.scratch_dir)
        }
    }

    pub fn dimension(&self) -> KbResult<VectorDimension> {
        VectorDimension::new(self.vector.dimension).map_err(|e| KbError::Config {
            reason: format!("vector.dimension: {e}"),
        })
    }

    pub fn metric(&self) -> KbResult<Metric> {
        self.vector.metric.parse().map_err(|e| KbError::Config {
            reason: format!("vector.metric: {e}"),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.storage.swap_retries, self.storage.swap_backoff_ms)
    }

    pub fn validate(&self) -> KbResult<()> {
        self.dimension()?;
        self.metric()?;
        if self.vector.n_trees == 0 {
            return Err(KbError::Config {
                reason: "vector.n_trees must be at least 1".to_string(),
            });
        }
        if self.vector.leaf_size == 0 {
            return Err(KbError::Config {
                reason: "vector.leaf_size must be at least 1".to_string(),
            });
        }
        let threshold = self.search.similarity_threshold;
        if !threshold.is_finite() {
            return Err(KbError::Config {
                reason: format!("search.similarity_threshold must be finite, got {threshold}"),
            });
        }
        self.search.mixed_weights.validate()
    }
}
