use anyhow::{Context, Result};
use metrics_indexer_core::{OrgId, UseCaseKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file when `CONFIG_PATH` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/indexer.yaml";

/// Configuration for one indexer consumer. This is the only state needed to
/// rebuild a [`crate::processing::MessageProcessor`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsIngestConfiguration {
    /// Which group of use cases this consumer serves
    pub use_case: UseCaseKey,

    /// String indexer storage backend
    pub db_backend: DbBackend,

    /// Intern tag values as well as keys. When false, values are forwarded raw.
    pub should_index_tag_values: bool,

    /// Split output into per-slice sub-batches
    pub is_output_sliced: bool,

    /// Slice routing settings, used when `is_output_sliced` is set
    pub slicing: SlicingConfig,

    /// Indexer cache settings
    pub cache: CacheConfig,

    /// Limits on newly created strings
    pub writes_limiter: WritesLimiterConfig,

    /// Cardinality limiter settings
    pub cardinality: CardinalityConfig,
}

/// String indexer storage backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DbBackend {
    /// In-process map with sequential ids; contents are lost on restart
    Memory,
    /// Embedded fjall keyspace at `path`
    Persistent { path: PathBuf },
}

/// Slice routing configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SlicingConfig {
    /// Number of logical partitions organizations are hashed onto
    pub logical_partitions: u32,

    /// Number of output slices the logical partitions are spread across
    pub slice_count: u32,
}

/// Indexer cache configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Maximum number of cached (org, string) entries
    pub max_capacity: u64,

    /// Time to live for a cached entry in seconds
    pub ttl_seconds: u64,
}

/// A fixed-window quota on newly created strings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteQuota {
    pub window_seconds: u64,
    pub limit: u64,
}

/// Writes limiter configuration. Empty quota lists disable the limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WritesLimiterConfig {
    pub per_org: Vec<WriteQuota>,
    pub global: Vec<WriteQuota>,
}

/// A sliding-window cardinality quota
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardinalityQuota {
    /// Total window length in seconds
    pub window_seconds: u64,

    /// Length of one granule in seconds; must divide `window_seconds`
    pub granularity_seconds: u64,

    /// Maximum distinct series accepted within the window
    pub limit: u64,
}

/// Cardinality limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CardinalityConfig {
    /// Quotas applied to every organization without an override
    pub quotas: Vec<CardinalityQuota>,

    /// Per-organization quota lists replacing `quotas`
    pub org_overrides: BTreeMap<OrgId, Vec<CardinalityQuota>>,

    /// Organizations with `org_id % 100 < rollout_percent` are limited
    pub rollout_percent: u8,

    /// Admit everything when the limiter itself fails
    pub fail_open: bool,
}

impl Default for MetricsIngestConfiguration {
    fn default() -> Self {
        Self {
            use_case: UseCaseKey::Performance,
            db_backend: DbBackend::Memory,
            should_index_tag_values: true,
            is_output_sliced: false,
            slicing: SlicingConfig::default(),
            cache: CacheConfig::default(),
            writes_limiter: WritesLimiterConfig::default(),
            cardinality: CardinalityConfig::default(),
        }
    }
}

impl Default for DbBackend {
    fn default() -> Self {
        DbBackend::Memory
    }
}

impl Default for SlicingConfig {
    fn default() -> Self {
        Self {
            logical_partitions: 256,
            slice_count: 1,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_capacity: 1_000_000,
            ttl_seconds: 2 * 60 * 60,
        }
    }
}

impl Default for CardinalityConfig {
    fn default() -> Self {
        Self {
            quotas: Vec::new(),
            org_overrides: BTreeMap::new(),
            rollout_percent: 100,
            fail_open: false,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl CardinalityConfig {
    /// Quotas applying to `org_id`
    pub fn quotas_for(&self, org_id: OrgId) -> &[CardinalityQuota] {
        self.org_overrides
            .get(&org_id)
            .map(Vec::as_slice)
            .unwrap_or(&self.quotas)
    }

    pub fn is_rolled_out(&self, org_id: OrgId) -> bool {
        org_id % 100 < u64::from(self.rollout_percent)
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid value for {}: {}", name, value))
}

impl MetricsIngestConfiguration {
    /// Load configuration from file, environment variables, and defaults
    pub fn load() -> Result<Self> {
        let mut config = if let Ok(config_path) = env::var("CONFIG_PATH") {
            Self::load_from_file(&config_path)?
        } else if Path::new(DEFAULT_CONFIG_PATH).exists() {
            Self::load_from_file(DEFAULT_CONFIG_PATH)?
        } else {
            Self::default()
        };

        config.apply_env_overrides(|name| env::var(name).ok())?;

        // Validate the loaded configuration
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Override settings with `INDEXER_*` variables returned by `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(use_case) = lookup("INDEXER_USE_CASE") {
            self.use_case = use_case
                .parse()
                .map_err(|e| anyhow::anyhow!("INDEXER_USE_CASE: {}", e))?;
        }

        if let Some(backend) = lookup("INDEXER_DB_BACKEND") {
            self.db_backend = match backend.to_lowercase().as_str() {
                "memory" => DbBackend::Memory,
                "persistent" => {
                    let path = lookup("INDEXER_DB_PATH").ok_or_else(|| {
                        anyhow::anyhow!("INDEXER_DB_PATH is required for the persistent backend")
                    })?;
                    DbBackend::Persistent { path: path.into() }
                }
                _ => {
                    return Err(anyhow::anyhow!(
                        "Invalid db backend: {}. Valid options: memory, persistent",
                        backend
                    ))
                }
            };
        } else if let Some(path) = lookup("INDEXER_DB_PATH") {
            if let DbBackend::Persistent { path: current } = &mut self.db_backend {
                *current = path.into();
            }
        }

        if let Some(v) = lookup("INDEXER_SHOULD_INDEX_TAG_VALUES") {
            self.should_index_tag_values = parse_env("INDEXER_SHOULD_INDEX_TAG_VALUES", &v)?;
        }

        if let Some(v) = lookup("INDEXER_IS_OUTPUT_SLICED") {
            self.is_output_sliced = parse_env("INDEXER_IS_OUTPUT_SLICED", &v)?;
        }

        if let Some(v) = lookup("INDEXER_SLICE_COUNT") {
            self.slicing.slice_count = parse_env("INDEXER_SLICE_COUNT", &v)?;
        }

        if let Some(v) = lookup("INDEXER_LOGICAL_PARTITIONS") {
            self.slicing.logical_partitions = parse_env("INDEXER_LOGICAL_PARTITIONS", &v)?;
        }

        if let Some(v) = lookup("INDEXER_CACHE_ENABLED") {
            self.cache.enabled = parse_env("INDEXER_CACHE_ENABLED", &v)?;
        }

        if let Some(v) = lookup("INDEXER_CACHE_MAX_CAPACITY") {
            self.cache.max_capacity = parse_env("INDEXER_CACHE_MAX_CAPACITY", &v)?;
        }

        if let Some(v) = lookup("INDEXER_CARDINALITY_ROLLOUT_PERCENT") {
            self.cardinality.rollout_percent =
                parse_env("INDEXER_CARDINALITY_ROLLOUT_PERCENT", &v)?;
        }

        if let Some(v) = lookup("INDEXER_CARDINALITY_FAIL_OPEN") {
            self.cardinality.fail_open = parse_env("INDEXER_CARDINALITY_FAIL_OPEN", &v)?;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let DbBackend::Persistent { path } = &self.db_backend {
            if path.as_os_str().is_empty() {
                return Err(anyhow::anyhow!("Persistent backend path cannot be empty"));
            }
        }

        if self.slicing.logical_partitions == 0 {
            return Err(anyhow::anyhow!("Logical partitions must be greater than 0"));
        }

        if self.is_output_sliced {
            if self.slicing.slice_count == 0 {
                return Err(anyhow::anyhow!("Slice count must be greater than 0"));
            }
            if self.slicing.slice_count > self.slicing.logical_partitions {
                return Err(anyhow::anyhow!(
                    "Slice count ({}) cannot exceed logical partitions ({})",
                    self.slicing.slice_count,
                    self.slicing.logical_partitions
                ));
            }
        }

        if self.cache.enabled && self.cache.max_capacity == 0 {
            return Err(anyhow::anyhow!("Cache capacity must be greater than 0"));
        }

        for quota in self
            .writes_limiter
            .per_org
            .iter()
            .chain(self.writes_limiter.global.iter())
        {
            if quota.window_seconds == 0 {
                return Err(anyhow::anyhow!(
                    "Writes limiter window must be greater than 0"
                ));
            }
        }

        if self.cardinality.rollout_percent > 100 {
            return Err(anyhow::anyhow!(
                "Cardinality rollout percent must be between 0 and 100"
            ));
        }

        let all_quotas = self
            .cardinality
            .quotas
            .iter()
            .chain(self.cardinality.org_overrides.values().flatten());
        for quota in all_quotas {
            if quota.granularity_seconds == 0 || quota.window_seconds == 0 {
                return Err(anyhow::anyhow!(
                    "Cardinality window and granularity must be greater than 0"
                ));
            }
            if quota.window_seconds % quota.granularity_seconds != 0 {
                return Err(anyhow::anyhow!(
                    "Cardinality window ({}s) must be a multiple of its granularity ({}s)",
                    quota.window_seconds,
                    quota.granularity_seconds
                ));
            }
        }

        Ok(())
    }
}
