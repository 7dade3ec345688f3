//! String indexer: maps (organization, string) pairs to stable integer ids
//!
//! The indexer is assembled from layers around a storage backend:
//!
//! ```text
//! StaticStringIndexer -> CachingIndexer -> StoreIndexer<S> (writes limiter)
//! ```
//!
//! where `S` is the in-memory or fjall-backed [`store::StringStore`].

pub mod cache;
pub mod memory;
pub mod persistent;
pub mod static_strings;
pub mod store;
pub mod writes_limiter;

use async_trait::async_trait;
use metrics_indexer_core::{IndexerResult, OrgId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::config::{DbBackend, MetricsIngestConfiguration};
use cache::CachingIndexer;
use memory::MemoryStringStore;
use persistent::PersistentStringStore;
use static_strings::StaticStringIndexer;
use store::StoreIndexer;
use writes_limiter::WritesLimiter;

/// How an id was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FetchType {
    CacheHit,
    Hardcoded,
    DbRead,
    FirstSeen,
    RateLimited,
}

impl FetchType {
    /// Single-character code used in `mapping_meta` and the `mapping_sources` header
    pub fn code(&self) -> char {
        match self {
            FetchType::CacheHit => 'c',
            FetchType::Hardcoded => 'h',
            FetchType::DbRead => 'd',
            FetchType::FirstSeen => 'f',
            FetchType::RateLimited => 'r',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchType::CacheHit => "cache_hit",
            FetchType::Hardcoded => "hardcoded",
            FetchType::DbRead => "db_read",
            FetchType::FirstSeen => "first_seen",
            FetchType::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for FetchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra detail for a fetch, currently only which rate limit refused a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTypeExt {
    pub is_global: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub id: Option<u64>,
    pub fetch_type: FetchType,
    pub fetch_type_ext: Option<FetchTypeExt>,
}

/// Distinct (organization, string) pairs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrgStrings {
    strings: BTreeMap<OrgId, BTreeSet<String>>,
}

impl OrgStrings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair, returning whether it was new
    pub fn insert<S: Into<String>>(&mut self, org_id: OrgId, string: S) -> bool {
        self.strings.entry(org_id).or_default().insert(string.into())
    }

    pub fn contains(&self, org_id: OrgId, string: &str) -> bool {
        self.strings
            .get(&org_id)
            .map_or(false, |strings| strings.contains(string))
    }

    pub fn get(&self, org_id: OrgId) -> Option<&BTreeSet<String>> {
        self.strings.get(&org_id)
    }

    /// Iterate organizations with their strings, in org id order
    pub fn orgs(&self) -> impl Iterator<Item = (OrgId, &BTreeSet<String>)> {
        self.strings.iter().map(|(org, strings)| (*org, strings))
    }

    pub fn iter(&self) -> impl Iterator<Item = (OrgId, &str)> {
        self.strings
            .iter()
            .flat_map(|(org, strings)| strings.iter().map(move |s| (*org, s.as_str())))
    }

    /// Total number of pairs
    pub fn len(&self) -> usize {
        self.strings.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.values().all(BTreeSet::is_empty)
    }

    /// Keep only the pairs matching the predicate, dropping emptied orgs
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(OrgId, &str) -> bool,
    {
        for (org, strings) in self.strings.iter_mut() {
            strings.retain(|s| keep(*org, s));
        }
        self.strings.retain(|_, strings| !strings.is_empty());
    }
}

impl<S: Into<String>> FromIterator<(OrgId, S)> for OrgStrings {
    fn from_iter<I: IntoIterator<Item = (OrgId, S)>>(iter: I) -> Self {
        let mut strings = Self::new();
        for (org, s) in iter {
            strings.insert(org, s);
        }
        strings
    }
}

/// Result of a bulk lookup: resolved ids plus how each was fetched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyResults {
    mapped_results: BTreeMap<OrgId, BTreeMap<String, u64>>,
    fetch_metadata: BTreeMap<OrgId, BTreeMap<String, Metadata>>,
}

impl KeyResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resolved id
    pub fn add_key_result(&mut self, org_id: OrgId, string: &str, id: u64, fetch_type: FetchType) {
        self.mapped_results
            .entry(org_id)
            .or_default()
            .insert(string.to_string(), id);
        self.fetch_metadata.entry(org_id).or_default().insert(
            string.to_string(),
            Metadata {
                id: Some(id),
                fetch_type,
                fetch_type_ext: None,
            },
        );
    }

    /// Record a string whose creation was refused by the writes limiter
    pub fn add_rate_limited(&mut self, org_id: OrgId, string: &str, ext: FetchTypeExt) {
        self.fetch_metadata.entry(org_id).or_default().insert(
            string.to_string(),
            Metadata {
                id: None,
                fetch_type: FetchType::RateLimited,
                fetch_type_ext: Some(ext),
            },
        );
    }

    pub fn get(&self, org_id: OrgId, string: &str) -> Option<u64> {
        self.mapped_results
            .get(&org_id)
            .and_then(|strings| strings.get(string))
            .copied()
    }

    pub fn metadata(&self, org_id: OrgId, string: &str) -> Option<&Metadata> {
        self.fetch_metadata
            .get(&org_id)
            .and_then(|strings| strings.get(string))
    }

    pub fn mapped_results(&self) -> &BTreeMap<OrgId, BTreeMap<String, u64>> {
        &self.mapped_results
    }

    pub fn fetch_metadata(&self) -> &BTreeMap<OrgId, BTreeMap<String, Metadata>> {
        &self.fetch_metadata
    }

    /// Number of resolved pairs
    pub fn len(&self) -> usize {
        self.mapped_results.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pairs of `requested` with neither an id nor a rate-limit decision
    pub fn unresolved(&self, requested: &OrgStrings) -> OrgStrings {
        requested
            .iter()
            .filter(|(org, s)| self.metadata(*org, s).is_none())
            .collect()
    }

    /// Fold another result set into this one; entries in `other` win
    pub fn merge(&mut self, other: KeyResults) {
        for (org, strings) in other.mapped_results {
            self.mapped_results.entry(org).or_default().extend(strings);
        }
        for (org, metadata) in other.fetch_metadata {
            self.fetch_metadata.entry(org).or_default().extend(metadata);
        }
    }

    /// Count of entries per fetch type
    pub fn fetch_type_counts(&self) -> BTreeMap<FetchType, usize> {
        let mut counts = BTreeMap::new();
        for metadata in self.fetch_metadata.values().flat_map(BTreeMap::values) {
            *counts.entry(metadata.fetch_type).or_insert(0) += 1;
        }
        counts
    }
}

/// Pluggable string interning contract
#[async_trait]
pub trait StringIndexer: Send + Sync {
    /// Resolve all pairs, creating the missing ones.
    ///
    /// Pairs that could not be created come back unresolved. An `Err` means
    /// nothing could be resolved and the batch must fail.
    async fn bulk_record(&self, strings: OrgStrings) -> IndexerResult<KeyResults>;

    /// Resolve or create a single string
    async fn record(&self, org_id: OrgId, string: &str) -> IndexerResult<Option<u64>> {
        let mut strings = OrgStrings::new();
        strings.insert(org_id, string);
        let results = self.bulk_record(strings).await?;
        Ok(results.get(org_id, string))
    }

    /// Look up an id without creating it
    async fn resolve(&self, org_id: OrgId, string: &str) -> IndexerResult<Option<u64>>;

    /// Look up the string for an id
    async fn reverse_resolve(&self, org_id: OrgId, id: u64) -> IndexerResult<Option<String>>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Storage backend chosen once at construction
pub enum IndexerBackend {
    Memory(StoreIndexer<MemoryStringStore>),
    Persistent(StoreIndexer<PersistentStringStore>),
}

#[async_trait]
impl StringIndexer for IndexerBackend {
    async fn bulk_record(&self, strings: OrgStrings) -> IndexerResult<KeyResults> {
        match self {
            IndexerBackend::Memory(indexer) => indexer.bulk_record(strings).await,
            IndexerBackend::Persistent(indexer) => indexer.bulk_record(strings).await,
        }
    }

    async fn resolve(&self, org_id: OrgId, string: &str) -> IndexerResult<Option<u64>> {
        match self {
            IndexerBackend::Memory(indexer) => indexer.resolve(org_id, string).await,
            IndexerBackend::Persistent(indexer) => indexer.resolve(org_id, string).await,
        }
    }

    async fn reverse_resolve(&self, org_id: OrgId, id: u64) -> IndexerResult<Option<String>> {
        match self {
            IndexerBackend::Memory(indexer) => indexer.reverse_resolve(org_id, id).await,
            IndexerBackend::Persistent(indexer) => indexer.reverse_resolve(org_id, id).await,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            IndexerBackend::Memory(indexer) => indexer.name(),
            IndexerBackend::Persistent(indexer) => indexer.name(),
        }
    }
}

impl IndexerBackend {
    pub fn from_config(config: &MetricsIngestConfiguration) -> anyhow::Result<Self> {
        let limiter = WritesLimiter::new(&config.writes_limiter);
        let backend = match &config.db_backend {
            DbBackend::Memory => {
                IndexerBackend::Memory(StoreIndexer::new(MemoryStringStore::new(), limiter))
            }
            DbBackend::Persistent { path } => IndexerBackend::Persistent(StoreIndexer::new(
                PersistentStringStore::open(path)?,
                limiter,
            )),
        };
        Ok(backend)
    }
}

/// Build the full indexer stack described by the configuration
pub fn build_indexer(config: &MetricsIngestConfiguration) -> anyhow::Result<Arc<dyn StringIndexer>> {
    let backend: Arc<dyn StringIndexer> = Arc::new(IndexerBackend::from_config(config)?);

    let cached: Arc<dyn StringIndexer> = if config.cache.enabled {
        Arc::new(CachingIndexer::new(backend, &config.cache))
    } else {
        backend
    };

    let indexer = StaticStringIndexer::new(cached);
    info!(
        "String indexer ready: backend={}, cache={}",
        indexer.backend_name(),
        config.cache.enabled
    );

    Ok(Arc::new(indexer))
}
