//! Read-through, write-through cache in front of an indexer
//!
//! Entries never change value once assigned, so eviction only costs a
//! backend round trip.

use async_trait::async_trait;
use metrics_indexer_core::{IndexerResult, OrgId};
use moka::future::Cache;
use std::sync::Arc;
use tracing::trace;

use super::{FetchType, KeyResults, OrgStrings, StringIndexer};
use crate::config::CacheConfig;

pub struct CachingIndexer {
    inner: Arc<dyn StringIndexer>,
    cache: Cache<(OrgId, String), u64>,
}

impl CachingIndexer {
    pub fn new(inner: Arc<dyn StringIndexer>, config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.ttl())
            .build();

        Self { inner, cache }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl StringIndexer for CachingIndexer {
    async fn bulk_record(&self, strings: OrgStrings) -> IndexerResult<KeyResults> {
        let mut results = KeyResults::new();
        let mut misses = OrgStrings::new();

        for (org_id, s) in strings.iter() {
            match self.cache.get(&(org_id, s.to_string())).await {
                Some(id) => results.add_key_result(org_id, s, id, FetchType::CacheHit),
                None => {
                    misses.insert(org_id, s);
                }
            }
        }

        trace!(
            "Indexer cache: {} hits, {} misses",
            results.len(),
            misses.len()
        );

        if misses.is_empty() {
            return Ok(results);
        }

        let fetched = self.inner.bulk_record(misses).await?;
        for (org_id, mapped) in fetched.mapped_results() {
            for (s, id) in mapped {
                self.cache.insert((*org_id, s.clone()), *id).await;
            }
        }
        results.merge(fetched);

        Ok(results)
    }

    async fn resolve(&self, org_id: OrgId, string: &str) -> IndexerResult<Option<u64>> {
        let key = (org_id, string.to_string());
        if let Some(id) = self.cache.get(&key).await {
            return Ok(Some(id));
        }

        let resolved = self.inner.resolve(org_id, string).await?;
        if let Some(id) = resolved {
            self.cache.insert(key, id).await;
        }
        Ok(resolved)
    }

    async fn reverse_resolve(&self, org_id: OrgId, id: u64) -> IndexerResult<Option<String>> {
        self.inner.reverse_resolve(org_id, id).await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
