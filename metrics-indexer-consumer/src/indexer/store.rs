//! Storage seam for the string indexer
//!
//! A [`StringStore`] is a synchronous key/value mapping. [`StoreIndexer`]
//! turns one into a [`StringIndexer`]: it looks up existing ids, runs the
//! writes limiter over the misses and creates the admitted ones.

use async_trait::async_trait;
use metrics_indexer_core::{IndexerError, IndexerResult, OrgId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

use super::writes_limiter::WritesLimiter;
use super::{FetchType, KeyResults, OrgStrings, StringIndexer};

/// Outcome of creating one string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredId {
    pub id: u64,
    /// False when the string already existed and its id was reused
    pub created: bool,
}

/// Synchronous storage behind a [`StoreIndexer`]
pub trait StringStore: Send + Sync + 'static {
    /// Ids of the strings that already exist. Missing strings are absent.
    fn get_many(
        &self,
        org_id: OrgId,
        strings: &BTreeSet<String>,
    ) -> IndexerResult<BTreeMap<String, u64>>;

    /// Create the strings. A string that exists by the time it is written
    /// keeps its id and is returned with `created == false`.
    fn create_many(
        &self,
        org_id: OrgId,
        strings: &BTreeSet<String>,
    ) -> IndexerResult<BTreeMap<String, StoredId>>;

    fn reverse(&self, org_id: OrgId, id: u64) -> IndexerResult<Option<String>>;

    fn name(&self) -> &'static str;
}

struct StoreInner<S> {
    store: S,
    limiter: WritesLimiter,
}

impl<S: StringStore> StoreInner<S> {
    fn bulk_record(&self, strings: &OrgStrings) -> IndexerResult<KeyResults> {
        let mut results = KeyResults::new();
        let mut missing = OrgStrings::new();

        for (org_id, org_strings) in strings.orgs() {
            let existing = self.store.get_many(org_id, org_strings)?;
            for s in org_strings {
                match existing.get(s) {
                    Some(id) => results.add_key_result(org_id, s, *id, FetchType::DbRead),
                    None => {
                        missing.insert(org_id, s.as_str());
                    }
                }
            }
        }

        if missing.is_empty() {
            return Ok(results);
        }

        let decision = self.limiter.check(&missing);
        for (org_id, s, ext) in &decision.refused {
            results.add_rate_limited(*org_id, s, *ext);
        }
        if !decision.refused.is_empty() {
            debug!(
                "Writes limiter refused {} new strings",
                decision.refused.len()
            );
        }

        for (org_id, org_strings) in decision.granted.orgs() {
            match self.store.create_many(org_id, org_strings) {
                Ok(created) => {
                    for (s, stored) in created {
                        let fetch_type = if stored.created {
                            FetchType::FirstSeen
                        } else {
                            FetchType::DbRead
                        };
                        results.add_key_result(org_id, &s, stored.id, fetch_type);
                    }
                }
                Err(e) => {
                    // Leave this org's strings unresolved; the messages using
                    // them are dropped at reconstruct.
                    self.limiter
                        .release(&decision, org_id, org_strings.len() as u64);
                    warn!(
                        "Failed to create {} strings for org {}: {}",
                        org_strings.len(),
                        org_id,
                        e
                    );
                }
            }
        }

        Ok(results)
    }
}

/// [`StringIndexer`] over a [`StringStore`]
pub struct StoreIndexer<S> {
    inner: Arc<StoreInner<S>>,
}

impl<S: StringStore> StoreIndexer<S> {
    pub fn new(store: S, limiter: WritesLimiter) -> Self {
        Self {
            inner: Arc::new(StoreInner { store, limiter }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Run a store call off the async executor
    async fn blocking<T, F>(&self, call: F) -> IndexerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&StoreInner<S>) -> IndexerResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || call(&inner))
            .await
            .map_err(|e| IndexerError::internal(format!("String store task failed: {}", e)))?
    }
}

#[async_trait]
impl<S: StringStore> StringIndexer for StoreIndexer<S> {
    async fn bulk_record(&self, strings: OrgStrings) -> IndexerResult<KeyResults> {
        if strings.is_empty() {
            return Ok(KeyResults::new());
        }

        let start = Instant::now();
        let requested = strings.len();

        let results = self.blocking(move |inner| inner.bulk_record(&strings)).await?;

        trace!(
            "Recorded {} of {} strings in {} store in {:?}",
            results.len(),
            requested,
            self.inner.store.name(),
            start.elapsed()
        );
        Ok(results)
    }

    async fn resolve(&self, org_id: OrgId, string: &str) -> IndexerResult<Option<u64>> {
        let string = string.to_string();
        self.blocking(move |inner| {
            let strings: BTreeSet<String> = [string.clone()].into_iter().collect();
            let found = inner.store.get_many(org_id, &strings)?;
            Ok(found.get(&string).copied())
        })
        .await
    }

    async fn reverse_resolve(&self, org_id: OrgId, id: u64) -> IndexerResult<Option<String>> {
        self.blocking(move |inner| inner.store.reverse(org_id, id))
            .await
    }

    fn name(&self) -> &'static str {
        self.inner.store.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{WriteQuota, WritesLimiterConfig};
    use crate::indexer::memory::MemoryStringStore;

    fn strings(pairs: &[(OrgId, &str)]) -> OrgStrings {
        pairs.iter().map(|(org, s)| (*org, *s)).collect()
    }

    #[tokio::test]
    async fn test_first_seen_then_db_read() {
        let indexer = StoreIndexer::new(MemoryStringStore::new(), WritesLimiter::disabled());

        let first = indexer
            .bulk_record(strings(&[(1, "a"), (1, "b")]))
            .await
            .unwrap();
        assert_eq!(first.metadata(1, "a").unwrap().fetch_type, FetchType::FirstSeen);

        let second = indexer
            .bulk_record(strings(&[(1, "a"), (1, "b")]))
            .await
            .unwrap();
        assert_eq!(second.metadata(1, "a").unwrap().fetch_type, FetchType::DbRead);
        assert_eq!(first.get(1, "a"), second.get(1, "a"));
        assert_eq!(first.get(1, "b"), second.get(1, "b"));
    }

    #[tokio::test]
    async fn test_writes_limiter_refuses_new_strings_only() {
        let limiter = WritesLimiter::new(&WritesLimiterConfig {
            per_org: vec![WriteQuota {
                window_seconds: 60,
                limit: 1,
            }],
            global: Vec::new(),
        });
        let indexer = StoreIndexer::new(MemoryStringStore::new(), limiter);

        let results = indexer
            .bulk_record(strings(&[(1, "a"), (1, "b")]))
            .await
            .unwrap();
        assert!(results.get(1, "a").is_some());
        assert_eq!(
            results.metadata(1, "b").unwrap().fetch_type,
            FetchType::RateLimited
        );

        // Known strings are still served once the quota is exhausted
        let again = indexer.bulk_record(strings(&[(1, "a")])).await.unwrap();
        assert!(again.get(1, "a").is_some());
    }

    #[tokio::test]
    async fn test_resolve_does_not_create() {
        let indexer = StoreIndexer::new(MemoryStringStore::new(), WritesLimiter::disabled());
        assert_eq!(indexer.resolve(1, "missing").await.unwrap(), None);

        let id = indexer.record(1, "present").await.unwrap().unwrap();
        assert_eq!(indexer.resolve(1, "present").await.unwrap(), Some(id));
        assert_eq!(indexer.resolve(2, "present").await.unwrap(), None);
        assert_eq!(
            indexer.reverse_resolve(1, id).await.unwrap().as_deref(),
            Some("present")
        );
    }

    /// Fails the first create call, then delegates
    struct FailOnceStore {
        inner: MemoryStringStore,
        failed: std::sync::atomic::AtomicBool,
    }

    impl StringStore for FailOnceStore {
        fn get_many(
            &self,
            org_id: OrgId,
            strings: &BTreeSet<String>,
        ) -> IndexerResult<BTreeMap<String, u64>> {
            self.inner.get_many(org_id, strings)
        }

        fn create_many(
            &self,
            org_id: OrgId,
            strings: &BTreeSet<String>,
        ) -> IndexerResult<BTreeMap<String, StoredId>> {
            if !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(IndexerError::backend("write rejected"));
            }
            self.inner.create_many(org_id, strings)
        }

        fn reverse(&self, org_id: OrgId, id: u64) -> IndexerResult<Option<String>> {
            self.inner.reverse(org_id, id)
        }

        fn name(&self) -> &'static str {
            "fail-once"
        }
    }

    #[tokio::test]
    async fn test_failed_create_keeps_writes_quota() {
        let limiter = WritesLimiter::new(&WritesLimiterConfig {
            per_org: vec![WriteQuota {
                window_seconds: 3600,
                limit: 1,
            }],
            global: Vec::new(),
        });
        let store = FailOnceStore {
            inner: MemoryStringStore::new(),
            failed: std::sync::atomic::AtomicBool::new(false),
        };
        let indexer = StoreIndexer::new(store, limiter);

        let first = indexer.bulk_record(strings(&[(1, "a")])).await.unwrap();
        assert!(first.get(1, "a").is_none());
        assert!(first.metadata(1, "a").is_none());

        // The failed write did not use up the org's only slot
        let second = indexer.bulk_record(strings(&[(1, "a")])).await.unwrap();
        assert_eq!(
            second.metadata(1, "a").unwrap().fetch_type,
            FetchType::FirstSeen
        );
    }
}
