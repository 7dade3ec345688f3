//! Window storage for the cardinality limiter
//!
//! A scope's window is a run of granules, each holding the set of series
//! hashes accepted while it was current.

use async_trait::async_trait;
use metrics_indexer_core::IndexerResult;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::RangeInclusive;

#[async_trait]
pub trait CardinalityStore: Send + Sync {
    /// Union of the hashes recorded for `scope` in `granules`
    async fn accepted(&self, scope: &str, granules: RangeInclusive<u64>)
        -> IndexerResult<HashSet<u64>>;

    /// Record `hashes` in `granule` and drop granules before `oldest_kept`
    async fn record(
        &self,
        scope: &str,
        granule: u64,
        hashes: &[u64],
        oldest_kept: u64,
    ) -> IndexerResult<()>;

    fn name(&self) -> &'static str;
}

/// In-process window store
#[derive(Debug, Default)]
pub struct MemoryCardinalityStore {
    scopes: Mutex<HashMap<String, BTreeMap<u64, HashSet<u64>>>>,
}

impl MemoryCardinalityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of granules currently held for `scope`
    pub fn granule_count(&self, scope: &str) -> usize {
        self.scopes.lock().get(scope).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl CardinalityStore for MemoryCardinalityStore {
    async fn accepted(
        &self,
        scope: &str,
        granules: RangeInclusive<u64>,
    ) -> IndexerResult<HashSet<u64>> {
        let scopes = self.scopes.lock();
        let Some(window) = scopes.get(scope) else {
            return Ok(HashSet::new());
        };

        Ok(window
            .range(granules)
            .flat_map(|(_, hashes)| hashes.iter().copied())
            .collect())
    }

    async fn record(
        &self,
        scope: &str,
        granule: u64,
        hashes: &[u64],
        oldest_kept: u64,
    ) -> IndexerResult<()> {
        let mut scopes = self.scopes.lock();
        let window = scopes.entry(scope.to_string()).or_default();

        window
            .entry(granule)
            .or_default()
            .extend(hashes.iter().copied());

        // Keep only granules still inside the window
        let kept = window.split_off(&oldest_kept);
        *window = kept;

        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_union_over_granules() {
        let store = MemoryCardinalityStore::new();
        store.record("s", 1, &[1, 2], 0).await.unwrap();
        store.record("s", 2, &[2, 3], 0).await.unwrap();

        assert_eq!(store.accepted("s", 1..=2).await.unwrap().len(), 3);
        assert_eq!(store.accepted("s", 2..=2).await.unwrap().len(), 2);
        assert!(store.accepted("other", 0..=10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_old_granules_are_pruned() {
        let store = MemoryCardinalityStore::new();
        store.record("s", 1, &[1], 0).await.unwrap();
        store.record("s", 5, &[2], 4).await.unwrap();

        assert_eq!(store.granule_count("s"), 1);
        assert_eq!(
            store.accepted("s", 0..=5).await.unwrap(),
            [2].into_iter().collect()
        );
    }
}
