//! Well-known strings with fixed ids
//!
//! Strings used by nearly every organization resolve to ids in a reserved
//! range without touching the backend. Their ids are shared by all orgs.

use async_trait::async_trait;
use metrics_indexer_core::{IndexerResult, OrgId};
use std::collections::HashMap;
use std::sync::Arc;

use super::{FetchType, KeyResults, OrgStrings, StringIndexer};

/// Start of the reserved id range. Backend ids never reach it.
pub const PREFIX: u64 = 1 << 63;

pub const SHARED_STRINGS: &[(&str, u64)] = &[
    // tag keys
    ("environment", PREFIX + 1),
    ("release", PREFIX + 2),
    ("session.status", PREFIX + 3),
    ("transaction", PREFIX + 4),
    ("transaction.status", PREFIX + 5),
    ("transaction.op", PREFIX + 6),
    ("http.method", PREFIX + 7),
    ("http.status_code", PREFIX + 8),
    ("browser.name", PREFIX + 9),
    ("os.name", PREFIX + 10),
    ("geo.country_code", PREFIX + 11),
    ("platform", PREFIX + 12),
    ("satisfaction", PREFIX + 13),
    ("measurement_rating", PREFIX + 14),
    ("span.op", PREFIX + 15),
    ("span.module", PREFIX + 16),
    // release health metric names
    ("c:sessions/session@none", PREFIX + 100),
    ("s:sessions/user@none", PREFIX + 101),
    ("s:sessions/error@none", PREFIX + 102),
    ("d:sessions/duration@second", PREFIX + 103),
    // session.status values
    ("init", PREFIX + 200),
    ("healthy", PREFIX + 201),
    ("abnormal", PREFIX + 202),
    ("crashed", PREFIX + 203),
    ("errored", PREFIX + 204),
    ("exited", PREFIX + 205),
    ("errored_preaggr", PREFIX + 206),
    // transaction metric names
    ("d:transactions/duration@millisecond", PREFIX + 300),
    ("c:transactions/count_per_root_project@none", PREFIX + 301),
    ("s:transactions/user@none", PREFIX + 302),
    ("d:transactions/measurements.lcp@millisecond", PREFIX + 303),
    ("d:transactions/measurements.fcp@millisecond", PREFIX + 304),
    // transaction.status values
    ("ok", PREFIX + 400),
    ("cancelled", PREFIX + 401),
    ("unknown", PREFIX + 402),
    ("internal_error", PREFIX + 403),
    ("not_found", PREFIX + 404),
    ("deadline_exceeded", PREFIX + 405),
    // satisfaction values
    ("satisfied", PREFIX + 500),
    ("tolerated", PREFIX + 501),
    ("frustrated", PREFIX + 502),
];

/// Serves [`SHARED_STRINGS`] and forwards everything else to `inner`
pub struct StaticStringIndexer {
    inner: Arc<dyn StringIndexer>,
    forward: HashMap<&'static str, u64>,
    reverse: HashMap<u64, &'static str>,
}

impl StaticStringIndexer {
    pub fn new(inner: Arc<dyn StringIndexer>) -> Self {
        Self {
            inner,
            forward: SHARED_STRINGS.iter().copied().collect(),
            reverse: SHARED_STRINGS.iter().map(|(s, id)| (*id, *s)).collect(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.name()
    }
}

#[async_trait]
impl StringIndexer for StaticStringIndexer {
    async fn bulk_record(&self, mut strings: OrgStrings) -> IndexerResult<KeyResults> {
        let mut results = KeyResults::new();

        strings.retain(|org_id, s| match self.forward.get(s) {
            Some(id) => {
                results.add_key_result(org_id, s, *id, FetchType::Hardcoded);
                false
            }
            None => true,
        });

        if !strings.is_empty() {
            results.merge(self.inner.bulk_record(strings).await?);
        }
        Ok(results)
    }

    async fn resolve(&self, org_id: OrgId, string: &str) -> IndexerResult<Option<u64>> {
        match self.forward.get(string) {
            Some(id) => Ok(Some(*id)),
            None => self.inner.resolve(org_id, string).await,
        }
    }

    async fn reverse_resolve(&self, org_id: OrgId, id: u64) -> IndexerResult<Option<String>> {
        if id >= PREFIX {
            return Ok(self.reverse.get(&id).map(|s| s.to_string()));
        }
        self.inner.reverse_resolve(org_id, id).await
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
