//! Stable series fingerprints
//!
//! A fingerprint identifies one (org, use case, metric, tags) series. It is
//! xxh3 over a length-prefixed encoding so that it is stable across processes
//! and unambiguous for strings containing separator characters.

use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

use crate::metric_name::MetricName;
use crate::tags::TagSet;
use crate::use_case::UseCaseId;
use crate::OrgId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn compute(org_id: OrgId, use_case: UseCaseId, name: &MetricName, tags: &TagSet) -> Self {
        let mut hasher = Xxh3::new();
        hasher.update(&org_id.to_le_bytes());
        write_str(&mut hasher, use_case.as_str());
        write_str(&mut hasher, name.as_str());
        hasher.update(&(tags.len() as u64).to_le_bytes());
        for (key, value) in tags.iter() {
            write_str(&mut hasher, key);
            write_str(&mut hasher, value);
        }
        Self(hasher.digest())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

fn write_str(hasher: &mut Xxh3, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> MetricName {
        MetricName::new(s).unwrap()
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let tags: TagSet = [("env", "prod"), ("region", "eu")].into_iter().collect();
        let reordered: TagSet = [("region", "eu"), ("env", "prod")].into_iter().collect();

        let a = Fingerprint::compute(1, UseCaseId::Transactions, &name("c:transactions/count@none"), &tags);
        let b = Fingerprint::compute(1, UseCaseId::Transactions, &name("c:transactions/count@none"), &reordered);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_separates_fields() {
        let metric = name("c:transactions/count@none");
        let empty = TagSet::new();

        let base = Fingerprint::compute(1, UseCaseId::Transactions, &metric, &empty);
        assert_ne!(base, Fingerprint::compute(2, UseCaseId::Transactions, &metric, &empty));
        assert_ne!(base, Fingerprint::compute(1, UseCaseId::Spans, &metric, &empty));

        // "a"="bc" and "ab"="c" must not collide
        let left: TagSet = [("a", "bc")].into_iter().collect();
        let right: TagSet = [("ab", "c")].into_iter().collect();
        assert_ne!(
            Fingerprint::compute(1, UseCaseId::Custom, &metric, &left),
            Fingerprint::compute(1, UseCaseId::Custom, &metric, &right)
        );
    }
}
