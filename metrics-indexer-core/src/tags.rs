//! Tag key-value pairs attached to a metric

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A set of tag key-value pairs. Keys are unique and iterate in sorted order,
/// which keeps fingerprints and string extraction deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet {
    tags: BTreeMap<String, String>,
}

impl TagSet {
    /// Create a new empty tag set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tag, returning the previous value for the key
    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) -> Option<String> {
        self.tags.insert(key.into(), value.into())
    }

    /// Get a tag value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Check if a tag key exists
    pub fn contains_key(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    /// Remove a tag by key
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.tags.remove(key)
    }

    /// Keep only the tags matching the predicate
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.tags.retain(|k, v| keep(k, v));
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Iterate over tag key-value pairs in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.tags.values().map(String::as_str)
    }

    /// `k1=v1,k2=v2` in key order, for log output
    pub fn to_canonical_format(&self) -> String {
        self.iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            tags: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_set_operations() {
        let mut tags = TagSet::new();
        tags.insert("host", "server1");

        assert_eq!(tags.len(), 1);
        assert!(tags.contains_key("host"));
        assert_eq!(tags.get("host"), Some("server1"));

        assert_eq!(tags.insert("host", "server2"), Some("server1".to_string()));
        tags.remove("host");
        assert!(tags.is_empty());
    }

    #[test]
    fn test_canonical_format_is_sorted() {
        let tags: TagSet = [("region", "us-east-1"), ("env", "prod")].into_iter().collect();
        assert_eq!(tags.to_canonical_format(), "env=prod,region=us-east-1");
    }

    #[test]
    fn test_retain() {
        let mut tags: TagSet = [("a", "1"), ("b", "2"), ("c", "3")].into_iter().collect();
        tags.retain(|k, _| k != "b");
        assert_eq!(tags.keys().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let tags: TagSet = [("env", "prod")].into_iter().collect();
        assert_eq!(serde_json::to_string(&tags).unwrap(), r#"{"env":"prod"}"#);
    }
}
