//! In-memory string store
//!
//! Ids are allocated sequentially from 1, shared across organizations, so a
//! fixed sequence of inserts always yields the same ids.

use metrics_indexer_core::{IndexerResult, OrgId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::store::{StoredId, StringStore};

#[derive(Debug)]
struct Tables {
    forward: HashMap<(OrgId, String), u64>,
    reverse: HashMap<(OrgId, u64), String>,
    next_id: u64,
}

#[derive(Debug)]
pub struct MemoryStringStore {
    tables: RwLock<Tables>,
}

impl Default for MemoryStringStore {
    fn default() -> Self {
        Self {
            tables: RwLock::new(Tables {
                forward: HashMap::new(),
                reverse: HashMap::new(),
                next_id: 1,
            }),
        }
    }
}

impl MemoryStringStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored (org, string) pairs
    pub fn len(&self) -> usize {
        self.tables.read().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StringStore for MemoryStringStore {
    fn get_many(
        &self,
        org_id: OrgId,
        strings: &BTreeSet<String>,
    ) -> IndexerResult<BTreeMap<String, u64>> {
        let tables = self.tables.read();
        Ok(strings
            .iter()
            .filter_map(|s| {
                tables
                    .forward
                    .get(&(org_id, s.clone()))
                    .map(|id| (s.clone(), *id))
            })
            .collect())
    }

    fn create_many(
        &self,
        org_id: OrgId,
        strings: &BTreeSet<String>,
    ) -> IndexerResult<BTreeMap<String, StoredId>> {
        let mut tables = self.tables.write();
        let mut created = BTreeMap::new();

        for s in strings {
            let key = (org_id, s.clone());
            let stored = match tables.forward.get(&key) {
                Some(id) => StoredId {
                    id: *id,
                    created: false,
                },
                None => {
                    let id = tables.next_id;
                    tables.next_id += 1;
                    tables.forward.insert(key, id);
                    tables.reverse.insert((org_id, id), s.clone());
                    StoredId { id, created: true }
                }
            };
            created.insert(s.clone(), stored);
        }

        Ok(created)
    }

    fn reverse(&self, org_id: OrgId, id: u64) -> IndexerResult<Option<String>> {
        Ok(self.tables.read().reverse.get(&(org_id, id)).cloned())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
