//! Persistent string store using Fjall
//!
//! Three partitions hold the mapping:
//! - `strings`: `org_id (BE) ++ string` -> `id (BE)`
//! - `reverse`: `org_id (BE) ++ id (BE)` -> `string`
//! - `meta`: `next_id` -> next id to allocate (BE)
//!
//! Creates are serialized by a lock that also owns the id counter and are
//! committed as one batch, so ids survive restarts and are never reused.

use anyhow::{Context, Result};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use metrics_indexer_core::{IndexerError, IndexerResult, OrgId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::store::{StoredId, StringStore};

const NEXT_ID_KEY: &[u8] = b"next_id";

fn forward_key(org_id: OrgId, string: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + string.len());
    key.extend_from_slice(&org_id.to_be_bytes());
    key.extend_from_slice(string.as_bytes());
    key
}

fn reverse_key(org_id: OrgId, id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&org_id.to_be_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn decode_id(bytes: &[u8]) -> IndexerResult<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| IndexerError::backend(format!("Corrupt id of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

fn backend_error(context: &str, e: fjall::Error) -> IndexerError {
    IndexerError::backend(format!("{}: {}", context, e))
}

pub struct PersistentStringStore {
    keyspace: Keyspace,
    strings: PartitionHandle,
    reverse: PartitionHandle,
    meta: PartitionHandle,
    /// Next id to allocate; holding the lock serializes creates
    next_id: Mutex<u64>,
    data_dir: PathBuf,
}

impl PersistentStringStore {
    /// Open (or create) the store in `data_dir`
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();

        info!("Opening persistent string store at: {}", data_dir.display());

        std::fs::create_dir_all(data_dir)
            .context("Failed to create string store data directory")?;

        let keyspace = Config::new(data_dir)
            .open()
            .context("Failed to open Fjall keyspace")?;

        let strings = keyspace
            .open_partition("strings", PartitionCreateOptions::default())
            .context("Failed to open strings partition")?;
        let reverse = keyspace
            .open_partition("reverse", PartitionCreateOptions::default())
            .context("Failed to open reverse partition")?;
        let meta = keyspace
            .open_partition("meta", PartitionCreateOptions::default())
            .context("Failed to open meta partition")?;

        let next_id = match meta.get(NEXT_ID_KEY).context("Failed to read id counter")? {
            Some(value) => decode_id(&value)?,
            None => 1,
        };

        info!("Persistent string store ready, next id {}", next_id);

        Ok(Self {
            keyspace,
            strings,
            reverse,
            meta,
            next_id: Mutex::new(next_id),
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn lookup(&self, org_id: OrgId, string: &str) -> IndexerResult<Option<u64>> {
        match self
            .strings
            .get(forward_key(org_id, string))
            .map_err(|e| backend_error("Failed to read string", e))?
        {
            Some(value) => Ok(Some(decode_id(&value)?)),
            None => Ok(None),
        }
    }
}

impl StringStore for PersistentStringStore {
    fn get_many(
        &self,
        org_id: OrgId,
        strings: &BTreeSet<String>,
    ) -> IndexerResult<BTreeMap<String, u64>> {
        let mut found = BTreeMap::new();
        for s in strings {
            if let Some(id) = self.lookup(org_id, s)? {
                found.insert(s.clone(), id);
            }
        }
        Ok(found)
    }

    fn create_many(
        &self,
        org_id: OrgId,
        strings: &BTreeSet<String>,
    ) -> IndexerResult<BTreeMap<String, StoredId>> {
        let mut next_id = self.next_id.lock();
        let mut allocated = *next_id;
        let mut results = BTreeMap::new();
        let mut batch = self.keyspace.batch();

        for s in strings {
            // Another writer may have created it since the caller's lookup
            if let Some(id) = self.lookup(org_id, s)? {
                results.insert(s.clone(), StoredId { id, created: false });
                continue;
            }

            let id = allocated;
            allocated += 1;
            batch.insert(&self.strings, forward_key(org_id, s), id.to_be_bytes().to_vec());
            batch.insert(&self.reverse, reverse_key(org_id, id), s.as_bytes().to_vec());
            results.insert(s.clone(), StoredId { id, created: true });
        }

        if allocated == *next_id {
            return Ok(results);
        }

        batch.insert(&self.meta, NEXT_ID_KEY.to_vec(), allocated.to_be_bytes().to_vec());
        batch
            .commit()
            .map_err(|e| backend_error("Failed to commit string batch", e))?;
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(|e| backend_error("Failed to persist string batch", e))?;

        debug!(
            "Created {} strings for org {}",
            allocated - *next_id,
            org_id
        );
        *next_id = allocated;

        Ok(results)
    }

    fn reverse(&self, org_id: OrgId, id: u64) -> IndexerResult<Option<String>> {
        let value = self
            .reverse
            .get(reverse_key(org_id, id))
            .map_err(|e| backend_error("Failed to read reverse mapping", e))?;

        value
            .map(|bytes| {
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| IndexerError::backend(format!("Corrupt stored string: {}", e)))
            })
            .transpose()
    }

    fn name(&self) -> &'static str {
        "persistent"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_create_and_lookup() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStringStore::open(dir.path()).unwrap();

        let created = store.create_many(1, &set(&["a", "b"])).unwrap();
        assert!(created["a"].created);

        let found = store.get_many(1, &set(&["a", "b", "c"])).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["a"], created["a"].id);
        assert_eq!(
            store.reverse(1, created["b"].id).unwrap(),
            Some("b".to_string())
        );
        assert_eq!(store.reverse(2, created["b"].id).unwrap(), None);
    }

    #[test]
    fn test_ids_survive_reopen() {
        let dir = TempDir::new().unwrap();

        let first_id = {
            let store = PersistentStringStore::open(dir.path()).unwrap();
            store.create_many(1, &set(&["release"])).unwrap()["release"].id
        };

        let store = PersistentStringStore::open(dir.path()).unwrap();
        assert_eq!(store.get_many(1, &set(&["release"])).unwrap()["release"], first_id);

        // Counter resumes past existing ids
        let next = store.create_many(1, &set(&["other"])).unwrap()["other"].id;
        assert!(next > first_id);
    }

    #[test]
    fn test_create_existing_is_not_recreated() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStringStore::open(dir.path()).unwrap();

        let first = store.create_many(3, &set(&["x"])).unwrap()["x"];
        let second = store.create_many(3, &set(&["x"])).unwrap()["x"];
        assert_eq!(second, StoredId { id: first.id, created: false });
    }
}
