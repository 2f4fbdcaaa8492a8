//! The persistent reduction cache.
//!
//! A reduction entry records that a thunk was already executed: the key is
//! the thunk's hash, the value a [`ReductionResult`]. Order 0 means the
//! result is terminal; order ≥ 1 means the reduction was staged and the
//! result is itself a thunk. Entries live as individual files so the cache
//! can be shared between processes with nothing but atomic renames.

use std::collections::HashSet;
use std::fs;

use camino::Utf8PathBuf;

use crate::error::CacheError;
use crate::hash::Hash;
use crate::store::{self, BlobStore};

/// Highest staged-reduction order ever looked up. Deeper chains are
/// expressed as chases over multiple entries, not higher orders.
const MAX_ORDER: usize = 8;

/// A recorded reduction: what a thunk-hash reduced to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReductionResult {
    pub hash: Hash,
    pub order: usize,
}

#[derive(Debug, Clone)]
pub struct ReductionCache {
    store: BlobStore,
}

impl ReductionCache {
    pub fn new(store: BlobStore) -> Self {
        Self { store }
    }

    fn entry_path(&self, key: &Hash, order: usize) -> Utf8PathBuf {
        self.store.reductions_dir().join(format!("{key}#{order}"))
    }

    /// Looks up the reduction recorded for `key`, lowest order first.
    /// Pure: never mutates the cache.
    pub fn check(&self, key: &Hash) -> Result<Option<ReductionResult>, CacheError> {
        for order in 0..=MAX_ORDER {
            let path = self.entry_path(key, order);

            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let hash = Hash::parse(raw.trim()).map_err(|source| CacheError::Corrupt {
                key: key.clone(),
                source,
            })?;

            return Ok(Some(ReductionResult { hash, order }));
        }

        Ok(None)
    }

    /// Records a reduction. Writes are monotone: once a key has an entry at
    /// a given order, later writers are no-ops, so racing duplicate
    /// executions collapse to the first result.
    pub fn insert(&self, key: &Hash, result: &ReductionResult) -> Result<(), CacheError> {
        let path = self.entry_path(key, result.order);
        if path.exists() {
            return Ok(());
        }

        store::atomic_write(
            &self.store.reductions_dir(),
            &path,
            result.hash.as_str().as_bytes(),
        )
        .map_err(|e| match e {
            crate::error::StoreError::Io(io) => CacheError::Io(io),
            other => CacheError::Io(std::io::Error::other(other.to_string())),
        })
    }

    /// The Reductor's chasing rule: follow recorded reductions until no
    /// further hop exists, returning the last name reached (which is `key`
    /// itself when nothing is cached).
    pub fn chase(&self, key: &Hash) -> Result<Hash, CacheError> {
        let mut current = key.clone();
        let mut seen = HashSet::new();

        while let Some(entry) = self.check(&current)? {
            if !seen.insert(current.clone()) {
                break;
            }
            current = entry.hash;
        }

        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ObjectType;
    use camino::Utf8Path;

    fn cache() -> (tempfile::TempDir, ReductionCache) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().join("store");
        let store = BlobStore::open(root).unwrap();
        (dir, ReductionCache::new(store))
    }

    fn thunk(data: &[u8]) -> Hash {
        Hash::of_bytes(ObjectType::Thunk, data)
    }

    fn value(data: &[u8]) -> Hash {
        Hash::of_bytes(ObjectType::Value, data)
    }

    #[test]
    fn check_misses_on_empty_cache() {
        let (_dir, cache) = cache();
        assert_eq!(cache.check(&thunk(b"t")).unwrap(), None);
    }

    #[test]
    fn insert_then_check() {
        let (_dir, cache) = cache();
        let key = thunk(b"t");
        let result = ReductionResult {
            hash: value(b"v"),
            order: 0,
        };

        cache.insert(&key, &result).unwrap();
        assert_eq!(cache.check(&key).unwrap(), Some(result));
    }

    #[test]
    fn inserts_are_monotone() {
        let (_dir, cache) = cache();
        let key = thunk(b"t");
        let first = ReductionResult {
            hash: value(b"first"),
            order: 0,
        };
        let second = ReductionResult {
            hash: value(b"second"),
            order: 0,
        };

        cache.insert(&key, &first).unwrap();
        cache.insert(&key, &second).unwrap();

        assert_eq!(cache.check(&key).unwrap(), Some(first));
    }

    #[test]
    fn lowest_order_wins() {
        let (_dir, cache) = cache();
        let key = thunk(b"t");
        let staged = ReductionResult {
            hash: thunk(b"t2"),
            order: 1,
        };
        let terminal = ReductionResult {
            hash: value(b"v"),
            order: 0,
        };

        cache.insert(&key, &staged).unwrap();
        cache.insert(&key, &terminal).unwrap();

        assert_eq!(cache.check(&key).unwrap(), Some(terminal));
    }

    #[test]
    fn chase_follows_staged_reductions() {
        let (_dir, cache) = cache();
        let a = thunk(b"a");
        let b = thunk(b"b");
        let v = value(b"v");

        cache
            .insert(&a, &ReductionResult { hash: b.clone(), order: 1 })
            .unwrap();
        cache
            .insert(&b, &ReductionResult { hash: v.clone(), order: 0 })
            .unwrap();

        assert_eq!(cache.chase(&a).unwrap(), v);

        // Idempotence: chasing a chased name goes nowhere further.
        assert_eq!(cache.chase(&v).unwrap(), v);
    }
}
