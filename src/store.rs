//! The on-disk content-addressed blob store.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/blobs/<hash>            raw content
//! <root>/reductions/<key>#<n>    reduction results (see the cache module)
//! <root>/scratch/                per-job working directories
//! ```
//!
//! The store is shared with other processes. Every write lands in a
//! temporary file first and is renamed into place, so concurrent readers
//! observe either the old content or the new, never a torn write.

use std::fs;
use std::io::Write;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{NamedTempFile, TempDir};

use crate::error::StoreError;
use crate::hash::Hash;

/// Default store root, relative to the working directory.
pub const DEFAULT_ROOT: &str = ".oroshi";

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: Utf8PathBuf,
}

impl BlobStore {
    /// Opens the store at `root`, creating the layout on first use.
    pub fn open(root: impl AsRef<Utf8Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_owned();

        for dir in ["blobs", "reductions", "scratch"] {
            fs::create_dir_all(root.join(dir))
                .map_err(|e| StoreError::Root(root.clone(), e))?;
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Where the content named by `hash` lives. Tagged references share
    /// their base thunk's blob.
    pub fn blob_path(&self, hash: &Hash) -> Utf8PathBuf {
        self.root.join("blobs").join(hash.base())
    }

    pub(crate) fn reductions_dir(&self) -> Utf8PathBuf {
        self.root.join("reductions")
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.blob_path(hash).exists()
    }

    pub fn read_blob(&self, hash: &Hash) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(hash);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::MissingBlob(hash.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stores `bytes` under `hash`. Content addressing makes this
    /// write-once: an existing blob is left untouched.
    pub fn put_blob(&self, hash: &Hash, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.blob_path(hash);
        if path.exists() {
            return Ok(());
        }
        atomic_write(&self.root.join("blobs"), &path, bytes)
    }

    /// A disposable working directory on the same filesystem as the store.
    pub fn scratch_dir(&self) -> Result<TempDir, StoreError> {
        Ok(TempDir::new_in(self.root.join("scratch"))?)
    }
}

/// Temp-file-and-rename write. Losing a rename race to an identical writer
/// is a success.
pub(crate) fn atomic_write(
    dir: &Utf8Path,
    path: impl AsRef<Path>,
    bytes: &[u8],
) -> Result<(), StoreError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;

    match tmp.persist_noclobber(path.as_ref()) {
        Ok(_) => Ok(()),
        Err(e) if path.as_ref().exists() => {
            drop(e);
            Ok(())
        }
        Err(e) => Err(StoreError::Io(e.error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ObjectType;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().join("store");
        let store = BlobStore::open(root).unwrap();
        (dir, store)
    }

    #[test]
    fn blob_round_trip() {
        let (_dir, store) = store();
        let hash = Hash::of_bytes(ObjectType::Value, b"payload");

        assert!(!store.contains(&hash));
        store.put_blob(&hash, b"payload").unwrap();
        assert!(store.contains(&hash));
        assert_eq!(store.read_blob(&hash).unwrap(), b"payload");
    }

    #[test]
    fn missing_blob_is_reported_by_name() {
        let (_dir, store) = store();
        let hash = Hash::of_bytes(ObjectType::Value, b"absent");

        match store.read_blob(&hash) {
            Err(StoreError::MissingBlob(h)) => assert_eq!(h, hash),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn puts_are_idempotent() {
        let (_dir, store) = store();
        let hash = Hash::of_bytes(ObjectType::Value, b"same");

        store.put_blob(&hash, b"same").unwrap();
        store.put_blob(&hash, b"same").unwrap();
        assert_eq!(store.read_blob(&hash).unwrap(), b"same");
    }

    #[test]
    fn tagged_reference_reads_base_blob() {
        let (_dir, store) = store();
        let thunk = Hash::of_bytes(ObjectType::Thunk, b"thunk-bytes");
        store.put_blob(&thunk, b"thunk-bytes").unwrap();

        let tagged = thunk.for_output("out");
        assert_eq!(store.read_blob(&tagged).unwrap(), b"thunk-bytes");
    }
}
