//! The thunk model and its on-disk encoding.
//!
//! A thunk is a hermetic description of one process invocation: the command
//! line, the environment, the content-addressed inputs it may read, and the
//! output tags it promises to produce. Thunks are themselves blobs: the
//! canonical JSON encoding is what gets hashed, so rewriting a dependency
//! list deterministically yields the rewritten thunk's new name.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ThunkError;
use crate::hash::{Hash, ObjectType};
use crate::store::BlobStore;

/// One computation, immutable once written.
///
/// Field order is load-bearing: the content hash is computed over the JSON
/// encoding, which serializes fields in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thunk {
    /// The command line. An argument that is exactly an input hash is
    /// resolved by the engine to the staged path of that blob; `args[0]`
    /// must resolve to an Executable input.
    pub args: Vec<String>,
    /// `KEY=VALUE` environment entries.
    pub envars: Vec<String>,
    /// Dependency names: Thunk, Value, Executable, or `h#tag` references
    /// to another thunk's declared output.
    pub inputs: Vec<Hash>,
    /// Declared output tags; the first is the primary output.
    pub outputs: Vec<String>,
}

/// One named output of a successful reduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThunkOutput {
    pub hash: Hash,
    pub tag: String,
}

impl Thunk {
    /// The canonical encoding, the byte string the thunk's name is
    /// computed over.
    pub fn encode(&self) -> Result<Vec<u8>, ThunkError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The content-addressed name of this thunk.
    pub fn hash(&self) -> Result<Hash, ThunkError> {
        Ok(Hash::of_bytes(ObjectType::Thunk, self.encode()?))
    }

    /// Loads the thunk named by `hash` from the store.
    pub fn read(store: &BlobStore, hash: &Hash) -> Result<Self, ThunkError> {
        if !hash.is_thunk() {
            return Err(ThunkError::NotAThunk(hash.clone()));
        }

        let bytes = store.read_blob(hash)?;
        let thunk: Thunk = serde_json::from_slice(&bytes)?;

        if thunk.outputs.is_empty() {
            return Err(ThunkError::NoOutputs(hash.clone()));
        }

        Ok(thunk)
    }

    /// Persists the thunk and returns its name.
    pub fn write(&self, store: &BlobStore) -> Result<Hash, ThunkError> {
        let bytes = self.encode()?;
        let hash = Hash::of_bytes(ObjectType::Thunk, &bytes);
        store.put_blob(&hash, &bytes)?;
        Ok(hash)
    }

    /// Replaces every input found in `map` with its substitute, and keeps
    /// hash-valued arguments in sync so they still name an input after the
    /// rewrite. Returns whether anything changed (and therefore whether
    /// the thunk's name changed).
    pub fn substitute(&mut self, map: &HashMap<Hash, Hash>) -> bool {
        let mut changed = false;

        for input in &mut self.inputs {
            if let Some(replacement) = map.get(input) {
                *input = replacement.clone();
                changed = true;
            }
        }

        for arg in &mut self.args {
            if let Ok(hash) = Hash::parse(arg)
                && let Some(replacement) = map.get(&hash)
            {
                *arg = replacement.to_string();
                changed = true;
            }
        }

        changed
    }

    /// Number of inputs that still need reduction.
    pub fn pending_inputs(&self) -> usize {
        self.inputs.iter().filter(|i| i.is_thunk()).count()
    }

    /// Order-one: every input is already a terminal blob.
    pub fn is_reducible(&self) -> bool {
        self.pending_inputs() == 0
    }

    pub fn thunk_inputs(&self) -> impl Iterator<Item = &Hash> {
        self.inputs.iter().filter(|i| i.is_thunk())
    }

    pub fn value_inputs(&self) -> impl Iterator<Item = &Hash> {
        self.inputs
            .iter()
            .filter(|i| i.object_type() == ObjectType::Value)
    }

    pub fn executable_inputs(&self) -> impl Iterator<Item = &Hash> {
        self.inputs
            .iter()
            .filter(|i| i.object_type() == ObjectType::Executable)
    }

    pub fn primary_tag(&self) -> &str {
        &self.outputs[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().join("store");
        (dir, BlobStore::open(root).unwrap())
    }

    fn value(data: &[u8]) -> Hash {
        Hash::of_bytes(ObjectType::Value, data)
    }

    fn sample(inputs: Vec<Hash>) -> Thunk {
        Thunk {
            args: vec!["cc".into(), "-o".into(), "out".into()],
            envars: vec!["LANG=C".into()],
            inputs,
            outputs: vec!["out".into()],
        }
    }

    #[test]
    fn hashing_is_deterministic() {
        let a = sample(vec![value(b"x")]);
        let b = sample(vec![value(b"x")]);
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn substitution_renames_the_thunk() {
        let dep = Hash::of_bytes(ObjectType::Thunk, b"dep");
        let mut thunk = sample(vec![dep.clone()]);
        let before = thunk.hash().unwrap();

        let map = HashMap::from([(dep, value(b"forced"))]);
        assert!(thunk.substitute(&map));

        let after = thunk.hash().unwrap();
        assert_ne!(before, after);
        assert!(thunk.is_reducible());

        // Nothing left to substitute.
        assert!(!thunk.clone().substitute(&map));
    }

    #[test]
    fn substitution_keeps_args_in_sync() {
        let dep = Hash::of_bytes(ObjectType::Thunk, b"dep");
        let forced = value(b"forced");
        let mut thunk = sample(vec![dep.clone()]);
        thunk.args = vec!["tool".into(), dep.to_string()];

        let map = HashMap::from([(dep, forced.clone())]);
        thunk.substitute(&map);

        assert_eq!(thunk.args, vec!["tool".to_string(), forced.to_string()]);
    }

    #[test]
    fn reducibility_counts_thunk_inputs() {
        let dep = Hash::of_bytes(ObjectType::Thunk, b"dep");
        let tagged = dep.for_output("out");
        let thunk = sample(vec![dep, tagged, value(b"v")]);

        assert_eq!(thunk.pending_inputs(), 2);
        assert!(!thunk.is_reducible());
    }

    #[test]
    fn store_round_trip() {
        let (_dir, store) = store();
        let thunk = sample(vec![value(b"v")]);

        let hash = thunk.write(&store).unwrap();
        let loaded = Thunk::read(&store, &hash).unwrap();

        assert_eq!(thunk, loaded);
        assert_eq!(loaded.hash().unwrap(), hash);
    }

    #[test]
    fn read_rejects_non_thunks_and_empty_outputs() {
        let (_dir, store) = store();

        let v = value(b"v");
        assert!(matches!(
            Thunk::read(&store, &v),
            Err(ThunkError::NotAThunk(_))
        ));

        let mut bad = sample(vec![]);
        bad.outputs.clear();
        let bytes = bad.encode().unwrap();
        let hash = Hash::of_bytes(ObjectType::Thunk, &bytes);
        store.put_blob(&hash, &bytes).unwrap();

        assert!(matches!(
            Thunk::read(&store, &hash),
            Err(ThunkError::NoOutputs(_))
        ));
    }
}
