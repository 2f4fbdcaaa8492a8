//! The in-memory reduction graph.
//!
//! Live thunks are nodes of a [`StableDiGraph`] with edges pointing
//! dependency → dependent. Node indices give every thunk a stable identity
//! across content rewrites; the current content hash of each node is kept
//! in a side index, and two rename maps (`original` ⇄ `updated`) let
//! callers recover "the new name of what I added" at any point, including
//! after a node has been forced out of the live graph.
//!
//! Forcing a thunk substitutes its outputs into every dependent, which
//! changes those dependents' content and therefore their names. The
//! cascade visits affected nodes in topological order so each is rewritten
//! exactly once per force.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{Dfs, Reversed, Topo};
use tracing::debug;

use crate::error::GraphError;
use crate::hash::{Hash, ObjectType};
use crate::store::BlobStore;
use crate::thunk::{Thunk, ThunkOutput};

struct Node {
    hash: Hash,
    thunk: Thunk,
    /// Number of inputs still classified as Thunk. Zero means order-one.
    pending: usize,
}

pub struct DepGraph {
    store: BlobStore,
    graph: StableDiGraph<Node, ()>,
    /// Current content hash → live node.
    index: HashMap<Hash, NodeIndex>,
    /// Original name → current (or final forced) name.
    updated: HashMap<Hash, Hash>,
    /// Current or forced name → original name. Kept as history so late
    /// completions can still be attributed.
    original: HashMap<Hash, Hash>,
}

impl DepGraph {
    pub fn new(store: BlobStore) -> Self {
        Self {
            store,
            graph: StableDiGraph::new(),
            index: HashMap::new(),
            updated: HashMap::new(),
            original: HashMap::new(),
        }
    }

    /// Loads the thunk named by `hash` and inserts it together with every
    /// transitive thunk dependency. Idempotent.
    pub fn add_thunk(&mut self, hash: &Hash) -> Result<(), GraphError> {
        let mut pending_edges: Vec<(Hash, NodeIndex)> = Vec::new();
        let mut stack = vec![hash.to_base()];

        while let Some(current) = stack.pop() {
            if self.index.contains_key(&current) {
                continue;
            }

            let thunk = Thunk::read(&self.store, &current)?;
            let pending = thunk.pending_inputs();
            let deps: Vec<Hash> = thunk.thunk_inputs().map(Hash::to_base).collect();

            let idx = self.graph.add_node(Node {
                hash: current.clone(),
                thunk,
                pending,
            });

            for dep in deps {
                pending_edges.push((dep.clone(), idx));
                stack.push(dep);
            }

            self.index.insert(current.clone(), idx);
            self.updated.insert(current.clone(), current.clone());
            self.original.insert(current.clone(), current);
        }

        for (dep, parent) in pending_edges {
            let dep_idx = self.index[&dep];
            self.graph.update_edge(dep_idx, parent, ());
        }

        // Content addressing makes cycles unconstructible; verify anyway so
        // a corrupted store fails loudly instead of hanging the scheduler.
        if petgraph::algo::toposort(&self.graph, None).is_err() {
            return Err(GraphError::Cycle(hash.clone()));
        }

        Ok(())
    }

    /// Every thunk at or below `hash` that is ready to execute.
    pub fn order_one_dependencies(&self, hash: &Hash) -> HashSet<Hash> {
        let mut ready = HashSet::new();

        let Some(&idx) = self.index.get(hash) else {
            return ready;
        };

        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, idx);
        while let Some(nx) = dfs.next(reversed) {
            let node = &self.graph[nx];
            if node.pending == 0 {
                ready.insert(node.hash.clone());
            }
        }

        ready
    }

    pub fn get_thunk(&self, hash: &Hash) -> Option<&Thunk> {
        self.index.get(hash).map(|&idx| &self.graph[idx].thunk)
    }

    /// Applies a reduction to the live graph.
    ///
    /// Substitutes the outputs into every dependent, rewrites the affected
    /// subgraph and returns the set of thunks that became ready. Returns
    /// `None` when `hash` is not live — the duplicate-completion no-op.
    pub fn force(
        &mut self,
        hash: &Hash,
        outputs: &[ThunkOutput],
    ) -> Result<Option<HashSet<Hash>>, GraphError> {
        let Some(primary) = outputs.first() else {
            return Ok(None);
        };
        let Some(idx) = self.index.remove(hash) else {
            return Ok(None);
        };

        let orig = self
            .original
            .get(hash)
            .cloned()
            .unwrap_or_else(|| hash.clone());
        let primary = primary.hash.clone();

        let mut subst: HashMap<Hash, Hash> = HashMap::new();
        subst.insert(hash.clone(), primary.clone());
        for output in outputs {
            subst.insert(hash.for_output(&output.tag), output.hash.clone());
        }

        let dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        self.graph.remove_node(idx);

        let mut newly_ready = HashSet::new();

        if primary.is_thunk() {
            // Staged reduction: the computation continues under a new
            // thunk, which inherits the original name. Its own frontier
            // becomes ready work.
            self.add_thunk(&primary)?;
            let new_idx = self.index[&primary];
            self.updated.insert(orig.clone(), primary.clone());
            self.original.insert(primary.clone(), orig);
            for &dependent in &dependents {
                self.graph.update_edge(new_idx, dependent, ());
            }
            newly_ready.extend(self.order_one_dependencies(&primary));
        } else {
            self.updated.insert(orig, hash.clone());
        }

        debug!(forced = %hash, primary = %primary, "applying reduction");

        // Everything downstream of the forced node may change its name.
        let mut affected: HashSet<NodeIndex> = HashSet::new();
        for &dependent in &dependents {
            let mut dfs = Dfs::new(&self.graph, dependent);
            while let Some(nx) = dfs.next(&self.graph) {
                affected.insert(nx);
            }
        }

        let mut topo = Topo::new(&self.graph);
        while let Some(nx) = topo.next(&self.graph) {
            if !affected.contains(&nx) {
                continue;
            }

            let (changed, old_hash, was_pending) = {
                let node = &mut self.graph[nx];
                let changed = node.thunk.substitute(&subst);
                (changed, node.hash.clone(), node.pending)
            };

            if !changed {
                continue;
            }

            let (new_bytes, new_pending) = {
                let node = &self.graph[nx];
                (node.thunk.encode()?, node.thunk.pending_inputs())
            };
            let new_hash = Hash::of_bytes(ObjectType::Thunk, &new_bytes);

            // Engines read thunks from the store, so the rewritten
            // content must exist under its new name before dispatch.
            self.store.put_blob(&new_hash, &new_bytes)?;

            self.index.remove(&old_hash);
            self.index.insert(new_hash.clone(), nx);

            let node_orig = self
                .original
                .remove(&old_hash)
                .unwrap_or_else(|| old_hash.clone());
            self.original.insert(new_hash.clone(), node_orig.clone());
            self.updated.insert(node_orig, new_hash.clone());

            subst.insert(old_hash, new_hash.clone());

            let node = &mut self.graph[nx];
            node.hash = new_hash;
            node.pending = new_pending;

            if was_pending > 0 && new_pending == 0 {
                newly_ready.insert(node.hash.clone());
            }
        }

        Ok(Some(newly_ready))
    }

    /// The name under which a currently (or finally) known thunk was first
    /// inserted.
    pub fn original_hash(&self, hash: &Hash) -> Option<&Hash> {
        self.original.get(hash)
    }

    /// The current (or final forced) name of a thunk first inserted as
    /// `hash`.
    pub fn updated_hash(&self, hash: &Hash) -> Option<&Hash> {
        self.updated.get(hash)
    }

    /// Number of still-unresolved thunks.
    pub fn size(&self) -> usize {
        self.graph.node_count()
    }

    /// Terminal `Value` blobs referenced anywhere in the live graph.
    pub fn value_dependencies(&self) -> HashSet<Hash> {
        self.graph
            .node_weights()
            .flat_map(|node| node.thunk.value_inputs().cloned())
            .collect()
    }

    /// Terminal `Executable` blobs referenced anywhere in the live graph.
    pub fn executable_dependencies(&self) -> HashSet<Hash> {
        self.graph
            .node_weights()
            .flat_map(|node| node.thunk.executable_inputs().cloned())
            .collect()
    }
}
