//! Dual-keyed handle index.
//!
//! Every peer indexes its handles twice: by local id and by the identity of
//! the node the handle points at. Writers mutate only under the peer lock;
//! readers never take it. Instead the two maps live in one immutable root
//! behind an [`ArcSwap`]: a writer clones the root, applies its change and
//! swaps, a reader loads whatever root is current and walks a fully
//! consistent pair of trees.
//!
//! Lookup semantics follow from ids never being reused: a positive by-id hit
//! is authoritative even against a concurrent writer, and a miss is
//! authoritative for the snapshot it was taken from. A positive by-node hit
//! can race the handle's release; the caller re-checks acquirability and
//! retries against a fresh snapshot (see the transfer instantiation path).

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::handle::HandleRef;
use crate::id::HandleId;

#[derive(Default)]
struct IndexRoot {
    by_id: BTreeMap<HandleId, HandleRef>,
    by_node: BTreeMap<u64, HandleRef>,
}

pub(crate) struct HandleIndex {
    root: ArcSwap<IndexRoot>,
}

impl Default for HandleIndex {
    fn default() -> Self {
        Self {
            root: ArcSwap::from_pointee(IndexRoot::default()),
        }
    }
}

impl HandleIndex {
    /// Look up a handle by its local id.
    pub(crate) fn lookup_id(&self, id: HandleId) -> Option<HandleRef> {
        self.root.load().by_id.get(&id).cloned()
    }

    /// Look up this peer's handle for the node identified by `node_seed`.
    pub(crate) fn lookup_node(&self, node_seed: u64) -> Option<HandleRef> {
        self.root.load().by_node.get(&node_seed).cloned()
    }

    /// Number of linked handles.
    pub(crate) fn len(&self) -> usize {
        self.root.load().by_id.len()
    }

    /// Link a handle under both keys. Caller holds the peer lock and has
    /// already assigned the id.
    pub(crate) fn insert(&self, handle: HandleRef) {
        let id = handle.id();
        let node_seed = handle.node().seed();
        debug_assert!(!id.is_invalid());

        let cur = self.root.load_full();
        let mut by_id = cur.by_id.clone();
        let mut by_node = cur.by_node.clone();
        by_id.insert(id, handle.clone());
        by_node.insert(node_seed, handle);
        self.root.store(Arc::new(IndexRoot { by_id, by_node }));
    }

    /// Unlink a handle from both keys. Caller holds the peer lock. A handle
    /// that was already removed (peer reset swapped the whole root out) is
    /// left alone.
    pub(crate) fn remove(&self, handle: &HandleRef) {
        let id = handle.id();
        let node_seed = handle.node().seed();

        let cur = self.root.load_full();
        if !cur.by_id.contains_key(&id) {
            return;
        }
        let mut by_id = cur.by_id.clone();
        let mut by_node = cur.by_node.clone();
        by_id.remove(&id);
        by_node.remove(&node_seed);
        self.root.store(Arc::new(IndexRoot { by_id, by_node }));
    }

    /// Swap the whole index for an empty one and hand back every handle that
    /// was linked, in id order. Used by peer reset and shutdown: concurrent
    /// readers keep whatever snapshot they already loaded, new readers see
    /// the empty index immediately.
    pub(crate) fn take_all(&self) -> Vec<HandleRef> {
        let old = self.root.swap(Arc::new(IndexRoot::default()));
        old.by_id.values().cloned().collect()
    }
}
