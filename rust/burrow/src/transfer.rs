//! Transfer and inflight batches.
//!
//! A send pins its handles twice over. The *transfer* belongs to the sender:
//! every input id is resolved and acquired there (or allocates a fresh
//! node+owner when the ALLOCATE bit asks for one). From it, one *inflight*
//! per destination resolves the same nodes on the receiver side, reusing the
//! receiver's existing handle where there is one and minting an unattached
//! copy where there is not.
//!
//! Installation never holds two peer locks at once: fresh transfer nodes
//! attach and install under the sender's lock; fresh receiver copies of
//! sender-owned nodes attach under that same lock; copies of third-party
//! nodes attach via the owner's own lock; finally everything installs under
//! the receiver's lock, switching over to a concurrently installed sibling
//! when the index already has one.
//!
//! Commit converts each pinned handle into the id the receiver will see,
//! checking the transaction stamp against node destruction. Stale inputs
//! travel as INVALID instead of failing the send.

use std::sync::Arc;

use crate::errors::OpError;
use crate::handle::{self, HandleRef, Node};
use crate::id::HandleId;
use crate::peer::Peer;

#[derive(Debug)]
struct TransferEntry {
    handle: Option<HandleRef>,
    /// Node was allocated by this very send; its owner id is reported back
    /// to the sender after commit.
    fresh: bool,
}

/// Sender-side batch: one pinned (or null) handle per input id.
#[derive(Debug)]
pub(crate) struct Transfer {
    entries: Vec<TransferEntry>,
    /// Fresh nodes still waiting for their attach+install on the sender.
    n_new: usize,
}

impl Transfer {
    /// Import `ids` on the sender: resolve, pin, or allocate.
    pub(crate) fn instantiate(sender: &Arc<Peer>, ids: &[HandleId]) -> Result<Self, OpError> {
        let mut transfer = Self {
            entries: Vec::with_capacity(ids.len()),
            n_new: 0,
        };

        for &id in ids {
            if id.has_allocate_flag() {
                // Only the plain "allocate a managed node" pattern is
                // defined; everything else is reserved.
                if !id.is_allocate_request() {
                    return Err(OpError::NoSuch);
                }
                transfer.entries.push(TransferEntry {
                    handle: Some(HandleRef::Owner(Node::new())),
                    fresh: true,
                });
                transfer.n_new += 1;
            } else {
                // Stale and unknown ids travel as null: destruction is
                // asynchronous, so senders cannot usefully handle an error
                // here.
                let resolved = sender
                    .index
                    .lookup_id(id)
                    .filter(|h| handle::acquire(h));
                transfer.entries.push(TransferEntry {
                    handle: resolved,
                    fresh: false,
                });
            }
        }
        Ok(transfer)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn handles(&self) -> impl Iterator<Item = &HandleRef> {
        self.entries.iter().filter_map(|e| e.handle.as_ref())
    }

    /// Owner peers of every pinned node, for the transaction stamp.
    pub(crate) fn owner_peers(&self) -> Vec<Arc<Peer>> {
        self.handles()
            .filter_map(|h| h.node().owner_peer())
            .collect()
    }

    /// Attach and install every freshly allocated node on the sender. This
    /// is what assigns their sender-visible ids; it runs once per send,
    /// destinations or not.
    pub(crate) fn install_new(&mut self, sender: &Arc<Peer>) {
        if self.n_new == 0 {
            return;
        }
        let mut guard = sender.lock.lock();
        for entry in &self.entries {
            if self.n_new == 0 {
                break;
            }
            let Some(h) = &entry.handle else { continue };
            if h.core().is_public() {
                continue;
            }
            self.n_new -= 1;
            let attached = handle::attach_unlocked(h, sender);
            debug_assert!(attached, "fresh nodes always attach to their creator");
            let installed = handle::install_unlocked(sender, &mut guard, h);
            debug_assert!(matches!(&installed, Some(i) if i.same_handle(h)));
        }
    }

    /// Post-commit id report for the sender: fresh nodes under their new
    /// owner id (the pin turns into the sender's user reference), everything
    /// else under the id it already had, nulls as INVALID.
    pub(crate) fn finish(mut self) -> Vec<HandleId> {
        let mut ids = Vec::with_capacity(self.entries.len());
        for entry in &mut self.entries {
            let id = match &entry.handle {
                Some(h) => h.id(),
                None => HandleId::INVALID,
            };
            ids.push(id);

            if entry.fresh
                && let Some(h) = entry.handle.take()
            {
                if !handle::adopt_user_ref(&h) {
                    // Already user-visible (self-send delivered it first);
                    // give the pin back for the drop below.
                    entry.handle = Some(h);
                }
            }
        }
        ids
        // Drop releases the remaining pins.
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        for entry in self.entries.drain(..) {
            if let Some(h) = entry.handle
                && h.core().is_public()
            {
                handle::release(&h);
            }
        }
    }
}

struct InflightEntry {
    handle: Option<HandleRef>,
    /// Fresh copy of a sender-owned node: attached under the sender's lock.
    fresh_local: bool,
}

/// Receiver-side batch derived from a transfer.
pub(crate) struct Inflight {
    entries: Vec<InflightEntry>,
    /// Fresh handles not yet attached.
    n_new: usize,
    /// Subset of `n_new` whose node the sender owns.
    n_new_local: usize,
}

impl Inflight {
    /// Resolve every transfer handle on `receiver`, minting unattached
    /// copies for nodes the receiver has no handle to.
    pub(crate) fn instantiate(
        receiver: &Arc<Peer>,
        sender: &Arc<Peer>,
        transfer: &Transfer,
    ) -> Self {
        let mut inflight = Self {
            entries: Vec::with_capacity(transfer.entries.len()),
            n_new: 0,
            n_new_local: 0,
        };

        for entry in &transfer.entries {
            let Some(from) = &entry.handle else {
                inflight.entries.push(InflightEntry {
                    handle: None,
                    fresh_local: false,
                });
                continue;
            };

            let node = from.node();
            let mut resolved = None;
            loop {
                let Some(existing) = receiver.index.lookup_node(node.seed()) else {
                    break;
                };
                if handle::acquire(&existing) {
                    resolved = Some(existing);
                    break;
                }
                // The indexed handle is racing its release; the unlink
                // completes under the receiver lock, after which a fresh
                // snapshot stops returning it.
                std::hint::spin_loop();
            }

            match resolved {
                Some(existing) => inflight.entries.push(InflightEntry {
                    handle: Some(existing),
                    fresh_local: false,
                }),
                None => {
                    // A node with no owner peer yet is a fresh allocate out
                    // of this very transfer, hence sender-owned.
                    let local = !from.core().is_public()
                        || node
                            .owner_peer()
                            .is_some_and(|owner| Arc::ptr_eq(&owner, sender));
                    inflight.entries.push(InflightEntry {
                        handle: Some(HandleRef::new_remote(node)),
                        fresh_local: local,
                    });
                    inflight.n_new += 1;
                    if local {
                        inflight.n_new_local += 1;
                    }
                }
            }
        }
        inflight
    }

    /// Attach and install everything this destination receives. The caller
    /// ran [`Transfer::install_new`] first, so sender-owned nodes already
    /// have their owner in place.
    pub(crate) fn install(&mut self, receiver: &Arc<Peer>, sender: &Arc<Peer>) {
        if self.entries.iter().all(|e| e.handle.is_none()) {
            return;
        }
        let mut n_installs = self.n_new;

        // Fresh copies of sender-owned nodes: the sender's lock is the
        // attach-authoritative one.
        if self.n_new_local > 0 {
            let _guard = sender.lock.lock();
            for entry in &mut self.entries {
                if self.n_new_local == 0 {
                    break;
                }
                if !entry.fresh_local {
                    continue;
                }
                let Some(h) = entry.handle.clone() else {
                    continue;
                };
                if h.core().is_public() {
                    continue;
                }
                self.n_new -= 1;
                self.n_new_local -= 1;
                if !handle::attach_unlocked(&h, receiver) {
                    entry.handle = None;
                }
            }
        }

        // Fresh copies of third-party nodes: per-handle owner locking.
        if self.n_new > 0 {
            for entry in &mut self.entries {
                if self.n_new == 0 {
                    break;
                }
                let Some(h) = entry.handle.clone() else {
                    continue;
                };
                if h.core().is_public() {
                    continue;
                }
                self.n_new -= 1;
                if !handle::attach(&h, receiver) {
                    entry.handle = None;
                }
            }
        }

        // Install everything attached-but-uninstalled on the receiver.
        if n_installs > 0 {
            let mut guard = receiver.lock.lock();
            for entry in &mut self.entries {
                if n_installs == 0 {
                    break;
                }
                let Some(h) = entry.handle.clone() else {
                    continue;
                };
                if !h.core().is_public() || !h.id().is_invalid() {
                    continue;
                }
                n_installs -= 1;

                match handle::install_unlocked(receiver, &mut guard, &h) {
                    Some(installed) if installed.same_handle(&h) => {}
                    other => {
                        // Raced: either the node died (None) or a sibling
                        // won the install. Switch over; releasing our
                        // candidate may lock other peers, so drop the
                        // receiver lock around it.
                        drop(guard);
                        handle::release(&h);
                        entry.handle = other;
                        guard = receiver.lock.lock();
                    }
                }
            }
        }
    }

    /// Convert every pinned handle into the id the receiver sees at
    /// transaction stamp `ts`, consuming the batch's references.
    pub(crate) fn commit(&mut self, ts: u64) -> Vec<HandleId> {
        self.entries
            .drain(..)
            .map(|entry| match entry.handle {
                Some(h) => handle::release_to_inflight(&h, ts),
                None => HandleId::INVALID,
            })
            .collect()
    }
}

impl Drop for Inflight {
    fn drop(&mut self) {
        // Only reached without a commit (error rollback): give the pinned
        // references back.
        for entry in self.entries.drain(..) {
            if let Some(h) = entry.handle
                && h.core().is_public()
            {
                handle::release(&h);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::{Limits, UserRegistry};

    fn peer_pair() -> (Arc<Peer>, Arc<Peer>) {
        let registry = UserRegistry::new(Limits::default());
        let a = Peer::new(1, registry.user(0), 4096, &Limits::default()).unwrap();
        let b = Peer::new(2, registry.user(0), 4096, &Limits::default()).unwrap();
        (a, b)
    }

    fn installed_owner(peer: &Arc<Peer>) -> HandleRef {
        let node = Node::new();
        let owner = HandleRef::Owner(node);
        let mut guard = peer.lock.lock();
        handle::attach_unlocked(&owner, peer);
        handle::install_unlocked(peer, &mut guard, &owner).unwrap()
    }

    fn allocate_id() -> HandleId {
        HandleId::from_raw(HandleId::ALLOCATE | HandleId::MANAGED)
    }

    #[test]
    fn allocate_request_mints_a_fresh_node() {
        let (sender, _) = peer_pair();
        let mut transfer = Transfer::instantiate(&sender, &[allocate_id()]).unwrap();
        assert_eq!(transfer.len(), 1);
        assert_eq!(transfer.n_new, 1);

        transfer.install_new(&sender);
        let ids = transfer.finish();
        assert_eq!(ids.len(), 1);
        // The owner handle is installed on the sender and user-visible.
        let owner = sender.index.lookup_id(ids[0]).expect("installed");
        assert!(owner.is_owner());
    }

    #[test]
    fn malformed_allocate_request_is_rejected() {
        let (sender, _) = peer_pair();
        let ids = [HandleId::from_raw(HandleId::ALLOCATE | HandleId::MANAGED | (7 << 2))];
        assert_eq!(
            Transfer::instantiate(&sender, &ids).unwrap_err(),
            OpError::NoSuch
        );
    }

    #[test]
    fn unknown_ids_resolve_to_null_not_error() {
        let (sender, _) = peer_pair();
        let transfer = Transfer::instantiate(&sender, &[HandleId::from_raw(0x41)]).unwrap();
        assert_eq!(transfer.len(), 1);
        assert!(transfer.entries[0].handle.is_none());
        assert_eq!(transfer.finish(), vec![HandleId::INVALID]);
    }

    #[test]
    fn transfer_pins_existing_handles() {
        let (sender, _) = peer_pair();
        let owner = installed_owner(&sender);
        let before = owner.core().n_inflight();

        let transfer = Transfer::instantiate(&sender, &[owner.id()]).unwrap();
        assert_eq!(owner.core().n_inflight(), before + 1);
        drop(transfer);
        assert_eq!(owner.core().n_inflight(), before);
    }

    #[test]
    fn inflight_reuses_the_receivers_existing_handle() {
        let (sender, receiver) = peer_pair();
        let owner = installed_owner(&sender);

        let mut transfer = Transfer::instantiate(&sender, &[owner.id()]).unwrap();
        let mut first = Inflight::instantiate(&receiver, &sender, &transfer);
        assert_eq!(first.n_new, 1);
        assert_eq!(first.n_new_local, 1);
        transfer.install_new(&sender);
        first.install(&receiver, &sender);
        let ids = first.commit(2);
        assert_eq!(ids.len(), 1);
        assert!(!ids[0].is_invalid());

        // Same node again: the receiver handle is found, nothing new.
        let transfer2 = Transfer::instantiate(&sender, &[owner.id()]).unwrap();
        let mut second = Inflight::instantiate(&receiver, &sender, &transfer2);
        assert_eq!(second.n_new, 0);
        second.install(&receiver, &sender);
        let ids2 = second.commit(4);
        assert_eq!(ids2, ids);
    }

    #[test]
    fn self_send_of_fresh_node_switches_to_the_owner_handle() {
        let (sender, _) = peer_pair();
        let mut transfer = Transfer::instantiate(&sender, &[allocate_id()]).unwrap();
        let mut inflight = Inflight::instantiate(&sender, &sender, &transfer);

        transfer.install_new(&sender);
        inflight.install(&sender, &sender);
        let delivered = inflight.commit(2);

        // The receiver is the owner itself: the inflight copy loses the
        // install race against the owner handle, and the delivered id is
        // the owner's.
        let owner_id = delivered[0];
        assert!(!owner_id.is_invalid());
        let resolved = sender.index.lookup_id(owner_id).expect("owner installed");
        assert!(resolved.is_owner());
        assert_eq!(transfer.finish(), vec![owner_id]);
    }

    #[test]
    fn destroyed_node_commits_as_invalid() {
        let (sender, receiver) = peer_pair();
        let owner = installed_owner(&sender);

        let mut transfer = Transfer::instantiate(&sender, &[owner.id()]).unwrap();
        let mut inflight = Inflight::instantiate(&receiver, &sender, &transfer);
        transfer.install_new(&sender);
        inflight.install(&receiver, &sender);

        handle::destroy_node(&sender, &owner).unwrap();
        let ts = owner.node().timestamp();

        // The transaction stamp lands after the destruction: INVALID.
        let ids = inflight.commit(ts + 2);
        assert_eq!(ids, vec![HandleId::INVALID]);
    }
}
