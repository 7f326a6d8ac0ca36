//! The peer: one endpoint of the bus.
//!
//! A peer bundles everything a receiving endpoint owns: its lock, its clock,
//! its reception queue, its slice pool, the dual handle index, the quota
//! stats for every user that ever charged it, and a readable-edge watch.
//! Everything mutable sits behind the one `parking_lot` mutex except the
//! index (swapped snapshots, written only under the lock) and the watch.

use std::sync::Arc;

use burrow_pool::{Pool, Slice};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::errors::OpError;
use crate::handle::{self, HandleRef};
use crate::id::{HandleId, IdAllocator};
use crate::index::HandleIndex;
use crate::queue::Queue;
use crate::user::{ChargeAmount, Limits, LocalBudgets, Quota, User};
use crate::wait::Watch;

/// One queued message, as staged by a send and mutated once at commit.
pub(crate) struct MessageEntry {
    pub slice: Slice,
    pub payload_len: u64,
    /// Id the sender addressed the node by (sender-side).
    pub source: HandleId,
    /// The owner's id for the addressed node (receiver-side).
    pub destination: HandleId,
    /// Receiver-side ids of transferred handles; written at commit.
    pub handles: Vec<HandleId>,
    pub n_fds: u32,
    pub user: Arc<User>,
    pub charge: ChargeAmount,
}

pub(crate) enum Entry {
    Message(MessageEntry),
    /// Node destruction notice; the referenced handle supplies the id the
    /// receiver knew the node by.
    Destruction(HandleRef),
}

pub(crate) struct PeerInner {
    pub clock: Clock,
    pub queue: Queue<Entry>,
    pub pool: Pool,
    pub ids: IdAllocator,
    pub quota: Quota,
    pub local: LocalBudgets,
}

pub(crate) struct Peer {
    /// Process-unique id; tie-breaks same-stamp queue entries.
    pub seed: u64,
    pub user: Arc<User>,
    pub limits: Limits,
    pub lock: Mutex<PeerInner>,
    pub index: HandleIndex,
    pub watch: Watch,
}

impl Peer {
    pub(crate) fn new(
        seed: u64,
        user: Arc<User>,
        pool_size: u64,
        limits: &Limits,
    ) -> Result<Arc<Self>, OpError> {
        let pool = Pool::new(pool_size)?;
        debug!("peer {} created, pool {} bytes", seed, pool.size());
        Ok(Arc::new(Self {
            seed,
            user,
            limits: *limits,
            lock: Mutex::new(PeerInner {
                clock: Clock::default(),
                queue: Queue::default(),
                pool,
                ids: IdAllocator::default(),
                quota: Quota::default(),
                local: LocalBudgets::new(limits),
            }),
            index: HandleIndex::default(),
            watch: Watch::default(),
        }))
    }

    pub(crate) fn pool_size(&self) -> u64 {
        self.lock.lock().pool.size()
    }
}

/// What a recv produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Message(Delivery),
    /// The node behind this handle id was destroyed; the id is permanently
    /// dead.
    NodeDestroyed { id: HandleId },
}

/// A dequeued message. The payload stays in the peer's pool until the slice
/// is released by offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub source: HandleId,
    pub destination: HandleId,
    pub payload_offset: u64,
    pub payload_len: u64,
    pub handles: Vec<HandleId>,
    pub n_fds: u32,
}

/// Dequeue one committed entry.
///
/// Destruction notices whose handle user space never saw are consumed
/// silently: either the introducing transfer lost the race against the
/// destruction (no id, or the delivery was downgraded to INVALID), or the
/// receiver had already released the handle for good.
pub(crate) fn recv(peer: &Arc<Peer>) -> Result<Received, OpError> {
    let mut guard = peer.lock.lock();
    loop {
        enum Peeked {
            Notice(crate::queue::EntryKey, Option<HandleId>),
            Message(crate::queue::EntryKey, Slice),
        }
        let peeked = match guard.queue.peek() {
            None => return Err(OpError::WouldBlock),
            Some((key, Entry::Destruction(h))) => {
                let id = (!h.id().is_invalid() && h.core().is_user_visible()).then(|| h.id());
                Peeked::Notice(key, id)
            }
            Some((key, Entry::Message(m))) => Peeked::Message(key, m.slice),
        };

        match peeked {
            Peeked::Notice(key, id) => {
                let popped = guard.queue.pop_front();
                debug_assert!(matches!(popped, Some((k, _)) if k == key));
                let Some(id) = id else { continue };
                trace!("peer {}: destruction notice for {}", peer.seed, id);
                return Ok(Received::NodeDestroyed { id });
            }
            Peeked::Message(key, slice) => {
                // Publish before unlinking: a pool failure leaves the entry
                // queued and the command side-effect free.
                guard.pool.publish(slice)?;
                let (entry, _) = guard.queue.unlink(key).expect("peeked entry is linked");
                let Entry::Message(m) = entry else {
                    unreachable!("peeked a message")
                };

                let inner = &mut *guard;
                inner.quota.commit(&m.user, m.charge);
                inner.quota.settle_delivery(&mut inner.local, &m.user, m.charge);

                return Ok(Received::Message(Delivery {
                    source: m.source,
                    destination: m.destination,
                    payload_offset: m.slice.offset,
                    payload_len: m.payload_len,
                    handles: m.handles,
                    n_fds: m.n_fds,
                }));
            }
        }
    }
}

/// Flush the peer: every handle, every queue entry, every user stat.
///
/// `keep` survives with its node intact; the caller reinstalls it
/// afterwards. Owned nodes are destroyed (their holders get notices through
/// the usual path), remote handles lose their user references.
pub(crate) fn flush(peer: &Arc<Peer>, keep: Option<&HandleRef>) {
    let handles = peer.index.take_all();

    {
        let mut guard = peer.lock.lock();
        debug!(
            "peer {}: flushing {} handles, {} queued entries",
            peer.seed,
            handles.len(),
            guard.queue.len()
        );
        let inner = &mut *guard;
        for (key, entry) in inner.queue.flush() {
            if let Entry::Message(m) = entry {
                let _ = inner.pool.release_queue(m.slice);
                if key.is_staging() {
                    inner.quota.discharge(&mut inner.local, &m.user, m.charge);
                } else {
                    inner.quota.commit(&m.user, m.charge);
                    inner.quota.settle_delivery(&mut inner.local, &m.user, m.charge);
                }
            }
        }
        inner.pool.flush_user();
        inner.quota.clear();
        inner.local = LocalBudgets::new(&peer.limits);
    }

    for h in handles {
        if keep.is_some_and(|k| k.same_handle(&h)) {
            continue;
        }
        if h.is_owner() {
            let node = h.node().clone();
            let mut work = None;
            let guard = peer.lock.lock();
            if node.timestamp() == 0 {
                let (guard, notify) = handle::commit_destruction(&node, peer, guard);
                drop(guard);
                work = Some(notify);
            } else {
                drop(guard);
            }
            if let Some(notify) = work {
                handle::finalize_destruction(&node, notify);
            }
        } else {
            handle::strip_user_refs(&h, peer);
        }
    }
}
