//! The bus and its endpoints: the command surface.
//!
//! A [`Bus`] owns the user registry and hands out [`Endpoint`]s, the
//! in-process analogue of an open device file. An endpoint starts
//! uninitialised, becomes active with `init`, and ends shut down; every
//! command checks that lifecycle first and reports a single error kind on
//! failure.
//!
//! `send` is the long pole. It resolves the destinations, pins the sender's
//! transfer batch, derives one inflight batch per destination, charges each
//! receiver's quota, stages one queue entry per destination at an odd stamp,
//! installs the transferred handles, and only then computes the single even
//! transaction stamp every receiver commits at. Failures before commit roll
//! everything back in reverse; after commit the send is one atomic point in
//! every queue it touched.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock::commit_stamp;
use crate::errors::OpError;
use crate::handle::{self, HandleRef, Node};
use crate::id::HandleId;
use crate::peer::{self, Entry, MessageEntry, Peer, Received};
use crate::queue::EntryKey;
use crate::transfer::{Inflight, Transfer};
use crate::user::{ChargeAmount, Limits, User, UserRegistry};

/// Bus-wide configuration. Peer limits bound what may sit inflight on one
/// peer; user limits bound one uid across the whole bus.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusConfig {
    pub user_limits: Limits,
    pub peer_limits: Limits,
}

struct BusShared {
    config: BusConfig,
    users: UserRegistry,
    seeds: AtomicU64,
}

/// The message bus. Cheap to clone; all clones share the same user registry.
#[derive(Clone)]
pub struct Bus {
    shared: Arc<BusShared>,
}

impl Bus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            shared: Arc::new(BusShared {
                config,
                users: UserRegistry::new(config.user_limits),
                seeds: AtomicU64::new(1),
            }),
        }
    }

    /// Open an endpoint on behalf of `uid`. It is uninitialised until
    /// [`Endpoint::init`].
    pub fn endpoint(&self, uid: u32) -> Endpoint {
        Endpoint {
            bus: self.clone(),
            user: self.shared.users.user(uid),
            state: Mutex::new(EndpointState::Uninit),
        }
    }
}

enum EndpointState {
    Uninit,
    Active(Arc<Peer>),
    Shutdown,
}

/// One peer as seen from the embedding layer.
pub struct Endpoint {
    bus: Bus,
    user: Arc<User>,
    state: Mutex<EndpointState>,
}

/// Arguments to [`Endpoint::send`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SendArgs<'a> {
    /// Handle ids naming the destination nodes.
    pub destinations: &'a [HandleId],
    pub payload: &'a [u8],
    /// Handle ids to transfer (ALLOCATE requests included).
    pub handles: &'a [HandleId],
    pub n_fds: u32,
}

/// Result of [`Endpoint::clone_peer`].
pub struct ClonedPeer {
    pub endpoint: Endpoint,
    /// The caller's fresh handle to the clone's node.
    pub handle: HandleId,
    /// The clone's own id for that node.
    pub node: HandleId,
}

struct DestState {
    input: HandleId,
    handle: HandleRef,
    peer: Arc<Peer>,
    inflight: Option<Inflight>,
    key: Option<EntryKey>,
    stamp: u64,
}

impl Endpoint {
    fn active(&self) -> Result<Arc<Peer>, OpError> {
        match &*self.state.lock() {
            EndpointState::Uninit => Err(OpError::NotInit),
            EndpointState::Active(peer) => Ok(peer.clone()),
            EndpointState::Shutdown => Err(OpError::Shutdown),
        }
    }

    /// Create the peer: pool, clock, empty indexes.
    pub fn init(&self, pool_size: u64) -> Result<(), OpError> {
        let mut state = self.state.lock();
        match &*state {
            EndpointState::Active(_) => return Err(OpError::AlreadyInit),
            EndpointState::Shutdown => return Err(OpError::Shutdown),
            EndpointState::Uninit => {}
        }
        let seed = self.bus.shared.seeds.fetch_add(1, Ordering::Relaxed);
        let peer = Peer::new(
            seed,
            self.user.clone(),
            pool_size,
            &self.bus.shared.config.peer_limits,
        )?;
        *state = EndpointState::Active(peer);
        Ok(())
    }

    /// Pool capacity in bytes.
    pub fn query(&self) -> Result<u64, OpError> {
        Ok(self.active()?.pool_size())
    }

    /// Flush handles, queue and stats. With `preserve`, the named handle
    /// survives under a fresh id (still referring to the same node); the new
    /// id is returned, INVALID when nothing was preserved.
    pub fn reset(&self, preserve: Option<HandleId>) -> Result<HandleId, OpError> {
        let peer = self.active()?;

        let kept = match preserve {
            None => None,
            Some(id) => {
                let h = peer.index.lookup_id(id).ok_or(OpError::NoSuch)?;
                if !handle::acquire(&h) {
                    return Err(OpError::Stale);
                }
                Some(h)
            }
        };

        peer::flush(&peer, kept.as_ref());

        let Some(h) = kept else {
            return Ok(HandleId::INVALID);
        };

        let installed = {
            let mut guard = peer.lock.lock();
            handle::uninstall_for_reissue(&peer, &h);
            handle::install_unlocked(&peer, &mut guard, &h)
        };
        match installed {
            Some(reinstalled) => {
                debug_assert!(reinstalled.same_handle(&h));
                // Our pin becomes the preserved user reference; if user
                // space already held one, give the pin back instead.
                if !handle::adopt_user_ref(&h) {
                    handle::release(&h);
                }
                Ok(h.id())
            }
            None => {
                // The node died while we were flushing; nothing to keep.
                handle::strip_user_refs(&h, &peer);
                handle::release(&h);
                Ok(HandleId::INVALID)
            }
        }
    }

    /// Allocate a sibling peer plus one cross-linked node/handle pair: the
    /// clone owns a fresh node, the caller gets a handle to it. The clone
    /// belongs to `uid` (its endpoint is handed to another client).
    pub fn clone_peer(&self, uid: u32, pool_size: u64) -> Result<ClonedPeer, OpError> {
        let parent = self.active()?;

        let endpoint = self.bus.endpoint(uid);
        endpoint.init(pool_size)?;
        let clone = endpoint.active()?;

        let node = Node::new();
        let owner = HandleRef::Owner(node.clone());
        {
            let mut guard = clone.lock.lock();
            handle::attach_unlocked(&owner, &clone);
            handle::install_unlocked(&clone, &mut guard, &owner);
        }
        let adopted = handle::adopt_user_ref(&owner);
        debug_assert!(adopted);

        let remote = HandleRef::new_remote(&node);
        let attached = handle::attach(&remote, &parent);
        debug_assert!(attached, "freshly owned node cannot be gone");
        let installed = {
            let mut guard = parent.lock.lock();
            handle::install_unlocked(&parent, &mut guard, &remote)
        };
        let handle_id = match installed {
            Some(h) => {
                debug_assert!(h.same_handle(&remote));
                let adopted = handle::adopt_user_ref(&h);
                debug_assert!(adopted);
                h.id()
            }
            None => HandleId::INVALID,
        };

        debug!(
            "peer {} cloned into peer {} (node {})",
            parent.seed, clone.seed, owner.id()
        );
        Ok(ClonedPeer {
            endpoint,
            handle: handle_id,
            node: owner.id(),
        })
    }

    /// Destroy the node behind an owned handle id.
    pub fn destroy(&self, id: HandleId) -> Result<(), OpError> {
        let peer = self.active()?;
        let h = peer.index.lookup_id(id).ok_or(OpError::NoSuch)?;
        handle::destroy_node(&peer, &h)
    }

    /// Drop one user-visible reference to a handle id.
    pub fn release(&self, id: HandleId) -> Result<(), OpError> {
        let peer = self.active()?;
        let h = peer.index.lookup_id(id).ok_or(OpError::NoSuch)?;
        handle::release_user_ref(&h, &peer)
    }

    /// Return a received payload slice to the pool.
    pub fn release_slice(&self, offset: u64) -> Result<(), OpError> {
        let peer = self.active()?;
        let mut guard = peer.lock.lock();
        guard.pool.release_user(offset)?;
        Ok(())
    }

    /// Copy a delivered payload out of the pool.
    pub fn payload(&self, delivery: &crate::peer::Delivery) -> Result<Vec<u8>, OpError> {
        let peer = self.active()?;
        let guard = peer.lock.lock();
        let bytes = guard
            .pool
            .read_at(delivery.payload_offset, delivery.payload_len)?;
        Ok(bytes.to_vec())
    }

    /// Send `payload` (and the transferred `handles`) to every destination
    /// node in one transaction.
    ///
    /// Returns one id per transfer entry as the *sender* sees it after
    /// commit: freshly allocated nodes report their new owner id (and stay
    /// user-visible on the sender), stale entries report INVALID. A send
    /// with no destinations is how a peer mints nodes for itself.
    pub fn send(&self, args: &SendArgs<'_>) -> Result<Vec<HandleId>, OpError> {
        let sender = self.active()?;
        let charge = ChargeAmount {
            size: args.payload.len() as u64,
            n_handles: args.handles.len() as u32,
            n_fds: args.n_fds,
        };

        // Destinations resolve up front; a dead destination fails the whole
        // send before anything is staged.
        let mut dests: Vec<DestState> = Vec::with_capacity(args.destinations.len());
        for &input in args.destinations {
            let h = match sender.index.lookup_id(input) {
                Some(h) => h,
                None => {
                    release_dest_pins(&dests);
                    return Err(OpError::NoSuch);
                }
            };
            if !handle::acquire(&h) {
                release_dest_pins(&dests);
                return Err(OpError::Stale);
            }
            let Some(receiver) = h.node().owner_peer() else {
                handle::release(&h);
                release_dest_pins(&dests);
                return Err(OpError::Stale);
            };
            dests.push(DestState {
                input,
                handle: h,
                peer: receiver,
                inflight: None,
                key: None,
                stamp: 0,
            });
        }

        let mut transfer = match Transfer::instantiate(&sender, args.handles) {
            Ok(t) => t,
            Err(e) => {
                release_dest_pins(&dests);
                return Err(e);
            }
        };
        for d in &mut dests {
            d.inflight = Some(Inflight::instantiate(&d.peer, &sender, &transfer));
        }

        // Stage one entry per destination: charge, slice, odd stamp.
        for i in 0..dests.len() {
            let d = &mut dests[i];
            let destination = HandleRef::Owner(d.handle.node().clone()).id();

            let mut guard = d.peer.lock.lock();
            let inner = &mut *guard;
            let mem_free = inner.pool.size() - inner.pool.allocated();
            if let Err(e) = inner
                .quota
                .charge(&mut inner.local, mem_free, &self.user, charge)
            {
                drop(guard);
                unstage(&mut dests[..i]);
                release_dest_pins(&dests);
                return Err(e);
            }
            let slice = match inner.pool.alloc(args.payload.len() as u64) {
                Ok(s) => s,
                Err(e) => {
                    inner.quota.discharge(&mut inner.local, &self.user, charge);
                    drop(guard);
                    unstage(&mut dests[..i]);
                    release_dest_pins(&dests);
                    return Err(e.into());
                }
            };
            if !args.payload.is_empty() {
                inner
                    .pool
                    .write(slice, 0, args.payload)
                    .expect("slice sized for the payload");
            }

            let stamp = inner.clock.stage();
            let (key, _) = inner.queue.link(
                stamp,
                sender.seed,
                Entry::Message(MessageEntry {
                    slice,
                    payload_len: args.payload.len() as u64,
                    source: d.input,
                    destination,
                    handles: Vec::new(),
                    n_fds: args.n_fds,
                    user: self.user.clone(),
                    charge,
                }),
            );
            d.key = Some(key);
            d.stamp = stamp;
        }

        // Attach and install everything the transfer introduces, fresh
        // nodes on the sender first.
        transfer.install_new(&sender);
        for d in &mut dests {
            let inflight = d.inflight.as_mut().expect("instantiated above");
            inflight.install(&d.peer, &sender);
        }

        // One even stamp beyond every clock involved: the sender's, every
        // staging stamp drawn on a receiver, and the owner clock of every
        // transmitted node.
        let owner_peers = transfer.owner_peers();
        let mut max_seen = sender.lock.lock().clock.now();
        for d in &dests {
            max_seen = max_seen.max(d.stamp);
        }
        for owner in &owner_peers {
            max_seen = max_seen.max(owner.lock.lock().clock.now());
        }
        let ts = commit_stamp(max_seen);
        sender.lock.lock().clock.sync(ts);
        for owner in &owner_peers {
            owner.lock.lock().clock.sync(ts);
        }
        trace!("peer {}: send commits at {}", sender.seed, ts);

        // Commit: final ids into each entry, relink staged -> committed.
        for d in &mut dests {
            let ids = d.inflight.as_mut().expect("instantiated above").commit(ts);
            let destination = handle::inorder_id(&HandleRef::Owner(d.handle.node().clone()), ts);
            let key = d.key.expect("staged above");

            let mut guard = d.peer.lock.lock();
            guard.clock.sync(ts);
            if let Some(Entry::Message(m)) = guard.queue.entry_mut(key) {
                m.handles = ids;
                m.destination = destination;
            }
            let readable = match guard.queue.relink(key, ts) {
                Some((_, readable)) => readable,
                // The receiver reset underneath us; its flush settled the
                // entry.
                None => false,
            };
            drop(guard);
            if readable {
                d.peer.watch.notify();
            }
        }

        release_dest_pins(&dests);
        Ok(transfer.finish())
    }

    /// Dequeue one committed entry.
    pub fn recv(&self) -> Result<Received, OpError> {
        let peer = self.active()?;
        peer::recv(&peer)
    }

    /// Block until the queue has a committed front, or `timeout` elapses.
    pub fn wait_readable(&self, timeout: Duration) -> Result<bool, OpError> {
        let deadline = Instant::now() + timeout;
        loop {
            let peer = self.active()?;
            let epoch = peer.watch.epoch();
            if peer.lock.lock().queue.is_readable() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            peer.watch.wait_past(epoch, deadline - now);
        }
    }

    /// Tear the peer down; every further command reports Shutdown.
    pub fn shutdown(&self) {
        let peer = {
            let mut state = self.state.lock();
            let previous = std::mem::replace(&mut *state, EndpointState::Shutdown);
            match previous {
                EndpointState::Active(peer) => Some(peer),
                _ => None,
            }
        };
        if let Some(peer) = peer {
            debug!("peer {} shutting down", peer.seed);
            peer::flush(&peer, None);
            peer.watch.notify();
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn release_dest_pins(dests: &[DestState]) {
    for d in dests {
        handle::release(&d.handle);
    }
}

/// Roll staged entries back out of their receivers' queues.
fn unstage(dests: &mut [DestState]) {
    for d in dests {
        let Some(key) = d.key.take() else { continue };
        let mut guard = d.peer.lock.lock();
        if let Some((Entry::Message(m), _)) = guard.queue.unlink(key) {
            let inner = &mut *guard;
            let _ = inner.pool.release_queue(m.slice);
            inner.quota.discharge(&mut inner.local, &m.user, m.charge);
        }
    }
}
