//! Nodes, handles and the destruction protocol.
//!
//! Outside callers only ever deal with handles; nodes stay hidden behind
//! them. A node embeds its *owner handle* so the two can never outlive each
//! other: the owner handle is the `Owner` variant of [`HandleRef`] and simply
//! is the node, every other peer's reference is a `Remote` allocated on
//! demand. Both variants expose the same [`HandleCore`].
//!
//! Per handle there are two live counters; plain `Arc` counting pins the
//! memory itself:
//!
//! - `n_inflight` pins the handle's linkage into its holder and into the
//!   node's handle list. It starts at the -1 "never attached" sentinel,
//!   becomes 1 at attach, and the release that drops it to zero unlinks the
//!   handle under the holder's lock.
//! - `n_user` records whether user space has been introduced to the handle.
//!   It is raised on the first committed delivery and holds exactly one
//!   inflight reference while non-zero.
//!
//! A node dies in three phases: commit under the owner's lock (timestamp
//! goes 0 → 1 → final even stamp while notifications are staged into every
//! holder's queue), relink of those notifications to the final stamp, and a
//! best-effort finalisation that severs each remote handle's backlink. The
//! notification fan-out drops the owner lock between batches so concurrent
//! attaches are picked up instead of starved out.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapAny;
use parking_lot::{Mutex, MutexGuard};

use crate::clock::{commit_stamp, destroyed_before};
use crate::errors::OpError;
use crate::id::HandleId;
use crate::peer::{Entry, Peer, PeerInner};
use crate::queue::EntryKey;

/// Process-wide node identity source; orders the by-node index.
static NODE_SEEDS: AtomicU64 = AtomicU64::new(1);

/// Sentinel for "handle was never attached".
const INFLIGHT_UNATTACHED: i64 = -1;

type WeakPeerCell = ArcSwapAny<Weak<Peer>>;

/// State shared by owner and remote handles.
#[derive(Debug)]
pub(crate) struct HandleCore {
    /// Local id once installed, INVALID before.
    id: AtomicU64,
    /// Holding peer; nulled on release, peer teardown and node destruction.
    holder: WeakPeerCell,
    n_inflight: AtomicI64,
    n_user: AtomicU64,
}

impl HandleCore {
    fn new() -> Self {
        Self {
            id: AtomicU64::new(HandleId::INVALID.get()),
            holder: ArcSwapAny::new(Weak::new()),
            n_inflight: AtomicI64::new(INFLIGHT_UNATTACHED),
            n_user: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> HandleId {
        HandleId::from_raw(self.id.load(Ordering::Acquire))
    }

    fn set_id(&self, id: HandleId) {
        self.id.store(id.get(), Ordering::Release);
    }

    fn clear_id(&self) {
        self.id.store(HandleId::INVALID.get(), Ordering::Release);
    }

    /// Pin the holding peer, if it is still linked and alive.
    pub(crate) fn holder(&self) -> Option<Arc<Peer>> {
        self.holder.load().upgrade()
    }

    fn set_holder(&self, peer: &Arc<Peer>) {
        self.holder.store(Arc::downgrade(peer));
    }

    fn clear_holder(&self) {
        self.holder.store(Weak::new());
    }

    /// A handle is public once it was attached to its node; it never leaves
    /// that state again.
    #[inline]
    pub(crate) fn is_public(&self) -> bool {
        self.n_inflight.load(Ordering::Acquire) >= 0
    }

    /// Whether user space currently knows this handle.
    #[inline]
    pub(crate) fn is_user_visible(&self) -> bool {
        self.n_user.load(Ordering::Acquire) > 0
    }

    #[cfg(test)]
    pub(crate) fn n_inflight(&self) -> i64 {
        self.n_inflight.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn n_user(&self) -> u64 {
        self.n_user.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn force_install_for_tests(&self, id: HandleId) {
        self.set_id(id);
        self.n_inflight.store(1, Ordering::Release);
    }
}

#[derive(Debug)]
struct NodeList {
    owner_linked: bool,
    remotes: Vec<Arc<RemoteHandle>>,
}

/// An addressable destination. Owned by the peer holding its owner handle.
#[derive(Debug)]
pub(crate) struct Node {
    seed: u64,
    /// 0 = alive, 1 = destruction in progress, even > 1 = destroyed at that
    /// stamp.
    timestamp: AtomicU64,
    list: Mutex<NodeList>,
    owner: HandleCore,
}

impl Node {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            seed: NODE_SEEDS.fetch_add(1, Ordering::Relaxed),
            timestamp: AtomicU64::new(0),
            list: Mutex::new(NodeList {
                owner_linked: false,
                remotes: Vec::new(),
            }),
            owner: HandleCore::new(),
        })
    }

    #[inline]
    pub(crate) fn seed(&self) -> u64 {
        self.seed
    }

    #[inline]
    pub(crate) fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Pin the owning peer.
    pub(crate) fn owner_peer(&self) -> Option<Arc<Peer>> {
        self.owner.holder()
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests() -> Arc<Self> {
        Self::new()
    }
}

/// A non-owner handle; shares the node, carries its own core.
#[derive(Debug)]
pub(crate) struct RemoteHandle {
    node: Arc<Node>,
    core: HandleCore,
}

/// A reference to a handle: the owner handle lives embedded in its node, a
/// remote handle is its own allocation.
#[derive(Clone, Debug)]
pub(crate) enum HandleRef {
    Owner(Arc<Node>),
    Remote(Arc<RemoteHandle>),
}

impl HandleRef {
    pub(crate) fn new_remote(node: &Arc<Node>) -> Self {
        Self::Remote(Arc::new(RemoteHandle {
            node: node.clone(),
            core: HandleCore::new(),
        }))
    }

    #[inline]
    pub(crate) fn node(&self) -> &Arc<Node> {
        match self {
            HandleRef::Owner(node) => node,
            HandleRef::Remote(remote) => &remote.node,
        }
    }

    #[inline]
    pub(crate) fn core(&self) -> &HandleCore {
        match self {
            HandleRef::Owner(node) => &node.owner,
            HandleRef::Remote(remote) => &remote.core,
        }
    }

    #[inline]
    pub(crate) fn is_owner(&self) -> bool {
        matches!(self, HandleRef::Owner(_))
    }

    #[inline]
    pub(crate) fn id(&self) -> HandleId {
        self.core().id()
    }

    pub(crate) fn same_handle(&self, other: &HandleRef) -> bool {
        std::ptr::eq(self.core(), other.core())
    }
}

/// Try to take an inflight reference.
///
/// Succeeds iff somebody else currently holds one, with one exception: the
/// owner handle can always be re-acquired, because the authoritative check
/// for it is the node timestamp at commit time. A plain handle at zero is
/// as good as unlinked and the caller should allocate a fresh one.
pub(crate) fn acquire(handle: &HandleRef) -> bool {
    let n = &handle.core().n_inflight;
    let mut cur = n.load(Ordering::Acquire);
    loop {
        if cur < 1 {
            break;
        }
        match n.compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(actual) => cur = actual,
        }
    }

    if cur == INFLIGHT_UNATTACHED {
        debug_assert!(false, "acquire on a handle that was never attached");
        return false;
    }
    if !handle.is_owner() {
        return false;
    }
    n.fetch_add(1, Ordering::AcqRel);
    true
}

/// Decrement unless this would be the last reference. Returns false if the
/// caller might be the last holder and must take the locked path.
fn release_fast(n: &AtomicI64) -> bool {
    let mut cur = n.load(Ordering::Acquire);
    loop {
        if cur <= 1 {
            return false;
        }
        match n.compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(actual) => cur = actual,
        }
    }
}

/// Release one inflight reference, locking the holder if this might be the
/// last one.
pub(crate) fn release(handle: &HandleRef) {
    debug_assert!(handle.core().is_public());
    if release_fast(&handle.core().n_inflight) {
        return;
    }
    if let Some(peer) = handle.core().holder() {
        release_last(handle, &peer);
    } else {
        // Holder already torn down; the unlink happened there.
        handle.core().n_inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Same as [`release`] with the holding peer already pinned by the caller.
pub(crate) fn release_pinned(handle: &HandleRef, peer: &Arc<Peer>) {
    debug_assert!(handle.core().is_public());
    if release_fast(&handle.core().n_inflight) {
        return;
    }
    release_last(handle, peer);
}

fn release_last(handle: &HandleRef, peer: &Arc<Peer>) {
    if handle.is_owner() {
        release_owner(handle, peer);
    } else {
        release_holder(handle, peer);
    }
}

fn release_owner(handle: &HandleRef, peer: &Arc<Peer>) {
    let node = handle.node().clone();
    let mut guard = peer.lock.lock();

    if handle.core().n_inflight.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }
    debug_assert_eq!(handle.core().n_user.load(Ordering::Acquire), 0);

    let mut work = None;
    if node.timestamp() == 0 {
        // Unlink the owner from the node list; destruction owns the final
        // unref.
        let now_empty = {
            let mut list = node.list.lock();
            list.owner_linked = false;
            list.remotes.is_empty()
        };
        if now_empty {
            let (g, notify) = commit_destruction(&node, peer, guard);
            guard = g;
            work = Some(notify);
        }
    }
    drop(guard);

    if let Some(notify) = work {
        finalize_destruction(&node, notify);
    }
}

fn release_holder(handle: &HandleRef, peer: &Arc<Peer>) {
    let node = handle.node().clone();
    let dropped = {
        let _guard = peer.lock.lock();
        if handle.core().n_inflight.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        debug_assert_eq!(handle.core().n_user.load(Ordering::Acquire), 0);

        if handle.core().holder().is_some() {
            handle.core().clear_holder();
            peer.index.remove(handle);
            true
        } else {
            false
        }
    };

    // Somebody else (reset, destruction) already unlinked us and owns the
    // node-side cleanup.
    if !dropped {
        return;
    }

    let mut work = None;
    if let Some(owner_peer) = node.owner_peer() {
        let mut guard = owner_peer.lock.lock();
        if node.timestamp() == 0 {
            let now_empty = {
                let mut list = node.list.lock();
                if let HandleRef::Remote(remote) = handle {
                    list.remotes.retain(|r| !Arc::ptr_eq(r, remote));
                }
                !list.owner_linked && list.remotes.is_empty()
            };
            if now_empty {
                let (g, notify) = commit_destruction(&node, &owner_peer, guard);
                guard = g;
                work = Some(notify);
            }
        }
        drop(guard);
    }

    if let Some(notify) = work {
        finalize_destruction(&node, notify);
    }
}

/// Attach a fresh handle to its node on behalf of `holder`.
///
/// The caller holds the lock of the node's owner peer (which is `holder`
/// itself when attaching an owner handle). Fails iff the node is already
/// gone; on success the handle is acquired.
pub(crate) fn attach_unlocked(handle: &HandleRef, holder: &Arc<Peer>) -> bool {
    debug_assert!(!handle.core().is_public());
    let node = handle.node();

    // Once destruction commits, the owner backlink is nulled and any late
    // attach must behave as if the node never existed. The owner itself is
    // exempt: a fully disjoint node is reachable by nobody else.
    if node.owner_peer().is_none() && !handle.is_owner() {
        return false;
    }

    handle.core().n_inflight.store(1, Ordering::Release);
    handle.core().set_holder(holder);
    let mut list = node.list.lock();
    match handle {
        HandleRef::Owner(_) => list.owner_linked = true,
        HandleRef::Remote(remote) => list.remotes.push(remote.clone()),
    }
    true
}

/// Attach via the slow path: pins and locks the node's owner peer first.
/// Needed when transmitting third-party handles.
pub(crate) fn attach(handle: &HandleRef, holder: &Arc<Peer>) -> bool {
    if handle.is_owner() {
        let _guard = holder.lock.lock();
        return attach_unlocked(handle, holder);
    }

    let Some(owner_peer) = handle.node().owner_peer() else {
        return false;
    };
    let _guard = owner_peer.lock.lock();
    attach_unlocked(handle, holder)
}

/// Install an attached handle into its holder: allocate its id and link it
/// into both lookup trees. The caller holds the holder's lock and passes the
/// guard's inner state.
///
/// Returns `None` if the node was torn down between attach and install, the
/// handle itself on success, or a concurrently installed sibling (acquired)
/// the caller must switch over to.
pub(crate) fn install_unlocked(
    peer: &Arc<Peer>,
    inner: &mut PeerInner,
    handle: &HandleRef,
) -> Option<HandleRef> {
    debug_assert!(handle.core().is_public());
    debug_assert!(handle.id().is_invalid());

    if handle.core().holder().is_none() {
        return None;
    }

    if let Some(sibling) = peer.index.lookup_node(handle.node().seed()) {
        // Somebody raced us installing a handle for the same node. Hand the
        // caller the winner; releases of the loser are on them.
        let acquired = acquire(&sibling);
        debug_assert!(acquired, "indexed sibling must be acquirable under the peer lock");
        return Some(sibling);
    }

    handle.core().set_id(inner.ids.allocate());
    peer.index.insert(handle.clone());
    Some(handle.clone())
}

/// Strip a handle's id and index linkage so it can be reinstalled with a
/// fresh id (peer reset with a preserved handle). The caller holds the
/// peer's lock; the handle stays attached to its node.
pub(crate) fn uninstall_for_reissue(peer: &Arc<Peer>, handle: &HandleRef) {
    peer.index.remove(handle);
    handle.core().clear_id();
}

/// The handle's id as of transaction stamp `ts`: INVALID if the node's
/// destruction committed at or before `ts` (destruction wins ties).
pub(crate) fn inorder_id(handle: &HandleRef, ts: u64) -> HandleId {
    if destroyed_before(handle.node().timestamp(), ts) {
        HandleId::INVALID
    } else {
        handle.id()
    }
}

/// Commit-time conversion of an inflight reference into the delivered id.
///
/// The first delivery that introduces the handle to user space keeps the
/// inflight reference (it is now the user's); every other outcome releases
/// it, including delivery of an already destroyed node.
pub(crate) fn release_to_inflight(handle: &HandleRef, ts: u64) -> HandleId {
    let id = inorder_id(handle, ts);
    let first = !id.is_invalid()
        && handle
            .core()
            .n_user
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
    if !first {
        release(handle);
    }
    id
}

/// Drop one user-visible reference (the RELEASE command). The last one also
/// gives up the inflight reference user space was holding.
pub(crate) fn release_user_ref(handle: &HandleRef, peer: &Arc<Peer>) -> Result<(), OpError> {
    let n = &handle.core().n_user;
    let mut cur = n.load(Ordering::Acquire);
    loop {
        if cur == 0 {
            return Err(OpError::Stale);
        }
        match n.compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(actual) => cur = actual,
        }
    }
    if cur == 1 {
        release_pinned(handle, peer);
    }
    Ok(())
}

/// Turn the caller's inflight reference into the user-visible one, outside
/// any delivery (peer clone, preserved reset handle). Fails if user space
/// already knows the handle; the caller keeps its reference then.
pub(crate) fn adopt_user_ref(handle: &HandleRef) -> bool {
    handle
        .core()
        .n_user
        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Take every user-visible reference away (peer reset). Returns true if an
/// inflight reference was released along the way.
pub(crate) fn strip_user_refs(handle: &HandleRef, peer: &Arc<Peer>) -> bool {
    if handle.core().n_user.swap(0, Ordering::AcqRel) > 0 {
        release_pinned(handle, peer);
        true
    } else {
        false
    }
}

/// Owner-initiated node destruction (the DESTROY command).
pub(crate) fn destroy_node(peer: &Arc<Peer>, handle: &HandleRef) -> Result<(), OpError> {
    if !handle.is_owner() {
        return Err(OpError::NotOwner);
    }
    let node = handle.node().clone();

    let guard = peer.lock.lock();
    if node.timestamp() != 0 {
        return Err(OpError::InProgress);
    }
    let (guard, notify) = commit_destruction(&node, peer, guard);
    drop(guard);

    finalize_destruction(&node, notify);
    Ok(())
}

/// One staged destruction notification, tracked from phase A to C.
pub(crate) struct Notification {
    handle: Arc<RemoteHandle>,
    holder: Option<Arc<Peer>>,
    key: Option<EntryKey>,
    stamp: u64,
}

/// Phase A: commit the destruction under the owner's lock.
///
/// Marks the node as destroying, fans staged notifications out to every
/// holder (dropping the owner lock per batch so concurrent attaches land in
/// a later batch instead of deadlocking or starving), then seals the final
/// even timestamp, severs the owner backlink and unlinks the owner handle
/// from its peer's trees.
///
/// Returns the reacquired owner guard and the notification list for phases
/// B and C.
pub(crate) fn commit_destruction<'a>(
    node: &Arc<Node>,
    owner_peer: &'a Arc<Peer>,
    mut guard: MutexGuard<'a, PeerInner>,
) -> (MutexGuard<'a, PeerInner>, Vec<Notification>) {
    debug_assert_eq!(node.timestamp(), 0);

    // Racers now observe "destroying" and treat the node as alive until the
    // final stamp lands.
    node.timestamp.store(1, Ordering::Release);
    node.list.lock().owner_linked = false;

    let mut notify = Vec::new();
    loop {
        let batch = std::mem::take(&mut node.list.lock().remotes);
        if batch.is_empty() {
            break;
        }

        // Fan out without the owner lock; holders added meanwhile are
        // picked up by the next round.
        drop(guard);
        for handle in batch {
            if let Some(holder) = handle.core.holder() {
                let mut inner = holder.lock.lock();
                let stamp = inner.clock.stage();
                let (key, _) = inner.queue.link(
                    stamp,
                    owner_peer.seed,
                    Entry::Destruction(HandleRef::Remote(handle.clone())),
                );
                drop(inner);
                notify.push(Notification {
                    handle,
                    holder: Some(holder),
                    key: Some(key),
                    stamp,
                });
            } else {
                notify.push(Notification {
                    handle,
                    holder: None,
                    key: None,
                    stamp: 0,
                });
            }
        }
        guard = owner_peer.lock.lock();
    }

    // The destruction's transaction stamp: beyond the owner clock and every
    // staging stamp just drawn, so each receiver relinks forward in its own
    // queue.
    let mut max_seen = guard.clock.now();
    for notification in &notify {
        max_seen = max_seen.max(notification.stamp);
    }
    let ts = commit_stamp(max_seen);
    guard.clock.sync(ts);

    node.timestamp.store(ts, Ordering::Release);
    node.owner.clear_holder();
    owner_peer.index.remove(&HandleRef::Owner(node.clone()));
    trace!("node {} destroyed at {}", node.seed, ts);

    (guard, notify)
}

/// Phases B and C: relink every staged notification to the node's final
/// stamp, then sever each remote handle. Best effort, never fails.
pub(crate) fn finalize_destruction(node: &Arc<Node>, notify: Vec<Notification>) {
    let ts = node.timestamp();
    debug_assert!(ts > 1 && ts % 2 == 0);

    for notification in &notify {
        let (Some(holder), Some(key)) = (&notification.holder, notification.key) else {
            continue;
        };
        let mut inner = holder.lock.lock();
        inner.clock.sync(ts);
        let readable = match inner.queue.relink(key, ts) {
            Some((_, readable)) => readable,
            // The receiver flushed in between; the notification is gone and
            // the handle unlink below still happens.
            None => false,
        };
        drop(inner);
        if readable {
            holder.watch.notify();
        }
    }

    for notification in notify {
        let handle = HandleRef::Remote(notification.handle);
        let Some(holder) = handle.core().holder() else {
            continue;
        };
        let _guard = holder.lock.lock();
        if handle.core().holder().is_some() {
            handle.core().clear_holder();
            holder.index.remove(&handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Peer;
    use crate::user::{Limits, UserRegistry};

    fn peer() -> Arc<Peer> {
        let registry = UserRegistry::new(Limits::default());
        Peer::new(1, registry.user(0), 4096, &Limits::default()).unwrap()
    }

    #[test]
    fn fresh_core_is_private_and_idless() {
        let node = Node::new();
        let owner = HandleRef::Owner(node);
        assert!(!owner.core().is_public());
        assert!(owner.id().is_invalid());
        assert_eq!(owner.core().n_inflight(), -1);
    }

    #[test]
    fn attach_then_release_restores_the_node() {
        let holder = peer();
        let node = Node::new();
        let owner = HandleRef::Owner(node.clone());
        {
            let _g = holder.lock.lock();
            assert!(attach_unlocked(&owner, &holder));
        }
        let remote = HandleRef::new_remote(&node);
        assert!(attach(&remote, &holder));
        assert_eq!(node.list.lock().remotes.len(), 1);

        release(&remote);
        assert_eq!(node.list.lock().remotes.len(), 0);
        assert_eq!(node.timestamp(), 0, "owner still pins the node");
    }

    #[test]
    fn acquire_rules() {
        let holder = peer();
        let node = Node::new();
        let owner = HandleRef::Owner(node.clone());
        {
            let _g = holder.lock.lock();
            attach_unlocked(&owner, &holder);
        }
        let remote = HandleRef::new_remote(&node);
        assert!(attach(&remote, &holder));

        // Plain handles acquire while referenced, but not from zero.
        assert!(acquire(&remote));
        release(&remote);
        release(&remote);
        assert!(!acquire(&remote));

        // Owners re-acquire even from zero.
        release(&owner);
        assert!(acquire(&owner));
    }

    #[test]
    fn install_assigns_increasing_ids() {
        let holder = peer();
        let node_a = Node::new();
        let node_b = Node::new();
        let a = HandleRef::Owner(node_a);
        let b = HandleRef::Owner(node_b);

        let mut guard = holder.lock.lock();
        attach_unlocked(&a, &holder);
        attach_unlocked(&b, &holder);
        let a = install_unlocked(&holder, &mut guard, &a).unwrap();
        let b = install_unlocked(&holder, &mut guard, &b).unwrap();
        assert_eq!(a.id().get(), 5);
        assert_eq!(b.id().get(), 9);
    }

    #[test]
    fn install_returns_acquired_sibling_on_conflict() {
        let holder = peer();
        let node = Node::new();
        let owner = HandleRef::Owner(node.clone());

        let mut guard = holder.lock.lock();
        attach_unlocked(&owner, &holder);
        install_unlocked(&holder, &mut guard, &owner).unwrap();

        let dup = HandleRef::new_remote(&node);
        dup.core().n_inflight.store(1, Ordering::Release);
        dup.core().set_holder(&holder);

        let before = owner.core().n_inflight();
        let winner = install_unlocked(&holder, &mut guard, &dup).unwrap();
        assert!(winner.same_handle(&owner));
        assert!(dup.id().is_invalid(), "loser is left untouched");
        assert_eq!(owner.core().n_inflight(), before + 1);
    }

    #[test]
    fn destruction_stamps_and_notifies_holders() {
        let owner_peer = peer();
        let holder_peer = peer();

        let node = Node::new();
        let owner = HandleRef::Owner(node.clone());
        {
            let mut g = owner_peer.lock.lock();
            attach_unlocked(&owner, &owner_peer);
            install_unlocked(&owner_peer, &mut g, &owner).unwrap();
        }
        let remote = HandleRef::new_remote(&node);
        assert!(attach(&remote, &holder_peer));
        {
            let mut g = holder_peer.lock.lock();
            install_unlocked(&holder_peer, &mut g, &remote).unwrap();
        }

        destroy_node(&owner_peer, &owner).unwrap();

        let ts = node.timestamp();
        assert!(ts > 1 && ts % 2 == 0);
        assert!(node.owner_peer().is_none());
        assert!(remote.core().holder().is_none());
        assert!(owner_peer.index.lookup_id(owner.id()).is_none());
        assert!(holder_peer.index.lookup_id(remote.id()).is_none());

        // The notification is committed at the destruction stamp.
        let inner = holder_peer.lock.lock();
        let (key, entry) = inner.queue.peek().expect("notification queued");
        assert_eq!(key.stamp, ts);
        assert!(matches!(entry, Entry::Destruction(_)));
    }

    #[test]
    fn double_destroy_is_in_progress() {
        let owner_peer = peer();
        let node = Node::new();
        let owner = HandleRef::Owner(node.clone());
        {
            let mut g = owner_peer.lock.lock();
            attach_unlocked(&owner, &owner_peer);
            install_unlocked(&owner_peer, &mut g, &owner).unwrap();
        }

        destroy_node(&owner_peer, &owner).unwrap();
        assert_eq!(
            destroy_node(&owner_peer, &owner).unwrap_err(),
            OpError::InProgress
        );
    }

    #[test]
    fn attach_fails_after_destruction() {
        let owner_peer = peer();
        let holder_peer = peer();
        let node = Node::new();
        let owner = HandleRef::Owner(node.clone());
        {
            let mut g = owner_peer.lock.lock();
            attach_unlocked(&owner, &owner_peer);
            install_unlocked(&owner_peer, &mut g, &owner).unwrap();
        }
        destroy_node(&owner_peer, &owner).unwrap();

        let late = HandleRef::new_remote(&node);
        assert!(!attach(&late, &holder_peer));
    }

    #[test]
    fn release_to_inflight_tracks_first_delivery() {
        let owner_peer = peer();
        let node = Node::new();
        let owner = HandleRef::Owner(node.clone());
        {
            let mut g = owner_peer.lock.lock();
            attach_unlocked(&owner, &owner_peer);
            install_unlocked(&owner_peer, &mut g, &owner).unwrap();
        }

        // First delivery keeps the inflight reference for user space.
        assert!(acquire(&owner));
        let id = release_to_inflight(&owner, 0);
        assert_eq!(id, owner.id());
        assert_eq!(owner.core().n_user(), 1);
        assert_eq!(owner.core().n_inflight(), 2);

        // A repeat delivery releases its reference again.
        assert!(acquire(&owner));
        release_to_inflight(&owner, 0);
        assert_eq!(owner.core().n_user(), 1);
        assert_eq!(owner.core().n_inflight(), 2);
    }

    #[test]
    fn destruction_wins_stamp_ties() {
        let owner_peer = peer();
        let node = Node::new();
        let owner = HandleRef::Owner(node.clone());
        {
            let mut g = owner_peer.lock.lock();
            attach_unlocked(&owner, &owner_peer);
            install_unlocked(&owner_peer, &mut g, &owner).unwrap();
        }
        destroy_node(&owner_peer, &owner).unwrap();
        let ts = node.timestamp();

        assert_eq!(inorder_id(&owner, ts), HandleId::INVALID);
        assert_eq!(inorder_id(&owner, ts - 2), owner.id());
    }
}
