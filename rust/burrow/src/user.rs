//! Per-UID users and the inflight quota engine.
//!
//! Every distinct uid maps to one process-wide [`User`] carrying atomic
//! *remaining* counters per resource (they count down from the limit; running
//! them below zero is what quota failure means). Each peer additionally keeps
//! per-user statistics so that fairness can be judged locally: a user may
//! never grow its footprint on a peer beyond half of what is still free
//! there. With N users pushing concurrently, each ends up bounded to roughly
//! 1/N of the peer's budget and nobody can starve the rest.
//!
//! Charges are taken under the receiving peer's lock (local counters) plus a
//! single compare-and-sub per user-global counter; rollback happens in
//! reverse charge order so a failed send never leaves partial accounting.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::errors::{OpError, Resource};

/// Hard per-user caps, also the per-peer local budgets.
pub const MESSAGES_MAX: u32 = u16::MAX as u32;
pub const HANDLES_MAX: u32 = u16::MAX as u32;
pub const FDS_MAX: u32 = u16::MAX as u32;

/// Resource limits a bus is created with.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub messages: u32,
    pub handles: u32,
    pub fds: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            messages: MESSAGES_MAX,
            handles: HANDLES_MAX,
            fds: FDS_MAX,
        }
    }
}

/// Process-wide singleton per uid.
pub struct User {
    uid: u32,
    /// Dense index into every peer's stats array.
    id: usize,
    n_messages: AtomicU32,
    n_handles: AtomicU32,
    n_fds: AtomicU32,
}

impl User {
    #[inline]
    pub fn uid(&self) -> u32 {
        self.uid
    }

    #[inline]
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn remaining_messages(&self) -> u32 {
        self.n_messages.load(Ordering::Relaxed)
    }
}

/// Registry of users by uid. Users live for the lifetime of the bus; dense
/// ids are assigned at first sight of a uid and index stats arrays.
pub(crate) struct UserRegistry {
    limits: Limits,
    by_uid: Mutex<HashMap<u32, Arc<User>>>,
}

impl UserRegistry {
    pub(crate) fn new(limits: Limits) -> Self {
        Self {
            limits,
            by_uid: Mutex::new(HashMap::new()),
        }
    }

    /// Find or create the user object for `uid`.
    pub(crate) fn user(&self, uid: u32) -> Arc<User> {
        let mut map = self.by_uid.lock();
        if let Some(user) = map.get(&uid) {
            return user.clone();
        }
        let user = Arc::new(User {
            uid,
            id: map.len(),
            n_messages: AtomicU32::new(self.limits.messages),
            n_handles: AtomicU32::new(self.limits.handles),
            n_fds: AtomicU32::new(self.limits.fds),
        });
        map.insert(uid, user.clone());
        user
    }
}

/// One message's worth of accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ChargeAmount {
    pub size: u64,
    pub n_handles: u32,
    pub n_fds: u32,
}

/// Per-peer remaining budgets (count down like the user globals).
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalBudgets {
    pub n_messages: u32,
    pub n_handles: u32,
    pub n_fds: u32,
}

impl LocalBudgets {
    pub(crate) fn new(limits: &Limits) -> Self {
        Self {
            n_messages: limits.messages,
            n_handles: limits.handles,
            n_fds: limits.fds,
        }
    }
}

/// Per-user footprint on one peer.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct UserStats {
    pub n_allocated: u64,
    pub n_messages: u32,
    pub n_handles: u32,
    pub n_fds: u32,
}

/// Per-peer quota state: stats array indexed by dense user id.
#[derive(Default)]
pub(crate) struct Quota {
    stats: Vec<UserStats>,
}

impl Quota {
    fn stats_mut(&mut self, user: &User) -> &mut UserStats {
        if user.id() >= self.stats.len() {
            // Grow in chunks so a burst of new users does not reallocate per
            // user.
            let len = (user.id() + 8) & !7;
            self.stats.resize(len, UserStats::default());
        }
        &mut self.stats[user.id()]
    }

    #[cfg(test)]
    pub(crate) fn stats_of(&self, user: &User) -> UserStats {
        self.stats.get(user.id()).copied().unwrap_or_default()
    }

    /// Charge one message of `amount` against this peer on behalf of `user`.
    ///
    /// `mem_free` is the peer pool's free byte count. On failure everything
    /// charged so far is rolled back in reverse order and the budgets are
    /// exactly as before the call.
    pub(crate) fn charge(
        &mut self,
        local: &mut LocalBudgets,
        mem_free: u64,
        user: &User,
        amount: ChargeAmount,
    ) -> Result<(), OpError> {
        let stats = self.stats_mut(user);

        // Memory has no per-user global counter; peers bound it via their
        // pool.
        charge_local_u64(mem_free, stats.n_allocated, amount.size, Resource::Memory)?;

        charge_one(
            &user.n_messages,
            local.n_messages,
            stats.n_messages,
            1,
            Resource::Messages,
        )?;

        if let Err(e) = charge_one(
            &user.n_handles,
            local.n_handles,
            stats.n_handles,
            amount.n_handles,
            Resource::Handles,
        ) {
            user.n_messages.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        if let Err(e) = charge_one(
            &user.n_fds,
            local.n_fds,
            stats.n_fds,
            amount.n_fds,
            Resource::Fds,
        ) {
            user.n_handles.fetch_add(amount.n_handles, Ordering::Relaxed);
            user.n_messages.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        local.n_messages -= 1;
        local.n_handles -= amount.n_handles;
        local.n_fds -= amount.n_fds;
        stats.n_allocated += amount.size;
        stats.n_messages += 1;
        stats.n_handles += amount.n_handles;
        stats.n_fds += amount.n_fds;

        Ok(())
    }

    /// Exact inverse of one [`Quota::charge`].
    pub(crate) fn discharge(
        &mut self,
        local: &mut LocalBudgets,
        user: &User,
        amount: ChargeAmount,
    ) {
        let stats = self.stats_mut(user);
        stats.n_allocated -= amount.size;
        stats.n_messages -= 1;
        stats.n_handles -= amount.n_handles;
        stats.n_fds -= amount.n_fds;

        local.n_messages += 1;
        local.n_handles += amount.n_handles;
        local.n_fds += amount.n_fds;

        user.n_messages.fetch_add(1, Ordering::Relaxed);
        user.n_handles.fetch_add(amount.n_handles, Ordering::Relaxed);
        user.n_fds.fetch_add(amount.n_fds, Ordering::Relaxed);
    }

    /// Finalise an inflight charge at delivery: the message stops counting
    /// against the sender's inflight share, and the fds are handed back to
    /// the user-global counter (they are externally accounted once
    /// installed).
    pub(crate) fn commit(&mut self, user: &User, amount: ChargeAmount) {
        let stats = self.stats_mut(user);
        stats.n_allocated -= amount.size;
        stats.n_messages -= 1;
        stats.n_handles -= amount.n_handles;
        stats.n_fds -= amount.n_fds;

        user.n_fds.fetch_add(amount.n_fds, Ordering::Relaxed);
    }

    /// End the owed window for a delivered message: the consumed entry and
    /// its transferred handles return to the local budgets and the sender's
    /// global counters. Pool bytes come back when the slice is released.
    pub(crate) fn settle_delivery(
        &mut self,
        local: &mut LocalBudgets,
        user: &User,
        amount: ChargeAmount,
    ) {
        local.n_messages += 1;
        local.n_handles += amount.n_handles;
        local.n_fds += amount.n_fds;
        user.n_messages.fetch_add(1, Ordering::Relaxed);
        user.n_handles.fetch_add(amount.n_handles, Ordering::Relaxed);
    }

    /// Drop every per-user stat (peer reset).
    pub(crate) fn clear(&mut self) {
        self.stats.clear();
    }
}

/// The fairness rule for one resource: with L remaining locally, S already
/// owned by this user and C to charge, the charge is admitted iff afterwards
/// the free space still covers the user's whole footprint. Nobody gets past
/// half of what is left.
fn charge_one(
    global: &AtomicU32,
    local: u32,
    share: u32,
    charge: u32,
    resource: Resource,
) -> Result<(), OpError> {
    if local < charge || local - charge < share + charge {
        return Err(OpError::Quota(resource));
    }
    if !sub_if_remainder_ge(global, charge, share.saturating_add(charge.saturating_mul(2))) {
        return Err(OpError::Quota(resource));
    }
    Ok(())
}

fn charge_local_u64(local: u64, share: u64, charge: u64, resource: Resource) -> Result<(), OpError> {
    if local < charge || local - charge < share + charge {
        return Err(OpError::Quota(resource));
    }
    Ok(())
}

/// Atomically subtract `sub` if the remainder stays at or above `min`.
fn sub_if_remainder_ge(value: &AtomicU32, sub: u32, min: u32) -> bool {
    let mut cur = value.load(Ordering::Relaxed);
    loop {
        if cur < sub || cur - sub < min {
            return false;
        }
        match value.compare_exchange_weak(cur, cur - sub, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return true,
            Err(actual) => cur = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(messages: u32) -> UserRegistry {
        UserRegistry::new(Limits {
            messages,
            ..Limits::default()
        })
    }

    fn msg() -> ChargeAmount {
        ChargeAmount {
            size: 0,
            n_handles: 0,
            n_fds: 0,
        }
    }

    #[test]
    fn users_are_singletons_with_dense_ids() {
        let registry = registry(8);
        let a = registry.user(1000);
        let b = registry.user(1001);
        let a2 = registry.user(1000);
        assert!(Arc::ptr_eq(&a, &a2));
        assert_eq!(a.id(), 0);
        assert_eq!(b.id(), 1);
    }

    #[test]
    fn single_user_is_capped_at_half() {
        let registry = registry(64);
        let user = registry.user(1);
        let mut quota = Quota::default();
        let mut local = LocalBudgets::new(&Limits {
            messages: 8,
            ..Limits::default()
        });

        for _ in 0..4 {
            quota.charge(&mut local, 1 << 20, &user, msg()).unwrap();
        }
        assert_eq!(
            quota.charge(&mut local, 1 << 20, &user, msg()).unwrap_err(),
            OpError::Quota(Resource::Messages)
        );
    }

    #[test]
    fn second_user_shrinks_the_first_users_cap() {
        let registry = registry(64);
        let u1 = registry.user(1);
        let u2 = registry.user(2);
        let mut quota = Quota::default();
        let mut local = LocalBudgets::new(&Limits {
            messages: 8,
            ..Limits::default()
        });

        for _ in 0..3 {
            quota.charge(&mut local, 1 << 20, &u1, msg()).unwrap();
        }
        quota.charge(&mut local, 1 << 20, &u2, msg()).unwrap();

        // u1 holds 3, u2 holds 1, 4 free: a 4th for u1 would leave 3 free
        // against a footprint of 4.
        assert!(quota.charge(&mut local, 1 << 20, &u1, msg()).is_err());
    }

    #[test]
    fn charge_discharge_is_a_noop() {
        let registry = registry(8);
        let user = registry.user(1);
        let mut quota = Quota::default();
        let limits = Limits {
            messages: 8,
            ..Limits::default()
        };
        let mut local = LocalBudgets::new(&limits);
        let amount = ChargeAmount {
            size: 64,
            n_handles: 2,
            n_fds: 1,
        };

        let before_global = user.remaining_messages();
        quota.charge(&mut local, 1 << 20, &user, amount).unwrap();
        quota.discharge(&mut local, &user, amount);

        assert_eq!(local.n_messages, limits.messages);
        assert_eq!(local.n_handles, limits.handles);
        assert_eq!(local.n_fds, limits.fds);
        assert_eq!(user.remaining_messages(), before_global);
        let stats = quota.stats_of(&user);
        assert_eq!(stats.n_messages, 0);
        assert_eq!(stats.n_allocated, 0);
    }

    #[test]
    fn failed_charge_rolls_back_earlier_resources() {
        let registry = UserRegistry::new(Limits {
            messages: 64,
            handles: 64,
            fds: 2,
        });
        let user = registry.user(1);
        let mut quota = Quota::default();
        let mut local = LocalBudgets::new(&Limits {
            messages: 64,
            handles: 64,
            fds: 2,
        });

        // fds=2 cannot admit a charge of 1 (remainder 1 < share 0 + 2).
        let amount = ChargeAmount {
            size: 0,
            n_handles: 3,
            n_fds: 1,
        };
        assert_eq!(
            quota.charge(&mut local, 1 << 20, &user, amount).unwrap_err(),
            OpError::Quota(Resource::Fds)
        );

        // Messages and handles charged before the failure were refunded.
        assert_eq!(user.remaining_messages(), 64);
        assert_eq!(user.n_handles.load(Ordering::Relaxed), 64);
        assert_eq!(local.n_messages, 64);
        assert_eq!(local.n_handles, 64);
    }

    #[test]
    fn memory_is_bounded_by_pool_free_space() {
        let registry = registry(64);
        let user = registry.user(1);
        let mut quota = Quota::default();
        let mut local = LocalBudgets::new(&Limits::default());

        let amount = ChargeAmount {
            size: 600,
            n_handles: 0,
            n_fds: 0,
        };
        // 1000 free: 600 would leave 400 < 600.
        assert_eq!(
            quota.charge(&mut local, 1000, &user, amount).unwrap_err(),
            OpError::Quota(Resource::Memory)
        );
        assert!(quota.charge(&mut local, 2000, &user, amount).is_ok());
    }

    #[test]
    fn sub_if_remainder_ge_is_exact() {
        let v = AtomicU32::new(10);
        assert!(sub_if_remainder_ge(&v, 3, 7));
        assert_eq!(v.load(Ordering::Relaxed), 7);
        assert!(!sub_if_remainder_ge(&v, 3, 5));
        assert_eq!(v.load(Ordering::Relaxed), 7);
    }
}
