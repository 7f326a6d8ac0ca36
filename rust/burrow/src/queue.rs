//! Per-peer reception queue.
//!
//! An ordered set of entries keyed by stamp, with a cached *front*: the
//! leftmost entry, if and only if that entry is committed (even stamp). A
//! staged entry (odd stamp) sitting leftmost blocks the front entirely, so a
//! reader never observes an entry that might still be reordered in front of
//! it. Dequeuing therefore sees strictly increasing commit stamps.
//!
//! Entries at the same stamp are ordered by the sender's peer seed so every
//! receiver resolves same-stamp interleavings identically; a per-queue serial
//! disambiguates the pathological same-stamp-same-sender case.
//!
//! The queue is a pure data structure: single writer under the peer lock, no
//! blocking, no timestamps of its own.

use std::collections::BTreeMap;

/// Position of one entry in a queue. Stable until the entry is relinked or
/// removed; `relink` returns the replacement key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct EntryKey {
    pub stamp: u64,
    pub sender: u64,
    serial: u64,
}

impl EntryKey {
    #[inline]
    pub(crate) fn is_staging(&self) -> bool {
        self.stamp % 2 == 1
    }
}

#[derive(Debug)]
pub(crate) struct Queue<T> {
    entries: BTreeMap<EntryKey, T>,
    front: Option<EntryKey>,
    next_serial: u64,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            front: None,
            next_serial: 0,
        }
    }
}

impl<T> Queue<T> {
    /// Number of linked entries, staged ones included.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn is_readable(&self) -> bool {
        self.front.is_some()
    }

    /// Link an entry at `stamp` (odd = staged, even = committed).
    ///
    /// Returns the entry's key and true iff the queue became readable with
    /// this call.
    pub(crate) fn link(&mut self, stamp: u64, sender: u64, entry: T) -> (EntryKey, bool) {
        let key = EntryKey {
            stamp,
            sender,
            serial: self.next_serial,
        };
        self.next_serial += 1;

        let was_readable = self.front.is_some();
        self.entries.insert(key, entry);
        self.recompute_front();
        (key, !was_readable && self.front.is_some())
    }

    /// Move a staged entry to `stamp` (typically its even commit stamp).
    ///
    /// Returns the new key and true iff the front became non-null as a
    /// result. Fails if the entry is gone (the receiver flushed in between).
    pub(crate) fn relink(&mut self, key: EntryKey, stamp: u64) -> Option<(EntryKey, bool)> {
        debug_assert!(key.is_staging(), "only staged entries are relinked");
        let entry = self.entries.remove(&key)?;

        let new_key = EntryKey { stamp, ..key };
        let was_readable = self.front.is_some();
        self.entries.insert(new_key, entry);
        self.recompute_front();
        Some((new_key, !was_readable && self.front.is_some()))
    }

    /// Remove an entry. Returns it together with true iff removing it
    /// exposed a committed successor (the entry was the staged front
    /// blocker).
    pub(crate) fn unlink(&mut self, key: EntryKey) -> Option<(T, bool)> {
        let entry = self.entries.remove(&key)?;
        let was_readable = self.front.is_some();
        self.recompute_front();
        Some((entry, !was_readable && self.front.is_some()))
    }

    /// The committed front, if any. Staged entries are never returned.
    pub(crate) fn peek(&self) -> Option<(EntryKey, &T)> {
        let key = self.front?;
        Some((key, self.entries.get(&key).expect("front is linked")))
    }

    /// Mutable access to a linked entry (commit writes final ids in place).
    pub(crate) fn entry_mut(&mut self, key: EntryKey) -> Option<&mut T> {
        self.entries.get_mut(&key)
    }

    /// Dequeue the committed front.
    pub(crate) fn pop_front(&mut self) -> Option<(EntryKey, T)> {
        let key = self.front?;
        let entry = self.entries.remove(&key).expect("front is linked");
        self.recompute_front();
        Some((key, entry))
    }

    /// Release every entry, staged and committed. The caller settles the
    /// resources each entry pinned.
    pub(crate) fn flush(&mut self) -> Vec<(EntryKey, T)> {
        self.front = None;
        let drained = std::mem::take(&mut self.entries);
        drained.into_iter().collect()
    }

    /// The front is the leftmost entry iff that entry is committed. A staged
    /// leftmost entry hides everything behind it.
    fn recompute_front(&mut self) {
        self.front = match self.entries.keys().next() {
            Some(key) if !key.is_staging() => Some(*key),
            _ => None,
        };
    }
}
