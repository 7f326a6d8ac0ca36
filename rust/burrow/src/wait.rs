//! Readable-edge watch.
//!
//! The queue itself never blocks; whoever embeds a peer needs an edge to
//! wake up on. Every queue transition from "nothing committed" to "front
//! available" bumps the watch. Waiters snapshot the epoch, re-check their
//! condition, and sleep until the epoch moves past their snapshot, which
//! closes the usual lost-wakeup window.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub(crate) struct Watch {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl Default for Watch {
    fn default() -> Self {
        Self {
            epoch: Mutex::new(0),
            cond: Condvar::new(),
        }
    }
}

impl Watch {
    /// Record a readable edge and wake all waiters.
    pub(crate) fn notify(&self) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.cond.notify_all();
    }

    /// Current epoch; pass to [`Watch::wait_past`] after re-checking the
    /// condition.
    pub(crate) fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Block until the epoch moves past `seen` or `timeout` elapses.
    /// Returns true if an edge arrived.
    pub(crate) fn wait_past(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut epoch = self.epoch.lock();
        while *epoch == seen {
            if self.cond.wait_until(&mut epoch, deadline).timed_out() {
                return *epoch != seen;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_immediately_if_epoch_moved() {
        let watch = Watch::default();
        let seen = watch.epoch();
        watch.notify();
        assert!(watch.wait_past(seen, Duration::from_millis(1)));
    }

    #[test]
    fn wait_times_out_without_edge() {
        let watch = Watch::default();
        let seen = watch.epoch();
        assert!(!watch.wait_past(seen, Duration::from_millis(10)));
    }

    #[test]
    fn notify_wakes_a_sleeping_waiter() {
        let watch = Arc::new(Watch::default());
        let seen = watch.epoch();

        let waiter = {
            let watch = watch.clone();
            thread::spawn(move || watch.wait_past(seen, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(50));
        watch.notify();
        assert!(waiter.join().unwrap());
    }
}
