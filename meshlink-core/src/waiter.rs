//! One-shot synchronizer used by [`crate::client::Client::wait`] (spec.md
//! §3 "Waiter", §4.4 "Waiter semantics").

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Watches a set of future counters; the first one to complete "wins" and
/// the waiter fires exactly once, then is expected to unregister itself
/// from every watched future's waiter set (callers do the unregistration
/// using [`Waiter::counters`] — see `Client::wait`).
pub struct Waiter {
    counters: Vec<u64>,
    fired: AtomicBool,
    completed: Mutex<Option<u64>>,
    sender: Mutex<Option<futures::channel::oneshot::Sender<()>>>,
    receiver: Mutex<Option<futures::channel::oneshot::Receiver<()>>>,
}

impl Waiter {
    /// Create a waiter bound to the given future counters.
    #[must_use]
    pub fn new(counters: Vec<u64>) -> Arc<Self> {
        let (tx, rx) = futures::channel::oneshot::channel();
        Arc::new(Self {
            counters,
            fired: AtomicBool::new(false),
            completed: Mutex::new(None),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
        })
    }

    /// The counters this waiter watches.
    #[must_use]
    pub fn counters(&self) -> &[u64] {
        &self.counters
    }

    /// Whether this waiter has already fired.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Fire the waiter with the counter of the future that completed
    /// first. A no-op if already fired — "first completion wins".
    pub fn fire(&self, counter: u64) {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.completed.lock() = Some(counter);
            if let Some(tx) = self.sender.lock().take() {
                let _ = tx.send(());
            }
        }
    }

    /// Block (asynchronously) until fired, or until `timeout` elapses.
    /// Returns the counter of the future that fired it, or `None` on
    /// timeout. May only be called once per waiter (mirrors the
    /// single-wait usage from `Client::wait`).
    pub async fn wait(&self, timeout: Option<std::time::Duration>) -> Option<u64> {
        if self.has_fired() {
            return *self.completed.lock();
        }
        let receiver = self.receiver.lock().take();
        if let Some(receiver) = receiver {
            match timeout {
                None => {
                    let _ = receiver.await;
                }
                Some(d) => {
                    if compio::time::timeout(d, receiver).await.is_err() {
                        return None;
                    }
                }
            }
        }
        *self.completed.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[compio::test]
    async fn fires_exactly_once_with_first_counter() {
        let w = Waiter::new(vec![1, 2, 3]);
        w.fire(2);
        w.fire(3); // ignored, already fired
        assert_eq!(w.wait(None).await, Some(2));
    }

    #[compio::test]
    async fn times_out_when_never_fired() {
        let w = Waiter::new(vec![1]);
        let res = w.wait(Some(std::time::Duration::from_millis(20))).await;
        assert_eq!(res, None);
    }
}
