//! Notification Queue
//!
//! Wakes async tasks that wait for a condition another task will change:
//! a free admission slot, or the last pending write finishing.
//!
//! # Waiting for a handle
//!
//! 10. Waiter: check condition
//! 20. Waiter: call `wait_async`
//! 30. Queue: add waiter to the waiting list
//! 40. Queue: wait for handle notification
//!
//! 50. Notifier: change the condition, then call `notify`
//! 60. Queue: extract the waiter(s) from the waiting list and wake them
//!
//! Step 60 may run between steps 10 and 30, in which case the waiter would
//! never be woken. The waiter therefore takes the queue lock to make steps
//! 10-30 atomic:
//!
//! ```ignore
//! if should_wait() {
//!     let lock = queue.get_lock();
//!     if should_wait() {
//!         queue.wait_async(handle, "hint", lock).await;
//!     }
//! }
//! ```
//!
//! The notifier changes the condition before `notify`, and `notify` takes the
//! same lock, so a waiter either sees the new condition or is registered in
//! time to be woken.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    id: i64,
}

impl Handle {
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self { id }
    }
}

/// Value delivered to woken waiters
pub type Signal = i64;

struct Waiter {
    sender: tokio::sync::oneshot::Sender<Signal>,
    debug_hint: String,
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("debug_hint", &self.debug_hint)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct InnerState {
    whitelist: HashMap<Handle, String>,
    waiters: HashMap<Handle, Vec<Waiter>>,
}

/// Thread-safe queue of handle notifications
#[derive(Clone, Default)]
pub struct NotificationQueueArc {
    inner: Arc<Mutex<InnerState>>,
}

impl NotificationQueueArc {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the lock for atomic condition-check + register operations
    pub fn get_lock(&self) -> parking_lot::MutexGuard<'_, InnerState> {
        self.inner.lock()
    }

    /// Allow waiting on a handle
    pub fn whitelist(&self, handle: Handle, debug_hint: &str) {
        let mut state = self.inner.lock();
        if let Some(old_hint) = state.whitelist.insert(handle, debug_hint.to_string()) {
            log::warn!(
                "queue.whitelist: handle {handle:?} already in whitelist (was: '{old_hint}')",
            );
        }
    }

    /// Wake every waiter of a handle
    pub fn notify(&self, handle: Handle, signal: Signal) {
        let waiters = self.inner.lock().waiters.remove(&handle).unwrap_or_default();

        if !waiters.is_empty() {
            log::trace!(
                "queue.notify: handle {:?}, signal={}, waiters: {}",
                handle,
                signal,
                waiters.len()
            );
        }
        for waiter in waiters {
            if waiter.sender.send(signal).is_err() {
                log::debug!(
                    "queue.notify: receiver dropped for handle {:?} (hint: {})",
                    handle,
                    waiter.debug_hint
                );
            }
        }
    }

    /// Wait for the handle notification
    ///
    /// Precondition: the caller holds the lock from [`Self::get_lock`].
    /// The lock is released before the returned future is polled.
    /// A handle that is not whitelisted resolves immediately.
    pub fn wait_async(
        &self,
        handle: Handle,
        debug_hint: &str,
        mut lock: parking_lot::MutexGuard<'_, InnerState>,
    ) -> impl std::future::Future<Output = ()> + Send {
        let (tx, rx) = tokio::sync::oneshot::channel();

        if lock.whitelist.contains_key(&handle) {
            lock.waiters.entry(handle).or_default().push(Waiter {
                sender: tx,
                debug_hint: debug_hint.to_string(),
            });
        } else {
            let _ = tx.send(0);
        }
        drop(lock);

        async move {
            // The sender is only dropped unsent if the whole queue is dropped
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const SLOT: Handle = Handle::new(1);

    fn waiting(queue: &NotificationQueueArc, handle: Handle) -> usize {
        queue.get_lock().waiters.get(&handle).map_or(0, Vec::len)
    }

    #[tokio::test]
    async fn test_notify_wakes_waiter() {
        let queue = NotificationQueueArc::new();
        queue.whitelist(SLOT, "slot");
        let ready = Arc::new(AtomicBool::new(false));

        let waiter = {
            let queue = queue.clone();
            let ready = Arc::clone(&ready);
            tokio::spawn(async move {
                while !ready.load(Ordering::SeqCst) {
                    let wait = {
                        let lock = queue.get_lock();
                        (!ready.load(Ordering::SeqCst)).then(|| queue.wait_async(SLOT, "test", lock))
                    };
                    if let Some(wait) = wait {
                        wait.await;
                    }
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(waiting(&queue, SLOT), 1);
        ready.store(true, Ordering::SeqCst);
        queue.notify(SLOT, 0);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
        assert_eq!(waiting(&queue, SLOT), 0);
    }

    #[tokio::test]
    async fn test_unlisted_handle_resolves_immediately() {
        let queue = NotificationQueueArc::new();
        let lock = queue.get_lock();
        tokio::time::timeout(Duration::from_millis(100), queue.wait_async(SLOT, "test", lock))
            .await
            .expect("wait on unlisted handle should not block");
    }
}
