//! One remote call per update, under an adaptive concurrency ceiling

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::{StatsSnapshot, UpdateQueue, WriteStats};
use crate::config::ThrottledQueueConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::notification_queue::{Handle, NotificationQueueArc};
use crate::remote::{Changes, DocumentStore, StoreError, UpdateOp};

const SLOT_FREED: Handle = Handle::new(1);
const WRITE_DONE: Handle = Handle::new(2);

/// Next ceiling after a throttle signal: 90% rounded down, at least one less
#[must_use]
pub fn shrink_ceiling(current: usize) -> usize {
    (current * 9 / 10).min(current.saturating_sub(1))
}

fn changes_json(changes: &Changes) -> String {
    serde_json::to_string(changes).unwrap_or_default()
}

struct Shared<S: DocumentStore> {
    connection: Arc<Connection<S>>,
    index: String,
    config: ThrottledQueueConfig,
    max_in_flight: AtomicUsize,
    in_flight: AtomicUsize,
    stats: WriteStats,
    queue: NotificationQueueArc,
}

impl<S: DocumentStore> Shared<S> {
    fn ceiling(&self) -> usize {
        self.max_in_flight
            .load(Ordering::SeqCst)
            .max(self.config.min_in_flight)
    }

    fn try_acquire(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.ceiling()).then_some(n + 1)
            })
            .is_ok()
    }

    /// Wait for a free slot and take it
    async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            let wait = {
                let lock = self.queue.get_lock();
                if self.try_acquire() {
                    return;
                }
                trace!(in_flight = self.in_flight.load(Ordering::SeqCst), "waiting for admission");
                self.queue.wait_async(SLOT_FREED, "admission", lock)
            };
            wait.await;
        }
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.queue.notify(SLOT_FREED, 0);
    }

    /// Lower the ceiling and return the new value
    fn shrink(&self) -> usize {
        let previous = self
            .max_in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |m| Some(shrink_ceiling(m)))
            .unwrap_or_else(|m| m);
        shrink_ceiling(previous)
    }

    fn pending(&self) -> u64 {
        self.stats.snapshot().pending()
    }
}

/// Dispatch one update, re-admitting it after every throttle signal
async fn run_write<S: DocumentStore>(shared: Arc<Shared<S>>, op: UpdateOp) {
    let mut throttles = 0u32;
    loop {
        let result = match shared.connection.client() {
            Ok(client) => client.update(op.clone()).await,
            Err(e) => Err(e),
        };
        shared.release();

        match result {
            Ok(status) => {
                info!(
                    index = %op.index,
                    id = %op.id,
                    outcome = %status,
                    changes = %changes_json(&op.changes),
                    "update acknowledged"
                );
                shared.stats.acknowledged();
                break;
            }
            Err(e) if e.is_throttle() => {
                shared.stats.throttled();
                throttles += 1;
                let ceiling = shared.shrink();
                warn!(id = %op.id, max_in_flight = ceiling, error = %e, "throttled, lowering ceiling");
                if shared
                    .config
                    .max_throttle_retries
                    .is_some_and(|max| throttles > max)
                {
                    warn!(id = %op.id, throttles, "giving up after repeated throttling");
                    shared.stats.dropped(1);
                    break;
                }
                shared.stats.resubmitted(1);
                shared.acquire().await;
            }
            Err(e) => {
                warn!(index = %op.index, id = %op.id, error = %e, "update failed");
                match e {
                    StoreError::Rejected(_) => shared.stats.rejected(),
                    _ => shared.stats.dropped(1),
                }
                break;
            }
        }
    }
    shared.queue.notify(WRITE_DONE, 0);
}

/// Unbounded write queue with adaptive admission
///
/// Every update becomes its own task. Before dispatch the producer waits
/// until fewer than `max(max_in_flight, min_in_flight)` writes are running.
/// Each throttle signal from the store lowers `max_in_flight`; it never
/// grows back.
pub struct ThrottledWriteQueue<S: DocumentStore> {
    shared: Arc<Shared<S>>,
}

impl<S: DocumentStore> Clone for ThrottledWriteQueue<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: DocumentStore> ThrottledWriteQueue<S> {
    /// # Errors
    /// `Error::Config` if `config` does not validate.
    pub fn new(
        connection: Arc<Connection<S>>,
        index: impl Into<String>,
        config: ThrottledQueueConfig,
    ) -> Result<Self> {
        config.validate()?;
        let queue = NotificationQueueArc::new();
        queue.whitelist(SLOT_FREED, "slot freed");
        queue.whitelist(WRITE_DONE, "write done");
        Ok(Self {
            shared: Arc::new(Shared {
                connection,
                index: index.into(),
                max_in_flight: AtomicUsize::new(config.max_in_flight),
                in_flight: AtomicUsize::new(0),
                config,
                stats: WriteStats::default(),
                queue,
            }),
        })
    }

    /// Current ceiling before applying the floor
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Wait until every accepted write has an outcome
    ///
    /// # Errors
    /// `Error::DrainTimeout` with the number of writes still pending.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        let shared = &self.shared;
        let all_done = async {
            loop {
                let wait = {
                    let lock = shared.queue.get_lock();
                    if shared.pending() == 0 {
                        return;
                    }
                    shared.queue.wait_async(WRITE_DONE, "drain", lock)
                };
                wait.await;
            }
        };
        tokio::time::timeout(timeout, all_done)
            .await
            .map_err(|_| Error::DrainTimeout {
                timeout,
                pending: shared.pending(),
            })
    }
}

impl<S: DocumentStore> UpdateQueue for ThrottledWriteQueue<S> {
    async fn update(&self, id: &str, changes: Changes) {
        if changes.is_empty() {
            trace!(id, "ignoring update without changes");
            return;
        }
        // counted only once admitted, so a cancelled wait leaves nothing pending
        self.shared.acquire().await;
        self.shared.stats.accepted();
        let op = UpdateOp::new(self.shared.index.clone(), id, changes);
        tokio::spawn(run_write(Arc::clone(&self.shared), op));
    }

    async fn close(&self) -> Result<()> {
        debug!(pending = self.shared.pending(), "closing throttled queue");
        Ok(())
    }
}
