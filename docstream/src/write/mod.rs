//! Write queues
//!
//! Two policies behind one [`UpdateQueue`] contract:
//!
//! - [`ThrottledWriteQueue`]: one remote call per update, admission limited
//!   by an adaptive ceiling that shrinks on throttle signals.
//! - [`BulkWriteQueue`]: updates are grouped into batches by a background
//!   task, batches are retried with backoff and re-queued item by item when
//!   the transport keeps failing.
//!
//! `update` never fails. Outcomes are logged and counted in [`WriteStats`].

mod batcher;
mod bulk;
mod throttled;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::error::Result;
use crate::remote::Changes;

pub use bulk::BulkWriteQueue;
pub use throttled::{shrink_ceiling, ThrottledWriteQueue};

/// Contract shared by the write policies
pub trait UpdateQueue: Send + Sync {
    /// Queue a partial update of document `id`. Empty changes are ignored.
    fn update(&self, id: &str, changes: Changes) -> impl Future<Output = ()> + Send;

    /// Queue a single-field update
    fn update_field(
        &self,
        id: &str,
        field: &str,
        value: Value,
    ) -> impl Future<Output = ()> + Send {
        let mut changes = Changes::new();
        changes.insert(field.to_string(), value);
        self.update(id, changes)
    }

    /// Flush and end the write session
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Life cycle of one write
///
/// ```text
/// queued -> batched -> in-flight -> acknowledged
///                               \-> failed-retryable -> queued
///                               \-> failed-terminal
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Queued,
    Batched,
    InFlight,
    Acknowledged,
    FailedRetryable,
    FailedTerminal,
}

impl WriteState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acknowledged | Self::FailedTerminal)
    }
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Batched => "batched",
            Self::InFlight => "in-flight",
            Self::Acknowledged => "acknowledged",
            Self::FailedRetryable => "failed-retryable",
            Self::FailedTerminal => "failed-terminal",
        };
        f.write_str(name)
    }
}

/// Counters shared by a queue and its workers
#[derive(Debug, Default)]
pub struct WriteStats {
    accepted: AtomicU64,
    acknowledged: AtomicU64,
    rejected: AtomicU64,
    throttled: AtomicU64,
    resubmitted: AtomicU64,
    dropped: AtomicU64,
}

impl WriteStats {
    pub(crate) fn accepted(&self) {
        self.accepted.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn acknowledged(&self) {
        self.acknowledged.fetch_add(1, Ordering::SeqCst);
    }

    /// The store refused the write itself
    pub(crate) fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn throttled(&self) {
        self.throttled.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn resubmitted(&self, n: u64) {
        self.resubmitted.fetch_add(n, Ordering::SeqCst);
    }

    /// Given up without a store verdict
    pub(crate) fn dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::SeqCst);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::SeqCst),
            acknowledged: self.acknowledged.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            throttled: self.throttled.load(Ordering::SeqCst),
            resubmitted: self.resubmitted.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub acknowledged: u64,
    pub rejected: u64,
    pub throttled: u64,
    pub resubmitted: u64,
    pub dropped: u64,
}

impl StatsSnapshot {
    /// Accepted writes without a terminal outcome yet
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.accepted
            .saturating_sub(self.acknowledged + self.rejected + self.dropped)
    }
}
