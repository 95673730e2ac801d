//! Batched write queue handle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::batcher::{Batcher, Command, PendingWrite};
use super::{StatsSnapshot, UpdateQueue, WriteStats};
use crate::config::BulkQueueConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::remote::{Changes, DocumentStore, UpdateOp};

/// Write queue that groups updates into bulk calls
///
/// The batching itself runs on a task spawned by [`Self::new`], which must
/// therefore be called inside a tokio runtime. Dropping the queue without
/// closing it lets that task flush what it holds and exit; batches that
/// still fail after their retries are then dropped instead of re-queued.
pub struct BulkWriteQueue {
    tx: mpsc::UnboundedSender<Command>,
    index: String,
    config: BulkQueueConfig,
    stats: Arc<WriteStats>,
    closed: AtomicBool,
}

impl BulkWriteQueue {
    /// # Errors
    /// `Error::Config` if `config` does not validate.
    pub fn new<S: DocumentStore>(
        connection: Arc<Connection<S>>,
        index: impl Into<String>,
        config: BulkQueueConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(WriteStats::default());
        let batcher = Batcher::new(connection, config.clone(), Arc::clone(&stats), rx);
        tokio::spawn(batcher.run());
        Ok(Self {
            tx,
            index: index.into(),
            config,
            stats,
            closed: AtomicBool::new(false),
        })
    }

    /// Seal the open batch now instead of waiting for a threshold
    pub fn flush(&self) {
        if self.tx.send(Command::Flush).is_err() {
            debug!("flush after batcher exit");
        }
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn config(&self) -> &BulkQueueConfig {
        &self.config
    }
}

impl UpdateQueue for BulkWriteQueue {
    async fn update(&self, id: &str, changes: Changes) {
        if changes.is_empty() {
            return;
        }
        self.stats.accepted();
        if self.is_closed() {
            warn!(index = %self.index, id, "update after close, dropping");
            self.stats.dropped(1);
            return;
        }
        let write = PendingWrite::new(UpdateOp::new(self.index.clone(), id, changes));
        if self.tx.send(Command::Write(write)).is_err() {
            warn!(index = %self.index, id, "batcher is gone, dropping update");
            self.stats.dropped(1);
        }
    }

    /// Flush, then wait up to `close_timeout` for every batch to finish
    ///
    /// On timeout the batcher is aborted and the writes it still holds are
    /// counted as dropped.
    ///
    /// # Errors
    /// - `Error::CloseTimeout` if batches are still in flight at the deadline
    /// - `Error::FlushFailed` if any write was dropped without a store verdict
    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let timeout = self.config.close_timeout();
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Close(reply_tx)).is_ok()
            && tokio::time::timeout(timeout, reply_rx).await.is_err()
        {
            let pending = self.stats.snapshot().pending();
            warn!(pending, ?timeout, "close timed out, aborting batcher");
            let _ = self.tx.send(Command::Abort);
            return Err(Error::CloseTimeout { timeout, pending });
        }

        let stats = self.stats.snapshot();
        debug!(
            acknowledged = stats.acknowledged,
            rejected = stats.rejected,
            dropped = stats.dropped,
            "bulk queue closed"
        );
        if stats.dropped > 0 {
            return Err(Error::FlushFailed {
                dropped: stats.dropped,
            });
        }
        Ok(())
    }
}
