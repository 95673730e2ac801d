//! Background task grouping writes into bulk calls
//!
//! The task owns the open batch, the queue of sealed batches and the set of
//! batches in flight. It reacts to three event sources:
//! - commands from [`super::BulkWriteQueue`] (write, flush, close)
//! - completion of an in-flight batch
//! - the flush interval
//!
//! A batch is sealed when it reaches the count or byte threshold, on the
//! interval, or on request. Sealed batches start as soon as fewer than
//! `max_concurrent_batches` are in flight.
//!
//! Failed batches are re-queued only while the queue handle is alive. Once
//! it is dropped, or after `Abort`, unfinished writes count as dropped and
//! the task exits.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::{WriteState, WriteStats};
use crate::backoff::Backoff;
use crate::config::BulkQueueConfig;
use crate::connection::Connection;
use crate::remote::{DocumentStore, ItemOutcome, StoreError, UpdateOp};

/// Requests sent from the queue handle to the batcher task
pub(crate) enum Command {
    Write(PendingWrite),
    Flush,
    /// Flush everything and answer once nothing is left in flight
    Close(oneshot::Sender<()>),
    /// Stop now: abandon in-flight batches and drop what is left
    Abort,
}

pub(crate) struct PendingWrite {
    op: UpdateOp,
    bytes: usize,
    /// Times the write was re-queued after a failed batch
    requeues: u32,
}

impl PendingWrite {
    pub(crate) fn new(op: UpdateOp) -> Self {
        let bytes = op.estimated_bytes();
        Self {
            op,
            bytes,
            requeues: 0,
        }
    }
}

struct Batch {
    id: u64,
    writes: Vec<PendingWrite>,
}

/// Result of one batch, after all retries
struct BatchDone {
    batch: Batch,
    result: Result<Vec<ItemOutcome>, StoreError>,
}

type BatchFuture = Pin<Box<dyn Future<Output = BatchDone> + Send>>;

pub(crate) struct Batcher<S: DocumentStore> {
    connection: Arc<Connection<S>>,
    config: BulkQueueConfig,
    stats: Arc<WriteStats>,
    rx: mpsc::UnboundedReceiver<Command>,
    open: Vec<PendingWrite>,
    open_bytes: usize,
    ready: VecDeque<Batch>,
    next_batch_id: u64,
    closers: Vec<oneshot::Sender<()>>,
    /// Writes inside batches that are currently being sent
    in_flight_writes: u64,
    /// The queue handle still exists
    accepting: bool,
    aborted: bool,
}

/// Send one batch, backing off on transient failures
async fn execute<S: DocumentStore>(
    connection: Arc<Connection<S>>,
    batch: Batch,
    mut backoff: Backoff,
) -> BatchDone {
    let ops: Vec<UpdateOp> = batch.writes.iter().map(|w| w.op.clone()).collect();
    loop {
        let result = match connection.client() {
            Ok(client) => client.bulk_update(ops.clone()).await,
            Err(e) => Err(e),
        };
        match result {
            Err(e) if e.is_transient() => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        batch = batch.id,
                        writes = ops.len(),
                        attempt = backoff.attempt(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "bulk call failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return BatchDone { batch, result: Err(e) },
            },
            result => return BatchDone { batch, result },
        }
    }
}

impl<S: DocumentStore> Batcher<S> {
    pub(crate) fn new(
        connection: Arc<Connection<S>>,
        config: BulkQueueConfig,
        stats: Arc<WriteStats>,
        rx: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            connection,
            config,
            stats,
            rx,
            open: Vec::new(),
            open_bytes: 0,
            ready: VecDeque::new(),
            next_batch_id: 0,
            closers: Vec::new(),
            in_flight_writes: 0,
            accepting: true,
            aborted: false,
        }
    }

    fn push(&mut self, write: PendingWrite) {
        trace!(id = %write.op.id, state = %WriteState::Batched, "write added to batch");
        self.open_bytes += write.bytes;
        self.open.push(write);
        if self.open.len() >= self.config.batch_size {
            self.seal("count");
        } else if self.open_bytes >= self.config.batch_bytes {
            self.seal("bytes");
        }
    }

    /// Move the open batch to the ready queue
    fn seal(&mut self, reason: &str) {
        if self.open.is_empty() {
            return;
        }
        let id = self.next_batch_id;
        self.next_batch_id += 1;
        let writes = std::mem::take(&mut self.open);
        debug!(batch = id, writes = writes.len(), bytes = self.open_bytes, reason, "sealed batch");
        self.open_bytes = 0;
        self.ready.push_back(Batch { id, writes });
    }

    fn dispatch(&mut self, in_flight: &mut FuturesUnordered<BatchFuture>) {
        while in_flight.len() < self.config.max_concurrent_batches {
            let Some(batch) = self.ready.pop_front() else {
                break;
            };
            trace!(batch = batch.id, writes = batch.writes.len(), state = %WriteState::InFlight, "dispatching batch");
            self.in_flight_writes += batch.writes.len() as u64;
            let backoff = Backoff::new(
                self.config.initial_backoff(),
                self.config.max_backoff(),
                self.config.max_retries,
            );
            in_flight.push(Box::pin(execute(Arc::clone(&self.connection), batch, backoff)));
        }
    }

    fn complete(&mut self, done: BatchDone) {
        let BatchDone { batch, result } = done;
        let count = batch.writes.len() as u64;
        self.in_flight_writes -= count;
        match result {
            Ok(outcomes) => {
                let mut outcomes = outcomes.into_iter();
                for write in batch.writes {
                    match outcomes.next() {
                        Some(outcome) if !outcome.is_failed() => {
                            info!(
                                index = %write.op.index,
                                id = %write.op.id,
                                outcome = %outcome.status,
                                changes = %serde_json::to_string(&write.op.changes).unwrap_or_default(),
                                "update acknowledged"
                            );
                            self.stats.acknowledged();
                        }
                        Some(outcome) => {
                            warn!(
                                index = %write.op.index,
                                id = %write.op.id,
                                error = outcome.error.as_deref().unwrap_or("unknown"),
                                state = %WriteState::FailedTerminal,
                                "update rejected"
                            );
                            self.stats.rejected();
                        }
                        None => {
                            warn!(id = %write.op.id, batch = batch.id, "bulk response has no entry for write");
                            self.stats.rejected();
                        }
                    }
                }
            }
            Err(e) if e.is_transient() && !self.accepting => {
                error!(batch = batch.id, writes = count, error = %e, "bulk call failed after retries and the queue is gone, dropping writes");
                self.stats.dropped(count);
            }
            Err(e) if e.is_transient() => {
                error!(batch = batch.id, writes = count, error = %e, "bulk call failed after retries, re-queueing writes");
                self.stats.resubmitted(count);
                for mut write in batch.writes {
                    write.requeues += 1;
                    trace!(
                        id = %write.op.id,
                        requeues = write.requeues,
                        state = %WriteState::FailedRetryable,
                        "write re-queued"
                    );
                    self.push(write);
                }
            }
            Err(e) => {
                error!(batch = batch.id, writes = count, error = %e, "bulk call failed, dropping writes");
                self.stats.dropped(count);
            }
        }
    }

    fn is_idle(&self, in_flight: &FuturesUnordered<BatchFuture>) -> bool {
        self.open.is_empty() && self.ready.is_empty() && in_flight.is_empty()
    }

    /// Main event loop
    pub(crate) async fn run(mut self) {
        let mut in_flight: FuturesUnordered<BatchFuture> = FuturesUnordered::new();
        let period = self.config.flush_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.aborted {
                break;
            }
            let closing = !self.accepting || !self.closers.is_empty();
            if closing {
                self.seal("close");
            }
            self.dispatch(&mut in_flight);

            if closing && self.is_idle(&in_flight) {
                for reply in self.closers.drain(..) {
                    let _ = reply.send(());
                }
                info!("batcher finished");
                break;
            }

            tokio::select! {
                command = self.rx.recv(), if self.accepting => {
                    match command {
                        Some(Command::Write(write)) => {
                            trace!(id = %write.op.id, state = %WriteState::Queued, "write received");
                            self.push(write);
                        }
                        Some(Command::Flush) => self.seal("flush"),
                        Some(Command::Close(reply)) => self.closers.push(reply),
                        Some(Command::Abort) => {
                            warn!("batcher aborted");
                            self.aborted = true;
                        }
                        None => {
                            debug!("queue handle dropped");
                            self.accepting = false;
                        }
                    }
                }

                Some(done) = in_flight.next(), if !in_flight.is_empty() => {
                    self.complete(done);
                }

                _ = ticker.tick() => {
                    self.seal("interval");
                }
            }
        }

        if self.aborted {
            drop(in_flight);
            self.drop_unfinished();
        }
        self.drop_leftovers();
    }

    /// Count every write the aborted loop still held as dropped
    fn drop_unfinished(&mut self) {
        let unfinished = self.open.len() as u64
            + self.ready.iter().map(|b| b.writes.len() as u64).sum::<u64>()
            + self.in_flight_writes;
        self.open.clear();
        self.ready.clear();
        self.in_flight_writes = 0;
        if unfinished > 0 {
            warn!(writes = unfinished, state = %WriteState::FailedTerminal, "dropping unfinished writes");
            self.stats.dropped(unfinished);
        }
        for reply in self.closers.drain(..) {
            let _ = reply.send(());
        }
    }

    /// Count writes that arrived after the loop stopped
    fn drop_leftovers(&mut self) {
        self.rx.close();
        let mut leftover = 0u64;
        while let Ok(command) = self.rx.try_recv() {
            match command {
                Command::Write(write) => {
                    warn!(id = %write.op.id, state = %WriteState::FailedTerminal, "write arrived after close");
                    leftover += 1;
                }
                Command::Close(reply) => {
                    let _ = reply.send(());
                }
                Command::Flush | Command::Abort => {}
            }
        }
        if leftover > 0 {
            self.stats.dropped(leftover);
        }
    }
}
