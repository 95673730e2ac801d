//! Prefetching iterator over a paginated remote query
//!
//! [`PagedFetcher`] turns the store's page-at-a-time cursor API into a pull
//! iterator of decoded records. It keeps a local buffer and refills it in
//! the background while the consumer works through it.
//!
//! # Locking
//!
//! - `state` (`parking_lot::Mutex`): buffer, position, totals. Never held
//!   across an await.
//! - `cursor` (`tokio::sync::Mutex`): the remote cursor. Held for the whole
//!   remote call, so at most one fetch per scan is outstanding. A fetch
//!   re-checks `state` after taking it; a caller that lost the race finds the
//!   buffer already refilled and returns without a remote call.
//!
//! # Epochs
//!
//! `reset()` bumps the epoch instead of waiting for running fetches. Every
//! fetch remembers the epoch it started in and drops its page if the epoch
//! moved on meanwhile. The abandoned remote cursor is released at the next
//! fetch.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::FetchConfig;
use crate::connection::Connection;
use crate::decode::Decoder;
use crate::error::{Error, Result};
use crate::remote::{Cursor, DocumentStore, PageRequest, Query, RawRecord};
use crate::source::RecordSource;

#[derive(Debug, Default)]
struct ScanState {
    epoch: u64,
    total_hits: Option<u64>,
    position: u64,
    buffer: VecDeque<RawRecord>,
    prefetching: bool,
    finished: bool,
}

impl ScanState {
    /// Whether the remote still owes records
    fn has_more_requests(&self) -> bool {
        if self.finished {
            return false;
        }
        self.total_hits
            .map_or(true, |total| self.position + (self.buffer.len() as u64) < total)
    }
}

#[derive(Debug, Default)]
struct CursorSlot {
    epoch: u64,
    cursor: Option<Cursor>,
    opened: bool,
}

/// Why a fetch was started; decides when it is no longer needed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    /// Consumer found the buffer empty
    Refill,
    /// Background top-up below the prefetch target
    Prefetch,
    /// Caller needs the total hit count
    Count,
}

struct ScanShared<S: DocumentStore> {
    connection: Arc<Connection<S>>,
    query: Arc<Query>,
    config: FetchConfig,
    state: Mutex<ScanState>,
    cursor: tokio::sync::Mutex<CursorSlot>,
}

impl<S: DocumentStore> ScanShared<S> {
    fn still_needed(&self, epoch: u64, mode: FetchMode) -> bool {
        let state = self.state.lock();
        if state.epoch != epoch || !state.has_more_requests() {
            return false;
        }
        match mode {
            FetchMode::Refill => state.buffer.is_empty(),
            FetchMode::Prefetch => state.buffer.len() < self.config.prefetch_target(),
            FetchMode::Count => state.total_hits.is_none(),
        }
    }

    /// Fetch one page into the buffer, unless another fetch made it unneeded
    async fn fetch(&self, epoch: u64, mode: FetchMode) -> Result<()> {
        let mut slot = self.cursor.lock().await;
        if !self.still_needed(epoch, mode) {
            trace!(epoch, ?mode, "fetch no longer needed");
            return Ok(());
        }

        if slot.epoch != epoch {
            let stale = slot.cursor.take();
            *slot = CursorSlot {
                epoch,
                cursor: None,
                opened: false,
            };
            if let Some(cursor) = stale {
                self.release(cursor).await;
            }
        }

        let ttl = self.config.ttl();
        let request = match (slot.opened, slot.cursor.clone()) {
            (false, _) => PageRequest::Open {
                query: Arc::clone(&self.query),
                page_size: self.config.page_size,
                ttl,
            },
            (true, Some(cursor)) => PageRequest::Continue { cursor, ttl },
            (true, None) => {
                self.state.lock().finished = true;
                return Ok(());
            }
        };

        let client = self.connection.client()?;
        let page = client.paginate(request).await?;
        slot.opened = true;
        slot.cursor.clone_from(&page.cursor);

        let mut state = self.state.lock();
        if state.epoch != epoch {
            debug!(
                epoch,
                current = state.epoch,
                records = page.records.len(),
                "discarding page from before reset"
            );
            return Ok(());
        }
        if page.total_hits.is_some() {
            state.total_hits = page.total_hits;
        }
        let mut records = page.records;
        if records.is_empty() || page.cursor.is_none() {
            state.finished = true;
        }
        if let Some(total) = state.total_hits {
            let room = total.saturating_sub(state.position + state.buffer.len() as u64);
            if records.len() as u64 > room {
                warn!(
                    index = %self.query.index,
                    total_hits = total,
                    received = records.len(),
                    kept = room,
                    "store returned more records than it reported, truncating"
                );
                records.truncate(usize::try_from(room).unwrap_or(usize::MAX));
            }
        }
        debug!(
            epoch,
            records = records.len(),
            total_hits = ?state.total_hits,
            position = state.position,
            "fetched page"
        );
        state.buffer.extend(records);
        Ok(())
    }

    async fn release(&self, cursor: Cursor) {
        let client = match self.connection.client() {
            Ok(client) => client,
            Err(e) => {
                debug!(error = %e, "cannot release cursor");
                return;
            }
        };
        if let Err(e) = client.release_cursor(cursor).await {
            warn!(error = %e, "failed to release cursor");
        }
    }
}

/// Iterator of decoded records from one remote query
///
/// All methods take `&self`; a fetcher may be shared between tasks through
/// an `Arc`, and the fetch lock keeps concurrent callers from fetching the
/// same page twice.
pub struct PagedFetcher<S: DocumentStore, T> {
    shared: Arc<ScanShared<S>>,
    decoder: Decoder<T>,
}

impl<S: DocumentStore, T> PagedFetcher<S, T> {
    /// # Errors
    /// `Error::Config` if `config` does not validate.
    pub fn new(
        connection: Arc<Connection<S>>,
        query: Query,
        config: FetchConfig,
        decoder: Decoder<T>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(ScanShared {
                connection,
                query: Arc::new(query),
                config,
                state: Mutex::new(ScanState::default()),
                cursor: tokio::sync::Mutex::new(CursorSlot::default()),
            }),
            decoder,
        })
    }

    /// Whether `next()` will yield a record. Fetches if the buffer is empty.
    ///
    /// # Errors
    /// Propagates the store error of a failed fetch.
    pub async fn has_next(&self) -> Result<bool> {
        loop {
            let epoch = {
                let state = self.shared.state.lock();
                if !state.buffer.is_empty() {
                    return Ok(true);
                }
                if !state.has_more_requests() {
                    return Ok(false);
                }
                state.epoch
            };
            self.shared.fetch(epoch, FetchMode::Refill).await?;
        }
    }

    /// Take the next record
    ///
    /// A record that fails to decode still counts as consumed.
    ///
    /// # Errors
    /// `Error::Exhausted` past the end, `Error::Decode`, or a store error.
    pub async fn next(&self) -> Result<T> {
        loop {
            if !self.has_next().await? {
                return Err(Error::Exhausted);
            }
            let popped = {
                let mut state = self.shared.state.lock();
                let record = state.buffer.pop_front();
                if record.is_some() {
                    state.position += 1;
                }
                record
            };
            if let Some(record) = popped {
                self.schedule_prefetch();
                return (self.decoder)(record).map_err(Error::from);
            }
        }
    }

    /// Drain the whole buffer as one batch, fetching first if it is empty
    ///
    /// Records that fail to decode are logged and skipped.
    ///
    /// # Errors
    /// Propagates the store error of a failed fetch.
    pub async fn pop_buffer(&self) -> Result<Vec<T>> {
        if !self.has_next().await? {
            return Ok(Vec::new());
        }
        let records: Vec<RawRecord> = {
            let mut state = self.shared.state.lock();
            let records: Vec<RawRecord> = state.buffer.drain(..).collect();
            state.position += records.len() as u64;
            records
        };
        self.schedule_prefetch();
        Ok(records
            .into_iter()
            .filter_map(|record| match (self.decoder)(record) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(id = %e.id, reason = %e.reason, "skipping undecodable record");
                    None
                }
            })
            .collect())
    }

    /// Start over: forget cursor, buffer, position and total
    ///
    /// A fetch still running keeps going but its page is discarded.
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        let epoch = state.epoch + 1;
        *state = ScanState {
            epoch,
            ..ScanState::default()
        };
        debug!(epoch, index = %self.shared.query.index, "scan reset");
    }

    /// Total matching records; fetches the first page if still unknown
    ///
    /// # Errors
    /// Propagates the store error of a failed fetch.
    pub async fn total_hits(&self) -> Result<u64> {
        loop {
            let epoch = {
                let state = self.shared.state.lock();
                if let Some(total) = state.total_hits {
                    return Ok(total);
                }
                if state.finished {
                    return Ok(state.position + state.buffer.len() as u64);
                }
                state.epoch
            };
            self.shared.fetch(epoch, FetchMode::Count).await?;
        }
    }

    /// Records not yet consumed
    ///
    /// # Errors
    /// Propagates the store error of a failed fetch.
    pub async fn size(&self) -> Result<u64> {
        let total = self.total_hits().await?;
        Ok(total.saturating_sub(self.position()))
    }

    #[must_use]
    pub fn has_more_requests(&self) -> bool {
        self.shared.state.lock().has_more_requests()
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.shared.state.lock().position
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    #[must_use]
    pub fn config(&self) -> &FetchConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn query(&self) -> &Query {
        &self.shared.query
    }

    /// Release the open remote cursor, if any, and end the scan
    pub async fn release(&self) {
        let mut slot = self.shared.cursor.lock().await;
        self.shared.state.lock().finished = true;
        if let Some(cursor) = slot.cursor.take() {
            self.shared.release(cursor).await;
        }
    }

    /// Top up the buffer in the background if it runs low
    fn schedule_prefetch(&self) {
        let epoch = {
            let mut state = self.shared.state.lock();
            if state.prefetching
                || state.buffer.len() >= self.shared.config.prefetch_target()
                || !state.has_more_requests()
            {
                return;
            }
            state.prefetching = true;
            state.epoch
        };
        trace!(epoch, "scheduling prefetch");
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Err(e) = shared.fetch(epoch, FetchMode::Prefetch).await {
                warn!(error = %e, epoch, index = %shared.query.index, "background prefetch failed");
            }
            let mut state = shared.state.lock();
            if state.epoch == epoch {
                state.prefetching = false;
            }
        });
    }
}

impl<S, T> RecordSource for PagedFetcher<S, T>
where
    S: DocumentStore,
    T: Send,
{
    type Item = T;

    fn has_next(&mut self) -> impl std::future::Future<Output = Result<bool>> + Send {
        PagedFetcher::has_next(self)
    }

    fn next(&mut self) -> impl std::future::Future<Output = Result<T>> + Send {
        PagedFetcher::next(self)
    }
}
