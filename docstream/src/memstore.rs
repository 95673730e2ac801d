//! In-memory implementation of DocumentStore
//!
//! Holds documents per index in insertion order. Pagination works on a
//! snapshot taken when the cursor is opened, so concurrent writes never
//! shift an open scroll.
//!
//! Besides storage it can misbehave on request: scripted failures per
//! operation, a fixed latency, and a concurrency limit above which single
//! updates are answered with `StoreError::Throttled`. It also records what
//! it was asked, for assertions in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::remote::{
    Changes, Cursor, DocumentStore, ItemOutcome, ItemStatus, Page, PageRequest, Query, RawRecord,
    StoreError, UpdateOp,
};

/// Remote operation, used to target injected failures and counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Paginate,
    Update,
    BulkUpdate,
}

#[derive(Debug, Default)]
struct Index {
    order: Vec<String>,
    docs: HashMap<String, Value>,
}

#[derive(Debug)]
struct Scroll {
    remaining: VecDeque<RawRecord>,
    page_size: usize,
}

#[derive(Debug, Default)]
struct Journal {
    pages: Vec<Vec<String>>,
    bulk_batches: Vec<Vec<String>>,
    released: Vec<Cursor>,
    calls: HashMap<Operation, usize>,
}

/// In-memory document store
#[derive(Debug)]
pub struct MemStore {
    indices: Mutex<HashMap<String, Index>>,
    scrolls: Mutex<HashMap<String, Scroll>>,
    faults: Mutex<HashMap<Operation, VecDeque<StoreError>>>,
    /// Failures returned by every call once the scripted ones are used up
    outages: Mutex<HashMap<Operation, StoreError>>,
    journal: Mutex<Journal>,
    latency: Mutex<Option<Duration>>,
    throttle_above: Mutex<Option<usize>>,
    next_scroll: AtomicUsize,
    active_updates: AtomicUsize,
    peak_updates: AtomicUsize,
    running: AtomicBool,
    shutdowns: AtomicUsize,
}

impl MemStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            indices: Mutex::new(HashMap::new()),
            scrolls: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            outages: Mutex::new(HashMap::new()),
            journal: Mutex::new(Journal::default()),
            latency: Mutex::new(None),
            throttle_above: Mutex::new(None),
            next_scroll: AtomicUsize::new(0),
            active_updates: AtomicUsize::new(0),
            peak_updates: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            shutdowns: AtomicUsize::new(0),
        }
    }

    /// Create a store with `records` in `index`; the index exists even when
    /// `records` is empty
    #[must_use]
    pub fn with_records<I>(index: &str, records: I) -> Self
    where
        I: IntoIterator<Item = RawRecord>,
    {
        let store = Self::new();
        store.indices.lock().entry(index.to_string()).or_default();
        for record in records {
            store.insert(index, record.id, record.source);
        }
        store
    }

    /// Insert or replace a document
    pub fn insert(&self, index: &str, id: impl Into<String>, source: Value) {
        let id = id.into();
        let mut indices = self.indices.lock();
        let index = indices.entry(index.to_string()).or_default();
        if index.docs.insert(id.clone(), source).is_none() {
            index.order.push(id);
        }
    }

    #[must_use]
    pub fn get(&self, index: &str, id: &str) -> Option<Value> {
        self.indices
            .lock()
            .get(index)
            .and_then(|index| index.docs.get(id).cloned())
    }

    #[must_use]
    pub fn len(&self, index: &str) -> usize {
        self.indices.lock().get(index).map_or(0, |index| index.order.len())
    }

    #[must_use]
    pub fn is_empty(&self, index: &str) -> bool {
        self.len(index) == 0
    }

    /// Make the next call of `op` fail with `error`. Calls queue up.
    pub fn fail_next(&self, op: Operation, error: StoreError) {
        self.faults.lock().entry(op).or_default().push_back(error);
    }

    /// Make every later call of `op` fail with `error`
    pub fn fail_always(&self, op: Operation, error: StoreError) {
        self.outages.lock().insert(op, error);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Answer single updates with `Throttled` while more than `limit` run at once
    pub fn set_throttle_above(&self, limit: usize) {
        *self.throttle_above.lock() = Some(limit);
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Record ids returned by each pagination call, in call order
    #[must_use]
    pub fn page_log(&self) -> Vec<Vec<String>> {
        self.journal.lock().pages.clone()
    }

    /// Ids sent with each bulk call, including calls that failed
    #[must_use]
    pub fn bulk_log(&self) -> Vec<Vec<String>> {
        self.journal.lock().bulk_batches.clone()
    }

    #[must_use]
    pub fn released_cursors(&self) -> Vec<Cursor> {
        self.journal.lock().released.clone()
    }

    #[must_use]
    pub fn calls(&self, op: Operation) -> usize {
        self.journal.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Highest number of single updates observed running at once
    #[must_use]
    pub fn peak_concurrent_updates(&self) -> usize {
        self.peak_updates.load(Ordering::SeqCst)
    }

    /// Number of scroll snapshots still held
    #[must_use]
    pub fn open_scrolls(&self) -> usize {
        self.scrolls.lock().len()
    }

    #[must_use]
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Count the call, wait out the latency and pop a scripted failure
    async fn enter(&self, op: Operation) -> Result<(), StoreError> {
        *self.journal.lock().calls.entry(op).or_default() += 1;
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.running.load(Ordering::SeqCst) {
            return Err(StoreError::Shutdown);
        }
        let fault = self
            .faults
            .lock()
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.outages.lock().get(&op).cloned());
        fault.map_or(Ok(()), Err)
    }

    fn open_scroll(&self, query: &Query, page_size: usize) -> Result<Page, StoreError> {
        let matching: VecDeque<RawRecord> = {
            let indices = self.indices.lock();
            let Some(index) = indices.get(&query.index) else {
                return Err(StoreError::Rejected(format!("no such index: {}", query.index)));
            };
            let mut matching = VecDeque::new();
            for id in &index.order {
                let Some(source) = index.docs.get(id) else {
                    continue;
                };
                if matches_filter(source, query.filter.as_ref())? {
                    matching.push_back(RawRecord::new(id.clone(), project(source, query.fields.as_deref())));
                }
            }
            matching
        };

        let total = matching.len() as u64;
        let token = format!("scroll-{}", self.next_scroll.fetch_add(1, Ordering::SeqCst));
        let mut page = self.page_from(
            &token,
            Scroll {
                remaining: matching,
                page_size: page_size.max(1),
            },
        );
        page.total_hits = Some(total);
        Ok(page)
    }

    fn continue_scroll(&self, cursor: &Cursor) -> Result<Page, StoreError> {
        let scroll = self
            .scrolls
            .lock()
            .remove(cursor.as_str())
            .ok_or_else(|| StoreError::Rejected(format!("unknown cursor: {cursor}")))?;
        Ok(self.page_from(cursor.as_str(), scroll))
    }

    /// Cut the next page off a scroll and park the rest under `token`
    fn page_from(&self, token: &str, mut scroll: Scroll) -> Page {
        let take = scroll.page_size.min(scroll.remaining.len());
        let records: Vec<RawRecord> = scroll.remaining.drain(..take).collect();
        let cursor = if scroll.remaining.is_empty() {
            None
        } else {
            self.scrolls.lock().insert(token.to_string(), scroll);
            Some(Cursor::new(token))
        };
        self.journal
            .lock()
            .pages
            .push(records.iter().map(|r| r.id.clone()).collect());
        Page {
            records,
            cursor,
            total_hits: None,
        }
    }

    /// Merge changes into a stored document
    fn apply(&self, op: &UpdateOp) -> Result<ItemStatus, String> {
        let mut indices = self.indices.lock();
        let doc = indices
            .get_mut(&op.index)
            .and_then(|index| index.docs.get_mut(&op.id))
            .ok_or_else(|| format!("document {} not found in {}", op.id, op.index))?;
        let Value::Object(fields) = doc else {
            return Err(format!("document {} is not an object", op.id));
        };
        Ok(merge(fields, &op.changes))
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

fn merge(fields: &mut Map<String, Value>, changes: &Changes) -> ItemStatus {
    let mut status = ItemStatus::Noop;
    for (key, value) in changes {
        if fields.get(key) != Some(value) {
            fields.insert(key.clone(), value.clone());
            status = ItemStatus::Updated;
        }
    }
    status
}

/// A filter is an object of field-equality constraints
fn matches_filter(source: &Value, filter: Option<&Value>) -> Result<bool, StoreError> {
    match filter {
        None => Ok(true),
        Some(Value::Object(constraints)) => Ok(constraints
            .iter()
            .all(|(key, expected)| source.get(key) == Some(expected))),
        Some(other) => Err(StoreError::Rejected(format!("unsupported filter: {other}"))),
    }
}

fn project(source: &Value, fields: Option<&[String]>) -> Value {
    match (fields, source) {
        (Some(fields), Value::Object(map)) => Value::Object(
            map.iter()
                .filter(|(key, _)| fields.iter().any(|f| f == *key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        _ => source.clone(),
    }
}

/// Tracks one running single update
struct ActiveUpdate<'a> {
    store: &'a MemStore,
}

impl<'a> ActiveUpdate<'a> {
    fn enter(store: &'a MemStore) -> (Self, usize) {
        let active = store.active_updates.fetch_add(1, Ordering::SeqCst) + 1;
        store.peak_updates.fetch_max(active, Ordering::SeqCst);
        (Self { store }, active)
    }
}

impl Drop for ActiveUpdate<'_> {
    fn drop(&mut self) {
        self.store.active_updates.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DocumentStore for MemStore {
    async fn paginate(&self, request: PageRequest) -> Result<Page, StoreError> {
        self.enter(Operation::Paginate).await?;
        match request {
            PageRequest::Open {
                query, page_size, ..
            } => self.open_scroll(&query, page_size),
            PageRequest::Continue { cursor, .. } => self.continue_scroll(&cursor),
        }
    }

    async fn release_cursor(&self, cursor: Cursor) -> Result<(), StoreError> {
        self.scrolls.lock().remove(cursor.as_str());
        self.journal.lock().released.push(cursor);
        Ok(())
    }

    async fn update(&self, op: UpdateOp) -> Result<ItemStatus, StoreError> {
        let (_active, active) = ActiveUpdate::enter(self);
        self.enter(Operation::Update).await?;
        let limit = *self.throttle_above.lock();
        if limit.is_some_and(|limit| active > limit) {
            return Err(StoreError::Throttled(format!("{active} concurrent updates")));
        }
        self.apply(&op).map_err(StoreError::Rejected)
    }

    async fn bulk_update(&self, batch: Vec<UpdateOp>) -> Result<Vec<ItemOutcome>, StoreError> {
        self.journal
            .lock()
            .bulk_batches
            .push(batch.iter().map(|op| op.id.clone()).collect());
        self.enter(Operation::BulkUpdate).await?;
        Ok(batch
            .iter()
            .map(|op| match self.apply(op) {
                Ok(status) => ItemOutcome::ok(op.id.clone(), status),
                Err(reason) => ItemOutcome::failed(op.id.clone(), reason),
            })
            .collect())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}
