//! Remote document store seam
//!
//! The store exposes two constrained capabilities: a cursor-based
//! pagination query and partial-update writes (single and bulk). Everything
//! else in the crate is built on top of the [`DocumentStore`] trait.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  PagedFetcher / Multiplexer         │
//! │  - prefetch buffer, fan-out taps    │
//! └─────────────────────────────────────┘
//!          │ paginate(PageRequest)
//!          ▼
//! ┌─────────────────────────────────────┐
//! │  DocumentStore (this module)        │
//! │  - paginate / release_cursor        │
//! │  - update / bulk_update             │
//! └─────────────────────────────────────┘
//!          ▲
//!          │ update / bulk_update
//! ┌─────────────────────────────────────┐
//! │  ThrottledWriteQueue / BulkWriteQueue│
//! └─────────────────────────────────────┘
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

/// Partial document changes: top-level field name to new value
pub type Changes = Map<String, Value>;

/// Errors reported by the remote store
///
/// `Clone` so that test stores can script the same failure more than once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The call did not complete (connection closed, timeout, 5xx)
    #[error("transport failure: {0}")]
    Transport(String),

    /// Too many concurrent requests; back off and retry
    #[error("too many concurrent requests: {0}")]
    Throttled(String),

    /// The store understood the request and refused it
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The connection has been shut down by its owner
    #[error("connection is shut down")]
    Shutdown,
}

impl StoreError {
    /// Whether the error is the explicit rate-limit signal
    #[must_use]
    pub fn is_throttle(&self) -> bool {
        matches!(self, Self::Throttled(_))
    }

    /// Whether retrying the same call later can succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Throttled(_))
    }
}

/// Opaque continuation token of an open pagination query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A query against one index
///
/// The filter is built by the caller; this crate only carries it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub index: String,
    /// Opaque filter understood by the store, `None` matches everything
    pub filter: Option<Value>,
    /// Source projection, `None` returns whole documents
    pub fields: Option<Vec<String>>,
}

impl Query {
    /// Match every document of `index`
    #[must_use]
    pub fn all(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            filter: None,
            fields: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn with_fields<I, F>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// One pagination call
#[derive(Debug, Clone)]
pub enum PageRequest {
    /// First call: opens a cursor for `query`
    Open {
        query: Arc<Query>,
        page_size: usize,
        ttl: Duration,
    },
    /// Later calls: only the cursor and a refreshed time-to-live
    Continue { cursor: Cursor, ttl: Duration },
}

/// A raw document as returned by the store
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub id: String,
    pub source: Value,
}

impl RawRecord {
    #[must_use]
    pub fn new(id: impl Into<String>, source: Value) -> Self {
        Self {
            id: id.into(),
            source,
        }
    }
}

/// Result of one pagination call
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Continuation token, `None` when no further pages exist
    pub cursor: Option<Cursor>,
    /// Total matching documents; only reported by the opening call
    pub total_hits: Option<u64>,
}

/// A partial update of one document
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOp {
    pub index: String,
    pub id: String,
    pub changes: Changes,
}

impl UpdateOp {
    #[must_use]
    pub fn new(index: impl Into<String>, id: impl Into<String>, changes: Changes) -> Self {
        Self {
            index: index.into(),
            id: id.into(),
            changes,
        }
    }

    /// Approximate size of the serialized request line
    #[must_use]
    pub fn estimated_bytes(&self) -> usize {
        let body = serde_json::to_vec(&self.changes).map_or(0, |v| v.len());
        self.index.len() + self.id.len() + body
    }
}

/// Per-document result of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Updated,
    Noop,
    Failed,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Updated => write!(f, "UPDATED"),
            Self::Noop => write!(f, "NOOP"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Per-item entry of a bulk response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub id: String,
    pub status: ItemStatus,
    pub error: Option<String>,
}

impl ItemOutcome {
    #[must_use]
    pub fn ok(id: impl Into<String>, status: ItemStatus) -> Self {
        Self {
            id: id.into(),
            status,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ItemStatus::Failed,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == ItemStatus::Failed
    }
}

/// Trait for remote document store clients
///
/// Implementations must be cheap to share behind an `Arc`; all methods take
/// `&self` and may be called from many tasks at once.
pub trait DocumentStore: Send + Sync + 'static {
    /// Fetch one page of a pagination query.
    ///
    /// - `Open`: runs the query, opens a cursor and reports `total_hits`
    /// - `Continue`: returns the next page of an open cursor
    fn paginate(
        &self,
        request: PageRequest,
    ) -> impl Future<Output = Result<Page, StoreError>> + Send;

    /// Release server-side resources held by a cursor.
    ///
    /// Best effort. The default implementation does nothing.
    fn release_cursor(
        &self,
        cursor: Cursor,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let _ = cursor;
        std::future::ready(Ok(()))
    }

    /// Apply a partial update to a single document.
    fn update(&self, op: UpdateOp)
        -> impl Future<Output = Result<ItemStatus, StoreError>> + Send;

    /// Apply a batch of partial updates in one call.
    ///
    /// `Err` means the whole call failed and no item outcome is known.
    /// Per-item failures are reported as `ItemStatus::Failed` entries.
    fn bulk_update(
        &self,
        batch: Vec<UpdateOp>,
    ) -> impl Future<Output = Result<Vec<ItemOutcome>, StoreError>> + Send;

    /// Whether the client can still issue requests
    fn is_running(&self) -> bool {
        true
    }

    /// Close the client. Called once by the owning [`crate::Connection`].
    fn shutdown(&self) {}
}
