pub mod backoff;
pub mod config;
pub mod connection;
pub mod decode;
pub mod error;
pub mod fetcher;
pub mod memstore;
pub mod multiplex;
pub mod notification_queue;
pub mod remote;
pub mod source;
pub mod write;

// Re-export error types for convenience
pub use error::{Error, Result};

// Re-export remote store types for convenience
pub use remote::{
    Changes, Cursor, DocumentStore, ItemOutcome, ItemStatus, Page, PageRequest, Query, RawRecord,
    StoreError, UpdateOp,
};

// Re-export the in-memory store
pub use memstore::{MemStore, Operation};

// Re-export configuration
pub use config::{BulkQueueConfig, FetchConfig, StreamConfig, ThrottledQueueConfig};

pub use connection::Connection;
pub use decode::{DecodeError, Decoder};

// Re-export iterator types
pub use fetcher::PagedFetcher;
pub use multiplex::{Multiplexer, Tap};
pub use source::{IterSource, RecordSource};

// Re-export write queues
pub use write::{
    BulkWriteQueue, StatsSnapshot, ThrottledWriteQueue, UpdateQueue, WriteState, WriteStats,
};
