//! Crate-level error type

use std::time::Duration;

use crate::decode::DecodeError;
use crate::remote::StoreError;

/// Error type for fetcher, multiplexer and write queue operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no more records")]
    Exhausted,

    #[error("{requested} not in {valid}")]
    UnknownTap { requested: String, valid: String },

    #[error("duplicate tap name: {0}")]
    DuplicateTap(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("writes still pending after {timeout:?}: {pending}")]
    DrainTimeout { timeout: Duration, pending: u64 },

    #[error("close timed out after {timeout:?} with {pending} writes pending")]
    CloseTimeout { timeout: Duration, pending: u64 },

    #[error("{dropped} writes were dropped")]
    FlushFailed { dropped: u64 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
