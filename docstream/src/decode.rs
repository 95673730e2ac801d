//! Record decoders
//!
//! A [`Decoder`] turns a [`RawRecord`] into the caller's item type. It is
//! bound to a fetcher at construction time.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::remote::RawRecord;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot decode record {id}: {reason}")]
pub struct DecodeError {
    pub id: String,
    pub reason: String,
}

impl DecodeError {
    pub fn new(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

pub type Decoder<T> = Arc<dyn Fn(RawRecord) -> Result<T, DecodeError> + Send + Sync>;

/// Pass records through unchanged
#[must_use]
pub fn raw() -> Decoder<RawRecord> {
    Arc::new(|record: RawRecord| Ok(record))
}

/// Serialize the record source back to a JSON string
#[must_use]
pub fn source_string() -> Decoder<String> {
    Arc::new(|record: RawRecord| {
        serde_json::to_string(&record.source).map_err(|e| DecodeError::new(record.id, e.to_string()))
    })
}

/// Take only the record source
#[must_use]
pub fn json() -> Decoder<Value> {
    Arc::new(|record: RawRecord| Ok(record.source))
}

/// Deserialize the record source into `T`
#[must_use]
pub fn typed<T>() -> Decoder<T>
where
    T: DeserializeOwned + 'static,
{
    Arc::new(|record: RawRecord| {
        serde_json::from_value(record.source).map_err(|e| DecodeError::new(record.id, e.to_string()))
    })
}

/// Wrap an arbitrary function
pub fn with<T, F>(f: F) -> Decoder<T>
where
    F: Fn(RawRecord) -> Result<T, DecodeError> + Send + Sync + 'static,
{
    Arc::new(f)
}
