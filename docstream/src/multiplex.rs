//! Fan-out of one record source to several independent consumers
//!
//! Each [`Tap`] sees every record of the parent exactly once, in parent
//! order, at its own pace. Records are pulled from the parent only when some
//! tap runs out of buffered items; the pulled record is cloned into the
//! buffers of all the other taps.
//!
//! One async mutex around `{parent, buffers}` serializes every pull and
//! every buffer change. It is held across the parent's await, so two taps
//! never advance the parent for the same record.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, Result};
use crate::source::RecordSource;

struct MuxState<S: RecordSource> {
    parent: S,
    buffers: Vec<VecDeque<S::Item>>,
}

struct MuxInner<S: RecordSource> {
    state: tokio::sync::Mutex<MuxState<S>>,
    names: Vec<String>,
    index: HashMap<String, usize>,
}

/// Splits one [`RecordSource`] into named taps
///
/// Taps are fixed at construction. A tap that is not drained accumulates
/// every record the other taps pull, without bound; keep the taps moving at
/// similar speeds or size the parent's result set accordingly.
pub struct Multiplexer<S: RecordSource> {
    inner: Arc<MuxInner<S>>,
}

impl<S> Multiplexer<S>
where
    S: RecordSource,
    S::Item: Clone,
{
    /// Create taps with the given names
    ///
    /// # Errors
    /// `Error::DuplicateTap` if a name repeats.
    pub fn new<I, N>(parent: S, names: I) -> Result<Self>
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            if index.insert(name.clone(), i).is_some() {
                return Err(Error::DuplicateTap(name.clone()));
            }
        }
        let buffers = names.iter().map(|_| VecDeque::new()).collect();
        Ok(Self {
            inner: Arc::new(MuxInner {
                state: tokio::sync::Mutex::new(MuxState { parent, buffers }),
                names,
                index,
            }),
        })
    }

    /// Create `count` taps named `"0"` to `"count-1"`
    pub fn with_count(parent: S, count: usize) -> Self {
        let names: Vec<String> = (0..count).map(|i| i.to_string()).collect();
        let index = names.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect();
        let buffers = (0..count).map(|_| VecDeque::new()).collect();
        Self {
            inner: Arc::new(MuxInner {
                state: tokio::sync::Mutex::new(MuxState { parent, buffers }),
                names,
                index,
            }),
        }
    }

    /// Handle of the tap called `name`
    ///
    /// # Errors
    /// `Error::UnknownTap` listing the valid names.
    pub fn tap(&self, name: &str) -> Result<Tap<S>> {
        match self.inner.index.get(name) {
            Some(&index) => Ok(Tap {
                inner: Arc::clone(&self.inner),
                index,
            }),
            None => Err(Error::UnknownTap {
                requested: name.to_string(),
                valid: self.inner.names.join(","),
            }),
        }
    }

    /// Handle of the tap named after `index`, as created by [`Self::with_count`]
    ///
    /// # Errors
    /// `Error::UnknownTap` listing the valid names.
    pub fn tap_at(&self, index: usize) -> Result<Tap<S>> {
        self.tap(&index.to_string())
    }

    /// Handles of all taps, in construction order
    #[must_use]
    pub fn taps(&self) -> Vec<Tap<S>> {
        (0..self.inner.names.len())
            .map(|index| Tap {
                inner: Arc::clone(&self.inner),
                index,
            })
            .collect()
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.inner.names
    }

    /// True when the parent is exhausted and no tap has records left
    ///
    /// # Errors
    /// Propagates an error from the parent's `has_next`.
    pub async fn is_empty(&self) -> Result<bool> {
        let mut state = self.inner.state.lock().await;
        if state.buffers.is_empty() {
            return Ok(true);
        }
        if state.buffers.iter().any(|buffer| !buffer.is_empty()) {
            return Ok(false);
        }
        Ok(!state.parent.has_next().await?)
    }
}

/// One output of a [`Multiplexer`]
pub struct Tap<S: RecordSource> {
    inner: Arc<MuxInner<S>>,
    index: usize,
}

impl<S: RecordSource> Clone for Tap<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            index: self.index,
        }
    }
}

impl<S> Tap<S>
where
    S: RecordSource,
    S::Item: Clone,
{
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.names[self.index]
    }

    /// # Errors
    /// Propagates an error from the parent's `has_next`.
    pub async fn has_next(&self) -> Result<bool> {
        let mut state = self.inner.state.lock().await;
        if !state.buffers[self.index].is_empty() {
            return Ok(true);
        }
        state.parent.has_next().await
    }

    /// Take this tap's next record, pulling from the parent if needed
    ///
    /// # Errors
    /// `Error::Exhausted` when the parent is done and this tap's buffer is
    /// empty; otherwise errors of the parent.
    pub async fn next(&self) -> Result<S::Item> {
        let mut state = self.inner.state.lock().await;
        if let Some(item) = state.buffers[self.index].pop_front() {
            return Ok(item);
        }
        if !state.parent.has_next().await? {
            return Err(Error::Exhausted);
        }
        let item = state.parent.next().await?;
        for (i, buffer) in state.buffers.iter_mut().enumerate() {
            if i != self.index {
                buffer.push_back(item.clone());
            }
        }
        trace!(tap = self.name(), "pulled record from parent");
        Ok(item)
    }

    /// Records pulled by other taps that this tap has not consumed yet
    pub async fn buffered(&self) -> usize {
        self.inner.state.lock().await.buffers[self.index].len()
    }
}

impl<S> RecordSource for Tap<S>
where
    S: RecordSource,
    S::Item: Clone,
{
    type Item = S::Item;

    fn has_next(&mut self) -> impl std::future::Future<Output = Result<bool>> + Send {
        Tap::has_next(self)
    }

    fn next(&mut self) -> impl std::future::Future<Output = Result<S::Item>> + Send {
        Tap::next(self)
    }
}
