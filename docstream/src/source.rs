//! Async pull iterators
//!
//! [`RecordSource`] is the contract shared by [`crate::PagedFetcher`],
//! [`crate::Tap`] and [`IterSource`]: ask `has_next`, then take `next`.
//! `has_next() == Ok(false)` is the only "ordinary end" signal.

use std::future::Future;

use crate::error::{Error, Result};

pub trait RecordSource: Send {
    type Item: Send;

    /// Whether `next` will yield an item. May perform I/O.
    fn has_next(&mut self) -> impl Future<Output = Result<bool>> + Send;

    /// Take the next item; `Error::Exhausted` past the end
    fn next(&mut self) -> impl Future<Output = Result<Self::Item>> + Send;

    /// Pull every remaining item
    fn collect_all(&mut self) -> impl Future<Output = Result<Vec<Self::Item>>> + Send
    where
        Self: Sized,
    {
        async move {
            let mut items = Vec::new();
            while self.has_next().await? {
                items.push(self.next().await?);
            }
            Ok(items)
        }
    }
}

/// Adapter turning any in-memory iterator into a [`RecordSource`]
pub struct IterSource<I: Iterator> {
    iter: I,
    peeked: Option<I::Item>,
}

impl<I: Iterator> IterSource<I> {
    pub fn new<T>(items: T) -> Self
    where
        T: IntoIterator<IntoIter = I>,
    {
        Self {
            iter: items.into_iter(),
            peeked: None,
        }
    }

    fn fill(&mut self) -> bool {
        if self.peeked.is_none() {
            self.peeked = self.iter.next();
        }
        self.peeked.is_some()
    }
}

impl<I> RecordSource for IterSource<I>
where
    I: Iterator + Send,
    I::Item: Send,
{
    type Item = I::Item;

    fn has_next(&mut self) -> impl Future<Output = Result<bool>> + Send {
        std::future::ready(Ok(self.fill()))
    }

    fn next(&mut self) -> impl Future<Output = Result<Self::Item>> + Send {
        self.fill();
        std::future::ready(self.peeked.take().ok_or(Error::Exhausted))
    }
}
