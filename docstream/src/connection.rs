//! Shared store connection
//!
//! One [`Connection`] is built in the composition root and handed to every
//! component as `Arc<Connection<S>>`. The client is created on first use and
//! recreated whenever the current one reports that it stopped running.
//! Shutdown happens once, explicitly or when the last owner drops it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::remote::{DocumentStore, StoreError};

type Connect<S> = Box<dyn Fn() -> Result<Arc<S>, StoreError> + Send + Sync>;

pub struct Connection<S: DocumentStore> {
    connect: Connect<S>,
    client: Mutex<Option<Arc<S>>>,
    shut_down: AtomicBool,
    connects: AtomicUsize,
}

impl<S: DocumentStore> Connection<S> {
    /// Create a lazy connection; `connect` runs on first use and on reconnect
    pub fn new<F>(connect: F) -> Self
    where
        F: Fn() -> Result<Arc<S>, StoreError> + Send + Sync + 'static,
    {
        Self {
            connect: Box::new(connect),
            client: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        }
    }

    /// Wrap an existing client. Reconnecting hands out the same client again.
    #[must_use]
    pub fn from_store(store: Arc<S>) -> Self {
        let client = Arc::clone(&store);
        let connection = Self::new(move || Ok(Arc::clone(&store)));
        *connection.client.lock() = Some(client);
        connection.connects.store(1, Ordering::SeqCst);
        connection
    }

    /// Get the current client, connecting if needed
    ///
    /// # Errors
    /// `StoreError::Shutdown` after [`Self::shutdown`]; otherwise whatever
    /// the connect function returns.
    pub fn client(&self) -> Result<Arc<S>, StoreError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(StoreError::Shutdown);
        }
        let mut slot = self.client.lock();
        if let Some(client) = slot.as_ref() {
            if client.is_running() {
                return Ok(Arc::clone(client));
            }
            debug!("client stopped running, reconnecting");
        }
        let client = (self.connect)()?;
        let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        info!(connects = n, "connected to document store");
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Close the client. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(client) = self.client.lock().take() {
            client.shutdown();
            info!("document store connection shut down");
        }
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Number of clients created so far
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl<S: DocumentStore> Drop for Connection<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::MemStore;

    #[test]
    fn test_connects_lazily_once() {
        let connection = Connection::new(|| Ok(Arc::new(MemStore::new())));
        assert_eq!(connection.connect_count(), 0);
        let a = connection.client().unwrap();
        let b = connection.client().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connection.connect_count(), 1);
    }

    #[test]
    fn test_reconnects_when_not_running() {
        let connection = Connection::new(|| Ok(Arc::new(MemStore::new())));
        let first = connection.client().unwrap();
        first.set_running(false);
        let second = connection.client().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(connection.connect_count(), 2);
    }

    #[test]
    fn test_shutdown_runs_once() {
        let store = Arc::new(MemStore::new());
        let connection = Connection::from_store(Arc::clone(&store));
        connection.shutdown();
        connection.shutdown();
        drop(connection);
        assert_eq!(store.shutdown_count(), 1);
    }

    #[test]
    fn test_drop_shuts_down() {
        let store = Arc::new(MemStore::new());
        drop(Connection::from_store(Arc::clone(&store)));
        assert_eq!(store.shutdown_count(), 1);
        assert!(!store.is_running());
    }

    #[test]
    fn test_client_after_shutdown_fails() {
        let connection = Connection::from_store(Arc::new(MemStore::new()));
        connection.shutdown();
        assert!(matches!(connection.client(), Err(StoreError::Shutdown)));
    }
}
