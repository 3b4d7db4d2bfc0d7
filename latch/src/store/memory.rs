//! An in-process session store

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use aliri_clock::{Clock, DurationSecs, System};
use async_trait::async_trait;

use super::{Entries, SessionStore};
use crate::{config::StoreKeys, Session, StoreError};

/// A session store held in memory
///
/// Clones share the same entries, so every instance handed a clone observes
/// the same persisted session, as instances sharing an origin would.
#[derive(Clone, Debug)]
pub struct InMemorySessionStore<C = System> {
    entries: Arc<Mutex<Entries>>,
    keys: StoreKeys,
    clock: C,
}

impl InMemorySessionStore<System> {
    /// Constructs a new, empty store using the default entry names
    pub fn new() -> Self {
        Self {
            entries: Arc::default(),
            keys: StoreKeys::default(),
            clock: System,
        }
    }
}

impl Default for InMemorySessionStore<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> InMemorySessionStore<C> {
    /// Sets the names of the persisted entries
    pub fn with_keys(mut self, keys: StoreKeys) -> Self {
        self.keys = keys;
        self
    }

    /// Returns a view of the same entries that tells time using `clock`
    ///
    /// Useful for testing expiry
    pub fn with_clock<D>(self, clock: D) -> InMemorySessionStore<D> {
        InMemorySessionStore {
            entries: self.entries,
            keys: self.keys,
            clock,
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> SessionStore for InMemorySessionStore<C> {
    async fn read(&self) -> Result<Option<Session>, StoreError> {
        Ok(self.entries().session(&self.keys, self.clock.now()))
    }

    async fn write(&self, session: &Session, ttl: DurationSecs) -> Result<(), StoreError> {
        let expires = self.clock.now() + ttl;
        self.entries().put(&self.keys, session, expires);
        tracing::trace!(expires = expires.0, "persisted session in memory");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.entries().remove(&self.keys);
        Ok(())
    }
}
