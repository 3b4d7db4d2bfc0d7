//! Session persistence
//!
//! A session occupies two independently named entries in a store shared by
//! every instance of the application, one for each token. Both entries are
//! written with the same expiry and cleared together.

use std::collections::BTreeMap;

use aliri_clock::{DurationSecs, UnixTime};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{config::StoreKeys, AccessToken, RefreshToken, Session, StoreError};

#[cfg(feature = "file")]
pub mod file;
pub mod memory;

#[cfg(feature = "file")]
pub use file::FileSessionStore;
pub use memory::InMemorySessionStore;

/// Durable storage for the session tokens
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Reads the persisted session, if a complete, unexpired one exists
    async fn read(&self) -> Result<Option<Session>, StoreError>;

    /// Persists a session, replacing any existing one
    ///
    /// Both entries expire once `ttl` has elapsed.
    async fn write(&self, session: &Session, ttl: DurationSecs) -> Result<(), StoreError>;

    /// Removes any persisted session
    async fn clear(&self) -> Result<(), StoreError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct StoredEntry {
    value: String,
    expires: UnixTime,
}

/// The named entries held by a store, keyed by entry name
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct Entries(BTreeMap<String, StoredEntry>);

impl Entries {
    fn live(&self, key: &str, now: UnixTime) -> Option<&str> {
        self.0
            .get(key)
            .filter(|e| e.expires > now)
            .map(|e| e.value.as_str())
    }

    pub(crate) fn session(&self, keys: &StoreKeys, now: UnixTime) -> Option<Session> {
        match (
            self.live(&keys.access_token, now),
            self.live(&keys.refresh_token, now),
        ) {
            (Some(access), Some(refresh)) => Some(Session::new(
                AccessToken::from(access),
                RefreshToken::from(refresh),
            )),
            (None, None) => None,
            _ => {
                tracing::debug!("ignoring incomplete persisted session");
                None
            }
        }
    }

    pub(crate) fn put(&mut self, keys: &StoreKeys, session: &Session, expires: UnixTime) {
        self.0.insert(
            keys.access_token.clone(),
            StoredEntry {
                value: session.access_token.as_str().to_owned(),
                expires,
            },
        );
        self.0.insert(
            keys.refresh_token.clone(),
            StoredEntry {
                value: session.refresh_token.as_str().to_owned(),
                expires,
            },
        );
    }

    pub(crate) fn remove(&mut self, keys: &StoreKeys) {
        self.0.remove(&keys.access_token);
        self.0.remove(&keys.refresh_token);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
