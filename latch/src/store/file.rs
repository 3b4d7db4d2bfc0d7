//! A session store backed by a local file

use std::{io, path::PathBuf};

use aliri_clock::{Clock, DurationSecs, System};
use async_trait::async_trait;
use tokio::fs::OpenOptions;

use super::{Entries, SessionStore};
use crate::{config::StoreKeys, Session, StoreError};

/// A session store that persists entries as JSON in a local file
///
/// Every process pointed at the same path shares the same session. Entries
/// not belonging to the session are preserved across writes.
#[derive(Debug)]
pub struct FileSessionStore<C = System> {
    path: PathBuf,
    keys: StoreKeys,
    clock: C,
}

impl FileSessionStore<System> {
    /// Constructs a new file session store
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            keys: StoreKeys::default(),
            clock: System,
        }
    }
}

impl<C> FileSessionStore<C> {
    /// Sets the names of the persisted entries
    pub fn with_keys(mut self, keys: StoreKeys) -> Self {
        self.keys = keys;
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> FileSessionStore<D> {
        FileSessionStore {
            path: self.path,
            keys: self.keys,
            clock,
        }
    }

    async fn read_entries(&self) -> Result<Entries, StoreError> {
        use tokio::io::AsyncReadExt;

        let mut file = match OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(Entries::default())
            }
            Err(error) => return Err(error.into()),
        };

        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        if data.trim().is_empty() {
            return Ok(Entries::default());
        }

        Ok(serde_json::from_str(&data)?)
    }

    async fn write_entries(&self, entries: &Entries) -> Result<(), StoreError> {
        use tokio::io::AsyncWriteExt;

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&self.path).await?;
        let data = serde_json::to_string_pretty(entries)?;
        file.write_all(data.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> SessionStore for FileSessionStore<C> {
    async fn read(&self) -> Result<Option<Session>, StoreError> {
        let entries = self.read_entries().await?;
        Ok(entries.session(&self.keys, self.clock.now()))
    }

    async fn write(&self, session: &Session, ttl: DurationSecs) -> Result<(), StoreError> {
        let mut entries = self.read_entries().await?;
        let expires = self.clock.now() + ttl;
        entries.put(&self.keys, session, expires);
        self.write_entries(&entries).await?;
        tracing::trace!(path = %self.path.display(), expires = expires.0, "persisted session to file");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut entries = self.read_entries().await?;
        entries.remove(&self.keys);

        if entries.is_empty() {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        } else {
            self.write_entries(&entries).await?;
        }

        tracing::trace!(path = %self.path.display(), "cleared session file");
        Ok(())
    }
}
