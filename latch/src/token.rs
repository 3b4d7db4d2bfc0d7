use std::sync::Arc;

use tokio::sync::watch;

use crate::{AccessToken, AccessTokenRef};

/// The in-memory access token that outgoing requests are authorized with
///
/// Clones share the same token. The token is replaced whenever a new one is
/// issued and cleared synchronously on sign-out, so a request started after
/// sign-out never carries the old token.
#[derive(Clone, Debug)]
pub struct TokenHandle {
    tx: Arc<watch::Sender<Option<AccessToken>>>,
}

impl Default for TokenHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenHandle {
    /// Constructs a handle holding no token
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(None).0),
        }
    }

    /// The current access token, if any
    pub fn current(&self) -> Option<AccessToken> {
        self.tx.borrow().clone()
    }

    /// Whether the handle currently holds exactly `token`
    pub fn holds(&self, token: &AccessTokenRef) -> bool {
        self.tx.borrow().as_deref() == Some(token)
    }

    /// Observes changes to the current token
    pub fn subscribe(&self) -> watch::Receiver<Option<AccessToken>> {
        self.tx.subscribe()
    }

    pub(crate) fn set(&self, token: AccessToken) {
        self.tx.send_replace(Some(token));
    }

    /// Clears the token, returning whether one was held
    pub(crate) fn clear(&self) -> bool {
        self.tx.send_if_modified(|token| token.take().is_some())
    }
}
