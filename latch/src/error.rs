//! Session errors

use std::{error, io, sync::Arc};

use thiserror::Error;

/// An error raised by the session layer
///
/// Errors are cheap to clone so that a single refresh failure can be
/// delivered to every request that was waiting on it.
#[derive(Clone, Debug, Error)]
pub enum AuthError {
    /// The identity provider refused the submitted credentials
    #[error("credentials rejected by the identity provider: {message}")]
    CredentialsRejected {
        /// The reason given by the identity provider
        message: String,
    },
    /// The access token presented with a request has expired
    #[error("access token has expired")]
    TokenExpired,
    /// The session could not be refreshed and the user must sign in again
    #[error("authentication required: session could not be refreshed")]
    RefreshFailed,
    /// There is no active session to authorize a request with
    #[error("authentication required: no active session")]
    SignedOut,
    /// The identity provider returned an error that is not session related
    #[error("identity provider rejected the request with status {status}")]
    Rejected {
        /// The HTTP status code of the response
        status: u16,
        /// The machine-readable error code, if any
        code: Option<String>,
        /// The human-readable error message, if any
        message: Option<String>,
    },
    /// The identity provider could not be reached or its response could not be read
    #[error("unable to communicate with the identity provider")]
    Transport(#[source] Arc<dyn error::Error + Send + Sync + 'static>),
    /// The session store failed
    #[error("session store failure")]
    Store(#[source] Arc<StoreError>),
}

impl AuthError {
    /// Wraps a transport-level error
    pub fn transport<E>(error: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        Self::Transport(Arc::new(error))
    }

    /// Whether this error requires the user to sign in again
    pub fn requires_sign_in(&self) -> bool {
        matches!(self, Self::RefreshFailed | Self::SignedOut)
    }
}

impl From<StoreError> for AuthError {
    fn from(error: StoreError) -> Self {
        Self::Store(Arc::new(error))
    }
}

/// An error reading or writing persisted session state
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failed
    #[error("error accessing session storage")]
    Io(#[from] io::Error),
    /// Persisted state could not be encoded or decoded
    #[error("error encoding session storage")]
    Serialization(#[from] serde_json::Error),
}
