//! Client-side session lifecycle with single-flight token refresh
//!
//! This library manages the session a client application holds with an
//! identity provider: a short-lived access token presented on every request,
//! and a longer-lived refresh token used only to mint new access tokens.
//!
//! The hard part of holding such a session is what happens when the access
//! token expires while many requests are in flight. Each of those requests
//! fails for the same reason, and each would naively attempt its own refresh.
//! Here, the [`RefreshCoordinator`][coordinator::RefreshCoordinator] makes sure
//! that exactly one refresh is performed per expiry, that every request that
//! failed in the meantime waits for that refresh, and that waiting requests are
//! released, in the order they failed, with the fresh token to replay with.
//!
//! Applications are often run as several instances sharing one persisted
//! session, such as several windows or workers on the same machine. When one of
//! them signs out, the others must follow. The [`SessionManager`] announces its
//! sign-outs on a [`CrossInstanceBus`][bus::CrossInstanceBus] and drops its
//! own session whenever another instance announces one.
//!
//! # General Flow
//!
//! At startup, construct the session manager from an identity provider, a
//! session store, and the bus shared by every instance. Then restore any
//! persisted session in the background so that startup is never blocked on the
//! identity provider.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use latch::{
//!     bus::CrossInstanceBus,
//!     provider::{HttpIdentityProvider, IdentityProvider},
//!     store::FileSessionStore,
//!     Credentials, Landing, SessionConfig, SessionManager,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = Arc::new(HttpIdentityProvider::new(
//!     reqwest::Client::new(),
//!     reqwest::Url::parse("https://id.example.com/")?,
//! ));
//! let store = FileSessionStore::new("session.json".into());
//! let bus = CrossInstanceBus::new();
//!
//! let manager = SessionManager::new(
//!     SessionConfig::default(),
//!     provider.clone(),
//!     Arc::new(store),
//!     &bus,
//! );
//! let _bootstrap = manager.spawn_bootstrap();
//!
//! let landing = manager
//!     .sign_in(&Credentials::new("someone@example.com", "hunter2"))
//!     .await?;
//! assert_eq!(landing, Landing::Authenticated);
//!
//! // Calls made through the coordinator recover from an expired token
//! let user = manager
//!     .coordinator()
//!     .authorized(|token| {
//!         let provider = provider.clone();
//!         async move { provider.current_user(&token).await }
//!     })
//!     .await?;
//!
//! tracing::info!(email = %user.email, "signed in");
//! # Ok(()) }
//! ```
//!
//! Requests made with `reqwest` can be authorized and recovered transparently
//! by the middleware in the `latch_reqwest` crate.
//!
//! # Features
//!
//! The following features are supported by this crate:
//!
//! * `http` (default): Provides an [`IdentityProvider`][provider::IdentityProvider]
//!   that speaks JSON over HTTP using [reqwest].
//! * `file` (default): Provides a [`SessionStore`][store::SessionStore] backed by a
//!   file on the local filesystem.
//! * `test-util`: Provides an in-memory, scriptable identity provider for tests.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod bus;
mod config;
pub mod coordinator;
mod error;
mod manager;
pub mod provider;
mod session;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
mod token;

pub use braids::*;
pub use config::{LandingPaths, SessionConfig, StoreKeys};
pub use error::{AuthError, StoreError};
pub use manager::SessionManager;
pub use session::{AuthState, Credentials, Landing, Session, User};
pub use token::TokenHandle;
