//! The session lifecycle of one application instance

use std::{
    error,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use async_trait::async_trait;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    bus::{AuthMessage, BusEndpoint, CrossInstanceBus, Subscription},
    coordinator::{OnRefreshFailure, RefreshCoordinator},
    provider::IdentityProvider,
    store::SessionStore,
    AuthError, AuthState, Credentials, Landing, SessionConfig, TokenHandle, User,
};

struct Inner {
    config: SessionConfig,
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn SessionStore>,
    token: TokenHandle,
    coordinator: RefreshCoordinator,
    state: watch::Sender<AuthState>,
    bus: BusEndpoint,
    subscription: Mutex<Option<Subscription>>,
}

impl Inner {
    /// Drops the in-memory session, returning whether there was one
    fn clear_local(&self) -> bool {
        let had_token = self.coordinator.end_session();
        let had_user = self.state.send_if_modified(|state| state.user.take().is_some());
        had_token || had_user
    }

    async fn sign_out(&self) -> Result<Landing, AuthError> {
        let transition = self.coordinator.transition().await;
        let was_signed_in = self.clear_local();
        let cleared = self.store.clear().await;
        drop(transition);

        if was_signed_in {
            let reached = self.bus.publish(AuthMessage::SignedOut);
            tracing::info!(
                channel = self.bus.channel(),
                reached,
                "signed out, notified other instances"
            );
        } else {
            tracing::debug!("already signed out");
        }

        cleared?;
        Ok(Landing::Unauthenticated)
    }

    fn on_message(&self, raw: &str) {
        match AuthMessage::from(raw) {
            AuthMessage::SignedOut => {
                if self.clear_local() {
                    tracing::info!("signed out by another instance");
                }
            }
            AuthMessage::Unrecognized(message) => {
                tracing::debug!(%message, "ignoring unrecognized bus message");
            }
        }
    }
}

struct ForcedSignOut(Weak<Inner>);

#[async_trait]
impl OnRefreshFailure for ForcedSignOut {
    async fn refresh_failed(&self) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };

        if let Err(error) = inner.sign_out().await {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "unable to clear persisted session after failed refresh"
            );
        }
    }
}

/// Owns the session of one application instance
///
/// The manager is the only writer of the instance's [`AuthState`]. It signs
/// in and out, restores a persisted session at startup, and keeps in step with
/// other instances by listening for sign-outs on the [`CrossInstanceBus`].
///
/// Clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &*self.inner.state.borrow())
            .field("coordinator", &self.inner.coordinator)
            .field("channel", &self.inner.bus.channel())
            .finish()
    }
}

impl SessionManager {
    /// Constructs a manager and subscribes it to the configured bus channel
    ///
    /// The manager starts signed out; call [`bootstrap`][Self::bootstrap] to
    /// restore a persisted session. Must be called from within a tokio
    /// runtime.
    pub fn new(
        config: SessionConfig,
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn SessionStore>,
        bus: &CrossInstanceBus,
    ) -> Self {
        let endpoint = bus.channel(config.channel());
        let token = TokenHandle::new();

        let inner = Arc::new_cyclic(|weak| {
            let coordinator = RefreshCoordinator::new(
                Arc::clone(&provider),
                Arc::clone(&store),
                token.clone(),
                config.session_ttl(),
                ForcedSignOut(weak.clone()),
            );

            Inner {
                config,
                provider,
                store,
                token,
                coordinator,
                state: watch::channel(AuthState::default()).0,
                bus: endpoint,
                subscription: Mutex::new(None),
            }
        });

        let weak = Arc::downgrade(&inner);
        let subscription = inner.bus.subscribe(move |raw| {
            if let Some(inner) = weak.upgrade() {
                inner.on_message(raw);
            }
        });
        *inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);

        tracing::debug!(channel = inner.bus.channel(), "session manager started");

        Self { inner }
    }

    /// Exchanges credentials for a new session
    ///
    /// On failure the current state is left untouched and the error is
    /// returned to the caller.
    #[tracing::instrument(err, skip(self, credentials), fields(email = %credentials.email))]
    pub async fn sign_in(&self, credentials: &Credentials) -> Result<Landing, AuthError> {
        let inner = &self.inner;

        let grant = inner.provider.create_session(credentials).await?;

        let _transition = inner.coordinator.transition().await;
        inner
            .store
            .write(&grant.session, inner.config.session_ttl())
            .await?;
        inner.coordinator.start_session(grant.session.access_token);

        let user = User {
            email: credentials.email.clone(),
            roles: grant.roles,
            permissions: grant.permissions,
        };
        inner.state.send_replace(AuthState::signed_in(user));

        tracing::info!("signed in");
        Ok(Landing::Authenticated)
    }

    /// Restores a persisted session, if one exists
    ///
    /// The stored access token is validated by asking the identity provider
    /// who it belongs to, refreshing it first if it has expired. If the
    /// session turns out to be unusable, the instance is signed out. If the
    /// identity provider cannot be reached, the persisted session is kept so
    /// a later attempt may succeed.
    #[tracing::instrument(err, skip(self))]
    pub async fn bootstrap(&self) -> Result<Option<User>, AuthError> {
        let inner = &self.inner;

        {
            let _transition = inner.coordinator.transition().await;
            let Some(session) = inner.store.read().await? else {
                tracing::debug!("no persisted session to restore");
                return Ok(None);
            };
            inner.coordinator.start_session(session.access_token);
        }

        let provider = &inner.provider;
        let result = inner
            .coordinator
            .authorized(|token| async move { provider.current_user(&token).await })
            .await;

        match result {
            Ok(_) if inner.token.current().is_none() => {
                tracing::debug!("signed out while restoring persisted session");
                Err(AuthError::SignedOut)
            }
            Ok(user) => {
                inner.state.send_replace(AuthState::signed_in(user.clone()));
                tracing::info!(email = %user.email, "restored persisted session");
                Ok(Some(user))
            }
            Err(error @ AuthError::Transport(_)) => {
                tracing::warn!("identity provider unreachable, keeping persisted session");
                Err(error)
            }
            Err(error) => {
                if let Err(sign_out_error) = inner.sign_out().await {
                    tracing::warn!(
                        error = (&sign_out_error as &dyn error::Error),
                        "unable to clear unusable persisted session"
                    );
                }
                Err(error)
            }
        }
    }

    /// Restores a persisted session in the background
    ///
    /// Failures are logged rather than returned.
    pub fn spawn_bootstrap(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(error) = manager.bootstrap().await {
                tracing::debug!(
                    error = (&error as &dyn error::Error),
                    "background session restore did not complete"
                );
            }
        })
    }

    /// Ends the session on this and every other instance
    ///
    /// The in-memory token is cleared before anything else happens, so no
    /// request issued after this call begins carries it. Signing out while
    /// already signed out does nothing and broadcasts nothing.
    pub async fn sign_out(&self) -> Result<Landing, AuthError> {
        self.inner.sign_out().await
    }

    /// Stops listening for sign-outs from other instances
    ///
    /// Returns whether the manager was still subscribed.
    pub fn unsubscribe(&self) -> bool {
        let subscription = self
            .inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match subscription {
            Some(subscription) => {
                subscription.unsubscribe();
                true
            }
            None => false,
        }
    }

    /// A snapshot of the current state
    pub fn state(&self) -> AuthState {
        self.inner.state.borrow().clone()
    }

    /// Observes changes to the state
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    /// The signed-in user, if any
    pub fn user(&self) -> Option<User> {
        self.inner.state.borrow().user.clone()
    }

    /// Whether a user is signed in
    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated()
    }

    /// The coordinator that refreshes this session's access token
    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.inner.coordinator
    }

    /// The in-memory access token
    pub fn token(&self) -> &TokenHandle {
        &self.inner.token
    }

    /// The configuration the manager was built with
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }
}
