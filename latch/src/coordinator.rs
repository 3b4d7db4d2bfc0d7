//! Single-flight refresh of expired access tokens
//!
//! When a request fails because its access token expired, the caller asks the
//! [`RefreshCoordinator`] to [`recover`][RefreshCoordinator::recover]. The
//! first such request in an episode starts exactly one refresh; every request
//! that fails while that refresh is in flight is queued onto the same episode.
//! Once the refresh resolves, queued requests are released in the order they
//! were queued, either with the fresh access token to replay with or with the
//! error that ended the episode.
//!
//! The refresh itself runs on its own task, so it completes even if the
//! request that started it is dropped. No queued request is ever left
//! waiting: if the refresh task dies, every queued request fails with
//! [`AuthError::RefreshFailed`].
//!
//! An episode belongs to the session it started in. If that session ends or
//! is replaced while the refresh is in flight, nothing the refresh returns is
//! persisted or published, and queued requests fail with
//! [`AuthError::SignedOut`].

use std::{
    collections::VecDeque,
    error, fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use aliri_clock::DurationSecs;
use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::{
    provider::IdentityProvider, store::SessionStore, AccessToken, AccessTokenRef, AuthError,
    TokenHandle,
};

/// Whether a refresh is currently in flight
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshState {
    /// No refresh is in flight
    Idle,
    /// A refresh is in flight; failing requests are queued onto it
    Refreshing,
}

/// Invoked when an episode ends because the session can no longer be refreshed
#[async_trait]
pub trait OnRefreshFailure: Send + Sync {
    /// Called exactly once per failed episode, before queued requests are failed
    async fn refresh_failed(&self);
}

type Resumption = Result<AccessToken, AuthError>;

struct PendingRequest {
    id: u64,
    resume: oneshot::Sender<Resumption>,
}

struct Episodes {
    state: RefreshState,
    episode: u64,
    generation: u64,
    next_request: u64,
    pending: VecDeque<PendingRequest>,
}

struct Shared {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn SessionStore>,
    token: TokenHandle,
    session_ttl: DurationSecs,
    on_failure: Box<dyn OnRefreshFailure>,
    episodes: Mutex<Episodes>,
    transitions: tokio::sync::Mutex<()>,
}

impl Shared {
    fn episodes(&self) -> MutexGuard<'_, Episodes> {
        self.episodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close_episode(&self) -> VecDeque<PendingRequest> {
        let mut episodes = self.episodes();
        episodes.state = RefreshState::Idle;
        std::mem::take(&mut episodes.pending)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.episodes().generation == generation
    }

    /// Publishes `token` only if the session is still the one in `generation`
    fn publish(&self, generation: u64, token: &AccessToken) -> bool {
        let episodes = self.episodes();
        let current = episodes.generation == generation;
        if current {
            self.token.set(token.clone());
        }
        current
    }

    async fn refresh(&self, generation: u64) -> Result<AccessToken, AuthError> {
        let session = self.store.read().await?.ok_or_else(|| {
            tracing::debug!("no persisted session to refresh");
            AuthError::RefreshFailed
        })?;

        let grant = self
            .provider
            .refresh_session(&session.refresh_token)
            .await?;
        let refreshed = grant.into_session(session.refresh_token);

        let _transition = self.transitions.lock().await;
        if !self.is_current(generation) {
            tracing::debug!("session ended during refresh, discarding refreshed tokens");
            return Err(AuthError::SignedOut);
        }

        if let Err(error) = self.store.write(&refreshed, self.session_ttl).await {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "unable to persist refreshed session"
            );
        }

        if !self.publish(generation, &refreshed.access_token) {
            tracing::debug!("session ended while persisting refresh, withdrawing it");
            if let Ok(Some(stored)) = self.store.read().await {
                if stored == refreshed {
                    self.store.clear().await?;
                }
            }
            return Err(AuthError::SignedOut);
        }

        Ok(refreshed.access_token)
    }
}

/// Coordinates refreshes so that concurrent failures share a single refresh
#[derive(Clone)]
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let episodes = self.shared.episodes();
        f.debug_struct("RefreshCoordinator")
            .field("state", &episodes.state)
            .field("episode", &episodes.episode)
            .field("queued", &episodes.pending.len())
            .field("token", &self.shared.token)
            .finish()
    }
}

impl RefreshCoordinator {
    /// Constructs a new coordinator
    ///
    /// Refreshed sessions are written back to `store` with `session_ttl`, and
    /// the fresh access token is published through `token`. `on_failure` is
    /// notified whenever the session can no longer be refreshed.
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn SessionStore>,
        token: TokenHandle,
        session_ttl: DurationSecs,
        on_failure: impl OnRefreshFailure + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider,
                store,
                token,
                session_ttl,
                on_failure: Box::new(on_failure),
                episodes: Mutex::new(Episodes {
                    state: RefreshState::Idle,
                    episode: 0,
                    generation: 0,
                    next_request: 0,
                    pending: VecDeque::new(),
                }),
                transitions: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// The access token requests are currently authorized with
    pub fn token(&self) -> &TokenHandle {
        &self.shared.token
    }

    /// Whether a refresh is currently in flight
    pub fn state(&self) -> RefreshState {
        self.shared.episodes().state
    }

    /// The number of requests waiting on the current episode
    pub fn queued(&self) -> usize {
        self.shared.episodes().pending.len()
    }

    /// Serializes changes to the session with the end of any refresh
    ///
    /// Hold the returned guard while persisting or clearing a session so
    /// that an episode cannot write its refreshed tokens in between.
    pub(crate) async fn transition(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.shared.transitions.lock().await
    }

    /// Starts a new session authorized with `token`
    ///
    /// An episode still running for the previous session will not publish
    /// its result.
    pub(crate) fn start_session(&self, token: AccessToken) {
        let mut episodes = self.shared.episodes();
        episodes.generation += 1;
        self.shared.token.set(token);
    }

    /// Ends the current session, returning whether a token was held
    ///
    /// An episode still running for the ended session will not publish its
    /// result.
    pub(crate) fn end_session(&self) -> bool {
        let mut episodes = self.shared.episodes();
        episodes.generation += 1;
        self.shared.token.clear()
    }

    /// Recovers from a request that failed because `stale` had expired
    ///
    /// The request is queued before this function returns, so the decision to
    /// start a refresh and the queueing of the request happen atomically.
    /// Await the returned [`Recovery`] to obtain the token to replay with.
    ///
    /// If the current token already differs from `stale`, an earlier episode
    /// has rotated it and it is returned without another refresh. If there is
    /// no current token, recovery fails with [`AuthError::SignedOut`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn recover(&self, stale: Option<&AccessTokenRef>) -> Recovery {
        let mut episodes = self.shared.episodes();

        if episodes.state == RefreshState::Idle {
            match self.shared.token.current() {
                None => {
                    tracing::debug!("no active session to recover");
                    return Recovery::ready(Err(AuthError::SignedOut));
                }
                Some(current) if stale != Some(&*current) => {
                    tracing::debug!("access token already rotated, replaying with current token");
                    return Recovery::ready(Ok(current));
                }
                Some(_) => {
                    episodes.state = RefreshState::Refreshing;
                    episodes.episode += 1;
                    let episode = episodes.episode;
                    let generation = episodes.generation;
                    tracing::debug!(episode, "access token expired, starting refresh");
                    tokio::spawn(run_episode(Arc::clone(&self.shared), episode, generation));
                }
            }
        }

        let (resume, rx) = oneshot::channel();
        let id = episodes.next_request;
        episodes.next_request += 1;
        episodes.pending.push_back(PendingRequest { id, resume });

        tracing::trace!(
            episode = episodes.episode,
            request = id,
            queued = episodes.pending.len(),
            "request queued behind refresh"
        );

        Recovery {
            inner: RecoveryInner::Waiting(rx),
        }
    }

    /// Runs an authorized call, transparently recovering from an expired token
    ///
    /// `call` is invoked with the current access token. If it fails with
    /// [`AuthError::TokenExpired`], the token is recovered and `call` is
    /// replayed once with the fresh token; the outcome of the replay is
    /// returned as is.
    pub async fn authorized<F, Fut, T>(&self, mut call: F) -> Result<T, AuthError>
    where
        F: FnMut(AccessToken) -> Fut,
        Fut: Future<Output = Result<T, AuthError>>,
    {
        let token = self.shared.token.current().ok_or(AuthError::SignedOut)?;

        match call(token.clone()).await {
            Err(AuthError::TokenExpired) => {
                let fresh = self.recover(Some(&token)).wait().await?;
                call(fresh).await
            }
            result => result,
        }
    }
}

/// A request's place in a refresh episode
#[derive(Debug)]
#[must_use = "a recovery must be waited on to obtain the token to replay with"]
pub struct Recovery {
    inner: RecoveryInner,
}

#[derive(Debug)]
enum RecoveryInner {
    Ready(Resumption),
    Waiting(oneshot::Receiver<Resumption>),
}

impl Recovery {
    fn ready(resumption: Resumption) -> Self {
        Self {
            inner: RecoveryInner::Ready(resumption),
        }
    }

    /// Waits for the episode to resolve
    ///
    /// Resolves to the access token to replay the failed request with, or to
    /// the error that ended the episode.
    pub async fn wait(self) -> Result<AccessToken, AuthError> {
        match self.inner {
            RecoveryInner::Ready(resumption) => resumption,
            RecoveryInner::Waiting(rx) => rx.await.unwrap_or(Err(AuthError::RefreshFailed)),
        }
    }
}

/// Errors from a refresh attempt that mean the session is no longer usable
fn invalidates_session(error: &AuthError) -> bool {
    match error {
        AuthError::RefreshFailed
        | AuthError::TokenExpired
        | AuthError::SignedOut
        | AuthError::CredentialsRejected { .. } => true,
        AuthError::Rejected { status, .. } => (400..500).contains(status),
        AuthError::Transport(_) | AuthError::Store(_) => false,
    }
}

struct EpisodeGuard<'a> {
    shared: &'a Shared,
    episode: u64,
    finished: bool,
}

impl EpisodeGuard<'_> {
    fn finish(mut self) -> VecDeque<PendingRequest> {
        self.finished = true;
        self.shared.close_episode()
    }
}

impl Drop for EpisodeGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let abandoned = self.shared.close_episode();
            tracing::error!(
                episode = self.episode,
                abandoned = abandoned.len(),
                "refresh episode ended without resolving"
            );
        }
    }
}

async fn run_episode(shared: Arc<Shared>, episode: u64, generation: u64) {
    let guard = EpisodeGuard {
        shared: &shared,
        episode,
        finished: false,
    };

    let resumption = match shared.refresh(generation).await {
        Ok(token) => {
            tracing::info!(episode, "access token refreshed");
            Ok(token)
        }
        Err(_) if !shared.is_current(generation) => {
            tracing::debug!(episode, "session ended during refresh");
            Err(AuthError::SignedOut)
        }
        Err(error) if invalidates_session(&error) => {
            tracing::warn!(
                episode,
                error = (&error as &dyn error::Error),
                "session can no longer be refreshed, signing out"
            );
            shared.on_failure.refresh_failed().await;
            Err(AuthError::RefreshFailed)
        }
        Err(error) => {
            tracing::warn!(
                episode,
                error = (&error as &dyn error::Error),
                "unable to refresh session"
            );
            Err(error)
        }
    };

    let pending = guard.finish();

    tracing::debug!(
        episode,
        released = pending.len(),
        succeeded = resumption.is_ok(),
        "refresh episode resolved"
    );

    for request in pending {
        if request.resume.send(resumption.clone()).is_err() {
            tracing::trace!(
                episode,
                request = request.id,
                "queued request was dropped by its caller"
            );
        }
    }
}
