//! Middleware to authorize outgoing requests with the current session
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`SessionMiddleware`] in the middleware stack to attach the
//! session's current access token to each outbound request.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! When a response reports that the access token has expired, the middleware
//! hands the failure to the session's
//! [`RefreshCoordinator`](latch::coordinator::RefreshCoordinator), waits for
//! the single refresh shared by every request that failed the same way, and
//! replays the request once with the fresh token. The caller only ever sees
//! the response to the replay. Any other response, including any other
//! `401 Unauthorized`, is passed through untouched.
//!
//! ```
//! use latch::SessionManager;
//! use latch_reqwest::SessionMiddleware;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! # fn build(manager: SessionManager) {
//! let client = ClientBuilder::new(Client::default())
//!     .with(SessionMiddleware::new(manager.coordinator().clone()))
//!     .build();
//! # }
//! ```
//!
//! The middleware can also be configured to attach the token only
//! conditionally. This is useful when a single middleware stack is shared by
//! several backends and the session's token must only ever be sent to the
//! API it was issued for.
//!
//! ```
//! use latch::coordinator::RefreshCoordinator;
//! use latch_reqwest::{SameOrigin, SessionMiddleware};
//!
//! # fn build(coordinator: RefreshCoordinator) {
//! let api = reqwest::Url::parse("https://api.example.com/v1/").unwrap();
//!
//! SessionMiddleware::new(coordinator).with_predicate(SameOrigin::new(&api));
//! # }
//! ```
//!
//! Requests whose body is a stream cannot be replayed. Such a request is sent
//! once and its response is returned as is.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use latch::{
    coordinator::RefreshCoordinator, provider::ExpirySignal, AccessTokenRef, AuthError,
};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next, Result};

/// A middleware that authorizes outgoing requests and recovers from expired tokens
#[derive(Clone, Debug)]
pub struct SessionMiddleware<P = EveryRequest> {
    coordinator: RefreshCoordinator,
    signal: ExpirySignal,
    predicate: P,
}

impl SessionMiddleware<EveryRequest> {
    /// Construct a new middleware from a session's refresh coordinator
    ///
    /// By default, this middleware attaches the access token to every
    /// request. To change this behavior, provide a custom predicate with
    /// [`with_predicate()`][Self::with_predicate()].
    pub fn new(coordinator: RefreshCoordinator) -> Self {
        Self {
            coordinator,
            signal: ExpirySignal::default(),
            predicate: EveryRequest,
        }
    }
}

impl<P> SessionMiddleware<P> {
    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> SessionMiddleware<Q> {
        SessionMiddleware {
            coordinator: self.coordinator,
            signal: self.signal,
            predicate,
        }
    }

    /// Overrides the error code that marks a response as token-expired
    pub fn with_expiry_signal(mut self, signal: ExpirySignal) -> Self {
        self.signal = signal;
        self
    }

    /// Buffers an unauthorized response and checks it for the expiry signal
    ///
    /// The returned response replays the buffered body, so it can still be
    /// handed to the caller if the token turns out not to have expired.
    async fn inspect(&self, resp: Response) -> Result<(Response, bool)> {
        let status = resp.status();
        let (parts, body) = http::Response::<reqwest::Body>::from(resp).into_parts();
        let body = Response::from(http::Response::new(body)).bytes().await?;

        let expired = self.signal.matches(status.as_u16(), &body);
        Ok((Response::from(http::Response::from_parts(parts, body)), expired))
    }
}

fn bearer(token: &AccessTokenRef) -> Result<header::HeaderValue> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());

    let mut value = header::HeaderValue::from_maybe_shared(Bytes::from(header_value))
        .map_err(reqwest_middleware::Error::middleware)?;
    value.set_sensitive(true);
    Ok(value)
}

#[async_trait::async_trait]
impl<P> Middleware for SessionMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) || req.headers().contains_key(header::AUTHORIZATION) {
            return next.run(req, extensions).await;
        }

        let Some(token) = self.coordinator.token().current() else {
            tracing::trace!("no active session, sending request without authorization");
            return next.run(req, extensions).await;
        };

        req.headers_mut()
            .insert(header::AUTHORIZATION, bearer(&token)?);
        tracing::trace!(token = format_args!("{:#?}", token), "attached access token");
        let replay = req.try_clone();

        let resp = next.clone().run(req, extensions).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let Some(mut replay) = replay else {
            tracing::debug!("request cannot be replayed, returning unauthorized response");
            return Ok(resp);
        };

        let (resp, expired) = self.inspect(resp).await?;
        if !expired {
            return Ok(resp);
        }

        tracing::debug!(
            url = %replay.url(),
            "access token expired, waiting for refreshed token"
        );

        let fresh = self
            .coordinator
            .recover(Some(&token))
            .wait()
            .await
            .map_err(reqwest_middleware::Error::middleware)?;

        replay
            .headers_mut()
            .insert(header::AUTHORIZATION, bearer(&fresh)?);

        tracing::trace!("replaying request with refreshed token");
        next.run(replay, extensions).await
    }
}

/// Extracts the session error that caused a request to fail, if any
///
/// A request fails with [`AuthError::RefreshFailed`] when its token expired
/// and the session could not be refreshed; the user must sign in again.
pub fn auth_error(error: &reqwest_middleware::Error) -> Option<&AuthError> {
    match error {
        reqwest_middleware::Error::Middleware(inner) => inner.downcast_ref::<AuthError>(),
        _ => None,
    }
}

/// Attach an access token to every request
#[derive(Clone, Copy, Debug, Default)]
pub struct EveryRequest;

impl Predicate<Request> for EveryRequest {
    #[inline]
    fn eval(&self, _: &Request) -> bool {
        true
    }
}

impl reflection::PredicateReflection for EveryRequest {}
impl fmt::Display for EveryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any request")
    }
}

/// Only attach an access token if the request is sent to the given origin
///
/// Two URLs share an origin when their scheme, host, and port all match.
#[derive(Clone, Debug)]
pub struct SameOrigin {
    origin: String,
}

impl SameOrigin {
    /// Construct a new predicate matching the origin of `url`
    pub fn new(url: &reqwest::Url) -> Self {
        Self {
            origin: url.origin().ascii_serialization(),
        }
    }
}

impl Predicate<Request> for SameOrigin {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().origin().ascii_serialization() == self.origin
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "origin",
                    req.url().origin().ascii_serialization(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for SameOrigin {}
impl fmt::Display for SameOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("origin == ")?;
        f.write_str(&self.origin)
    }
}
