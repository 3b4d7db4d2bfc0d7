//! Identity providers
//!
//! An identity provider exchanges credentials for a session, mints new access
//! tokens from a refresh token, and reports who the bearer of an access token
//! is.

use std::{borrow::Cow, collections::BTreeSet};

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    AccessToken, AccessTokenRef, AuthError, Credentials, RefreshToken, RefreshTokenRef, Session,
    User,
};

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use self::http::HttpIdentityProvider;

/// The result of a successful sign-in
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignInGrant {
    /// The newly issued session
    pub session: Session,
    /// Roles granted to the user
    pub roles: BTreeSet<String>,
    /// Permissions granted to the user
    pub permissions: BTreeSet<String>,
}

/// The result of a successful refresh
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshGrant {
    /// The newly issued access token
    pub access_token: AccessToken,
    /// The rotated refresh token, if the provider rotates refresh tokens
    pub refresh_token: Option<RefreshToken>,
}

impl RefreshGrant {
    /// Combines the grant with the refresh token it was obtained with
    ///
    /// The refresh token is only kept if the provider did not issue a new one.
    pub fn into_session(self, previous: RefreshToken) -> Session {
        Session::new(self.access_token, self.refresh_token.unwrap_or(previous))
    }
}

/// A remote authority that issues and refreshes sessions
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchanges credentials for a new session
    async fn create_session(&self, credentials: &Credentials) -> Result<SignInGrant, AuthError>;

    /// Mints a new access token from a refresh token
    async fn refresh_session(&self, refresh_token: &RefreshTokenRef)
        -> Result<RefreshGrant, AuthError>;

    /// Describes the user an access token was issued to
    ///
    /// Fails with [`AuthError::TokenExpired`] when the token is stale.
    async fn current_user(&self, access_token: &AccessTokenRef) -> Result<User, AuthError>;
}

/// The error body returned by the identity provider
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    /// A machine-readable error code, such as `token.expired`
    #[serde(default)]
    pub code: Option<String>,
    /// A human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    /// Parses an error body, treating anything unparseable as empty
    pub fn parse(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }
}

/// Recognizes the response that signals an expired access token
///
/// Only a `401 Unauthorized` carrying the configured error code qualifies; any
/// other unauthorized response is a different failure and must not trigger a
/// refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpirySignal {
    code: Cow<'static, str>,
}

impl Default for ExpirySignal {
    /// Matches the `token.expired` error code
    fn default() -> Self {
        Self::new("token.expired")
    }
}

impl ExpirySignal {
    /// Constructs a signal matching a custom error code
    pub fn new(code: impl Into<Cow<'static, str>>) -> Self {
        Self { code: code.into() }
    }

    /// The error code that marks an expired token
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Whether a response status and body signal an expired access token
    pub fn matches(&self, status: u16, body: &[u8]) -> bool {
        status == 401 && self.matches_error(&ErrorBody::parse(body))
    }

    /// Whether an already-parsed error body carries the expiry code
    pub fn matches_error(&self, error: &ErrorBody) -> bool {
        error.code.as_deref() == Some(&*self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_code_on_unauthorized_is_recognized() {
        let signal = ExpirySignal::default();
        assert!(signal.matches(
            401,
            br#"{"error":true,"code":"token.expired","message":"Token expired."}"#
        ));
    }

    #[test]
    fn other_unauthorized_responses_are_not_expiry() {
        let signal = ExpirySignal::default();
        assert!(!signal.matches(401, br#"{"error":true,"code":"token.invalid"}"#));
        assert!(!signal.matches(401, br#"{"error":true,"message":"Unauthorized"}"#));
        assert!(!signal.matches(401, b"not json"));
        assert!(!signal.matches(401, b""));
    }

    #[test]
    fn expiry_code_on_other_statuses_is_ignored() {
        let signal = ExpirySignal::default();
        assert!(!signal.matches(403, br#"{"code":"token.expired"}"#));
        assert!(!signal.matches(500, br#"{"code":"token.expired"}"#));
    }

    #[test]
    fn custom_code_is_matched() {
        let signal = ExpirySignal::new("jwt.stale");
        assert!(signal.matches(401, br#"{"code":"jwt.stale"}"#));
        assert!(!signal.matches(401, br#"{"code":"token.expired"}"#));
    }

    #[test]
    fn refresh_grant_keeps_previous_refresh_token_when_not_rotated() {
        let grant = RefreshGrant {
            access_token: AccessToken::from_static("t2"),
            refresh_token: None,
        };
        let session = grant.into_session(RefreshToken::from_static("r1"));
        assert_eq!(session.refresh_token, RefreshToken::from_static("r1"));
    }

    #[test]
    fn refresh_grant_prefers_rotated_refresh_token() {
        let grant = RefreshGrant {
            access_token: AccessToken::from_static("t2"),
            refresh_token: Some(RefreshToken::from_static("r2")),
        };
        let session = grant.into_session(RefreshToken::from_static("r1"));
        assert_eq!(session.access_token, AccessToken::from_static("t2"));
        assert_eq!(session.refresh_token, RefreshToken::from_static("r2"));
    }
}
