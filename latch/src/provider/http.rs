//! An identity provider reached over HTTP

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use reqwest::{header, StatusCode};

use super::{ErrorBody, ExpirySignal, IdentityProvider, RefreshGrant, SignInGrant};
use crate::{AccessTokenRef, AuthError, Credentials, RefreshTokenRef, Session, User};

pub mod dto;

/// Paths of the identity provider's endpoints, relative to its base URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    /// Exchanges credentials for a session (`POST`)
    pub sessions: String,
    /// Mints a new access token from a refresh token (`POST`)
    pub refresh: String,
    /// Describes the bearer of an access token (`GET`)
    pub me: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            sessions: "sessions".to_owned(),
            refresh: "refresh".to_owned(),
            me: "me".to_owned(),
        }
    }
}

/// An identity provider that speaks JSON over HTTP
///
/// Calls made by this provider go straight to the underlying
/// [`reqwest::Client`]. In particular, the refresh call never passes through
/// a session middleware, so a failed refresh can never trigger another one.
#[derive(Clone, Debug)]
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    base_url: reqwest::Url,
    endpoints: Endpoints,
    signal: ExpirySignal,
}

impl HttpIdentityProvider {
    /// Constructs a new provider rooted at `base_url`
    pub fn new(client: reqwest::Client, base_url: reqwest::Url) -> Self {
        Self {
            client,
            base_url,
            endpoints: Endpoints::default(),
            signal: ExpirySignal::default(),
        }
    }

    /// Overrides the endpoint paths
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Overrides the error code that signals an expired access token
    pub fn with_expiry_signal(mut self, signal: ExpirySignal) -> Self {
        self.signal = signal;
        self
    }

    /// The base URL all endpoints are resolved against
    pub fn base_url(&self) -> &reqwest::Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<reqwest::Url, AuthError> {
        self.base_url.join(path).map_err(AuthError::transport)
    }
}

/// Sends a request and returns the body of a successful response
///
/// Error responses are handed to `on_error` for classification.
async fn send(
    request: reqwest::RequestBuilder,
    on_error: impl FnOnce(StatusCode, ErrorBody) -> AuthError,
) -> Result<bytes::Bytes, AuthError> {
    let resp = request.send().await.map_err(AuthError::transport)?;
    let status = resp.status();

    tracing::debug!(
        response.status = status.as_u16(),
        "received response from identity provider"
    );

    let body = resp.bytes().await.map_err(AuthError::transport)?;

    if status.is_success() {
        Ok(body)
    } else {
        Err(on_error(status, ErrorBody::parse(&body)))
    }
}

fn rejected(status: StatusCode, error: ErrorBody) -> AuthError {
    AuthError::Rejected {
        status: status.as_u16(),
        code: error.code,
        message: error.message,
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    #[tracing::instrument(
        err,
        skip(self, credentials),
        fields(url = %self.base_url, email = %credentials.email),
    )]
    async fn create_session(&self, credentials: &Credentials) -> Result<SignInGrant, AuthError> {
        tracing::trace!("requesting session from identity provider");

        let req = self
            .client
            .post(self.url(&self.endpoints.sessions)?)
            .json(credentials);

        let body = send(req, |status, error| {
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::BAD_REQUEST {
                AuthError::CredentialsRejected {
                    message: error
                        .message
                        .unwrap_or_else(|| "invalid e-mail or password".to_owned()),
                }
            } else {
                rejected(status, error)
            }
        })
        .await?;

        let resp: dto::SessionResponse =
            serde_json::from_slice(&body).map_err(AuthError::transport)?;

        tracing::info!(
            roles = resp.roles.len(),
            permissions = resp.permissions.len(),
            "received new session"
        );

        Ok(SignInGrant {
            session: Session::new(resp.token.to_owned(), resp.refresh_token.to_owned()),
            roles: resp.roles,
            permissions: resp.permissions,
        })
    }

    #[tracing::instrument(err, skip(self, refresh_token), fields(url = %self.base_url))]
    async fn refresh_session(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshGrant, AuthError> {
        tracing::trace!("requesting refreshed token from identity provider");

        let req = self
            .client
            .post(self.url(&self.endpoints.refresh)?)
            .json(&dto::RefreshRequest { refresh_token });

        let body = send(req, |status, error| {
            if status.is_client_error() {
                AuthError::RefreshFailed
            } else {
                rejected(status, error)
            }
        })
        .await?;

        let resp: dto::RefreshResponse =
            serde_json::from_slice(&body).map_err(AuthError::transport)?;

        tracing::info!(
            has_refresh_token = resp.refresh_token.is_some(),
            "received refreshed token"
        );

        Ok(RefreshGrant {
            access_token: resp.token.to_owned(),
            refresh_token: resp.refresh_token.map(ToOwned::to_owned),
        })
    }

    #[tracing::instrument(err, skip(self, access_token), fields(url = %self.base_url))]
    async fn current_user(&self, access_token: &AccessTokenRef) -> Result<User, AuthError> {
        let mut req = self.client.get(self.url(&self.endpoints.me)?);
        req = req.header(header::AUTHORIZATION, bearer(access_token)?);

        let body = send(req, |status, error| {
            if status == StatusCode::UNAUTHORIZED && self.signal.matches_error(&error) {
                AuthError::TokenExpired
            } else {
                rejected(status, error)
            }
        })
        .await?;

        serde_json::from_slice(&body).map_err(AuthError::transport)
    }
}

fn bearer(token: &AccessTokenRef) -> Result<header::HeaderValue, AuthError> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());

    let mut value = header::HeaderValue::from_maybe_shared(Bytes::from(header_value))
        .map_err(AuthError::transport)?;
    value.set_sensitive(true);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use axum::{
        http::{HeaderMap, StatusCode as Status},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    use super::*;
    use crate::{AccessToken, RefreshToken};

    async fn serve(app: Router) -> reqwest::Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        reqwest::Url::parse(&format!("http://{addr}/")).unwrap()
    }

    async fn provider(app: Router) -> HttpIdentityProvider {
        HttpIdentityProvider::new(reqwest::Client::new(), serve(app).await)
    }

    fn fixed(status: Status, body: Value) -> Router {
        let respond = move || {
            let body = body.clone();
            async move { (status, Json(body)) }
        };
        Router::new()
            .route("/sessions", post(respond.clone()))
            .route("/refresh", post(respond.clone()))
            .route("/me", get(respond))
    }

    fn credentials() -> Credentials {
        Credentials::new("a@x.com", "p")
    }

    mod create_session {
        use super::*;

        #[tokio::test]
        async fn issued_session_is_returned_with_grants() {
            let provider = provider(fixed(
                Status::OK,
                json!({
                    "token": "t1",
                    "refreshToken": "r1",
                    "roles": ["admin"],
                    "permissions": ["metrics.view"],
                }),
            ))
            .await;

            let grant = provider.create_session(&credentials()).await.unwrap();

            assert_eq!(
                grant.session,
                Session::new(AccessToken::from_static("t1"), RefreshToken::from_static("r1"))
            );
            assert!(grant.roles.contains("admin"));
            assert!(grant.permissions.contains("metrics.view"));
        }

        #[tokio::test]
        async fn unauthorized_is_rejected_credentials_with_message() {
            let provider = provider(fixed(
                Status::UNAUTHORIZED,
                json!({ "error": true, "message": "Wrong password." }),
            ))
            .await;

            let err = provider.create_session(&credentials()).await.unwrap_err();

            assert!(matches!(
                err,
                AuthError::CredentialsRejected { ref message } if message == "Wrong password."
            ));
        }

        #[tokio::test]
        async fn bad_request_without_message_is_rejected_credentials() {
            let provider = provider(fixed(Status::BAD_REQUEST, json!({}))).await;

            let err = provider.create_session(&credentials()).await.unwrap_err();

            assert!(matches!(err, AuthError::CredentialsRejected { .. }));
        }

        #[tokio::test]
        async fn server_error_is_not_a_credentials_failure() {
            let provider = provider(fixed(
                Status::INTERNAL_SERVER_ERROR,
                json!({ "code": "internal" }),
            ))
            .await;

            let err = provider.create_session(&credentials()).await.unwrap_err();

            assert!(matches!(
                err,
                AuthError::Rejected { status: 500, code: Some(ref code), .. } if code == "internal"
            ));
        }
    }

    mod refresh_session {
        use super::*;

        #[tokio::test]
        async fn refresh_token_is_sent_and_new_pair_returned() {
            let app = Router::new().route(
                "/refresh",
                post(|Json(body): Json<Value>| async move {
                    if body["refreshToken"] == "r1" {
                        (Status::OK, Json(json!({ "token": "t2", "refreshToken": "r2" })))
                    } else {
                        (Status::UNAUTHORIZED, Json(json!({ "code": "token.invalid" })))
                    }
                }),
            );
            let provider = provider(app).await;

            let grant = provider
                .refresh_session(RefreshTokenRef::from_static("r1"))
                .await
                .unwrap();

            assert_eq!(grant.access_token, AccessToken::from_static("t2"));
            assert_eq!(grant.refresh_token, Some(RefreshToken::from_static("r2")));
        }

        #[tokio::test]
        async fn response_without_refresh_token_keeps_none() {
            let provider = provider(fixed(Status::OK, json!({ "token": "t2" }))).await;

            let grant = provider
                .refresh_session(RefreshTokenRef::from_static("r1"))
                .await
                .unwrap();

            assert_eq!(grant.refresh_token, None);
        }

        #[tokio::test]
        async fn client_error_means_session_cannot_be_refreshed() {
            for status in [Status::UNAUTHORIZED, Status::BAD_REQUEST, Status::FORBIDDEN] {
                let provider = provider(fixed(status, json!({ "code": "token.invalid" }))).await;

                let err = provider
                    .refresh_session(RefreshTokenRef::from_static("r1"))
                    .await
                    .unwrap_err();

                assert!(matches!(err, AuthError::RefreshFailed), "status {status}");
            }
        }

        #[tokio::test]
        async fn server_error_keeps_its_status() {
            let provider = provider(fixed(Status::SERVICE_UNAVAILABLE, json!({}))).await;

            let err = provider
                .refresh_session(RefreshTokenRef::from_static("r1"))
                .await
                .unwrap_err();

            assert!(matches!(err, AuthError::Rejected { status: 503, .. }));
        }
    }

    mod current_user {
        use super::*;

        #[tokio::test]
        async fn bearer_token_is_presented() {
            let app = Router::new().route(
                "/me",
                get(|headers: HeaderMap| async move {
                    let authorization = headers
                        .get(axum::http::header::AUTHORIZATION)
                        .and_then(|value| value.to_str().ok());
                    if authorization == Some("Bearer t1") {
                        (Status::OK, Json(json!({ "email": "a@x.com", "roles": ["admin"] })))
                    } else {
                        (Status::UNAUTHORIZED, Json(json!({ "code": "token.invalid" })))
                    }
                }),
            );
            let provider = provider(app).await;

            let user = provider
                .current_user(AccessTokenRef::from_static("t1"))
                .await
                .unwrap();

            assert_eq!(user.email, "a@x.com");
            assert!(user.has_any_role(&["admin"]));
            assert!(user.permissions.is_empty());
        }

        #[tokio::test]
        async fn expiry_code_is_token_expired() {
            let provider = provider(fixed(
                Status::UNAUTHORIZED,
                json!({ "error": true, "code": "token.expired", "message": "Token expired." }),
            ))
            .await;

            let err = provider
                .current_user(AccessTokenRef::from_static("t1"))
                .await
                .unwrap_err();

            assert!(matches!(err, AuthError::TokenExpired));
        }

        #[tokio::test]
        async fn other_unauthorized_is_rejected() {
            let provider = provider(fixed(
                Status::UNAUTHORIZED,
                json!({ "code": "token.invalid" }),
            ))
            .await;

            let err = provider
                .current_user(AccessTokenRef::from_static("t1"))
                .await
                .unwrap_err();

            assert!(matches!(
                err,
                AuthError::Rejected { status: 401, code: Some(ref code), .. } if code == "token.invalid"
            ));
        }

        #[tokio::test]
        async fn custom_expiry_code_is_honored() {
            let provider = provider(fixed(Status::UNAUTHORIZED, json!({ "code": "jwt.stale" })))
                .await
                .with_expiry_signal(ExpirySignal::new("jwt.stale"));

            let err = provider
                .current_user(AccessTokenRef::from_static("t1"))
                .await
                .unwrap_err();

            assert!(matches!(err, AuthError::TokenExpired));
        }
    }

    #[tokio::test]
    async fn unreachable_provider_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let provider = HttpIdentityProvider::new(
            reqwest::Client::new(),
            reqwest::Url::parse(&format!("http://{addr}/")).unwrap(),
        );

        let err = provider.create_session(&credentials()).await.unwrap_err();

        assert!(matches!(err, AuthError::Transport(_)));
        assert!(!err.requires_sign_in());
    }
}
