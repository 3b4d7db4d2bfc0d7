//! Wire formats of the identity provider's endpoints

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{AccessTokenRef, RefreshTokenRef};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RefreshRequest<'a> {
    pub refresh_token: &'a RefreshTokenRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SessionResponse<'a> {
    #[serde(borrow, alias = "accessToken")]
    pub token: &'a AccessTokenRef,
    #[serde(borrow)]
    pub refresh_token: &'a RefreshTokenRef,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RefreshResponse<'a> {
    #[serde(borrow, alias = "accessToken")]
    pub token: &'a AccessTokenRef,
    #[serde(borrow, default)]
    pub refresh_token: Option<&'a RefreshTokenRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_response_accepts_token_field() {
        let body = br#"{"token":"t1","refreshToken":"r1","roles":["admin"],"permissions":["metrics.view"]}"#;
        let resp: SessionResponse = serde_json::from_slice(body).unwrap();
        assert_eq!(resp.token.as_str(), "t1");
        assert_eq!(resp.refresh_token.as_str(), "r1");
        assert!(resp.roles.contains("admin"));
        assert!(resp.permissions.contains("metrics.view"));
    }

    #[test]
    fn session_response_accepts_access_token_alias() {
        let body = br#"{"accessToken":"t1","refreshToken":"r1"}"#;
        let resp: SessionResponse = serde_json::from_slice(body).unwrap();
        assert_eq!(resp.token.as_str(), "t1");
        assert!(resp.roles.is_empty());
    }

    #[test]
    fn refresh_response_without_rotation() {
        let body = br#"{"token":"t2"}"#;
        let resp: RefreshResponse = serde_json::from_slice(body).unwrap();
        assert_eq!(resp.token.as_str(), "t2");
        assert!(resp.refresh_token.is_none());
    }

    #[test]
    fn refresh_request_uses_camel_case() {
        let req = RefreshRequest {
            refresh_token: RefreshTokenRef::from_static("r1"),
        };
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"refreshToken":"r1"}"#
        );
    }
}
