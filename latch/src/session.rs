use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{AccessToken, Password, RefreshToken};

/// The pair of tokens that make up a client-held session
///
/// Both tokens are always held together; a session never exists with only
/// one of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    /// The short-lived token presented on every request
    pub access_token: AccessToken,
    /// The longer-lived token used to mint new access tokens
    pub refresh_token: RefreshToken,
}

impl Session {
    /// Constructs a session from its two tokens
    pub fn new(access_token: AccessToken, refresh_token: RefreshToken) -> Self {
        Self {
            access_token,
            refresh_token,
        }
    }
}

/// The authenticated user, as reported by the identity provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// The user's e-mail address
    pub email: String,
    /// Roles granted to the user
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// Permissions granted to the user
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl User {
    /// Whether the user holds every one of the given permissions
    ///
    /// An empty requirement is always satisfied.
    pub fn has_permissions(&self, required: &[&str]) -> bool {
        required.iter().all(|p| self.permissions.contains(*p))
    }

    /// Whether the user holds at least one of the given roles
    ///
    /// An empty requirement is always satisfied.
    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        roles.is_empty() || roles.iter().any(|r| self.roles.contains(*r))
    }
}

/// The signed-in/signed-out view exposed to the rest of the application
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthState {
    /// The current user, if signed in
    pub user: Option<User>,
}

impl AuthState {
    pub(crate) fn signed_in(user: User) -> Self {
        Self { user: Some(user) }
    }

    /// Whether a user is currently signed in
    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

/// Credentials exchanged for a session when signing in
#[derive(Clone, Debug, Serialize)]
pub struct Credentials {
    /// The user's e-mail address
    pub email: String,
    /// The user's password
    pub password: Password,
}

impl Credentials {
    /// Constructs a new set of credentials
    pub fn new(email: impl Into<String>, password: impl Into<Password>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

/// Where the application should navigate after a session transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Landing {
    /// The area shown to signed-in users
    Authenticated,
    /// The area shown to signed-out users
    Unauthenticated,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User {
            email: "a@x.com".to_owned(),
            roles: ["editor".to_owned()].into_iter().collect(),
            permissions: ["metrics.view".to_owned(), "users.list".to_owned()]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn permissions_must_all_be_held() {
        let user = user();
        assert!(user.has_permissions(&["metrics.view"]));
        assert!(user.has_permissions(&["metrics.view", "users.list"]));
        assert!(!user.has_permissions(&["metrics.view", "users.create"]));
        assert!(user.has_permissions(&[]));
    }

    #[test]
    fn any_single_role_is_enough() {
        let user = user();
        assert!(user.has_any_role(&["administrator", "editor"]));
        assert!(!user.has_any_role(&["administrator"]));
        assert!(user.has_any_role(&[]));
    }

    #[test]
    fn auth_state_is_derived_from_user() {
        assert!(!AuthState::default().is_authenticated());
        assert!(AuthState::signed_in(user()).is_authenticated());
    }

    #[test]
    fn credentials_debug_hides_password() {
        let credentials = Credentials::new("a@x.com", "p");
        let rendered = format!("{:?}", credentials);
        assert!(rendered.contains("***PASSWORD***"));
        assert!(!rendered.contains("\"p\""));
    }
}
