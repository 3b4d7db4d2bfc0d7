//! Test doubles for code built on top of a session
//!
//! [`ScriptedProvider`] is an in-memory identity provider. It issues
//! sequentially numbered tokens (`t1`, `r1`, `t2`, …), can be told to expire
//! every access token issued so far, to reject or fail refreshes, and to hold
//! refreshes until released so tests can pile up concurrent requests behind
//! one.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{
    provider::{IdentityProvider, RefreshGrant, SignInGrant},
    AccessToken, AccessTokenRef, AuthError, Credentials, RefreshToken, RefreshTokenRef, Session,
    User,
};

#[derive(Debug)]
struct Account {
    password: String,
    roles: Vec<String>,
    permissions: Vec<String>,
}

#[derive(Debug, Default)]
struct Script {
    accounts: HashMap<String, Account>,
    issued: u64,
    rotate_refresh_tokens: bool,
    access: HashMap<AccessToken, String>,
    refresh: HashMap<RefreshToken, String>,
    expired: HashSet<AccessToken>,
    refresh_failure: Option<AuthError>,
    refresh_tokens_seen: Vec<RefreshToken>,
    sign_in_calls: usize,
    user_calls: usize,
}

impl Script {
    fn next_serial(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    fn user(&self, email: &str) -> Option<User> {
        self.accounts.get(email).map(|account| User {
            email: email.to_owned(),
            roles: account.roles.iter().cloned().collect(),
            permissions: account.permissions.iter().cloned().collect(),
        })
    }
}

/// An in-memory identity provider with scripted behavior
#[derive(Debug)]
pub struct ScriptedProvider {
    script: Mutex<Script>,
    gate: watch::Sender<bool>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    /// Constructs a provider that knows no accounts
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            gate: watch::channel(true).0,
        }
    }

    /// Registers an account that may sign in
    pub fn with_account(
        self,
        email: &str,
        password: &str,
        roles: &[&str],
        permissions: &[&str],
    ) -> Self {
        self.script().accounts.insert(
            email.to_owned(),
            Account {
                password: password.to_owned(),
                roles: roles.iter().map(|&r| r.to_owned()).collect(),
                permissions: permissions.iter().map(|&p| p.to_owned()).collect(),
            },
        );
        self
    }

    /// Issues a new refresh token with every refresh, revoking the old one
    pub fn rotating_refresh_tokens(self) -> Self {
        self.script().rotate_refresh_tokens = true;
        self
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Expires every access token issued so far
    pub fn expire_access_tokens(&self) {
        let mut script = self.script();
        let issued: Vec<_> = script.access.keys().cloned().collect();
        script.expired.extend(issued);
    }

    /// Rejects every subsequent refresh, as if the refresh token were revoked
    pub fn reject_refreshes(&self) {
        self.fail_refreshes_with(AuthError::RefreshFailed);
    }

    /// Fails every subsequent refresh with `error`
    pub fn fail_refreshes_with(&self, error: AuthError) {
        self.script().refresh_failure = Some(error);
    }

    /// Holds every refresh until [`release_refreshes`][Self::release_refreshes] is called
    pub fn hold_refreshes(&self) {
        self.gate.send_replace(false);
    }

    /// Lets held refreshes proceed
    pub fn release_refreshes(&self) {
        self.gate.send_replace(true);
    }

    /// Whether `token` was issued by this provider and has not expired
    pub fn accepts(&self, token: &AccessTokenRef) -> bool {
        let script = self.script();
        script.access.contains_key(token) && !script.expired.contains(token)
    }

    /// The number of refreshes requested so far
    pub fn refresh_calls(&self) -> usize {
        self.script().refresh_tokens_seen.len()
    }

    /// The refresh tokens presented so far, in order
    pub fn refresh_tokens_seen(&self) -> Vec<RefreshToken> {
        self.script().refresh_tokens_seen.clone()
    }

    /// The number of sign-ins attempted so far
    pub fn sign_in_calls(&self) -> usize {
        self.script().sign_in_calls
    }

    /// The number of user lookups made so far
    pub fn user_calls(&self) -> usize {
        self.script().user_calls
    }
}

#[async_trait]
impl IdentityProvider for ScriptedProvider {
    async fn create_session(&self, credentials: &Credentials) -> Result<SignInGrant, AuthError> {
        let mut script = self.script();
        script.sign_in_calls += 1;

        let accepted = script
            .accounts
            .get(&credentials.email)
            .is_some_and(|account| account.password == credentials.password.as_str());
        if !accepted {
            return Err(AuthError::CredentialsRejected {
                message: "invalid e-mail or password".to_owned(),
            });
        }

        let serial = script.next_serial();
        let access_token = AccessToken::new(format!("t{serial}"));
        let refresh_token = RefreshToken::new(format!("r{serial}"));
        script
            .access
            .insert(access_token.clone(), credentials.email.clone());
        script
            .refresh
            .insert(refresh_token.clone(), credentials.email.clone());

        let account = &script.accounts[&credentials.email];
        Ok(SignInGrant {
            roles: account.roles.iter().cloned().collect(),
            permissions: account.permissions.iter().cloned().collect(),
            session: Session::new(access_token, refresh_token),
        })
    }

    async fn refresh_session(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshGrant, AuthError> {
        self.script()
            .refresh_tokens_seen
            .push(refresh_token.to_owned());

        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(AuthError::RefreshFailed);
        }

        let mut script = self.script();
        if let Some(error) = script.refresh_failure.clone() {
            return Err(error);
        }

        let email = script
            .refresh
            .get(refresh_token)
            .cloned()
            .ok_or(AuthError::RefreshFailed)?;

        let serial = script.next_serial();
        let access_token = AccessToken::new(format!("t{serial}"));
        script.access.insert(access_token.clone(), email.clone());

        let rotated = if script.rotate_refresh_tokens {
            let rotated = RefreshToken::new(format!("r{serial}"));
            script.refresh.remove(refresh_token);
            script.refresh.insert(rotated.clone(), email);
            Some(rotated)
        } else {
            None
        };

        Ok(RefreshGrant {
            access_token,
            refresh_token: rotated,
        })
    }

    async fn current_user(&self, access_token: &AccessTokenRef) -> Result<User, AuthError> {
        let mut script = self.script();
        script.user_calls += 1;

        if script.expired.contains(access_token) {
            return Err(AuthError::TokenExpired);
        }

        script
            .access
            .get(access_token)
            .and_then(|email| script.user(email))
            .ok_or_else(|| AuthError::Rejected {
                status: 401,
                code: Some("token.invalid".to_owned()),
                message: None,
            })
    }
}
