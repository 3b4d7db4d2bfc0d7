//! Session configuration

use aliri_clock::DurationSecs;

use crate::Landing;

/// Thirty days, the lifetime of a refresh token in the reference deployment
const DEFAULT_SESSION_TTL: DurationSecs = DurationSecs(60 * 60 * 24 * 30);

/// Names of the two entries a session occupies in a [`SessionStore`][crate::store::SessionStore]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreKeys {
    /// Entry holding the access token
    pub access_token: String,
    /// Entry holding the refresh token
    pub refresh_token: String,
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self {
            access_token: "latch.token".to_owned(),
            refresh_token: "latch.refreshToken".to_owned(),
        }
    }
}

/// Routes the application navigates to after sign-in and sign-out
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LandingPaths {
    /// Route for signed-in users
    pub authenticated: String,
    /// Route for signed-out users
    pub unauthenticated: String,
}

impl Default for LandingPaths {
    fn default() -> Self {
        Self {
            authenticated: "/dashboard".to_owned(),
            unauthenticated: "/".to_owned(),
        }
    }
}

impl LandingPaths {
    /// Resolves a landing signal to its route
    pub fn path(&self, landing: Landing) -> &str {
        match landing {
            Landing::Authenticated => &self.authenticated,
            Landing::Unauthenticated => &self.unauthenticated,
        }
    }
}

/// Configuration for a [`SessionManager`][crate::SessionManager]
#[derive(Clone, Debug)]
pub struct SessionConfig {
    session_ttl: DurationSecs,
    channel: String,
    landing: LandingPaths,
}

impl Default for SessionConfig {
    /// Default session configuration
    ///
    /// Sessions are persisted for 30 days and sign-outs are broadcast on the
    /// `auth` channel.
    fn default() -> Self {
        Self {
            session_ttl: DEFAULT_SESSION_TTL,
            channel: "auth".to_owned(),
            landing: LandingPaths::default(),
        }
    }
}

impl SessionConfig {
    /// Sets how long a persisted session remains in the store
    pub fn with_session_ttl(mut self, ttl: DurationSecs) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Sets the bus channel used to broadcast sign-outs
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Sets the landing routes
    pub fn with_landing(mut self, landing: LandingPaths) -> Self {
        self.landing = landing;
        self
    }

    /// How long a persisted session remains in the store
    pub fn session_ttl(&self) -> DurationSecs {
        self.session_ttl
    }

    /// The bus channel used to broadcast sign-outs
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The landing routes
    pub fn landing(&self) -> &LandingPaths {
        &self.landing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_session_lasts_thirty_days() {
        assert_eq!(SessionConfig::default().session_ttl(), DurationSecs(2_592_000));
    }

    #[test]
    fn landing_resolves_to_configured_routes() {
        let config = SessionConfig::default().with_landing(LandingPaths {
            authenticated: "/app".to_owned(),
            unauthenticated: "/login".to_owned(),
        });
        assert_eq!(config.landing().path(Landing::Authenticated), "/app");
        assert_eq!(config.landing().path(Landing::Unauthenticated), "/login");
    }
}
