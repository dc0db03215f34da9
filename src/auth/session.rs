use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// An authenticated session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiry as unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub onboarding_completed: bool,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            refresh_token: None,
            expires_at: None,
            onboarding_completed: false,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at: u64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// True once `now` (unix seconds) has reached the expiry. Sessions
    /// without an expiry never expire locally.
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    pub fn is_expired(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.is_expired_at(now)
    }

    /// Token prefix safe to log.
    pub fn masked_token(&self) -> String {
        mask(&self.token)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.masked_token())
            .field("refresh_token", &self.refresh_token.as_deref().map(mask))
            .field("expires_at", &self.expires_at)
            .field("onboarding_completed", &self.onboarding_completed)
            .finish()
    }
}

pub(crate) fn mask(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{}***", prefix)
}

/// Body returned by the login, register and refresh endpoints.
///
/// Refresh responses may omit everything but the token; missing fields are
/// carried over from the previous session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    #[serde(alias = "accessToken", alias = "access_token")]
    pub token: String,
    #[serde(default, alias = "refresh_token")]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "expires_at")]
    pub expires_at: Option<u64>,
    #[serde(default, alias = "onboarding_completed")]
    pub onboarding_completed: Option<bool>,
}

impl AuthPayload {
    pub fn into_session(self, previous: Option<&Session>) -> Session {
        Session {
            token: self.token,
            refresh_token: self
                .refresh_token
                .or_else(|| previous.and_then(|p| p.refresh_token.clone())),
            expires_at: self.expires_at,
            onboarding_completed: self
                .onboarding_completed
                .or_else(|| previous.map(|p| p.onboarding_completed))
                .unwrap_or(false),
        }
    }
}
