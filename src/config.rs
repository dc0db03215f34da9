use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::http::RetryPolicy;

pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";
pub const DEFAULT_LOGIN_PATH: &str = "/auth/login";
pub const DEFAULT_REGISTER_PATH: &str = "/auth/register";
pub const DEFAULT_USER_AGENT: &str = "ledgerlink";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Settings owned by one [`crate::ApiClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub refresh_path: String,
    pub login_path: String,
    pub register_path: String,
    pub user_agent: String,
    /// Transport-level timeout; expiry surfaces as a retryable "timeout" failure.
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    /// Where sessions are persisted. Defaults to the user config directory.
    pub session_dir: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            register_path: DEFAULT_REGISTER_PATH.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            retry: RetryPolicy::default(),
            session_dir: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    pub fn with_session_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_dir = Some(dir.into());
        self
    }

    /// The configured session directory, or `<config dir>/ledgerlink`.
    pub fn resolve_session_dir(&self) -> Result<PathBuf> {
        match &self.session_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::config_dir()
                .map(|dir| dir.join("ledgerlink"))
                .ok_or_else(|| anyhow!("Could not determine config directory; set --session-dir")),
        }
    }
}
