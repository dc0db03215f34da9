//! Request orchestrator: the public façade every feature calls.
//!
//! One logical request may span several transport attempts. Each attempt
//! carries the current bearer token; failures are classified, retried with
//! exponential backoff while the budget lasts, and a first-attempt 401 earns
//! exactly one shared token refresh followed by a replay with a fresh budget.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::auth::{AuthCoordinator, FileStorage, Session, SessionStorage};
use crate::config::ClientConfig;
use crate::error::{ApiError, Error, Result};
use crate::http::{
    Method, ReqwestTransport, RetryPolicy, Transport, TransportRequest, TransportResponse, classify,
};

pub struct ApiClient {
    transport: Arc<dyn Transport>,
    auth: AuthCoordinator,
    policy: RetryPolicy,
    login_path: String,
    register_path: String,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        storage: Arc<dyn SessionStorage>,
        config: &ClientConfig,
    ) -> Self {
        let auth = AuthCoordinator::new(Arc::clone(&transport), storage, &config.refresh_path);
        Self {
            transport,
            auth,
            policy: config.retry.clone(),
            login_path: config.login_path.clone(),
            register_path: config.register_path.clone(),
        }
    }

    /// Builds a client with the reqwest transport and file-backed sessions.
    pub fn from_config(config: &ClientConfig) -> anyhow::Result<Self> {
        let transport =
            ReqwestTransport::build(&config.base_url, &config.user_agent, config.timeout)?;
        let storage = FileStorage::new(config.resolve_session_dir()?);
        Ok(Self::new(Arc::new(transport), Arc::new(storage), config))
    }

    pub fn auth(&self) -> &AuthCoordinator {
        &self.auth
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Replaces the retry budget, so tests can avoid real backoff delays.
    pub fn override_max_retries(&mut self, max_retries: usize) {
        debug!(
            "Overriding max retries: {} -> {}",
            self.policy.max_retries, max_retries
        );
        self.policy.max_retries = max_retries;
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.execute(Method::Get, path, None, true).await
    }

    pub async fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        self.execute(Method::Post, path, body, true).await
    }

    pub async fn put(&self, path: &str, body: Option<Value>) -> Result<Value> {
        self.execute(Method::Put, path, body, true).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.execute(Method::Delete, path, None, true).await
    }

    /// GET and deserialize the payload into `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self.get(path).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body).map_err(Error::Encode)?;
        let value = self.post(path, Some(body)).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body).map_err(Error::Encode)?;
        let value = self.put(path, Some(body)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Logs in and persists the returned session.
    ///
    /// Sent without credentials; a 401 here means bad credentials and never
    /// triggers a token refresh.
    #[tracing::instrument(skip(self, credentials))]
    pub async fn login<B: Serialize + ?Sized>(&self, credentials: &B) -> Result<Session> {
        let body = serde_json::to_value(credentials).map_err(Error::Encode)?;
        let payload = self
            .execute(Method::Post, &self.login_path, Some(body), false)
            .await?;
        self.auth.establish_session(payload)
    }

    /// Registers an account and persists the returned session.
    #[tracing::instrument(skip(self, payload))]
    pub async fn register<B: Serialize + ?Sized>(&self, payload: &B) -> Result<Session> {
        let body = serde_json::to_value(payload).map_err(Error::Encode)?;
        let payload = self
            .execute(Method::Post, &self.register_path, Some(body), false)
            .await?;
        self.auth.establish_session(payload)
    }

    pub fn logout(&self) -> Result<()> {
        self.auth.clear_session()
    }

    /// Runs one logical request to completion.
    #[tracing::instrument(skip(self, body))]
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        authenticated: bool,
    ) -> Result<Value> {
        let total = self.policy.max_retries + 1;
        let mut attempt = 0usize;
        let mut recovered = false;

        loop {
            let mut headers = BTreeMap::new();
            headers.insert("Accept".to_string(), "application/json".to_string());
            let sent_token = if authenticated {
                self.auth.attach_auth_header(&mut headers)
            } else {
                None
            };

            let request = TransportRequest {
                method,
                path: path.to_string(),
                headers,
                body: body.clone(),
            };

            debug!("{} {}: attempt {}/{}", method, path, attempt + 1, total);

            let failure = match self.transport.send(request).await {
                Ok(response) => return decode_payload(response),
                Err(failure) => failure,
            };
            let error = classify(failure, &self.policy);

            if error.as_api().is_some_and(ApiError::is_authentication) {
                let may_recover =
                    authenticated && attempt == 0 && !recovered && !self.auth.is_refresh_path(path);
                if !may_recover {
                    debug!("{} {}: authentication failed: {}", method, path, error);
                    return Err(error);
                }

                debug!("{} {}: authentication failed, renewing session", method, path);
                self.auth.on_authentication_failure(sent_token.as_deref()).await?;
                recovered = true;
                attempt = 0;
                continue;
            }

            if self.policy.should_retry(&error, attempt) {
                let delay = self.policy.delay(attempt as u32);
                warn!(
                    "{} {}: attempt {}/{} failed ({}), retrying in {}ms...",
                    method,
                    path,
                    attempt + 1,
                    total,
                    error,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            if attempt > 0 {
                warn!(
                    "{} {}: giving up after {} attempts: {}",
                    method,
                    path,
                    attempt + 1,
                    error
                );
            } else {
                debug!("{} {}: non-retryable error: {}", method, path, error);
            }
            return Err(error);
        }
    }
}

/// Decodes a success body. 204 and empty bodies become an empty object.
fn decode_payload(response: TransportResponse) -> Result<Value> {
    if response.status == 204 || response.body.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    Ok(serde_json::from_str(&response.body)?)
}
