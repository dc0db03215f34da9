//! Session ownership and bearer-token renewal.
//!
//! # Structure
//!
//! - `session` - The [`Session`] value and the auth endpoint payload
//! - `storage` - Pluggable key/value persistence ([`SessionStorage`])
//!
//! [`AuthCoordinator`] attaches the bearer header to outgoing attempts and
//! renews the token when an attempt is rejected with 401. Concurrent callers
//! that hit 401 while a refresh is running share that one refresh.

mod session;
mod storage;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use serde_json::{Value, json};

pub use session::{AuthPayload, Session};
#[cfg(test)]
pub use storage::MockSessionStorage;
pub use storage::{FileStorage, MemoryStorage, SessionStorage};

use crate::error::{ApiError, Error};
use crate::http::{Method, Transport, TransportFailure, TransportRequest, classify_status};

/// Storage key of the bearer token.
pub const TOKEN_KEY: &str = "auth_token";
/// Storage key of the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
/// Storage key of the full serialized session.
pub const SESSION_KEY: &str = "session";

const SESSION_EXPIRED: &str = "Session expired. Please log in again.";

type RefreshFuture = Shared<BoxFuture<'static, Result<Session, ApiError>>>;

/// At most one outstanding refresh, shared by every waiter.
///
/// `generation` identifies the refresh currently held in `in_flight`, so a
/// finishing refresh only clears its own entry.
#[derive(Default)]
struct RefreshSlot {
    generation: u64,
    in_flight: Option<RefreshFuture>,
}

impl RefreshSlot {
    fn release(&mut self, generation: u64) {
        if self.generation == generation {
            self.in_flight = None;
        }
    }
}

fn lock_slot(slot: &Mutex<RefreshSlot>) -> MutexGuard<'_, RefreshSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AuthCoordinator {
    transport: Arc<dyn Transport>,
    storage: Arc<dyn SessionStorage>,
    refresh_path: String,
    refresh_slot: Arc<Mutex<RefreshSlot>>,
}

impl AuthCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        storage: Arc<dyn SessionStorage>,
        refresh_path: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            storage,
            refresh_path: refresh_path.into(),
            refresh_slot: Arc::new(Mutex::new(RefreshSlot::default())),
        }
    }

    pub fn refresh_path(&self) -> &str {
        &self.refresh_path
    }

    /// Whether `path` targets the refresh endpoint, ignoring any query string.
    pub fn is_refresh_path(&self, path: &str) -> bool {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        path.trim_end_matches('/') == self.refresh_path.trim_end_matches('/')
    }

    pub fn session(&self) -> Result<Option<Session>, Error> {
        load_session(self.storage.as_ref()).map_err(Error::Storage)
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.session(), Ok(Some(_)))
    }

    pub fn store_session(&self, session: &Session) -> Result<(), Error> {
        persist_session(self.storage.as_ref(), session).map_err(Error::Storage)?;
        info!("Session established ({})", session.masked_token());
        Ok(())
    }

    /// Creates a session from a login or register response body.
    pub fn establish_session(&self, payload: Value) -> Result<Session, Error> {
        let payload: AuthPayload = serde_json::from_value(payload)?;
        let session = payload.into_session(None);
        self.store_session(&session)?;
        Ok(session)
    }

    /// Destroys the session, clearing both tokens.
    pub fn clear_session(&self) -> Result<(), Error> {
        destroy_session(self.storage.as_ref()).map_err(Error::Storage)?;
        info!("Session cleared");
        Ok(())
    }

    /// Sets `Authorization: Bearer <token>` when a session exists and returns
    /// the token that was attached.
    pub fn attach_auth_header(&self, headers: &mut BTreeMap<String, String>) -> Option<String> {
        match self.session() {
            Ok(Some(session)) => {
                headers.insert(
                    "Authorization".to_string(),
                    format!("Bearer {}", session.token),
                );
                Some(session.token)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Sending request without credentials: {}", e);
                None
            }
        }
    }

    /// Renews the session after an attempt sent with `sent_token` was rejected.
    ///
    /// If the stored token already differs from `sent_token`, another caller
    /// has refreshed in the meantime and no new refresh is started. Otherwise
    /// the caller joins the in-flight refresh or starts one. On failure the
    /// session is destroyed and every waiter receives the same
    /// [`ApiError::Authentication`].
    #[tracing::instrument(skip(self, sent_token))]
    pub async fn on_authentication_failure(&self, sent_token: Option<&str>) -> Result<(), ApiError> {
        if let Some(sent) = sent_token {
            if let Ok(Some(current)) = self.session() {
                if current.token != sent {
                    debug!("Session was already refreshed, replaying with the current token");
                    return Ok(());
                }
            }
        }

        let refresh = {
            let mut slot = lock_slot(&self.refresh_slot);
            match slot.in_flight.clone() {
                Some(in_flight) => {
                    debug!("Joining in-flight session refresh");
                    in_flight
                }
                None => {
                    slot.generation += 1;
                    let refresh = self.start_refresh(slot.generation);
                    slot.in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };

        refresh.await.map(|_| ())
    }

    /// Spawns the refresh so it runs to completion even if every waiter
    /// loses interest. The task frees its slot entry once it resolves, whether
    /// or not anyone is still awaiting it.
    fn start_refresh(&self, generation: u64) -> RefreshFuture {
        let refresh = refresh_session(
            Arc::clone(&self.transport),
            Arc::clone(&self.storage),
            self.refresh_path.clone(),
        );
        let slot = Arc::clone(&self.refresh_slot);
        let handle = tokio::spawn(async move {
            let outcome = refresh.await;
            lock_slot(&slot).release(generation);
            outcome
        });

        let slot = Arc::clone(&self.refresh_slot);
        handle
            .map(move |joined| {
                joined.unwrap_or_else(|e| {
                    lock_slot(&slot).release(generation);
                    Err(ApiError::authentication(format!(
                        "Session refresh task failed: {}",
                        e
                    )))
                })
            })
            .boxed()
            .shared()
    }
}

async fn refresh_session(
    transport: Arc<dyn Transport>,
    storage: Arc<dyn SessionStorage>,
    refresh_path: String,
) -> Result<Session, ApiError> {
    let previous = load_session(storage.as_ref()).unwrap_or_else(|e| {
        warn!("Failed to load session before refresh: {:#}", e);
        None
    });

    let Some(refresh_token) = previous.as_ref().and_then(|s| s.refresh_token.clone()) else {
        info!("No refresh token available, ending session");
        discard_session(storage.as_ref());
        return Err(ApiError::authentication(SESSION_EXPIRED));
    };

    info!("Refreshing session...");
    let request = TransportRequest::new(Method::Post, refresh_path)
        .with_header("Accept", "application/json")
        .with_body(Some(json!({ "refreshToken": refresh_token })));

    let outcome = match transport.send(request).await {
        Ok(response) => serde_json::from_str::<AuthPayload>(&response.body)
            .map_err(|e| ApiError::authentication(format!("Invalid refresh response: {}", e)))
            .and_then(|payload| {
                let session = payload.into_session(previous.as_ref());
                persist_session(storage.as_ref(), &session).map_err(|e| {
                    ApiError::authentication(format!("Failed to store refreshed session: {:#}", e))
                })?;
                Ok(session)
            }),
        Err(TransportFailure::Status {
            status: 401,
            status_text,
            body,
        }) => Err(classify_status(401, &status_text, &body)),
        Err(other) => Err(ApiError::authentication(format!(
            "Session refresh failed: {}",
            other
        ))),
    };

    match &outcome {
        Ok(session) => info!("Session refreshed ({})", session.masked_token()),
        Err(e) => {
            warn!("Session refresh failed: {}", e);
            discard_session(storage.as_ref());
        }
    }
    outcome
}

fn load_session(storage: &dyn SessionStorage) -> anyhow::Result<Option<Session>> {
    if let Some(raw) = storage.get_item(SESSION_KEY)? {
        match serde_json::from_str::<Session>(&raw) {
            Ok(session) => return Ok(Some(session)),
            Err(e) => warn!("Ignoring unreadable stored session: {}", e),
        }
    }

    let Some(token) = storage.get_item(TOKEN_KEY)? else {
        return Ok(None);
    };
    let mut session = Session::new(token);
    session.refresh_token = storage.get_item(REFRESH_TOKEN_KEY)?;
    Ok(Some(session))
}

fn persist_session(storage: &dyn SessionStorage, session: &Session) -> anyhow::Result<()> {
    storage.set_item(TOKEN_KEY, &session.token)?;
    match &session.refresh_token {
        Some(refresh_token) => storage.set_item(REFRESH_TOKEN_KEY, refresh_token)?,
        None => storage.remove_item(REFRESH_TOKEN_KEY)?,
    }
    storage.set_item(SESSION_KEY, &serde_json::to_string(session)?)?;
    Ok(())
}

fn destroy_session(storage: &dyn SessionStorage) -> anyhow::Result<()> {
    storage.remove_item(SESSION_KEY)?;
    storage.remove_item(TOKEN_KEY)?;
    storage.remove_item(REFRESH_TOKEN_KEY)?;
    Ok(())
}

fn discard_session(storage: &dyn SessionStorage) {
    if let Err(e) = destroy_session(storage) {
        warn!("Failed to clear session: {:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{MockTransport, TransportResponse};
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn coordinator(transport: MockTransport, storage: Arc<MemoryStorage>) -> AuthCoordinator {
        AuthCoordinator::new(Arc::new(transport), storage, "/auth/refresh")
    }

    fn logged_in_storage() -> Arc<MemoryStorage> {
        let storage = Arc::new(MemoryStorage::new());
        persist_session(
            storage.as_ref(),
            &Session::new("old-token").with_refresh_token("refresh-1"),
        )
        .unwrap();
        storage
    }

    #[test]
    fn test_attach_auth_header_with_session() {
        let auth = coordinator(MockTransport::new(), logged_in_storage());
        let mut headers = BTreeMap::new();
        let token = auth.attach_auth_header(&mut headers);
        assert_eq!(token.as_deref(), Some("old-token"));
        assert_eq!(headers["Authorization"], "Bearer old-token");
    }

    #[test]
    fn test_attach_auth_header_without_session() {
        let auth = coordinator(MockTransport::new(), Arc::new(MemoryStorage::new()));
        let mut headers = BTreeMap::new();
        assert_eq!(auth.attach_auth_header(&mut headers), None);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_attach_auth_header_storage_failure_sends_anonymously() {
        let mut storage = MockSessionStorage::new();
        storage
            .expect_get_item()
            .returning(|_| Err(anyhow::anyhow!("disk on fire")));
        let auth = AuthCoordinator::new(
            Arc::new(MockTransport::new()),
            Arc::new(storage),
            "/auth/refresh",
        );
        let mut headers = BTreeMap::new();
        assert_eq!(auth.attach_auth_header(&mut headers), None);
        assert!(auth.session().is_err());
    }

    #[test]
    fn test_is_refresh_path() {
        let auth = coordinator(MockTransport::new(), Arc::new(MemoryStorage::new()));
        assert!(auth.is_refresh_path("/auth/refresh"));
        assert!(auth.is_refresh_path("/auth/refresh/"));
        assert!(auth.is_refresh_path("/auth/refresh?source=web"));
        assert!(!auth.is_refresh_path("/auth/refresh-tokens"));
        assert!(!auth.is_refresh_path("/budgets"));
    }

    #[test]
    fn test_load_session_falls_back_to_token_keys() {
        let storage = MemoryStorage::new();
        storage.set_item(TOKEN_KEY, "t").unwrap();
        storage.set_item(REFRESH_TOKEN_KEY, "r").unwrap();
        storage.set_item(SESSION_KEY, "not json").unwrap();

        let session = load_session(&storage).unwrap().unwrap();
        assert_eq!(session.token, "t");
        assert_eq!(session.refresh_token.as_deref(), Some("r"));
    }

    #[test]
    fn test_establish_and_clear_session() {
        let storage = Arc::new(MemoryStorage::new());
        let auth = coordinator(MockTransport::new(), Arc::clone(&storage));

        let session = auth
            .establish_session(json!({
                "token": "t1",
                "refreshToken": "r1",
                "expiresAt": 1700000000u64,
                "onboardingCompleted": true
            }))
            .unwrap();
        assert!(session.onboarding_completed);
        assert!(auth.is_authenticated());
        assert_eq!(storage.get_item(TOKEN_KEY).unwrap().as_deref(), Some("t1"));

        auth.clear_session().unwrap();
        assert!(!auth.is_authenticated());
        assert_eq!(storage.get_item(REFRESH_TOKEN_KEY).unwrap(), None);
    }

    #[test]
    fn test_establish_session_rejects_payload_without_token() {
        let auth = coordinator(MockTransport::new(), Arc::new(MemoryStorage::new()));
        let err = auth.establish_session(json!({"user": "x"})).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_success_persists_new_token() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|req| {
                req.path == "/auth/refresh"
                    && req.method == Method::Post
                    && req.body == Some(json!({"refreshToken": "refresh-1"}))
                    && !req.headers.contains_key("Authorization")
            })
            .times(1)
            .returning(|_| {
                Ok(TransportResponse {
                    status: 200,
                    body: r#"{"token":"new-token"}"#.to_string(),
                })
            });

        let storage = logged_in_storage();
        let auth = coordinator(transport, Arc::clone(&storage));

        auth.on_authentication_failure(Some("old-token")).await.unwrap();

        let session = auth.session().unwrap().unwrap();
        assert_eq!(session.token, "new-token");
        // Refresh token carried over when the response omits it
        assert_eq!(session.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_refresh_failure_destroys_session() {
        let mut transport = MockTransport::new();
        transport.expect_send().times(1).returning(|_| {
            Err(TransportFailure::Status {
                status: 401,
                status_text: "Unauthorized".to_string(),
                body: r#"{"message":"Refresh token revoked","code":"TOKEN_REVOKED"}"#.to_string(),
            })
        });

        let storage = logged_in_storage();
        let auth = coordinator(transport, Arc::clone(&storage));

        let err = auth
            .on_authentication_failure(Some("old-token"))
            .await
            .unwrap_err();
        assert!(err.is_authentication());
        assert_eq!(err.code(), Some("TOKEN_REVOKED"));
        assert!(!auth.is_authenticated());
        assert_eq!(storage.get_item(REFRESH_TOKEN_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_refresh_server_error_is_authentication_failure() {
        let mut transport = MockTransport::new();
        transport.expect_send().times(1).returning(|_| {
            Err(TransportFailure::Status {
                status: 503,
                status_text: "Service Unavailable".to_string(),
                body: String::new(),
            })
        });

        let auth = coordinator(transport, logged_in_storage());
        let err = auth.on_authentication_failure(Some("old-token")).await.unwrap_err();
        assert!(err.is_authentication());
        assert!(err.message().contains("503"));
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_fails_without_calling_transport() {
        // No expectations: any transport call panics
        let storage = Arc::new(MemoryStorage::new());
        persist_session(storage.as_ref(), &Session::new("old-token")).unwrap();
        let auth = coordinator(MockTransport::new(), Arc::clone(&storage));

        let err = auth.on_authentication_failure(Some("old-token")).await.unwrap_err();
        assert!(err.is_authentication());
        assert_eq!(err.code(), Some("AUTH_REQUIRED"));
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn test_stale_token_skips_refresh() {
        // Stored token differs from the one that was rejected
        let auth = coordinator(MockTransport::new(), logged_in_storage());
        auth.on_authentication_failure(Some("older-token")).await.unwrap();
    }

    struct SlowRefreshTransport {
        calls: AtomicUsize,
        succeed: bool,
    }

    #[async_trait::async_trait]
    impl Transport for SlowRefreshTransport {
        async fn send(
            &self,
            _request: TransportRequest,
        ) -> Result<TransportResponse, TransportFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.succeed {
                Ok(TransportResponse {
                    status: 200,
                    body: r#"{"token":"new-token","refreshToken":"refresh-2"}"#.to_string(),
                })
            } else {
                Err(TransportFailure::Message("connection reset".to_string()))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_share_one_refresh() {
        let transport = Arc::new(SlowRefreshTransport {
            calls: AtomicUsize::new(0),
            succeed: true,
        });
        let auth = AuthCoordinator::new(transport.clone(), logged_in_storage(), "/auth/refresh");

        let results = futures_util::future::join_all(
            (0..5).map(|_| auth.on_authentication_failure(Some("old-token"))),
        )
        .await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(auth.session().unwrap().unwrap().token, "new-token");
        assert!(auth.refresh_slot.lock().unwrap().in_flight.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_all_fail_together() {
        let transport = Arc::new(SlowRefreshTransport {
            calls: AtomicUsize::new(0),
            succeed: false,
        });
        let auth = AuthCoordinator::new(transport.clone(), logged_in_storage(), "/auth/refresh");

        let results = futures_util::future::join_all(
            (0..4).map(|_| auth.on_authentication_failure(Some("old-token"))),
        )
        .await;

        assert!(results
            .iter()
            .all(|r| r.as_ref().is_err_and(ApiError::is_authentication)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(!auth.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_is_cleared_so_later_refresh_runs_again() {
        let transport = Arc::new(SlowRefreshTransport {
            calls: AtomicUsize::new(0),
            succeed: true,
        });
        let storage = logged_in_storage();
        let auth = AuthCoordinator::new(transport.clone(), storage.clone(), "/auth/refresh");

        auth.on_authentication_failure(Some("old-token")).await.unwrap();
        auth.on_authentication_failure(Some("new-token")).await.unwrap();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_refresh_still_completes() {
        let transport = Arc::new(SlowRefreshTransport {
            calls: AtomicUsize::new(0),
            succeed: true,
        });
        let storage = logged_in_storage();
        let auth = AuthCoordinator::new(transport.clone(), storage.clone(), "/auth/refresh");

        // Poll once to start the refresh, then drop the only waiter
        assert!(
            auth.on_authentication_failure(Some("old-token"))
                .now_or_never()
                .is_none()
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        let session = auth.session().unwrap().unwrap();
        assert_eq!(session.token, "new-token");
        assert_eq!(session.refresh_token.as_deref(), Some("refresh-2"));
        assert_eq!(storage.get_item(TOKEN_KEY).unwrap().as_deref(), Some("new-token"));
        assert!(auth.refresh_slot.lock().unwrap().in_flight.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_failed_refresh_does_not_block_next_login() {
        let transport = Arc::new(SlowRefreshTransport {
            calls: AtomicUsize::new(0),
            succeed: false,
        });
        let auth = AuthCoordinator::new(transport.clone(), logged_in_storage(), "/auth/refresh");

        assert!(
            auth.on_authentication_failure(Some("old-token"))
                .now_or_never()
                .is_none()
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!auth.is_authenticated());
        assert!(auth.refresh_slot.lock().unwrap().in_flight.is_none());

        auth.store_session(&Session::new("token-2").with_refresh_token("refresh-2"))
            .unwrap();
        let err = auth
            .on_authentication_failure(Some("token-2"))
            .await
            .unwrap_err();

        assert!(err.is_authentication());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_request_targets_configured_path() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .with(eq(TransportRequest::new(Method::Post, "/v2/token")
                .with_header("Accept", "application/json")
                .with_body(Some(json!({"refreshToken": "refresh-1"})))))
            .times(1)
            .returning(|_| {
                Ok(TransportResponse {
                    status: 200,
                    body: r#"{"accessToken":"t2"}"#.to_string(),
                })
            });
        let auth = AuthCoordinator::new(Arc::new(transport), logged_in_storage(), "/v2/token");
        auth.on_authentication_failure(None).await.unwrap();
        assert_eq!(auth.session().unwrap().unwrap().token, "t2");
    }
}
