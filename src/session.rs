use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::errors::AccessError;
use crate::settings::Settings;
use crate::storage::{bounded, now_millis, random_token, BackingStore, Principal, Session, StoreError};

pub const SESSION_COOKIE_NAME: &str = "portcullis_session";

const LOCK_STRIPES: usize = 64;
const HANDLE_BYTES: usize = 32;
const CREATE_ATTEMPTS: usize = 4;

/// A session together with the principal it belongs to.
#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub principal: Principal,
    pub session: Session,
}

/// Server-side sessions over the backing store.
///
/// Read-modify-write on one handle is serialized by a striped lock keyed by the
/// handle's hash, so concurrent lookups of the same session never lose an update
/// to `last_accessed_at`.
pub struct SessionStore {
    store: Arc<dyn BackingStore>,
    timeout: Duration,
    locks: Vec<Mutex<()>>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn BackingStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, handle: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        handle.hash(&mut hasher);
        &self.locks[(hasher.finish() as usize) % self.locks.len()]
    }

    pub async fn create(&self, principal_id: &str, payload: Value) -> Result<Session, AccessError> {
        for _ in 0..CREATE_ATTEMPTS {
            let handle = random_token(HANDLE_BYTES);
            let _guard = self.stripe(&handle).lock().await;

            match bounded(self.timeout, self.store.find_session_by_handle(&handle)).await {
                Ok(_) => {
                    tracing::warn!("Session handle collision, regenerating");
                    continue;
                }
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }

            let now = now_millis();
            let session = Session {
                handle,
                principal_id: principal_id.to_string(),
                payload,
                created_at: now,
                last_accessed_at: now,
            };
            bounded(self.timeout, self.store.upsert_session(&session)).await?;
            tracing::debug!(principal = principal_id, "Created session");
            return Ok(session);
        }
        Err(AccessError::BackingStoreUnavailable(
            "could not allocate a unique session handle".into(),
        ))
    }

    /// Resolve a handle and mark the session accessed. `last_accessed_at` strictly
    /// increases across lookups of the same handle.
    pub async fn lookup(&self, handle: &str) -> Result<ResolvedSession, AccessError> {
        let _guard = self.stripe(handle).lock().await;

        let mut session = bounded(self.timeout, self.store.find_session_by_handle(handle))
            .await
            .map_err(|e| missing_as_unauthenticated(e, "unknown or expired session"))?;
        let principal = bounded(
            self.timeout,
            self.store.find_principal_by_id(&session.principal_id),
        )
        .await
        .map_err(|e| missing_as_unauthenticated(e, "session principal no longer exists"))?;

        session.last_accessed_at = now_millis().max(session.last_accessed_at + 1);
        bounded(self.timeout, self.store.upsert_session(&session)).await?;

        Ok(ResolvedSession { principal, session })
    }

    /// Replace the session payload.
    pub async fn touch(&self, handle: &str, payload: Value) -> Result<Session, AccessError> {
        let _guard = self.stripe(handle).lock().await;

        let mut session = bounded(self.timeout, self.store.find_session_by_handle(handle))
            .await
            .map_err(|e| missing_as_unauthenticated(e, "unknown or expired session"))?;
        session.payload = payload;
        session.last_accessed_at = now_millis().max(session.last_accessed_at + 1);
        bounded(self.timeout, self.store.upsert_session(&session)).await?;
        Ok(session)
    }

    pub async fn destroy(&self, handle: &str) -> Result<(), AccessError> {
        let _guard = self.stripe(handle).lock().await;
        bounded(self.timeout, self.store.delete_session(handle)).await?;
        tracing::debug!("Destroyed session");
        Ok(())
    }

    /// Remove sessions idle for longer than `idle_timeout`. Returns how many were removed.
    pub async fn sweep_idle(&self, idle_timeout: Duration) -> Result<u64, AccessError> {
        let idle_ms = i64::try_from(idle_timeout.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(idle_ms);
        let removed = bounded(self.timeout, self.store.delete_sessions_idle_since(cutoff)).await?;
        Ok(removed)
    }
}

fn missing_as_unauthenticated(err: StoreError, reason: &str) -> AccessError {
    match err {
        StoreError::NotFound { .. } => AccessError::Unauthenticated(reason.to_string()),
        other => other.into(),
    }
}

#[derive(Clone, Debug)]
pub struct SessionCookie {
    pub handle: String,
}

impl SessionCookie {
    pub fn new(handle: String) -> Self {
        Self { handle }
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let cookie_header = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;

        for cookie in cookie_header.split(';') {
            let cookie = cookie.trim();
            if let Some(value) = cookie
                .strip_prefix(SESSION_COOKIE_NAME)
                .and_then(|s| s.strip_prefix('='))
                .filter(|v| !v.is_empty())
            {
                return Some(Self {
                    handle: value.to_string(),
                });
            }
        }
        None
    }

    pub fn to_cookie_header(&self, settings: &Settings) -> String {
        let secure = settings.issuer().starts_with("https://");

        format!(
            "{}={}; HttpOnly; {}SameSite=Lax; Path=/; Max-Age={}",
            SESSION_COOKIE_NAME,
            self.handle,
            if secure { "Secure; " } else { "" },
            settings.sessions.idle_timeout_secs
        )
    }

    pub fn delete_cookie_header() -> String {
        format!(
            "{}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0",
            SESSION_COOKIE_NAME
        )
    }
}
