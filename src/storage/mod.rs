//! Backing-store collaborator.
//!
//! The core only talks to persistence through [`BackingStore`]. Two implementations
//! ship with the crate: [`SeaOrmStore`] (SQLite / PostgreSQL) and [`MemoryStore`]
//! (selected with `database.url = "memory://"`, also used throughout the tests).

pub mod memory;
pub mod sea;

use crate::authz::types::Permission;
use crate::errors::AppError;
use crate::settings::Database as DbCfg;
use async_trait::async_trait;
use base64ct::Encoding;
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sea::SeaOrmStore;

pub const MEMORY_URL: &str = "memory://";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Opaque subject; records reference their owner by this value
    pub id: String,
    pub username: String,
    /// Argon2 PHC string; `None` for token-only principals
    #[serde(skip_serializing, default)]
    pub password_hash: Option<String>,
    /// Exactly one role, by name
    pub role: String,
    pub department: Option<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>, username: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            password_hash: None,
            role: role.into(),
            department: None,
        }
    }

    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    pub fn with_password_hash(mut self, hash: impl Into<String>) -> Self {
        self.password_hash = Some(hash.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Unique; doubles as the role id
    pub name: String,
    /// Higher is more privileged. Only ever compared, never used as identity.
    pub level: i32,
    pub description: String,
}

impl Role {
    pub fn new(name: impl Into<String>, level: i32) -> Self {
        Self {
            name: name.into(),
            level,
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub handle: String,
    pub principal_id: String,
    pub payload: Value,
    /// Unix milliseconds
    pub created_at: i64,
    /// Unix milliseconds, strictly advancing on every lookup
    pub last_accessed_at: i64,
}

/// A stored permission row with every role it is assigned to.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignedPermission {
    pub permission: Permission,
    /// Role names, sorted
    pub roles: Vec<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} `{key}` not found")]
    NotFound { entity: &'static str, key: String },

    #[error("backing store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            key: key.into(),
        }
    }
}

impl From<sea_orm::DbErr> for StoreError {
    fn from(value: sea_orm::DbErr) -> Self {
        match value {
            sea_orm::DbErr::RecordNotFound(key) => StoreError::not_found("record", key),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Persistence operations the core depends on. Every call is fallible and may be
/// slow; implementations report expiry of their own time budget as `Unavailable`.
#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn find_principal_by_username(&self, username: &str) -> Result<Principal, StoreError>;
    async fn find_principal_by_id(&self, id: &str) -> Result<Principal, StoreError>;
    async fn upsert_principal(&self, principal: &Principal) -> Result<(), StoreError>;

    async fn find_role_by_id(&self, name: &str) -> Result<Role, StoreError>;
    async fn list_roles(&self) -> Result<Vec<Role>, StoreError>;
    async fn upsert_role(&self, role: &Role) -> Result<(), StoreError>;

    async fn find_permissions_by_role(&self, role: &str) -> Result<Vec<Permission>, StoreError>;
    /// Permission rows are shared by id across roles.
    async fn find_permission(&self, permission_id: &str) -> Result<AssignedPermission, StoreError>;
    /// Stores the permission and associates it with `role`.
    async fn upsert_permission(&self, role: &str, permission: &Permission)
        -> Result<(), StoreError>;
    /// Removes the association between `role` and the permission.
    async fn delete_permission(&self, role: &str, permission_id: &str) -> Result<(), StoreError>;

    async fn find_session_by_handle(&self, handle: &str) -> Result<Session, StoreError>;
    async fn upsert_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn delete_session(&self, handle: &str) -> Result<(), StoreError>;
    /// Deletes every session last accessed before `cutoff` (unix millis).
    async fn delete_sessions_idle_since(&self, cutoff: i64) -> Result<u64, StoreError>;
}

pub async fn connect(cfg: &DbCfg) -> Result<Arc<dyn BackingStore>, AppError> {
    if cfg.url == MEMORY_URL {
        tracing::warn!("Using the in-memory backing store; state is lost on restart");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = SeaOrmStore::connect(cfg).await?;
    Ok(Arc::new(store))
}

/// Runs a store call under a time budget, surfacing expiry as `Unavailable`.
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(format!(
            "timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

pub fn hash_password(password: &str) -> Result<String, AppError> {
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::{Argon2, PasswordHasher};

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AppError::Other(format!("Password hashing failed: {}", e)))
}

/// False for principals without a password hash and for unparseable hashes.
pub fn verify_password(principal: &Principal, password: &str) -> bool {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};

    let Some(stored) = principal.password_hash.as_deref() else {
        return false;
    };
    let Ok(parsed_hash) = PasswordHash::new(stored) else {
        tracing::warn!(principal = %principal.id, "Stored password hash is not a valid PHC string");
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

pub(crate) fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
