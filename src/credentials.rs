//! Bearer-token issuance and stateless verification against the published key set.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use josekit::jwt::{self, JwtPayload};
use josekit::{JoseError, JoseHeader};
use serde::Serialize;
use serde_json::Value;

use crate::errors::{AccessError, AppError};
use crate::jwks::{verifier_for, KeyManager};
use crate::storage::Principal;

/// Verified claims of a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claims {
    pub subject: String,
    pub role: String,
    pub department: Option<String>,
    pub username: Option<String>,
    pub issuer: String,
    pub key_id: String,
    /// Unix seconds
    pub issued_at: Option<u64>,
    /// Unix seconds
    pub expires_at: u64,
}

impl Principal {
    /// A principal reconstructed from verified claims, without a store round trip.
    pub fn from_claims(claims: &Claims) -> Self {
        Principal {
            id: claims.subject.clone(),
            username: claims
                .username
                .clone()
                .unwrap_or_else(|| claims.subject.clone()),
            password_hash: None,
            role: claims.role.clone(),
            department: claims.department.clone(),
        }
    }
}

pub struct CredentialVerifier {
    keys: Arc<KeyManager>,
    issuer: String,
    leeway: Duration,
}

impl CredentialVerifier {
    pub fn new(keys: Arc<KeyManager>, issuer: impl Into<String>, leeway: Duration) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
            leeway,
        }
    }

    pub fn public_key_set(&self) -> Value {
        self.keys.public_key_set()
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AccessError> {
        self.verify_at(token, SystemTime::now())
    }

    pub fn verify_at(&self, token: &str, now: SystemTime) -> Result<Claims, AccessError> {
        let header = jwt::decode_header(token)
            .map_err(|e| AccessError::Unauthenticated(format!("malformed token: {e}")))?;
        let key_id = header
            .claim("kid")
            .and_then(Value::as_str)
            .ok_or_else(|| AccessError::CredentialInvalidSignature("token header has no kid".into()))?
            .to_string();

        let jwk = self.keys.published_key(&key_id).ok_or_else(|| {
            AccessError::CredentialInvalidSignature(format!("key `{key_id}` is not published"))
        })?;
        let verifier = verifier_for(&jwk)
            .map_err(|e| AccessError::CredentialInvalidSignature(format!("key `{key_id}` unusable: {e}")))?
            .ok_or_else(|| {
                AccessError::CredentialInvalidSignature(format!(
                    "key `{key_id}` does not use an RSASSA algorithm"
                ))
            })?;

        let (payload, _) = jwt::decode_with_verifier(token, verifier.as_ref()).map_err(|e| match e {
            JoseError::InvalidSignature(_) => {
                AccessError::CredentialInvalidSignature(format!("signature mismatch for key `{key_id}`"))
            }
            other => AccessError::CredentialInvalidSignature(other.to_string()),
        })?;

        let expires_at = payload
            .expires_at()
            .ok_or_else(|| AccessError::Unauthenticated("token has no exp claim".into()))?;
        if now > expires_at + self.leeway {
            return Err(AccessError::CredentialExpired(format!(
                "token expired at {}",
                unix_secs(expires_at)
            )));
        }
        if let Some(not_before) = payload.not_before() {
            if not_before > now + self.leeway {
                return Err(AccessError::Unauthenticated("token not yet valid".into()));
            }
        }
        let issuer = payload.issuer().unwrap_or_default();
        if issuer != self.issuer {
            return Err(AccessError::Unauthenticated(format!(
                "unexpected issuer `{issuer}`"
            )));
        }

        let subject = payload
            .subject()
            .ok_or_else(|| AccessError::Unauthenticated("token has no sub claim".into()))?;
        let role = string_claim(&payload, "role")
            .ok_or_else(|| AccessError::Unauthenticated("token has no role claim".into()))?;

        Ok(Claims {
            subject: subject.to_string(),
            role,
            department: string_claim(&payload, "department"),
            username: string_claim(&payload, "preferred_username"),
            issuer: issuer.to_string(),
            key_id,
            issued_at: payload.issued_at().map(unix_secs),
            expires_at: unix_secs(expires_at),
        })
    }
}

/// Mint a bearer token for `principal`, signed with the active key.
pub fn issue_token(
    keys: &KeyManager,
    issuer: &str,
    principal: &Principal,
    ttl: Duration,
) -> Result<String, AppError> {
    let now = SystemTime::now();
    let mut payload = JwtPayload::new();
    payload.set_issuer(issuer);
    payload.set_subject(&principal.id);
    payload.set_issued_at(&now);
    payload.set_expires_at(&(now + ttl));
    payload.set_claim("role", Some(Value::String(principal.role.clone())))?;
    payload.set_claim(
        "preferred_username",
        Some(Value::String(principal.username.clone())),
    )?;
    if let Some(department) = &principal.department {
        payload.set_claim("department", Some(Value::String(department.clone())))?;
    }
    keys.sign(&payload)
}

fn string_claim(payload: &JwtPayload, name: &str) -> Option<String> {
    payload
        .claim(name)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
