use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

use crate::authz::errors::AuthzError;
use crate::storage::StoreError;

/// Bootstrap and infrastructure failures. Surfaces through `main` as a miette report.
#[derive(Debug, Error, Diagnostic)]
pub enum AppError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(portcullis::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(portcullis::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(portcullis::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(portcullis::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("JOSE error: {0}")]
    #[diagnostic(code(portcullis::jose))]
    Jose(String),

    #[error("{0}")]
    #[diagnostic(code(portcullis::other))]
    Other(String),
}

impl From<josekit::JoseError> for AppError {
    fn from(value: josekit::JoseError) -> Self {
        AppError::Jose(value.to_string())
    }
}

/// Per-request failure taxonomy. Every variant maps to a distinct status code or
/// machine-readable `code` so callers can tell "log in again" from "back off".
#[derive(Debug, Error, Diagnostic)]
pub enum AccessError {
    #[error("not found: {0}")]
    #[diagnostic(code(portcullis::not_found))]
    NotFound(String),

    #[error("authentication required: {0}")]
    #[diagnostic(code(portcullis::unauthenticated))]
    Unauthenticated(String),

    #[error("credential expired: {0}")]
    #[diagnostic(
        code(portcullis::credential_expired),
        help("Obtain a fresh token by logging in again")
    )]
    CredentialExpired(String),

    #[error("credential signature rejected: {0}")]
    #[diagnostic(
        code(portcullis::credential_invalid_signature),
        help("The token was not signed by a currently published key")
    )]
    CredentialInvalidSignature(String),

    #[error("not authorized: {0}")]
    #[diagnostic(code(portcullis::unauthorized))]
    Unauthorized(String),

    #[error("validation failed: {0}")]
    #[diagnostic(code(portcullis::validation))]
    Validation(String),

    #[error("backing store unavailable: {0}")]
    #[diagnostic(code(portcullis::backing_store_unavailable))]
    BackingStoreUnavailable(String),

    #[error("rate limit exceeded")]
    #[diagnostic(code(portcullis::rate_limited))]
    RateLimited { retry_after_secs: u64, details: String },
}

impl AccessError {
    pub fn status(&self) -> StatusCode {
        match self {
            AccessError::NotFound(_) => StatusCode::NOT_FOUND,
            AccessError::Unauthenticated(_)
            | AccessError::CredentialExpired(_)
            | AccessError::CredentialInvalidSignature(_) => StatusCode::UNAUTHORIZED,
            AccessError::Unauthorized(_) => StatusCode::FORBIDDEN,
            AccessError::Validation(_) => StatusCode::BAD_REQUEST,
            AccessError::BackingStoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AccessError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Stable snake_case identifier rendered in the `code` field of error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AccessError::NotFound(_) => "not_found",
            AccessError::Unauthenticated(_) => "unauthenticated",
            AccessError::CredentialExpired(_) => "credential_expired",
            AccessError::CredentialInvalidSignature(_) => "credential_invalid_signature",
            AccessError::Unauthorized(_) => "unauthorized",
            AccessError::Validation(_) => "validation_error",
            AccessError::BackingStoreUnavailable(_) => "backing_store_unavailable",
            AccessError::RateLimited { .. } => "rate_limited",
        }
    }

    fn details(&self) -> String {
        match self {
            AccessError::NotFound(d)
            | AccessError::Unauthenticated(d)
            | AccessError::CredentialExpired(d)
            | AccessError::CredentialInvalidSignature(d)
            | AccessError::Unauthorized(d)
            | AccessError::Validation(d)
            | AccessError::BackingStoreUnavailable(d) => d.clone(),
            AccessError::RateLimited { details, .. } => details.clone(),
        }
    }

    fn message(&self) -> &'static str {
        match self {
            AccessError::NotFound(_) => "resource not found",
            AccessError::Unauthenticated(_) => "authentication required",
            AccessError::CredentialExpired(_) => "credential expired",
            AccessError::CredentialInvalidSignature(_) => "credential signature invalid",
            AccessError::Unauthorized(_) => "operation not permitted",
            AccessError::Validation(_) => "validation failed",
            AccessError::BackingStoreUnavailable(_) => "backing store unavailable",
            AccessError::RateLimited { .. } => "rate limit exceeded",
        }
    }
}

impl From<StoreError> for AccessError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound { .. } => AccessError::NotFound(value.to_string()),
            StoreError::Unavailable(reason) => AccessError::BackingStoreUnavailable(reason),
        }
    }
}

impl From<AuthzError> for AccessError {
    fn from(value: AuthzError) -> Self {
        AccessError::Validation(value.to_string())
    }
}

impl IntoResponse for AccessError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "status": status.as_u16(),
            "code": self.kind(),
            "message": self.message(),
            "details": self.details(),
        });
        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();

        match &self {
            AccessError::RateLimited {
                retry_after_secs, ..
            } => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
            }
            AccessError::CredentialExpired(_) => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static(
                        "Bearer error=\"invalid_token\", error_description=\"token expired\"",
                    ),
                );
            }
            AccessError::CredentialInvalidSignature(_) => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static(
                        "Bearer error=\"invalid_token\", error_description=\"signature rejected\"",
                    ),
                );
            }
            AccessError::Unauthenticated(_) => {
                headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            _ => {}
        }

        response
    }
}
