//! HTTP boundary: shared state, identity resolution, and the session/login routes.
//! Authorization routes live in [`crate::authz::web`].
use crate::admission::{admission_gate, AdmissionController};
use crate::authz::{AuthorizationEngine, EngineOptions, Registry, RoleInheritance};
use crate::credentials::{issue_token, Claims, CredentialVerifier};
use crate::errors::AccessError;
use crate::jwks::KeyManager;
use crate::session::{SessionCookie, SessionStore};
use crate::settings::Settings;
use crate::storage::{self, BackingStore, Principal, Session, StoreError};
use axum::body::Body;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn BackingStore>,
    pub registry: Arc<Registry>,
    pub engine: Arc<AuthorizationEngine>,
    pub sessions: Arc<SessionStore>,
    pub keys: Arc<KeyManager>,
    pub verifier: Arc<CredentialVerifier>,
    pub admission: Arc<AdmissionController>,
}

impl AppState {
    /// Wire every component from settings. Loads the registry snapshot from `store`.
    pub async fn build(
        settings: Settings,
        store: Arc<dyn BackingStore>,
        keys: Arc<KeyManager>,
    ) -> Result<Self, AccessError> {
        let inheritance = if settings.authz.inherit_lower_roles {
            RoleInheritance::LowerLevels
        } else {
            RoleInheritance::None
        };
        let registry = Arc::new(Registry::load(store.clone(), inheritance).await?);
        let engine = Arc::new(AuthorizationEngine::new(
            registry.clone(),
            EngineOptions {
                malformed_fields: settings.authz.malformed_fields,
                combination: settings.authz.field_combination,
            },
        ));
        let sessions = Arc::new(SessionStore::new(
            store.clone(),
            Duration::from_millis(settings.database.timeout_ms),
        ));
        let verifier = Arc::new(CredentialVerifier::new(
            keys.clone(),
            settings.issuer(),
            Duration::from_secs(settings.keys.leeway_secs),
        ));
        let admission = Arc::new(AdmissionController::new(&settings.rate_limit));

        Ok(Self {
            settings: Arc::new(settings),
            store,
            registry,
            engine,
            sessions,
            keys,
            verifier,
            admission,
        })
    }
}

/// The authenticated caller: a bearer token, else the session cookie.
#[derive(Debug, Clone)]
pub struct Identity {
    pub principal: Principal,
    /// Present when resolved from a cookie session
    pub session: Option<Session>,
    /// Present when resolved from a bearer token
    pub claims: Option<Claims>,
}

impl FromRequestParts<AppState> for Identity {
    type Rejection = AccessError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if let Some(token) = bearer_token(&parts.headers) {
            let claims = state.verifier.verify(token)?;
            return Ok(Identity {
                principal: Principal::from_claims(&claims),
                session: None,
                claims: Some(claims),
            });
        }

        if let Some(cookie) = SessionCookie::from_headers(&parts.headers) {
            let resolved = state.sessions.lookup(&cookie.handle).await?;
            return Ok(Identity {
                principal: resolved.principal,
                session: Some(resolved.session),
                claims: None,
            });
        }

        Err(AccessError::Unauthenticated(
            "no bearer token or session cookie".into(),
        ))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

// Security headers middleware
async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    // JSON only; nothing here should ever load as a document
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
    headers
        .entry(header::CACHE_CONTROL)
        .or_insert(HeaderValue::from_static("no-store"));

    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/.well-known/jwks.json", get(jwks_handler))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/v1/me", get(me))
        .route("/v1/session", put(touch_session))
        .merge(crate::authz::web::router())
        .layer(middleware::from_fn_with_state(
            state.admission.clone(),
            admission_gate,
        ))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState) -> miette::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    if !state.settings.rate_limit.enabled {
        tracing::warn!("Admission control is disabled");
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    tracing::info!(%addr, issuer = %state.settings.issuer(), "Public API listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .into_diagnostic()?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn jwks_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut response = Json(state.verifier.public_key_set()).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=300"),
    );
    response
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Response, AccessError> {
    let rejected = || AccessError::Unauthenticated("invalid username or password".into());

    let principal = match state.store.find_principal_by_username(&req.username).await {
        Ok(principal) => principal,
        Err(StoreError::NotFound { .. }) => {
            tracing::info!(username = %req.username, "Login for unknown principal");
            return Err(rejected());
        }
        Err(e) => return Err(e.into()),
    };
    if !storage::verify_password(&principal, &req.password) {
        tracing::info!(principal = %principal.id, "Login with wrong password");
        return Err(rejected());
    }

    let session = state
        .sessions
        .create(
            &principal.id,
            json!({ "login_at": chrono::Utc::now().to_rfc3339() }),
        )
        .await?;

    let ttl = Duration::from_secs(state.settings.keys.token_ttl_secs);
    let access_token = match issue_token(&state.keys, &state.settings.issuer(), &principal, ttl) {
        Ok(token) => token,
        Err(e) => {
            tracing::error!(error = %e, "Failed to sign access token");
            return Ok(internal_error("failed to sign access token"));
        }
    };
    tracing::info!(principal = %principal.id, role = %principal.role, "Login succeeded");

    let cookie = SessionCookie::new(session.handle).to_cookie_header(&state.settings);
    let body = json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": state.settings.keys.token_ttl_secs,
    });
    Ok(([(header::SET_COOKIE, cookie)], Json(body)).into_response())
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, AccessError> {
    if let Some(cookie) = SessionCookie::from_headers(&headers) {
        match state.sessions.destroy(&cookie.handle).await {
            Ok(()) | Err(AccessError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok((
        StatusCode::NO_CONTENT,
        [(header::SET_COOKIE, SessionCookie::delete_cookie_header())],
    )
        .into_response())
}

async fn me(identity: Identity) -> Json<Value> {
    let via = if identity.claims.is_some() {
        "bearer"
    } else {
        "session"
    };
    Json(json!({
        "principal": identity.principal,
        "authenticated_via": via,
        "session": identity.session.map(|s| json!({
            "payload": s.payload,
            "created_at": s.created_at,
            "last_accessed_at": s.last_accessed_at,
        })),
    }))
}

async fn touch_session(
    State(state): State<AppState>,
    identity: Identity,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, AccessError> {
    let Some(session) = identity.session else {
        return Err(AccessError::Validation(
            "session payloads require a cookie session".into(),
        ));
    };
    let session = state.sessions.touch(&session.handle, payload).await?;
    Ok(Json(json!({
        "payload": session.payload,
        "last_accessed_at": session.last_accessed_at,
    })))
}

fn internal_error(details: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "status": 500,
            "code": "internal_error",
            "message": "internal error",
            "details": details,
        })),
    )
        .into_response()
}
