use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::authz::filter;
use crate::authz::types::{
    DecideRequest, DecideResponse, FieldPermissions, GrantRequest, Operation, Permission,
};
use crate::errors::AccessError;
use crate::web::{AppState, Identity};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/decide", post(handle_decide))
        .route(
            "/v1/roles/{role}/permissions",
            post(handle_create_grant).get(handle_list_grants),
        )
        .route(
            "/v1/roles/{role}/permissions/{id}",
            delete(handle_revoke_grant),
        )
}

async fn handle_decide(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<DecideRequest>,
) -> Result<Json<DecideResponse>, AccessError> {
    let decision = state.engine.authorize(
        &identity.principal,
        &req.resource_type,
        req.operation,
        req.record.as_ref(),
    )?;

    let mut record = req.record;
    if let Some(record) = record.as_mut() {
        match req.operation {
            // a write may not carry fields the caller cannot see
            Operation::Write | Operation::Create => filter::check_write_payload(&decision, record)?,
            Operation::Read | Operation::Delete => {
                filter::redact(&decision, record);
            }
        }
    }
    let redacted_fields = decision
        .masked_fields()
        .map(|fields| fields.iter().cloned().collect())
        .unwrap_or_default();

    Ok(Json(DecideResponse {
        decision: decision.as_str(),
        redacted_fields,
        record,
    }))
}

/// The caller must hold `operation` on the grant-admin resource and rank at or
/// above the target role.
fn authorize_grant_admin(
    state: &AppState,
    identity: &Identity,
    role: &str,
    operation: Operation,
) -> Result<(), AccessError> {
    state.engine.authorize(
        &identity.principal,
        &state.settings.authz.grant_admin_resource,
        operation,
        None,
    )?;
    if !state
        .registry
        .can_act_on_behalf(&identity.principal.role, role)?
    {
        return Err(AccessError::Unauthorized(format!(
            "role `{}` cannot manage grants of role `{role}`",
            identity.principal.role
        )));
    }
    Ok(())
}

async fn handle_create_grant(
    State(state): State<AppState>,
    identity: Identity,
    Path(role): Path<String>,
    Json(req): Json<GrantRequest>,
) -> Result<impl IntoResponse, AccessError> {
    authorize_grant_admin(&state, &identity, &role, Operation::Create)?;

    let fields = FieldPermissions::from_value(&req.field_permissions)?;
    let permission =
        Permission::new(req.id, req.resource_type, req.operation, req.scope).with_fields(fields);
    state.registry.create_grant(&role, &permission).await?;

    Ok((StatusCode::CREATED, Json(grant_json(&permission))))
}

async fn handle_list_grants(
    State(state): State<AppState>,
    identity: Identity,
    Path(role): Path<String>,
) -> Result<Json<Value>, AccessError> {
    authorize_grant_admin(&state, &identity, &role, Operation::Read)?;
    let grants: Vec<Value> = state
        .registry
        .grants_for_role(&role)?
        .iter()
        .map(grant_json)
        .collect();
    Ok(Json(json!({ "role": role, "permissions": grants })))
}

async fn handle_revoke_grant(
    State(state): State<AppState>,
    identity: Identity,
    Path((role, id)): Path<(String, String)>,
) -> Result<StatusCode, AccessError> {
    authorize_grant_admin(&state, &identity, &role, Operation::Delete)?;
    state.registry.revoke_grant(&role, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn grant_json(permission: &Permission) -> Value {
    let fields = match &permission.field_permissions {
        FieldPermissions::Parsed(fields) => json!(fields),
        FieldPermissions::Malformed { raw, .. } => json!({ "malformed": raw }),
    };
    json!({
        "id": permission.id,
        "resource_type": permission.resource_type,
        "operation": permission.operation,
        "scope": permission.scope,
        "field_permissions": fields,
    })
}
