use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::authz::errors::AuthzError;
use crate::authz::types::{FieldPermissions, Permission};
use crate::errors::AccessError;
use crate::storage::{BackingStore, Role, StoreError};

/// How a role's effective permission set is derived from the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoleInheritance {
    /// Only directly assigned grants
    #[default]
    None,
    /// Direct grants plus those of every role with a strictly lower level
    LowerLevels,
}

/// Immutable view of roles and grants. Decisions hold an `Arc` to one snapshot for
/// their whole duration, so a concurrent reload never changes a decision midway.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    roles: HashMap<String, Role>,
    direct: HashMap<String, Vec<Permission>>,
    effective: HashMap<String, Vec<Permission>>,
    loaded_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    /// Builds a snapshot from roles and their directly assigned grants.
    pub fn build(
        roles: Vec<Role>,
        direct: HashMap<String, Vec<Permission>>,
        inheritance: RoleInheritance,
    ) -> Self {
        let roles: HashMap<String, Role> = roles.into_iter().map(|r| (r.name.clone(), r)).collect();
        let effective = expand_effective(&roles, &direct, inheritance);
        Self {
            roles,
            direct,
            effective,
            loaded_at: Utc::now(),
        }
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.get(name)
    }

    pub fn effective_grants(&self, role: &str) -> Option<&[Permission]> {
        self.effective.get(role).map(Vec::as_slice)
    }

    pub fn direct_grants(&self, role: &str) -> Option<&[Permission]> {
        self.direct.get(role).map(Vec::as_slice)
    }

    pub fn role_count(&self) -> usize {
        self.roles.len()
    }

    pub fn grant_count(&self) -> usize {
        self.direct.values().map(Vec::len).sum()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

/// Registry-level role expansion. The engine only ever sees the result.
fn expand_effective(
    roles: &HashMap<String, Role>,
    direct: &HashMap<String, Vec<Permission>>,
    inheritance: RoleInheritance,
) -> HashMap<String, Vec<Permission>> {
    roles
        .values()
        .map(|role| {
            let mut grants: Vec<Permission> = direct.get(&role.name).cloned().unwrap_or_default();
            if inheritance == RoleInheritance::LowerLevels {
                let mut lower: Vec<&Role> = roles.values().filter(|r| r.level < role.level).collect();
                lower.sort_by(|a, b| a.name.cmp(&b.name));
                for lower_role in lower {
                    for grant in direct.get(&lower_role.name).into_iter().flatten() {
                        if !grants.iter().any(|g| g.id == grant.id) {
                            grants.push(grant.clone());
                        }
                    }
                }
            }
            (role.name.clone(), grants)
        })
        .collect()
}

/// Check a grant before it is accepted: field entries may only narrow the
/// record-level operation, and DELETE grants carry no field entries.
pub fn validate_grant(permission: &Permission) -> Result<(), AuthzError> {
    let fields = match &permission.field_permissions {
        FieldPermissions::Parsed(fields) => fields,
        FieldPermissions::Malformed { reason, .. } => {
            return Err(AuthzError::MalformedFieldPermissions(format!(
                "permission `{}`: {reason}",
                permission.id
            )))
        }
    };
    if fields.is_empty() {
        return Ok(());
    }
    let Some(ceiling) = permission.operation.field_ceiling() else {
        return Err(AuthzError::FieldsOnDelete(permission.id.clone()));
    };
    for (field, access) in fields {
        if *access > ceiling {
            return Err(AuthzError::FieldEscalation {
                field: field.clone(),
                access: access.as_str().to_string(),
                operation: permission.operation.as_str().to_string(),
            });
        }
    }
    Ok(())
}

pub fn is_valid_grant(permission: &Permission) -> bool {
    validate_grant(permission).is_ok()
}

/// Role & permission registry: an in-memory snapshot over the backing store.
///
/// Mutations write through to the store and then rebuild the snapshot, so they are
/// visible to the next decision. Edits made to the store by other processes become
/// visible on the next `reload` (driven by the refresh job). Writes and reloads are
/// serialized, so an older fetch never replaces a newer snapshot.
pub struct Registry {
    store: Arc<dyn BackingStore>,
    inheritance: RoleInheritance,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    mutations: Mutex<()>,
}

impl Registry {
    pub async fn load(
        store: Arc<dyn BackingStore>,
        inheritance: RoleInheritance,
    ) -> Result<Self, AccessError> {
        let snapshot = fetch_snapshot(store.as_ref(), inheritance).await?;
        tracing::info!(
            roles = snapshot.role_count(),
            grants = snapshot.grant_count(),
            ?inheritance,
            "Loaded role and permission registry"
        );
        Ok(Self {
            store,
            inheritance,
            snapshot: RwLock::new(Arc::new(snapshot)),
            mutations: Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn reload(&self) -> Result<(), AccessError> {
        let _guard = self.mutations.lock().await;
        self.refresh().await
    }

    /// Caller holds `mutations`.
    async fn refresh(&self) -> Result<(), AccessError> {
        let snapshot = fetch_snapshot(self.store.as_ref(), self.inheritance).await?;
        tracing::debug!(
            roles = snapshot.role_count(),
            grants = snapshot.grant_count(),
            loaded_at = %snapshot.loaded_at(),
            "Reloaded registry snapshot"
        );
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
        Ok(())
    }

    pub fn role(&self, name: &str) -> Result<Role, AccessError> {
        self.snapshot()
            .role(name)
            .cloned()
            .ok_or_else(|| AccessError::NotFound(format!("role `{name}`")))
    }

    pub fn grants_for_role(&self, role: &str) -> Result<Vec<Permission>, AccessError> {
        self.snapshot()
            .effective_grants(role)
            .map(<[Permission]>::to_vec)
            .ok_or_else(|| AccessError::NotFound(format!("role `{role}`")))
    }

    /// `true` when `actor_role` ranks at or above `target_role`.
    pub fn can_act_on_behalf(&self, actor_role: &str, target_role: &str) -> Result<bool, AccessError> {
        let snapshot = self.snapshot();
        let level = |name: &str| {
            snapshot
                .role(name)
                .map(|r| r.level)
                .ok_or_else(|| AccessError::NotFound(format!("role `{name}`")))
        };
        Ok(level(actor_role)? >= level(target_role)?)
    }

    pub async fn put_role(&self, role: &Role) -> Result<(), AccessError> {
        let _guard = self.mutations.lock().await;
        self.store.upsert_role(role).await?;
        tracing::info!(role = %role.name, level = role.level, "Stored role");
        self.refresh().await
    }

    /// Assigns `permission` to `role`. Permission rows are shared by id, so an id
    /// already assigned to another role may only be reused with identical terms.
    pub async fn create_grant(&self, role: &str, permission: &Permission) -> Result<(), AccessError> {
        validate_grant(permission)?;
        let _guard = self.mutations.lock().await;

        match self.store.find_permission(&permission.id).await {
            Ok(existing) => {
                let others: Vec<&str> = existing
                    .roles
                    .iter()
                    .map(String::as_str)
                    .filter(|holder| *holder != role)
                    .collect();
                if !others.is_empty() && existing.permission != *permission {
                    tracing::warn!(
                        role,
                        permission = %permission.id,
                        holders = %others.join(","),
                        "Rejected grant that would rewrite a shared permission"
                    );
                    return Err(AccessError::Validation(format!(
                        "permission id `{}` is already assigned to {} with different terms",
                        permission.id,
                        others.join(", ")
                    )));
                }
            }
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        self.store.upsert_permission(role, permission).await?;
        tracing::info!(
            role,
            permission = %permission.id,
            resource = %permission.resource_type,
            operation = %permission.operation,
            scope = %permission.scope,
            "Granted permission"
        );
        self.refresh().await
    }

    pub async fn revoke_grant(&self, role: &str, permission_id: &str) -> Result<(), AccessError> {
        let _guard = self.mutations.lock().await;
        self.store.delete_permission(role, permission_id).await?;
        tracing::info!(role, permission = permission_id, "Revoked permission");
        self.refresh().await
    }
}

async fn fetch_snapshot(
    store: &dyn BackingStore,
    inheritance: RoleInheritance,
) -> Result<RegistrySnapshot, AccessError> {
    let roles = store.list_roles().await?;
    let mut direct = HashMap::with_capacity(roles.len());
    for role in &roles {
        let grants = store
            .find_permissions_by_role(&role.name)
            .await?
            .into_iter()
            .filter(|grant| match validate_grant(grant) {
                Ok(()) => true,
                // Malformed payloads stay; the engine's strictness switch owns them.
                Err(AuthzError::MalformedFieldPermissions(_)) => true,
                Err(e) => {
                    tracing::warn!(
                        role = %role.name,
                        permission = %grant.id,
                        error = %e,
                        "Skipping stored grant that fails validation"
                    );
                    false
                }
            })
            .collect();
        direct.insert(role.name.clone(), grants);
    }
    Ok(RegistrySnapshot::build(roles, direct, inheritance))
}
