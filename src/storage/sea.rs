use std::time::Duration;

use async_trait::async_trait;
use migration::{Migrator, MigratorTrait};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};

use crate::authz::types::{FieldPermissions, Operation, Permission, Scope};
use crate::entities;
use crate::errors::AppError;
use crate::settings::Database as DbCfg;
use crate::storage::{
    bounded, AssignedPermission, BackingStore, Principal, Role, Session, StoreError,
};

/// sea-orm backed store. Each call runs under `database.timeout_ms`.
#[derive(Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
    timeout: Duration,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    /// Connects and brings the schema up to date.
    pub async fn connect(cfg: &DbCfg) -> Result<Self, AppError> {
        let db = Database::connect(&cfg.url).await?;
        Migrator::up(&db, None).await?;
        tracing::info!(url = %redact_url(&cfg.url), "Connected to backing store");
        Ok(Self::new(db, Duration::from_millis(cfg.timeout_ms)))
    }
}

impl From<entities::principal::Model> for Principal {
    fn from(model: entities::principal::Model) -> Self {
        Principal {
            id: model.id,
            username: model.username,
            password_hash: model.password_hash,
            role: model.role,
            department: model.department,
        }
    }
}

impl From<entities::role::Model> for Role {
    fn from(model: entities::role::Model) -> Self {
        Role {
            name: model.name,
            level: model.level,
            description: model.description,
        }
    }
}

fn permission_from_model(model: entities::permission::Model) -> Option<Permission> {
    let (Some(operation), Some(scope)) = (
        Operation::parse(&model.operation),
        Scope::parse(&model.scope),
    ) else {
        tracing::warn!(
            permission = %model.id,
            operation = %model.operation,
            scope = %model.scope,
            "Skipping stored permission with unknown operation or scope"
        );
        return None;
    };
    Some(Permission {
        id: model.id,
        resource_type: model.resource_type,
        operation,
        scope,
        field_permissions: FieldPermissions::parse(model.field_permissions.as_deref()),
    })
}

fn session_from_model(model: entities::session::Model) -> Result<Session, StoreError> {
    let payload = serde_json::from_str(&model.payload).map_err(|e| {
        StoreError::Unavailable(format!(
            "session `{}` has an unreadable payload: {e}",
            model.handle
        ))
    })?;
    Ok(Session {
        handle: model.handle,
        principal_id: model.principal_id,
        payload,
        created_at: model.created_at,
        last_accessed_at: model.last_accessed_at,
    })
}

fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl BackingStore for SeaOrmStore {
    async fn find_principal_by_username(&self, username: &str) -> Result<Principal, StoreError> {
        use entities::principal::{Column, Entity};

        bounded(self.timeout, async {
            Entity::find()
                .filter(Column::Username.eq(username))
                .one(&self.db)
                .await?
                .map(Principal::from)
                .ok_or_else(|| StoreError::not_found("principal", username))
        })
        .await
    }

    async fn find_principal_by_id(&self, id: &str) -> Result<Principal, StoreError> {
        use entities::principal::Entity;

        bounded(self.timeout, async {
            Entity::find_by_id(id.to_string())
                .one(&self.db)
                .await?
                .map(Principal::from)
                .ok_or_else(|| StoreError::not_found("principal", id))
        })
        .await
    }

    async fn upsert_principal(&self, principal: &Principal) -> Result<(), StoreError> {
        use entities::principal::{ActiveModel, Column, Entity};

        let model = ActiveModel {
            id: Set(principal.id.clone()),
            username: Set(principal.username.clone()),
            password_hash: Set(principal.password_hash.clone()),
            role: Set(principal.role.clone()),
            department: Set(principal.department.clone()),
        };
        bounded(self.timeout, async {
            Entity::insert(model)
                .on_conflict(
                    OnConflict::column(Column::Id)
                        .update_columns([
                            Column::Username,
                            Column::PasswordHash,
                            Column::Role,
                            Column::Department,
                        ])
                        .to_owned(),
                )
                .exec(&self.db)
                .await?;
            Ok(())
        })
        .await
    }

    async fn find_role_by_id(&self, name: &str) -> Result<Role, StoreError> {
        use entities::role::Entity;

        bounded(self.timeout, async {
            Entity::find_by_id(name.to_string())
                .one(&self.db)
                .await?
                .map(Role::from)
                .ok_or_else(|| StoreError::not_found("role", name))
        })
        .await
    }

    async fn list_roles(&self) -> Result<Vec<Role>, StoreError> {
        use entities::role::{Column, Entity};

        bounded(self.timeout, async {
            let models = Entity::find()
                .order_by_asc(Column::Name)
                .all(&self.db)
                .await?;
            Ok(models.into_iter().map(Role::from).collect())
        })
        .await
    }

    async fn upsert_role(&self, role: &Role) -> Result<(), StoreError> {
        use entities::role::{ActiveModel, Column, Entity};

        let model = ActiveModel {
            name: Set(role.name.clone()),
            level: Set(role.level),
            description: Set(role.description.clone()),
        };
        bounded(self.timeout, async {
            Entity::insert(model)
                .on_conflict(
                    OnConflict::column(Column::Name)
                        .update_columns([Column::Level, Column::Description])
                        .to_owned(),
                )
                .exec(&self.db)
                .await?;
            Ok(())
        })
        .await
    }

    async fn find_permissions_by_role(&self, role: &str) -> Result<Vec<Permission>, StoreError> {
        use entities::{permission, role_permission};

        bounded(self.timeout, async {
            if entities::Role::find_by_id(role.to_string())
                .one(&self.db)
                .await?
                .is_none()
            {
                return Err(StoreError::not_found("role", role));
            }

            let ids: Vec<String> = role_permission::Entity::find()
                .filter(role_permission::Column::RoleName.eq(role))
                .all(&self.db)
                .await?
                .into_iter()
                .map(|m| m.permission_id)
                .collect();
            if ids.is_empty() {
                return Ok(Vec::new());
            }

            let models = permission::Entity::find()
                .filter(permission::Column::Id.is_in(ids))
                .order_by_asc(permission::Column::Id)
                .all(&self.db)
                .await?;
            Ok(models.into_iter().filter_map(permission_from_model).collect())
        })
        .await
    }

    async fn find_permission(&self, permission_id: &str) -> Result<AssignedPermission, StoreError> {
        use entities::{permission as perm, role_permission};

        bounded(self.timeout, async {
            let Some(model) = perm::Entity::find_by_id(permission_id.to_string())
                .one(&self.db)
                .await?
            else {
                return Err(StoreError::not_found("permission", permission_id));
            };
            let permission = permission_from_model(model).ok_or_else(|| {
                StoreError::Unavailable(format!(
                    "permission `{permission_id}` has an unknown operation or scope"
                ))
            })?;
            let roles = role_permission::Entity::find()
                .filter(role_permission::Column::PermissionId.eq(permission_id))
                .order_by_asc(role_permission::Column::RoleName)
                .all(&self.db)
                .await?
                .into_iter()
                .map(|m| m.role_name)
                .collect();
            Ok(AssignedPermission { permission, roles })
        })
        .await
    }

    async fn upsert_permission(
        &self,
        role: &str,
        permission: &Permission,
    ) -> Result<(), StoreError> {
        use entities::{permission as perm, role_permission};

        let model = perm::ActiveModel {
            id: Set(permission.id.clone()),
            resource_type: Set(permission.resource_type.clone()),
            operation: Set(permission.operation.as_str().to_string()),
            scope: Set(permission.scope.as_str().to_string()),
            field_permissions: Set(permission.field_permissions.to_json()),
        };
        bounded(self.timeout, async {
            // dropping `txn` on an early return rolls everything back
            let txn = self.db.begin().await?;
            if entities::Role::find_by_id(role.to_string())
                .one(&txn)
                .await?
                .is_none()
            {
                return Err(StoreError::not_found("role", role));
            }

            perm::Entity::insert(model)
                .on_conflict(
                    OnConflict::column(perm::Column::Id)
                        .update_columns([
                            perm::Column::ResourceType,
                            perm::Column::Operation,
                            perm::Column::Scope,
                            perm::Column::FieldPermissions,
                        ])
                        .to_owned(),
                )
                .exec(&txn)
                .await?;

            let assigned = role_permission::Entity::find_by_id((
                role.to_string(),
                permission.id.clone(),
            ))
            .one(&txn)
            .await?;
            if assigned.is_none() {
                role_permission::ActiveModel {
                    role_name: Set(role.to_string()),
                    permission_id: Set(permission.id.clone()),
                }
                .insert(&txn)
                .await?;
            }
            txn.commit().await?;
            Ok(())
        })
        .await
    }

    async fn delete_permission(&self, role: &str, permission_id: &str) -> Result<(), StoreError> {
        use entities::role_permission::{Column, Entity};

        bounded(self.timeout, async {
            let result = Entity::delete_many()
                .filter(Column::RoleName.eq(role))
                .filter(Column::PermissionId.eq(permission_id))
                .exec(&self.db)
                .await?;
            if result.rows_affected == 0 {
                return Err(StoreError::not_found(
                    "role permission",
                    format!("{role}/{permission_id}"),
                ));
            }
            Ok(())
        })
        .await
    }

    async fn find_session_by_handle(&self, handle: &str) -> Result<Session, StoreError> {
        use entities::session::Entity;

        bounded(self.timeout, async {
            match Entity::find_by_id(handle.to_string()).one(&self.db).await? {
                Some(model) => session_from_model(model),
                None => Err(StoreError::not_found("session", handle)),
            }
        })
        .await
    }

    async fn upsert_session(&self, session: &Session) -> Result<(), StoreError> {
        use entities::session::{ActiveModel, Column, Entity};

        let model = ActiveModel {
            handle: Set(session.handle.clone()),
            principal_id: Set(session.principal_id.clone()),
            payload: Set(session.payload.to_string()),
            created_at: Set(session.created_at),
            last_accessed_at: Set(session.last_accessed_at),
        };
        bounded(self.timeout, async {
            Entity::insert(model)
                .on_conflict(
                    OnConflict::column(Column::Handle)
                        .update_columns([Column::Payload, Column::LastAccessedAt])
                        .to_owned(),
                )
                .exec(&self.db)
                .await?;
            Ok(())
        })
        .await
    }

    async fn delete_session(&self, handle: &str) -> Result<(), StoreError> {
        use entities::session::{Column, Entity};

        bounded(self.timeout, async {
            let result = Entity::delete_many()
                .filter(Column::Handle.eq(handle))
                .exec(&self.db)
                .await?;
            if result.rows_affected == 0 {
                return Err(StoreError::not_found("session", handle));
            }
            Ok(())
        })
        .await
    }

    async fn delete_sessions_idle_since(&self, cutoff: i64) -> Result<u64, StoreError> {
        use entities::session::{Column, Entity};

        bounded(self.timeout, async {
            let result = Entity::delete_many()
                .filter(Column::LastAccessedAt.lt(cutoff))
                .exec(&self.db)
                .await?;
            Ok(result.rows_affected)
        })
        .await
    }
}
