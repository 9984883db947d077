use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::authz::types::Permission;
use crate::storage::{AssignedPermission, BackingStore, Principal, Role, Session, StoreError};

#[derive(Debug, Default)]
struct Tables {
    principals: HashMap<String, Principal>,
    roles: HashMap<String, Role>,
    permissions: HashMap<String, Permission>,
    /// role name -> permission ids
    assignments: HashMap<String, BTreeSet<String>>,
    sessions: HashMap<String, Session>,
}

/// Process-local store. `set_available(false)` makes every call fail with
/// `Unavailable`, which is how outages are exercised in tests.
#[derive(Debug)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn session_count(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .len()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> Result<T, StoreError>) -> Result<T, StoreError> {
        self.check_available()?;
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        f(&tables)
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.check_available()?;
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut tables)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn find_principal_by_username(&self, username: &str) -> Result<Principal, StoreError> {
        self.read(|t| {
            t.principals
                .values()
                .find(|p| p.username == username)
                .cloned()
                .ok_or_else(|| StoreError::not_found("principal", username))
        })
    }

    async fn find_principal_by_id(&self, id: &str) -> Result<Principal, StoreError> {
        self.read(|t| {
            t.principals
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::not_found("principal", id))
        })
    }

    async fn upsert_principal(&self, principal: &Principal) -> Result<(), StoreError> {
        self.write(|t| {
            t.principals.insert(principal.id.clone(), principal.clone());
            Ok(())
        })
    }

    async fn find_role_by_id(&self, name: &str) -> Result<Role, StoreError> {
        self.read(|t| {
            t.roles
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::not_found("role", name))
        })
    }

    async fn list_roles(&self) -> Result<Vec<Role>, StoreError> {
        self.read(|t| {
            let mut roles: Vec<Role> = t.roles.values().cloned().collect();
            roles.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(roles)
        })
    }

    async fn upsert_role(&self, role: &Role) -> Result<(), StoreError> {
        self.write(|t| {
            t.roles.insert(role.name.clone(), role.clone());
            Ok(())
        })
    }

    async fn find_permissions_by_role(&self, role: &str) -> Result<Vec<Permission>, StoreError> {
        self.read(|t| {
            if !t.roles.contains_key(role) {
                return Err(StoreError::not_found("role", role));
            }
            Ok(t.assignments
                .get(role)
                .into_iter()
                .flatten()
                .filter_map(|id| t.permissions.get(id).cloned())
                .collect())
        })
    }

    async fn find_permission(&self, permission_id: &str) -> Result<AssignedPermission, StoreError> {
        self.read(|t| {
            let permission = t
                .permissions
                .get(permission_id)
                .cloned()
                .ok_or_else(|| StoreError::not_found("permission", permission_id))?;
            let mut roles: Vec<String> = t
                .assignments
                .iter()
                .filter(|(_, ids)| ids.contains(permission_id))
                .map(|(role, _)| role.clone())
                .collect();
            roles.sort();
            Ok(AssignedPermission { permission, roles })
        })
    }

    async fn upsert_permission(
        &self,
        role: &str,
        permission: &Permission,
    ) -> Result<(), StoreError> {
        self.write(|t| {
            if !t.roles.contains_key(role) {
                return Err(StoreError::not_found("role", role));
            }
            t.permissions
                .insert(permission.id.clone(), permission.clone());
            t.assignments
                .entry(role.to_string())
                .or_default()
                .insert(permission.id.clone());
            Ok(())
        })
    }

    async fn delete_permission(&self, role: &str, permission_id: &str) -> Result<(), StoreError> {
        self.write(|t| {
            let removed = t
                .assignments
                .get_mut(role)
                .map(|ids| ids.remove(permission_id))
                .unwrap_or(false);
            if removed {
                Ok(())
            } else {
                Err(StoreError::not_found(
                    "role permission",
                    format!("{role}/{permission_id}"),
                ))
            }
        })
    }

    async fn find_session_by_handle(&self, handle: &str) -> Result<Session, StoreError> {
        self.read(|t| {
            t.sessions
                .get(handle)
                .cloned()
                .ok_or_else(|| StoreError::not_found("session", handle))
        })
    }

    async fn upsert_session(&self, session: &Session) -> Result<(), StoreError> {
        self.write(|t| {
            t.sessions.insert(session.handle.clone(), session.clone());
            Ok(())
        })
    }

    async fn delete_session(&self, handle: &str) -> Result<(), StoreError> {
        self.write(|t| {
            t.sessions
                .remove(handle)
                .map(|_| ())
                .ok_or_else(|| StoreError::not_found("session", handle))
        })
    }

    async fn delete_sessions_idle_since(&self, cutoff: i64) -> Result<u64, StoreError> {
        self.write(|t| {
            let before = t.sessions.len();
            t.sessions.retain(|_, s| s.last_accessed_at >= cutoff);
            Ok((before - t.sessions.len()) as u64)
        })
    }
}
