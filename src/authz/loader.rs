use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::authz::errors::AuthzError;
use crate::authz::policy::{parse_kdl_document, PolicyBundle};
use crate::authz::registry::validate_grant;
use crate::errors::AccessError;
use crate::storage::BackingStore;

/// Load all `.kdl` policy files from the given directory, in file-name order,
/// and merge them into one bundle.
pub fn load_policies(dir: &Path) -> Result<PolicyBundle, AuthzError> {
    if !dir.is_dir() {
        return Err(AuthzError::InvalidPolicy(format!(
            "policies directory `{}` does not exist or is not a directory",
            dir.display()
        )));
    }

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "kdl")
                .unwrap_or(false)
        })
        .collect();
    entries.sort_by_key(|e| e.path());

    let mut bundle = PolicyBundle::default();
    let mut file_count = 0;
    for entry in entries {
        let path = entry.path();
        let contents =
            std::fs::read_to_string(&path).map_err(|source| AuthzError::PolicyLoadError {
                path: path.display().to_string(),
                source,
            })?;
        bundle.merge(parse_kdl_document(&contents)?);
        file_count += 1;
    }

    let bundle = compile_bundle(bundle)?;
    tracing::info!(
        files = file_count,
        roles = bundle.roles.len(),
        permissions = bundle.permissions.len(),
        principals = bundle.principals.len(),
        "Loaded policy seed files"
    );
    Ok(bundle)
}

/// Check references and grants in a merged bundle. Later declarations of the same
/// role, permission or principal replace earlier ones.
pub fn compile_bundle(bundle: PolicyBundle) -> Result<PolicyBundle, AuthzError> {
    let roles = dedup_by_key(bundle.roles, |r| r.name.clone());
    let permissions = dedup_by_key(bundle.permissions, |p| p.id.clone());
    let principals = dedup_by_key(bundle.principals, |p| p.id.clone());

    let role_names: HashSet<&str> = roles.iter().map(|r| r.name.as_str()).collect();
    let permission_ids: HashSet<&str> = permissions.iter().map(|p| p.id.as_str()).collect();

    for permission in &permissions {
        validate_grant(permission)?;
    }
    for (role, ids) in &bundle.assignments {
        if !role_names.contains(role.as_str()) {
            return Err(AuthzError::UndefinedRole(role.clone()));
        }
        if let Some(missing) = ids.iter().find(|id| !permission_ids.contains(id.as_str())) {
            return Err(AuthzError::UndefinedPermission(missing.clone()));
        }
    }
    for principal in &principals {
        if !role_names.contains(principal.role.as_str()) {
            return Err(AuthzError::UndefinedRole(principal.role.clone()));
        }
    }

    Ok(PolicyBundle {
        roles,
        permissions,
        assignments: bundle.assignments,
        principals,
    })
}

fn dedup_by_key<T, F>(items: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> String,
{
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        match index.get(&key(&item)) {
            Some(&pos) => out[pos] = item,
            None => {
                index.insert(key(&item), out.len());
                out.push(item);
            }
        }
    }
    out
}

/// Upsert a compiled bundle into the backing store. Safe to run on every start.
pub async fn sync_bundle(store: &dyn BackingStore, bundle: &PolicyBundle) -> Result<(), AccessError> {
    for role in &bundle.roles {
        store.upsert_role(role).await?;
    }
    let permissions: HashMap<&str, _> = bundle.permissions.iter().map(|p| (p.id.as_str(), p)).collect();
    let mut assigned = 0;
    for (role, ids) in &bundle.assignments {
        for id in ids {
            let Some(permission) = permissions.get(id.as_str()) else {
                return Err(AuthzError::UndefinedPermission(id.clone()).into());
            };
            store.upsert_permission(role, permission).await?;
            assigned += 1;
        }
    }
    for principal in &bundle.principals {
        store.upsert_principal(principal).await?;
    }
    tracing::info!(
        roles = bundle.roles.len(),
        grants = assigned,
        principals = bundle.principals.len(),
        "Synchronized policy seed into backing store"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::types::{FieldAccess, FieldPermissions, Operation, Permission, Scope};
    use crate::storage::{MemoryStore, Principal, Role};
    use std::fs;
    use tempfile::TempDir;

    fn analyst_bundle() -> PolicyBundle {
        PolicyBundle {
            roles: vec![Role::new("ANALYST", 20)],
            permissions: vec![Permission::new(
                "report-read-dept",
                "Report",
                Operation::Read,
                Scope::Department,
            )
            .with_fields(FieldPermissions::from_entries([("salary", FieldAccess::Deny)]))],
            assignments: vec![("ANALYST".into(), vec!["report-read-dept".into()])],
            principals: vec![Principal::new("u-alice", "alice", "ANALYST").with_department("Finance")],
        }
    }

    #[test]
    fn test_compile_accepts_consistent_bundle() {
        let bundle = compile_bundle(analyst_bundle()).unwrap();
        assert_eq!(bundle.roles.len(), 1);
        assert_eq!(bundle.permissions.len(), 1);
    }

    #[test]
    fn test_compile_rejects_dangling_references() {
        let mut bundle = analyst_bundle();
        bundle.assignments.push(("GHOST".into(), vec![]));
        assert!(matches!(
            compile_bundle(bundle),
            Err(AuthzError::UndefinedRole(r)) if r == "GHOST"
        ));

        let mut bundle = analyst_bundle();
        bundle.assignments[0].1.push("missing".into());
        assert!(matches!(
            compile_bundle(bundle),
            Err(AuthzError::UndefinedPermission(p)) if p == "missing"
        ));

        let mut bundle = analyst_bundle();
        bundle.principals[0].role = "NOBODY".into();
        assert!(matches!(compile_bundle(bundle), Err(AuthzError::UndefinedRole(_))));
    }

    #[test]
    fn test_compile_rejects_escalating_grant() {
        let mut bundle = analyst_bundle();
        bundle.permissions[0].field_permissions =
            FieldPermissions::from_entries([("salary", FieldAccess::Write)]);
        assert!(matches!(
            compile_bundle(bundle),
            Err(AuthzError::FieldEscalation { .. })
        ));
    }

    #[test]
    fn test_later_declarations_win() {
        let mut bundle = analyst_bundle();
        bundle.roles.push(Role::new("ANALYST", 25));
        let bundle = compile_bundle(bundle).unwrap();
        assert_eq!(bundle.roles, vec![Role::new("ANALYST", 25)]);
    }

    #[test]
    fn test_load_policies_merges_files_in_order() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("10-roles.kdl"),
            r#"role "ANALYST" level=20"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("20-grants.kdl"),
            r#"
permission "report-read" resource="Report" operation="READ"
assign "ANALYST" {
    - "report-read"
}
"#,
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "not a policy").unwrap();

        let bundle = load_policies(dir.path()).unwrap();
        assert_eq!(bundle.roles.len(), 1);
        assert_eq!(bundle.permissions[0].id, "report-read");
    }

    #[test]
    fn test_load_policies_missing_dir() {
        let dir = TempDir::new().unwrap();
        let err = load_policies(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));
    }

    #[test]
    fn test_shipped_policies_compile() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("policies");
        let bundle = load_policies(&dir).unwrap();
        assert_eq!(bundle.roles.len(), 3);
        assert!(bundle.permissions.iter().any(|p| p.id == "report-read-dept"));
    }

    #[tokio::test]
    async fn test_sync_bundle_is_idempotent() {
        let store = MemoryStore::new();
        let bundle = compile_bundle(analyst_bundle()).unwrap();

        sync_bundle(&store, &bundle).await.unwrap();
        sync_bundle(&store, &bundle).await.unwrap();

        let grants = store.find_permissions_by_role("ANALYST").await.unwrap();
        assert_eq!(grants.len(), 1);
        let alice = store.find_principal_by_username("alice").await.unwrap();
        assert_eq!(alice.role, "ANALYST");
    }
}
