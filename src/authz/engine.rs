use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use crate::authz::registry::Registry;
use crate::authz::types::{Decision, Operation, Permission, RecordAttributes, Scope};
use crate::errors::AccessError;
use crate::settings::{FieldCombination, MalformedFieldPolicy};
use crate::storage::Principal;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineOptions {
    pub malformed_fields: MalformedFieldPolicy,
    pub combination: FieldCombination,
}

/// Decides whether a principal may perform an operation on a resource type,
/// optionally against a specific record.
pub struct AuthorizationEngine {
    registry: Arc<Registry>,
    options: EngineOptions,
}

impl AuthorizationEngine {
    pub fn new(registry: Arc<Registry>, options: EngineOptions) -> Self {
        Self { registry, options }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn decide(
        &self,
        principal: &Principal,
        resource_type: &str,
        operation: Operation,
        record: Option<&Value>,
    ) -> Result<Decision, AccessError> {
        let snapshot = self.registry.snapshot();
        let grants = snapshot.effective_grants(&principal.role).ok_or_else(|| {
            AccessError::NotFound(format!(
                "role `{}` of principal `{}`",
                principal.role, principal.id
            ))
        })?;

        let decision = evaluate(principal, grants, resource_type, operation, record, self.options);
        tracing::debug!(
            principal = %principal.id,
            role = %principal.role,
            resource = resource_type,
            operation = %operation,
            decision = decision.as_str(),
            "Authorization decision"
        );
        Ok(decision)
    }

    /// Like [`decide`](Self::decide), but a `Deny` becomes `Unauthorized`.
    pub fn authorize(
        &self,
        principal: &Principal,
        resource_type: &str,
        operation: Operation,
        record: Option<&Value>,
    ) -> Result<Decision, AccessError> {
        match self.decide(principal, resource_type, operation, record)? {
            Decision::Deny => Err(AccessError::Unauthorized(format!(
                "{operation} on {resource_type} denied for role `{}`",
                principal.role
            ))),
            allowed => Ok(allowed),
        }
    }
}

/// Evaluate a decision against an explicit grant set. Pure: no I/O, no shared state.
pub fn evaluate(
    principal: &Principal,
    grants: &[Permission],
    resource_type: &str,
    operation: Operation,
    record: Option<&Value>,
    options: EngineOptions,
) -> Decision {
    let attributes = record.map(RecordAttributes::from_value);
    let matching: Vec<&Permission> = grants
        .iter()
        .filter(|p| p.resource_type == resource_type && p.operation == operation)
        .filter(|p| match &attributes {
            Some(attrs) => scope_matches(p.scope, principal, attrs),
            None => true,
        })
        .collect();

    if matching.is_empty() {
        return Decision::Deny;
    }

    let mut restrictions = Vec::with_capacity(matching.len());
    for permission in matching {
        if permission.field_permissions.is_malformed() {
            match options.malformed_fields {
                MalformedFieldPolicy::Strict => {
                    tracing::warn!(
                        permission = %permission.id,
                        principal = %principal.id,
                        "Malformed field permissions on matching grant, denying"
                    );
                    return Decision::Deny;
                }
                MalformedFieldPolicy::Permissive => {
                    tracing::warn!(
                        permission = %permission.id,
                        principal = %principal.id,
                        "Malformed field permissions on matching grant, treating as unrestricted"
                    );
                }
            }
        }
        restrictions.push(permission.restricted_fields(operation));
    }

    let masked = combine_field_restrictions(&restrictions, options.combination);
    if masked.is_empty() {
        Decision::AllowFull
    } else {
        Decision::AllowFiltered(masked)
    }
}

/// Combine the restricted-field sets of all matching grants.
///
/// `Union` of grants: a field stays restricted only if every grant restricts it.
/// `Intersection` of grants: any restricting grant wins. Both are order-independent.
pub fn combine_field_restrictions(
    restrictions: &[BTreeSet<String>],
    combination: FieldCombination,
) -> BTreeSet<String> {
    let mut sets = restrictions.iter();
    let Some(first) = sets.next() else {
        return BTreeSet::new();
    };
    match combination {
        FieldCombination::Union => sets.fold(first.clone(), |acc, s| {
            acc.intersection(s).cloned().collect()
        }),
        FieldCombination::Intersection => {
            sets.fold(first.clone(), |acc, s| acc.union(s).cloned().collect())
        }
    }
}

pub fn scope_matches(scope: Scope, principal: &Principal, record: &RecordAttributes<'_>) -> bool {
    match scope {
        Scope::All => true,
        Scope::Own => record.owner == Some(principal.id.as_str()),
        Scope::Department => match (principal.department.as_deref(), record.department) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::registry::RoleInheritance;
    use crate::authz::types::{FieldAccess, FieldPermissions};
    use crate::storage::{BackingStore, MemoryStore, Role};
    use serde_json::json;

    fn set(fields: &[&str]) -> BTreeSet<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    fn alice() -> Principal {
        Principal::new("u-alice", "alice", "ANALYST").with_department("Finance")
    }

    #[test]
    fn test_own_scope_denies_foreign_records() {
        let grants = vec![Permission::new("own", "Report", Operation::Read, Scope::Own)];
        let p = alice();

        let mine = json!({"owner": "u-alice"});
        let theirs = json!({"owner": "u-bob"});
        let unowned = json!({"title": "x"});

        let opts = EngineOptions::default();
        assert_eq!(
            evaluate(&p, &grants, "Report", Operation::Read, Some(&mine), opts),
            Decision::AllowFull
        );
        assert_eq!(
            evaluate(&p, &grants, "Report", Operation::Read, Some(&theirs), opts),
            Decision::Deny
        );
        assert_eq!(
            evaluate(&p, &grants, "Report", Operation::Read, Some(&unowned), opts),
            Decision::Deny
        );
    }

    #[test]
    fn test_department_scope_requires_both_sides() {
        let grants = vec![Permission::new("d", "Report", Operation::Read, Scope::Department)];
        let opts = EngineOptions::default();
        let finance = json!({"department": "Finance"});
        let sales = json!({"department": "Sales"});

        assert!(evaluate(&alice(), &grants, "Report", Operation::Read, Some(&finance), opts).is_allowed());
        assert!(!evaluate(&alice(), &grants, "Report", Operation::Read, Some(&sales), opts).is_allowed());

        let nomad = Principal::new("u-2", "nomad", "ANALYST");
        assert!(!evaluate(&nomad, &grants, "Report", Operation::Read, Some(&finance), opts).is_allowed());
    }

    #[test]
    fn test_without_record_scope_is_not_evaluated() {
        let grants = vec![Permission::new("own", "Report", Operation::Read, Scope::Own)];
        let decision = evaluate(&alice(), &grants, "Report", Operation::Read, None, EngineOptions::default());
        assert_eq!(decision, Decision::AllowFull);
    }

    #[test]
    fn test_resource_and_operation_must_match_exactly() {
        let grants = vec![Permission::new("r", "Report", Operation::Read, Scope::All)];
        let opts = EngineOptions::default();
        assert_eq!(evaluate(&alice(), &grants, "Report", Operation::Write, None, opts), Decision::Deny);
        assert_eq!(evaluate(&alice(), &grants, "report", Operation::Read, None, opts), Decision::Deny);
        assert_eq!(evaluate(&alice(), &[], "Report", Operation::Read, None, opts), Decision::Deny);
    }

    #[test]
    fn test_read_only_field_is_filtered_on_write() {
        let grants = vec![Permission::new("w", "Report", Operation::Write, Scope::All).with_fields(
            FieldPermissions::from_entries([("salary", FieldAccess::Read)]),
        )];
        let decision = evaluate(&alice(), &grants, "Report", Operation::Write, None, EngineOptions::default());
        assert_eq!(decision, Decision::AllowFiltered(set(&["salary"])));
    }

    #[test]
    fn test_union_of_grants_is_order_independent() {
        let restricting = Permission::new("a", "Report", Operation::Read, Scope::All)
            .with_fields(FieldPermissions::from_entries([("salary", FieldAccess::Deny)]));
        let open = Permission::new("b", "Report", Operation::Read, Scope::All);
        let opts = EngineOptions::default();

        for grants in [
            vec![restricting.clone(), open.clone()],
            vec![open.clone(), restricting.clone()],
        ] {
            assert_eq!(
                evaluate(&alice(), &grants, "Report", Operation::Read, None, opts),
                Decision::AllowFull
            );
        }
    }

    #[test]
    fn test_intersection_policy_keeps_any_restriction() {
        let restricting = Permission::new("a", "Report", Operation::Read, Scope::All)
            .with_fields(FieldPermissions::from_entries([("salary", FieldAccess::Deny)]));
        let open = Permission::new("b", "Report", Operation::Read, Scope::All);
        let opts = EngineOptions {
            combination: FieldCombination::Intersection,
            ..EngineOptions::default()
        };

        for grants in [
            vec![restricting.clone(), open.clone()],
            vec![open.clone(), restricting.clone()],
        ] {
            assert_eq!(
                evaluate(&alice(), &grants, "Report", Operation::Read, None, opts),
                Decision::AllowFiltered(set(&["salary"]))
            );
        }
    }

    #[test]
    fn test_combine_field_restrictions() {
        let a = set(&["salary", "ssn"]);
        let b = set(&["ssn", "notes"]);
        assert_eq!(
            combine_field_restrictions(&[a.clone(), b.clone()], FieldCombination::Union),
            set(&["ssn"])
        );
        assert_eq!(
            combine_field_restrictions(&[b, a], FieldCombination::Intersection),
            set(&["notes", "salary", "ssn"])
        );
        assert!(combine_field_restrictions(&[], FieldCombination::Union).is_empty());
    }

    #[test]
    fn test_malformed_fields_strict_vs_permissive() {
        let grants = vec![Permission::new("m", "Report", Operation::Read, Scope::All)
            .with_fields(FieldPermissions::parse(Some("{broken")))];

        let strict = EngineOptions {
            malformed_fields: MalformedFieldPolicy::Strict,
            ..EngineOptions::default()
        };
        let permissive = EngineOptions {
            malformed_fields: MalformedFieldPolicy::Permissive,
            ..EngineOptions::default()
        };
        assert_eq!(evaluate(&alice(), &grants, "Report", Operation::Read, None, strict), Decision::Deny);
        assert_eq!(
            evaluate(&alice(), &grants, "Report", Operation::Read, None, permissive),
            Decision::AllowFull
        );
    }

    #[test]
    fn test_malformed_grant_out_of_scope_is_ignored() {
        let grants = vec![
            Permission::new("m", "Report", Operation::Read, Scope::Own)
                .with_fields(FieldPermissions::parse(Some("{broken"))),
            Permission::new("d", "Report", Operation::Read, Scope::Department),
        ];
        let record = json!({"owner": "u-bob", "department": "Finance"});
        let decision = evaluate(
            &alice(),
            &grants,
            "Report",
            Operation::Read,
            Some(&record),
            EngineOptions::default(),
        );
        assert_eq!(decision, Decision::AllowFull);
    }

    async fn analyst_engine() -> AuthorizationEngine {
        let store = Arc::new(MemoryStore::new());
        store.upsert_role(&Role::new("ANALYST", 20)).await.unwrap();
        store
            .upsert_permission(
                "ANALYST",
                &Permission::new("report-read-dept", "Report", Operation::Read, Scope::Department)
                    .with_fields(FieldPermissions::from_entries([("salary", FieldAccess::Deny)])),
            )
            .await
            .unwrap();
        let registry = Registry::load(store, RoleInheritance::None).await.unwrap();
        AuthorizationEngine::new(Arc::new(registry), EngineOptions::default())
    }

    #[tokio::test]
    async fn test_analyst_reads_departmental_report_without_salary() {
        let engine = analyst_engine().await;
        let record = json!({"owner": "u-bob", "department": "Finance", "salary": 90000});

        let decision = engine
            .decide(&alice(), "Report", Operation::Read, Some(&record))
            .unwrap();
        assert_eq!(decision, Decision::AllowFiltered(set(&["salary"])));
    }

    #[tokio::test]
    async fn test_authorize_turns_deny_into_unauthorized() {
        let engine = analyst_engine().await;
        let err = engine
            .authorize(&alice(), "Report", Operation::Delete, None)
            .unwrap_err();
        assert!(matches!(err, AccessError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_unknown_role_is_not_found() {
        let engine = analyst_engine().await;
        let ghost = Principal::new("u-9", "ghost", "GHOST");
        let err = engine.decide(&ghost, "Report", Operation::Read, None).unwrap_err();
        assert!(matches!(err, AccessError::NotFound(_)));
    }
}
