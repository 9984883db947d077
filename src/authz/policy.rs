use std::collections::BTreeMap;

use kdl::{KdlDocument, KdlNode};

use crate::authz::errors::AuthzError;
use crate::authz::types::{FieldAccess, FieldPermissions, Operation, Permission, Scope};
use crate::storage::{Principal, Role};

/// Seed data declared in one or more KDL policy files.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PolicyBundle {
    pub roles: Vec<Role>,
    pub permissions: Vec<Permission>,
    /// role name -> permission ids
    pub assignments: Vec<(String, Vec<String>)>,
    pub principals: Vec<Principal>,
}

impl PolicyBundle {
    pub fn merge(&mut self, other: PolicyBundle) {
        self.roles.extend(other.roles);
        self.permissions.extend(other.permissions);
        self.assignments.extend(other.assignments);
        self.principals.extend(other.principals);
    }
}

/// Parse a KDL document string into a policy bundle.
pub fn parse_kdl_document(source: &str) -> Result<PolicyBundle, AuthzError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| AuthzError::KdlParse(e.to_string()))?;

    let mut bundle = PolicyBundle::default();

    for node in doc.nodes() {
        match node.name().value() {
            "role" => bundle.roles.push(parse_role(node)?),
            "permission" => bundle.permissions.push(parse_permission(node)?),
            "assign" => {
                let role = first_string_arg(node).ok_or_else(|| {
                    AuthzError::InvalidPolicy(
                        "assign node requires a role argument (e.g. assign \"ANALYST\" { - \"report-read\" })"
                            .into(),
                    )
                })?;
                bundle.assignments.push((role, dash_list(node)));
            }
            "principal" => bundle.principals.push(parse_principal(node)?),
            other => {
                tracing::warn!("ignoring unknown top-level KDL node `{other}`");
            }
        }
    }

    Ok(bundle)
}

fn parse_role(node: &KdlNode) -> Result<Role, AuthzError> {
    let name = first_string_arg(node).ok_or_else(|| {
        AuthzError::InvalidPolicy(
            "role node requires a string argument (e.g. role \"ANALYST\" level=20)".into(),
        )
    })?;
    let level = node
        .get("level")
        .and_then(|v| v.as_integer())
        .ok_or_else(|| AuthzError::InvalidPolicy(format!("role `{name}` missing integer `level`")))?;
    let level = i32::try_from(level)
        .map_err(|_| AuthzError::InvalidPolicy(format!("role `{name}` level {level} out of range")))?;

    let mut role = Role::new(name, level);
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "description" => {
                    role.description = first_string_arg(child).unwrap_or_default();
                }
                other => {
                    return Err(AuthzError::InvalidPolicy(format!(
                        "unexpected child `{other}` in role `{}` (expected `description`)",
                        role.name
                    )));
                }
            }
        }
    }
    Ok(role)
}

fn parse_permission(node: &KdlNode) -> Result<Permission, AuthzError> {
    let id = first_string_arg(node).ok_or_else(|| {
        AuthzError::InvalidPolicy(
            "permission node requires an id argument (e.g. permission \"report-read\" resource=\"Report\" ...)"
                .into(),
        )
    })?;
    let property = |key: &str| {
        node.get(key)
            .and_then(|v| v.as_string())
            .ok_or_else(|| AuthzError::InvalidPolicy(format!("permission `{id}` missing `{key}` property")))
    };
    let resource_type = property("resource")?;
    let operation_raw = property("operation")?;
    let operation = Operation::parse(operation_raw).ok_or_else(|| {
        AuthzError::InvalidPolicy(format!(
            "permission `{id}` has unknown operation `{operation_raw}` (expected READ, WRITE, CREATE or DELETE)"
        ))
    })?;
    let scope = match node.get("scope").and_then(|v| v.as_string()) {
        None => Scope::All,
        Some(raw) => Scope::parse(raw).ok_or_else(|| {
            AuthzError::InvalidPolicy(format!(
                "permission `{id}` has unknown scope `{raw}` (expected ALL, OWN or DEPARTMENT)"
            ))
        })?,
    };

    let mut fields = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() != "field" {
                return Err(AuthzError::InvalidPolicy(format!(
                    "unexpected child `{}` in permission `{id}` (expected `field`)",
                    child.name().value()
                )));
            }
            let args = string_args(child);
            let [field, access] = args.as_slice() else {
                return Err(AuthzError::InvalidPolicy(format!(
                    "field entry in permission `{id}` needs a name and an access level (e.g. field \"salary\" \"DENY\")"
                )));
            };
            let access = FieldAccess::parse(access).ok_or_else(|| {
                AuthzError::MalformedFieldPermissions(format!(
                    "permission `{id}` field `{field}` has unknown access `{access}`"
                ))
            })?;
            fields.insert(field.clone(), access);
        }
    }

    Ok(Permission::new(id.clone(), resource_type, operation, scope)
        .with_fields(FieldPermissions::Parsed(fields)))
}

fn parse_principal(node: &KdlNode) -> Result<Principal, AuthzError> {
    let username = first_string_arg(node).ok_or_else(|| {
        AuthzError::InvalidPolicy(
            "principal node requires a username argument (e.g. principal \"alice\" role=\"ANALYST\")"
                .into(),
        )
    })?;
    let string_prop = |key: &str| node.get(key).and_then(|v| v.as_string()).map(str::to_string);

    let role = string_prop("role")
        .ok_or_else(|| AuthzError::InvalidPolicy(format!("principal `{username}` missing `role`")))?;
    let id = string_prop("id").unwrap_or_else(|| username.clone());

    let mut principal = Principal::new(id, username, role);
    principal.department = string_prop("department");
    principal.password_hash = string_prop("password-hash");
    Ok(principal)
}

/// Extract the first string argument from a KDL node.
fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(str::to_string)
        .collect()
}

/// Extract dash-list children: nodes named "-" whose first argument is a string.
fn dash_list(node: &KdlNode) -> Vec<String> {
    let Some(children) = node.children() else {
        return Vec::new();
    };
    children
        .nodes()
        .iter()
        .filter(|n| n.name().value() == "-")
        .filter_map(first_string_arg)
        .collect()
}
