use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::authz::errors::AuthzError;

/// Record-level operation a permission grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Read,
    Write,
    Create,
    Delete,
}

impl Operation {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "READ" => Some(Self::Read),
            "WRITE" => Some(Self::Write),
            "CREATE" => Some(Self::Create),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Create => "CREATE",
            Self::Delete => "DELETE",
        }
    }

    /// The widest field access a grant for this operation may carry.
    /// `None` means the operation takes no field entries at all.
    pub fn field_ceiling(&self) -> Option<FieldAccess> {
        match self {
            Self::Read => Some(FieldAccess::Read),
            Self::Write | Self::Create => Some(FieldAccess::Write),
            Self::Delete => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which records a permission applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    All,
    Own,
    Department,
}

impl Scope {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALL" => Some(Self::All),
            "OWN" => Some(Self::Own),
            "DEPARTMENT" => Some(Self::Department),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "ALL",
            Self::Own => "OWN",
            Self::Department => "DEPARTMENT",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-field override. Ordered from most to least restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldAccess {
    Deny,
    Read,
    Write,
}

impl FieldAccess {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DENY" | "NONE" => Some(Self::Deny),
            "READ" => Some(Self::Read),
            "WRITE" => Some(Self::Write),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deny => "DENY",
            Self::Read => "READ",
            Self::Write => "WRITE",
        }
    }

    pub fn permits(&self, operation: Operation) -> bool {
        match self {
            Self::Deny => false,
            Self::Read => operation == Operation::Read,
            Self::Write => matches!(
                operation,
                Operation::Read | Operation::Write | Operation::Create
            ),
        }
    }
}

/// Field-level restrictions attached to a permission.
///
/// Stored payloads that do not parse are kept as `Malformed` rather than dropped, so
/// the engine's strictness switch decides what they mean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPermissions {
    Parsed(BTreeMap<String, FieldAccess>),
    Malformed { raw: String, reason: String },
}

impl Default for FieldPermissions {
    fn default() -> Self {
        Self::Parsed(BTreeMap::new())
    }
}

impl FieldPermissions {
    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldAccess)>,
        K: Into<String>,
    {
        Self::Parsed(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Parse a stored JSON payload. `None`, blank and `null` mean "no restrictions".
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Self::default();
        };
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => Self::from_value(&value).unwrap_or_else(|e| Self::Malformed {
                raw: raw.to_string(),
                reason: e.to_string(),
            }),
            Err(e) => Self::Malformed {
                raw: raw.to_string(),
                reason: e.to_string(),
            },
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, AuthzError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(map) => {
                let mut fields = BTreeMap::new();
                for (field, access) in map {
                    let access = access.as_str().and_then(FieldAccess::parse).ok_or_else(|| {
                        AuthzError::MalformedFieldPermissions(format!(
                            "field `{field}` has unsupported access {access}"
                        ))
                    })?;
                    fields.insert(field.clone(), access);
                }
                Ok(Self::Parsed(fields))
            }
            other => Err(AuthzError::MalformedFieldPermissions(format!(
                "expected a JSON object, found {other}"
            ))),
        }
    }

    /// Storage form: `None` when there are no restrictions, raw text when malformed.
    pub fn to_json(&self) -> Option<String> {
        match self {
            Self::Parsed(fields) if fields.is_empty() => None,
            Self::Parsed(fields) => {
                let map: serde_json::Map<String, Value> = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.as_str().to_string())))
                    .collect();
                Some(Value::Object(map).to_string())
            }
            Self::Malformed { raw, .. } => Some(raw.clone()),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

/// A grant: which operation on which resource type, over which records, with
/// which field-level narrowing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub id: String,
    pub resource_type: String,
    pub operation: Operation,
    pub scope: Scope,
    pub field_permissions: FieldPermissions,
}

impl Permission {
    pub fn new(
        id: impl Into<String>,
        resource_type: impl Into<String>,
        operation: Operation,
        scope: Scope,
    ) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            operation,
            scope,
            field_permissions: FieldPermissions::default(),
        }
    }

    pub fn with_fields(mut self, field_permissions: FieldPermissions) -> Self {
        self.field_permissions = field_permissions;
        self
    }

    /// Fields this grant does not open up for `operation`. Absent entries are allowed.
    pub fn restricted_fields(&self, operation: Operation) -> BTreeSet<String> {
        match &self.field_permissions {
            FieldPermissions::Parsed(fields) => fields
                .iter()
                .filter(|(_, access)| !access.permits(operation))
                .map(|(field, _)| field.clone())
                .collect(),
            FieldPermissions::Malformed { .. } => BTreeSet::new(),
        }
    }
}

/// Outcome of an authorization decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Deny,
    AllowFull,
    /// Allowed, but the listed fields must be redacted from responses or rejected
    /// from write payloads.
    AllowFiltered(BTreeSet<String>),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Deny)
    }

    pub fn masked_fields(&self) -> Option<&BTreeSet<String>> {
        match self {
            Decision::AllowFiltered(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Deny => "deny",
            Decision::AllowFull => "allow_full",
            Decision::AllowFiltered(_) => "allow_filtered",
        }
    }
}

/// Scope-relevant attributes of a target record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordAttributes<'a> {
    pub owner: Option<&'a str>,
    pub department: Option<&'a str>,
}

impl<'a> RecordAttributes<'a> {
    /// Reads the top-level `owner` and `department` string keys of a JSON record.
    pub fn from_value(record: &'a Value) -> Self {
        Self {
            owner: record.get("owner").and_then(Value::as_str),
            department: record.get("department").and_then(Value::as_str),
        }
    }
}

// ---------- API request/response types ----------

#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    /// e.g. "Report"
    pub resource_type: String,
    /// e.g. "READ"
    pub operation: Operation,
    /// Target record; scope is evaluated against its `owner` / `department` keys
    #[serde(default)]
    pub record: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct DecideResponse {
    pub decision: &'static str,
    pub redacted_fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub id: String,
    pub resource_type: String,
    pub operation: Operation,
    pub scope: Scope,
    #[serde(default)]
    pub field_permissions: Value,
}
