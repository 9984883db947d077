use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AuthzError {
    #[error("Failed to load policy file `{path}`")]
    #[diagnostic(
        code(portcullis::authz::policy_load),
        help("Check that the file exists and contains valid KDL syntax")
    )]
    PolicyLoadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid policy: {0}")]
    #[diagnostic(
        code(portcullis::authz::invalid_policy),
        help("Each policy file may contain `role`, `permission`, `assign`, or `principal` KDL nodes")
    )]
    InvalidPolicy(String),

    #[error("Field `{field}` grants {access} but the record-level operation is {operation}")]
    #[diagnostic(
        code(portcullis::authz::field_escalation),
        help("A field entry may only narrow the record-level operation: READ allows DENY/READ, WRITE and CREATE allow DENY/READ/WRITE")
    )]
    FieldEscalation {
        field: String,
        access: String,
        operation: String,
    },

    #[error("Permission `{0}` is a DELETE grant and cannot carry field restrictions")]
    #[diagnostic(
        code(portcullis::authz::fields_on_delete),
        help("Remove the field entries; DELETE applies to whole records")
    )]
    FieldsOnDelete(String),

    #[error("Malformed field permissions: {0}")]
    #[diagnostic(
        code(portcullis::authz::malformed_fields),
        help("Field permissions must be a JSON object mapping field names to \"DENY\", \"READ\" or \"WRITE\"")
    )]
    MalformedFieldPermissions(String),

    #[error("Undefined role `{0}`")]
    #[diagnostic(
        code(portcullis::authz::undefined_role),
        help("Define the role with: role \"<name>\" level=<n>")
    )]
    UndefinedRole(String),

    #[error("Undefined permission `{0}`")]
    #[diagnostic(
        code(portcullis::authz::undefined_permission),
        help("Define the permission with: permission \"<id>\" resource=\"...\" operation=\"...\" scope=\"...\"")
    )]
    UndefinedPermission(String),

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(portcullis::authz::kdl_parse),
        help("Check the KDL syntax, see https://kdl.dev")
    )]
    KdlParse(String),

    #[error("I/O error: {0}")]
    #[diagnostic(code(portcullis::authz::io))]
    Io(#[from] std::io::Error),
}
