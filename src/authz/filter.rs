use serde_json::Value;

use crate::authz::types::Decision;
use crate::errors::AccessError;

/// Strip masked top-level fields from a response record. Returns the fields that
/// were actually present and removed.
pub fn redact(decision: &Decision, record: &mut Value) -> Vec<String> {
    let (Some(masked), Value::Object(map)) = (decision.masked_fields(), record) else {
        return Vec::new();
    };
    masked
        .iter()
        .filter(|field| map.remove(field.as_str()).is_some())
        .cloned()
        .collect()
}

/// Reject a write payload that touches any masked field.
pub fn check_write_payload(decision: &Decision, payload: &Value) -> Result<(), AccessError> {
    if !decision.is_allowed() {
        return Err(AccessError::Unauthorized("write denied".into()));
    }
    let (Some(masked), Some(map)) = (decision.masked_fields(), payload.as_object()) else {
        return Ok(());
    };
    let touched: Vec<&str> = masked
        .iter()
        .map(String::as_str)
        .filter(|field| map.contains_key(*field))
        .collect();
    if touched.is_empty() {
        Ok(())
    } else {
        Err(AccessError::Unauthorized(format!(
            "payload writes restricted fields: {}",
            touched.join(", ")
        )))
    }
}
