//! Scale request validation: runs before any mutation.

use std::collections::BTreeMap;

use serde_json::Value;

use keel_state::StateStore;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Upper bound on a single scale count. Larger requests would queue that
/// many node builds or container records from one call.
pub const MAX_SCALE: u32 = 1000;

/// Parse a `{target: count}` body.
///
/// Counts may be non-negative JSON integers or strings holding a base-10
/// non-negative integer, at most [`MAX_SCALE`].
pub fn parse_structure(body: &Value) -> OrchestratorResult<BTreeMap<String, u32>> {
    let Some(map) = body.as_object() else {
        return Err(OrchestratorError::InvalidScaleFormat(
            "expected an object of {target: count}".to_string(),
        ));
    };

    let mut structure = BTreeMap::new();
    for (target, count) in map {
        let parsed = match count {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                s.parse::<u32>().ok()
            }
            _ => None,
        };
        let Some(count) = parsed.filter(|c| *c <= MAX_SCALE) else {
            return Err(OrchestratorError::InvalidScaleFormat(format!(
                "{target}: {count}"
            )));
        };
        structure.insert(target.clone(), count);
    }
    Ok(structure)
}

/// Formation scaling needs at least one provider with credentials filled in.
pub fn require_credentials(store: &StateStore, owner: &str) -> OrchestratorResult<()> {
    if store
        .list_providers(owner)?
        .iter()
        .any(|p| p.has_credentials())
    {
        Ok(())
    } else {
        Err(OrchestratorError::NoProviderCredentials)
    }
}

/// Resource ids become store key segments: lowercase alphanumerics and `-`.
pub fn validate_id(kind: &str, id: &str) -> OrchestratorResult<()> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !id.starts_with('-');
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::Validation(format!(
            "invalid {kind} id '{id}': use lowercase letters, digits and '-'"
        )))
    }
}
