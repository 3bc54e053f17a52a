//! JSON schemas for provider configurations.
//!
//! Each kind has one fixed schema. The inner ruleset must carry an `id` and
//! a `list` rule with `possible`; a missing `available` means everything
//! possible is available. Anything other than the known rules is rejected
//! so that a misspelt rule does not silently turn into "accept everything".

use serde_json::{Value, json};

use super::{RegistryError, RegistryResult};
use crate::provider::ResourceKind;

/// The schema a `kind` configuration document must satisfy.
pub fn schema_for(kind: ResourceKind) -> Value {
    let mut rules = json!({
        "id": {"type": "string", "minLength": 1},
        "list": {
            "type": "object",
            "required": ["possible"],
            "properties": {
                "possible": {},
                "available": {}
            }
        },
        "checkout": {},
        "checkin": {}
    });
    if kind == ResourceKind::Iut {
        rules["prepare"] = json!({});
    }

    let key = kind.config_key();
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": [key],
        "properties": {
            key: {
                "type": "object",
                "required": ["id", "list"],
                "properties": rules,
                "additionalProperties": false
            }
        }
    })
}

/// Validates a configuration document, collecting every violation.
pub fn validate(kind: ResourceKind, config: &Value) -> RegistryResult<()> {
    let schema = schema_for(kind);
    let validator = jsonschema::validator_for(&schema).map_err(|e| RegistryError::Validation {
        kind,
        reason: format!("schema does not compile: {e}"),
    })?;

    let errors: Vec<String> = validator.iter_errors(config).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(RegistryError::Validation {
            kind,
            reason: errors.join("; "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> Value {
        json!({"possible": [], "available": []})
    }

    #[test]
    fn test_accepts_minimal_configs() {
        validate(ResourceKind::Iut, &json!({"iut": {"id": "default", "list": list()}})).unwrap();
        validate(
            ResourceKind::ExecutionSpace,
            &json!({"execution_space": {"id": "k8s", "list": list(), "checkin": true}}),
        )
        .unwrap();
        validate(ResourceKind::LogArea, &json!({"log": {"id": "s3", "list": list()}})).unwrap();
    }

    #[test]
    fn test_available_is_optional() {
        let config = json!({"iut": {"id": "default", "list": {"possible": []}}});
        validate(ResourceKind::Iut, &config).unwrap();

        let config = json!({"iut": {"id": "default", "list": {"available": []}}});
        assert!(validate(ResourceKind::Iut, &config).is_err());
    }

    #[test]
    fn test_rejects_missing_list() {
        let err = validate(ResourceKind::Iut, &json!({"iut": {"id": "default"}})).unwrap_err();
        assert!(matches!(err, RegistryError::Validation { kind: ResourceKind::Iut, .. }));
    }

    #[test]
    fn test_rejects_wrong_top_level_key() {
        let config = json!({"iut": {"id": "default", "list": list()}});
        assert!(validate(ResourceKind::LogArea, &config).is_err());
    }

    #[test]
    fn test_prepare_only_allowed_for_iuts() {
        let iut = json!({"iut": {"id": "a", "list": list(), "prepare": true}});
        assert!(validate(ResourceKind::Iut, &iut).is_ok());

        let log = json!({"log": {"id": "a", "list": list(), "prepare": true}});
        assert!(validate(ResourceKind::LogArea, &log).is_err());
    }

    #[test]
    fn test_reports_every_violation() {
        let config = json!({"iut": {"id": 5, "list": {}, "chekout": {}}});
        let reason = match validate(ResourceKind::Iut, &config).unwrap_err() {
            RegistryError::Validation { reason, .. } => reason,
            other => panic!("unexpected error: {other}"),
        };
        assert!(reason.matches(';').count() >= 2, "{reason}");
    }
}
