//! JSON Schema validation for reasoning-service judgments.
//!
//! Raw judgments are validated against `schema/judgment.schema.json` before
//! any field is trusted.

use std::sync::OnceLock;
use thiserror::Error;

/// Embedded judgment schema (loaded at compile time).
const JUDGMENT_SCHEMA_JSON: &str = include_str!("../schema/judgment.schema.json");

/// Compiled validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

/// Errors from schema loading.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to load schema: {0}")]
    LoadError(String),
}

fn get_validator() -> Result<&'static jsonschema::Validator, SchemaError> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = serde_json::from_str(JUDGMENT_SCHEMA_JSON)
            .map_err(|e| format!("Invalid schema JSON: {}", e))?;
        jsonschema::options()
            .build(&schema_value)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    });

    result
        .as_ref()
        .map_err(|e| SchemaError::LoadError(e.clone()))
}

/// Validate a raw judgment against the schema.
///
/// Returns every violation message, each with its instance path.
pub fn validate_judgment_schema(judgment: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e.to_string()])?;

    let errors: Vec<String> = validator
        .iter_errors(judgment)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_judgment_passes() {
        let value = json!({
            "violation_type": [],
            "severity": 0,
            "recommended_actions": [],
            "rationale": "No misconduct described."
        });
        assert!(validate_judgment_schema(&value).is_ok());
    }

    #[test]
    fn test_full_judgment_passes() {
        let value = json!({
            "violation_type": ["Embezzlement"],
            "severity": 2,
            "severity_label": "Serious",
            "recommended_actions": ["Refer to internal audit"],
            "rationale": "Unapproved transfers match the dual-approval rule.",
            "citations": ["code#Article 3@1a2b3c4d", {"id": "code#Article 7@99aa00bb"}],
            "confidence": 0.8,
            "needs_more_evidence": false
        });
        assert!(validate_judgment_schema(&value).is_ok());
    }

    #[test]
    fn test_missing_rationale_fails() {
        let value = json!({
            "violation_type": [],
            "severity": 0,
            "recommended_actions": []
        });
        let errors = validate_judgment_schema(&value).unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_string_severity_fails() {
        let value = json!({
            "violation_type": ["x"],
            "severity": "high",
            "recommended_actions": [],
            "rationale": "r"
        });
        assert!(validate_judgment_schema(&value).is_err());
    }

    #[test]
    fn test_confidence_out_of_range_fails() {
        let value = json!({
            "violation_type": [],
            "severity": 0,
            "recommended_actions": [],
            "rationale": "r",
            "confidence": 3
        });
        assert!(validate_judgment_schema(&value).is_err());
    }
}
