//! JSON-schema validation of fetched configuration

use jsonschema::{Draft, JSONSchema};
use portal_core::{CoreError, Result};
use serde_json::Value;

/// Compiled validators for one config item: the main schema plus any
/// additional schemas the payload must also satisfy.
pub struct ConfigValidator {
    schemas: Vec<JSONSchema>,
}

impl ConfigValidator {
    /// Compile the given schema documents. Documents are leaked: the
    /// validators built from them live for the process lifetime.
    pub fn compile(main: Option<&Value>, additional: &[Value]) -> Result<Self> {
        let mut schemas = Vec::new();
        for document in main.into_iter().chain(additional.iter()) {
            let leaked: &'static Value = Box::leak(Box::new(document.clone()));
            let compiled = JSONSchema::options()
                .with_draft(Draft::Draft7)
                .compile(leaked)
                .map_err(|e| CoreError::Validation(format!("schema does not compile: {}", e)))?;
            schemas.push(compiled);
        }
        Ok(Self { schemas })
    }

    /// Validate a payload against every compiled schema
    pub fn validate(&self, payload: &Value) -> Result<()> {
        for schema in &self.schemas {
            if let Err(errors) = schema.validate(payload) {
                let message = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
                return Err(CoreError::Validation(message));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_must_satisfy_all_schemas() {
        let main = json!({"type": "object", "required": ["apps"]});
        let extra = json!({"type": "object", "required": ["version"]});
        let validator = ConfigValidator::compile(Some(&main), &[extra]).expect("compiles");

        assert!(validator.validate(&json!({"apps": [], "version": "1"})).is_ok());
        assert!(validator.validate(&json!({"apps": []})).is_err());
        assert!(validator.validate(&json!("not an object")).is_err());
    }

    #[test]
    fn test_without_schema_everything_passes() {
        let validator = ConfigValidator::compile(None, &[]).expect("compiles");
        assert!(validator.validate(&json!(42)).is_ok());
    }

    #[test]
    fn test_invalid_schema_fails_to_compile() {
        let broken = json!({"type": "no-such-type"});
        assert!(ConfigValidator::compile(Some(&broken), &[]).is_err());
    }
}
