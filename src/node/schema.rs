//! JSON-Schema validation of node configuration.

use crate::error::{FlowError, FlowResult};

/// Validate a configuration value against a node's JSON Schema.
///
/// The error carries the JSON-Pointer path of the first failing value.
/// A schema that itself fails to compile is a configuration error at the
/// schema root rather than a silent skip.
pub fn validate_config(schema: &serde_json::Value, config: &serde_json::Value) -> FlowResult<()> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| FlowError::configuration("", format!("invalid schema: {e}")))?;

    if let Some(error) = validator.iter_errors(config).next() {
        let path = error.instance_path().to_string();
        return Err(FlowError::Configuration {
            path: if path.is_empty() { "/".to_string() } else { path },
            message: error.to_string(),
        });
    }

    Ok(())
}
