//! Model signatures: mapping logical tensor names to engine endpoints

use serde::{Deserialize, Serialize};
use tensorbridge_common::{BridgeError, Result};

/// Output index suffix engines append to endpoint names
pub const ENDPOINT_SUFFIX: &str = ":0";

/// One named tensor in a signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    /// Logical name callers use
    pub name: String,

    /// Engine-internal endpoint, e.g. `serving_default_image:0`
    pub endpoint: String,
}

impl SignatureEntry {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Declared inputs and outputs of a loaded model, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(default)]
    pub inputs: Vec<SignatureEntry>,

    #[serde(default)]
    pub outputs: Vec<SignatureEntry>,
}

/// Drop a trailing `:0`
pub fn strip_endpoint_suffix(endpoint: &str) -> &str {
    endpoint.strip_suffix(ENDPOINT_SUFFIX).unwrap_or(endpoint)
}

fn resolve(entries: &[SignatureEntry], role: &str, logical: &str, position: usize) -> Result<String> {
    let entry = entries
        .iter()
        .find(|entry| entry.name == logical)
        .or_else(|| entries.get(position))
        .ok_or_else(|| {
            BridgeError::NameResolution(format!(
                "{} '{}' is not in the model signature and position {} is out of range ({} declared)",
                role,
                logical,
                position,
                entries.len()
            ))
        })?;

    if entry.endpoint.is_empty() {
        return Ok(logical.to_string());
    }
    Ok(strip_endpoint_suffix(&entry.endpoint).to_string())
}

impl Signature {
    /// Engine endpoint for the input at `position` named `logical`.
    ///
    /// Lookup is by name first, then by position.
    pub fn resolve_input(&self, logical: &str, position: usize) -> Result<String> {
        resolve(&self.inputs, "input", logical, position)
    }

    /// Engine endpoint for the output at `position` named `logical`
    pub fn resolve_output(&self, logical: &str, position: usize) -> Result<String> {
        resolve(&self.outputs, "output", logical, position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature() -> Signature {
        Signature {
            inputs: vec![
                SignatureEntry::new("input_a", "serving_x:0"),
                SignatureEntry::new("y", "serving_y:0"),
            ],
            outputs: vec![SignatureEntry::new("mask", "StatefulPartitionedCall")],
        }
    }

    #[test]
    fn test_name_lookup_then_positional_fallback() {
        let signature = signature();
        // "x" is unknown, so position 0 applies
        assert_eq!(signature.resolve_input("x", 0).unwrap(), "serving_x");
        assert_eq!(signature.resolve_input("y", 1).unwrap(), "serving_y");
        // Name wins over position
        assert_eq!(signature.resolve_input("y", 0).unwrap(), "serving_y");
        assert_eq!(signature.resolve_output("mask", 0).unwrap(), "StatefulPartitionedCall");
    }

    #[test]
    fn test_out_of_range_position_is_an_error() {
        let err = signature().resolve_output("logits", 1).unwrap_err();
        assert!(matches!(err, BridgeError::NameResolution(_)));
        assert!(err.to_string().contains("logits"));
    }

    #[test]
    fn test_suffix_stripping() {
        assert_eq!(strip_endpoint_suffix("a:0"), "a");
        assert_eq!(strip_endpoint_suffix("a:1"), "a:1");
        assert_eq!(strip_endpoint_suffix("a"), "a");
    }
}
