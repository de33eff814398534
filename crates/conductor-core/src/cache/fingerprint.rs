//! Content fingerprints for cacheable work.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};

use conductor_types::task::Capability;

/// Lowercase hex SHA-256 over the canonical form of a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of `(capability, normalized input, context slice, engine
    /// version)`. The caller is responsible for normalizing the input.
    pub fn compute(
        capability: &Capability,
        normalized_input: &Value,
        context_slice: &BTreeMap<String, Value>,
        engine_version: &str,
    ) -> Self {
        let mut hasher = Sha256::new();
        for part in [
            capability.as_str().to_string(),
            canonical_json(normalized_input),
            canonical_json(&Value::Object(
                context_slice
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )),
            engine_version.to_string(),
        ] {
            // Length prefix keeps part boundaries unambiguous.
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Hash of arbitrary text, for keys that are not cache fingerprints.
    pub fn of_text(text: &str) -> Self {
        Self(format!("{:x}", Sha256::digest(text.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize a JSON value with object keys sorted at every level.
///
/// Independent of whether `serde_json` preserves insertion order, so equal
/// values always render identically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fp(input: Value, slice: &[(&str, Value)], version: &str) -> Fingerprint {
        let slice: BTreeMap<String, Value> = slice
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Fingerprint::compute(&"analysis".into(), &input, &slice, version)
    }

    #[test]
    fn test_equal_work_equal_fingerprint() {
        let a = fp(json!({"params": {"a": 1, "b": 2}}), &[("repo", json!("x"))], "1.0");
        let b = fp(json!({"params": {"b": 2, "a": 1}}), &[("repo", json!("x"))], "1.0");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_any_component_changes_fingerprint() {
        let base = fp(json!({"p": 1}), &[("repo", json!("x"))], "1.0");
        assert_ne!(base, fp(json!({"p": 2}), &[("repo", json!("x"))], "1.0"));
        assert_ne!(base, fp(json!({"p": 1}), &[("repo", json!("y"))], "1.0"));
        assert_ne!(base, fp(json!({"p": 1}), &[("repo", json!("x"))], "2.0"));
        assert_ne!(
            base,
            Fingerprint::compute(
                &"scan".into(),
                &json!({"p": 1}),
                &[("repo".to_string(), json!("x"))].into_iter().collect(),
                "1.0"
            )
        );
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"z": [{"b": 1, "a": "s"}], "a": null});
        assert_eq!(canonical_json(&value), r#"{"a":null,"z":[{"a":"s","b":1}]}"#);
    }
}
