//! Input hashing for change detection.
//!
//! Hashes are computed over a canonical form: attribute maps are sorted by
//! key and values are rendered as compact JSON, whose objects are also
//! key-sorted. Two input maps hash equal exactly when they are equal.

use sha2::{Digest, Sha256};

use crate::graph::AttributeMap;

use super::spec::StackConfig;

/// Hasher for resolved inputs and whole stacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct InputHasher;

impl InputHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of a resource's resolved inputs.
    #[must_use]
    pub fn hash_inputs(&self, inputs: &AttributeMap) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in inputs {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a hash of the declared stack, used to tag plans.
    #[must_use]
    pub fn hash_stack(&self, config: &StackConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.stack.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(config.stack.environment.as_bytes());
        hasher.update([0u8]);

        for resource in &config.resources {
            hasher.update(resource.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(resource.resource_type.as_bytes());
            hasher.update([0u8]);
            for (name, value) in &resource.inputs {
                hasher.update(name.as_bytes());
                hasher.update([0u8]);
                hasher.update(value.to_string().as_bytes());
                hasher.update([0u8]);
            }
            for dep in &resource.depends_on {
                hasher.update(dep.as_bytes());
                hasher.update([0u8]);
            }
        }

        for (name, expr) in &config.outputs {
            hasher.update(name.as_bytes());
            hasher.update(expr.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use serde_json::json;

    fn attrs(pairs: &[(&str, serde_json::Value)]) -> AttributeMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_input_hash_deterministic() {
        let hasher = InputHasher::new();
        let a = attrs(&[("cidr", json!("10.0.0.0/16")), ("tags", json!({"b": 1, "a": 2}))]);
        let b = attrs(&[("tags", json!({"a": 2, "b": 1})), ("cidr", json!("10.0.0.0/16"))]);

        assert_eq!(hasher.hash_inputs(&a), hasher.hash_inputs(&b));
    }

    #[test]
    fn test_input_hash_sees_type_changes() {
        let hasher = InputHasher::new();
        let a = attrs(&[("port", json!(8080))]);
        let b = attrs(&[("port", json!("8080"))]);

        assert_ne!(hasher.hash_inputs(&a), hasher.hash_inputs(&b));
    }

    #[test]
    fn test_stack_hash_changes_with_resources() {
        let hasher = InputHasher::new();
        let mut stack = StackConfig::new("demo");
        let before = hasher.hash_stack(&stack);

        stack.resources.push(ResourceConfig {
            name: String::from("net"),
            resource_type: String::from("test:net"),
            inputs: std::collections::BTreeMap::new(),
            depends_on: Vec::new(),
        });
        assert_ne!(before, hasher.hash_stack(&stack));
    }

    #[test]
    fn test_short_hash() {
        let hasher = InputHasher::new();
        assert_eq!(hasher.short_hash("abcdef1234567890"), "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(InputHasher::hashes_match("abc123", "abc123"));
        assert!(!InputHasher::hashes_match("abc123", "abc124"));
        assert!(!InputHasher::hashes_match("abc123", "abc12"));
    }
}
