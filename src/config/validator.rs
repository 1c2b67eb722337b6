//! Stack validation.
//!
//! Everything here runs before any provider call: names, engine bounds,
//! reference syntax and targets, resource types and attribute change
//! policies, and finally graph construction so cycles are caught too.

use std::collections::HashSet;
use tracing::debug;

use crate::error::{ConvergeError, Result, ValidationError};
use crate::graph::{GraphBuilder, InputValue, ResourceDeclaration};
use crate::provider::ProviderRegistry;

use super::spec::{StackConfig, StateBackend};

/// Validator for stack files.
#[derive(Debug, Default)]
pub struct ConfigValidator<'a> {
    /// Registry used to check resource types and change policies.
    registry: Option<&'a ProviderRegistry>,
}

/// Validation result containing every problem found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Validation errors.
    pub errors: Vec<ValidationError>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

impl<'a> ConfigValidator<'a> {
    /// Creates a validator that checks structure only.
    #[must_use]
    pub const fn new() -> Self {
        Self { registry: None }
    }

    /// Also checks resource types and change policies against `registry`.
    #[must_use]
    pub const fn with_registry(mut self, registry: &'a ProviderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validates a stack, failing on the first error.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let mut result = self.check(config);

        if result.errors.is_empty() {
            debug!("Stack validation passed");
            Ok(result)
        } else {
            Err(ConvergeError::Validation(result.errors.swap_remove(0)))
        }
    }

    /// Validates a stack and collects every error and warning.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_stack(config, &mut result);
        Self::validate_engine(config, &mut result);
        let declarations = self.validate_resources(config, &mut result);
        Self::validate_outputs(config, &mut result);

        if result.errors.is_empty() {
            if let Err(e) = GraphBuilder::new().declare_all(declarations).build() {
                result.errors.push(e);
            }
        }

        result
    }

    fn validate_stack(config: &StackConfig, result: &mut ValidationResult) {
        if !is_valid_stack_name(&config.stack.name) {
            result.errors.push(ValidationError::malformed(
                "stack.name",
                format!(
                    "Stack name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    config.stack.name
                ),
            ));
        }

        if config.stack.environment.is_empty() {
            result.errors.push(ValidationError::malformed(
                "stack.environment",
                "Environment cannot be empty",
            ));
        }

        if config.state.backend == StateBackend::Memory && config.state.path.is_some() {
            result
                .warnings
                .push(String::from("state.path is ignored by the memory backend"));
        }
    }

    fn validate_engine(config: &StackConfig, result: &mut ValidationResult) {
        let engine = &config.engine;

        if engine.concurrency == 0 {
            result.errors.push(ValidationError::malformed(
                "engine.concurrency",
                "Concurrency must be at least 1",
            ));
        }

        if engine.operation_timeout_secs == 0 {
            result.errors.push(ValidationError::malformed(
                "engine.operation_timeout_secs",
                "Operation timeout must be at least 1 second",
            ));
        }

        if engine.run_timeout_secs == Some(0) {
            result.errors.push(ValidationError::malformed(
                "engine.run_timeout_secs",
                "Run timeout must be at least 1 second",
            ));
        }

        if engine.backoff_base_ms > engine.backoff_max_ms {
            result.errors.push(ValidationError::malformed(
                "engine.backoff_base_ms",
                format!(
                    "Backoff base ({}ms) exceeds backoff max ({}ms)",
                    engine.backoff_base_ms, engine.backoff_max_ms
                ),
            ));
        }
    }

    fn validate_resources(
        &self,
        config: &StackConfig,
        result: &mut ValidationResult,
    ) -> Vec<ResourceDeclaration> {
        let mut seen = HashSet::new();
        let names: HashSet<&str> = config.resources.iter().map(|r| r.name.as_str()).collect();
        let mut declarations = Vec::with_capacity(config.resources.len());

        for (idx, resource) in config.resources.iter().enumerate() {
            if !is_valid_resource_name(&resource.name) {
                result.errors.push(ValidationError::malformed(
                    format!("resources[{idx}].name"),
                    format!(
                        "Resource name '{}' is invalid. Must start with a letter and contain only letters, digits, '-' or '_'.",
                        resource.name
                    ),
                ));
                continue;
            }

            if !seen.insert(resource.name.as_str()) {
                result.errors.push(ValidationError::DuplicateName {
                    name: resource.name.clone(),
                });
                continue;
            }

            if resource.resource_type.is_empty() {
                result.errors.push(ValidationError::malformed(
                    format!("{}.type", resource.name),
                    "Resource type cannot be empty",
                ));
                continue;
            }

            if let Some(registry) = self.registry {
                match registry.schema(&resource.resource_type) {
                    None => result.errors.push(ValidationError::UnknownResourceType {
                        resource: resource.name.clone(),
                        resource_type: resource.resource_type.clone(),
                    }),
                    Some(schema) => {
                        for attribute in resource.inputs.keys() {
                            if schema.policy_for(attribute).is_none() {
                                result.errors.push(ValidationError::MissingChangePolicy {
                                    resource: resource.name.clone(),
                                    resource_type: resource.resource_type.clone(),
                                    attribute: attribute.clone(),
                                });
                            }
                        }
                    }
                }
            }

            let declaration = match ResourceDeclaration::from_config(resource) {
                Ok(declaration) => declaration,
                Err(e) => {
                    result.errors.push(e);
                    continue;
                }
            };

            let referenced: HashSet<&str> = declaration
                .inputs
                .values()
                .flat_map(InputValue::references)
                .map(|r| r.resource.as_str())
                .collect();
            for target in declaration.dependency_names() {
                if !names.contains(target) {
                    result.errors.push(ValidationError::UnknownReference {
                        resource: resource.name.clone(),
                        target: target.to_string(),
                    });
                }
            }
            for explicit in &resource.depends_on {
                if referenced.contains(explicit.as_str()) {
                    result.warnings.push(format!(
                        "{}: depends_on '{explicit}' is already implied by a reference",
                        resource.name
                    ));
                }
            }

            declarations.push(declaration);
        }

        if config.resources.is_empty() {
            result
                .warnings
                .push(String::from("Stack declares no resources"));
        }

        declarations
    }

    fn validate_outputs(config: &StackConfig, result: &mut ValidationResult) {
        let names: HashSet<&str> = config.resources.iter().map(|r| r.name.as_str()).collect();

        for (name, expr) in &config.outputs {
            let field = format!("outputs.{name}");
            match InputValue::parse(&serde_json::Value::String(expr.clone())) {
                Err(message) => result.errors.push(ValidationError::malformed(field, message)),
                Ok(value) => {
                    let refs = value.references();
                    if refs.is_empty() {
                        result
                            .warnings
                            .push(format!("{field} contains no reference"));
                    }
                    for r in refs {
                        if !names.contains(r.resource.as_str()) {
                            result.errors.push(ValidationError::UnknownReference {
                                resource: field.clone(),
                                target: r.resource.clone(),
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Stack names are lowercase alphanumeric with single hyphens, starting
/// with a letter.
fn is_valid_stack_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Resource names start with a letter and never contain `.` or `:`, which
/// would make references and state keys ambiguous.
fn is_valid_resource_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}
