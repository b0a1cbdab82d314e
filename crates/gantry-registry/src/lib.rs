// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory catalog of [`ToolDefinition`]s, with input/output schema
//! validation and network-domain matching.
//!
//! Registration happens at process start; after that the registry is
//! read-mostly and safe for concurrent reads without locking.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use gantry_core::ToolDefinition;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// JSON-pointer-ish dotted path to the offending field.
    pub field_path: String,
    /// Human-readable explanation.
    pub message: String,
}

/// An opaque input/output validator. The registry stores these type-erased
/// so handlers may supply a hand-rolled implementation without the registry
/// knowing the difference.
pub trait Schema: Send + Sync {
    /// Validate `value`, returning a normalized value on success or the
    /// full list of field errors on failure.
    fn validate(&self, value: &serde_json::Value) -> Result<serde_json::Value, Vec<FieldError>>;
}

/// The default [`Schema`] implementation, backed by a compiled JSON Schema.
pub struct JsonSchemaValidator {
    compiled: jsonschema::Validator,
}

impl JsonSchemaValidator {
    /// Compile a JSON Schema document. Returns `Err` if the schema itself is malformed.
    pub fn compile(schema: &serde_json::Value) -> Result<Self, String> {
        let compiled = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
        Ok(Self { compiled })
    }
}

impl Schema for JsonSchemaValidator {
    fn validate(&self, value: &serde_json::Value) -> Result<serde_json::Value, Vec<FieldError>> {
        let errors: Vec<FieldError> = self
            .compiled
            .iter_errors(value)
            .map(|e| FieldError {
                field_path: e.instance_path.to_string(),
                message: e.to_string(),
            })
            .collect();
        if errors.is_empty() {
            Ok(value.clone())
        } else {
            Err(errors)
        }
    }
}

/// A tool definition together with its opaque input/output validators.
pub struct RegisteredTool {
    /// The static tool metadata.
    pub definition: ToolDefinition,
    /// Input validator.
    pub input_schema: Arc<dyn Schema>,
    /// Output validator.
    pub output_schema: Arc<dyn Schema>,
}

/// Errors raised by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A tool with this id is already registered.
    #[error("tool '{id}' is already registered")]
    Duplicate {
        /// The conflicting id.
        id: String,
    },
    /// The tool definition itself violates its structural invariants.
    #[error("tool '{id}' failed validation: {reasons:?}")]
    InvalidDefinition {
        /// The offending id.
        id: String,
        /// Accumulated violation descriptions.
        reasons: Vec<String>,
    },
}

impl RegistryError {
    /// Bridge to the unified wire error taxonomy.
    #[must_use]
    pub fn code(&self) -> gantry_error::ErrorCode {
        gantry_error::ErrorCode::RegistrationError
    }
}

/// In-memory catalog of registered tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<RegisteredTool>>>,
}

impl ToolRegistry {
    /// Construct an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails with [`RegistryError::Duplicate`] if `id` is
    /// already present, or [`RegistryError::InvalidDefinition`] if the
    /// definition itself fails its structural invariants.
    pub fn register(
        &self,
        definition: ToolDefinition,
        input_schema: Arc<dyn Schema>,
        output_schema: Arc<dyn Schema>,
    ) -> Result<(), RegistryError> {
        if let Err(violations) = definition.validate() {
            return Err(RegistryError::InvalidDefinition {
                id: definition.id,
                reasons: violations.iter().map(|v| format!("{v:?}")).collect(),
            });
        }
        let mut tools = self.tools.write().expect("registry lock poisoned");
        if tools.contains_key(&definition.id) {
            return Err(RegistryError::Duplicate { id: definition.id });
        }
        tracing::info!(target: "gantry.registry", tool_id = %definition.id, "tool registered");
        tools.insert(
            definition.id.clone(),
            Arc::new(RegisteredTool {
                definition,
                input_schema,
                output_schema,
            }),
        );
        Ok(())
    }

    /// Fetch a registered tool's metadata by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ToolDefinition> {
        self.tools
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .map(|t| t.definition.clone())
    }

    /// List every registered tool id, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let tools = self.tools.read().expect("registry lock poisoned");
        let mut ids: Vec<String> = tools.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Validate a candidate input value against the tool's registered input schema.
    pub fn validate_input(&self, id: &str, value: &serde_json::Value) -> Result<serde_json::Value, Vec<FieldError>> {
        let tool = self.lookup_or_field_error(id)?;
        tool.input_schema.validate(value)
    }

    /// Validate a candidate output value against the tool's registered output schema.
    pub fn validate_output(&self, id: &str, value: &serde_json::Value) -> Result<serde_json::Value, Vec<FieldError>> {
        let tool = self.lookup_or_field_error(id)?;
        tool.output_schema.validate(value)
    }

    fn lookup_or_field_error(&self, id: &str) -> Result<Arc<RegisteredTool>, Vec<FieldError>> {
        self.tools
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| {
                vec![FieldError {
                    field_path: String::new(),
                    message: format!("unknown tool '{id}'"),
                }]
            })
    }

    /// Check whether `domain` is reachable by the given tool's network policy.
    /// Returns `None` if the tool is not registered.
    #[must_use]
    pub fn is_domain_allowed(&self, id: &str, domain: &str) -> Option<bool> {
        self.tools
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .map(|t| t.definition.network_policy.is_domain_allowed(domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{CostClass, NetworkPolicy, RetryPolicy};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn sample_tool(id: &str) -> ToolDefinition {
        ToolDefinition {
            id: id.into(),
            version: "1.0.0".into(),
            required_secrets: BTreeSet::new(),
            network_policy: NetworkPolicy::allow_all(),
            cost_class: CostClass::Cheap,
            estimated_cost_usd: 0.1,
            retry_policy: RetryPolicy::default(),
            timeout_ms: 30_000,
            idempotent: true,
        }
    }

    fn pass_through_schema() -> Arc<dyn Schema> {
        struct Noop;
        impl Schema for Noop {
            fn validate(&self, value: &serde_json::Value) -> Result<serde_json::Value, Vec<FieldError>> {
                Ok(value.clone())
            }
        }
        Arc::new(Noop)
    }

    #[test]
    fn register_then_get_round_trips() {
        let registry = ToolRegistry::new();
        registry
            .register(sample_tool("audit-website"), pass_through_schema(), pass_through_schema())
            .unwrap();
        assert!(registry.get("audit-website").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = ToolRegistry::new();
        registry
            .register(sample_tool("audit-website"), pass_through_schema(), pass_through_schema())
            .unwrap();
        let err = registry
            .register(sample_tool("audit-website"), pass_through_schema(), pass_through_schema())
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate { .. }));
    }

    #[test]
    fn invalid_definition_is_rejected() {
        let registry = ToolRegistry::new();
        let mut bad = sample_tool("Bad Id");
        bad.timeout_ms = 1;
        let err = registry.register(bad, pass_through_schema(), pass_through_schema()).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidDefinition { .. }));
    }

    #[test]
    fn list_is_sorted() {
        let registry = ToolRegistry::new();
        registry.register(sample_tool("zeta"), pass_through_schema(), pass_through_schema()).unwrap();
        registry.register(sample_tool("alpha"), pass_through_schema(), pass_through_schema()).unwrap();
        assert_eq!(registry.list(), vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn json_schema_validator_reports_field_errors() {
        let schema = json!({
            "type": "object",
            "required": ["url"],
            "properties": { "url": { "type": "string" } }
        });
        let validator = JsonSchemaValidator::compile(&schema).unwrap();
        assert!(validator.validate(&json!({"url": "https://example.com"})).is_ok());
        assert!(validator.validate(&json!({})).is_err());
    }

    #[test]
    fn is_domain_allowed_delegates_to_network_policy() {
        let registry = ToolRegistry::new();
        registry
            .register(sample_tool("audit-website"), pass_through_schema(), pass_through_schema())
            .unwrap();
        assert_eq!(registry.is_domain_allowed("audit-website", "example.com"), Some(true));
        assert_eq!(registry.is_domain_allowed("missing", "example.com"), None);
    }
}
