//! Payload schema registry.
//!
//! Schemas are addressed by `(event_type, schema_version)` and registered
//! explicitly at startup. There is no registration-by-import: the registry
//! a process uses is exactly the one it builds.
//!
//! Unknown event types on the write path are rejected; what to do with
//! unknown types on the read path is the caller's policy (the dispatcher
//! logs and forwards them untouched).

use crate::envelope::EventEnvelope;
use crate::error::{EnvelopeError, EnvelopeResult};
use serde_json::Value;
use std::collections::HashMap;

/// Expected JSON type of a payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
        }
    }
}

/// A single payload field expectation.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// Declarative schema for one event payload version.
#[derive(Debug, Clone)]
pub struct PayloadSchema {
    pub fields: Vec<FieldSpec>,
}

impl PayloadSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    fn validate(&self, payload: &Value) -> EnvelopeResult<()> {
        let object = payload
            .as_object()
            .ok_or_else(|| EnvelopeError::SchemaMismatch {
                field: "payload".to_string(),
                reason: "payload must be a JSON object".to_string(),
            })?;

        for spec in &self.fields {
            match object.get(spec.name) {
                Some(value) => {
                    if !spec.kind.matches(value) {
                        return Err(EnvelopeError::SchemaMismatch {
                            field: spec.name.to_string(),
                            reason: format!("expected {}", spec.kind.name()),
                        });
                    }
                }
                None if spec.required => {
                    return Err(EnvelopeError::SchemaMismatch {
                        field: spec.name.to_string(),
                        reason: "required field missing".to_string(),
                    });
                }
                None => {}
            }
        }

        Ok(())
    }
}

/// Registry of payload schemas keyed by `(event_type, schema_version)`.
pub struct SchemaRegistry {
    schemas: HashMap<(String, u32), PayloadSchema>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            schemas: HashMap::new(),
        }
    }

    /// Create a registry pre-loaded with the built-in event schemas.
    pub fn with_builtin_schemas() -> Self {
        let mut registry = Self::new();

        registry.register(
            "order_created",
            1,
            PayloadSchema::new(vec![
                FieldSpec::required("items", FieldKind::Array),
                FieldSpec::required("total_minor_units", FieldKind::Integer),
                FieldSpec::required("currency", FieldKind::String),
            ]),
        );
        registry.register(
            "order_updated",
            1,
            PayloadSchema::new(vec![
                FieldSpec::required("status", FieldKind::String),
                FieldSpec::optional("total_minor_units", FieldKind::Integer),
                FieldSpec::optional("currency", FieldKind::String),
            ]),
        );
        registry.register(
            "order_cancelled",
            1,
            PayloadSchema::new(vec![
                FieldSpec::required("reason", FieldKind::String),
                FieldSpec::optional("refund_minor_units", FieldKind::Integer),
            ]),
        );
        registry.register(
            "notification_sent",
            1,
            PayloadSchema::new(vec![
                FieldSpec::required("channel", FieldKind::String),
                FieldSpec::required("subject", FieldKind::String),
                FieldSpec::optional("body", FieldKind::String),
            ]),
        );

        registry
    }

    /// Register a schema for an event type and version.
    pub fn register(&mut self, event_type: &str, version: u32, schema: PayloadSchema) {
        self.schemas
            .insert((event_type.to_string(), version), schema);
    }

    /// Whether a schema is registered for this type and version.
    pub fn contains(&self, event_type: &str, version: u32) -> bool {
        self.schemas
            .contains_key(&(event_type.to_string(), version))
    }

    /// Validate an envelope's payload against its registered schema.
    ///
    /// Fails with [`EnvelopeError::UnknownSchema`] when nothing is
    /// registered for `(event_type, schema_version)`.
    pub fn validate(&self, envelope: &EventEnvelope) -> EnvelopeResult<()> {
        let schema = self
            .schemas
            .get(&(envelope.event_type.clone(), envelope.schema_version))
            .ok_or_else(|| EnvelopeError::UnknownSchema {
                event_type: envelope.event_type.clone(),
                schema_version: envelope.schema_version,
            })?;

        schema.validate(&envelope.payload)
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::with_builtin_schemas()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_order() -> EventEnvelope {
        EventEnvelope::new(
            "order_created",
            1,
            "tenant-1",
            "order-1",
            "pulse-api",
            json!({
                "items": [{"sku": "SKU-9", "quantity": 1}],
                "total_minor_units": 1299,
                "currency": "USD",
            }),
        )
    }

    #[test]
    fn test_builtin_schemas_registered() {
        let registry = SchemaRegistry::with_builtin_schemas();
        assert!(registry.contains("order_created", 1));
        assert!(registry.contains("order_updated", 1));
        assert!(registry.contains("order_cancelled", 1));
        assert!(registry.contains("notification_sent", 1));
        assert!(!registry.contains("order_created", 2));
    }

    #[test]
    fn test_validate_accepts_valid_payload() {
        let registry = SchemaRegistry::with_builtin_schemas();
        registry.validate(&valid_order()).unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_required_field() {
        let registry = SchemaRegistry::with_builtin_schemas();
        let mut envelope = valid_order();
        envelope.payload = json!({"items": [], "currency": "USD"});

        match registry.validate(&envelope) {
            Err(EnvelopeError::SchemaMismatch { field, .. }) => {
                assert_eq!(field, "total_minor_units");
            }
            other => panic!("expected schema mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_wrong_type() {
        let registry = SchemaRegistry::with_builtin_schemas();
        let mut envelope = valid_order();
        envelope.payload = json!({
            "items": "not-an-array",
            "total_minor_units": 100,
            "currency": "USD",
        });

        match registry.validate(&envelope) {
            Err(EnvelopeError::SchemaMismatch { field, reason }) => {
                assert_eq!(field, "items");
                assert!(reason.contains("array"));
            }
            other => panic!("expected schema mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_non_object_payload() {
        let registry = SchemaRegistry::with_builtin_schemas();
        let mut envelope = valid_order();
        envelope.payload = json!([1, 2, 3]);
        assert!(registry.validate(&envelope).is_err());
    }

    #[test]
    fn test_validate_unknown_schema() {
        let registry = SchemaRegistry::with_builtin_schemas();
        let mut envelope = valid_order();
        envelope.event_type = "payment_settled".to_string();

        match registry.validate(&envelope) {
            Err(EnvelopeError::UnknownSchema {
                event_type,
                schema_version,
            }) => {
                assert_eq!(event_type, "payment_settled");
                assert_eq!(schema_version, 1);
            }
            other => panic!("expected unknown schema, got {:?}", other),
        }
    }

    #[test]
    fn test_optional_field_type_still_checked() {
        let registry = SchemaRegistry::with_builtin_schemas();
        let mut envelope = valid_order();
        envelope.event_type = "order_updated".to_string();
        envelope.payload = json!({"status": "confirmed", "total_minor_units": "oops"});
        assert!(registry.validate(&envelope).is_err());

        envelope.payload = json!({"status": "confirmed"});
        registry.validate(&envelope).unwrap();
    }
}
