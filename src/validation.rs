//! Checking configuration values against a [`Schema`].
//!
//! ```
//! use hemmer_provider_alicloud::schema::{Attribute, Constraint, Schema};
//! use hemmer_provider_alicloud::validation::validate;
//! use serde_json::json;
//!
//! let schema = Schema::v0()
//!     .with_attribute("instance_type", Attribute::required_string())
//!     .with_attribute(
//!         "instance_charge_type",
//!         Attribute::optional_string().with_constraint(Constraint::string_in(&["PrePaid", "PostPaid"])),
//!     );
//!
//! assert!(validate(&schema, &json!({"instance_type": "ecs.g6.large"})).is_empty());
//!
//! let diagnostics = validate(&schema, &json!({"instance_charge_type": "Monthly"}));
//! assert_eq!(diagnostics.len(), 2);
//! ```

use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};

use crate::schema::{
    Attribute, AttributeType, Block, BlockNestingMode, Constraint, Diagnostic, DiagnosticSeverity,
    NestedBlock, Schema,
};

/// Validate `value` against `schema`.
///
/// - required attributes must be present and non-null; computed-only
///   attributes are ignored
/// - values must match their declared type
/// - constraints must hold, element by element for lists and sets
/// - attributes declared as conflicting may not both be set
/// - setting a deprecated attribute produces a warning
/// - nested blocks are checked recursively, including min/max items
pub fn validate(schema: &Schema, value: &Value) -> Vec<Diagnostic> {
    let mut validator = Validator::default();
    validator.block(&schema.block, value, "");
    validator.diagnostics
}

/// [`validate`] as a `Result`; warnings alone pass.
pub fn validate_result(schema: &Schema, value: &Value) -> Result<(), Vec<Diagnostic>> {
    let diagnostics = validate(schema, value);
    if has_errors(&diagnostics) {
        Err(diagnostics)
    } else {
        Ok(())
    }
}

/// Whether `value` produces no error diagnostics.
pub fn is_valid(schema: &Schema, value: &Value) -> bool {
    !has_errors(&validate(schema, value))
}

/// Whether any diagnostic is an error.
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics
        .iter()
        .any(|d| d.severity == DiagnosticSeverity::Error)
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", base, name)
    }
}

fn is_set(value: Option<&Value>) -> bool {
    !matches!(value, None | Some(Value::Null))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_int64(value: &Value) -> bool {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => n.as_i64().is_some(),
        Value::Number(n) => n
            .as_f64()
            .is_some_and(|f| f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64),
        _ => false,
    }
}

#[derive(Default)]
struct Validator {
    diagnostics: Vec<Diagnostic>,
}

impl Validator {
    fn error(&mut self, summary: String, detail: Option<String>, path: &str) {
        let mut diagnostic = Diagnostic::error(summary);
        if let Some(detail) = detail {
            diagnostic = diagnostic.with_detail(detail);
        }
        if !path.is_empty() {
            diagnostic = diagnostic.with_attribute(path);
        }
        self.diagnostics.push(diagnostic);
    }

    fn type_error(&mut self, path: &str, expected: &str, got: &Value) {
        self.error(
            format!("Invalid type for attribute '{}'", path),
            Some(format!("Expected {}, got {}", expected, kind(got))),
            path,
        );
    }

    fn block(&mut self, block: &Block, value: &Value, path: &str) {
        let obj = match value {
            Value::Object(obj) => obj,
            Value::Null => return,
            other => {
                self.error("Expected object".to_string(), Some(format!("Got {}", kind(other))), path);
                return;
            }
        };

        for (name, attr) in &block.attributes {
            self.attribute(attr, obj.get(name), &join_path(path, name));
        }
        self.conflicts(block, obj, path);
        for (name, nested) in &block.blocks {
            self.nested(nested, obj.get(name), &join_path(path, name));
        }
    }

    fn conflicts(&mut self, block: &Block, obj: &Map<String, Value>, path: &str) {
        let mut pairs = BTreeSet::new();
        for (name, attr) in &block.attributes {
            if !is_set(obj.get(name)) {
                continue;
            }
            for other in attr.conflicts_with.iter().filter(|o| is_set(obj.get(o.as_str()))) {
                pairs.insert(if name < other {
                    (name.as_str(), other.as_str())
                } else {
                    (other.as_str(), name.as_str())
                });
            }
        }
        for (first, second) in pairs {
            let first = join_path(path, first);
            self.error(
                format!("Conflicting attributes '{}' and '{}'", first, join_path(path, second)),
                Some("Only one of these attributes may be set".to_string()),
                &first,
            );
        }
    }

    fn attribute(&mut self, attr: &Attribute, value: Option<&Value>, path: &str) {
        if attr.flags.computed && !attr.flags.optional && !attr.flags.required {
            return;
        }
        let value = match value {
            Some(v) if !v.is_null() => v,
            _ => {
                if attr.flags.required {
                    self.error(
                        format!("Missing required attribute '{}'", path),
                        Some("This attribute is required and must be provided".to_string()),
                        path,
                    );
                }
                return;
            }
        };

        self.value_type(&attr.attr_type, value, path);
        if let Some(constraint) = &attr.constraint {
            match value {
                Value::Array(items) => {
                    for (i, item) in items.iter().enumerate() {
                        self.constraint(constraint, item, &format!("{}.{}", path, i));
                    }
                }
                _ => self.constraint(constraint, value, path),
            }
        }
        if let Some(message) = &attr.deprecated {
            self.diagnostics.push(
                Diagnostic::warning(format!("Attribute '{}' is deprecated", path))
                    .with_detail(message.clone())
                    .with_attribute(path),
            );
        }
    }

    fn constraint(&mut self, constraint: &Constraint, value: &Value, path: &str) {
        if let Err(detail) = constraint.check(value) {
            self.error(format!("Invalid value for attribute '{}'", path), Some(detail), path);
        }
    }

    fn value_type(&mut self, attr_type: &AttributeType, value: &Value, path: &str) {
        match attr_type {
            AttributeType::String if !value.is_string() => self.type_error(path, "string", value),
            AttributeType::Int64 if !is_int64(value) => self.type_error(path, "int64", value),
            AttributeType::Float64 if !value.is_number() => self.type_error(path, "float64", value),
            AttributeType::Bool if !value.is_boolean() => self.type_error(path, "bool", value),
            AttributeType::List(element) | AttributeType::Set(element) => match value.as_array() {
                Some(items) => {
                    for (i, item) in items.iter().enumerate() {
                        self.value_type(element, item, &format!("{}.{}", path, i));
                    }
                }
                None => {
                    let expected = if matches!(attr_type, AttributeType::Set(_)) { "set" } else { "list" };
                    self.type_error(path, expected, value);
                }
            },
            AttributeType::Map(element) => match value.as_object() {
                Some(obj) => {
                    for (key, item) in obj {
                        self.value_type(element, item, &format!("{}.{}", path, key));
                    }
                }
                None => self.type_error(path, "map", value),
            },
            AttributeType::Object(fields) => match value.as_object() {
                Some(obj) => self.object_fields(fields, obj, path),
                None => self.type_error(path, "object", value),
            },
            _ => {}
        }
    }

    /// Object fields carry no presence flags; only present fields are typed.
    fn object_fields(&mut self, fields: &HashMap<String, AttributeType>, obj: &Map<String, Value>, path: &str) {
        for (name, field_type) in fields {
            if let Some(value) = obj.get(name) {
                self.value_type(field_type, value, &join_path(path, name));
            }
        }
    }

    fn item_count(&mut self, nested: &NestedBlock, len: usize, path: &str) {
        let len = len as u32;
        if len < nested.min_items {
            self.error(
                format!("Block '{}' requires at least {} item(s), got {}", path, nested.min_items, len),
                None,
                path,
            );
        }
        if nested.max_items > 0 && len > nested.max_items {
            self.error(
                format!("Block '{}' allows at most {} item(s), got {}", path, nested.max_items, len),
                None,
                path,
            );
        }
    }

    fn nested(&mut self, nested: &NestedBlock, value: Option<&Value>, path: &str) {
        let value = match value {
            Some(v) if !v.is_null() => v,
            _ => {
                if nested.min_items > 0 {
                    let summary = match nested.nesting_mode {
                        BlockNestingMode::Single => format!("Missing required block '{}'", path),
                        _ => format!("Block '{}' requires at least {} item(s)", path, nested.min_items),
                    };
                    self.error(summary, None, path);
                }
                return;
            }
        };

        match (nested.nesting_mode, value) {
            (BlockNestingMode::Single, v) => self.block(&nested.block, v, path),
            (BlockNestingMode::List | BlockNestingMode::Set, Value::Array(items)) => {
                self.item_count(nested, items.len(), path);
                for (i, item) in items.iter().enumerate() {
                    self.block(&nested.block, item, &format!("{}.{}", path, i));
                }
            }
            (BlockNestingMode::Map, Value::Object(items)) => {
                self.item_count(nested, items.len(), path);
                for (key, item) in items {
                    self.block(&nested.block, item, &format!("{}.{}", path, key));
                }
            }
            (BlockNestingMode::Map, other) => self.error(
                format!("Expected map for block '{}'", path),
                Some(format!("Got {}", kind(other))),
                path,
            ),
            (_, other) => self.error(
                format!("Expected list for block '{}'", path),
                Some(format!("Got {}", kind(other))),
                path,
            ),
        }
    }
}
