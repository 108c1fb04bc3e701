//! Attribute and block schemas for the provider, its resources and data sources.
//!
//! The same schema drives configuration validation (see [`crate::validation`]),
//! planning (see [`crate::diff`]) and the `GetSchema` response.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The type of an attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    /// A string value.
    String,
    /// A 64-bit integer.
    Int64,
    /// A 64-bit floating point number.
    Float64,
    /// A boolean value.
    Bool,
    /// Ordered values.
    List(Box<AttributeType>),
    /// Unordered unique values.
    Set(Box<AttributeType>),
    /// String-keyed values.
    Map(Box<AttributeType>),
    /// Fixed set of typed fields.
    Object(HashMap<String, AttributeType>),
    /// Any JSON value.
    Dynamic,
}

impl AttributeType {
    /// Create a list type.
    pub fn list(element_type: AttributeType) -> Self {
        Self::List(Box::new(element_type))
    }

    /// Create a set type.
    pub fn set(element_type: AttributeType) -> Self {
        Self::Set(Box::new(element_type))
    }

    /// Create a map type.
    pub fn map(element_type: AttributeType) -> Self {
        Self::Map(Box::new(element_type))
    }

    /// Create an object type.
    pub fn object(attributes: HashMap<String, AttributeType>) -> Self {
        Self::Object(attributes)
    }
}

/// Presence flags of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttributeFlags {
    /// Must be configured.
    pub required: bool,
    /// May be configured.
    pub optional: bool,
    /// Filled in from the cloud when not configured.
    pub computed: bool,
    /// Redacted in plan output.
    pub sensitive: bool,
}

impl AttributeFlags {
    /// Create flags for a required attribute.
    pub fn required() -> Self {
        Self {
            required: true,
            ..Default::default()
        }
    }

    /// Create flags for an optional attribute.
    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Default::default()
        }
    }

    /// Read-only.
    pub fn computed() -> Self {
        Self {
            computed: true,
            ..Default::default()
        }
    }

    /// Optional, with the cloud filling in a value when unset.
    pub fn optional_computed() -> Self {
        Self {
            optional: true,
            computed: true,
            ..Default::default()
        }
    }

    /// Mark the attribute as sensitive.
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// A restriction on the values an attribute accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Constraint {
    /// The string must be one of `values`.
    StringInSlice {
        /// Accepted values.
        values: Vec<String>,
        /// Compare case-insensitively.
        #[serde(default)]
        ignore_case: bool,
    },
    /// The string length (in characters) must be within `min..=max`.
    StringLenBetween {
        /// Minimum length.
        min: usize,
        /// Maximum length.
        max: usize,
    },
    /// The string must start with `prefix`.
    StringPrefix {
        /// Required prefix.
        prefix: String,
    },
    /// The integer must be within `min..=max`.
    IntBetween {
        /// Minimum value.
        min: i64,
        /// Maximum value.
        max: i64,
    },
    /// The integer must be one of `values`.
    IntInSlice {
        /// Accepted values.
        values: Vec<i64>,
    },
    /// At least one of the constraints must hold.
    Any {
        /// Alternatives.
        of: Vec<Constraint>,
    },
}

impl Constraint {
    /// One of the given strings, case-sensitive.
    pub fn string_in(values: &[&str]) -> Self {
        Self::StringInSlice {
            values: values.iter().map(|v| v.to_string()).collect(),
            ignore_case: false,
        }
    }

    /// String length within bounds.
    pub fn string_len(min: usize, max: usize) -> Self {
        Self::StringLenBetween { min, max }
    }

    /// String prefix.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::StringPrefix {
            prefix: prefix.into(),
        }
    }

    /// Integer within bounds.
    pub fn int_between(min: i64, max: i64) -> Self {
        Self::IntBetween { min, max }
    }

    /// One of the given integers.
    pub fn int_in(values: &[i64]) -> Self {
        Self::IntInSlice {
            values: values.to_vec(),
        }
    }

    /// Any of the given constraints.
    pub fn any(of: Vec<Constraint>) -> Self {
        Self::Any { of }
    }

    /// Check a (non-null) value, returning a description of the violation.
    ///
    /// Values of the wrong JSON type are left to type validation.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        match self {
            Self::StringInSlice {
                values,
                ignore_case,
            } => match value.as_str() {
                Some(s) if values.iter().any(|v| {
                    if *ignore_case {
                        v.eq_ignore_ascii_case(s)
                    } else {
                        v == s
                    }
                }) =>
                {
                    Ok(())
                }
                Some(s) => Err(format!("expected one of {:?}, got {:?}", values, s)),
                None => Ok(()),
            },
            Self::StringLenBetween { min, max } => match value.as_str() {
                Some(s) => {
                    let len = s.chars().count();
                    if len < *min || len > *max {
                        Err(format!(
                            "expected length between {} and {}, got {}",
                            min, max, len
                        ))
                    } else {
                        Ok(())
                    }
                }
                None => Ok(()),
            },
            Self::StringPrefix { prefix } => match value.as_str() {
                Some(s) if !s.starts_with(prefix.as_str()) => {
                    Err(format!("expected prefix {:?}, got {:?}", prefix, s))
                }
                _ => Ok(()),
            },
            Self::IntBetween { min, max } => match value.as_i64() {
                Some(n) if n < *min || n > *max => {
                    Err(format!("expected value between {} and {}, got {}", min, max, n))
                }
                _ => Ok(()),
            },
            Self::IntInSlice { values } => match value.as_i64() {
                Some(n) if !values.contains(&n) => {
                    Err(format!("expected one of {:?}, got {}", values, n))
                }
                _ => Ok(()),
            },
            Self::Any { of } => {
                let mut failures = Vec::new();
                for constraint in of {
                    match constraint.check(value) {
                        Ok(()) => return Ok(()),
                        Err(e) => failures.push(e),
                    }
                }
                Err(failures.join("; or "))
            }
        }
    }
}

/// One attribute of a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// The type of the attribute.
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    /// Flags describing how the attribute can be used.
    #[serde(flatten)]
    pub flags: AttributeFlags,
    /// Human-readable description of the attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// A change replaces the resource instead of updating it.
    #[serde(default)]
    pub force_new: bool,
    /// Value used when the attribute is not configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Restriction on accepted values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<Constraint>,
    /// Sibling attributes that may not be set together with this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts_with: Vec<String>,
    /// Deprecation message; setting the attribute yields a warning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<String>,
}

macro_rules! presets {
    ($($name:ident => $ty:ident, $flags:ident;)*) => {
        $(
            #[doc = concat!("`", stringify!($ty), "` attribute with `", stringify!($flags), "` flags.")]
            pub fn $name() -> Self {
                Self::new(AttributeType::$ty, AttributeFlags::$flags())
            }
        )*
    };
}

impl Attribute {
    /// Create a new attribute with the given type and flags.
    pub fn new(attr_type: AttributeType, flags: AttributeFlags) -> Self {
        Self {
            attr_type,
            flags,
            description: None,
            force_new: false,
            default: None,
            constraint: None,
            conflicts_with: Vec::new(),
            deprecated: None,
        }
    }

    presets! {
        required_string => String, required;
        optional_string => String, optional;
        computed_string => String, computed;
        optional_computed_string => String, optional_computed;
        required_int64 => Int64, required;
        optional_int64 => Int64, optional;
        computed_int64 => Int64, computed;
        optional_computed_int64 => Int64, optional_computed;
        optional_bool => Bool, optional;
    }

    /// Optional set of strings, e.g. security group ids.
    pub fn optional_string_set() -> Self {
        Self::new(AttributeType::set(AttributeType::String), AttributeFlags::optional())
    }

    /// Optional string-to-string map, e.g. tags.
    pub fn optional_string_map() -> Self {
        Self::new(AttributeType::map(AttributeType::String), AttributeFlags::optional())
    }

    /// Set the description for this attribute.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark this attribute as forcing resource replacement when changed.
    pub fn with_force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Set a default value for this attribute.
    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Mark this attribute as sensitive.
    pub fn sensitive(mut self) -> Self {
        self.flags.sensitive = true;
        self
    }

    /// Also let the provider compute the value when it is not configured.
    pub fn with_computed(mut self) -> Self {
        self.flags.computed = true;
        self
    }

    /// Restrict accepted values.
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraint = Some(constraint);
        self
    }

    /// Declare sibling attributes that conflict with this one.
    pub fn with_conflicts_with(mut self, names: &[&str]) -> Self {
        self.conflicts_with = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Mark this attribute as deprecated.
    pub fn deprecated(mut self, message: impl Into<String>) -> Self {
        self.deprecated = Some(message.into());
        self
    }
}

/// The nesting mode for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockNestingMode {
    /// Zero or one.
    #[default]
    Single,
    /// Ordered.
    List,
    /// Unordered.
    Set,
    /// Keyed by string.
    Map,
}

/// A group of attributes, possibly with nested blocks of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// The attributes within this block.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, Attribute>,
    /// Nested blocks within this block.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub blocks: HashMap<String, NestedBlock>,
    /// Human-readable description of the block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Block {
    /// Create a new empty block.
    pub fn new() -> Self {
        Self {
            attributes: HashMap::new(),
            blocks: HashMap::new(),
            description: None,
        }
    }

    /// Add an attribute to this block.
    pub fn with_attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.attributes.insert(name.into(), attr);
        self
    }

    /// Add a nested block to this block.
    pub fn with_block(mut self, name: impl Into<String>, block: NestedBlock) -> Self {
        self.blocks.insert(name.into(), block);
        self
    }

    /// Set the description for this block.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

/// A nested block with its nesting mode and constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedBlock {
    /// The block definition.
    #[serde(flatten)]
    pub block: Block,
    /// How the block is nested (single, list, set, map).
    #[serde(default)]
    pub nesting_mode: BlockNestingMode,
    /// Minimum number of blocks required.
    #[serde(default)]
    pub min_items: u32,
    /// Maximum number of blocks allowed (0 = unlimited).
    #[serde(default)]
    pub max_items: u32,
}

impl NestedBlock {
    /// Create a single nested block (0 or 1 allowed).
    pub fn single(block: Block) -> Self {
        Self {
            block,
            nesting_mode: BlockNestingMode::Single,
            min_items: 0,
            max_items: 1,
        }
    }

    /// Create a list of nested blocks.
    pub fn list(block: Block) -> Self {
        Self {
            block,
            nesting_mode: BlockNestingMode::List,
            min_items: 0,
            max_items: 0,
        }
    }

    /// Create a set of nested blocks.
    pub fn set(block: Block) -> Self {
        Self {
            block,
            nesting_mode: BlockNestingMode::Set,
            min_items: 0,
            max_items: 0,
        }
    }

    /// Create a map of nested blocks.
    pub fn map(block: Block) -> Self {
        Self {
            block,
            nesting_mode: BlockNestingMode::Map,
            min_items: 0,
            max_items: 0,
        }
    }

    /// Set the minimum number of blocks required.
    pub fn with_min_items(mut self, min: u32) -> Self {
        self.min_items = min;
        self
    }

    /// Set the maximum number of blocks allowed.
    pub fn with_max_items(mut self, max: u32) -> Self {
        self.max_items = max;
        self
    }
}

/// Schema for a resource or data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Bumped when the stored state layout changes.
    #[serde(default)]
    pub version: u64,
    /// The root block containing all attributes and nested blocks.
    #[serde(flatten)]
    pub block: Block,
}

impl Schema {
    /// Create a new schema with the given version.
    pub fn new(version: u64) -> Self {
        Self {
            version,
            block: Block::new(),
        }
    }

    /// Create a schema at version 0.
    pub fn v0() -> Self {
        Self::new(0)
    }

    /// Add an attribute to the schema.
    pub fn with_attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.block.attributes.insert(name.into(), attr);
        self
    }

    /// Add a nested block to the schema.
    pub fn with_block(mut self, name: impl Into<String>, block: NestedBlock) -> Self {
        self.block.blocks.insert(name.into(), block);
        self
    }
}

/// Everything the provider exposes: its own configuration, resources and data sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProviderSchema {
    /// Schema for provider configuration.
    #[serde(default)]
    pub provider: Schema,
    /// Schemas for each resource type.
    #[serde(default)]
    pub resources: HashMap<String, Schema>,
    /// Schemas for each data source type.
    #[serde(default)]
    pub data_sources: HashMap<String, Schema>,
}

impl ProviderSchema {
    /// Create a new empty provider schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the provider configuration schema.
    pub fn with_provider_config(mut self, schema: Schema) -> Self {
        self.provider = schema;
        self
    }

    /// Add a resource schema.
    pub fn with_resource(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.resources.insert(name.into(), schema);
        self
    }

    /// Add a data source schema.
    pub fn with_data_source(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.data_sources.insert(name.into(), schema);
        self
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::v0()
    }
}

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    /// Blocks the operation.
    Error,
    /// Reported without blocking.
    Warning,
}

/// A validation or operation message tied to an optional attribute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The severity of the diagnostic.
    pub severity: DiagnosticSeverity,
    /// A short summary of the issue.
    pub summary: String,
    /// A detailed description of the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Dotted attribute path, e.g. `data_disks.0.size`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Diagnostic {
    /// Create an error diagnostic.
    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Create a warning diagnostic.
    pub fn warning(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Warning,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Add detail to this diagnostic.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Set the attribute path for this diagnostic.
    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_presets() {
        let zone = Attribute::optional_computed_string().with_force_new();
        assert!(zone.flags.optional && zone.flags.computed && !zone.flags.required);
        assert!(zone.force_new);

        let password = Attribute::optional_string().sensitive();
        assert!(password.flags.sensitive);

        let groups = Attribute::optional_string_set().with_description("Security group ids.");
        assert_eq!(groups.attr_type, AttributeType::set(AttributeType::String));
        assert_eq!(groups.description.as_deref(), Some("Security group ids."));

        let id = Attribute::computed_int64();
        assert!(id.flags.computed && !id.flags.optional);
    }

    #[test]
    fn test_schema_builder() {
        let schema = Schema::v0()
            .with_attribute("name", Attribute::required_string())
            .with_attribute("id", Attribute::computed_string())
            .with_block(
                "serverless_config",
                NestedBlock::single(
                    Block::new().with_attribute("auto_pause", Attribute::optional_bool()),
                ),
            );

        assert_eq!(schema.version, 0);
        assert!(schema.block.attributes.contains_key("name"));
        assert!(schema.block.attributes.contains_key("id"));
        assert!(schema.block.blocks.contains_key("serverless_config"));
    }

    #[test]
    fn test_provider_schema() {
        let provider_schema = ProviderSchema::new()
            .with_provider_config(
                Schema::v0().with_attribute("secret_key", Attribute::required_string().sensitive()),
            )
            .with_resource(
                "alicloud_instance",
                Schema::v0()
                    .with_attribute("name", Attribute::required_string())
                    .with_attribute("id", Attribute::computed_string()),
            )
            .with_data_source(
                "alicloud_ga_policies",
                Schema::v0().with_attribute("filter", Attribute::optional_string()),
            );

        assert!(provider_schema
            .provider
            .block
            .attributes
            .contains_key("secret_key"));
        assert!(provider_schema.resources.contains_key("alicloud_instance"));
        assert!(provider_schema.data_sources.contains_key("alicloud_ga_policies"));
    }

    #[test]
    fn test_diagnostic() {
        let err = Diagnostic::error("Invalid configuration")
            .with_detail("The value must be positive")
            .with_attribute("count");

        assert_eq!(err.severity, DiagnosticSeverity::Error);
        assert_eq!(err.summary, "Invalid configuration");
        assert_eq!(err.detail, Some("The value must be positive".to_string()));
        assert_eq!(err.attribute, Some("count".to_string()));
    }

    #[test]
    fn test_constraints() {
        let c = Constraint::string_in(&["PrePaid", "PostPaid"]);
        assert!(c.check(&serde_json::json!("PrePaid")).is_ok());
        assert!(c.check(&serde_json::json!("prepaid")).is_err());
        assert!(c.check(&serde_json::json!(1)).is_ok());

        let c = Constraint::string_len(2, 4);
        assert!(c.check(&serde_json::json!("ab")).is_ok());
        assert!(c.check(&serde_json::json!("abcde")).is_err());

        assert!(Constraint::prefix("ecs.")
            .check(&serde_json::json!("t5.small"))
            .is_err());
        assert!(Constraint::int_between(20, 500)
            .check(&serde_json::json!(40))
            .is_ok());
        assert!(Constraint::int_in(&[1, 2, 3, 6, 12])
            .check(&serde_json::json!(5))
            .is_err());

        let any = Constraint::any(vec![
            Constraint::int_between(1, 9),
            Constraint::int_in(&[12, 24, 36]),
        ]);
        assert!(any.check(&serde_json::json!(24)).is_ok());
        let err = any.check(&serde_json::json!(10)).unwrap_err();
        assert!(err.contains("; or "));
    }

    #[test]
    fn test_attribute_extensions() {
        let attr = Attribute::optional_string()
            .with_constraint(Constraint::string_in(&["a"]))
            .with_conflicts_with(&["other"])
            .deprecated("use other")
            .with_computed();
        assert!(attr.flags.optional && attr.flags.computed);
        assert_eq!(attr.conflicts_with, vec!["other".to_string()]);
        assert_eq!(attr.deprecated.as_deref(), Some("use other"));

        let json = serde_json::to_value(&attr).unwrap();
        assert_eq!(json["constraint"]["kind"], "string_in_slice");
        let back: Attribute = serde_json::from_value(json).unwrap();
        assert_eq!(back, attr);
    }

    #[test]
    fn test_nested_block_modes() {
        let single = NestedBlock::single(Block::new());
        assert_eq!(single.nesting_mode, BlockNestingMode::Single);
        assert_eq!(single.max_items, 1);

        let list = NestedBlock::list(Block::new())
            .with_min_items(1)
            .with_max_items(5);
        assert_eq!(list.nesting_mode, BlockNestingMode::List);
        assert_eq!(list.min_items, 1);
        assert_eq!(list.max_items, 5);
    }
}
