//! Plain Rust forms of the protocol messages the provider produces.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One top-level attribute or block that a plan changes.
///
/// `before` is `None` when the attribute is being set for the first time and
/// `after` is `None` when it is being removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Attribute or block name.
    pub path: String,
    /// Prior value.
    pub before: Option<Value>,
    /// Planned value.
    pub after: Option<Value>,
}

impl AttributeChange {
    /// A change from `before` to `after`.
    pub fn new(path: impl Into<String>, before: Option<Value>, after: Option<Value>) -> Self {
        Self {
            path: path.into(),
            before,
            after,
        }
    }

    /// An attribute set for the first time.
    pub fn added(path: impl Into<String>, value: Value) -> Self {
        Self::new(path, None, Some(value))
    }

    /// An attribute being cleared.
    pub fn removed(path: impl Into<String>, value: Value) -> Self {
        Self::new(path, Some(value), None)
    }

    /// An attribute changing value.
    pub fn modified(path: impl Into<String>, before: Value, after: Value) -> Self {
        Self::new(path, Some(before), Some(after))
    }
}

/// Empty bytes stand for an absent value on the wire.
fn from_wire(bytes: &[u8]) -> Option<Value> {
    if bytes.is_empty() {
        None
    } else {
        serde_json::from_slice(bytes).ok()
    }
}

fn to_wire(value: Option<Value>) -> Vec<u8> {
    value
        .and_then(|v| serde_json::to_vec(&v).ok())
        .unwrap_or_default()
}

impl From<crate::generated::AttributeChange> for AttributeChange {
    fn from(proto: crate::generated::AttributeChange) -> Self {
        Self::new(proto.path, from_wire(&proto.before), from_wire(&proto.after))
    }
}

impl From<AttributeChange> for crate::generated::AttributeChange {
    fn from(change: AttributeChange) -> Self {
        Self {
            path: change.path,
            before: to_wire(change.before),
            after: to_wire(change.after),
        }
    }
}

/// Outcome of planning one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    /// State the apply is expected to produce; `null` for a destroy.
    pub planned_state: Value,
    /// What changes, sorted by path.
    pub changes: Vec<AttributeChange>,
    /// Whether the object has to be destroyed and created again.
    pub requires_replace: bool,
}

impl PlanResult {
    /// A plan that leaves `state` as it is.
    pub fn no_change(state: Value) -> Self {
        Self::with_changes(state, Vec::new(), false)
    }

    /// A plan with explicit changes.
    pub fn with_changes(planned_state: Value, changes: Vec<AttributeChange>, requires_replace: bool) -> Self {
        Self {
            planned_state,
            changes,
            requires_replace,
        }
    }

    /// The change to `path`, if any.
    pub fn change(&self, path: &str) -> Option<&AttributeChange> {
        self.changes.iter().find(|c| c.path == path)
    }
}

/// State produced by an import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedResource {
    /// Resource type, e.g. `alicloud_instance`.
    pub resource_type: String,
    /// State as a subsequent read would return it.
    pub state: Value,
}

impl ImportedResource {
    /// Pair a type name with its state.
    pub fn new(resource_type: impl Into<String>, state: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            state,
        }
    }
}

/// Answer to GetMetadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderMetadata {
    /// Resource type names.
    pub resources: Vec<String>,
    /// Data source type names.
    pub data_sources: Vec<String>,
    /// Optional protocol features.
    pub capabilities: ServerCapabilities,
}

/// Optional protocol features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServerCapabilities {
    /// Plan is called with a `null` proposed state for destroys.
    pub plan_destroy: bool,
}

/// Protocol version printed in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// First field of the handshake line.
pub const HANDSHAKE_PREFIX: &str = "HEMMER_PROVIDER";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribute_change_wire_form() {
        let change = AttributeChange::modified("instance_type", json!("ecs.g6.large"), json!("ecs.g6.xlarge"));
        let proto: crate::generated::AttributeChange = change.clone().into();
        assert_eq!(proto.path, "instance_type");
        assert_eq!(proto.before, br#""ecs.g6.large""#.to_vec());
        assert_eq!(AttributeChange::from(proto), change);

        let added: crate::generated::AttributeChange =
            AttributeChange::added("tags", json!({"env": "prod"})).into();
        assert!(added.before.is_empty());
        let back = AttributeChange::from(added);
        assert_eq!(back.before, None);
        assert_eq!(back.after, Some(json!({"env": "prod"})));
    }

    #[test]
    fn test_plan_result_lookup() {
        let plan = PlanResult::with_changes(
            json!({"id": "i-1", "instance_name": "web"}),
            vec![AttributeChange::modified("instance_name", json!("app"), json!("web"))],
            false,
        );
        assert_eq!(plan.change("instance_name").and_then(|c| c.after.clone()), Some(json!("web")));
        assert!(plan.change("tags").is_none());
        assert!(PlanResult::no_change(json!({})).changes.is_empty());
    }

    #[test]
    fn test_imported_resource() {
        let imported = ImportedResource::new("alicloud_instance", json!({"id": "i-1"}));
        assert_eq!(imported.resource_type, "alicloud_instance");
        assert_eq!(imported.state["id"], "i-1");
    }

    #[test]
    fn test_handshake_constants() {
        assert_eq!(format!("{}|{}", HANDSHAKE_PREFIX, PROTOCOL_VERSION), "HEMMER_PROVIDER|1");
    }
}
