//! Plan computation.
//!
//! [`plan_resource`] turns the host's proposed state into a planned state and
//! a list of attribute changes, consulting the resource for suppressed
//! differences and final customisation.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::ProviderError;
use crate::resources::{is_zero, values_equal, Resource};
use crate::schema::{Attribute, AttributeType, Block, BlockNestingMode, NestedBlock};
use crate::types::{AttributeChange, PlanResult};

/// Compute the plan for one resource.
///
/// `prior` is `None` for a resource that does not exist yet. A `null`
/// proposed state plans a destroy.
pub fn plan_resource(
    resource: &dyn Resource,
    prior: Option<&Value>,
    proposed: &Value,
) -> Result<PlanResult, ProviderError> {
    let prior = prior.filter(|p| !p.is_null());

    if proposed.is_null() {
        return Ok(plan_destroy(prior));
    }

    let mut planned = proposed.as_object().cloned().ok_or_else(|| {
        ProviderError::InvalidRequest("proposed state must be a JSON object".to_string())
    })?;
    let schema = resource.schema();
    let prior_obj = prior.and_then(Value::as_object);

    fill_block(&schema.block, &mut planned, prior_obj);
    if let Some(id) = prior_obj.and_then(|p| p.get("id")) {
        planned.insert("id".to_string(), id.clone());
    }

    let mut changes = Vec::new();
    let mut requires_replace = false;

    match prior_obj {
        None => {
            let sorted: BTreeMap<&String, &Value> = planned.iter().collect();
            for (name, value) in sorted {
                if !value.is_null() {
                    changes.push(AttributeChange::added(name.as_str(), value.clone()));
                }
            }
        }
        Some(prior_obj) => {
            let snapshot = Value::Object(planned.clone());
            let attributes: BTreeMap<&String, &Attribute> = schema.block.attributes.iter().collect();
            for (name, attr) in attributes {
                let old = prior_obj.get(name).unwrap_or(&Value::Null);
                let new = planned.get(name).cloned().unwrap_or(Value::Null);
                if attr_equal(&attr.attr_type, old, &new) {
                    continue;
                }
                if resource.diff_suppressed(name, old, &new, &snapshot) {
                    planned.insert(name.clone(), old.clone());
                    continue;
                }
                changes.push(change(name, old, &new));
                if attr.force_new {
                    requires_replace = true;
                }
            }

            let blocks: BTreeMap<&String, &NestedBlock> = schema.block.blocks.iter().collect();
            for (name, nested) in blocks {
                let old = prior_obj.get(name).unwrap_or(&Value::Null);
                let new = planned.get(name).cloned().unwrap_or(Value::Null);
                if block_equal(nested, old, &new) {
                    continue;
                }
                if resource.diff_suppressed(name, old, &new, &snapshot) {
                    planned.insert(name.clone(), old.clone());
                    continue;
                }
                changes.push(change(name, old, &new));
                if block_forces_new(nested, old, &new) {
                    requires_replace = true;
                }
            }
        }
    }

    let mut result = PlanResult::with_changes(Value::Object(planned), changes, requires_replace);
    resource.customize_diff(prior.unwrap_or(&Value::Null), &mut result)?;
    Ok(result)
}

fn plan_destroy(prior: Option<&Value>) -> PlanResult {
    let changes = prior
        .and_then(Value::as_object)
        .map(|obj| {
            let sorted: BTreeMap<&String, &Value> = obj.iter().collect();
            sorted
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| AttributeChange::removed(k.as_str(), v.clone()))
                .collect()
        })
        .unwrap_or_default();
    PlanResult::with_changes(Value::Null, changes, false)
}

fn change(name: &str, old: &Value, new: &Value) -> AttributeChange {
    match (old.is_null(), new.is_null()) {
        (true, _) => AttributeChange::added(name, new.clone()),
        (false, true) => AttributeChange::removed(name, old.clone()),
        (false, false) => AttributeChange::modified(name, old.clone(), new.clone()),
    }
}

/// Fill defaults and carry computed values forward from prior state.
fn fill_block(block: &Block, obj: &mut Map<String, Value>, prior: Option<&Map<String, Value>>) {
    for (name, attr) in &block.attributes {
        if obj.get(name).is_some_and(|v| !v.is_null()) {
            continue;
        }
        if let Some(default) = &attr.default {
            obj.insert(name.clone(), default.clone());
        } else if attr.flags.computed {
            if let Some(value) = prior.and_then(|p| p.get(name)).filter(|v| !v.is_null()) {
                obj.insert(name.clone(), value.clone());
            }
        }
    }

    for (name, nested) in &block.blocks {
        let prior_value = prior.and_then(|p| p.get(name));
        match (nested.nesting_mode, obj.get_mut(name)) {
            (BlockNestingMode::Single, Some(Value::Object(inner))) => {
                fill_block(&nested.block, inner, prior_value.and_then(Value::as_object));
            }
            (BlockNestingMode::List | BlockNestingMode::Set, Some(Value::Array(items))) => {
                let prior_items = prior_value.and_then(Value::as_array);
                for (i, item) in items.iter_mut().enumerate() {
                    if let Value::Object(inner) = item {
                        let prior_item = prior_items
                            .and_then(|p| p.get(i))
                            .and_then(Value::as_object);
                        fill_block(&nested.block, inner, prior_item);
                    }
                }
            }
            _ => {}
        }
    }
}

fn attr_equal(attr_type: &AttributeType, a: &Value, b: &Value) -> bool {
    match (attr_type, a, b) {
        (AttributeType::Set(_), Value::Array(x), Value::Array(y)) => unordered_equal(x, y),
        // unset and the zero value read back from the API are the same
        (_, Value::Null, v) | (_, v, Value::Null) => is_zero(v),
        _ => values_equal(a, b),
    }
}

fn block_equal(nested: &NestedBlock, a: &Value, b: &Value) -> bool {
    match (nested.nesting_mode, a, b) {
        (BlockNestingMode::Set, Value::Array(x), Value::Array(y)) => unordered_equal(x, y),
        // an empty list and an absent block are the same configuration
        (_, Value::Array(x), Value::Null) | (_, Value::Null, Value::Array(x)) => x.is_empty(),
        _ => values_equal(a, b),
    }
}

fn unordered_equal(x: &[Value], y: &[Value]) -> bool {
    x.len() == y.len()
        && x.iter().all(|a| y.iter().any(|b| values_equal(a, b)))
        && y.iter().all(|b| x.iter().any(|a| values_equal(a, b)))
}

fn block_forces_new(nested: &NestedBlock, old: &Value, new: &Value) -> bool {
    let forcing: Vec<(&String, &Attribute)> = nested
        .block
        .attributes
        .iter()
        .filter(|(_, a)| a.force_new)
        .collect();
    if forcing.is_empty() {
        return false;
    }

    let as_items = |v: &Value| -> Vec<Value> {
        match v {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        }
    };
    let old_items = as_items(old);
    let new_items = as_items(new);
    let len = old_items.len().max(new_items.len());

    (0..len).any(|i| {
        let old_item = old_items.get(i).unwrap_or(&Value::Null);
        let new_item = new_items.get(i).unwrap_or(&Value::Null);
        forcing.iter().any(|(name, attr)| {
            let a = old_item.get(name.as_str()).unwrap_or(&Value::Null);
            let b = new_item.get(name.as_str()).unwrap_or(&Value::Null);
            !attr_equal(&attr.attr_type, a, b)
        })
    })
}
