//! Managed resources.
//!
//! Each resource declares its schema and implements its lifecycle on top of
//! the product services. Lifecycle methods receive and return whole state
//! objects; [`ResourceData`] gives them Terraform-style access to the prior
//! and planned values.

pub mod fc_alias;
pub mod fc_function;
pub mod fc_service;
pub mod instance;
pub mod log_saved_search;
pub mod rds_clone_db_instance;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::client::AlicloudClient;
use crate::error::ProviderError;
use crate::schema::{Diagnostic, Schema};
use crate::types::PlanResult;

/// Operation timeouts for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Create timeout.
    pub create: Duration,
    /// Update timeout.
    pub update: Duration,
    /// Delete timeout.
    pub delete: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(10 * 60),
            update: Duration::from_secs(10 * 60),
            delete: Duration::from_secs(10 * 60),
        }
    }
}

/// What lifecycle methods get besides their state: the API client and
/// provider-wide retry settings.
#[derive(Debug, Clone)]
pub struct ResourceContext {
    /// API client.
    pub client: AlicloudClient,
    max_retry_timeout: Option<Duration>,
}

impl ResourceContext {
    /// Create a context around a client.
    pub fn new(client: AlicloudClient) -> Self {
        Self {
            client,
            max_retry_timeout: None,
        }
    }

    /// Override every retry timeout with `timeout`.
    pub fn with_max_retry_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.max_retry_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    /// The retry timeout to use where `default` would apply.
    pub fn retry_timeout(&self, default: Duration) -> Duration {
        self.max_retry_timeout.unwrap_or(default)
    }
}

/// A managed resource type.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Type name, e.g. `alicloud_instance`.
    fn type_name(&self) -> &'static str;

    /// The resource schema.
    fn schema(&self) -> Schema;

    /// Operation timeouts.
    fn timeouts(&self) -> Timeouts {
        Timeouts::default()
    }

    /// Whether a difference on `attr` from `old` to `new` should be ignored.
    ///
    /// `planned` is the whole planned object.
    fn diff_suppressed(&self, attr: &str, old: &Value, new: &Value, planned: &Value) -> bool {
        let _ = (attr, old, new, planned);
        false
    }

    /// Adjust a computed plan, e.g. to force replacement.
    fn customize_diff(&self, prior: &Value, plan: &mut PlanResult) -> Result<(), ProviderError> {
        let _ = (prior, plan);
        Ok(())
    }

    /// Validate configuration.
    fn validate(&self, config: &Value) -> Vec<Diagnostic> {
        crate::validation::validate(&self.schema(), config)
    }

    /// Create the resource and return its state.
    async fn create(&self, ctx: &ResourceContext, planned: Value) -> Result<Value, ProviderError>;

    /// Refresh state. `None` means the object no longer exists.
    async fn read(&self, ctx: &ResourceContext, state: Value)
        -> Result<Option<Value>, ProviderError>;

    /// Apply changes from `prior` to `planned` and return the new state.
    async fn update(
        &self,
        ctx: &ResourceContext,
        prior: Value,
        planned: Value,
    ) -> Result<Value, ProviderError>;

    /// Delete the resource.
    async fn delete(&self, ctx: &ResourceContext, state: Value) -> Result<(), ProviderError>;

    /// Import an existing object by id.
    async fn import(&self, ctx: &ResourceContext, id: &str) -> Result<Value, ProviderError> {
        self.read(ctx, json!({ "id": id }))
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("{} {}", self.type_name(), id)))
    }
}

/// Split a composite id such as `project:name` into exactly `parts` pieces.
pub fn parse_id(id: &str, parts: usize) -> Result<Vec<&str>, ProviderError> {
    let split: Vec<&str> = id.split(':').collect();
    if split.len() != parts || split.iter().any(|p| p.is_empty()) {
        return Err(ProviderError::InvalidRequest(format!(
            "invalid resource id {:?}, expected {} parts separated by ':'",
            id, parts
        )));
    }
    Ok(split)
}

/// Whether a JSON value is the zero value of its type.
pub fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

static NULL: Value = Value::Null;

/// Prior and planned values of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceData {
    prior: Value,
    planned: Value,
    is_new: bool,
}

impl ResourceData {
    /// Data for a resource being created.
    pub fn new_resource(planned: Value) -> Self {
        Self {
            prior: Value::Null,
            planned,
            is_new: true,
        }
    }

    /// Data for an update.
    pub fn update(prior: Value, planned: Value) -> Self {
        Self {
            prior,
            planned,
            is_new: false,
        }
    }

    /// Data for reading or deleting existing state.
    pub fn from_state(state: Value) -> Self {
        Self {
            prior: state.clone(),
            planned: state,
            is_new: false,
        }
    }

    /// Whether the resource is being created.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// The resource id.
    pub fn id(&self) -> &str {
        match self.planned.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id,
            _ => self
                .prior
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        }
    }

    /// Set the resource id.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.set("id", Value::String(id.into()));
    }

    /// Planned value of `key` (`Null` when absent).
    pub fn get(&self, key: &str) -> &Value {
        self.planned.get(key).unwrap_or(&NULL)
    }

    /// Prior value of `key` (`Null` when absent).
    pub fn get_prior(&self, key: &str) -> &Value {
        self.prior.get(key).unwrap_or(&NULL)
    }

    /// Planned value if it is not the zero value.
    pub fn get_ok(&self, key: &str) -> Option<&Value> {
        let value = self.get(key);
        (!is_zero(value)).then_some(value)
    }

    /// Planned string, empty when unset.
    pub fn get_str(&self, key: &str) -> &str {
        self.get(key).as_str().unwrap_or_default()
    }

    /// Planned string if non-empty.
    pub fn get_str_ok(&self, key: &str) -> Option<&str> {
        Some(self.get_str(key)).filter(|s| !s.is_empty())
    }

    /// Planned integer, zero when unset.
    pub fn get_i64(&self, key: &str) -> i64 {
        as_i64(self.get(key))
    }

    /// Planned boolean, false when unset.
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).as_bool().unwrap_or(false)
    }

    /// Planned list of strings.
    pub fn get_strings(&self, key: &str) -> Vec<String> {
        strings(self.get(key))
    }

    /// Prior list of strings.
    pub fn get_prior_strings(&self, key: &str) -> Vec<String> {
        strings(self.get_prior(key))
    }

    /// Whether `key` changes. For a new resource, any non-zero value counts.
    pub fn has_change(&self, key: &str) -> bool {
        if self.is_new {
            return !is_zero(self.get(key));
        }
        !values_equal(self.get_prior(key), self.get(key))
    }

    /// Whether any of `keys` changes.
    pub fn has_changes(&self, keys: &[&str]) -> bool {
        keys.iter().any(|k| self.has_change(k))
    }

    /// Set a value in the resulting state.
    pub fn set(&mut self, key: &str, value: Value) {
        if !self.planned.is_object() {
            self.planned = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.planned {
            map.insert(key.to_string(), value);
        }
    }

    /// Accept planned values as applied: later `has_change` calls on them
    /// report no change.
    pub fn commit(&mut self, keys: &[&str]) {
        if !self.prior.is_object() {
            self.prior = Value::Object(Map::new());
        }
        for key in keys {
            let value = self.get(key).clone();
            if let Value::Object(map) = &mut self.prior {
                map.insert(key.to_string(), value);
            }
        }
    }

    /// The planned object.
    pub fn planned(&self) -> &Value {
        &self.planned
    }

    /// Consume into the planned object.
    pub fn into_state(self) -> Value {
        self.planned
    }
}

/// Integer from a JSON number or numeric string.
pub fn as_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or_default(),
        Value::String(s) => s.parse().unwrap_or_default(),
        _ => 0,
    }
}

/// Strings from a JSON array (non-strings are skipped).
pub fn strings(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// JSON equality where missing equals null and `1` equals `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            let keys: std::collections::BTreeSet<&String> = x.keys().chain(y.keys()).collect();
            keys.into_iter().all(|k| {
                values_equal(x.get(k).unwrap_or(&NULL), y.get(k).unwrap_or(&NULL))
            })
        }
        _ => a == b,
    }
}

/// Compare two JSON documents ignoring key order.
pub fn json_bytes_equal(a: &[u8], b: &[u8]) -> bool {
    match (
        serde_json::from_slice::<Value>(a),
        serde_json::from_slice::<Value>(b),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Elements of `new` missing from `old`, and elements of `old` missing from `new`.
pub fn set_diff(old: &[String], new: &[String]) -> (Vec<String>, Vec<String>) {
    let added = new.iter().filter(|v| !old.contains(v)).cloned().collect();
    let removed = old.iter().filter(|v| !new.contains(v)).cloned().collect();
    (added, removed)
}
