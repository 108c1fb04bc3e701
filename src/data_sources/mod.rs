//! Data sources.

pub mod ga_custom_routing_endpoint_traffic_policies;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ProviderError;
use crate::resources::ResourceContext;
use crate::schema::{Diagnostic, Schema};

/// A read-only data source type.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Type name, e.g. `alicloud_ga_custom_routing_endpoint_traffic_policies`.
    fn type_name(&self) -> &'static str;

    /// The data source schema.
    fn schema(&self) -> Schema;

    /// Validate configuration.
    fn validate(&self, config: &Value) -> Vec<Diagnostic> {
        crate::validation::validate(&self.schema(), config)
    }

    /// Query the cloud and return `config` completed with computed values.
    async fn read(&self, ctx: &ResourceContext, config: Value) -> Result<Value, ProviderError>;
}
