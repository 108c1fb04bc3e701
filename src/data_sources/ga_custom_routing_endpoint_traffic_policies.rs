//! `alicloud_ga_custom_routing_endpoint_traffic_policies`: traffic policies
//! of Global Accelerator custom routing endpoints.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::DataSource;
use crate::error::ProviderError;
use crate::resources::{strings, ResourceContext};
use crate::schema::{Attribute, AttributeFlags, AttributeType, Schema};
use crate::services::{params, GaService};

/// The traffic policy data source. Policy ids are `endpoint_id:policy_id`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GaCustomRoutingEndpointTrafficPolicies;

fn policy_type() -> AttributeType {
    let port_range = AttributeType::object(
        [
            ("from_port".to_string(), AttributeType::Int64),
            ("to_port".to_string(), AttributeType::Int64),
        ]
        .into_iter()
        .collect(),
    );
    AttributeType::object(
        [
            ("id", AttributeType::String),
            ("accelerator_id", AttributeType::String),
            ("listener_id", AttributeType::String),
            ("endpoint_group_id", AttributeType::String),
            ("endpoint_id", AttributeType::String),
            ("custom_routing_endpoint_traffic_policy_id", AttributeType::String),
            ("address", AttributeType::String),
        ]
        .into_iter()
        .map(|(name, t)| (name.to_string(), t))
        .chain([("port_ranges".to_string(), AttributeType::list(port_range))])
        .collect(),
    )
}

/// State entry for one API policy item.
fn policy_state(item: &Value) -> Value {
    let endpoint_id = item["EndpointId"].as_str().unwrap_or_default();
    let policy_id = item["PolicyId"].as_str().unwrap_or_default();
    let port_ranges: Vec<Value> = item["PortRanges"]
        .as_array()
        .map(|ranges| {
            ranges
                .iter()
                .map(|r| json!({ "from_port": r["FromPort"], "to_port": r["ToPort"] }))
                .collect()
        })
        .unwrap_or_default();
    json!({
        "id": format!("{}:{}", endpoint_id, policy_id),
        "accelerator_id": item["AcceleratorId"],
        "listener_id": item["ListenerId"],
        "endpoint_group_id": item["EndpointGroupId"],
        "endpoint_id": endpoint_id,
        "custom_routing_endpoint_traffic_policy_id": policy_id,
        "address": item["Address"],
        "port_ranges": port_ranges,
    })
}

#[async_trait]
impl DataSource for GaCustomRoutingEndpointTrafficPolicies {
    fn type_name(&self) -> &'static str {
        "alicloud_ga_custom_routing_endpoint_traffic_policies"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("accelerator_id", Attribute::required_string())
            .with_attribute(
                "ids",
                Attribute::new(
                    AttributeType::list(AttributeType::String),
                    AttributeFlags::optional_computed(),
                ),
            )
            .with_attribute("listener_id", Attribute::optional_string())
            .with_attribute("endpoint_group_id", Attribute::optional_string())
            .with_attribute("endpoint_id", Attribute::optional_string())
            .with_attribute("address", Attribute::optional_string())
            .with_attribute(
                "custom_routing_endpoint_traffic_policies",
                Attribute::new(AttributeType::list(policy_type()), AttributeFlags::computed()),
            )
    }

    async fn read(&self, ctx: &ResourceContext, mut config: Value) -> Result<Value, ProviderError> {
        let filter = params([
            ("AcceleratorId", config["accelerator_id"].clone()),
            ("ListenerId", config["listener_id"].clone()),
            ("EndpointGroupId", config["endpoint_group_id"].clone()),
            ("EndpointId", config["endpoint_id"].clone()),
            ("Address", config["address"].clone()),
        ]);
        let wanted = strings(&config["ids"]);

        let policies: Vec<Value> = GaService::new(&ctx.client)
            .list_custom_routing_endpoint_traffic_policies(&filter)
            .await?
            .iter()
            .map(policy_state)
            .filter(|p| {
                wanted.is_empty() || p["id"].as_str().is_some_and(|id| wanted.iter().any(|w| w == id))
            })
            .collect();
        debug!(count = policies.len(), "listed custom routing endpoint traffic policies");

        let ids: Vec<Value> = policies.iter().map(|p| p["id"].clone()).collect();
        config["ids"] = Value::Array(ids);
        config["custom_routing_endpoint_traffic_policies"] = Value::Array(policies);
        config["id"] = json!(config["accelerator_id"].as_str().unwrap_or_default());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::AlicloudClient;
    use crate::testing::MockTransport;
    use std::sync::Arc;

    fn ctx(mock: &Arc<MockTransport>) -> ResourceContext {
        ResourceContext::new(AlicloudClient::new(mock.clone(), "cn-hangzhou"))
    }

    fn item(endpoint: &str, policy: &str) -> Value {
        json!({
            "AcceleratorId": "ga-1",
            "ListenerId": "lsr-1",
            "EndpointGroupId": "epg-1",
            "EndpointId": endpoint,
            "PolicyId": policy,
            "Address": "192.168.192.2",
            "PortRanges": [{"FromPort": 1, "ToPort": 2}]
        })
    }

    #[tokio::test]
    async fn test_read_maps_policies() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            "ListCustomRoutingEndpointTrafficPolicies",
            json!({"PolicyItems": [item("ep-1", "pol-1")]}),
        );

        let state = GaCustomRoutingEndpointTrafficPolicies
            .read(&ctx(&mock), json!({"accelerator_id": "ga-1", "listener_id": "lsr-1"}))
            .await
            .unwrap();

        assert_eq!(state["ids"], json!(["ep-1:pol-1"]));
        let policy = &state["custom_routing_endpoint_traffic_policies"][0];
        assert_eq!(policy["custom_routing_endpoint_traffic_policy_id"], "pol-1");
        assert_eq!(policy["endpoint_group_id"], "epg-1");
        assert_eq!(policy["address"], "192.168.192.2");
        assert_eq!(policy["port_ranges"], json!([{"from_port": 1, "to_port": 2}]));

        let request = mock.last_request("ListCustomRoutingEndpointTrafficPolicies").unwrap();
        assert_eq!(request.param("AcceleratorId"), Some("ga-1"));
        assert_eq!(request.param("ListenerId"), Some("lsr-1"));
        assert_eq!(request.param("EndpointId"), None);
    }

    #[tokio::test]
    async fn test_read_filters_by_ids() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            "ListCustomRoutingEndpointTrafficPolicies",
            json!({"PolicyItems": [item("ep-1", "pol-1"), item("ep-1", "pol-2")]}),
        );

        let state = GaCustomRoutingEndpointTrafficPolicies
            .read(&ctx(&mock), json!({"accelerator_id": "ga-1", "ids": ["ep-1:pol-2"]}))
            .await
            .unwrap();
        assert_eq!(state["ids"], json!(["ep-1:pol-2"]));
        assert_eq!(state["custom_routing_endpoint_traffic_policies"].as_array().unwrap().len(), 1);

        let state = GaCustomRoutingEndpointTrafficPolicies
            .read(&ctx(&mock), json!({"accelerator_id": "ga-1", "ids": ["ep-1:pol-2_fake"]}))
            .await
            .unwrap();
        assert_eq!(state["ids"], json!([]));
        assert_eq!(state["custom_routing_endpoint_traffic_policies"], json!([]));
    }
}
