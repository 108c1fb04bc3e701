//! Global Accelerator.

use serde_json::{json, Value};

use super::items;
use crate::client::{AlicloudClient, ApiError, Product};
use crate::error::ProviderError;

/// Page size for list calls.
pub const PAGE_SIZE: u64 = 50;

/// Global Accelerator API helpers.
#[derive(Debug, Clone, Copy)]
pub struct GaService<'a> {
    client: &'a AlicloudClient,
}

impl<'a> GaService<'a> {
    /// Wrap a client.
    pub fn new(client: &'a AlicloudClient) -> Self {
        Self { client }
    }

    /// Call a GA action.
    pub async fn call(&self, action: &str, mut request: Value) -> Result<Value, ApiError> {
        if let Value::Object(map) = &mut request {
            map.entry("RegionId")
                .or_insert_with(|| Value::String(self.client.region().to_string()));
        }
        self.client.rpc(Product::Ga, action, request).await
    }

    /// All traffic policies matching `filter`, following pagination.
    ///
    /// `filter` holds the request parameters other than paging, e.g.
    /// `AcceleratorId` and `ListenerId`.
    pub async fn list_custom_routing_endpoint_traffic_policies(
        &self,
        filter: &Value,
    ) -> Result<Vec<Value>, ProviderError> {
        let mut policies = Vec::new();
        let mut page = 1u64;
        loop {
            let mut request = filter.clone();
            request["PageNumber"] = json!(page);
            request["PageSize"] = json!(PAGE_SIZE);
            let response = self
                .call("ListCustomRoutingEndpointTrafficPolicies", request)
                .await?;
            let batch = items(&response, "/PolicyItems");
            let count = batch.len() as u64;
            policies.extend(batch);
            if count < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(policies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use std::sync::Arc;

    fn page(start: usize, len: usize) -> Value {
        let items: Vec<Value> = (start..start + len)
            .map(|i| json!({"PolicyId": format!("policy-{}", i)}))
            .collect();
        json!({ "PolicyItems": items })
    }

    #[tokio::test]
    async fn test_list_follows_pages() {
        let mock = Arc::new(MockTransport::new());
        mock.respond_once("ListCustomRoutingEndpointTrafficPolicies", page(0, 50));
        mock.respond_once("ListCustomRoutingEndpointTrafficPolicies", page(50, 3));
        let client = AlicloudClient::new(mock.clone(), "cn-hangzhou");

        let policies = GaService::new(&client)
            .list_custom_routing_endpoint_traffic_policies(&json!({"AcceleratorId": "ga-1"}))
            .await
            .unwrap();
        assert_eq!(policies.len(), 53);

        let requests = mock.requests_for("ListCustomRoutingEndpointTrafficPolicies");
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].param("PageNumber"), Some("1"));
        assert_eq!(requests[1].param("PageNumber"), Some("2"));
        assert_eq!(requests[1].param("PageSize"), Some("50"));
        assert_eq!(requests[1].param("AcceleratorId"), Some("ga-1"));
    }
}
