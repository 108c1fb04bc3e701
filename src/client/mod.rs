//! Alibaba Cloud API client.
//!
//! Products are called either RPC style (an action plus flattened query
//! parameters, used by ECS, RDS and GA) or ROA style (a REST path with a JSON
//! body, used by Function Compute and Log Service). Both go through a
//! [`Transport`], which signs and sends the request.

pub mod error;
pub mod signer;
pub mod transport;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub use error::{ApiError, CLIENT_TIMEOUT};
pub use signer::Credentials;
pub use transport::{HttpTransport, Transport, TransportOptions};

/// How a product expects its requests to be shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    /// Action name plus query parameters, always `POST /`.
    Rpc,
    /// REST path and JSON body.
    Roa,
}

/// An Alibaba Cloud product this provider talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Product {
    /// Elastic Compute Service.
    Ecs,
    /// ApsaraDB RDS.
    Rds,
    /// Global Accelerator.
    Ga,
    /// Function Compute.
    Fc,
    /// Simple Log Service.
    Log,
}

impl Product {
    /// All products, in a stable order.
    pub const ALL: [Product; 5] = [
        Product::Ecs,
        Product::Rds,
        Product::Ga,
        Product::Fc,
        Product::Log,
    ];

    /// API version sent as `x-acs-version`.
    pub fn version(&self) -> &'static str {
        match self {
            Product::Ecs => "2014-05-26",
            Product::Rds => "2014-08-15",
            Product::Ga => "2019-11-20",
            Product::Fc => "2021-04-06",
            Product::Log => "2020-12-30",
        }
    }

    /// Request style of the product.
    pub fn style(&self) -> ApiStyle {
        match self {
            Product::Ecs | Product::Rds | Product::Ga => ApiStyle::Rpc,
            Product::Fc | Product::Log => ApiStyle::Roa,
        }
    }

    /// Endpoint used when the provider configuration does not override it.
    ///
    /// Function Compute endpoints are scoped to the account.
    pub fn default_endpoint(&self, region: &str, account_id: Option<&str>) -> String {
        match self {
            Product::Ecs => format!("ecs.{}.aliyuncs.com", region),
            Product::Rds => "rds.aliyuncs.com".to_string(),
            Product::Ga => "ga.cn-hangzhou.aliyuncs.com".to_string(),
            Product::Fc => match account_id {
                Some(account) => format!("{}.{}.fc.aliyuncs.com", account, region),
                None => format!("{}.fc.aliyuncs.com", region),
            },
            Product::Log => format!("{}.log.aliyuncs.com", region),
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Product::Ecs => "ecs",
            Product::Rds => "rds",
            Product::Ga => "ga",
            Product::Fc => "fc",
            Product::Log => "log",
        };
        f.write_str(name)
    }
}

/// A single API call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// Target product.
    pub product: Product,
    /// Action name, sent as `x-acs-action`.
    pub action: String,
    /// HTTP method.
    pub method: String,
    /// Request path; `/` for RPC calls.
    pub path: String,
    /// Query parameters (RPC parameters live here).
    pub query: Vec<(String, String)>,
    /// JSON body for ROA calls.
    pub body: Option<Value>,
    /// Prefix prepended to the product host, e.g. the Log Service project.
    pub host_prefix: Option<String>,
}

impl ApiRequest {
    /// An RPC call. `params` is flattened into query parameters.
    pub fn rpc(product: Product, action: impl Into<String>, params: &Value) -> Self {
        Self {
            product,
            action: action.into(),
            method: "POST".to_string(),
            path: "/".to_string(),
            query: flatten_params(params),
            body: None,
            host_prefix: None,
        }
    }

    /// A ROA call against `path`.
    pub fn roa(
        product: Product,
        action: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            product,
            action: action.into(),
            method: method.into(),
            path: path.into(),
            query: Vec::new(),
            body: None,
            host_prefix: None,
        }
    }

    /// Attach a JSON body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Add a query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Prefix the product host.
    pub fn with_host_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.host_prefix = Some(prefix.into());
        self
    }

    /// Look up a query parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Flatten a JSON object into RPC query parameters.
///
/// Nested objects become `Parent.Child`, array elements `Parent.1`,
/// `Parent.2`, and so on. Nulls are dropped.
pub fn flatten_params(params: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    flatten_into("", params, &mut out);
    out
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (key, v) in map {
                let key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(&key, v, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(&format!("{}.{}", prefix, i + 1), v, out);
            }
        }
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
        Value::Bool(b) => out.push((prefix.to_string(), b.to_string())),
        Value::Number(n) => out.push((prefix.to_string(), n.to_string())),
    }
}

/// Shared handle used by services to call APIs.
#[derive(Clone)]
pub struct AlicloudClient {
    transport: Arc<dyn Transport>,
    region: String,
    account_id: Option<String>,
}

impl fmt::Debug for AlicloudClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlicloudClient")
            .field("region", &self.region)
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

impl AlicloudClient {
    /// Create a client over a transport.
    pub fn new(transport: Arc<dyn Transport>, region: impl Into<String>) -> Self {
        Self {
            transport,
            region: region.into(),
            account_id: None,
        }
    }

    /// Set the account id.
    pub fn with_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// The configured region.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// The configured account id, if any.
    pub fn account_id(&self) -> Option<&str> {
        self.account_id.as_deref()
    }

    /// Send a request.
    pub async fn call(&self, request: ApiRequest) -> Result<Value, ApiError> {
        debug!(product = %request.product, action = %request.action, "calling API");
        self.transport.send(&request).await
    }

    /// Shorthand for an RPC call.
    pub async fn rpc(
        &self,
        product: Product,
        action: &str,
        params: Value,
    ) -> Result<Value, ApiError> {
        self.call(ApiRequest::rpc(product, action, &params)).await
    }
}
