//! Sending signed requests over HTTP.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

use super::error::ApiError;
use super::signer::{self, Credentials};
use super::{ApiRequest, Product};

/// Maximum length of a response body written to the log.
const MAX_LOG_BODY_LENGTH: usize = 200;

/// Something that can execute an [`ApiRequest`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the request and return the decoded JSON response.
    ///
    /// An empty response body decodes to `Value::Null`.
    async fn send(&self, request: &ApiRequest) -> Result<Value, ApiError>;
}

/// Settings for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// `https` or `http`.
    pub scheme: String,
    /// Timeout applied to each HTTP exchange.
    pub read_timeout: Duration,
    /// Account id, used to derive Function Compute endpoints.
    pub account_id: Option<String>,
    /// Endpoint overrides per product. A value with a scheme
    /// (`http://127.0.0.1:8080`) is used verbatim; a bare host gets the
    /// configured scheme and any host prefix.
    pub endpoints: HashMap<Product, String>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            read_timeout: Duration::from_secs(60),
            account_id: None,
            endpoints: HashMap::new(),
        }
    }
}

/// Truncate a response body for logging.
fn sanitize_for_log(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let truncated: String = text.chars().take(MAX_LOG_BODY_LENGTH).collect();
    let truncated = if truncated.len() < text.len() {
        format!("{}... [truncated, {} bytes total]", truncated, body.len())
    } else {
        truncated
    };
    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

/// [`Transport`] backed by `reqwest`, signing each request.
pub struct HttpTransport {
    client: Client,
    credentials: Credentials,
    region: String,
    options: TransportOptions,
}

impl HttpTransport {
    /// Create a transport.
    pub fn new(
        credentials: Credentials,
        region: impl Into<String>,
        options: TransportOptions,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .user_agent(concat!("hemmer-provider-alicloud/", env!("CARGO_PKG_VERSION")))
            .timeout(options.read_timeout)
            .build()
            .map_err(|e| ApiError::client("SDK.ClientInitFailed", e.to_string()))?;

        Ok(Self {
            client,
            credentials,
            region: region.into(),
            options,
        })
    }

    /// Resolve the base URL and `host` header value for a request.
    pub fn resolve(&self, request: &ApiRequest) -> (String, String) {
        let endpoint = self
            .options
            .endpoints
            .get(&request.product)
            .cloned()
            .unwrap_or_else(|| {
                request
                    .product
                    .default_endpoint(&self.region, self.options.account_id.as_deref())
            });

        let base = if endpoint.contains("://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            let host = match &request.host_prefix {
                Some(prefix) => format!("{}.{}", prefix, endpoint),
                None => endpoint,
            };
            format!("{}://{}", self.options.scheme, host.trim_end_matches('/'))
        };

        let host = base
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&base)
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        (base, host)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let (base, host) = self.resolve(request);
        let body = match &request.body {
            Some(body) => serde_json::to_vec(body)
                .map_err(|e| ApiError::client("SDK.InvalidRequest", e.to_string()))?,
            None => Vec::new(),
        };

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), host);
        headers.insert("x-acs-action".to_string(), request.action.clone());
        headers.insert(
            "x-acs-version".to_string(),
            request.product.version().to_string(),
        );
        headers.insert(
            "x-acs-date".to_string(),
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        );
        headers.insert(
            "x-acs-signature-nonce".to_string(),
            Uuid::new_v4().simple().to_string(),
        );
        if request.body.is_some() {
            headers.insert("content-type".to_string(), "application/json".to_string());
        }
        signer::sign(
            &self.credentials,
            &request.method,
            &request.path,
            &request.query,
            &mut headers,
            &body,
        )?;

        let query = signer::canonical_query(&request.query);
        let url = if query.is_empty() {
            format!("{}{}", base, request.path)
        } else {
            format!("{}{}?{}", base, request.path, query)
        };
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| ApiError::client("SDK.InvalidRequest", e.to_string()))?;

        debug!(
            product = %request.product,
            action = %request.action,
            method = %request.method,
            path = %request.path,
            "sending request"
        );

        let mut builder = self.client.request(method, &url);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::timeout(e.to_string())
            } else {
                ApiError::unreachable(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let request_id = ["x-acs-request-id", "x-log-requestid", "x-fc-request-id"]
            .iter()
            .find_map(|name| response.headers().get(*name))
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::timeout(e.to_string())
            } else {
                ApiError::unreachable(e.to_string())
            }
        })?;

        if !(200..300).contains(&status) {
            let err = ApiError::from_body(status, &bytes).with_request_id(request_id);
            error!(
                product = %request.product,
                action = %request.action,
                status,
                code = %err.code,
                body = %sanitize_for_log(&bytes),
                "API error"
            );
            return Err(err);
        }

        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::new("SDK.InvalidResponse", e.to_string(), status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transport(options: TransportOptions) -> HttpTransport {
        HttpTransport::new(
            Credentials {
                access_key_id: "ak".to_string(),
                access_key_secret: "sk".to_string(),
                security_token: None,
            },
            "cn-hangzhou",
            options,
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_default_endpoints() {
        let t = transport(TransportOptions::default());
        let req = ApiRequest::rpc(Product::Ecs, "DescribeInstances", &json!({}));
        assert_eq!(
            t.resolve(&req),
            (
                "https://ecs.cn-hangzhou.aliyuncs.com".to_string(),
                "ecs.cn-hangzhou.aliyuncs.com".to_string()
            )
        );

        let req = ApiRequest::roa(Product::Log, "GetSavedSearch", "GET", "/savedsearches/a")
            .with_host_prefix("proj");
        assert_eq!(t.resolve(&req).1, "proj.cn-hangzhou.log.aliyuncs.com");
    }

    #[test]
    fn test_resolve_override_with_scheme_skips_prefix() {
        let mut options = TransportOptions::default();
        options
            .endpoints
            .insert(Product::Log, "http://127.0.0.1:8080/".to_string());
        let t = transport(options);
        let req = ApiRequest::roa(Product::Log, "GetSavedSearch", "GET", "/savedsearches/a")
            .with_host_prefix("proj");
        assert_eq!(
            t.resolve(&req),
            ("http://127.0.0.1:8080".to_string(), "127.0.0.1:8080".to_string())
        );
    }

    #[test]
    fn test_resolve_bare_override_uses_scheme() {
        let mut options = TransportOptions {
            scheme: "http".to_string(),
            ..Default::default()
        };
        options
            .endpoints
            .insert(Product::Rds, "rds.example.internal".to_string());
        let t = transport(options);
        let req = ApiRequest::rpc(Product::Rds, "DescribeDBInstances", &json!({}));
        assert_eq!(t.resolve(&req).0, "http://rds.example.internal");
    }

    #[test]
    fn test_sanitize_for_log_truncates() {
        let long = "x".repeat(500);
        let logged = sanitize_for_log(long.as_bytes());
        assert!(logged.starts_with(&"x".repeat(200)));
        assert!(logged.contains("truncated, 500 bytes total"));
        assert_eq!(sanitize_for_log(b"short\nbody"), "shortbody");
    }
}
