//! Provider configuration.
//!
//! The provider block is deserialised with `serde`; credentials, region and
//! account id fall back to the `ALICLOUD_*` environment variables when the
//! block leaves them unset.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::client::{AlicloudClient, Credentials, HttpTransport, Product, Transport, TransportOptions};
use crate::error::ProviderError;
use crate::resources::ResourceContext;
use crate::schema::{Attribute, Block, Constraint, Diagnostic, NestedBlock, Schema};

/// Environment variable for the access key id.
pub const ENV_ACCESS_KEY: &str = "ALICLOUD_ACCESS_KEY";
/// Environment variable for the access key secret.
pub const ENV_SECRET_KEY: &str = "ALICLOUD_SECRET_KEY";
/// Environment variable for an STS token.
pub const ENV_SECURITY_TOKEN: &str = "ALICLOUD_SECURITY_TOKEN";
/// Environment variable for the region.
pub const ENV_REGION: &str = "ALICLOUD_REGION";
/// Environment variable for the account id.
pub const ENV_ACCOUNT_ID: &str = "ALICLOUD_ACCOUNT_ID";

/// Default per-request read timeout, in seconds.
pub const DEFAULT_CLIENT_READ_TIMEOUT: u64 = 60;

/// Scheme used to reach the APIs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// TLS (the default).
    #[default]
    Https,
    /// Plain HTTP, for proxies and test endpoints.
    Http,
}

impl Protocol {
    fn scheme(self) -> &'static str {
        match self {
            Protocol::Https => "https",
            Protocol::Http => "http",
        }
    }
}

/// Per-product endpoint overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// ECS endpoint.
    pub ecs: Option<String>,
    /// RDS endpoint.
    pub rds: Option<String>,
    /// Global Accelerator endpoint.
    pub ga: Option<String>,
    /// Function Compute endpoint.
    pub fc: Option<String>,
    /// Log Service endpoint.
    pub log: Option<String>,
}

impl Endpoints {
    fn to_map(&self) -> HashMap<Product, String> {
        [
            (Product::Ecs, &self.ecs),
            (Product::Rds, &self.rds),
            (Product::Ga, &self.ga),
            (Product::Fc, &self.fc),
            (Product::Log, &self.log),
        ]
        .into_iter()
        .filter_map(|(product, endpoint)| {
            endpoint
                .as_deref()
                .filter(|e| !e.is_empty())
                .map(|e| (product, e.to_string()))
        })
        .collect()
    }
}

/// The provider block.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Access key id.
    pub access_key: Option<String>,
    /// Access key secret.
    pub secret_key: Option<String>,
    /// STS token.
    pub security_token: Option<String>,
    /// Region, e.g. `cn-hangzhou`.
    pub region: Option<String>,
    /// Account id, needed for Function Compute endpoints.
    pub account_id: Option<String>,
    /// API scheme.
    pub protocol: Protocol,
    /// Per-request read timeout in seconds.
    pub client_read_timeout: u64,
    /// When non-zero, replaces every retry timeout (seconds).
    pub max_retry_timeout: u64,
    /// Endpoint overrides.
    pub endpoints: Endpoints,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            access_key: None,
            secret_key: None,
            security_token: None,
            region: None,
            account_id: None,
            protocol: Protocol::Https,
            client_read_timeout: DEFAULT_CLIENT_READ_TIMEOUT,
            max_retry_timeout: 0,
            endpoints: Endpoints::default(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("security_token", &self.security_token.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .field("account_id", &self.account_id)
            .field("protocol", &self.protocol)
            .field("client_read_timeout", &self.client_read_timeout)
            .field("max_retry_timeout", &self.max_retry_timeout)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

fn or_env(value: Option<String>, key: &str, lookup: &impl Fn(&str) -> Option<String>) -> Option<String> {
    value
        .filter(|v| !v.is_empty())
        .or_else(|| lookup(key).filter(|v| !v.is_empty()))
}

impl ProviderConfig {
    /// Parse a provider block, applying environment fallbacks.
    pub fn from_value(value: &Value) -> Result<Self, ProviderError> {
        Self::from_value_with_env(value, |key| std::env::var(key).ok())
    }

    /// Like [`from_value`](Self::from_value) with a custom environment.
    pub fn from_value_with_env(
        value: &Value,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ProviderError> {
        let config: Self = match value {
            Value::Null => Self::default(),
            // Some hosts send single blocks as one-element lists.
            Value::Object(map) => {
                let mut map = map.clone();
                if let Some(Value::Array(blocks)) = map.get("endpoints") {
                    let first = blocks.first().cloned().unwrap_or_else(|| json!({}));
                    map.insert("endpoints".to_string(), first);
                }
                let map: serde_json::Map<String, Value> =
                    map.into_iter().filter(|(_, v)| !v.is_null()).collect();
                serde_json::from_value(Value::Object(map))?
            }
            _ => {
                return Err(ProviderError::Configuration(
                    "provider configuration must be an object".to_string(),
                ))
            }
        };
        Ok(config.with_env(&lookup))
    }

    fn with_env(mut self, lookup: &impl Fn(&str) -> Option<String>) -> Self {
        self.access_key = or_env(self.access_key.take(), ENV_ACCESS_KEY, lookup);
        self.secret_key = or_env(self.secret_key.take(), ENV_SECRET_KEY, lookup);
        self.security_token = or_env(self.security_token.take(), ENV_SECURITY_TOKEN, lookup);
        self.region = or_env(self.region.take(), ENV_REGION, lookup);
        self.account_id = or_env(self.account_id.take(), ENV_ACCOUNT_ID, lookup);
        self
    }

    /// Error diagnostics for missing required settings.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        let required = [
            ("access_key", &self.access_key, ENV_ACCESS_KEY),
            ("secret_key", &self.secret_key, ENV_SECRET_KEY),
            ("region", &self.region, ENV_REGION),
        ];
        for (attr, value, env) in required {
            if value.is_none() {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required provider setting: {}", attr))
                        .with_detail(format!("Set '{}' in the provider block or {}.", attr, env))
                        .with_attribute(attr),
                );
            }
        }
        if self.client_read_timeout == 0 {
            diagnostics.push(
                Diagnostic::error("client_read_timeout must be greater than 0")
                    .with_attribute("client_read_timeout"),
            );
        }
        diagnostics
    }

    /// Signing credentials.
    pub fn credentials(&self) -> Result<Credentials, ProviderError> {
        match (&self.access_key, &self.secret_key) {
            (Some(access_key_id), Some(access_key_secret)) => Ok(Credentials {
                access_key_id: access_key_id.clone(),
                access_key_secret: access_key_secret.clone(),
                security_token: self.security_token.clone(),
            }),
            _ => Err(ProviderError::Configuration(format!(
                "access_key and secret_key are required (or {} and {})",
                ENV_ACCESS_KEY, ENV_SECRET_KEY
            ))),
        }
    }

    /// The configured region.
    pub fn region(&self) -> Result<&str, ProviderError> {
        self.region
            .as_deref()
            .ok_or_else(|| ProviderError::Configuration(format!("region is required (or {})", ENV_REGION)))
    }

    /// HTTP transport settings.
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            scheme: self.protocol.scheme().to_string(),
            read_timeout: Duration::from_secs(self.client_read_timeout),
            account_id: self.account_id.clone(),
            endpoints: self.endpoints.to_map(),
        }
    }

    /// Provider-wide retry timeout override.
    pub fn max_retry_timeout(&self) -> Option<Duration> {
        (self.max_retry_timeout > 0).then(|| Duration::from_secs(self.max_retry_timeout))
    }

    /// Build the signing HTTP transport.
    pub fn http_transport(&self) -> Result<HttpTransport, ProviderError> {
        Ok(HttpTransport::new(
            self.credentials()?,
            self.region()?,
            self.transport_options(),
        )?)
    }

    /// Resource context over `transport`.
    pub fn context(&self, transport: Arc<dyn Transport>) -> Result<ResourceContext, ProviderError> {
        let mut client = AlicloudClient::new(transport, self.region()?);
        if let Some(account_id) = &self.account_id {
            client = client.with_account_id(account_id.clone());
        }
        Ok(ResourceContext::new(client).with_max_retry_timeout(self.max_retry_timeout()))
    }

    /// Schema of the provider block.
    pub fn schema() -> Schema {
        let endpoints = ["ecs", "rds", "ga", "fc", "log"]
            .into_iter()
            .fold(Block::new(), |block, product| {
                block.with_attribute(product, Attribute::optional_string())
            });
        Schema::v0()
            .with_attribute(
                "access_key",
                Attribute::optional_string().with_description("Access key id. Falls back to ALICLOUD_ACCESS_KEY."),
            )
            .with_attribute(
                "secret_key",
                Attribute::optional_string()
                    .sensitive()
                    .with_description("Access key secret. Falls back to ALICLOUD_SECRET_KEY."),
            )
            .with_attribute(
                "security_token",
                Attribute::optional_string()
                    .sensitive()
                    .with_description("STS token. Falls back to ALICLOUD_SECURITY_TOKEN."),
            )
            .with_attribute(
                "region",
                Attribute::optional_string().with_description("Region. Falls back to ALICLOUD_REGION."),
            )
            .with_attribute(
                "account_id",
                Attribute::optional_string()
                    .with_description("Account id used for Function Compute. Falls back to ALICLOUD_ACCOUNT_ID."),
            )
            .with_attribute(
                "protocol",
                Attribute::optional_string()
                    .with_default(json!("HTTPS"))
                    .with_constraint(Constraint::string_in(&["HTTPS", "HTTP"])),
            )
            .with_attribute(
                "client_read_timeout",
                Attribute::optional_int64()
                    .with_default(json!(DEFAULT_CLIENT_READ_TIMEOUT))
                    .with_description("Per-request read timeout in seconds."),
            )
            .with_attribute(
                "max_retry_timeout",
                Attribute::optional_int64()
                    .with_default(json!(0))
                    .with_description("Seconds; replaces every retry timeout when set."),
            )
            .with_block("endpoints", NestedBlock::single(endpoints))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ProviderConfig::from_value_with_env(&Value::Null, env(&[])).unwrap();
        assert_eq!(config.protocol, Protocol::Https);
        assert_eq!(config.client_read_timeout, 60);
        assert_eq!(config.max_retry_timeout(), None);
        assert_eq!(config.diagnostics().len(), 3);
    }

    #[test]
    fn test_environment_fallbacks() {
        let config = ProviderConfig::from_value_with_env(
            &json!({"access_key": "", "region": "cn-beijing"}),
            env(&[
                (ENV_ACCESS_KEY, "AK"),
                (ENV_SECRET_KEY, "SK"),
                (ENV_REGION, "cn-hangzhou"),
                (ENV_ACCOUNT_ID, "123"),
            ]),
        )
        .unwrap();
        assert_eq!(config.access_key.as_deref(), Some("AK"));
        assert_eq!(config.secret_key.as_deref(), Some("SK"));
        assert_eq!(config.region.as_deref(), Some("cn-beijing"));
        assert_eq!(config.account_id.as_deref(), Some("123"));
        assert!(config.diagnostics().is_empty());
        assert_eq!(config.credentials().unwrap().access_key_id, "AK");
    }

    #[test]
    fn test_missing_credentials() {
        let config = ProviderConfig::from_value_with_env(&json!({"region": "cn-hangzhou"}), env(&[]))
            .unwrap();
        let diagnostics = config.diagnostics();
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].attribute.as_deref(), Some("access_key"));
        assert!(matches!(config.credentials(), Err(ProviderError::Configuration(_))));
    }

    #[test]
    fn test_transport_options() {
        let config = ProviderConfig::from_value_with_env(
            &json!({
                "protocol": "HTTP",
                "client_read_timeout": 5,
                "max_retry_timeout": 30,
                "endpoints": [{"ecs": "127.0.0.1:8080", "rds": ""}],
            }),
            env(&[]),
        )
        .unwrap();
        let options = config.transport_options();
        assert_eq!(options.scheme, "http");
        assert_eq!(options.read_timeout, Duration::from_secs(5));
        assert_eq!(options.endpoints.get(&Product::Ecs).map(String::as_str), Some("127.0.0.1:8080"));
        assert!(!options.endpoints.contains_key(&Product::Rds));
        assert_eq!(config.max_retry_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_invalid_protocol() {
        let err = ProviderConfig::from_value_with_env(&json!({"protocol": "FTP"}), env(&[])).unwrap_err();
        assert!(matches!(err, ProviderError::Serialization(_)));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = ProviderConfig::from_value_with_env(
            &json!({"access_key": "AK", "secret_key": "very-secret"}),
            env(&[]),
        )
        .unwrap();
        let debug = format!("{:?}", config);
        assert!(debug.contains("AK"));
        assert!(!debug.contains("very-secret"));
    }
}
