//! Function Compute.
//!
//! Function Compute is a ROA API: every object lives under a versioned path
//! such as `/2021-04-06/services/{service}/functions/{function}`. Describe
//! calls treat a response whose name does not match the requested id as not
//! found.

use std::time::Duration;

use serde_json::Value;

use super::{map_not_found, not_found, wait_presence, Presence};
use crate::client::{AlicloudClient, ApiError, ApiRequest, Product};
use crate::error::ProviderError;
use crate::resources::parse_id;

/// Poll interval of the Function Compute waiters.
pub const FC_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Function Compute API helpers.
#[derive(Debug, Clone, Copy)]
pub struct FcService<'a> {
    client: &'a AlicloudClient,
}

/// Path under the API version, e.g. `/2021-04-06/services/svc`.
pub fn fc_path(suffix: &str) -> String {
    format!("/{}{}", Product::Fc.version(), suffix)
}

/// Split an async-invoke config id, `service:function[:qualifier]`.
pub fn parse_async_config_id(id: &str) -> Result<(String, String, Option<String>), ProviderError> {
    let parts: Vec<&str> = id.split(':').collect();
    match parts.as_slice() {
        [service, function] if !service.is_empty() && !function.is_empty() => {
            Ok((service.to_string(), function.to_string(), None))
        }
        [service, function, qualifier]
            if !service.is_empty() && !function.is_empty() && !qualifier.is_empty() =>
        {
            Ok((service.to_string(), function.to_string(), Some(qualifier.to_string())))
        }
        _ => Err(ProviderError::InvalidRequest(format!(
            "invalid async invoke config id {:?}, expected service:function[:qualifier]",
            id
        ))),
    }
}

impl<'a> FcService<'a> {
    /// Wrap a client.
    pub fn new(client: &'a AlicloudClient) -> Self {
        Self { client }
    }

    /// Send a ROA request under the API version prefix.
    pub async fn call(
        &self,
        action: &str,
        method: &str,
        suffix: &str,
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        let mut request = ApiRequest::roa(Product::Fc, action, method, fc_path(suffix));
        if let Some(body) = body {
            request = request.with_body(body);
        }
        self.client.call(request).await
    }

    /// Describe a service by name.
    pub async fn describe_service(&self, id: &str) -> Result<Value, ProviderError> {
        let object = self
            .call("GetService", "GET", &format!("/services/{}", id), None)
            .await
            .map_err(|e| map_not_found(e, &["ServiceNotFound"], "FC service", id))?;
        if object["serviceName"] != id {
            return Err(not_found("FC service", id));
        }
        Ok(object)
    }

    /// Wait until a service exists or is gone.
    pub async fn wait_for_service(
        &self,
        id: &str,
        presence: Presence,
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        wait_presence(presence, timeout, FC_POLL_INTERVAL, || self.describe_service(id)).await
    }

    /// Describe a function, id `service:function`.
    pub async fn describe_function(&self, id: &str) -> Result<Value, ProviderError> {
        let parts = parse_id(id, 2)?;
        let (service, name) = (parts[0], parts[1]);
        let object = self
            .call(
                "GetFunction",
                "GET",
                &format!("/services/{}/functions/{}", service, name),
                None,
            )
            .await
            .map_err(|e| {
                map_not_found(e, &["ServiceNotFound", "FunctionNotFound"], "FC function", id)
            })?;
        if object["functionName"] != name {
            return Err(not_found("FC function", id));
        }
        Ok(object)
    }

    /// Wait until a function exists or is gone.
    pub async fn wait_for_function(
        &self,
        id: &str,
        presence: Presence,
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        parse_id(id, 2)?;
        wait_presence(presence, timeout, FC_POLL_INTERVAL, || self.describe_function(id)).await
    }

    /// Describe a trigger, id `service:function:trigger`.
    pub async fn describe_trigger(&self, id: &str) -> Result<Value, ProviderError> {
        let parts = parse_id(id, 3)?;
        let (service, function, name) = (parts[0], parts[1], parts[2]);
        let object = self
            .call(
                "GetTrigger",
                "GET",
                &format!("/services/{}/functions/{}/triggers/{}", service, function, name),
                None,
            )
            .await
            .map_err(|e| {
                map_not_found(
                    e,
                    &["ServiceNotFound", "FunctionNotFound", "TriggerNotFound"],
                    "FC trigger",
                    id,
                )
            })?;
        if object["triggerName"] != name {
            return Err(not_found("FC trigger", id));
        }
        Ok(object)
    }

    /// Wait until a trigger exists or is gone.
    pub async fn wait_for_trigger(
        &self,
        id: &str,
        presence: Presence,
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        parse_id(id, 3)?;
        wait_presence(presence, timeout, FC_POLL_INTERVAL, || self.describe_trigger(id)).await
    }

    /// Describe a published version, id `service:version`.
    ///
    /// There is no single-version getter, so this lists one version starting
    /// at the requested id.
    pub async fn describe_version(&self, id: &str) -> Result<Value, ProviderError> {
        let parts = parse_id(id, 2)?;
        let (service, version) = (parts[0], parts[1]);
        let request = ApiRequest::roa(
            Product::Fc,
            "ListServiceVersions",
            "GET",
            fc_path(&format!("/services/{}/versions", service)),
        )
        .with_query("startKey", version)
        .with_query("limit", "1");
        let response = self.client.call(request).await.map_err(|e| {
            map_not_found(e, &["ServiceNotFound", "VersionNotFound"], "FC version", id)
        })?;
        match response["versions"].as_array().map(Vec::as_slice) {
            Some([only]) if only["versionId"] == version => Ok(only.clone()),
            _ => Err(not_found("FC version", id)),
        }
    }

    /// Wait until a version exists or is gone.
    pub async fn wait_for_version(
        &self,
        id: &str,
        presence: Presence,
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        parse_id(id, 2)?;
        wait_presence(presence, timeout, FC_POLL_INTERVAL, || self.describe_version(id)).await
    }

    /// Describe an alias, id `service:alias`.
    pub async fn describe_alias(&self, id: &str) -> Result<Value, ProviderError> {
        let parts = parse_id(id, 2)?;
        let (service, name) = (parts[0], parts[1]);
        let object = self
            .call(
                "GetAlias",
                "GET",
                &format!("/services/{}/aliases/{}", service, name),
                None,
            )
            .await
            .map_err(|e| map_not_found(e, &["ServiceNotFound", "AliasNotFound"], "FC alias", id))?;
        if object["aliasName"] != name {
            return Err(not_found("FC alias", id));
        }
        Ok(object)
    }

    /// Wait until an alias exists or is gone.
    pub async fn wait_for_alias(
        &self,
        id: &str,
        presence: Presence,
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        parse_id(id, 2)?;
        wait_presence(presence, timeout, FC_POLL_INTERVAL, || self.describe_alias(id)).await
    }

    /// Describe a custom domain by name.
    pub async fn describe_custom_domain(&self, id: &str) -> Result<Value, ProviderError> {
        let object = self
            .call("GetCustomDomain", "GET", &format!("/custom-domains/{}", id), None)
            .await
            .map_err(|e| map_not_found(e, &["DomainNameNotFound"], "FC custom domain", id))?;
        if object["domainName"] != id {
            return Err(not_found("FC custom domain", id));
        }
        Ok(object)
    }

    /// Wait until a custom domain exists or is gone.
    pub async fn wait_for_custom_domain(
        &self,
        id: &str,
        presence: Presence,
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        wait_presence(presence, timeout, FC_POLL_INTERVAL, || self.describe_custom_domain(id)).await
    }

    /// Describe the async-invoke config, id `service:function[:qualifier]`.
    pub async fn describe_async_invoke_config(&self, id: &str) -> Result<Value, ProviderError> {
        let (service, function, qualifier) = parse_async_config_id(id)?;
        let mut request = ApiRequest::roa(
            Product::Fc,
            "GetFunctionAsyncInvokeConfig",
            "GET",
            fc_path(&format!("/services/{}/functions/{}/async-invoke-config", service, function)),
        );
        if let Some(qualifier) = qualifier {
            request = request.with_query("qualifier", qualifier);
        }
        self.client.call(request).await.map_err(|e| {
            map_not_found(
                e,
                &["ServiceNotFound", "FunctionNotFound", "AsyncConfigNotExists"],
                "FC async invoke config",
                id,
            )
        })
    }

    /// Wait until an async-invoke config exists or is gone.
    pub async fn wait_for_async_invoke_config(
        &self,
        id: &str,
        presence: Presence,
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        parse_async_config_id(id)?;
        wait_presence(presence, timeout, FC_POLL_INTERVAL, || {
            self.describe_async_invoke_config(id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use serde_json::json;
    use std::sync::Arc;

    fn client(mock: &Arc<MockTransport>) -> AlicloudClient {
        AlicloudClient::new(mock.clone(), "cn-hangzhou").with_account_id("1234")
    }

    #[tokio::test]
    async fn test_describe_service() {
        let mock = Arc::new(MockTransport::new());
        mock.respond("GetService", json!({"serviceName": "svc", "serviceId": "sid"}));
        let client = client(&mock);
        let object = FcService::new(&client).describe_service("svc").await.unwrap();
        assert_eq!(object["serviceId"], "sid");

        let request = mock.last_request("GetService").unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/2021-04-06/services/svc");
    }

    #[tokio::test]
    async fn test_describe_service_name_mismatch_is_not_found() {
        let mock = Arc::new(MockTransport::new());
        mock.respond("GetService", json!({"serviceName": "other"}));
        let client = client(&mock);
        let err = FcService::new(&client).describe_service("svc").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_describe_function_not_found_codes() {
        let mock = Arc::new(MockTransport::new());
        mock.fail("GetFunction", ApiError::new("FunctionNotFound", "function not found", 404));
        let client = client(&mock);
        let fc = FcService::new(&client);
        assert!(fc.describe_function("svc:fn").await.unwrap_err().is_not_found());
        assert!(matches!(
            fc.describe_function("svc").await.unwrap_err(),
            ProviderError::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_describe_version() {
        let mock = Arc::new(MockTransport::new());
        mock.respond_once("ListServiceVersions", json!({"versions": [{"versionId": "2"}]}));
        mock.respond_once("ListServiceVersions", json!({"versions": [{"versionId": "3"}]}));
        let client = client(&mock);
        let fc = FcService::new(&client);
        assert_eq!(fc.describe_version("svc:2").await.unwrap()["versionId"], "2");
        assert!(fc.describe_version("svc:2").await.unwrap_err().is_not_found());

        let request = mock.last_request("ListServiceVersions").unwrap();
        assert_eq!(request.param("startKey"), Some("2"));
        assert_eq!(request.param("limit"), Some("1"));
    }

    #[tokio::test]
    async fn test_describe_async_invoke_config_qualifier() {
        let mock = Arc::new(MockTransport::new());
        let client = client(&mock);
        let fc = FcService::new(&client);
        fc.describe_async_invoke_config("svc:fn:LATEST").await.unwrap();
        let request = mock.last_request("GetFunctionAsyncInvokeConfig").unwrap();
        assert_eq!(request.path, "/2021-04-06/services/svc/functions/fn/async-invoke-config");
        assert_eq!(request.param("qualifier"), Some("LATEST"));

        mock.fail(
            "GetFunctionAsyncInvokeConfig",
            ApiError::new("AsyncConfigNotExists", "none", 404),
        );
        assert!(fc.describe_async_invoke_config("svc:fn").await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_parse_async_config_id() {
        assert_eq!(
            parse_async_config_id("svc:fn").unwrap(),
            ("svc".to_string(), "fn".to_string(), None)
        );
        assert_eq!(
            parse_async_config_id("svc:fn:prod").unwrap().2,
            Some("prod".to_string())
        );
        assert!(parse_async_config_id("svc").is_err());
        assert!(parse_async_config_id("a:b:c:d").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_alias_deleted() {
        let mock = Arc::new(MockTransport::new());
        mock.respond_once("GetAlias", json!({"aliasName": "prod"}));
        mock.fail("GetAlias", ApiError::new("AliasNotFound", "gone", 404));
        let client = client(&mock);
        FcService::new(&client)
            .wait_for_alias("svc:prod", Presence::Deleted, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(mock.count("GetAlias"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_custom_domain_times_out() {
        let mock = Arc::new(MockTransport::new());
        mock.fail("GetCustomDomain", ApiError::new("DomainNameNotFound", "none", 404));
        let client = client(&mock);
        let err = FcService::new(&client)
            .wait_for_custom_domain("example.com", Presence::Exists, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::DeadlineExceeded(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_trigger_version_and_async_config() {
        let mock = Arc::new(MockTransport::new());
        mock.fail_once("GetTrigger", ApiError::new("TriggerNotFound", "not yet", 404));
        mock.respond("GetTrigger", json!({"triggerName": "oss"}));
        mock.respond("ListServiceVersions", json!({"versions": [{"versionId": "1"}]}));
        mock.fail(
            "GetFunctionAsyncInvokeConfig",
            ApiError::new("AsyncConfigNotExists", "none", 404),
        );
        let client = client(&mock);
        let fc = FcService::new(&client);
        let timeout = Duration::from_secs(30);

        fc.wait_for_trigger("svc:fn:oss", Presence::Exists, timeout).await.unwrap();
        assert_eq!(mock.count("GetTrigger"), 2);
        fc.wait_for_version("svc:1", Presence::Exists, timeout).await.unwrap();
        fc.wait_for_async_invoke_config("svc:fn:prod", Presence::Deleted, timeout)
            .await
            .unwrap();
        assert!(fc.wait_for_trigger("svc:fn", Presence::Exists, timeout).await.is_err());
    }
}
