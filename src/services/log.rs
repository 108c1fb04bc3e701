//! Log Service (SLS).
//!
//! Requests are addressed to the project host, `{project}.{region}.log.aliyuncs.com`.

use std::time::Duration;

use serde_json::{json, Value};

use super::{map_not_found, not_found, wait_presence, Presence};
use crate::client::{AlicloudClient, ApiError, ApiRequest, Product};
use crate::error::ProviderError;

/// Codes meaning the saved search (or its project) does not exist.
pub const SAVED_SEARCH_NOT_FOUND: &[&str] = &["SavedSearchNotExist", "ProjectNotExist"];

/// Poll interval of the saved search waiter.
pub const LOG_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A saved search as the API represents it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SavedSearch {
    /// Saved search name.
    pub name: String,
    /// Name shown in the console.
    pub display_name: String,
    /// Query text.
    pub query: String,
    /// Logstore the search runs against.
    pub logstore: String,
    /// Optional log topic.
    pub topic: String,
}

impl SavedSearch {
    /// Request body.
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "savedsearchName": self.name,
            "displayName": self.display_name,
            "searchQuery": self.query,
            "logstore": self.logstore,
        });
        if !self.topic.is_empty() {
            body["topic"] = json!(self.topic);
        }
        body
    }

    /// Parse a response body.
    pub fn from_body(body: &Value) -> Self {
        let field = |k: &str| body[k].as_str().unwrap_or_default().to_string();
        Self {
            name: field("savedsearchName"),
            display_name: field("displayName"),
            query: field("searchQuery"),
            logstore: field("logstore"),
            topic: field("topic"),
        }
    }
}

/// Log Service API helpers.
#[derive(Debug, Clone, Copy)]
pub struct LogService<'a> {
    client: &'a AlicloudClient,
}

impl<'a> LogService<'a> {
    /// Wrap a client.
    pub fn new(client: &'a AlicloudClient) -> Self {
        Self { client }
    }

    fn request(action: &str, method: &str, project: &str, path: String) -> ApiRequest {
        ApiRequest::roa(Product::Log, action, method, path).with_host_prefix(project)
    }

    /// Create a saved search.
    pub async fn create_saved_search(
        &self,
        project: &str,
        search: &SavedSearch,
    ) -> Result<(), ApiError> {
        let request = Self::request("CreateSavedSearch", "POST", project, "/savedsearches".into())
            .with_body(search.to_body());
        self.client.call(request).await.map(|_| ())
    }

    /// Replace a saved search.
    pub async fn update_saved_search(
        &self,
        project: &str,
        search: &SavedSearch,
    ) -> Result<(), ApiError> {
        let request = Self::request(
            "UpdateSavedSearch",
            "PUT",
            project,
            format!("/savedsearches/{}", search.name),
        )
        .with_body(search.to_body());
        self.client.call(request).await.map(|_| ())
    }

    /// Delete a saved search.
    pub async fn delete_saved_search(&self, project: &str, name: &str) -> Result<(), ApiError> {
        let request = Self::request(
            "DeleteSavedSearch",
            "DELETE",
            project,
            format!("/savedsearches/{}", name),
        );
        self.client.call(request).await.map(|_| ())
    }

    /// Describe a saved search.
    pub async fn describe_saved_search(
        &self,
        project: &str,
        name: &str,
    ) -> Result<SavedSearch, ProviderError> {
        let id = format!("{}:{}", project, name);
        let request = Self::request(
            "GetSavedSearch",
            "GET",
            project,
            format!("/savedsearches/{}", name),
        );
        let body = self
            .client
            .call(request)
            .await
            .map_err(|e| map_not_found(e, SAVED_SEARCH_NOT_FOUND, "log saved search", &id))?;
        let search = SavedSearch::from_body(&body);
        if search.name.is_empty() {
            return Err(not_found("log saved search", &id));
        }
        Ok(search)
    }

    /// Wait until a saved search exists or is gone.
    pub async fn wait_for_saved_search(
        &self,
        project: &str,
        name: &str,
        presence: Presence,
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        wait_presence(presence, timeout, LOG_POLL_INTERVAL, || {
            self.describe_saved_search(project, name)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use std::sync::Arc;

    fn search() -> SavedSearch {
        SavedSearch {
            name: "errors".into(),
            display_name: "Errors".into(),
            query: "status >= 500".into(),
            logstore: "access".into(),
            topic: String::new(),
        }
    }

    #[test]
    fn test_body_omits_empty_topic() {
        let body = search().to_body();
        assert!(body.get("topic").is_none());
        assert_eq!(body["savedsearchName"], "errors");
        assert_eq!(SavedSearch::from_body(&body), search());
    }

    #[tokio::test]
    async fn test_create_uses_project_host_prefix() {
        let mock = Arc::new(MockTransport::new());
        let client = AlicloudClient::new(mock.clone(), "cn-hangzhou");
        LogService::new(&client)
            .create_saved_search("app", &search())
            .await
            .unwrap();
        let request = mock.last_request("CreateSavedSearch").unwrap();
        assert_eq!(request.host_prefix.as_deref(), Some("app"));
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/savedsearches");
        assert_eq!(request.body.unwrap()["searchQuery"], "status >= 500");
    }

    #[tokio::test]
    async fn test_describe_not_found() {
        let mock = Arc::new(MockTransport::new());
        mock.fail("GetSavedSearch", ApiError::new("SavedSearchNotExist", "missing", 404));
        let client = AlicloudClient::new(mock.clone(), "cn-hangzhou");
        let err = LogService::new(&client)
            .describe_saved_search("app", "errors")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
