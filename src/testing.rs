//! Testing utilities for the provider.
//!
//! [`ProviderTester`] drives a `ProviderService` without a gRPC server and
//! [`MockTransport`] stands in for the cloud APIs, answering each action
//! with canned responses and recording every request.
//!
//! # Example
//!
//! ```ignore
//! use hemmer_provider_alicloud::testing::{MockTransport, ProviderTester};
//! use hemmer_provider_alicloud::AlicloudProvider;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::test]
//! async fn test_create_saved_search() {
//!     let mock = Arc::new(MockTransport::new());
//!     mock.respond("GetSavedSearch", json!({"savedsearchName": "errors"}));
//!
//!     let tester = ProviderTester::new(AlicloudProvider::with_transport(mock.clone()));
//!     tester.configure(json!({"region": "cn-hangzhou"})).await.unwrap();
//!
//!     let state = tester.create("alicloud_log_saved_search", json!({
//!         "project_name": "app", "name": "errors",
//!         "log_store_name": "access", "display_name": "Errors", "query": "status >= 500"
//!     })).await.unwrap();
//!
//!     assert_eq!(state["id"], "app:errors");
//!     assert_eq!(mock.count("CreateSavedSearch"), 1);
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::client::{ApiError, ApiRequest, Transport};
use crate::error::ProviderError;
use crate::schema::{Diagnostic, DiagnosticSeverity, ProviderSchema};
use crate::server::ProviderService;
use crate::types::{ImportedResource, PlanResult};

type Handler = Arc<dyn Fn(&ApiRequest) -> Result<Value, ApiError> + Send + Sync>;

#[derive(Default)]
struct MockState {
    queued: HashMap<String, VecDeque<Result<Value, ApiError>>>,
    standing: HashMap<String, Handler>,
    requests: Vec<ApiRequest>,
}

/// An in-memory [`Transport`] keyed by action name.
///
/// One-shot responses queued with [`respond_once`](Self::respond_once) or
/// [`fail_once`](Self::fail_once) are used first, then the standing response
/// set with [`respond`](Self::respond), [`respond_with`](Self::respond_with)
/// or [`fail`](Self::fail). Actions with neither answer `{}`.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("requests", &self.lock().requests.len())
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    /// Create an empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Always answer `action` with `response`.
    pub fn respond(&self, action: &str, response: Value) {
        self.respond_with(action, move |_| Ok(response.clone()));
    }

    /// Always answer `action` by calling `handler`.
    pub fn respond_with<F>(&self, action: &str, handler: F)
    where
        F: Fn(&ApiRequest) -> Result<Value, ApiError> + Send + Sync + 'static,
    {
        self.lock().standing.insert(action.to_string(), Arc::new(handler));
    }

    /// Always fail `action` with `error`.
    pub fn fail(&self, action: &str, error: ApiError) {
        self.respond_with(action, move |_| Err(error.clone()));
    }

    /// Answer the next call of `action` with `response`.
    pub fn respond_once(&self, action: &str, response: Value) {
        self.queue(action, Ok(response));
    }

    /// Fail the next call of `action` with `error`.
    pub fn fail_once(&self, action: &str, error: ApiError) {
        self.queue(action, Err(error));
    }

    /// Fail the next `times` calls of `action` with `error`.
    pub fn fail_times(&self, action: &str, times: usize, error: ApiError) {
        for _ in 0..times {
            self.queue(action, Err(error.clone()));
        }
    }

    fn queue(&self, action: &str, outcome: Result<Value, ApiError>) {
        self.lock()
            .queued
            .entry(action.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Every request sent so far.
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.lock().requests.clone()
    }

    /// Action names in call order.
    pub fn actions(&self) -> Vec<String> {
        self.lock().requests.iter().map(|r| r.action.clone()).collect()
    }

    /// Requests for one action.
    pub fn requests_for(&self, action: &str) -> Vec<ApiRequest> {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.action == action)
            .cloned()
            .collect()
    }

    /// The most recent request for `action`.
    pub fn last_request(&self, action: &str) -> Option<ApiRequest> {
        self.requests_for(action).pop()
    }

    /// How many times `action` was called.
    pub fn count(&self, action: &str) -> usize {
        self.lock().requests.iter().filter(|r| r.action == action).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let handler = {
            let mut state = self.lock();
            state.requests.push(request.clone());
            if let Some(outcome) = state
                .queued
                .get_mut(&request.action)
                .and_then(VecDeque::pop_front)
            {
                return outcome;
            }
            state.standing.get(&request.action).cloned()
        };
        match handler {
            Some(handler) => handler(request),
            None => Ok(Value::Object(Default::default())),
        }
    }
}

/// Drives a [`ProviderService`] directly, without a gRPC server.
pub struct ProviderTester<P: ProviderService> {
    provider: P,
}

/// A failed tester call.
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    /// The call returned error diagnostics.
    #[error("{} error diagnostic(s): {}", .0.len(), summaries(.0))]
    Diagnostics(Vec<Diagnostic>),
    /// The call failed outright.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

fn summaries(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| match &d.attribute {
            Some(attr) => format!("{} (at {})", d.summary, attr),
            None => d.summary.clone(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn check_diagnostics(diagnostics: Vec<Diagnostic>) -> Result<(), TestError> {
    let errors: Vec<_> = diagnostics
        .into_iter()
        .filter(|d| d.severity == DiagnosticSeverity::Error)
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(TestError::Diagnostics(errors))
    }
}

impl<P: ProviderService> ProviderTester<P> {
    /// Wrap a provider.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// The wrapped provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The provider schema.
    pub fn schema(&self) -> ProviderSchema {
        self.provider.schema()
    }

    /// Validate the provider block; error diagnostics become `Err`.
    pub async fn validate_provider_config(&self, config: Value) -> Result<(), TestError> {
        check_diagnostics(self.provider.validate_provider_config(config).await?)
    }

    /// Configure the provider; error diagnostics become `Err`.
    pub async fn configure(&self, config: Value) -> Result<(), TestError> {
        check_diagnostics(self.provider.configure(config).await?)
    }

    /// Validate a resource configuration.
    pub async fn validate_resource_config(&self, resource_type: &str, config: Value) -> Result<(), TestError> {
        check_diagnostics(
            self.provider
                .validate_resource_config(resource_type, config)
                .await?,
        )
    }

    /// Plan a create.
    pub async fn plan_create(&self, resource_type: &str, proposed: Value) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, None, proposed.clone(), proposed)
            .await
    }

    /// Plan an update of `prior` towards `proposed`.
    pub async fn plan_update(
        &self,
        resource_type: &str,
        prior: Value,
        proposed: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, Some(prior), proposed.clone(), proposed)
            .await
    }

    /// Plan a destroy.
    pub async fn plan_delete(&self, resource_type: &str, prior: Value) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, Some(prior), Value::Null, Value::Null)
            .await
    }

    /// Create.
    pub async fn create(&self, resource_type: &str, planned: Value) -> Result<Value, ProviderError> {
        self.provider.create(resource_type, planned).await
    }

    /// Read; `null` when the object is gone.
    pub async fn read(&self, resource_type: &str, state: Value) -> Result<Value, ProviderError> {
        self.provider.read(resource_type, state).await
    }

    /// Update.
    pub async fn update(&self, resource_type: &str, prior: Value, planned: Value) -> Result<Value, ProviderError> {
        self.provider.update(resource_type, prior, planned).await
    }

    /// Delete.
    pub async fn delete(&self, resource_type: &str, state: Value) -> Result<(), ProviderError> {
        self.provider.delete(resource_type, state).await
    }

    /// Import by id.
    pub async fn import_resource(&self, resource_type: &str, id: &str) -> Result<Vec<ImportedResource>, ProviderError> {
        self.provider.import_resource(resource_type, id).await
    }

    /// Read a data source.
    pub async fn read_data_source(&self, data_source_type: &str, config: Value) -> Result<Value, ProviderError> {
        self.provider.read_data_source(data_source_type, config).await
    }

    /// Plan, create, then read back.
    pub async fn lifecycle_create(&self, resource_type: &str, config: Value) -> Result<Value, ProviderError> {
        let plan = self.plan_create(resource_type, config).await?;
        let state = self.create(resource_type, plan.planned_state).await?;
        self.read(resource_type, state).await
    }

    /// Plan, update, then read back.
    pub async fn lifecycle_update(
        &self,
        resource_type: &str,
        prior: Value,
        proposed: Value,
    ) -> Result<Value, ProviderError> {
        let plan = self.plan_update(resource_type, prior.clone(), proposed).await?;
        let state = self.update(resource_type, prior, plan.planned_state).await?;
        self.read(resource_type, state).await
    }

    /// Plan a destroy, delete, then check a read comes back `null`.
    pub async fn lifecycle_delete(&self, resource_type: &str, state: Value) -> Result<(), ProviderError> {
        self.plan_delete(resource_type, state.clone()).await?;
        self.delete(resource_type, state.clone()).await?;
        match self.read(resource_type, state).await? {
            Value::Null => Ok(()),
            _ => Err(ProviderError::Sdk(format!(
                "{} still readable after delete",
                resource_type
            ))),
        }
    }
}

/// Assert that `plan` changes `path`.
///
/// # Panics
///
/// Panics if no change has that path.
pub fn assert_plan_changes_attribute(plan: &PlanResult, path: &str) {
    assert!(
        plan.changes.iter().any(|c| c.path == path),
        "expected a change to '{}', changed: {:?}",
        path,
        plan.changes.iter().map(|c| &c.path).collect::<Vec<_>>()
    );
}

/// Assert that `plan` changes nothing.
///
/// # Panics
///
/// Panics if the plan has changes.
pub fn assert_plan_no_changes(plan: &PlanResult) {
    assert!(
        plan.changes.is_empty(),
        "expected no changes, got {:?}",
        plan.changes.iter().map(|c| &c.path).collect::<Vec<_>>()
    );
}

/// Assert that `plan` replaces the object.
///
/// # Panics
///
/// Panics unless the plan requires replacement.
pub fn assert_plan_replaces(plan: &PlanResult) {
    assert!(plan.requires_replace, "expected the plan to require replacement");
}

/// Assert that some error diagnostic mentions `substring`.
///
/// # Panics
///
/// Panics if none does.
pub fn assert_error_contains(diagnostics: &[Diagnostic], substring: &str) {
    assert!(
        diagnostics
            .iter()
            .any(|d| d.severity == DiagnosticSeverity::Error && d.summary.contains(substring)),
        "expected an error containing '{}', got {:?}",
        substring,
        diagnostics.iter().map(|d| &d.summary).collect::<Vec<_>>()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::AlicloudProvider;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    const SAVED_SEARCH: &str = "alicloud_log_saved_search";

    fn saved_search_cloud() -> Arc<MockTransport> {
        let mock = Arc::new(MockTransport::new());
        let deleted = Arc::new(AtomicBool::new(false));
        let query = Arc::new(Mutex::new("status >= 500".to_string()));

        let (gone, current) = (deleted.clone(), query.clone());
        mock.respond_with("GetSavedSearch", move |_| {
            if gone.load(Ordering::SeqCst) {
                return Err(ApiError::new("SavedSearchNotExist", "saved search not found", 404));
            }
            let query = current.lock().unwrap_or_else(PoisonError::into_inner).clone();
            Ok(serde_json::json!({
                "savedsearchName": "errors",
                "displayName": "Errors",
                "searchQuery": query,
                "logstore": "access",
            }))
        });
        let current = query.clone();
        mock.respond_with("UpdateSavedSearch", move |request| {
            let body = request.body.clone().unwrap_or_default();
            *current.lock().unwrap_or_else(PoisonError::into_inner) =
                body["searchQuery"].as_str().unwrap_or_default().to_string();
            Ok(serde_json::json!({}))
        });
        mock.respond_with("DeleteSavedSearch", move |_| {
            deleted.store(true, Ordering::SeqCst);
            Ok(serde_json::json!({}))
        });
        mock
    }

    fn config(query: &str) -> Value {
        json!({
            "project_name": "app",
            "name": "errors",
            "log_store_name": "access",
            "display_name": "Errors",
            "query": query,
        })
    }

    #[tokio::test]
    async fn test_configure_reports_diagnostics() {
        let tester = ProviderTester::new(AlicloudProvider::with_transport(Arc::new(MockTransport::new())));
        tester.configure(json!({"region": "cn-hangzhou"})).await.unwrap();

        let tester = ProviderTester::new(AlicloudProvider::new());
        let err = tester
            .validate_resource_config(SAVED_SEARCH, json!({"name": "errors"}))
            .await
            .unwrap_err();
        match err {
            TestError::Diagnostics(diagnostics) => assert_error_contains(&diagnostics, "project_name"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_saved_search_lifecycle() {
        let mock = saved_search_cloud();
        let tester = ProviderTester::new(AlicloudProvider::with_transport(mock.clone()));
        tester.configure(json!({"region": "cn-hangzhou"})).await.unwrap();

        let state = tester.lifecycle_create(SAVED_SEARCH, config("status >= 500")).await.unwrap();
        assert_eq!(state["id"], "app:errors");
        assert_eq!(mock.count("CreateSavedSearch"), 1);

        let plan = tester.plan_update(SAVED_SEARCH, state.clone(), config("status >= 500")).await.unwrap();
        assert_plan_no_changes(&plan);

        let plan = tester.plan_update(SAVED_SEARCH, state.clone(), config("status = 404")).await.unwrap();
        assert_plan_changes_attribute(&plan, "query");
        assert!(!plan.requires_replace);

        let state = tester
            .lifecycle_update(SAVED_SEARCH, state, config("status = 404"))
            .await
            .unwrap();
        assert_eq!(state["query"], "status = 404");
        assert_eq!(mock.count("UpdateSavedSearch"), 1);

        let mut renamed = config("status = 404");
        renamed["name"] = json!("failures");
        let plan = tester.plan_update(SAVED_SEARCH, state.clone(), renamed).await.unwrap();
        assert_plan_replaces(&plan);

        tester.lifecycle_delete(SAVED_SEARCH, state).await.unwrap();
        assert_eq!(mock.count("DeleteSavedSearch"), 1);
    }

    #[tokio::test]
    async fn test_diagnostics_error_display() {
        let err = TestError::Diagnostics(vec![
            Diagnostic::error("Missing required provider setting: region").with_attribute("region")
        ]);
        assert_eq!(
            err.to_string(),
            "1 error diagnostic(s): Missing required provider setting: region (at region)"
        );
    }
}
