//! The Alibaba Cloud provider.
//!
//! [`AlicloudProvider`] owns the registry of resources and data sources and
//! dispatches every [`ProviderService`] call to them by type name.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::client::Transport;
use crate::config::ProviderConfig;
use crate::data_sources::ga_custom_routing_endpoint_traffic_policies::GaCustomRoutingEndpointTrafficPolicies;
use crate::data_sources::DataSource;
use crate::diff::plan_resource;
use crate::error::ProviderError;
use crate::resources::fc_alias::FcAlias;
use crate::resources::fc_function::FcFunction;
use crate::resources::fc_service::FcServiceResource;
use crate::resources::instance::Instance;
use crate::resources::log_saved_search::LogSavedSearch;
use crate::resources::rds_clone_db_instance::RdsCloneDbInstance;
use crate::resources::{Resource, ResourceContext};
use crate::schema::{Diagnostic, ProviderSchema};
use crate::server::ProviderService;
use crate::types::{ImportedResource, PlanResult, ProviderMetadata, ServerCapabilities};
use crate::validation::has_errors;

type ResourceLock = Arc<tokio::sync::Mutex<()>>;

/// The provider.
pub struct AlicloudProvider {
    resources: BTreeMap<&'static str, Arc<dyn Resource>>,
    data_sources: BTreeMap<&'static str, Arc<dyn DataSource>>,
    transport: Option<Arc<dyn Transport>>,
    context: RwLock<Option<ResourceContext>>,
    locks: Mutex<HashMap<String, ResourceLock>>,
}

impl AlicloudProvider {
    /// A provider that talks to the real APIs once configured.
    pub fn new() -> Self {
        let resources: Vec<Arc<dyn Resource>> = vec![
            Arc::new(Instance),
            Arc::new(LogSavedSearch),
            Arc::new(RdsCloneDbInstance),
            Arc::new(FcServiceResource),
            Arc::new(FcFunction),
            Arc::new(FcAlias),
        ];
        let data_sources: Vec<Arc<dyn DataSource>> =
            vec![Arc::new(GaCustomRoutingEndpointTrafficPolicies)];
        Self {
            resources: resources.into_iter().map(|r| (r.type_name(), r)).collect(),
            data_sources: data_sources.into_iter().map(|d| (d.type_name(), d)).collect(),
            transport: None,
            context: RwLock::new(None),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// A provider that sends every request through `transport`.
    ///
    /// Credentials are not required when configuring such a provider.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
            ..Self::new()
        }
    }

    fn resource(&self, type_name: &str) -> Result<&Arc<dyn Resource>, ProviderError> {
        self.resources
            .get(type_name)
            .ok_or_else(|| ProviderError::UnknownResource(type_name.to_string()))
    }

    fn data_source(&self, type_name: &str) -> Result<&Arc<dyn DataSource>, ProviderError> {
        self.data_sources
            .get(type_name)
            .ok_or_else(|| ProviderError::UnknownResource(format!("data source {}", type_name)))
    }

    async fn context(&self) -> Result<ResourceContext, ProviderError> {
        self.context.read().await.clone().ok_or_else(|| {
            ProviderError::Configuration("provider is not configured".to_string())
        })
    }

    /// Key of the lock serialising changes to the object described by `state`.
    fn lock_key(resource_type: &str, state: &Value) -> Option<String> {
        let id = state.get("id").and_then(Value::as_str).filter(|id| !id.is_empty())?;
        Some(format!("{}:{}", resource_type, id))
    }

    fn lock_for(&self, key: &str) -> ResourceLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Drop the map entry for `key` once nobody else holds its lock.
    fn release_lock(&self, key: &str, lock: ResourceLock) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(lock);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    /// Run `op` while holding the lock under `key`, if any.
    async fn locked<T>(&self, key: Option<String>, op: impl Future<Output = T>) -> T {
        let Some(key) = key else {
            return op.await;
        };
        let lock = self.lock_for(&key);
        let result = {
            let _guard = lock.lock().await;
            op.await
        };
        self.release_lock(&key, lock);
        result
    }

    fn config_diagnostics(&self, config: &ProviderConfig) -> Vec<Diagnostic> {
        let mut diagnostics = config.diagnostics();
        if self.transport.is_some() {
            diagnostics.retain(|d| {
                !matches!(d.attribute.as_deref(), Some("access_key") | Some("secret_key"))
            });
        }
        diagnostics
    }
}

impl Default for AlicloudProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderService for AlicloudProvider {
    fn schema(&self) -> ProviderSchema {
        let schema = ProviderSchema::new().with_provider_config(ProviderConfig::schema());
        let schema = self
            .resources
            .values()
            .fold(schema, |s, r| s.with_resource(r.type_name(), r.schema()));
        self.data_sources
            .values()
            .fold(schema, |s, d| s.with_data_source(d.type_name(), d.schema()))
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            resources: self.resources.keys().map(|k| k.to_string()).collect(),
            data_sources: self.data_sources.keys().map(|k| k.to_string()).collect(),
            capabilities: ServerCapabilities { plan_destroy: true },
        }
    }

    async fn validate_provider_config(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let config = ProviderConfig::from_value(&config)?;
        Ok(self.config_diagnostics(&config))
    }

    #[instrument(skip(self, config))]
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let config = ProviderConfig::from_value(&config)?;
        let diagnostics = self.config_diagnostics(&config);
        if has_errors(&diagnostics) {
            return Ok(diagnostics);
        }

        let transport: Arc<dyn Transport> = match &self.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(config.http_transport()?),
        };
        let context = config.context(transport)?;
        info!(
            region = context.client.region(),
            protocol = ?config.protocol,
            "provider configured"
        );
        *self.context.write().await = Some(context);
        Ok(diagnostics)
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        info!("provider stopping");
        Ok(())
    }

    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        Ok(self.resource(resource_type)?.validate(&config))
    }

    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        _config: Value,
    ) -> Result<PlanResult, ProviderError> {
        let resource = self.resource(resource_type)?;
        plan_resource(resource.as_ref(), prior_state.as_ref(), &proposed_state)
    }

    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ProviderError> {
        let resource = self.resource(resource_type)?;
        let ctx = self.context().await?;
        resource.create(&ctx, planned_state).await
    }

    async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value, ProviderError> {
        let resource = self.resource(resource_type)?;
        if current_state.is_null() {
            return Ok(Value::Null);
        }
        let ctx = self.context().await?;
        match resource.read(&ctx, current_state).await? {
            Some(state) => Ok(state),
            None => {
                debug!(resource_type, "object is gone; dropping it from state");
                Ok(Value::Null)
            }
        }
    }

    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        let resource = self.resource(resource_type)?;
        let ctx = self.context().await?;
        let key = Self::lock_key(resource_type, &prior_state);
        self.locked(key, resource.update(&ctx, prior_state, planned_state)).await
    }

    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError> {
        let resource = self.resource(resource_type)?;
        let ctx = self.context().await?;
        let key = Self::lock_key(resource_type, &current_state);
        self.locked(key, resource.delete(&ctx, current_state)).await
    }

    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        let resource = self.resource(resource_type)?;
        let ctx = self.context().await?;
        let state = resource.import(&ctx, id).await?;
        Ok(vec![ImportedResource::new(resource_type, state)])
    }

    async fn validate_data_source_config(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        Ok(self.data_source(data_source_type)?.validate(&config))
    }

    async fn read_data_source(&self, data_source_type: &str, config: Value) -> Result<Value, ProviderError> {
        let data_source = self.data_source(data_source_type)?;
        let ctx = self.context().await?;
        data_source.read(&ctx, config).await
    }
}
