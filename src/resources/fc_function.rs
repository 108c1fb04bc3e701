//! `alicloud_fc_function`: a function inside a Function Compute service.
//!
//! The id is `service:function`. Code is deployed from an OSS object.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{json_bytes_equal, parse_id, Resource, ResourceContext, ResourceData};
use crate::error::ProviderError;
use crate::retry::{retry, RetryError};
use crate::schema::{Attribute, Constraint, Schema};
use crate::services::{FcService, Presence};

/// The function resource.
#[derive(Debug, Default, Clone, Copy)]
pub struct FcFunction;

fn function_path(service: &str, name: &str) -> String {
    format!("/services/{}/functions/{}", service, name)
}

/// Request body shared by create and update. `with_code` controls whether
/// the OSS code location is sent.
fn body(d: &ResourceData, with_code: bool) -> Result<Value, ProviderError> {
    let mut body = json!({
        "runtime": d.get_str("runtime"),
        "handler": d.get_str("handler"),
        "memorySize": d.get("memory_size").as_i64().unwrap_or(128),
        "timeout": d.get("timeout").as_i64().unwrap_or(3),
        "description": d.get_str("description"),
        "environmentVariables": d.get("environment_variables").as_object().cloned().unwrap_or_default(),
    });
    if with_code {
        body["code"] = json!({
            "ossBucketName": d.get_str("oss_bucket"),
            "ossObjectName": d.get_str("oss_key"),
        });
    }
    if let Some(raw) = d.get_str_ok("custom_runtime_config") {
        let config: Value = serde_json::from_str(raw).map_err(|e| {
            ProviderError::Validation(format!("custom_runtime_config is not valid JSON: {}", e))
        })?;
        body["customRuntimeConfig"] = config;
    }
    Ok(body)
}

#[async_trait]
impl Resource for FcFunction {
    fn type_name(&self) -> &'static str {
        "alicloud_fc_function"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("id", Attribute::computed_string())
            .with_attribute("service", Attribute::required_string().with_force_new())
            .with_attribute(
                "name",
                Attribute::required_string()
                    .with_force_new()
                    .with_constraint(Constraint::string_len(1, 128)),
            )
            .with_attribute("runtime", Attribute::required_string())
            .with_attribute("handler", Attribute::required_string())
            .with_attribute(
                "memory_size",
                Attribute::optional_int64()
                    .with_default(json!(128))
                    .with_constraint(Constraint::int_between(128, 32768)),
            )
            .with_attribute(
                "timeout",
                Attribute::optional_int64()
                    .with_default(json!(3))
                    .with_constraint(Constraint::int_between(1, 86400)),
            )
            .with_attribute("description", Attribute::optional_string())
            .with_attribute("environment_variables", Attribute::optional_string_map())
            .with_attribute("oss_bucket", Attribute::required_string())
            .with_attribute("oss_key", Attribute::required_string())
            .with_attribute(
                "custom_runtime_config",
                Attribute::optional_string()
                    .with_description("JSON document with `command` and `args`"),
            )
            .with_attribute("function_id", Attribute::computed_string())
            .with_attribute("last_modified", Attribute::computed_string())
    }

    fn diff_suppressed(&self, attr: &str, old: &Value, new: &Value, _planned: &Value) -> bool {
        match (attr, old.as_str(), new.as_str()) {
            ("custom_runtime_config", Some(old), Some(new)) => {
                json_bytes_equal(old.as_bytes(), new.as_bytes())
            }
            _ => false,
        }
    }

    async fn create(&self, ctx: &ResourceContext, planned: Value) -> Result<Value, ProviderError> {
        let mut d = ResourceData::new_resource(planned);
        let service = d.get_str("service").to_string();
        let name = d.get_str("name").to_string();
        let mut request = body(&d, true)?;
        request["functionName"] = json!(name);

        let fc = FcService::new(&ctx.client);
        let path = format!("/services/{}/functions", service);
        let (path, request) = (&path, &request);
        retry(ctx.retry_timeout(Duration::from_secs(60)), move || async move {
            fc.call("CreateFunction", "POST", path, Some(request.clone()))
                .await
                .map_err(|err| RetryError::classify(err, &[]))
        })
        .await?;

        let id = format!("{}:{}", service, name);
        fc.wait_for_function(&id, Presence::Exists, self.timeouts().create)
            .await?;
        d.set_id(id);
        info!(id = d.id(), "created FC function");

        self.read(ctx, d.into_state())
            .await?
            .ok_or_else(|| ProviderError::NotFound("FC function vanished after create".into()))
    }

    async fn read(&self, ctx: &ResourceContext, state: Value) -> Result<Option<Value>, ProviderError> {
        let mut d = ResourceData::from_state(state);
        let id = d.id().to_string();
        let parts = parse_id(&id, 2)?;
        let object = match FcService::new(&ctx.client).describe_function(&id).await {
            Ok(object) => object,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        d.set("service", json!(parts[0]));
        d.set("name", object["functionName"].clone());
        d.set("runtime", object["runtime"].clone());
        d.set("handler", object["handler"].clone());
        d.set("memory_size", object["memorySize"].clone());
        d.set("timeout", object["timeout"].clone());
        d.set("description", json!(object["description"].as_str().unwrap_or_default()));
        match object["environmentVariables"].as_object() {
            Some(env) if !env.is_empty() => d.set("environment_variables", Value::Object(env.clone())),
            _ => d.set("environment_variables", Value::Null),
        }
        match object.get("customRuntimeConfig") {
            Some(config) if config.is_object() => {
                d.set("custom_runtime_config", json!(config.to_string()));
            }
            _ => d.set("custom_runtime_config", Value::Null),
        }
        d.set("function_id", object["functionId"].clone());
        d.set("last_modified", object["lastModifiedTime"].clone());
        Ok(Some(d.into_state()))
    }

    async fn update(
        &self,
        ctx: &ResourceContext,
        prior: Value,
        planned: Value,
    ) -> Result<Value, ProviderError> {
        let d = ResourceData::update(prior, planned);
        let id = d.id().to_string();
        let parts = parse_id(&id, 2)?;

        let code_changed = d.has_changes(&["oss_bucket", "oss_key"]);
        if code_changed
            || d.has_changes(&[
                "runtime",
                "handler",
                "memory_size",
                "timeout",
                "description",
                "environment_variables",
                "custom_runtime_config",
            ])
        {
            FcService::new(&ctx.client)
                .call(
                    "UpdateFunction",
                    "PUT",
                    &function_path(parts[0], parts[1]),
                    Some(body(&d, code_changed)?),
                )
                .await?;
        }

        self.read(ctx, d.into_state())
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("FC function {}", id)))
    }

    async fn delete(&self, ctx: &ResourceContext, state: Value) -> Result<(), ProviderError> {
        let d = ResourceData::from_state(state);
        let id = d.id().to_string();
        let parts = parse_id(&id, 2)?;
        let fc = FcService::new(&ctx.client);
        match fc
            .call("DeleteFunction", "DELETE", &function_path(parts[0], parts[1]), None)
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_expected(&["ServiceNotFound", "FunctionNotFound"]) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        fc.wait_for_function(&id, Presence::Deleted, self.timeouts().delete)
            .await
    }
}
