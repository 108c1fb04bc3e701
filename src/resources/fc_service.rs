//! `alicloud_fc_service`: a Function Compute service.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{Resource, ResourceContext, ResourceData};
use crate::error::ProviderError;
use crate::retry::{retry, RetryError};
use crate::schema::{Attribute, Constraint, Schema};
use crate::services::{FcService, Presence};

/// Codes FC returns while a freshly created role has not propagated yet.
const ROLE_NOT_READY: &[&str] = &["AccessDenied", "InvalidArgument.Role"];

/// The Function Compute service resource.
#[derive(Debug, Default, Clone, Copy)]
pub struct FcServiceResource;

fn body(d: &ResourceData) -> Value {
    json!({
        "description": d.get_str("description"),
        "role": d.get_str("role"),
        "internetAccess": d.get("internet_access").as_bool().unwrap_or(true),
    })
}

#[async_trait]
impl Resource for FcServiceResource {
    fn type_name(&self) -> &'static str {
        "alicloud_fc_service"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("id", Attribute::computed_string())
            .with_attribute(
                "name",
                Attribute::required_string()
                    .with_force_new()
                    .with_constraint(Constraint::string_len(1, 128)),
            )
            .with_attribute("description", Attribute::optional_string())
            .with_attribute("role", Attribute::optional_string())
            .with_attribute(
                "internet_access",
                Attribute::optional_bool().with_default(json!(true)),
            )
            .with_attribute("service_id", Attribute::computed_string())
            .with_attribute("last_modified", Attribute::computed_string())
    }

    async fn create(&self, ctx: &ResourceContext, planned: Value) -> Result<Value, ProviderError> {
        let mut d = ResourceData::new_resource(planned);
        let name = d.get_str("name").to_string();
        let mut request = body(&d);
        request["serviceName"] = json!(name);

        let fc = FcService::new(&ctx.client);
        let request = &request;
        retry(ctx.retry_timeout(Duration::from_secs(120)), move || async move {
            fc.call("CreateService", "POST", "/services", Some(request.clone()))
                .await
                .map_err(|err| RetryError::classify(err, ROLE_NOT_READY))
        })
        .await?;

        fc.wait_for_service(&name, Presence::Exists, self.timeouts().create)
            .await?;
        d.set_id(name);
        info!(id = d.id(), "created FC service");

        self.read(ctx, d.into_state())
            .await?
            .ok_or_else(|| ProviderError::NotFound("FC service vanished after create".into()))
    }

    async fn read(&self, ctx: &ResourceContext, state: Value) -> Result<Option<Value>, ProviderError> {
        let mut d = ResourceData::from_state(state);
        let object = match FcService::new(&ctx.client).describe_service(d.id()).await {
            Ok(object) => object,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        d.set("name", object["serviceName"].clone());
        d.set("description", json!(object["description"].as_str().unwrap_or_default()));
        d.set("role", json!(object["role"].as_str().unwrap_or_default()));
        d.set(
            "internet_access",
            json!(object["internetAccess"].as_bool().unwrap_or(true)),
        );
        d.set("service_id", object["serviceId"].clone());
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
        if d.has_changes(&["description", "role", "internet_access"]) {
            FcService::new(&ctx.client)
                .call(
                    "UpdateService",
                    "PUT",
                    &format!("/services/{}", d.id()),
                    Some(body(&d)),
                )
                .await?;
        }

        let id = d.id().to_string();
        self.read(ctx, d.into_state())
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("FC service {}", id)))
    }

    async fn delete(&self, ctx: &ResourceContext, state: Value) -> Result<(), ProviderError> {
        let d = ResourceData::from_state(state);
        let fc = FcService::new(&ctx.client);
        match fc
            .call("DeleteService", "DELETE", &format!("/services/{}", d.id()), None)
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_expected(&["ServiceNotFound"]) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        fc.wait_for_service(d.id(), Presence::Deleted, self.timeouts().delete)
            .await
    }
}
