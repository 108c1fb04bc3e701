//! `alicloud_fc_alias`: a named pointer to a published service version.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{parse_id, Resource, ResourceContext, ResourceData};
use crate::error::ProviderError;
use crate::schema::{Attribute, Schema};
use crate::services::{FcService, Presence};

/// The alias resource, id `service:alias`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FcAlias;

#[async_trait]
impl Resource for FcAlias {
    fn type_name(&self) -> &'static str {
        "alicloud_fc_alias"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("id", Attribute::computed_string())
            .with_attribute("service_name", Attribute::required_string().with_force_new())
            .with_attribute("alias_name", Attribute::required_string().with_force_new())
            .with_attribute("service_version", Attribute::required_string())
            .with_attribute("description", Attribute::optional_string())
    }

    async fn create(&self, ctx: &ResourceContext, planned: Value) -> Result<Value, ProviderError> {
        let mut d = ResourceData::new_resource(planned);
        let service = d.get_str("service_name").to_string();
        let alias = d.get_str("alias_name").to_string();
        let fc = FcService::new(&ctx.client);
        fc.call(
            "CreateAlias",
            "POST",
            &format!("/services/{}/aliases", service),
            Some(json!({
                "aliasName": alias,
                "versionId": d.get_str("service_version"),
                "description": d.get_str("description"),
            })),
        )
        .await?;

        let id = format!("{}:{}", service, alias);
        fc.wait_for_alias(&id, Presence::Exists, self.timeouts().create)
            .await?;
        d.set_id(id);
        info!(id = d.id(), "created FC alias");

        self.read(ctx, d.into_state())
            .await?
            .ok_or_else(|| ProviderError::NotFound("FC alias vanished after create".into()))
    }

    async fn read(&self, ctx: &ResourceContext, state: Value) -> Result<Option<Value>, ProviderError> {
        let mut d = ResourceData::from_state(state);
        let id = d.id().to_string();
        let parts = parse_id(&id, 2)?;
        let object = match FcService::new(&ctx.client).describe_alias(&id).await {
            Ok(object) => object,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        d.set("service_name", json!(parts[0]));
        d.set("alias_name", object["aliasName"].clone());
        d.set("service_version", object["versionId"].clone());
        d.set("description", json!(object["description"].as_str().unwrap_or_default()));
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
        if d.has_changes(&["service_version", "description"]) {
            FcService::new(&ctx.client)
                .call(
                    "UpdateAlias",
                    "PUT",
                    &format!("/services/{}/aliases/{}", parts[0], parts[1]),
                    Some(json!({
                        "versionId": d.get_str("service_version"),
                        "description": d.get_str("description"),
                    })),
                )
                .await?;
        }
        self.read(ctx, d.into_state())
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("FC alias {}", id)))
    }

    async fn delete(&self, ctx: &ResourceContext, state: Value) -> Result<(), ProviderError> {
        let d = ResourceData::from_state(state);
        let id = d.id().to_string();
        let parts = parse_id(&id, 2)?;
        let fc = FcService::new(&ctx.client);
        match fc
            .call(
                "DeleteAlias",
                "DELETE",
                &format!("/services/{}/aliases/{}", parts[0], parts[1]),
                None,
            )
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_expected(&["ServiceNotFound", "AliasNotFound"]) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        fc.wait_for_alias(&id, Presence::Deleted, self.timeouts().delete)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{AlicloudClient, ApiError};
    use crate::testing::MockTransport;
    use std::sync::Arc;

    fn ctx(mock: &Arc<MockTransport>) -> ResourceContext {
        ResourceContext::new(AlicloudClient::new(mock.clone(), "cn-shanghai"))
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let mock = Arc::new(MockTransport::new());
        mock.respond("GetAlias", json!({"aliasName": "prod", "versionId": "2"}));

        let state = FcAlias
            .create(
                &ctx(&mock),
                json!({"service_name": "svc", "alias_name": "prod", "service_version": "2"}),
            )
            .await
            .unwrap();
        assert_eq!(state["id"], "svc:prod");
        assert_eq!(state["service_version"], "2");
        assert_eq!(state["description"], "");

        let body = mock.last_request("CreateAlias").unwrap().body.unwrap();
        assert_eq!(body["aliasName"], "prod");
        assert_eq!(body["versionId"], "2");
    }

    #[tokio::test]
    async fn test_read_gone() {
        let mock = Arc::new(MockTransport::new());
        mock.fail("GetAlias", ApiError::new("AliasNotFound", "gone", 404));
        assert!(FcAlias
            .read(&ctx(&mock), json!({"id": "svc:prod"}))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_points_at_new_version() {
        let mock = Arc::new(MockTransport::new());
        mock.respond("GetAlias", json!({"aliasName": "prod", "versionId": "3"}));
        let prior = json!({"id": "svc:prod", "service_name": "svc", "alias_name": "prod", "service_version": "2"});
        let mut planned = prior.clone();
        planned["service_version"] = json!("3");

        let state = FcAlias.update(&ctx(&mock), prior, planned).await.unwrap();
        assert_eq!(state["service_version"], "3");
        let request = mock.last_request("UpdateAlias").unwrap();
        assert_eq!(request.path, "/2021-04-06/services/svc/aliases/prod");
    }
}
