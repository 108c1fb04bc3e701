//! `alicloud_log_saved_search`: a named query stored in a Log Service project.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{parse_id, Resource, ResourceContext, ResourceData};
use crate::client::CLIENT_TIMEOUT;
use crate::error::ProviderError;
use crate::retry::{retry, RetryError};
use crate::schema::{Attribute, Schema};
use crate::services::log::{LogService, SavedSearch, SAVED_SEARCH_NOT_FOUND};
use crate::services::Presence;

/// How long a new or deleted saved search may take to (dis)appear.
const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

/// The saved search resource.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSavedSearch;

fn saved_search(d: &ResourceData) -> SavedSearch {
    SavedSearch {
        name: d.get_str("name").to_string(),
        display_name: d.get_str("display_name").to_string(),
        query: d.get_str("query").to_string(),
        logstore: d.get_str("log_store_name").to_string(),
        topic: d.get_str("topic").to_string(),
    }
}

#[async_trait]
impl Resource for LogSavedSearch {
    fn type_name(&self) -> &'static str {
        "alicloud_log_saved_search"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("id", Attribute::computed_string())
            .with_attribute(
                "project_name",
                Attribute::required_string()
                    .with_force_new()
                    .with_description("Log Service project"),
            )
            .with_attribute("name", Attribute::required_string().with_force_new())
            .with_attribute("log_store_name", Attribute::required_string().with_force_new())
            .with_attribute("display_name", Attribute::required_string())
            .with_attribute("topic", Attribute::optional_string())
            .with_attribute("query", Attribute::required_string())
    }

    async fn create(&self, ctx: &ResourceContext, planned: Value) -> Result<Value, ProviderError> {
        let mut d = ResourceData::new_resource(planned);
        let project = d.get_str("project_name").to_string();
        let search = saved_search(&d);
        let log = LogService::new(&ctx.client);

        let (project_ref, search_ref) = (&project, &search);
        retry(ctx.retry_timeout(Duration::from_secs(120)), move || async move {
            match log.create_saved_search(project_ref, search_ref).await {
                Ok(()) => Ok(()),
                Err(err) if err.is_expected(&[CLIENT_TIMEOUT]) => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Err(RetryError::retryable(err))
                }
                Err(err) => Err(RetryError::non_retryable(err)),
            }
        })
        .await?;

        log.wait_for_saved_search(&project, &search.name, Presence::Exists, VISIBILITY_TIMEOUT)
            .await?;
        d.set_id(format!("{}:{}", project, search.name));
        info!(id = d.id(), "created log saved search");

        self.read(ctx, d.into_state())
            .await?
            .ok_or_else(|| ProviderError::NotFound("saved search vanished after create".into()))
    }

    async fn read(&self, ctx: &ResourceContext, state: Value) -> Result<Option<Value>, ProviderError> {
        let mut d = ResourceData::from_state(state);
        let id = d.id().to_string();
        let parts = parse_id(&id, 2)?;
        let object = match LogService::new(&ctx.client)
            .describe_saved_search(parts[0], parts[1])
            .await
        {
            Ok(object) => object,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        d.set("project_name", json!(parts[0]));
        d.set("name", json!(object.name));
        d.set("display_name", json!(object.display_name));
        d.set("log_store_name", json!(object.logstore));
        d.set("query", json!(object.query));
        d.set("topic", json!(object.topic));
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

        if d.has_changes(&["display_name", "topic", "query"]) {
            LogService::new(&ctx.client)
                .update_saved_search(parts[0], &saved_search(&d))
                .await?;
        }

        self.read(ctx, d.into_state())
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("log saved search {}", id)))
    }

    async fn delete(&self, ctx: &ResourceContext, state: Value) -> Result<(), ProviderError> {
        let d = ResourceData::from_state(state);
        let id = d.id().to_string();
        let parts = parse_id(&id, 2)?;
        let (project, name) = (parts[0], parts[1]);
        let log = LogService::new(&ctx.client);

        let result = retry(ctx.retry_timeout(Duration::from_secs(180)), move || async move {
            log.delete_saved_search(project, name).await.map_err(|err| {
                if err.is_expected(&[CLIENT_TIMEOUT, "RequestTimeout"]) {
                    RetryError::retryable(err)
                } else {
                    RetryError::non_retryable(err)
                }
            })
        })
        .await;
        match result {
            Ok(()) => {}
            Err(err) if err.is_expected(SAVED_SEARCH_NOT_FOUND) => return Ok(()),
            Err(err) => return Err(err),
        }

        log.wait_for_saved_search(project, name, Presence::Deleted, VISIBILITY_TIMEOUT)
            .await
    }
}
