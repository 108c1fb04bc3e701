//! Elastic Compute Service.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use super::{client_token, items, json_list, not_found, params, pointer};
use crate::client::{AlicloudClient, ApiError, Product};
use crate::error::ProviderError;
use crate::retry::{retry, IncrementalWait, RetryError};
use crate::wait::{wait_for, Refresh, StateWaiter};

/// Codes meaning the instance does not exist.
pub const ECS_NOT_FOUND: &[&str] = &["InvalidInstanceId.NotFound", "Forbidden.InstanceNotFound"];

/// Tag key prefixes managed by the platform rather than by users.
const IGNORED_TAG_PREFIXES: &[&str] = &["aliyun", "acs:", "http://", "https://"];

/// ECS API helpers.
#[derive(Debug, Clone, Copy)]
pub struct EcsService<'a> {
    client: &'a AlicloudClient,
}

impl<'a> EcsService<'a> {
    /// Wrap a client.
    pub fn new(client: &'a AlicloudClient) -> Self {
        Self { client }
    }

    /// Call an ECS action in the client's region.
    pub async fn call(&self, action: &str, mut request: Value) -> Result<Value, ApiError> {
        if let Value::Object(map) = &mut request {
            map.entry("RegionId")
                .or_insert_with(|| Value::String(self.client.region().to_string()));
        }
        self.client.rpc(Product::Ecs, action, request).await
    }

    /// Describe one instance.
    pub async fn describe_instance(&self, id: &str) -> Result<Value, ProviderError> {
        let response = self
            .call("DescribeInstances", json!({ "InstanceIds": json_list(&[id]) }))
            .await
            .map_err(|e| super::map_not_found(e, ECS_NOT_FOUND, "instance", id))?;
        items(&response, "/Instances/Instance")
            .into_iter()
            .find(|i| i["InstanceId"] == id)
            .ok_or_else(|| not_found("instance", id))
    }

    /// Refresh function for [`StateWaiter`]: the instance and its `Status`.
    pub async fn instance_state(&self, id: &str) -> Refresh<Value> {
        match self.describe_instance(id).await {
            Ok(instance) => {
                let status = instance["Status"].as_str().unwrap_or_default().to_string();
                Ok(Some((instance, status)))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Wait for the instance to reach one of `target` (empty: until deleted).
    pub async fn wait_for_instance(
        &self,
        id: &str,
        waiter: StateWaiter,
    ) -> Result<Option<Value>, ProviderError> {
        debug!(instance_id = id, target = ?waiter.target, "waiting for instance");
        waiter.wait(|| self.instance_state(id)).await
    }

    /// The system disk of an instance.
    pub async fn describe_system_disk(
        &self,
        id: &str,
        resource_group_id: &str,
    ) -> Result<Value, ProviderError> {
        let request = params([
            ("InstanceId", json!(id)),
            ("DiskType", json!("system")),
            ("ResourceGroupId", json!(resource_group_id)),
        ]);
        let response = self.call("DescribeDisks", request).await?;
        items(&response, "/Disks/Disk")
            .into_iter()
            .next()
            .ok_or_else(|| not_found("system disk of instance", id))
    }

    /// The system disk, retried for up to `timeout` while it is not yet visible.
    pub async fn describe_system_disk_eventually(
        &self,
        id: &str,
        resource_group_id: &str,
        timeout: Duration,
    ) -> Result<Value, ProviderError> {
        retry(timeout, move || async move {
            self.describe_system_disk(id, resource_group_id)
                .await
                .map_err(|err| {
                    if err.is_not_found() {
                        RetryError::retryable(err)
                    } else {
                        RetryError::non_retryable(err)
                    }
                })
        })
        .await
    }

    /// Ids of every disk attached to an instance.
    pub async fn describe_disk_ids(&self, id: &str) -> Result<Vec<String>, ProviderError> {
        let response = self.call("DescribeDisks", json!({ "InstanceId": id })).await?;
        Ok(items(&response, "/Disks/Disk")
            .iter()
            .filter_map(|d| d["DiskId"].as_str().map(str::to_string))
            .collect())
    }

    /// Base64 user data of an instance.
    pub async fn describe_user_data(&self, id: &str) -> Result<String, ProviderError> {
        let response = self.call("DescribeUserData", json!({ "InstanceId": id })).await?;
        Ok(response["UserData"].as_str().unwrap_or_default().to_string())
    }

    /// RAM role attached to an instance.
    pub async fn describe_ram_role(&self, id: &str) -> Result<Option<String>, ProviderError> {
        let response = self
            .call("DescribeInstanceRamRole", json!({ "InstanceIds": json_list(&[id]) }))
            .await?;
        Ok(pointer(&response, "/InstanceRamRoleSets/InstanceRamRoleSet/0/RamRoleName")
            .as_str()
            .map(str::to_string))
    }

    /// Auto-renew settings of a subscription instance.
    pub async fn describe_auto_renew(&self, id: &str) -> Result<Option<Value>, ProviderError> {
        let response = self
            .call("DescribeInstanceAutoRenewAttribute", json!({ "InstanceId": id }))
            .await?;
        Ok(items(&response, "/InstanceRenewAttributes/InstanceRenewAttribute")
            .into_iter()
            .next())
    }

    /// Describe one network interface.
    pub async fn describe_network_interface(&self, eni_id: &str) -> Result<Value, ProviderError> {
        let response = self
            .call("DescribeNetworkInterfaces", json!({ "NetworkInterfaceId": [eni_id] }))
            .await?;
        items(&response, "/NetworkInterfaceSets/NetworkInterfaceSet")
            .into_iter()
            .next()
            .ok_or_else(|| not_found("network interface", eni_id))
    }

    /// Maintenance settings, an empty object when none are reported.
    pub async fn describe_maintenance_attribute(&self, id: &str) -> Result<Value, ProviderError> {
        let response = self
            .call("DescribeInstanceMaintenanceAttributes", json!({ "InstanceId": [id] }))
            .await?;
        Ok(items(&response, "/MaintenanceAttributes/MaintenanceAttribute")
            .into_iter()
            .next()
            .unwrap_or_else(|| json!({})))
    }

    /// Zones where `instance_type` currently has stock.
    pub async fn describe_available_zones(
        &self,
        instance_type: &str,
        charge_type: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let request = params([
            ("DestinationResource", json!("InstanceType")),
            ("InstanceType", json!(instance_type)),
            ("InstanceChargeType", json!(charge_type)),
        ]);
        let response = self.call("DescribeAvailableResource", request).await?;
        Ok(items(&response, "/AvailableZones/AvailableZone")
            .iter()
            .filter(|z| z["Status"] == "Available")
            .filter_map(|z| z["ZoneId"].as_str().map(str::to_string))
            .collect())
    }

    /// Add an instance to security groups; already-joined groups are skipped.
    pub async fn join_security_groups(&self, id: &str, groups: &[String]) -> Result<(), ProviderError> {
        for group in groups {
            let request = json!({ "InstanceId": id, "SecurityGroupId": group });
            match self.call("JoinSecurityGroup", request).await {
                Ok(_) => {}
                Err(err) if err.is_expected(&["InvalidInstanceId.AlreadyExists"]) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Remove an instance from security groups; unknown groups are skipped.
    pub async fn leave_security_groups(&self, id: &str, groups: &[String]) -> Result<(), ProviderError> {
        for group in groups {
            let request = json!({ "InstanceId": id, "SecurityGroupId": group });
            match self.call("LeaveSecurityGroup", request).await {
                Ok(_) => {}
                Err(err) if err.is_expected(&["InvalidSecurityGroupId.NotFound"]) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Reconcile user tags on `ids` from `old` to `new`.
    pub async fn update_tags(
        &self,
        resource_type: &str,
        ids: &[String],
        old: &BTreeMap<String, String>,
        new: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        if ids.is_empty() {
            return Ok(());
        }
        let removed: Vec<&String> = old.keys().filter(|k| !new.contains_key(*k)).collect();
        let added: Vec<(&String, &String)> =
            new.iter().filter(|(k, v)| old.get(*k) != Some(*v)).collect();

        if !removed.is_empty() {
            let request = json!({
                "ResourceType": resource_type,
                "ResourceId": ids,
                "TagKey": removed,
            });
            self.call_retrying("UntagResources", request, Duration::from_secs(60)).await?;
        }
        if !added.is_empty() {
            let tags: Vec<Value> = added
                .iter()
                .map(|(k, v)| json!({ "Key": k, "Value": v }))
                .collect();
            let request = json!({
                "ResourceType": resource_type,
                "ResourceId": ids,
                "Tag": tags,
            });
            self.call_retrying("TagResources", request, Duration::from_secs(60)).await?;
        }
        Ok(())
    }

    /// Call `action`, retrying transient failures with a 3s incremental wait.
    pub async fn call_retrying(
        &self,
        action: &str,
        request: Value,
        timeout: Duration,
    ) -> Result<Value, ProviderError> {
        self.call_retrying_on(action, request, timeout, &[]).await
    }

    /// Like [`call_retrying`](Self::call_retrying), also retrying on `codes`.
    pub async fn call_retrying_on(
        &self,
        action: &str,
        request: Value,
        timeout: Duration,
        codes: &[&str],
    ) -> Result<Value, ProviderError> {
        let wait = IncrementalWait::new(Duration::from_secs(3), Duration::from_secs(3));
        let wait = &wait;
        let request = &request;
        retry(timeout, move || async move {
            match self.call(action, request.clone()).await {
                Ok(response) => Ok(response),
                Err(err) => match RetryError::classify(err, codes) {
                    RetryError::Retryable(err) => {
                        wait.wait().await;
                        Err(RetryError::Retryable(err))
                    }
                    other => Err(other),
                },
            }
        })
        .await
    }

    /// Wait until the instance sits in `vswitch_id` with `private_ip` (if set).
    pub async fn wait_for_vpc_attributes(
        &self,
        id: &str,
        vswitch_id: &str,
        private_ip: &str,
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        wait_for("instance VPC attributes", timeout, Duration::from_secs(5), move || async move {
            let instance = self.describe_instance(id).await?;
            let in_vswitch = instance.pointer("/VpcAttributes/VSwitchId") == Some(&json!(vswitch_id));
            let ip_matches = private_ip.is_empty()
                || instance.pointer("/VpcAttributes/PrivateIpAddress/IpAddress/0") == Some(&json!(private_ip));
            Ok(in_vswitch && ip_matches)
        })
        .await
    }

    /// New idempotency token.
    pub fn client_token(&self, action: &str) -> String {
        client_token(action)
    }
}

/// User tags from an ECS `Tags.Tag` list, ignoring platform tags.
pub fn tags_to_map(tags: &Value) -> BTreeMap<String, String> {
    tags.as_array()
        .map(|tags| {
            tags.iter()
                .filter_map(|t| {
                    let key = t["TagKey"].as_str()?;
                    let value = t["TagValue"].as_str().unwrap_or_default();
                    (!tag_ignored(key)).then(|| (key.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Whether a tag key belongs to the platform.
pub fn tag_ignored(key: &str) -> bool {
    IGNORED_TAG_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// String map from a JSON object.
pub fn string_map(value: &Value) -> BTreeMap<String, String> {
    value
        .as_object()
        .map(|m| {
            m.iter()
                .map(|(k, v)| {
                    let v = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                    (k.clone(), v)
                })
                .collect()
        })
        .unwrap_or_default()
}
