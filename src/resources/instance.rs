//! `alicloud_instance`: an ECS virtual machine.
//!
//! Create runs `RunInstances`, waits for the instance to boot and then feeds
//! the new instance through the same pipeline updates use, so settings that
//! `RunInstances` cannot carry (e.g. `status = "Stopped"`) are applied there.
//! Image, VPC placement, instance type and boot-time attribute changes need
//! the instance stopped; the pipeline stops it, applies them and starts it
//! again when the target status is `Running`.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{
    as_i64, set_diff, strings, Resource, ResourceContext, ResourceData, Timeouts,
};
use crate::error::ProviderError;
use crate::retry::{retry, IncrementalWait, RetryError};
use crate::schema::{
    Attribute, AttributeFlags, AttributeType, Block, Constraint, NestedBlock, Schema,
};
use crate::services::ecs::{string_map, tags_to_map, ECS_NOT_FOUND};
use crate::services::{items, json_list, params, pointer, EcsService};
use crate::types::PlanResult;
use crate::wait::{wait_for, StateWaiter};

const RUNNING: &str = "Running";
const STOPPED: &str = "Stopped";
const PRE_PAID: &str = "PrePaid";
const POST_PAID: &str = "PostPaid";

/// How long image replacement and type changes may take to show up.
const MODIFY_VISIBLE_TIMEOUT: Duration = Duration::from_secs(500);
const DISK_VISIBLE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Codes meaning a previous network change is still being processed.
const NETWORK_SPEC_BUSY: &[&str] = &[
    "Throttling",
    "LastOrderProcessing",
    "LastRequestProcessing",
    "LastTokenProcessing",
];

const SYSTEM_DISK_FIELDS: &[&str] = &[
    "system_disk_size",
    "system_disk_auto_snapshot_policy_id",
    "system_disk_name",
    "system_disk_description",
];

/// The ECS instance resource.
#[derive(Debug, Default, Clone, Copy)]
pub struct Instance;

/// Family part of an instance type, `ecs.g6.large` → `g6`.
fn family(instance_type: &str) -> &str {
    instance_type
        .trim_start_matches("ecs.")
        .split('.')
        .next()
        .unwrap_or_default()
}

fn is_base64(value: &str) -> bool {
    STANDARD.decode(value).is_ok()
}

/// User data as the API wants it: base64, unless it already is.
fn encode_user_data(value: &str) -> String {
    if is_base64(value) {
        value.to_string()
    } else {
        STANDARD.encode(value)
    }
}

/// The vswitch the instance lives in, `subnet_id` being the legacy name.
fn vswitch(d: &ResourceData) -> &str {
    d.get_str_ok("vswitch_id")
        .unwrap_or_else(|| d.get_str("subnet_id"))
}

/// Copy non-zero planned attributes into a request under API names.
fn copy_set(request: &mut Map<String, Value>, d: &ResourceData, pairs: &[(&str, &str)]) {
    for (param, attr) in pairs {
        if let Some(value) = d.get_ok(attr) {
            request.insert(param.to_string(), value.clone());
        }
    }
}

fn data_disks(d: &ResourceData) -> Vec<Value> {
    d.get("data_disks")
        .as_array()
        .map(|disks| {
            disks
                .iter()
                .map(|disk| {
                    let category = disk["category"].as_str().unwrap_or("cloud_efficiency");
                    let performance_level = if category == "cloud_essd" {
                        disk["performance_level"].clone()
                    } else {
                        Value::Null
                    };
                    params([
                        (
                            "DeleteWithInstance",
                            json!(disk["delete_with_instance"].as_bool().unwrap_or(true)),
                        ),
                        ("Encrypted", json!(disk["encrypted"].as_bool().unwrap_or(false))),
                        ("Size", disk["size"].clone()),
                        ("Category", json!(category)),
                        ("DiskName", disk["name"].clone()),
                        ("KMSKeyId", disk["kms_key_id"].clone()),
                        ("SnapshotId", disk["snapshot_id"].clone()),
                        ("Description", disk["description"].clone()),
                        ("AutoSnapshotPolicyId", disk["auto_snapshot_policy_id"].clone()),
                        ("Device", disk["device"].clone()),
                        ("PerformanceLevel", performance_level),
                    ])
                })
                .collect()
        })
        .unwrap_or_default()
}

/// `RunInstances` parameters for a planned instance.
fn run_instances_request(d: &ResourceData, client_token: String) -> Value {
    let mut request = Map::new();
    request.insert("ClientToken".into(), json!(client_token));
    request.insert("InstanceType".into(), json!(d.get_str("instance_type")));
    request.insert("ImageId".into(), json!(d.get_str("image_id")));
    copy_set(
        &mut request,
        d,
        &[
            ("ZoneId", "availability_zone"),
            ("SystemDisk.DiskName", "system_disk_name"),
            ("SystemDisk.Description", "system_disk_description"),
            ("SystemDisk.PerformanceLevel", "system_disk_performance_level"),
            ("SystemDisk.Category", "system_disk_category"),
            ("SystemDisk.Size", "system_disk_size"),
            ("SystemDisk.AutoSnapshotPolicyId", "system_disk_auto_snapshot_policy_id"),
            ("SystemDisk.StorageClusterId", "system_disk_storage_cluster_id"),
            ("SystemDisk.KMSKeyId", "system_disk_kms_key_id"),
            ("SystemDisk.EncryptAlgorithm", "system_disk_encrypt_algorithm"),
        ],
    );
    if let Some(encrypted) = d.get("system_disk_encrypted").as_bool() {
        request.insert("SystemDisk.Encrypted".into(), json!(encrypted));
    }

    let groups = d.get_strings("security_groups");
    let vswitch_id = vswitch(d);
    if vswitch_id.is_empty() {
        // Classic network instances take a single group at launch.
        if let Some(first) = groups.first() {
            request.insert("SecurityGroupId".into(), json!(first));
        }
    } else if !groups.is_empty() {
        request.insert("SecurityGroupIds".into(), json!(groups));
    }

    copy_set(
        &mut request,
        d,
        &[
            ("InstanceName", "instance_name"),
            ("CreditSpecification", "credit_specification"),
            ("ResourceGroupId", "resource_group_id"),
            ("Description", "description"),
            ("InternetChargeType", "internet_charge_type"),
            ("InternetMaxBandwidthOut", "internet_max_bandwidth_out"),
            ("InternetMaxBandwidthIn", "internet_max_bandwidth_in"),
            ("HostName", "host_name"),
            ("Password", "password"),
        ],
    );

    if !vswitch_id.is_empty() {
        request.insert("VSwitchId".into(), json!(vswitch_id));
        copy_set(&mut request, d, &[("PrivateIpAddress", "private_ip")]);
    }

    let charge_type = d.get_str_ok("instance_charge_type").unwrap_or(POST_PAID);
    request.insert("InstanceChargeType".into(), json!(charge_type));
    if charge_type == PRE_PAID {
        copy_set(&mut request, d, &[("Period", "period"), ("PeriodUnit", "period_unit")]);
    } else {
        copy_set(
            &mut request,
            d,
            &[("SpotStrategy", "spot_strategy"), ("SpotPriceLimit", "spot_price_limit")],
        );
    }

    if let Some(user_data) = d.get_str_ok("user_data") {
        request.insert("UserData".into(), json!(encode_user_data(user_data)));
    }
    copy_set(
        &mut request,
        d,
        &[
            ("RamRoleName", "role_name"),
            ("KeyPairName", "key_name"),
            ("SecurityEnhancementStrategy", "security_enhancement_strategy"),
            ("AutoReleaseTime", "auto_release_time"),
            ("HpcClusterId", "hpc_cluster_id"),
            ("DeploymentSetId", "deployment_set_id"),
            ("HttpTokens", "http_tokens"),
            ("HttpEndpoint", "http_endpoint"),
            ("HttpPutResponseHopLimit", "http_put_response_hop_limit"),
            ("Ipv6AddressCount", "ipv6_address_count"),
            ("DedicatedHostId", "dedicated_host_id"),
        ],
    );
    request.insert("DryRun".into(), json!(d.get_bool("dry_run")));
    request.insert("DeletionProtection".into(), json!(d.get_bool("deletion_protection")));
    request.insert("IoOptimized".into(), json!("optimized"));
    if let Some(duration) = d.get("spot_duration").as_i64() {
        request.insert("SpotDuration".into(), json!(duration));
    }

    let tags: Vec<Value> = string_map(d.get("tags"))
        .into_iter()
        .map(|(k, v)| json!({ "Key": k, "Value": v }))
        .collect();
    if !tags.is_empty() {
        request.insert("Tag".into(), Value::Array(tags));
    }
    let disks = data_disks(d);
    if !disks.is_empty() {
        request.insert("DataDisk".into(), Value::Array(disks));
    }
    let ipv6 = d.get_strings("ipv6_addresses");
    if !ipv6.is_empty() {
        request.insert("Ipv6Address".into(), json!(ipv6));
    }

    Value::Object(request)
}


fn set_from(d: &mut ResourceData, source: &Value, pairs: &[(&str, &str)]) {
    for (attr, pointer) in pairs {
        if let Some(value) = source.pointer(pointer) {
            d.set(attr, value.clone());
        }
    }
}

/// Id of the instance's primary network interface.
async fn primary_network_interface(ecs: EcsService<'_>, id: &str) -> Result<String, ProviderError> {
    let instance = ecs.describe_instance(id).await?;
    let interfaces = items(&instance, "/NetworkInterfaces/NetworkInterface");
    interfaces
        .iter()
        .find(|n| n["Type"] == "Primary")
        .or_else(|| interfaces.first())
        .and_then(|n| n["NetworkInterfaceId"].as_str())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::NotFound(format!("primary network interface of instance {}", id)))
}

fn data_disk_block() -> Block {
    Block::new()
        .with_attribute("name", Attribute::optional_string().with_force_new())
        .with_attribute(
            "size",
            Attribute::required_int64()
                .with_force_new()
                .with_constraint(Constraint::int_between(20, 32768)),
        )
        .with_attribute(
            "category",
            Attribute::optional_string()
                .with_force_new()
                .with_default(json!("cloud_efficiency"))
                .with_constraint(Constraint::string_in(&[
                    "cloud",
                    "cloud_efficiency",
                    "cloud_ssd",
                    "cloud_essd",
                    "cloud_auto",
                    "ephemeral_ssd",
                ])),
        )
        .with_attribute(
            "encrypted",
            Attribute::optional_bool().with_force_new().with_default(json!(false)),
        )
        .with_attribute("kms_key_id", Attribute::optional_string().with_force_new())
        .with_attribute("snapshot_id", Attribute::optional_string().with_force_new())
        .with_attribute("auto_snapshot_policy_id", Attribute::optional_string().with_force_new())
        .with_attribute(
            "delete_with_instance",
            Attribute::optional_bool().with_force_new().with_default(json!(true)),
        )
        .with_attribute("description", Attribute::optional_string().with_force_new())
        .with_attribute(
            "performance_level",
            Attribute::optional_string()
                .with_force_new()
                .with_constraint(Constraint::string_in(&["PL0", "PL1", "PL2", "PL3"])),
        )
        .with_attribute("device", Attribute::optional_string().with_force_new())
}

fn maintenance_window_block() -> Block {
    Block::new()
        .with_attribute("start_time", Attribute::optional_string())
        .with_attribute("end_time", Attribute::optional_string())
}

#[async_trait]
impl Resource for Instance {
    fn type_name(&self) -> &'static str {
        "alicloud_instance"
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts {
            create: Duration::from_secs(10 * 60),
            update: Duration::from_secs(10 * 60),
            delete: Duration::from_secs(20 * 60),
        }
    }

    fn schema(&self) -> Schema {
        let performance_levels = Constraint::string_in(&["PL0", "PL1", "PL2", "PL3"]);
        Schema::v0()
            .with_attribute("id", Attribute::computed_string())
            .with_attribute(
                "availability_zone",
                Attribute::optional_computed_string().with_force_new(),
            )
            .with_attribute("image_id", Attribute::required_string())
            .with_attribute(
                "instance_type",
                Attribute::required_string().with_constraint(Constraint::prefix("ecs.")),
            )
            .with_attribute(
                "credit_specification",
                Attribute::optional_computed_string()
                    .with_constraint(Constraint::string_in(&["Standard", "Unlimited"])),
            )
            .with_attribute(
                "security_groups",
                Attribute::new(AttributeType::set(AttributeType::String), AttributeFlags::required()),
            )
            .with_attribute(
                "instance_name",
                Attribute::optional_string()
                    .with_default(json!("ECS-Instance"))
                    .with_constraint(Constraint::string_len(2, 128)),
            )
            .with_attribute(
                "description",
                Attribute::optional_string().with_constraint(Constraint::string_len(2, 256)),
            )
            .with_attribute("resource_group_id", Attribute::optional_computed_string())
            .with_attribute(
                "internet_charge_type",
                Attribute::optional_string()
                    .with_default(json!("PayByTraffic"))
                    .with_constraint(Constraint::string_in(&["PayByBandwidth", "PayByTraffic"])),
            )
            .with_attribute(
                "internet_max_bandwidth_in",
                Attribute::optional_computed_int64().with_constraint(Constraint::int_between(1, 200)),
            )
            .with_attribute(
                "internet_max_bandwidth_out",
                Attribute::optional_int64()
                    .with_default(json!(0))
                    .with_constraint(Constraint::int_between(0, 100)),
            )
            .with_attribute("host_name", Attribute::optional_computed_string())
            .with_attribute("password", Attribute::optional_string().sensitive())
            .with_attribute(
                "system_disk_category",
                Attribute::optional_string()
                    .with_force_new()
                    .with_default(json!("cloud_efficiency"))
                    .with_constraint(Constraint::string_in(&[
                        "cloud",
                        "cloud_efficiency",
                        "cloud_ssd",
                        "cloud_essd",
                        "cloud_auto",
                        "ephemeral_ssd",
                    ])),
            )
            .with_attribute(
                "system_disk_size",
                Attribute::optional_int64()
                    .with_default(json!(40))
                    .with_constraint(Constraint::int_between(20, 2048)),
            )
            .with_attribute("system_disk_name", Attribute::optional_computed_string())
            .with_attribute("system_disk_description", Attribute::optional_computed_string())
            .with_attribute(
                "system_disk_performance_level",
                Attribute::optional_computed_string().with_constraint(performance_levels),
            )
            .with_attribute(
                "system_disk_auto_snapshot_policy_id",
                Attribute::optional_string(),
            )
            .with_attribute(
                "system_disk_encrypted",
                Attribute::optional_bool().with_force_new(),
            )
            .with_attribute(
                "system_disk_kms_key_id",
                Attribute::optional_string().with_force_new(),
            )
            .with_attribute(
                "system_disk_encrypt_algorithm",
                Attribute::optional_string().with_force_new(),
            )
            .with_attribute(
                "system_disk_storage_cluster_id",
                Attribute::optional_string().with_force_new(),
            )
            .with_block(
                "data_disks",
                NestedBlock::list(data_disk_block())
                    .with_min_items(1)
                    .with_max_items(16),
            )
            .with_attribute("vswitch_id", Attribute::optional_computed_string())
            .with_attribute(
                "subnet_id",
                Attribute::optional_computed_string().with_conflicts_with(&["vswitch_id"]),
            )
            .with_attribute("private_ip", Attribute::optional_computed_string())
            .with_attribute(
                "instance_charge_type",
                Attribute::optional_string()
                    .with_default(json!(POST_PAID))
                    .with_constraint(Constraint::string_in(&[PRE_PAID, POST_PAID])),
            )
            .with_attribute(
                "period",
                Attribute::optional_int64()
                    .with_default(json!(1))
                    .with_constraint(Constraint::int_in(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 12, 24, 36, 48, 60])),
            )
            .with_attribute(
                "period_unit",
                Attribute::optional_string()
                    .with_default(json!("Month"))
                    .with_constraint(Constraint::string_in(&["Week", "Month"])),
            )
            .with_attribute(
                "renewal_status",
                Attribute::optional_string()
                    .with_default(json!("Normal"))
                    .with_constraint(Constraint::string_in(&["AutoRenewal", "Normal", "NotRenewal"])),
            )
            .with_attribute(
                "auto_renew_period",
                Attribute::optional_int64()
                    .with_default(json!(1))
                    .with_constraint(Constraint::int_in(&[1, 2, 3, 6, 12])),
            )
            .with_attribute(
                "include_data_disks",
                Attribute::optional_bool().with_default(json!(true)),
            )
            .with_attribute("dry_run", Attribute::optional_bool().with_default(json!(false)))
            .with_attribute(
                "status",
                Attribute::optional_string()
                    .with_default(json!(RUNNING))
                    .with_constraint(Constraint::string_in(&[RUNNING, STOPPED])),
            )
            .with_attribute("user_data", Attribute::optional_string())
            .with_attribute("role_name", Attribute::optional_computed_string())
            .with_attribute("key_name", Attribute::optional_computed_string())
            .with_attribute(
                "spot_strategy",
                Attribute::optional_string()
                    .with_force_new()
                    .with_default(json!("NoSpot"))
                    .with_constraint(Constraint::string_in(&[
                        "NoSpot",
                        "SpotAsPriceGo",
                        "SpotWithPriceLimit",
                    ])),
            )
            .with_attribute(
                "spot_price_limit",
                Attribute::new(AttributeType::Float64, AttributeFlags::optional()).with_force_new(),
            )
            .with_attribute(
                "spot_duration",
                Attribute::optional_computed_int64().with_constraint(Constraint::int_between(0, 6)),
            )
            .with_attribute(
                "deletion_protection",
                Attribute::optional_bool().with_default(json!(false)),
            )
            .with_attribute(
                "force_delete",
                Attribute::optional_bool().with_default(json!(false)),
            )
            .with_attribute(
                "security_enhancement_strategy",
                Attribute::optional_string()
                    .with_force_new()
                    .with_constraint(Constraint::string_in(&["Active", "Deactive"])),
            )
            .with_attribute("tags", Attribute::optional_string_map())
            .with_attribute("volume_tags", Attribute::optional_string_map().with_computed())
            .with_attribute("auto_release_time", Attribute::optional_string())
            .with_attribute("hpc_cluster_id", Attribute::optional_string().with_force_new())
            .with_attribute(
                "secondary_private_ips",
                Attribute::optional_string_set()
                    .with_computed()
                    .with_conflicts_with(&["secondary_private_ip_address_count"]),
            )
            .with_attribute(
                "secondary_private_ip_address_count",
                Attribute::optional_computed_int64(),
            )
            .with_attribute("deployment_set_id", Attribute::optional_string())
            .with_attribute("deployment_set_group_no", Attribute::computed_string())
            .with_attribute(
                "operator_type",
                Attribute::optional_string()
                    .with_constraint(Constraint::string_in(&["upgrade", "downgrade"])),
            )
            .with_attribute(
                "stopped_mode",
                Attribute::optional_computed_string()
                    .with_constraint(Constraint::string_in(&["StopCharging", "KeepCharging", "Not-applicable"])),
            )
            .with_block(
                "maintenance_time",
                NestedBlock::set(maintenance_window_block()).with_max_items(1),
            )
            .with_attribute(
                "maintenance_action",
                Attribute::optional_computed_string()
                    .with_constraint(Constraint::string_in(&["Stop", "AutoRecover", "AutoRedeploy"])),
            )
            .with_attribute("maintenance_notify", Attribute::optional_bool())
            .with_attribute(
                "http_tokens",
                Attribute::optional_computed_string()
                    .with_constraint(Constraint::string_in(&["optional", "required"])),
            )
            .with_attribute(
                "http_endpoint",
                Attribute::optional_computed_string()
                    .with_constraint(Constraint::string_in(&["enabled", "disabled"])),
            )
            .with_attribute(
                "http_put_response_hop_limit",
                Attribute::optional_computed_int64()
                    .with_force_new()
                    .with_constraint(Constraint::int_between(1, 64)),
            )
            .with_attribute(
                "ipv6_address_count",
                Attribute::optional_computed_int64()
                    .with_force_new()
                    .with_constraint(Constraint::int_between(1, 10))
                    .with_conflicts_with(&["ipv6_addresses"]),
            )
            .with_attribute(
                "ipv6_addresses",
                Attribute::optional_string_set().with_computed().with_force_new(),
            )
            .with_attribute(
                "dedicated_host_id",
                Attribute::optional_string().with_force_new(),
            )
            .with_attribute(
                "allocate_public_ip",
                Attribute::optional_bool().deprecated(
                    "Field 'allocate_public_ip' has been deprecated. Setting 'internet_max_bandwidth_out' larger than 0 allocates a public ip.",
                ),
            )
            .with_attribute(
                "io_optimized",
                Attribute::optional_string()
                    .deprecated("Field 'io_optimized' has been deprecated. Every instance is I/O optimized."),
            )
            .with_attribute("public_ip", Attribute::computed_string())
            .with_attribute("primary_ip_address", Attribute::computed_string())
            .with_attribute("network_interface_id", Attribute::computed_string())
            .with_attribute("cpu", Attribute::computed_int64())
            .with_attribute("memory", Attribute::computed_int64())
            .with_attribute("os_name", Attribute::computed_string())
            .with_attribute("os_type", Attribute::computed_string())
    }

    fn diff_suppressed(&self, attr: &str, old: &Value, new: &Value, planned: &Value) -> bool {
        let charge_type = planned["instance_charge_type"].as_str().unwrap_or(POST_PAID);
        match attr {
            "period" | "period_unit" | "renewal_status" | "include_data_disks" | "force_delete" => {
                charge_type != PRE_PAID
            }
            "auto_renew_period" => {
                charge_type != PRE_PAID || planned["renewal_status"] != "AutoRenewal"
            }
            "internet_charge_type" | "internet_max_bandwidth_in" => {
                as_i64(&planned["internet_max_bandwidth_out"]) == 0
            }
            "spot_strategy" | "spot_price_limit" => charge_type != POST_PAID,
            "auto_release_time" => {
                charge_type == PRE_PAID
                    || matches!(
                        (old.as_str(), new.as_str()),
                        (Some(old), Some(new)) if !old.is_empty() && new.starts_with(old.trim_end_matches('Z'))
                    )
            }
            "role_name" => {
                planned["vswitch_id"].as_str().unwrap_or_default().is_empty()
                    && planned["subnet_id"].as_str().unwrap_or_default().is_empty()
            }
            _ => false,
        }
    }

    fn customize_diff(&self, prior: &Value, plan: &mut PlanResult) -> Result<(), ProviderError> {
        if prior.is_null() || plan.planned_state.is_null() {
            return Ok(());
        }
        let planned = &plan.planned_state;
        let shrinks = as_i64(&planned["system_disk_size"]) < as_i64(&prior["system_disk_size"]);
        let old_type = prior["instance_type"].as_str().unwrap_or_default();
        let new_type = planned["instance_type"].as_str().unwrap_or_default();
        let family_changes = !old_type.is_empty() && family(old_type) != family(new_type);
        if shrinks || family_changes {
            plan.requires_replace = true;
        }
        Ok(())
    }

    async fn create(&self, ctx: &ResourceContext, planned: Value) -> Result<Value, ProviderError> {
        let mut d = ResourceData::new_resource(planned);
        let ecs = EcsService::new(&ctx.client);
        let timeouts = self.timeouts();

        let request = run_instances_request(&d, ecs.client_token("RunInstances"));
        let wait = IncrementalWait::new(Duration::from_secs(1), Duration::from_secs(1));
        let (request, wait) = (&request, &wait);
        let launched = retry(ctx.retry_timeout(timeouts.create), move || async move {
            match ecs.call("RunInstances", request.clone()).await {
                Ok(response) => Ok(response),
                Err(err) => match RetryError::classify(err, &["IncorrectVSwitchStatus"]) {
                    RetryError::Retryable(err) => {
                        wait.wait().await;
                        Err(RetryError::Retryable(err))
                    }
                    other => Err(other),
                },
            }
        })
        .await;

        let response = match launched {
            Ok(response) => response,
            Err(err) if err.is_expected(&["OperationDenied.NoStock"]) => {
                let instance_type = d.get_str("instance_type");
                let charge_type = d.get_str_ok("instance_charge_type").unwrap_or(POST_PAID);
                let zones = ecs.describe_available_zones(instance_type, charge_type).await?;
                return Err(ProviderError::ResourceExhausted(format!(
                    "{}; zones with {} in stock: [{}]",
                    err,
                    instance_type,
                    zones.join(", ")
                )));
            }
            Err(err) => return Err(err),
        };
        let id = pointer(&response, "/InstanceIdSets/InstanceIdSet/0")
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Sdk("RunInstances returned no instance id".into()))?;
        d.set_id(id.clone());
        info!(instance_id = %id, "launched instance");

        // From here on the instance exists; failures hand back its state.
        let settled = async {
            ecs.wait_for_instance(
                &id,
                StateWaiter::new(&["Pending", "Starting", STOPPED], &[RUNNING], timeouts.create)
                    .with_fail(&["Stopping"])
                    .with_delay(Duration::from_secs(10)),
            )
            .await?;
            self.apply(ctx, ecs, &mut d).await
        }
        .await;
        let state = d.into_state();
        if let Err(err) = settled {
            return Err(err.with_state(state));
        }

        match self.read(ctx, state.clone()).await {
            Ok(Some(state)) => Ok(state),
            Ok(None) => Err(ProviderError::NotFound(format!("instance {} vanished after create", id))),
            Err(err) => Err(err.with_state(state)),
        }
    }

    async fn read(&self, ctx: &ResourceContext, state: Value) -> Result<Option<Value>, ProviderError> {
        let mut d = ResourceData::from_state(state);
        let id = d.id().to_string();
        let ecs = EcsService::new(&ctx.client);
        let instance = match ecs.describe_instance(&id).await {
            Ok(instance) => instance,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        let resource_group = instance["ResourceGroupId"].as_str().unwrap_or_default();
        let disk = ecs
            .describe_system_disk_eventually(&id, resource_group, ctx.retry_timeout(DISK_VISIBLE_TIMEOUT))
            .await?;
        set_from(
            &mut d,
            &disk,
            &[
                ("system_disk_category", "/Category"),
                ("system_disk_size", "/Size"),
                ("system_disk_name", "/DiskName"),
                ("system_disk_description", "/Description"),
                ("system_disk_performance_level", "/PerformanceLevel"),
                ("system_disk_auto_snapshot_policy_id", "/AutoSnapshotPolicyId"),
                ("system_disk_encrypted", "/Encrypted"),
                ("system_disk_kms_key_id", "/KMSKeyId"),
                ("system_disk_storage_cluster_id", "/StorageClusterId"),
            ],
        );
        d.set("volume_tags", json!(tags_to_map(&pointer(&disk, "/Tags/Tag"))));

        set_from(
            &mut d,
            &instance,
            &[
                ("instance_name", "/InstanceName"),
                ("availability_zone", "/ZoneId"),
                ("image_id", "/ImageId"),
                ("instance_type", "/InstanceType"),
                ("status", "/Status"),
                ("description", "/Description"),
                ("resource_group_id", "/ResourceGroupId"),
                ("internet_charge_type", "/InternetChargeType"),
                ("internet_max_bandwidth_out", "/InternetMaxBandwidthOut"),
                ("internet_max_bandwidth_in", "/InternetMaxBandwidthIn"),
                ("host_name", "/HostName"),
                ("key_name", "/KeyPairName"),
                ("credit_specification", "/CreditSpecification"),
                ("deletion_protection", "/DeletionProtection"),
                ("instance_charge_type", "/InstanceChargeType"),
                ("auto_release_time", "/AutoReleaseTime"),
                ("deployment_set_id", "/DeploymentSetId"),
                ("spot_strategy", "/SpotStrategy"),
                ("spot_price_limit", "/SpotPriceLimit"),
                ("spot_duration", "/SpotDuration"),
                ("cpu", "/Cpu"),
                ("memory", "/Memory"),
                ("os_name", "/OSName"),
                ("os_type", "/OSType"),
                ("stopped_mode", "/StoppedMode"),
                ("dedicated_host_id", "/DedicatedHostAttribute/DedicatedHostId"),
                ("http_endpoint", "/MetadataOptions/HttpEndpoint"),
                ("http_tokens", "/MetadataOptions/HttpTokens"),
                ("http_put_response_hop_limit", "/MetadataOptions/HttpPutResponseHopLimit"),
            ],
        );
        match instance.get("DeploymentSetGroupNo") {
            Some(Value::String(group_no)) => d.set("deployment_set_group_no", json!(group_no)),
            Some(Value::Number(group_no)) => {
                d.set("deployment_set_group_no", json!(group_no.to_string()))
            }
            _ => {}
        }
        d.set("tags", json!(tags_to_map(&pointer(&instance, "/Tags/Tag"))));
        d.set(
            "security_groups",
            json!(strings(&pointer(&instance, "/SecurityGroupIds/SecurityGroupId"))),
        );
        let public_ip = pointer(&instance, "/PublicIpAddress/IpAddress/0")
            .as_str()
            .or_else(|| instance.pointer("/EipAddress/IpAddress").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        d.set("public_ip", json!(public_ip));

        let vswitch_id = pointer(&instance, "/VpcAttributes/VSwitchId")
            .as_str()
            .unwrap_or_default()
            .to_string();
        let private_ip = if vswitch_id.is_empty() {
            strings(&pointer(&instance, "/InnerIpAddress/IpAddress")).join(",")
        } else {
            d.set("vswitch_id", json!(vswitch_id));
            d.set("subnet_id", json!(vswitch_id));
            pointer(&instance, "/VpcAttributes/PrivateIpAddress/IpAddress/0")
                .as_str()
                .unwrap_or_default()
                .to_string()
        };
        d.set("private_ip", json!(private_ip));
        d.set("primary_ip_address", json!(private_ip));

        if let Some(configured) = d.get_str_ok("user_data").map(str::to_string) {
            let remote = ecs.describe_user_data(&id).await?;
            if !remote.is_empty() {
                if is_base64(&configured) {
                    d.set("user_data", json!(remote));
                } else if let Some(plain) = STANDARD
                    .decode(&remote)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                {
                    d.set("user_data", json!(plain));
                }
            }
        }

        if !vswitch_id.is_empty() {
            let role = ecs.describe_ram_role(&id).await?.unwrap_or_default();
            d.set("role_name", json!(role));
        }

        if instance["InstanceChargeType"] == PRE_PAID {
            if let Some(renew) = ecs.describe_auto_renew(&id).await? {
                set_from(
                    &mut d,
                    &renew,
                    &[("renewal_status", "/RenewalStatus"), ("auto_renew_period", "/Duration")],
                );
            }
        }

        let interfaces = items(&instance, "/NetworkInterfaces/NetworkInterface");
        let primary = interfaces
            .iter()
            .find(|n| n["Type"] == "Primary")
            .or_else(|| interfaces.first())
            .and_then(|n| n["NetworkInterfaceId"].as_str());
        if let Some(eni_id) = primary {
            d.set("network_interface_id", json!(eni_id));
            let eni = ecs.describe_network_interface(eni_id).await?;
            let secondary: Vec<String> = items(&eni, "/PrivateIpSets/PrivateIpSet")
                .iter()
                .filter(|ip| ip["Primary"] != true)
                .filter_map(|ip| ip["PrivateIpAddress"].as_str().map(str::to_string))
                .collect();
            d.set("secondary_private_ip_address_count", json!(secondary.len()));
            d.set("secondary_private_ips", json!(secondary));
            let ipv6: Vec<String> = items(&eni, "/Ipv6Sets/Ipv6Set")
                .iter()
                .filter_map(|ip| ip["Ipv6Address"].as_str().map(str::to_string))
                .collect();
            d.set("ipv6_address_count", json!(ipv6.len()));
            d.set("ipv6_addresses", json!(ipv6));
        }

        let maintenance = ecs.describe_maintenance_attribute(&id).await?;
        if let Some(window) = items(&maintenance, "/MaintenanceWindows/MaintenanceWindow").first() {
            d.set(
                "maintenance_time",
                json!([{
                    "start_time": window["StartTime"],
                    "end_time": window["EndTime"],
                }]),
            );
        }
        set_from(
            &mut d,
            &maintenance,
            &[
                ("maintenance_action", "/ActionOnMaintenance/Value"),
                ("maintenance_notify", "/NotifyOnMaintenance"),
            ],
        );

        Ok(Some(d.into_state()))
    }

    async fn update(
        &self,
        ctx: &ResourceContext,
        prior: Value,
        planned: Value,
    ) -> Result<Value, ProviderError> {
        let mut d = ResourceData::update(prior, planned);
        let id = d.id().to_string();
        self.apply(ctx, EcsService::new(&ctx.client), &mut d).await?;
        self.read(ctx, d.into_state())
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("instance {}", id)))
    }

    async fn delete(&self, ctx: &ResourceContext, state: Value) -> Result<(), ProviderError> {
        let d = ResourceData::from_state(state);
        let id = d.id().to_string();
        let ecs = EcsService::new(&ctx.client);
        let timeout = self.timeouts().delete;

        if d.get_str("instance_charge_type") == PRE_PAID {
            if !d.get_bool("force_delete") {
                return Err(ProviderError::FailedPrecondition(
                    "Please convert 'PrePaid' instance to 'PostPaid' or set 'force_delete' as true before deleting 'PrePaid' instance."
                        .into(),
                ));
            }
            self.modify_charge_type(ctx, ecs, &d, POST_PAID).await?;
        }

        let wait = IncrementalWait::new(Duration::from_secs(1), Duration::from_secs(1));
        let (wait, instance_id) = (&wait, id.as_str());
        let deleted = retry(ctx.retry_timeout(timeout), move || async move {
            let request = json!({ "InstanceId": instance_id, "Force": true });
            match ecs.call("DeleteInstance", request).await {
                Ok(_) => Ok(()),
                Err(err)
                    if err.is_expected(&[
                        "IncorrectInstanceStatus",
                        "DependencyViolation.RouteEntry",
                        "IncorrectInstanceStatus.Initializing",
                    ]) =>
                {
                    Err(RetryError::retryable(err))
                }
                Err(err) if err.is_expected(&["Throttling", "LastTokenProcessing"]) => {
                    wait.wait().await;
                    Err(RetryError::retryable(err))
                }
                Err(err) => Err(RetryError::classify(err, &[])),
            }
        })
        .await;
        match deleted {
            Ok(()) => {}
            Err(err) if err.is_expected(ECS_NOT_FOUND) => return Ok(()),
            Err(err) => return Err(err),
        }

        ecs.wait_for_instance(
            &id,
            StateWaiter::until_gone(&["Pending", RUNNING, STOPPED, "Stopping"], timeout)
                .with_delay(Duration::from_secs(10)),
        )
        .await?;
        info!(instance_id = %id, "deleted instance");
        Ok(())
    }
}

impl Instance {
    /// Push the planned values of `d` to the instance.
    ///
    /// Runs for updates and, with `d.is_new()`, right after launch.
    async fn apply(
        &self,
        ctx: &ResourceContext,
        ecs: EcsService<'_>,
        d: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let id = d.id().to_string();
        let timeouts = self.timeouts();
        let update_timeout = ctx.retry_timeout(timeouts.update);

        if !d.is_new() && d.has_change("tags") {
            let old = string_map(d.get_prior("tags"));
            let new = string_map(d.get("tags"));
            ecs.update_tags("instance", &[id.clone()], &old, &new).await?;
            d.commit(&["tags"]);
        }

        if !d.is_new() && d.has_change("resource_group_id") {
            let request = json!({
                "ResourceId": id,
                "ResourceType": "instance",
                "ResourceGroupId": d.get_str("resource_group_id"),
            });
            ecs.call_retrying("JoinResourceGroup", request, update_timeout).await?;
            d.commit(&["resource_group_id"]);
        }

        if d.has_change("volume_tags") {
            let disks = ecs.describe_disk_ids(&id).await?;
            let old = string_map(d.get_prior("volume_tags"));
            let new = string_map(d.get("volume_tags"));
            ecs.update_tags("disk", &disks, &old, &new).await?;
            d.commit(&["volume_tags"]);
        }

        // A new VPC instance got every group from RunInstances.
        if d.has_change("security_groups") && (!d.is_new() || vswitch(d).is_empty()) {
            let (added, removed) = set_diff(
                &d.get_prior_strings("security_groups"),
                &d.get_strings("security_groups"),
            );
            ecs.join_security_groups(&id, &added).await?;
            ecs.leave_security_groups(&id, &removed).await?;
            d.commit(&["security_groups"]);
        }

        if !d.is_new() && d.has_changes(SYSTEM_DISK_FIELDS) {
            self.modify_system_disk(ctx, ecs, d).await?;
            d.commit(SYSTEM_DISK_FIELDS);
        }

        let image_update = !d.is_new() && d.has_change("image_id");
        let vpc_update = !d.is_new() && d.has_changes(&["vswitch_id", "subnet_id", "private_ip"]);
        let reboot = self.modify_attribute(ctx, ecs, d).await?;

        if !d.is_new() && d.has_change("auto_release_time") {
            let request = json!({
                "InstanceId": id,
                "AutoReleaseTime": d.get_str("auto_release_time"),
            });
            ecs.call_retrying("ModifyInstanceAutoReleaseTime", request, update_timeout).await?;
            d.commit(&["auto_release_time"]);
        }

        let type_update = !d.is_new() && d.has_change("instance_type");
        let target = d.get_str_ok("status").unwrap_or(RUNNING).to_string();
        let status_update = d.has_change("status") && !(d.is_new() && target == RUNNING);
        if image_update || vpc_update || reboot || type_update || status_update {
            self.update_as_stopped(ctx, ecs, d, &target).await?;
        }

        self.modify_network_spec(ctx, ecs, d).await?;

        if !d.is_new() && d.has_change("instance_charge_type") {
            let charge_type = d.get_str_ok("instance_charge_type").unwrap_or(POST_PAID).to_string();
            self.modify_charge_type(ctx, ecs, d, &charge_type).await?;
            d.commit(&["instance_charge_type", "period", "period_unit"]);
        }

        if d.get_str("instance_charge_type") == PRE_PAID
            && d.has_changes(&["renewal_status", "auto_renew_period"])
        {
            let renewal = d.get_str_ok("renewal_status").unwrap_or("Normal");
            let mut request = json!({ "InstanceId": id, "RenewalStatus": renewal });
            if renewal == "AutoRenewal" {
                request["Duration"] = json!(d.get_i64("auto_renew_period"));
                request["PeriodUnit"] = json!(d.get_str_ok("period_unit").unwrap_or("Month"));
            }
            ecs.call_retrying("ModifyInstanceAutoRenewAttribute", request, update_timeout)
                .await?;
            d.commit(&["renewal_status", "auto_renew_period"]);
        }

        self.modify_secondary_ips(ctx, ecs, d).await?;

        if !d.is_new() && d.has_change("deployment_set_id") {
            let request = match d.get_str_ok("deployment_set_id") {
                Some(set) => json!({
                    "InstanceId": id,
                    "ClientToken": ecs.client_token("ModifyInstanceDeployment"),
                    "DeploymentSetId": set,
                }),
                None => json!({
                    "InstanceId": id,
                    "ClientToken": ecs.client_token("ModifyInstanceDeployment"),
                    "DeploymentSetId": d.get_prior("deployment_set_id"),
                    "RemoveFromDeploymentSet": true,
                }),
            };
            ecs.call_retrying("ModifyInstanceDeployment", request, update_timeout).await?;
            d.commit(&["deployment_set_id"]);
        }

        if d.has_changes(&["maintenance_time", "maintenance_action", "maintenance_notify"]) {
            let windows: Vec<Value> = d
                .get("maintenance_time")
                .as_array()
                .map(|windows| {
                    windows
                        .iter()
                        .map(|w| {
                            params([
                                ("StartTime", w["start_time"].clone()),
                                ("EndTime", w["end_time"].clone()),
                            ])
                        })
                        .collect()
                })
                .unwrap_or_default();
            let mut request = json!({ "InstanceId": [id], "MaintenanceWindow": windows });
            if let Some(action) = d.get_str_ok("maintenance_action") {
                request["ActionOnMaintenance"] = json!(action);
            }
            if let Some(notify) = d.get("maintenance_notify").as_bool() {
                request["NotifyOnMaintenance"] = json!(notify);
            }
            ecs.call_retrying("ModifyInstanceMaintenanceAttributes", request, update_timeout)
                .await?;
            d.commit(&["maintenance_time", "maintenance_action", "maintenance_notify"]);
        }

        if d.has_changes(&["http_endpoint", "http_tokens"]) {
            let request = params([
                ("InstanceId", json!(id)),
                ("HttpEndpoint", json!(d.get_str_ok("http_endpoint").unwrap_or("enabled"))),
                ("HttpTokens", d.get("http_tokens").clone()),
            ]);
            ecs.call_retrying("ModifyInstanceMetadataOptions", request, update_timeout)
                .await?;
            d.commit(&["http_endpoint", "http_tokens"]);
        }

        Ok(())
    }

    async fn modify_system_disk(
        &self,
        ctx: &ResourceContext,
        ecs: EcsService<'_>,
        d: &ResourceData,
    ) -> Result<(), ProviderError> {
        let id = d.id();
        let timeout = ctx.retry_timeout(self.timeouts().update);
        let instance = ecs.describe_instance(id).await?;
        let resource_group = instance["ResourceGroupId"].as_str().unwrap_or_default();
        let disk = ecs.describe_system_disk(id, resource_group).await?;
        let disk_id = disk["DiskId"].as_str().unwrap_or_default();

        if d.has_change("system_disk_size") {
            let mode = if instance["Status"] == STOPPED { "offline" } else { "online" };
            let request = json!({
                "DiskId": disk_id,
                "NewSize": d.get_i64("system_disk_size"),
                "Type": mode,
            });
            ecs.call_retrying("ResizeDisk", request, timeout).await?;
        }
        if d.has_change("system_disk_auto_snapshot_policy_id") {
            let request = json!({
                "autoSnapshotPolicyId": d.get_str("system_disk_auto_snapshot_policy_id"),
                "diskIds": json_list(&[disk_id]),
            });
            ecs.call_retrying("ApplyAutoSnapshotPolicy", request, timeout).await?;
        }
        if d.has_changes(&["system_disk_name", "system_disk_description"]) {
            let request = params([
                ("DiskId", json!(disk_id)),
                ("DiskName", d.get("system_disk_name").clone()),
                ("Description", d.get("system_disk_description").clone()),
            ]);
            ecs.call_retrying("ModifyDiskAttribute", request, timeout).await?;
        }
        Ok(())
    }

    /// `ModifyInstanceAttribute` for changed fields. Returns whether the
    /// change only takes effect after a reboot.
    async fn modify_attribute(
        &self,
        ctx: &ResourceContext,
        ecs: EcsService<'_>,
        d: &mut ResourceData,
    ) -> Result<bool, ProviderError> {
        const FIELDS: &[&str] = &[
            "instance_name",
            "description",
            "user_data",
            "host_name",
            "password",
            "deletion_protection",
            "credit_specification",
        ];
        if d.is_new() || !d.has_changes(FIELDS) {
            return Ok(false);
        }

        let mut request = Map::new();
        request.insert("InstanceId".into(), json!(d.id()));
        let mut reboot = false;
        if d.has_change("instance_name") {
            request.insert("InstanceName".into(), json!(d.get_str("instance_name")));
        }
        if d.has_change("description") {
            request.insert("Description".into(), json!(d.get_str("description")));
        }
        if d.has_change("user_data") {
            request.insert("UserData".into(), json!(encode_user_data(d.get_str("user_data"))));
            reboot = true;
        }
        if d.has_change("host_name") {
            request.insert("HostName".into(), json!(d.get_str("host_name")));
            reboot = true;
        }
        if d.has_change("password") {
            if let Some(password) = d.get_str_ok("password") {
                request.insert("Password".into(), json!(password));
                reboot = true;
            }
        }
        if d.has_change("deletion_protection") {
            request.insert("DeletionProtection".into(), json!(d.get_bool("deletion_protection")));
        }
        if d.has_change("credit_specification") {
            request.insert(
                "CreditSpecification".into(),
                json!(d.get_str("credit_specification")),
            );
        }

        ecs.call_retrying_on(
            "ModifyInstanceAttribute",
            Value::Object(request),
            ctx.retry_timeout(Duration::from_secs(5 * 60)),
            &["InvalidChargeType.ValueNotSupported"],
        )
        .await?;
        d.commit(FIELDS);
        Ok(reboot)
    }

    /// Stop the instance, apply changes that need it stopped, then bring it
    /// to `target`. The restart is attempted even when a change failed.
    async fn update_as_stopped(
        &self,
        ctx: &ResourceContext,
        ecs: EcsService<'_>,
        d: &mut ResourceData,
        target: &str,
    ) -> Result<(), ProviderError> {
        let id = d.id().to_string();
        let timeout = self.timeouts().update;

        let instance = ecs.describe_instance(&id).await?;
        if instance["Status"] == RUNNING {
            let stopped_mode = d.get_str("stopped_mode").to_string();
            self.stop(ctx, ecs, &id, &stopped_mode, timeout).await?;
        }

        let modified = self.modify_while_stopped(ctx, ecs, d).await;
        let outcome = if target == RUNNING {
            match (modified, self.start(ctx, ecs, &id, timeout).await) {
                (Err(err), Err(start_err)) => {
                    warn!(instance_id = %id, error = %start_err, "restart after failed modification failed");
                    Err(err)
                }
                (Err(err), Ok(())) => Err(err),
                (Ok(()), started) => started,
            }
        } else {
            modified
        };
        outcome?;
        d.commit(&["status"]);
        Ok(())
    }

    async fn modify_while_stopped(
        &self,
        ctx: &ResourceContext,
        ecs: EcsService<'_>,
        d: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        if d.is_new() {
            return Ok(());
        }
        if d.has_change("image_id") {
            self.replace_system_disk(ctx, ecs, d).await?;
            d.commit(&["image_id"]);
        }
        if d.has_changes(&["vswitch_id", "subnet_id", "private_ip"]) {
            self.modify_vpc(ctx, ecs, d).await?;
            d.commit(&["vswitch_id", "subnet_id", "private_ip"]);
        }
        if d.has_change("instance_type") {
            self.modify_type(ctx, ecs, d).await?;
            d.commit(&["instance_type"]);
        }
        Ok(())
    }

    async fn stop(
        &self,
        ctx: &ResourceContext,
        ecs: EcsService<'_>,
        id: &str,
        stopped_mode: &str,
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        info!(instance_id = id, "stopping instance");
        let request = params([
            ("InstanceId", json!(id)),
            ("ForceStop", json!(false)),
            ("StoppedMode", json!(stopped_mode)),
        ]);
        ecs.call_retrying_on(
            "StopInstance",
            request,
            ctx.retry_timeout(Duration::from_secs(5 * 60)),
            &["IncorrectInstanceStatus"],
        )
        .await?;
        ecs.wait_for_instance(
            id,
            StateWaiter::new(&["Pending", RUNNING, "Stopping"], &[STOPPED], timeout)
                .with_delay(Duration::from_secs(5)),
        )
        .await?;
        Ok(())
    }

    async fn start(
        &self,
        ctx: &ResourceContext,
        ecs: EcsService<'_>,
        id: &str,
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        let instance = ecs.describe_instance(id).await?;
        if instance["Status"] != RUNNING {
            info!(instance_id = id, "starting instance");
            ecs.call_retrying_on(
                "StartInstance",
                json!({ "InstanceId": id }),
                ctx.retry_timeout(Duration::from_secs(5 * 60)),
                &["IncorrectInstanceStatus"],
            )
            .await?;
        }
        ecs.wait_for_instance(
            id,
            StateWaiter::new(&["Pending", "Starting", STOPPED], &[RUNNING], timeout)
                .with_delay(Duration::from_secs(5)),
        )
        .await?;
        Ok(())
    }

    async fn replace_system_disk(
        &self,
        ctx: &ResourceContext,
        ecs: EcsService<'_>,
        d: &ResourceData,
    ) -> Result<(), ProviderError> {
        let id = d.id();
        let image = d.get_str("image_id");
        let size = d.get_i64("system_disk_size");
        let instance = ecs.describe_instance(id).await?;
        let request = params([
            ("InstanceId", json!(id)),
            ("ImageId", json!(image)),
            ("KeyPairName", instance["KeyPairName"].clone()),
            ("SystemDiskSize", json!(size)),
            ("ClientToken", json!(ecs.client_token("ReplaceSystemDisk"))),
        ]);
        ecs.call("ReplaceSystemDisk", request).await?;

        let disk_timeout = ctx.retry_timeout(DISK_VISIBLE_TIMEOUT);
        wait_for(
            "system disk replacement",
            MODIFY_VISIBLE_TIMEOUT,
            Duration::from_secs(5),
            move || async move {
                let instance = ecs.describe_instance(id).await?;
                let resource_group = instance["ResourceGroupId"].as_str().unwrap_or_default();
                let disk = ecs
                    .describe_system_disk_eventually(id, resource_group, disk_timeout)
                    .await?;
                Ok(instance["ImageId"] == image && as_i64(&disk["Size"]) == size)
            },
        )
        .await?;

        // The replacement disk comes up with its own tags.
        let resource_group = instance["ResourceGroupId"].as_str().unwrap_or_default();
        let disk = ecs.describe_system_disk(id, resource_group).await?;
        if let Some(disk_id) = disk["DiskId"].as_str() {
            let old = tags_to_map(&pointer(&disk, "/Tags/Tag"));
            let new = string_map(d.get("volume_tags"));
            ecs.update_tags("disk", &[disk_id.to_string()], &old, &new).await?;
        }
        Ok(())
    }

    async fn modify_vpc(
        &self,
        ctx: &ResourceContext,
        ecs: EcsService<'_>,
        d: &ResourceData,
    ) -> Result<(), ProviderError> {
        let id = d.id();
        let mut vswitch_id = vswitch(d);
        for field in ["vswitch_id", "subnet_id"] {
            if d.has_change(field) {
                vswitch_id = d.get_str(field);
                if vswitch_id.is_empty() {
                    return Err(ProviderError::Validation(format!(
                        "Field '{}' is required when modifying the instance VPC attribute.",
                        field
                    )));
                }
            }
        }
        let private_ip = if d.has_change("private_ip") { d.get_str("private_ip") } else { "" };
        let request = params([
            ("InstanceId", json!(id)),
            ("VSwitchId", json!(vswitch_id)),
            ("PrivateIpAddress", json!(private_ip)),
        ]);
        ecs.call_retrying_on(
            "ModifyInstanceVpcAttribute",
            request,
            ctx.retry_timeout(Duration::from_secs(60)),
            &["OperationConflict"],
        )
        .await?;
        ecs.wait_for_vpc_attributes(id, vswitch_id, private_ip, self.timeouts().update)
            .await
    }

    async fn modify_type(
        &self,
        ctx: &ResourceContext,
        ecs: EcsService<'_>,
        d: &ResourceData,
    ) -> Result<(), ProviderError> {
        let id = d.id();
        let instance_type = d.get_str("instance_type");
        let (action, request) = if d.get_prior("instance_charge_type") == PRE_PAID {
            (
                "ModifyPrepayInstanceSpec",
                params([
                    ("InstanceId", json!(id)),
                    ("InstanceType", json!(instance_type)),
                    ("OperatorType", d.get("operator_type").clone()),
                    ("AutoPay", json!(true)),
                ]),
            )
        } else {
            (
                "ModifyInstanceSpec",
                json!({
                    "InstanceId": id,
                    "InstanceType": instance_type,
                    "ClientToken": ecs.client_token("ModifyInstanceSpec"),
                }),
            )
        };
        ecs.call_retrying_on(
            action,
            request,
            ctx.retry_timeout(Duration::from_secs(6 * 60)),
            &["Throttling"],
        )
        .await?;
        wait_for(
            "instance type change",
            MODIFY_VISIBLE_TIMEOUT,
            Duration::from_secs(5),
            move || async move {
                let instance = ecs.describe_instance(id).await?;
                Ok(instance["InstanceType"] == instance_type)
            },
        )
        .await
    }

    async fn modify_network_spec(
        &self,
        ctx: &ResourceContext,
        ecs: EcsService<'_>,
        d: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        const FIELDS: &[&str] = &[
            "internet_charge_type",
            "internet_max_bandwidth_out",
            "internet_max_bandwidth_in",
        ];
        if d.is_new() || !d.has_changes(FIELDS) {
            return Ok(());
        }
        let id = d.id().to_string();
        let bandwidth_out = d.get_i64("internet_max_bandwidth_out");
        let charge_type = d.get_str("internet_charge_type").to_string();
        let allocate_public_ip = d.has_change("internet_max_bandwidth_out")
            && as_i64(d.get_prior("internet_max_bandwidth_out")) <= 0
            && bandwidth_out > 0;

        let mut request = Map::new();
        request.insert("InstanceId".into(), json!(id));
        request.insert("ClientToken".into(), json!(ecs.client_token("ModifyInstanceNetworkSpec")));
        if d.has_change("internet_charge_type") {
            request.insert("NetworkChargeType".into(), json!(charge_type));
        }
        if d.has_change("internet_max_bandwidth_out") {
            request.insert("InternetMaxBandwidthOut".into(), json!(bandwidth_out));
        }
        if d.has_change("internet_max_bandwidth_in") {
            request.insert(
                "InternetMaxBandwidthIn".into(),
                json!(d.get_i64("internet_max_bandwidth_in")),
            );
        }

        let request = Value::Object(request);
        let wait = IncrementalWait::new(Duration::from_secs(2), Duration::from_secs(2));
        let (request, wait) = (&request, &wait);
        retry(ctx.retry_timeout(self.timeouts().update), move || async move {
            match ecs.call("ModifyInstanceNetworkSpec", request.clone()).await {
                Ok(_) => Ok(()),
                Err(err) if err.is_expected(NETWORK_SPEC_BUSY) => {
                    wait.wait().await;
                    Err(RetryError::retryable(err))
                }
                Err(err) => Err(RetryError::classify(err, &["InternalError"])),
            }
        })
        .await?;

        let (instance_id, charge) = (id.as_str(), charge_type.as_str());
        wait_for(
            "instance internet settings",
            Duration::from_secs(2 * 60),
            Duration::from_secs(1),
            move || async move {
                let instance = ecs.describe_instance(instance_id).await?;
                Ok(as_i64(&instance["InternetMaxBandwidthOut"]) == bandwidth_out
                    && (charge.is_empty() || instance["InternetChargeType"] == charge))
            },
        )
        .await?;

        if allocate_public_ip {
            ecs.call_retrying(
                "AllocatePublicIpAddress",
                json!({ "InstanceId": id }),
                ctx.retry_timeout(self.timeouts().update),
            )
            .await?;
        }
        d.commit(FIELDS);
        Ok(())
    }

    /// Convert the billing method of an instance and wait for it to show.
    async fn modify_charge_type(
        &self,
        ctx: &ResourceContext,
        ecs: EcsService<'_>,
        d: &ResourceData,
        charge_type: &str,
    ) -> Result<(), ProviderError> {
        let id = d.id();
        let mut request = Map::new();
        request.insert("InstanceIds".into(), json!(json_list(&[id])));
        request.insert(
            "IncludeDataDisks".into(),
            json!(d.get("include_data_disks").as_bool().unwrap_or(true)),
        );
        request.insert("AutoPay".into(), json!(true));
        request.insert("DryRun".into(), json!(d.get_bool("dry_run")));
        request.insert(
            "ClientToken".into(),
            json!(ecs.client_token("ModifyInstanceChargeType")),
        );
        request.insert("InstanceChargeType".into(), json!(charge_type));
        if charge_type == PRE_PAID {
            copy_set(&mut request, d, &[("Period", "period")]);
            request.insert(
                "PeriodUnit".into(),
                json!(d.get_str_ok("period_unit").unwrap_or("Month")),
            );
        }

        ecs.call_retrying_on(
            "ModifyInstanceChargeType",
            Value::Object(request),
            ctx.retry_timeout(self.timeouts().update),
            &["InternalError"],
        )
        .await?;
        wait_for(
            "instance charge type",
            Duration::from_secs(5 * 60),
            Duration::from_secs(5),
            move || async move {
                let instance = ecs.describe_instance(id).await?;
                Ok(instance["InstanceChargeType"] == charge_type)
            },
        )
        .await?;
        info!(instance_id = id, charge_type, "changed instance charge type");
        Ok(())
    }

    async fn modify_secondary_ips(
        &self,
        ctx: &ResourceContext,
        ecs: EcsService<'_>,
        d: &mut ResourceData,
    ) -> Result<(), ProviderError> {
        let id = d.id().to_string();
        let timeout = ctx.retry_timeout(self.timeouts().create);

        if d.has_change("secondary_private_ips") {
            let eni = primary_network_interface(ecs, &id).await?;
            let (added, removed) = set_diff(
                &d.get_prior_strings("secondary_private_ips"),
                &d.get_strings("secondary_private_ips"),
            );
            if !removed.is_empty() {
                let request = json!({ "NetworkInterfaceId": eni, "PrivateIpAddress": removed });
                ecs.call_retrying_on("UnassignPrivateIpAddresses", request, timeout, &["OperationConflict"])
                    .await?;
            }
            if !added.is_empty() {
                let request = json!({
                    "NetworkInterfaceId": eni,
                    "ClientToken": ecs.client_token("AssignPrivateIpAddresses"),
                    "PrivateIpAddress": added,
                });
                ecs.call_retrying_on("AssignPrivateIpAddresses", request, timeout, &["OperationConflict"])
                    .await?;
            }
            d.commit(&["secondary_private_ips"]);
        }

        if d.has_change("secondary_private_ip_address_count") {
            let ips = d.get_strings("secondary_private_ips");
            let wanted = d.get_i64("secondary_private_ip_address_count");
            if wanted != ips.len() as i64 {
                let eni = primary_network_interface(ecs, &id).await?;
                let diff = wanted - as_i64(d.get_prior("secondary_private_ip_address_count"));
                if diff > 0 {
                    let request = json!({
                        "NetworkInterfaceId": eni,
                        "ClientToken": ecs.client_token("AssignPrivateIpAddresses"),
                        "SecondaryPrivateIpAddressCount": diff,
                    });
                    ecs.call_retrying_on("AssignPrivateIpAddresses", request, timeout, &["OperationConflict"])
                        .await?;
                } else if diff < 0 {
                    let released: Vec<&String> =
                        ips.iter().take(diff.unsigned_abs() as usize).collect();
                    let request = json!({ "NetworkInterfaceId": eni, "PrivateIpAddress": released });
                    ecs.call_retrying_on("UnassignPrivateIpAddresses", request, timeout, &["OperationConflict"])
                        .await?;
                }
            }
            d.commit(&["secondary_private_ip_address_count"]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{AlicloudClient, ApiError};
    use crate::diff::plan_resource;
    use crate::testing::MockTransport;
    use std::sync::{Arc, Mutex};

    type Cloud = Arc<Mutex<Option<Value>>>;

    fn ctx(mock: &Arc<MockTransport>) -> ResourceContext {
        ResourceContext::new(AlicloudClient::new(mock.clone(), "cn-hangzhou"))
    }

    fn remote_instance() -> Value {
        json!({
            "InstanceId": "i-1",
            "Status": "Running",
            "InstanceName": "web",
            "InstanceType": "ecs.g6.large",
            "ImageId": "img-1",
            "ZoneId": "cn-hangzhou-i",
            "InstanceChargeType": "PostPaid",
            "InternetChargeType": "PayByTraffic",
            "InternetMaxBandwidthOut": 0,
            "ResourceGroupId": "rg-1",
            "KeyPairName": "",
            "SecurityGroupIds": {"SecurityGroupId": ["sg-1"]},
            "VpcAttributes": {
                "VSwitchId": "vsw-1",
                "PrivateIpAddress": {"IpAddress": ["10.0.0.5"]}
            },
            "PublicIpAddress": {"IpAddress": []},
            "Tags": {"Tag": [
                {"TagKey": "env", "TagValue": "prod"},
                {"TagKey": "acs:rm:rgId", "TagValue": "rg-1"}
            ]}
        })
    }

    fn update_field(cloud: &Cloud, key: &str, value: Value) {
        if let Some(instance) = cloud.lock().unwrap().as_mut() {
            instance[key] = value;
        }
    }

    /// A mock that tracks one instance through stop, start and modify calls.
    fn cloud(mock: &Arc<MockTransport>, instance: Value) -> Cloud {
        let cloud: Cloud = Arc::new(Mutex::new(Some(instance)));

        let c = cloud.clone();
        mock.respond_with("DescribeInstances", move |_| {
            let instances: Vec<Value> = c.lock().unwrap().clone().into_iter().collect();
            Ok(json!({"Instances": {"Instance": instances}}))
        });
        let c = cloud.clone();
        mock.respond_with("StopInstance", move |_| {
            update_field(&c, "Status", json!("Stopped"));
            Ok(json!({}))
        });
        let c = cloud.clone();
        mock.respond_with("StartInstance", move |_| {
            update_field(&c, "Status", json!("Running"));
            Ok(json!({}))
        });
        let c = cloud.clone();
        mock.respond_with("ModifyInstanceSpec", move |req| {
            update_field(&c, "InstanceType", json!(req.param("InstanceType")));
            Ok(json!({}))
        });
        let c = cloud.clone();
        mock.respond_with("ModifyInstanceNetworkSpec", move |req| {
            if let Some(out) = req.param("InternetMaxBandwidthOut") {
                update_field(&c, "InternetMaxBandwidthOut", json!(out.parse::<i64>().unwrap()));
            }
            if let Some(charge) = req.param("NetworkChargeType") {
                update_field(&c, "InternetChargeType", json!(charge));
            }
            Ok(json!({}))
        });
        let c = cloud.clone();
        mock.respond_with("ModifyInstanceChargeType", move |req| {
            update_field(&c, "InstanceChargeType", json!(req.param("InstanceChargeType")));
            Ok(json!({}))
        });
        let c = cloud.clone();
        mock.respond_with("ReplaceSystemDisk", move |req| {
            update_field(&c, "ImageId", json!(req.param("ImageId")));
            Ok(json!({"DiskId": "d-2"}))
        });
        let c = cloud.clone();
        mock.respond_with("ModifyInstanceVpcAttribute", move |req| {
            let ip = req.param("PrivateIpAddress").unwrap_or("10.0.0.5");
            update_field(
                &c,
                "VpcAttributes",
                json!({
                    "VSwitchId": req.param("VSwitchId"),
                    "PrivateIpAddress": {"IpAddress": [ip]}
                }),
            );
            Ok(json!({}))
        });
        let c = cloud.clone();
        mock.respond_with("DeleteInstance", move |_| {
            *c.lock().unwrap() = None;
            Ok(json!({}))
        });
        mock.respond(
            "DescribeDisks",
            json!({"Disks": {"Disk": [{
                "DiskId": "d-1",
                "Category": "cloud_efficiency",
                "Size": 40,
                "Tags": {"Tag": []}
            }]}}),
        );
        mock.respond("RunInstances", json!({"InstanceIdSets": {"InstanceIdSet": ["i-1"]}}));
        cloud
    }

    fn config() -> Value {
        json!({
            "availability_zone": "cn-hangzhou-i",
            "image_id": "img-1",
            "instance_type": "ecs.g6.large",
            "security_groups": ["sg-1"],
            "instance_name": "web",
            "vswitch_id": "vsw-1",
        })
    }

    /// Planned state for `config` as if it had been created as `i-1`.
    fn existing(config: Value) -> Value {
        let mut state = plan_resource(&Instance, None, &config).unwrap().planned_state;
        state["id"] = json!("i-1");
        state
    }

    fn with(mut value: Value, key: &str, field: Value) -> Value {
        value[key] = field;
        value
    }

    fn only(mock: &MockTransport, wanted: &[&str]) -> Vec<String> {
        mock.actions()
            .into_iter()
            .filter(|a| wanted.contains(&a.as_str()))
            .collect()
    }

    #[test]
    fn test_family() {
        assert_eq!(family("ecs.g6.large"), "g6");
        assert_eq!(family("ecs.c7.2xlarge"), "c7");
        assert_eq!(family("g6.large"), "g6");
    }

    #[test]
    fn test_encode_user_data() {
        let script = "#!/bin/sh\necho hi";
        assert_eq!(encode_user_data(script), STANDARD.encode(script));
        assert_eq!(encode_user_data("ZWNobyBoaQ=="), "ZWNobyBoaQ==");
    }

    #[test]
    fn test_plan_system_disk_shrink_replaces() {
        let prior = existing(with(config(), "system_disk_size", json!(80)));

        let shrink = with(prior.clone(), "system_disk_size", json!(60));
        let plan = plan_resource(&Instance, Some(&prior), &shrink).unwrap();
        assert!(plan.requires_replace);

        let grow = with(prior.clone(), "system_disk_size", json!(100));
        let plan = plan_resource(&Instance, Some(&prior), &grow).unwrap();
        assert!(!plan.requires_replace);
        assert!(plan.changes.iter().any(|c| c.path == "system_disk_size"));
    }

    #[test]
    fn test_plan_instance_family_change_replaces() {
        let prior = existing(config());

        let resize = with(prior.clone(), "instance_type", json!("ecs.g6.xlarge"));
        assert!(!plan_resource(&Instance, Some(&prior), &resize).unwrap().requires_replace);

        let other_family = with(prior.clone(), "instance_type", json!("ecs.c6.large"));
        assert!(plan_resource(&Instance, Some(&prior), &other_family).unwrap().requires_replace);
    }

    #[test]
    fn test_plan_suppresses_fields_that_do_not_apply() {
        let prior = existing(config());

        let prepaid_only = with(prior.clone(), "period", json!(3));
        let plan = plan_resource(&Instance, Some(&prior), &prepaid_only).unwrap();
        assert!(plan.changes.is_empty());
        assert_eq!(plan.planned_state["period"], 1);

        let no_bandwidth = with(prior.clone(), "internet_charge_type", json!("PayByBandwidth"));
        assert!(plan_resource(&Instance, Some(&prior), &no_bandwidth).unwrap().changes.is_empty());

        let prepaid = with(prior.clone(), "instance_charge_type", json!("PrePaid"));
        let prepaid = with(prepaid, "period", json!(3));
        let plan = plan_resource(&Instance, Some(&prior), &prepaid).unwrap();
        assert!(plan.changes.iter().any(|c| c.path == "period"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_classic_network_instance() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());

        let mut config = config();
        config.as_object_mut().unwrap().remove("vswitch_id");
        config["security_groups"] = json!(["sg-1", "sg-2"]);
        config["user_data"] = json!("#!/bin/sh\necho hi");
        config["data_disks"] = json!([
            {"size": 20, "category": "cloud_essd", "performance_level": "PL1"},
            {"size": 30, "performance_level": "PL2"}
        ]);
        let planned = plan_resource(&Instance, None, &config).unwrap().planned_state;
        let state = Instance.create(&ctx(&mock), planned).await.unwrap();
        assert_eq!(state["id"], "i-1");

        let request = mock.last_request("RunInstances").unwrap();
        assert_eq!(request.param("SecurityGroupId"), Some("sg-1"));
        assert_eq!(request.param("SecurityGroupIds.1"), None);
        assert_eq!(request.param("UserData"), Some(STANDARD.encode("#!/bin/sh\necho hi").as_str()));
        assert_eq!(request.param("InstanceChargeType"), Some("PostPaid"));
        assert_eq!(request.param("DataDisk.1.PerformanceLevel"), Some("PL1"));
        assert_eq!(request.param("DataDisk.1.DeleteWithInstance"), Some("true"));
        assert_eq!(request.param("DataDisk.2.Category"), Some("cloud_efficiency"));
        assert_eq!(request.param("DataDisk.2.PerformanceLevel"), None);
        assert!(request.param("ClientToken").is_some());

        // Only the first group went with RunInstances.
        assert_eq!(mock.count("JoinSecurityGroup"), 2);
        assert_eq!(mock.count("StopInstance"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_vpc_instance_sends_all_groups() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());

        let config = with(config(), "security_groups", json!(["sg-1", "sg-2"]));
        let planned = plan_resource(&Instance, None, &config).unwrap().planned_state;
        let state = Instance.create(&ctx(&mock), planned).await.unwrap();

        let request = mock.last_request("RunInstances").unwrap();
        assert_eq!(request.param("VSwitchId"), Some("vsw-1"));
        assert_eq!(request.param("SecurityGroupIds.1"), Some("sg-1"));
        assert_eq!(request.param("SecurityGroupIds.2"), Some("sg-2"));
        assert_eq!(mock.count("JoinSecurityGroup"), 0);
        assert_eq!(state["private_ip"], "10.0.0.5");
        assert_eq!(state["role_name"], "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_retries_vswitch_not_ready() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());
        mock.fail_once(
            "RunInstances",
            ApiError::new("IncorrectVSwitchStatus", "vswitch is pending", 400),
        );

        let planned = plan_resource(&Instance, None, &config()).unwrap().planned_state;
        Instance.create(&ctx(&mock), planned).await.unwrap();
        assert_eq!(mock.count("RunInstances"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_out_of_stock_lists_zones() {
        let mock = Arc::new(MockTransport::new());
        mock.fail(
            "RunInstances",
            ApiError::new("OperationDenied.NoStock", "sold out", 403),
        );
        mock.respond(
            "DescribeAvailableResource",
            json!({"AvailableZones": {"AvailableZone": [
                {"ZoneId": "cn-hangzhou-j", "Status": "Available"},
                {"ZoneId": "cn-hangzhou-k", "Status": "SoldOut"}
            ]}}),
        );

        let planned = plan_resource(&Instance, None, &config()).unwrap().planned_state;
        let err = Instance.create(&ctx(&mock), planned).await.unwrap_err();
        assert!(matches!(err, ProviderError::ResourceExhausted(_)));
        assert!(err.to_string().contains("cn-hangzhou-j"));
        assert!(!err.to_string().contains("cn-hangzhou-k"));
        assert_eq!(mock.count("RunInstances"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_stopped_instance_stops_after_launch() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());

        let config = with(config(), "status", json!("Stopped"));
        let planned = plan_resource(&Instance, None, &config).unwrap().planned_state;
        let state = Instance.create(&ctx(&mock), planned).await.unwrap();

        assert_eq!(mock.count("StopInstance"), 1);
        assert_eq!(mock.count("StartInstance"), 0);
        assert_eq!(state["status"], "Stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_type_stops_modifies_and_restarts() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());

        let prior = existing(config());
        let planned = with(prior.clone(), "instance_type", json!("ecs.g6.xlarge"));
        let state = Instance.update(&ctx(&mock), prior, planned).await.unwrap();

        assert_eq!(
            only(&mock, &["StopInstance", "ModifyInstanceSpec", "StartInstance"]),
            vec!["StopInstance", "ModifyInstanceSpec", "StartInstance"]
        );
        assert_eq!(state["instance_type"], "ecs.g6.xlarge");
        assert_eq!(state["status"], "Running");
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_restarts_even_when_modification_fails() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());
        mock.fail(
            "ModifyInstanceSpec",
            ApiError::new("InvalidInstanceType.ValueNotSupported", "unsupported", 400),
        );

        let prior = existing(config());
        let planned = with(prior.clone(), "instance_type", json!("ecs.g6.xlarge"));
        let err = Instance.update(&ctx(&mock), prior, planned).await.unwrap_err();

        assert_eq!(err.api_code(), Some("InvalidInstanceType.ValueNotSupported"));
        assert_eq!(mock.count("StartInstance"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_starts_stopped_instance() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, with(remote_instance(), "Status", json!("Stopped")));

        let prior = existing(with(config(), "status", json!("Stopped")));
        let planned = with(prior.clone(), "status", json!("Running"));
        let state = Instance.update(&ctx(&mock), prior, planned).await.unwrap();

        assert_eq!(mock.count("StopInstance"), 0);
        assert_eq!(mock.count("StartInstance"), 1);
        assert_eq!(state["status"], "Running");
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_name_does_not_stop() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());

        let prior = existing(config());
        let planned = with(prior.clone(), "instance_name", json!("api"));
        Instance.update(&ctx(&mock), prior, planned).await.unwrap();

        let request = mock.last_request("ModifyInstanceAttribute").unwrap();
        assert_eq!(request.param("InstanceName"), Some("api"));
        assert_eq!(request.param("UserData"), None);
        assert_eq!(mock.count("StopInstance"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_bandwidth_allocates_public_ip() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());

        let prior = existing(config());
        let planned = with(prior.clone(), "internet_max_bandwidth_out", json!(10));
        Instance.update(&ctx(&mock), prior, planned).await.unwrap();

        let request = mock.last_request("ModifyInstanceNetworkSpec").unwrap();
        assert_eq!(request.param("InternetMaxBandwidthOut"), Some("10"));
        assert_eq!(request.param("NetworkChargeType"), None);
        assert_eq!(mock.count("AllocatePublicIpAddress"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_tags() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());

        let prior = existing(with(config(), "tags", json!({"env": "prod", "team": "a"})));
        let planned = with(prior.clone(), "tags", json!({"env": "staging"}));
        Instance.update(&ctx(&mock), prior, planned).await.unwrap();

        let untag = mock.last_request("UntagResources").unwrap();
        assert_eq!(untag.param("TagKey.1"), Some("team"));
        let tag = mock.last_request("TagResources").unwrap();
        assert_eq!(tag.param("Tag.1.Key"), Some("env"));
        assert_eq!(tag.param("Tag.1.Value"), Some("staging"));
        assert_eq!(tag.param("ResourceType"), Some("instance"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_maps_instance() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());
        mock.respond("DescribeUserData", json!({"UserData": STANDARD.encode("echo hi")}));

        let state = with(json!({"id": "i-1"}), "user_data", json!("echo hi"));
        let state = Instance.read(&ctx(&mock), state).await.unwrap().unwrap();

        assert_eq!(state["instance_name"], "web");
        assert_eq!(state["security_groups"], json!(["sg-1"]));
        assert_eq!(state["vswitch_id"], "vsw-1");
        assert_eq!(state["subnet_id"], "vsw-1");
        assert_eq!(state["private_ip"], "10.0.0.5");
        assert_eq!(state["system_disk_size"], 40);
        assert_eq!(state["tags"], json!({"env": "prod"}));
        assert_eq!(state["user_data"], "echo hi");
        assert_eq!(state["public_ip"], "");
    }

    #[tokio::test]
    async fn test_read_gone() {
        let mock = Arc::new(MockTransport::new());
        mock.respond("DescribeInstances", json!({"Instances": {"Instance": []}}));
        let state = Instance.read(&ctx(&mock), json!({"id": "i-1"})).await.unwrap();
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn test_delete_prepaid_requires_force() {
        let mock = Arc::new(MockTransport::new());
        let state = json!({"id": "i-1", "instance_charge_type": "PrePaid"});
        let err = Instance.delete(&ctx(&mock), state).await.unwrap_err();
        assert!(matches!(err, ProviderError::FailedPrecondition(_)));
        assert_eq!(mock.count("DeleteInstance"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_prepaid_converts_first() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, with(remote_instance(), "InstanceChargeType", json!("PrePaid")));

        let state = json!({"id": "i-1", "instance_charge_type": "PrePaid", "force_delete": true});
        Instance.delete(&ctx(&mock), state).await.unwrap();

        assert_eq!(
            only(&mock, &["ModifyInstanceChargeType", "DeleteInstance"]),
            vec!["ModifyInstanceChargeType", "DeleteInstance"]
        );
        let convert = mock.last_request("ModifyInstanceChargeType").unwrap();
        assert_eq!(convert.param("InstanceChargeType"), Some("PostPaid"));
        assert_eq!(mock.last_request("DeleteInstance").unwrap().param("Force"), Some("true"));
    }

    #[tokio::test]
    async fn test_delete_missing_instance() {
        let mock = Arc::new(MockTransport::new());
        mock.fail(
            "DeleteInstance",
            ApiError::new("InvalidInstanceId.NotFound", "no such instance", 404),
        );
        Instance
            .delete(&ctx(&mock), json!({"id": "i-1"}))
            .await
            .unwrap();
        assert_eq!(mock.count("DescribeInstances"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_failure_after_launch_keeps_id() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, with(remote_instance(), "Status", json!("Stopping")));

        let planned = plan_resource(&Instance, None, &config()).unwrap().planned_state;
        let err = Instance.create(&ctx(&mock), planned).await.unwrap_err();

        let state = err.partial_state().unwrap();
        assert_eq!(state["id"], "i-1");
        assert_eq!(state["instance_type"], "ecs.g6.large");
        assert!(err.to_string().contains("Stopping"));
        assert_eq!(mock.count("RunInstances"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_security_groups_join_and_leave() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());

        let prior = existing(with(config(), "security_groups", json!(["sg-1", "sg-2"])));
        let planned = with(prior.clone(), "security_groups", json!(["sg-1", "sg-3"]));
        Instance.update(&ctx(&mock), prior, planned).await.unwrap();

        let joined = mock.requests_for("JoinSecurityGroup");
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].param("SecurityGroupId"), Some("sg-3"));
        let left = mock.requests_for("LeaveSecurityGroup");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].param("SecurityGroupId"), Some("sg-2"));
        assert_eq!(left[0].param("InstanceId"), Some("i-1"));
        assert_eq!(mock.count("StopInstance"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_system_disk_size_online_or_offline() {
        for (status, mode) in [(RUNNING, "online"), (STOPPED, "offline")] {
            let mock = Arc::new(MockTransport::new());
            cloud(&mock, with(remote_instance(), "Status", json!(status)));

            let prior = existing(with(config(), "status", json!(status)));
            let planned = with(prior.clone(), "system_disk_size", json!(80));
            Instance.update(&ctx(&mock), prior, planned).await.unwrap();

            let resize = mock.last_request("ResizeDisk").unwrap();
            assert_eq!(resize.param("DiskId"), Some("d-1"));
            assert_eq!(resize.param("NewSize"), Some("80"));
            assert_eq!(resize.param("Type"), Some(mode));
            assert_eq!(mock.count("StopInstance"), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_image_replaces_system_disk_while_stopped() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, with(remote_instance(), "KeyPairName", json!("ops")));

        let prior = existing(config());
        let planned = with(prior.clone(), "image_id", json!("img-2"));
        let state = Instance.update(&ctx(&mock), prior, planned).await.unwrap();

        assert_eq!(
            only(&mock, &["StopInstance", "ReplaceSystemDisk", "StartInstance"]),
            vec!["StopInstance", "ReplaceSystemDisk", "StartInstance"]
        );
        let replace = mock.last_request("ReplaceSystemDisk").unwrap();
        assert_eq!(replace.param("ImageId"), Some("img-2"));
        assert_eq!(replace.param("SystemDiskSize"), Some("40"));
        assert_eq!(replace.param("KeyPairName"), Some("ops"));
        assert!(replace.param("ClientToken").is_some());
        assert_eq!(state["image_id"], "img-2");
        assert_eq!(state["status"], RUNNING);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_vswitch_and_private_ip() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());

        let prior = existing(config());
        let planned = with(prior.clone(), "vswitch_id", json!("vsw-2"));
        let planned = with(planned, "private_ip", json!("10.0.1.9"));
        let state = Instance.update(&ctx(&mock), prior, planned).await.unwrap();

        assert_eq!(
            only(&mock, &["StopInstance", "ModifyInstanceVpcAttribute", "StartInstance"]),
            vec!["StopInstance", "ModifyInstanceVpcAttribute", "StartInstance"]
        );
        let request = mock.last_request("ModifyInstanceVpcAttribute").unwrap();
        assert_eq!(request.param("VSwitchId"), Some("vsw-2"));
        assert_eq!(request.param("PrivateIpAddress"), Some("10.0.1.9"));
        assert_eq!(state["vswitch_id"], "vsw-2");
        assert_eq!(state["private_ip"], "10.0.1.9");
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_private_ip_alone_keeps_vswitch() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());

        let prior = existing(with(config(), "private_ip", json!("10.0.0.5")));
        let planned = with(prior.clone(), "private_ip", json!("10.0.0.9"));
        Instance.update(&ctx(&mock), prior, planned).await.unwrap();

        let request = mock.last_request("ModifyInstanceVpcAttribute").unwrap();
        assert_eq!(request.param("VSwitchId"), Some("vsw-1"));
        assert_eq!(request.param("PrivateIpAddress"), Some("10.0.0.9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_clearing_vswitch_is_rejected_and_restarts() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());

        let prior = existing(config());
        let planned = with(prior.clone(), "vswitch_id", json!(""));
        let err = Instance.update(&ctx(&mock), prior, planned).await.unwrap_err();

        assert!(matches!(err, ProviderError::Validation(_)));
        assert_eq!(mock.count("ModifyInstanceVpcAttribute"), 0);
        assert_eq!(mock.count("StartInstance"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_to_prepaid_waits_then_sets_renewal() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());
        // The first look after conversion still shows the old billing method.
        mock.respond_once("DescribeInstances", json!({"Instances": {"Instance": [remote_instance()]}}));
        mock.respond(
            "DescribeInstanceAutoRenewAttribute",
            json!({"InstanceRenewAttributes": {"InstanceRenewAttribute": [
                {"RenewalStatus": "AutoRenewal", "Duration": 6}
            ]}}),
        );

        let prior = existing(config());
        let planned = with(prior.clone(), "instance_charge_type", json!(PRE_PAID));
        let planned = with(planned, "period", json!(3));
        let planned = with(planned, "renewal_status", json!("AutoRenewal"));
        let planned = with(planned, "auto_renew_period", json!(6));
        let state = Instance.update(&ctx(&mock), prior, planned).await.unwrap();

        assert_eq!(
            only(
                &mock,
                &["ModifyInstanceChargeType", "DescribeInstances", "ModifyInstanceAutoRenewAttribute"]
            ),
            vec![
                "ModifyInstanceChargeType",
                "DescribeInstances",
                "DescribeInstances",
                "ModifyInstanceAutoRenewAttribute",
                "DescribeInstances",
            ]
        );
        let convert = mock.last_request("ModifyInstanceChargeType").unwrap();
        assert_eq!(convert.param("InstanceChargeType"), Some(PRE_PAID));
        assert_eq!(convert.param("InstanceIds"), Some(r#"["i-1"]"#));
        assert_eq!(convert.param("Period"), Some("3"));
        assert_eq!(convert.param("PeriodUnit"), Some("Month"));
        assert_eq!(convert.param("AutoPay"), Some("true"));

        let renew = mock.last_request("ModifyInstanceAutoRenewAttribute").unwrap();
        assert_eq!(renew.param("RenewalStatus"), Some("AutoRenewal"));
        assert_eq!(renew.param("Duration"), Some("6"));
        assert_eq!(renew.param("PeriodUnit"), Some("Month"));

        assert_eq!(state["instance_charge_type"], PRE_PAID);
        assert_eq!(state["renewal_status"], "AutoRenewal");
        assert_eq!(state["auto_renew_period"], 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_charge_type_times_out_when_not_visible() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());
        mock.respond("ModifyInstanceChargeType", json!({}));

        let prior = existing(config());
        let planned = with(prior.clone(), "instance_charge_type", json!(PRE_PAID));
        let err = Instance.update(&ctx(&mock), prior, planned).await.unwrap_err();

        assert!(matches!(err, ProviderError::DeadlineExceeded(_)));
        assert!(err.to_string().contains("charge type"));
        assert_eq!(mock.count("ModifyInstanceAutoRenewAttribute"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_renewal_without_duration() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, with(remote_instance(), "InstanceChargeType", json!(PRE_PAID)));

        let config = with(config(), "instance_charge_type", json!(PRE_PAID));
        let prior = existing(with(config, "renewal_status", json!("AutoRenewal")));
        let planned = with(prior.clone(), "renewal_status", json!("NotRenewal"));
        Instance.update(&ctx(&mock), prior, planned).await.unwrap();

        let renew = mock.last_request("ModifyInstanceAutoRenewAttribute").unwrap();
        assert_eq!(renew.param("RenewalStatus"), Some("NotRenewal"));
        assert_eq!(renew.param("Duration"), None);
        assert_eq!(mock.count("ModifyInstanceChargeType"), 0);
    }

    /// `cloud` plus a primary interface `eni-1` carrying `secondary` addresses.
    fn cloud_with_interface(mock: &Arc<MockTransport>, secondary: &[&str]) -> Cloud {
        let instance = with(
            remote_instance(),
            "NetworkInterfaces",
            json!({"NetworkInterface": [
                {"NetworkInterfaceId": "eni-1", "Type": "Primary"}
            ]}),
        );
        let cloud = cloud(mock, instance);
        let mut ips = vec![json!({"PrivateIpAddress": "10.0.0.5", "Primary": true})];
        ips.extend(
            secondary
                .iter()
                .map(|ip| json!({"PrivateIpAddress": ip, "Primary": false})),
        );
        mock.respond(
            "DescribeNetworkInterfaces",
            json!({"NetworkInterfaceSets": {"NetworkInterfaceSet": [{
                "NetworkInterfaceId": "eni-1",
                "PrivateIpSets": {"PrivateIpSet": ips}
            }]}}),
        );
        cloud
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_secondary_private_ips_list() {
        let mock = Arc::new(MockTransport::new());
        cloud_with_interface(&mock, &["10.0.0.7", "10.0.0.8"]);

        let prior = existing(with(config(), "secondary_private_ips", json!(["10.0.0.6", "10.0.0.7"])));
        let planned = with(prior.clone(), "secondary_private_ips", json!(["10.0.0.7", "10.0.0.8"]));
        let state = Instance.update(&ctx(&mock), prior, planned).await.unwrap();

        assert_eq!(
            only(&mock, &["UnassignPrivateIpAddresses", "AssignPrivateIpAddresses"]),
            vec!["UnassignPrivateIpAddresses", "AssignPrivateIpAddresses"]
        );
        let unassign = mock.last_request("UnassignPrivateIpAddresses").unwrap();
        assert_eq!(unassign.param("NetworkInterfaceId"), Some("eni-1"));
        assert_eq!(unassign.param("PrivateIpAddress.1"), Some("10.0.0.6"));
        assert_eq!(unassign.param("PrivateIpAddress.2"), None);
        let assign = mock.last_request("AssignPrivateIpAddresses").unwrap();
        assert_eq!(assign.param("PrivateIpAddress.1"), Some("10.0.0.8"));
        assert!(assign.param("ClientToken").is_some());

        assert_eq!(state["network_interface_id"], "eni-1");
        assert_eq!(state["secondary_private_ips"], json!(["10.0.0.7", "10.0.0.8"]));
        assert_eq!(state["secondary_private_ip_address_count"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_secondary_private_ip_count_releases_first_addresses() {
        let mock = Arc::new(MockTransport::new());
        cloud_with_interface(&mock, &["10.0.0.8"]);

        let config = with(config(), "secondary_private_ip_address_count", json!(3));
        let prior = existing(with(
            config,
            "secondary_private_ips",
            json!(["10.0.0.6", "10.0.0.7", "10.0.0.8"]),
        ));
        let planned = with(prior.clone(), "secondary_private_ip_address_count", json!(1));
        let state = Instance.update(&ctx(&mock), prior, planned).await.unwrap();

        let unassign = mock.last_request("UnassignPrivateIpAddresses").unwrap();
        assert_eq!(unassign.param("PrivateIpAddress.1"), Some("10.0.0.6"));
        assert_eq!(unassign.param("PrivateIpAddress.2"), Some("10.0.0.7"));
        assert_eq!(unassign.param("PrivateIpAddress.3"), None);
        assert_eq!(mock.count("AssignPrivateIpAddresses"), 0);
        assert_eq!(state["secondary_private_ip_address_count"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_secondary_private_ip_count_grows() {
        let mock = Arc::new(MockTransport::new());
        cloud_with_interface(&mock, &["10.0.0.6", "10.0.0.7", "10.0.0.8"]);

        let config = with(config(), "secondary_private_ip_address_count", json!(1));
        let prior = existing(with(config, "secondary_private_ips", json!(["10.0.0.6"])));
        let planned = with(prior.clone(), "secondary_private_ip_address_count", json!(3));
        Instance.update(&ctx(&mock), prior, planned).await.unwrap();

        let assign = mock.last_request("AssignPrivateIpAddresses").unwrap();
        assert_eq!(assign.param("NetworkInterfaceId"), Some("eni-1"));
        assert_eq!(assign.param("SecondaryPrivateIpAddressCount"), Some("2"));
        assert_eq!(assign.param("PrivateIpAddress.1"), None);
        assert_eq!(mock.count("UnassignPrivateIpAddresses"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_deployment_set() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());
        let prior = existing(with(config(), "deployment_set_id", json!("ds-1")));

        let planned = with(prior.clone(), "deployment_set_id", json!("ds-2"));
        Instance.update(&ctx(&mock), prior.clone(), planned).await.unwrap();
        let moved = mock.last_request("ModifyInstanceDeployment").unwrap();
        assert_eq!(moved.param("DeploymentSetId"), Some("ds-2"));
        assert_eq!(moved.param("RemoveFromDeploymentSet"), None);

        let planned = with(prior.clone(), "deployment_set_id", json!(""));
        Instance.update(&ctx(&mock), prior, planned).await.unwrap();
        let removed = mock.last_request("ModifyInstanceDeployment").unwrap();
        assert_eq!(removed.param("InstanceId"), Some("i-1"));
        assert_eq!(removed.param("DeploymentSetId"), Some("ds-1"));
        assert_eq!(removed.param("RemoveFromDeploymentSet"), Some("true"));
        assert_eq!(mock.count("ModifyInstanceDeployment"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_maintenance_and_metadata_options() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, remote_instance());
        mock.respond(
            "DescribeInstanceMaintenanceAttributes",
            json!({"MaintenanceAttributes": {"MaintenanceAttribute": [{
                "MaintenanceWindows": {"MaintenanceWindow": [
                    {"StartTime": "02:00:00Z", "EndTime": "04:00:00Z"}
                ]},
                "ActionOnMaintenance": {"Value": "AutoRecover"},
                "NotifyOnMaintenance": true
            }]}}),
        );

        let prior = existing(config());
        let planned = with(
            prior.clone(),
            "maintenance_time",
            json!([{"start_time": "02:00:00Z", "end_time": "04:00:00Z"}]),
        );
        let planned = with(planned, "maintenance_action", json!("AutoRecover"));
        let planned = with(planned, "maintenance_notify", json!(true));
        let planned = with(planned, "http_tokens", json!("required"));
        let state = Instance.update(&ctx(&mock), prior, planned).await.unwrap();

        let maintenance = mock.last_request("ModifyInstanceMaintenanceAttributes").unwrap();
        assert_eq!(maintenance.param("InstanceId.1"), Some("i-1"));
        assert_eq!(maintenance.param("MaintenanceWindow.1.StartTime"), Some("02:00:00Z"));
        assert_eq!(maintenance.param("MaintenanceWindow.1.EndTime"), Some("04:00:00Z"));
        assert_eq!(maintenance.param("ActionOnMaintenance"), Some("AutoRecover"));
        assert_eq!(maintenance.param("NotifyOnMaintenance"), Some("true"));

        let metadata = mock.last_request("ModifyInstanceMetadataOptions").unwrap();
        assert_eq!(metadata.param("HttpEndpoint"), Some("enabled"));
        assert_eq!(metadata.param("HttpTokens"), Some("required"));

        assert_eq!(state["maintenance_action"], "AutoRecover");
        assert_eq!(state["maintenance_time"][0]["start_time"], "02:00:00Z");
        assert_eq!(mock.count("StopInstance"), 0);
    }

    #[tokio::test]
    async fn test_import_reads_instance_by_id() {
        let mock = Arc::new(MockTransport::new());
        cloud(&mock, with(remote_instance(), "InstanceChargeType", json!(PRE_PAID)));
        mock.respond(
            "DescribeInstanceRamRole",
            json!({"InstanceRamRoleSets": {"InstanceRamRoleSet": [{"RamRoleName": "ecs-role"}]}}),
        );
        mock.respond(
            "DescribeInstanceAutoRenewAttribute",
            json!({"InstanceRenewAttributes": {"InstanceRenewAttribute": [
                {"RenewalStatus": "AutoRenewal", "Duration": 3}
            ]}}),
        );

        let state = Instance.import(&ctx(&mock), "i-1").await.unwrap();
        assert_eq!(state["id"], "i-1");
        assert_eq!(state["instance_type"], "ecs.g6.large");
        assert_eq!(state["instance_charge_type"], PRE_PAID);
        assert_eq!(state["role_name"], "ecs-role");
        assert_eq!(state["renewal_status"], "AutoRenewal");
        assert_eq!(state["auto_renew_period"], 3);
        assert_eq!(state["security_groups"], json!(["sg-1"]));
        // No configured user data to compare against.
        assert_eq!(mock.count("DescribeUserData"), 0);

        let mock = Arc::new(MockTransport::new());
        mock.respond("DescribeInstances", json!({"Instances": {"Instance": []}}));
        let err = Instance.import(&ctx(&mock), "i-404").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
