//! `alicloud_rds_clone_db_instance`: a DB instance cloned from a backup or
//! point in time of an existing instance.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{Resource, ResourceContext, ResourceData, Timeouts};
use crate::error::ProviderError;
use crate::retry::{retry, RetryError};
use crate::schema::{
    Attribute, AttributeFlags, AttributeType, Block, Constraint, NestedBlock, Schema,
};
use crate::services::rds::RDS_NOT_FOUND;
use crate::services::{params, RdsService};
use crate::wait::StateWaiter;

/// Codes returned while the instance is busy with a previous operation.
const INSTANCE_BUSY: &[&str] = &["OperationDenied.DBInstanceStatus", "InternalError"];

/// The clone DB instance resource.
#[derive(Debug, Default, Clone, Copy)]
pub struct RdsCloneDbInstance;

/// RDS calls the payment type `PayType` with different values.
fn pay_type(payment_type: &str) -> &str {
    match payment_type {
        "Subscription" => "Prepaid",
        "PayAsYouGo" => "Postpaid",
        other => other,
    }
}

fn payment_type(pay_type: &str) -> &str {
    match pay_type {
        "Prepaid" => "Subscription",
        "Postpaid" => "PayAsYouGo",
        other => other,
    }
}

/// `ServerlessConfig` JSON parameter, if the block is set.
fn serverless_config(d: &ResourceData) -> Option<String> {
    let config = d.get("serverless_config").as_array()?.first()?.clone();
    Some(
        json!({
            "MaxCapacity": config["max_capacity"],
            "MinCapacity": config["min_capacity"],
            "AutoPause": config["auto_pause"].as_bool().unwrap_or(false),
            "SwitchForce": config["switch_force"].as_bool().unwrap_or(false),
        })
        .to_string(),
    )
}

/// `HbaItem` JSON parameter from the `pg_hba_conf` blocks.
fn hba_items(d: &ResourceData) -> String {
    let entries: Vec<Value> = d
        .get("pg_hba_conf")
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .map(|e| {
                    json!({
                        "Type": e["type"],
                        "Mask": e["mask"].as_str().unwrap_or_default(),
                        "Database": e["database"],
                        "PriorityId": e["priority_id"],
                        "Address": e["address"],
                        "User": e["user"],
                        "Method": e["method"],
                        "Option": e["option"].as_str().unwrap_or_default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Value::Array(entries).to_string()
}

fn hba_block() -> Block {
    Block::new()
        .with_attribute(
            "type",
            Attribute::required_string()
                .with_constraint(Constraint::string_in(&["host", "hostssl", "hostnossl"])),
        )
        .with_attribute("mask", Attribute::optional_string())
        .with_attribute("database", Attribute::required_string())
        .with_attribute("priority_id", Attribute::required_int64())
        .with_attribute("address", Attribute::required_string())
        .with_attribute("user", Attribute::required_string())
        .with_attribute("method", Attribute::required_string())
        .with_attribute("option", Attribute::optional_string())
}

fn serverless_block() -> Block {
    Block::new()
        .with_attribute(
            "max_capacity",
            Attribute::new(AttributeType::Float64, AttributeFlags::required()),
        )
        .with_attribute(
            "min_capacity",
            Attribute::new(AttributeType::Float64, AttributeFlags::required()),
        )
        .with_attribute("auto_pause", Attribute::optional_bool())
        .with_attribute("switch_force", Attribute::optional_bool())
}

impl RdsCloneDbInstance {
    /// Apply mutable attributes. Runs after create with `d.is_new()` set.
    async fn apply(&self, ctx: &ResourceContext, d: &mut ResourceData) -> Result<(), ProviderError> {
        let rds = RdsService::new(&ctx.client);
        let id = d.id().to_string();
        let timeout = if d.is_new() {
            self.timeouts().create
        } else {
            self.timeouts().update
        };

        if !d.is_new() && d.has_change("db_instance_description") {
            rds.call(
                "ModifyDBInstanceDescription",
                json!({
                    "DBInstanceId": id,
                    "DBInstanceDescription": d.get_str("db_instance_description"),
                }),
            )
            .await?;
            d.commit(&["db_instance_description"]);
        }

        if d.has_change("deletion_protection") {
            rds.call(
                "ModifyDBInstanceDeletionProtection",
                json!({
                    "DBInstanceId": id,
                    "DeletionProtection": d.get_bool("deletion_protection"),
                }),
            )
            .await?;
            d.commit(&["deletion_protection"]);
        }

        if d.has_change("security_ips") {
            let ips = d.get_strings("security_ips");
            if !ips.is_empty() {
                rds.call(
                    "ModifySecurityIps",
                    json!({ "DBInstanceId": id, "SecurityIps": ips.join(",") }),
                )
                .await?;
                rds.wait_running(&id, timeout).await?;
            }
            d.commit(&["security_ips"]);
        }

        if !d.is_new() && d.has_changes(&["connection_string_prefix", "port"]) {
            let current = d.get_prior("connection_string").as_str().unwrap_or_default();
            let prefix = d
                .get_str_ok("connection_string_prefix")
                .map(str::to_string)
                .unwrap_or_else(|| current.split('.').next().unwrap_or_default().to_string());
            rds.call(
                "ModifyDBInstanceConnectionString",
                params([
                    ("DBInstanceId", json!(id)),
                    ("CurrentConnectionString", json!(current)),
                    ("ConnectionStringPrefix", json!(prefix)),
                    ("Port", d.get("port").clone()),
                ]),
            )
            .await?;
            rds.wait_running(&id, timeout).await?;
            d.commit(&["connection_string_prefix", "port"]);
        }

        if !d.is_new()
            && d.has_changes(&[
                "db_instance_class",
                "db_instance_storage",
                "db_instance_storage_type",
                "serverless_config",
            ])
        {
            let request = params([
                ("DBInstanceId", json!(id)),
                ("PayType", json!(pay_type(d.get_str("payment_type")))),
                ("DBInstanceClass", json!(d.get_str("db_instance_class"))),
                ("DBInstanceStorage", d.get("db_instance_storage").clone()),
                ("DBInstanceStorageType", json!(d.get_str("db_instance_storage_type"))),
                ("Category", json!(d.get_str("category"))),
                (
                    "ServerlessConfiguration",
                    serverless_config(d).map(Value::String).unwrap_or(Value::Null),
                ),
            ]);
            let request = &request;
            retry(ctx.retry_timeout(timeout), move || async move {
                rds.call("ModifyDBInstanceSpec", request.clone())
                    .await
                    .map_err(|err| RetryError::classify(err, INSTANCE_BUSY))
            })
            .await?;
            rds.wait_running(&id, timeout).await?;
            d.commit(&[
                "db_instance_class",
                "db_instance_storage",
                "db_instance_storage_type",
                "serverless_config",
            ]);
        }

        if d.has_change("pg_hba_conf") {
            rds.call(
                "ModifyPGHbaConfig",
                json!({
                    "DBInstanceId": id,
                    "OpsType": "Update",
                    "HbaItem": hba_items(d),
                }),
            )
            .await?;
            rds.wait_running(&id, timeout).await?;
            d.commit(&["pg_hba_conf"]);
        }

        Ok(())
    }
}

#[async_trait]
impl Resource for RdsCloneDbInstance {
    fn type_name(&self) -> &'static str {
        "alicloud_rds_clone_db_instance"
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts {
            create: Duration::from_secs(300 * 60),
            update: Duration::from_secs(30 * 60),
            delete: Duration::from_secs(20 * 60),
        }
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("id", Attribute::computed_string())
            .with_attribute(
                "source_db_instance_id",
                Attribute::required_string().with_force_new(),
            )
            .with_attribute(
                "payment_type",
                Attribute::required_string().with_constraint(Constraint::string_in(&[
                    "PayAsYouGo",
                    "Subscription",
                    "Serverless",
                ])),
            )
            .with_attribute(
                "db_instance_storage_type",
                Attribute::required_string().with_constraint(Constraint::string_in(&[
                    "local_ssd",
                    "cloud_ssd",
                    "cloud_essd",
                    "cloud_essd2",
                    "cloud_essd3",
                ])),
            )
            .with_attribute("backup_id", Attribute::optional_string().with_force_new())
            .with_attribute(
                "restore_time",
                Attribute::optional_string()
                    .with_force_new()
                    .with_conflicts_with(&["backup_id"]),
            )
            .with_attribute(
                "backup_type",
                Attribute::optional_string()
                    .with_force_new()
                    .with_constraint(Constraint::string_in(&["FullBackup", "IncrementalBackup"])),
            )
            .with_attribute("zone_id", Attribute::optional_computed_string().with_force_new())
            .with_attribute("vpc_id", Attribute::optional_computed_string().with_force_new())
            .with_attribute("vswitch_id", Attribute::optional_computed_string().with_force_new())
            .with_attribute(
                "instance_network_type",
                Attribute::optional_computed_string()
                    .with_force_new()
                    .with_constraint(Constraint::string_in(&["Classic", "VPC"])),
            )
            .with_attribute(
                "category",
                Attribute::optional_computed_string().with_constraint(Constraint::string_in(&[
                    "Basic",
                    "HighAvailability",
                    "AlwaysOn",
                    "Finance",
                    "serverless_basic",
                ])),
            )
            .with_attribute("db_instance_class", Attribute::optional_computed_string())
            .with_attribute("db_instance_storage", Attribute::optional_computed_int64())
            .with_attribute(
                "db_instance_description",
                Attribute::optional_computed_string(),
            )
            .with_attribute("deletion_protection", Attribute::optional_bool())
            .with_attribute(
                "security_ips",
                Attribute::optional_string_set().with_computed(),
            )
            .with_attribute("port", Attribute::optional_computed_string())
            .with_attribute("connection_string_prefix", Attribute::optional_computed_string())
            .with_attribute(
                "tcp_connection_type",
                Attribute::optional_computed_string()
                    .with_constraint(Constraint::string_in(&["SLB", "Proxy"])),
            )
            .with_attribute(
                "period",
                Attribute::optional_int64()
                    .with_force_new()
                    .with_constraint(Constraint::int_in(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 12, 24, 36, 60])),
            )
            .with_attribute("used_time", Attribute::optional_int64().with_force_new())
            .with_attribute("engine", Attribute::computed_string())
            .with_attribute("engine_version", Attribute::computed_string())
            .with_attribute("connection_string", Attribute::computed_string())
            .with_block("pg_hba_conf", NestedBlock::set(hba_block()))
            .with_block(
                "serverless_config",
                NestedBlock::list(serverless_block()).with_max_items(1),
            )
    }

    async fn create(&self, ctx: &ResourceContext, planned: Value) -> Result<Value, ProviderError> {
        let mut d = ResourceData::new_resource(planned);
        let rds = RdsService::new(&ctx.client);
        let subscription = d.get_str("payment_type") == "Subscription";

        let request = params([
            ("DBInstanceId", json!(d.get_str("source_db_instance_id"))),
            ("PayType", json!(pay_type(d.get_str("payment_type")))),
            ("DBInstanceStorageType", json!(d.get_str("db_instance_storage_type"))),
            ("BackupId", json!(d.get_str("backup_id"))),
            ("RestoreTime", json!(d.get_str("restore_time"))),
            ("BackupType", json!(d.get_str("backup_type"))),
            ("ZoneId", json!(d.get_str("zone_id"))),
            ("VPCId", json!(d.get_str("vpc_id"))),
            ("VSwitchId", json!(d.get_str("vswitch_id"))),
            ("InstanceNetworkType", json!(d.get_str("instance_network_type"))),
            ("Category", json!(d.get_str("category"))),
            ("DBInstanceClass", json!(d.get_str("db_instance_class"))),
            ("DBInstanceStorage", d.get_ok("db_instance_storage").cloned().unwrap_or(Value::Null)),
            ("DbInstanceDescription", json!(d.get_str("db_instance_description"))),
            ("Port", json!(d.get_str("port"))),
            ("ConnectionStringPrefix", json!(d.get_str("connection_string_prefix"))),
            ("TcpConnectionType", json!(d.get_str("tcp_connection_type"))),
            (
                "Period",
                if subscription { json!("Month") } else { Value::Null },
            ),
            (
                "UsedTime",
                match d.get_ok("period").or_else(|| d.get_ok("used_time")) {
                    Some(period) if subscription => period.clone(),
                    _ => Value::Null,
                },
            ),
            (
                "ServerlessConfig",
                serverless_config(&d).map(Value::String).unwrap_or(Value::Null),
            ),
        ]);

        let request = &request;
        let response = retry(ctx.retry_timeout(Duration::from_secs(5 * 60)), move || async move {
            rds.call("CloneDBInstance", request.clone())
                .await
                .map_err(|err| RetryError::classify(err, INSTANCE_BUSY))
        })
        .await?;

        let id = response["DBInstanceId"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProviderError::Sdk("CloneDBInstance returned no DBInstanceId".into()))?
            .to_string();
        d.set_id(&id);
        info!(id = %id, "cloned DB instance");

        let settled = async {
            rds.wait_running(&id, self.timeouts().create).await?;
            self.apply(ctx, &mut d).await
        }
        .await;
        let state = d.into_state();
        if let Err(err) = settled {
            return Err(err.with_state(state));
        }

        match self.read(ctx, state.clone()).await {
            Ok(Some(state)) => Ok(state),
            Ok(None) => Err(ProviderError::NotFound(format!(
                "DB instance {} vanished after create",
                id
            ))),
            Err(err) => Err(err.with_state(state)),
        }
    }

    async fn read(&self, ctx: &ResourceContext, state: Value) -> Result<Option<Value>, ProviderError> {
        let mut d = ResourceData::from_state(state);
        let id = d.id().to_string();
        let rds = RdsService::new(&ctx.client);
        let object = match rds.describe_db_instance(&id).await {
            Ok(object) => object,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        d.set(
            "payment_type",
            json!(payment_type(object["PayType"].as_str().unwrap_or_default())),
        );
        for (attr, field) in [
            ("db_instance_description", "DBInstanceDescription"),
            ("db_instance_class", "DBInstanceClass"),
            ("db_instance_storage", "DBInstanceStorage"),
            ("db_instance_storage_type", "DBInstanceStorageType"),
            ("engine", "Engine"),
            ("engine_version", "EngineVersion"),
            ("zone_id", "ZoneId"),
            ("vpc_id", "VpcId"),
            ("vswitch_id", "VSwitchId"),
            ("instance_network_type", "InstanceNetworkType"),
            ("category", "Category"),
            ("connection_string", "ConnectionString"),
            ("port", "Port"),
            ("deletion_protection", "DeletionProtection"),
        ] {
            if let Some(value) = object.get(field) {
                d.set(attr, value.clone());
            }
        }
        if let Some(prefix) = object["ConnectionString"]
            .as_str()
            .and_then(|s| s.split('.').next())
            .filter(|s| !s.is_empty())
        {
            d.set("connection_string_prefix", json!(prefix));
        }

        let ips = rds.describe_security_ips(&id).await?;
        d.set("security_ips", json!(ips));

        if object["Engine"] == "PostgreSQL" && !d.get("pg_hba_conf").is_null() {
            let entries: Vec<Value> = rds
                .describe_pg_hba_config(&id)
                .await?
                .into_iter()
                .map(|item| {
                    json!({
                        "type": item["Type"],
                        "mask": item["Mask"],
                        "database": item["Database"],
                        "priority_id": item["PriorityId"],
                        "address": item["Address"],
                        "user": item["User"],
                        "method": item["Method"],
                        "option": item["Option"],
                    })
                })
                .collect();
            d.set("pg_hba_conf", Value::Array(entries));
        }

        if let Some(config) = object.get("ServerlessConfig").filter(|c| c.is_object()) {
            d.set(
                "serverless_config",
                json!([{
                    "max_capacity": config["ScaleMax"],
                    "min_capacity": config["ScaleMin"],
                    "auto_pause": config["AutoPause"],
                    "switch_force": config["SwitchForce"],
                }]),
            );
        }

        Ok(Some(d.into_state()))
    }

    async fn update(
        &self,
        ctx: &ResourceContext,
        prior: Value,
        planned: Value,
    ) -> Result<Value, ProviderError> {
        let mut d = ResourceData::update(prior, planned);
        self.apply(ctx, &mut d).await?;
        let id = d.id().to_string();
        self.read(ctx, d.into_state())
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("DB instance {}", id)))
    }

    async fn delete(&self, ctx: &ResourceContext, state: Value) -> Result<(), ProviderError> {
        let d = ResourceData::from_state(state);
        let id = d.id();
        let rds = RdsService::new(&ctx.client);

        if d.get_str("payment_type") == "Subscription" {
            warn!(id = %id, "subscription DB instances are released when they expire; removing from state");
            return Ok(());
        }

        let result = retry(ctx.retry_timeout(self.timeouts().delete), move || async move {
            rds.call("DeleteDBInstance", json!({ "DBInstanceId": id }))
                .await
                .map_err(|err| RetryError::classify(err, INSTANCE_BUSY))
        })
        .await;
        match result {
            Ok(_) => {}
            Err(err) if err.is_expected(RDS_NOT_FOUND) => return Ok(()),
            Err(err) => return Err(err),
        }

        let waiter = StateWaiter::until_gone(
            &["Creating", "Running", "Deleting", "Released"],
            self.timeouts().delete,
        )
        .with_delay(Duration::from_secs(3))
        .with_poll_interval(Duration::from_secs(10));
        rds.wait_for_db_instance(id, waiter).await.map(|_| ())
    }
}
