//! ApsaraDB RDS.

use std::time::Duration;

use serde_json::{json, Value};

use super::{items, map_not_found, not_found};
use crate::client::{AlicloudClient, ApiError, Product};
use crate::error::ProviderError;
use crate::wait::{Refresh, StateWaiter};

/// Codes meaning the DB instance does not exist.
pub const RDS_NOT_FOUND: &[&str] = &[
    "InvalidDBInstanceId.NotFound",
    "InvalidDBInstanceName.NotFound",
];

/// RDS API helpers.
#[derive(Debug, Clone, Copy)]
pub struct RdsService<'a> {
    client: &'a AlicloudClient,
}

impl<'a> RdsService<'a> {
    /// Wrap a client.
    pub fn new(client: &'a AlicloudClient) -> Self {
        Self { client }
    }

    /// Call an RDS action in the client's region.
    pub async fn call(&self, action: &str, mut request: Value) -> Result<Value, ApiError> {
        if let Value::Object(map) = &mut request {
            map.entry("RegionId")
                .or_insert_with(|| Value::String(self.client.region().to_string()));
        }
        self.client.rpc(Product::Rds, action, request).await
    }

    /// Describe a DB instance.
    pub async fn describe_db_instance(&self, id: &str) -> Result<Value, ProviderError> {
        let response = self
            .call("DescribeDBInstanceAttribute", json!({ "DBInstanceId": id }))
            .await
            .map_err(|e| map_not_found(e, RDS_NOT_FOUND, "DB instance", id))?;
        items(&response, "/Items/DBInstanceAttribute")
            .into_iter()
            .next()
            .ok_or_else(|| not_found("DB instance", id))
    }

    /// Refresh function for [`StateWaiter`]: the instance and its `DBInstanceStatus`.
    pub async fn db_instance_state(&self, id: &str) -> Refresh<Value> {
        match self.describe_db_instance(id).await {
            Ok(object) => {
                let status = object["DBInstanceStatus"].as_str().unwrap_or_default().to_string();
                Ok(Some((object, status)))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Wait for the DB instance to reach a state (empty target: until deleted).
    pub async fn wait_for_db_instance(
        &self,
        id: &str,
        waiter: StateWaiter,
    ) -> Result<Option<Value>, ProviderError> {
        waiter.wait(|| self.db_instance_state(id)).await
    }

    /// Wait until the instance is `Running`.
    pub async fn wait_running(&self, id: &str, timeout: Duration) -> Result<(), ProviderError> {
        let waiter = StateWaiter::new(
            &[
                "Creating",
                "DBInstanceClassChanging",
                "DBInstanceNetTypeChanging",
                "NET_CREATING",
                "NET_DELETING",
                "Restoring",
                "TempDBInstanceCreating",
                "Transing",
                "TransingToOthers",
            ],
            &["Running"],
            timeout,
        )
        .with_delay(Duration::from_secs(3))
        .with_poll_interval(Duration::from_secs(10));
        self.wait_for_db_instance(id, waiter).await.map(|_| ())
    }

    /// Security IP groups of an instance.
    pub async fn describe_ip_array_list(&self, id: &str) -> Result<Vec<Value>, ProviderError> {
        let response = self
            .call("DescribeDBInstanceIPArrayList", json!({ "DBInstanceId": id }))
            .await
            .map_err(|e| map_not_found(e, RDS_NOT_FOUND, "DB instance", id))?;
        Ok(items(&response, "/Items/DBInstanceIPArray"))
    }

    /// Whitelisted IPs of the default group, hidden groups excluded.
    pub async fn describe_security_ips(&self, id: &str) -> Result<Vec<String>, ProviderError> {
        let groups = self.describe_ip_array_list(id).await?;
        let mut ips = Vec::new();
        for group in groups {
            if group["DBInstanceIPArrayAttribute"] == "hidden" {
                continue;
            }
            if let Some(list) = group["SecurityIPList"].as_str() {
                ips.extend(list.split(',').filter(|s| !s.is_empty()).map(str::to_string));
            }
        }
        ips.sort();
        ips.dedup();
        Ok(ips)
    }

    /// Running pg_hba entries of a PostgreSQL instance.
    pub async fn describe_pg_hba_config(&self, id: &str) -> Result<Vec<Value>, ProviderError> {
        let response = self
            .call("DescribePGHbaConfig", json!({ "DBInstanceId": id }))
            .await?;
        Ok(items(&response, "/RunningHbaItems/HbaItem"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_describe_security_ips() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            "DescribeDBInstanceIPArrayList",
            json!({"Items": {"DBInstanceIPArray": [
                {"DBInstanceIPArrayName": "default", "SecurityIPList": "10.0.0.1,10.0.0.2"},
                {"DBInstanceIPArrayName": "hidden_ips", "DBInstanceIPArrayAttribute": "hidden", "SecurityIPList": "100.1.1.1"},
                {"DBInstanceIPArrayName": "app", "SecurityIPList": "10.0.0.2"}
            ]}}),
        );
        let client = AlicloudClient::new(mock.clone(), "cn-hangzhou");
        let ips = RdsService::new(&client).describe_security_ips("rm-1").await.unwrap();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_describe_db_instance_not_found() {
        let mock = Arc::new(MockTransport::new());
        mock.fail(
            "DescribeDBInstanceAttribute",
            ApiError::new("InvalidDBInstanceId.NotFound", "missing", 404),
        );
        let client = AlicloudClient::new(mock.clone(), "cn-hangzhou");
        let rds = RdsService::new(&client);
        assert!(rds.describe_db_instance("rm-1").await.unwrap_err().is_not_found());
        assert!(rds.db_instance_state("rm-1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_running() {
        let mock = Arc::new(MockTransport::new());
        mock.respond_once(
            "DescribeDBInstanceAttribute",
            json!({"Items": {"DBInstanceAttribute": [{"DBInstanceStatus": "Creating"}]}}),
        );
        mock.respond(
            "DescribeDBInstanceAttribute",
            json!({"Items": {"DBInstanceAttribute": [{"DBInstanceStatus": "Running"}]}}),
        );
        let client = AlicloudClient::new(mock.clone(), "cn-hangzhou");
        RdsService::new(&client)
            .wait_running("rm-1", Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(mock.count("DescribeDBInstanceAttribute"), 2);
    }
}
