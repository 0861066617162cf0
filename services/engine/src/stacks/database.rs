//! Database stack: Aurora Serverless v2 and the security group the compute
//! backends join to reach it

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::info;

use crate::constructs::{AuroraCluster, AuroraProps};
use crate::error::Result;
use crate::stacks::network::NetworkOutputs;
use crate::stacks::StackContext;
use crate::template::Stack;

pub const DB_ADMIN_USER: &str = "dbadmin";
pub const DEFAULT_DATABASE: &str = "redcap";

/// Imported handles of the database
#[derive(Debug, Clone)]
pub struct DatabaseOutputs {
    /// Admin credentials; absent when a snapshot is restored without new credentials
    pub secret_arn: Option<Value>,
    pub secret_name: Option<Value>,
    /// Group allowed on the engine port
    pub allowed_security_group_id: Value,
    /// Group of the cluster itself
    pub cluster_security_group_id: Value,
    pub read_replica_hostname: Option<Value>,
    pub cluster_resource_id: Value,
    pub port: u16,
}

pub fn build(ctx: &StackContext<'_>, network: &NetworkOutputs) -> Result<(Stack, DatabaseOutputs)> {
    let db = &ctx.cfg.db;
    let mut stack = ctx.new_stack("Database");

    let allowed = stack.add(
        &ctx.resource_name("apprunner-db-sg"),
        "AWS::EC2::SecurityGroup",
        json!({
            "GroupDescription": "Compute backends allowed to reach the database",
            "VpcId": network.vpc_id,
            "SecurityGroupEgress": [{ "IpProtocol": "-1", "CidrIp": "0.0.0.0/0" }],
        }),
    )?;

    let mut parameters = BTreeMap::new();
    if db.engine.is_mysql() {
        parameters.insert("max_allowed_packet".to_string(), db.max_allowed_packet.clone());
    }

    let cluster = AuroraCluster::new(
        &mut stack,
        "RDSV2",
        &AuroraProps {
            engine: db.engine,
            vpc_id: network.vpc_id.clone(),
            isolated_subnets: network.isolated_subnets.clone(),
            scaling: db.scaling,
            db_user_name: DB_ADMIN_USER.to_string(),
            default_database_name: DEFAULT_DATABASE.to_string(),
            readers: db.db_readers,
            backup_retention_days: db.backup_retention_days,
            parameters,
            rotate_secret_after_days: Some(db.rotate_secret_after_days).filter(|days| *days > 0),
            enable_proxy: db.enable_proxy,
            snapshot_id: db.db_snapshot_id.clone(),
            generate_snapshot_credentials: db.generate_snapshot_credentials,
        },
    )?;
    cluster.allow_default_port_from(&mut stack, "RDSV2-from-backend", allowed.attr("GroupId"))?;

    let secret_arn = cluster.secret.as_ref().map(|secret| stack.export("DbSecretArn", secret.reference()));
    let secret_name = cluster
        .secret_name
        .clone()
        .map(|name| stack.export("DbSecretName", json!(name)));
    let read_replica_hostname = cluster
        .read_endpoint
        .clone()
        .map(|endpoint| stack.export("ReadReplicaHostname", endpoint));

    let outputs = DatabaseOutputs {
        secret_arn,
        secret_name,
        allowed_security_group_id: stack.export("DbAllowedSecurityGroupId", allowed.attr("GroupId")),
        cluster_security_group_id: stack.export("DbSecurityGroupId", cluster.security_group.attr("GroupId")),
        read_replica_hostname,
        cluster_resource_id: stack.export("ClusterResourceId", cluster.resource_id.clone()),
        port: cluster.port,
    };
    info!(
        stack = %stack.name(),
        engine = db.engine.engine(),
        readers = db.db_readers,
        snapshot = db.db_snapshot_id.is_some(),
        "Database planned"
    );
    Ok((stack, outputs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stacks::network;
    use crate::stacks::tests::{context, redcap_config};

    #[test]
    fn test_database_exports() {
        let cfg = redcap_config("");
        let ctx = context("dev", &cfg);
        let (_, net) = network::build(&ctx).unwrap();
        let (stack, outputs) = build(&ctx, &net).unwrap();

        assert_eq!(
            outputs.secret_arn,
            Some(json!({ "Fn::ImportValue": "dev-REDCap-Database-DbSecretArn" }))
        );
        assert!(outputs.read_replica_hostname.is_some());
        assert_eq!(outputs.port, 3306);
        assert_eq!(stack.resources_of_type("AWS::RDS::DBCluster").count(), 1);
        assert_eq!(stack.resources_of_type("AWS::EC2::SecurityGroupIngress").count(), 1);
    }

    #[test]
    fn test_no_readers_no_replica_hostname() {
        let cfg = redcap_config("db:\n  dbReaders: 0\n");
        let ctx = context("dev", &cfg);
        let (_, net) = network::build(&ctx).unwrap();
        let (_, outputs) = build(&ctx, &net).unwrap();
        assert!(outputs.read_replica_hostname.is_none());
    }

    #[test]
    fn test_snapshot_without_credentials_has_no_secret() {
        let cfg = redcap_config("db:\n  dbSnapshotId: snap-1\n  generateSnapshotCredentials: false\n");
        let ctx = context("dev", &cfg);
        let (_, net) = network::build(&ctx).unwrap();
        let (stack, outputs) = build(&ctx, &net).unwrap();
        assert!(outputs.secret_arn.is_none());
        assert!(stack.output("DbSecretArn").is_none());
    }
}
