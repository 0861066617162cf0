//! Aurora Serverless v2 cluster

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{DbEngine, DbScaling};
use crate::constructs::iam::{grant, service_role, Grantee, PolicyStatement};
use crate::error::{Result, SynthError};
use crate::template::{join, RemovalPolicy, ResourceRef, Stack};

#[derive(Debug, Clone)]
pub struct AuroraProps {
    pub engine: DbEngine,
    pub vpc_id: Value,
    pub isolated_subnets: Vec<Value>,
    pub scaling: DbScaling,
    pub db_user_name: String,
    pub default_database_name: String,
    pub readers: u32,
    pub backup_retention_days: u32,
    pub parameters: BTreeMap<String, String>,
    /// `None` disables rotation
    pub rotate_secret_after_days: Option<u32>,
    pub enable_proxy: bool,
    pub snapshot_id: Option<String>,
    pub generate_snapshot_credentials: bool,
}

/// Handles of a declared cluster
#[derive(Debug, Clone)]
pub struct AuroraCluster {
    pub cluster: ResourceRef,
    pub security_group: ResourceRef,
    /// Admin credentials; absent when restoring a snapshot with its own credentials
    pub secret: Option<ResourceRef>,
    pub secret_name: Option<String>,
    pub resource_id: Value,
    pub endpoint: Value,
    /// Reader endpoint hostname, only when readers exist
    pub read_endpoint: Option<Value>,
    pub port: u16,
    pub proxy_endpoint: Option<Value>,
}

const EXCLUDED_PASSWORD_CHARACTERS: &str = " %+~`#$&*()|[]{}:;<>?!'/@\"\\";

impl AuroraCluster {
    pub fn new(stack: &mut Stack, id: &str, props: &AuroraProps) -> Result<Self> {
        if props.isolated_subnets.is_empty() {
            return Err(SynthError::MissingIsolatedSubnets);
        }
        let engine = props.engine;
        let port = engine.default_port();

        let subnet_group = stack.add(
            &format!("{}-subnets", id),
            "AWS::RDS::DBSubnetGroup",
            json!({
                "DBSubnetGroupDescription": format!("Isolated subnets for {}", id),
                "SubnetIds": props.isolated_subnets,
            }),
        )?;

        let security_group = stack.add(
            &format!("{}-sg", id),
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": format!("{} cluster", id),
                "VpcId": props.vpc_id,
                "SecurityGroupEgress": [{ "IpProtocol": "-1", "CidrIp": "0.0.0.0/0" }],
            }),
        )?;

        let creates_secret = props.snapshot_id.is_none() || props.generate_snapshot_credentials;
        let secret_name = format!("{}-credentials", id);
        let secret = if creates_secret {
            Some(stack.add(
                &format!("{}-secret", id),
                "AWS::SecretsManager::Secret",
                json!({
                    "Name": secret_name,
                    "Description": format!("Generated admin credentials for {}", id),
                    "GenerateSecretString": {
                        "SecretStringTemplate": json!({ "username": props.db_user_name }).to_string(),
                        "GenerateStringKey": "password",
                        "PasswordLength": 30,
                        "ExcludeCharacters": EXCLUDED_PASSWORD_CHARACTERS,
                    },
                }),
            )?)
        } else {
            warn!(cluster = %id, "Restoring from snapshot without generated credentials, no database secret is exposed");
            None
        };

        let parameter_group = if props.parameters.is_empty() {
            None
        } else {
            Some(stack.add(
                &format!("{}-AuroraV2ParameterGroup", id),
                "AWS::RDS::DBClusterParameterGroup",
                json!({
                    "Description": format!("Cluster parameter group for {}", engine.parameter_group_family()),
                    "Family": engine.parameter_group_family(),
                    "Parameters": props.parameters,
                }),
            )?)
        };

        let mut cluster_props = json!({
            "Engine": engine.engine(),
            "EngineVersion": engine.version(),
            "DBSubnetGroupName": subnet_group.reference(),
            "VpcSecurityGroupIds": [security_group.attr("GroupId")],
            "EnableIAMDatabaseAuthentication": true,
            "StorageEncrypted": true,
            "BackupRetentionPeriod": props.backup_retention_days,
            "Port": port,
            "ServerlessV2ScalingConfiguration": {
                "MinCapacity": props.scaling.min_capacity_acu,
                "MaxCapacity": props.scaling.max_capacity_acu,
            },
            "EnableCloudwatchLogsExports": if engine.is_mysql() {
                json!(["error", "general", "slowquery", "audit"])
            } else {
                json!(["postgresql"])
            },
        });
        if engine.is_mysql() {
            cluster_props["BacktrackWindow"] = json!(24 * 3600);
        }
        if let Some(group) = &parameter_group {
            cluster_props["DBClusterParameterGroupName"] = group.reference();
        }
        if let Some(secret) = &secret {
            cluster_props["MasterUsername"] = resolve_secret_field(secret, "username");
            cluster_props["MasterUserPassword"] = resolve_secret_field(secret, "password");
        }
        match &props.snapshot_id {
            Some(snapshot) => {
                cluster_props["SnapshotIdentifier"] = json!(snapshot);
                if let Some(fields) = cluster_props.as_object_mut() {
                    fields.remove("MasterUsername");
                }
            }
            None => cluster_props["DatabaseName"] = json!(props.default_database_name),
        }

        let cluster = stack.add(&format!("{}-ServerlessAuroraDatabase", id), "AWS::RDS::DBCluster", cluster_props)?;
        stack.apply_removal_policy(&cluster, RemovalPolicy::Snapshot);

        let attachment = match &secret {
            Some(secret) => Some(stack.add(
                &format!("{}-secret-attachment", id),
                "AWS::SecretsManager::SecretTargetAttachment",
                json!({
                    "SecretId": secret.reference(),
                    "TargetId": cluster.reference(),
                    "TargetType": "AWS::RDS::DBCluster",
                }),
            )?),
            None => None,
        };

        let instance = |promotion_tier: u32| {
            json!({
                "DBClusterIdentifier": cluster.reference(),
                "DBInstanceClass": "db.serverless",
                "Engine": engine.engine(),
                "PubliclyAccessible": false,
                "AutoMinorVersionUpgrade": true,
                "CACertificateIdentifier": "rds-ca-rsa2048-g1",
                "PromotionTier": promotion_tier,
            })
        };
        stack.add(&format!("{}-WriterClusterInstance", id), "AWS::RDS::DBInstance", instance(0))?;
        for reader in 1..=props.readers {
            stack.add(
                &format!("{}-ReaderClusterInstance{}", id, reader),
                "AWS::RDS::DBInstance",
                instance(2),
            )?;
        }

        if let (Some(secret), Some(attachment), Some(days)) =
            (&secret, &attachment, props.rotate_secret_after_days)
        {
            let rotation = stack.add(
                &format!("{}-rotation", id),
                "AWS::SecretsManager::RotationSchedule",
                json!({
                    "SecretId": secret.reference(),
                    "HostedRotationLambda": {
                        "RotationType": if engine.is_mysql() { "MySQLSingleUser" } else { "PostgreSQLSingleUser" },
                        "VpcSubnetIds": join(",", props.isolated_subnets.clone()),
                        "VpcSecurityGroupIds": security_group.attr("GroupId"),
                    },
                    "RotationRules": { "AutomaticallyAfterDays": days },
                }),
            )?;
            stack.add_dependency(&rotation, attachment);
        }

        let proxy_endpoint = match (&secret, props.enable_proxy) {
            (Some(secret), true) => Some(Self::add_proxy(stack, id, props, &cluster, secret, &security_group)?),
            (None, true) => {
                return Err(SynthError::invalid("db.enableProxy", "a proxy needs the generated database secret"))
            }
            _ => None,
        };

        debug!(cluster = %id, engine = ?engine, readers = props.readers, "Declared Aurora cluster");

        Ok(Self {
            resource_id: cluster.attr("DBClusterResourceId"),
            endpoint: cluster.attr("Endpoint.Address"),
            read_endpoint: (props.readers > 0).then(|| cluster.attr("ReadEndpoint.Address")),
            secret_name: secret.as_ref().map(|_| secret_name),
            cluster,
            security_group,
            secret,
            port,
            proxy_endpoint,
        })
    }

    fn add_proxy(
        stack: &mut Stack,
        id: &str,
        props: &AuroraProps,
        cluster: &ResourceRef,
        secret: &ResourceRef,
        security_group: &ResourceRef,
    ) -> Result<Value> {
        let role = service_role(stack, &format!("{}-proxy-role", id), "rds.amazonaws.com", &[])?;
        grant(
            stack,
            &format!("{}-proxy-role-secret", id),
            &Grantee::Role(role.clone()),
            &[PolicyStatement::secret_read(secret.reference())],
        )?;
        let proxy = stack.add(
            &format!("{}-dbproxy", id),
            "AWS::RDS::DBProxy",
            json!({
                "DBProxyName": format!("{}-dbclusterv2-dbproxy", id),
                "EngineFamily": if props.engine.is_mysql() { "MYSQL" } else { "POSTGRESQL" },
                "RequireTLS": true,
                "RoleArn": role.arn(),
                "VpcSubnetIds": props.isolated_subnets,
                "VpcSecurityGroupIds": [security_group.attr("GroupId")],
                "Auth": [{
                    "AuthScheme": "SECRETS",
                    "SecretArn": secret.reference(),
                    "IAMAuth": "REQUIRED",
                }],
            }),
        )?;
        stack.add(
            &format!("{}-dbproxy-targets", id),
            "AWS::RDS::DBProxyTargetGroup",
            json!({
                "DBProxyName": proxy.reference(),
                "TargetGroupName": "default",
                "DBClusterIdentifiers": [cluster.reference()],
            }),
        )?;
        Ok(proxy.attr("Endpoint"))
    }

    /// Open the engine port to a security group
    pub fn allow_default_port_from(&self, stack: &mut Stack, id: &str, source_group_id: Value) -> Result<ResourceRef> {
        stack.add(
            id,
            "AWS::EC2::SecurityGroupIngress",
            json!({
                "GroupId": self.security_group.attr("GroupId"),
                "SourceSecurityGroupId": source_group_id,
                "IpProtocol": "tcp",
                "FromPort": self.port,
                "ToPort": self.port,
                "Description": format!("from {}:{}", id, self.port),
            }),
        )
    }
}

/// `{{resolve:secretsmanager:<arn>:SecretString:<field>}}`
fn resolve_secret_field(secret: &ResourceRef, field: &str) -> Value {
    join(
        "",
        vec![
            json!("{{resolve:secretsmanager:"),
            secret.reference(),
            json!(format!(":SecretString:{}::}}}}", field)),
        ],
    )
}
