//! App Runner service pulling from ECR
//!
//! The managed-autoscaling backend: VPC connector on the private subnets,
//! autoscaling configuration, optional deployment notifications and an
//! optional custom domain in a managed zone.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{Cpu, Memory};
use crate::constructs::iam::{grant, service_role, Grantee, PolicyStatement};
use crate::constructs::route53::{alias_record, cname_record, HostedZone};
use crate::error::{Result, SynthError};
use crate::template::{join, RemovalPolicy, ResourceRef, Stack};

/// Hosted zone ids of the App Runner endpoints, per region
const HOSTED_ZONES: &[(&str, &str)] = &[
    ("us-east-2", "Z0224347AD7KVHMLOX31"),
    ("us-east-1", "Z01915732ZBZKC8D32TPT"),
    ("us-west-2", "Z02243383FTQ64HJ5772Q"),
    ("ap-southeast-1", "Z09819469CZ3KQ8PWMCL"),
    ("ap-southeast-2", "Z03657752RA8799S0TI5I"),
    ("ap-northeast-1", "Z08491812XW6IPYLR6CCA"),
    ("eu-central-1", "Z0334911C2FDI2Q9M4FZ"),
    ("eu-west-1", "Z087551914Z2PCAU0QHMW"),
];

/// Alias target zone for App Runner service URLs in `region`
pub fn app_runner_hosted_zone(region: &str) -> Option<&'static str> {
    HOSTED_ZONES
        .iter()
        .find(|(r, _)| *r == region)
        .map(|(_, zone)| *zone)
}

/// Memory sizes (MiB) App Runner offers for each vCPU size
const SIZES: &[(u32, &[u32])] = &[
    (256, &[512, 1024]),
    (512, &[1024]),
    (1024, &[2048, 3072, 4096]),
    (2048, &[4096, 6144]),
    (4096, &[8192, 10240, 12288]),
];

pub fn validate_size(cpu: Cpu, memory: Memory) -> Result<()> {
    let supported = SIZES
        .iter()
        .any(|(units, memories)| *units == cpu.units() && memories.contains(&memory.mib()));
    if supported {
        Ok(())
    } else {
        Err(SynthError::UnsupportedSize {
            backend: "App Runner",
            cpu: cpu.to_string(),
            memory: memory.to_string(),
        })
    }
}

const ACCESS_ROLE_ACTIONS: &[&str] = &[
    "ecr:DescribeImages",
    "wafv2:ListResourcesForWebACL",
    "wafv2:GetWebACLForResource",
    "wafv2:AssociateWebACL",
    "wafv2:DisassociateWebACL",
    "apprunner:ListAssociatedServicesForWebAcl",
    "apprunner:DescribeWebAclForService",
    "apprunner:AssociateWebAcl",
    "apprunner:DisassociateWebAcl",
];

const NOTIFIED_OPERATIONS: &[&str] = &[
    "PauseServiceCompletedSuccessfully",
    "PauseServiceFailed",
    "ResumeServiceCompletedSuccessfully",
    "ResumeServiceFailed",
    "UpdateServiceCompletedSuccessfully",
    "UpdateServiceFailed",
    "DeploymentCompletedSuccessfully",
    "DeploymentFailed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppRunnerScaling {
    pub max_concurrency: u32,
    pub max_size: u32,
    pub min_size: u32,
}

#[derive(Debug, Clone)]
pub struct AppRunnerProps<'a> {
    pub app_name: String,
    pub repository_uri: Value,
    pub tag: String,
    pub port: u16,
    pub cpu: Cpu,
    pub memory: Memory,
    pub environment: BTreeMap<String, Value>,
    pub auto_deployments_enabled: bool,
    /// Reuse an existing access role instead of creating one
    pub access_role_arn: Option<String>,
    pub subnets: Vec<Value>,
    pub security_groups: Vec<Value>,
    pub scaling: AppRunnerScaling,
    pub notification_email: Option<String>,
    pub health_check_path: Option<String>,
    /// Zone and fully qualified name for the custom domain
    pub custom_domain: Option<(&'a HostedZone, String)>,
}

#[derive(Debug, Clone)]
pub struct AppRunner {
    pub service: ResourceRef,
    pub instance_role: ResourceRef,
    /// Hostname without scheme
    pub service_url: Value,
    pub custom_domain: Option<String>,
}

impl AppRunner {
    pub fn new(stack: &mut Stack, id: &str, props: &AppRunnerProps<'_>) -> Result<Self> {
        validate_size(props.cpu, props.memory)?;

        let connector = stack.add(
            &format!("{}-vpc-connector", id),
            "AWS::AppRunner::VpcConnector",
            json!({
                "Subnets": props.subnets,
                "SecurityGroups": props.security_groups,
            }),
        )?;

        let access_role_arn = match &props.access_role_arn {
            Some(arn) => json!(arn),
            None => {
                let role = service_role(stack, &format!("{}-apprunner-accessRole", id), "build.apprunner.amazonaws.com", &[])?;
                grant(
                    stack,
                    &format!("{}-apprunner-accessRole-policy", id),
                    &Grantee::Role(role.clone()),
                    &[
                        PolicyStatement::allow(ACCESS_ROLE_ACTIONS, vec![json!("*")]),
                        PolicyStatement::allow(
                            &[
                                "ecr:BatchCheckLayerAvailability",
                                "ecr:GetDownloadUrlForLayer",
                                "ecr:BatchGetImage",
                                "ecr:GetAuthorizationToken",
                            ],
                            vec![json!("*")],
                        ),
                    ],
                )?;
                role.arn()
            }
        };
        let instance_role = service_role(stack, &format!("{}-instance-role", id), "tasks.apprunner.amazonaws.com", &[])?;

        let autoscaling = stack.add(
            &format!("{}-AppRunnerScalingConfig", id),
            "AWS::AppRunner::AutoScalingConfiguration",
            json!({
                "MaxConcurrency": props.scaling.max_concurrency,
                "MaxSize": props.scaling.max_size,
                "MinSize": props.scaling.min_size,
            }),
        )?;

        let environment: Vec<Value> = props
            .environment
            .iter()
            .map(|(name, value)| json!({ "Name": name, "Value": value }))
            .collect();
        let mut service_props = json!({
            "ServiceName": props.app_name,
            "SourceConfiguration": {
                "AuthenticationConfiguration": { "AccessRoleArn": access_role_arn },
                "AutoDeploymentsEnabled": props.auto_deployments_enabled,
                "ImageRepository": {
                    "ImageIdentifier": join(":", vec![props.repository_uri.clone(), json!(props.tag)]),
                    "ImageRepositoryType": "ECR",
                    "ImageConfiguration": {
                        "Port": props.port.to_string(),
                        "RuntimeEnvironmentVariables": environment,
                    },
                },
            },
            "InstanceConfiguration": {
                "Cpu": props.cpu.to_string(),
                "Memory": props.memory.to_string(),
                "InstanceRoleArn": instance_role.arn(),
            },
            "NetworkConfiguration": {
                "EgressConfiguration": {
                    "EgressType": "VPC",
                    "VpcConnectorArn": connector.attr("VpcConnectorArn"),
                },
            },
            "AutoScalingConfigurationArn": autoscaling.attr("AutoScalingConfigurationArn"),
        });
        if let Some(path) = &props.health_check_path {
            service_props["HealthCheckConfiguration"] = json!({ "Protocol": "HTTP", "Path": path });
        }
        let service = stack.add(&format!("{}-apprunner-service", id), "AWS::AppRunner::Service", service_props)?;
        stack.apply_removal_policy(&service, RemovalPolicy::Destroy);

        if let Some(email) = &props.notification_email {
            Self::notifications(stack, id, &service, email)?;
        }

        let custom_domain = match &props.custom_domain {
            Some((zone, domain_name)) => Some(Self::custom_domain(stack, id, &service, zone, domain_name)?),
            None => None,
        };

        debug!(service = %props.app_name, cpu = %props.cpu, memory = %props.memory, "Declared App Runner service");

        Ok(Self {
            service_url: service.attr("ServiceUrl"),
            service,
            instance_role,
            custom_domain,
        })
    }

    fn notifications(stack: &mut Stack, id: &str, service: &ResourceRef, email: &str) -> Result<()> {
        let topic = stack.add(
            &format!("{}-apprunner-topic", id),
            "AWS::SNS::Topic",
            json!({ "KmsMasterKeyId": "alias/aws/sns" }),
        )?;
        stack.add(
            &format!("{}-apprunner-topic-policy", id),
            "AWS::SNS::TopicPolicy",
            json!({
                "Topics": [topic.reference()],
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Principal": { "Service": "events.amazonaws.com" },
                        "Action": "sns:Publish",
                        "Resource": topic.reference(),
                    }],
                },
            }),
        )?;
        stack.add(
            &format!("{}-apprunner-sub", id),
            "AWS::SNS::Subscription",
            json!({
                "Protocol": "email",
                "Endpoint": email,
                "TopicArn": topic.reference(),
            }),
        )?;
        stack.add(
            &format!("{}-apprunner-rule", id),
            "AWS::Events::Rule",
            json!({
                "State": "ENABLED",
                "EventPattern": {
                    "source": ["aws.apprunner"],
                    "detail": {
                        "serviceName": [service.attr("ServiceName")],
                        "operationStatus": NOTIFIED_OPERATIONS,
                    },
                },
                "Targets": [{ "Arn": topic.reference(), "Id": "Target0" }],
            }),
        )?;
        Ok(())
    }

    /// Associate `domain_name` with the service and point the zone at it
    ///
    /// An A alias is used where the regional App Runner zone is known, a
    /// CNAME to the service URL otherwise.
    fn custom_domain(
        stack: &mut Stack,
        id: &str,
        service: &ResourceRef,
        zone: &HostedZone,
        domain_name: &str,
    ) -> Result<String> {
        let region = stack.region().to_string();
        let association = stack.add(
            &format!("{}-apprunner-custom-domain", id),
            "Custom::AppRunnerCustomDomain",
            json!({
                "DomainName": domain_name,
                "ServiceArn": service.attr("ServiceArn"),
                "ServiceUrl": service.attr("ServiceUrl"),
                "DNSDomainId": zone.zone_id,
                "EnableWWWSubdomain": false,
            }),
        )?;
        stack.add_dependency(&association, service);

        let record = match app_runner_hosted_zone(&region) {
            Some(target_zone) => alias_record(
                stack,
                &format!("{}-apprunner-arecord-alias", id),
                zone,
                domain_name,
                service.attr("ServiceUrl"),
                json!(target_zone),
            )?,
            None => {
                warn!(region = %region, "No App Runner hosted zone known for region, using a CNAME record");
                cname_record(
                    stack,
                    &format!("{}-apprunner-cname", id),
                    zone,
                    domain_name,
                    service.attr("ServiceUrl"),
                )?
            }
        };
        stack.add_dependency(&association, &record);
        Ok(domain_name.to_string())
    }

    pub fn arn(&self) -> Value {
        self.service.attr("ServiceArn")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props<'a>() -> AppRunnerProps<'a> {
        AppRunnerProps {
            app_name: "dev-REDCap".to_string(),
            repository_uri: json!({ "Fn::ImportValue": "dev-REDCap-BuildImage-RepositoryUri" }),
            tag: "14.0.1".to_string(),
            port: 8080,
            cpu: Cpu::default(),
            memory: Memory::default(),
            environment: BTreeMap::from([("PHP_TIMEZONE".to_string(), json!("UTC"))]),
            auto_deployments_enabled: true,
            access_role_arn: None,
            subnets: vec![json!("subnet-a")],
            security_groups: vec![json!("sg-1")],
            scaling: AppRunnerScaling {
                max_concurrency: 10,
                max_size: 2,
                min_size: 1,
            },
            notification_email: None,
            health_check_path: None,
            custom_domain: None,
        }
    }

    #[test]
    fn test_hosted_zone_table() {
        assert_eq!(app_runner_hosted_zone("us-east-1"), Some("Z01915732ZBZKC8D32TPT"));
        assert_eq!(app_runner_hosted_zone("sa-east-1"), None);
    }

    #[test]
    fn test_size_combinations() {
        assert!(validate_size(Cpu::default(), Memory::default()).is_ok());
        assert!(validate_size("0.25 vCPU".parse().unwrap(), "0.5 GB".parse().unwrap()).is_ok());
        assert!(matches!(
            validate_size("1 vCPU".parse().unwrap(), "8 GB".parse().unwrap()),
            Err(SynthError::UnsupportedSize { backend: "App Runner", .. })
        ));
    }

    #[test]
    fn test_access_role_created_with_fixed_actions() {
        let mut stack = Stack::new("dev-REDCap-Backend", "us-east-1");
        let runner = AppRunner::new(&mut stack, "dev-REDCap-service", &props()).unwrap();
        let service = &stack.resource(&runner.service).unwrap().properties;
        assert_eq!(
            service["SourceConfiguration"]["AuthenticationConfiguration"]["AccessRoleArn"],
            json!({ "Fn::GetAtt": ["devREDCapserviceapprunneraccessRole", "Arn"] })
        );
        assert_eq!(service["InstanceConfiguration"]["Cpu"], "2 vCPU");
        assert_eq!(service["SourceConfiguration"]["ImageRepository"]["ImageConfiguration"]["Port"], "8080");

        let (_, policy) = stack
            .resources_of_type("AWS::IAM::Policy")
            .find(|(id, _)| id.contains("accessRole"))
            .unwrap();
        assert_eq!(policy.properties["PolicyDocument"]["Statement"][0]["Action"], json!(ACCESS_ROLE_ACTIONS));
    }

    #[test]
    fn test_access_role_reused() {
        let mut stack = Stack::new("s", "us-east-1");
        let runner = AppRunner::new(
            &mut stack,
            "svc",
            &AppRunnerProps {
                access_role_arn: Some("arn:aws:iam::123:role/existing".to_string()),
                ..props()
            },
        )
        .unwrap();
        let service = &stack.resource(&runner.service).unwrap().properties;
        assert_eq!(
            service["SourceConfiguration"]["AuthenticationConfiguration"]["AccessRoleArn"],
            "arn:aws:iam::123:role/existing"
        );
        // only the instance role remains
        assert_eq!(stack.resources_of_type("AWS::IAM::Role").count(), 1);
    }

    #[test]
    fn test_notifications_only_with_email() {
        let mut stack = Stack::new("s", "us-east-1");
        AppRunner::new(&mut stack, "svc", &props()).unwrap();
        assert_eq!(stack.resources_of_type("AWS::Events::Rule").count(), 0);

        let mut stack = Stack::new("s", "us-east-1");
        AppRunner::new(
            &mut stack,
            "svc",
            &AppRunnerProps {
                notification_email: Some("ops@example.org".to_string()),
                ..props()
            },
        )
        .unwrap();
        assert_eq!(stack.resources_of_type("AWS::Events::Rule").count(), 1);
        assert_eq!(stack.resources_of_type("AWS::SNS::Subscription").count(), 1);
    }

    #[test]
    fn test_custom_domain_alias_record() {
        let mut stack = Stack::new("s", "eu-west-1");
        let zone = HostedZone::create(&mut stack, "zone", "example.com").unwrap();
        let runner = AppRunner::new(
            &mut stack,
            "svc",
            &AppRunnerProps {
                custom_domain: Some((&zone, "redcap.example.com".to_string())),
                ..props()
            },
        )
        .unwrap();
        assert_eq!(runner.custom_domain.as_deref(), Some("redcap.example.com"));
        let (_, record) = stack.resources_of_type("AWS::Route53::RecordSet").next().unwrap();
        assert_eq!(record.properties["Type"], "A");
        assert_eq!(record.properties["AliasTarget"]["HostedZoneId"], "Z087551914Z2PCAU0QHMW");
    }

    #[test]
    fn test_custom_domain_cname_outside_table() {
        let mut stack = Stack::new("s", "sa-east-1");
        let zone = HostedZone::create(&mut stack, "zone", "example.com").unwrap();
        AppRunner::new(
            &mut stack,
            "svc",
            &AppRunnerProps {
                custom_domain: Some((&zone, "example.com".to_string())),
                ..props()
            },
        )
        .unwrap();
        let (_, record) = stack.resources_of_type("AWS::Route53::RecordSet").next().unwrap();
        assert_eq!(record.properties["Type"], "CNAME");
    }
}
