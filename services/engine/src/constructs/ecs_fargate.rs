//! ECS on Fargate behind an HTTPS load balancer
//!
//! The cluster-orchestration backend. The load balancer terminates TLS on
//! 443 with a certificate that must exist before anything is declared; image
//! pushes to the repository force a new deployment through a state machine.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::debug;

use crate::config::{Cpu, EcsScaling, LogRetention, Memory};
use crate::constructs::bucket::Bucket;
use crate::constructs::iam::{grant, service_role, Grantee, PolicyStatement};
use crate::constructs::route53::{alias_record, HostedZone};
use crate::error::{Result, SynthError};
use crate::template::{join, RemovalPolicy, ResourceRef, Stack};

/// Listener policy for TLS 1.2 and 1.3
pub const RECOMMENDED_TLS_POLICY: &str = "ELBSecurityPolicy-TLS13-1-2-2021-06";

const ALB_IDLE_TIMEOUT_SECS: u32 = 4000;

/// Fargate task sizes: CPU units, memory range in MiB and its step
const SIZES: &[(u32, u32, u32, u32)] = &[
    (256, 512, 2048, 512),
    (512, 1024, 4096, 1024),
    (1024, 2048, 8192, 1024),
    (2048, 4096, 16384, 1024),
    (4096, 8192, 30720, 1024),
    (8192, 16384, 61440, 4096),
    (16384, 32768, 122880, 8192),
];

pub fn validate_size(cpu: Cpu, memory: Memory) -> Result<()> {
    let mib = memory.mib();
    let supported = SIZES.iter().any(|&(units, min, max, step)| {
        // 0.25 vCPU also accepts the 0.5 GB size
        let in_steps = mib >= min && mib <= max && (mib - min) % step == 0;
        units == cpu.units() && (in_steps || (units == 256 && mib == 512))
    });
    if supported {
        Ok(())
    } else {
        Err(SynthError::UnsupportedSize {
            backend: "ECS Fargate",
            cpu: cpu.to_string(),
            memory: memory.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EcsFargateProps<'a> {
    pub stage: String,
    pub app_name: String,
    pub production: bool,
    pub vpc_id: Value,
    pub public_subnets: Vec<Value>,
    pub private_subnets: Vec<Value>,
    pub port: u16,
    pub cpu: Cpu,
    pub memory: Memory,
    pub scaling: EcsScaling,
    pub log_retention: LogRetention,
    pub environment: BTreeMap<String, Value>,
    pub repository_uri: Value,
    pub repository_name: Value,
    pub tag: String,
    pub certificate_arn: Value,
    /// Database security group opened to the tasks on `db_port`
    pub db_security_group_id: Value,
    pub db_port: u16,
    pub container_insights: bool,
    pub zone: Option<(&'a HostedZone, String)>,
}

#[derive(Debug, Clone)]
pub struct EcsFargate {
    pub cluster: ResourceRef,
    pub service: ResourceRef,
    pub task_role: ResourceRef,
    pub load_balancer: ResourceRef,
    pub security_group: ResourceRef,
    /// Load balancer DNS name
    pub url: Value,
    pub custom_domain: Option<String>,
}

impl EcsFargate {
    pub fn new(stack: &mut Stack, id: &str, props: &EcsFargateProps<'_>) -> Result<Self> {
        validate_size(props.cpu, props.memory)?;
        let region = stack.region().to_string();
        if props.scaling.min_containers > props.scaling.max_containers {
            return Err(SynthError::invalid(
                "ecs.scaling",
                "minContainers must not exceed maxContainers",
            ));
        }

        let log_bucket = Bucket::with_policy(stack, &format!("{}-albLogBucket", id), props.production, |arn| {
            vec![json!({
                "Effect": "Allow",
                "Principal": { "Service": "logdelivery.elasticloadbalancing.amazonaws.com" },
                "Action": "s3:PutObject",
                "Resource": join("", vec![arn.clone(), json!("/*")]),
            })]
        })?;

        let ecs_sg = stack.add(
            &format!("{}-redcap-ecs-service", id),
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": "REDCap ECS tasks",
                "VpcId": props.vpc_id,
                "SecurityGroupEgress": [{ "IpProtocol": "-1", "CidrIp": "0.0.0.0/0" }],
            }),
        )?;
        stack.add(
            &format!("{}-aurora-ingress", id),
            "AWS::EC2::SecurityGroupIngress",
            json!({
                "GroupId": props.db_security_group_id,
                "SourceSecurityGroupId": ecs_sg.attr("GroupId"),
                "IpProtocol": "tcp",
                "FromPort": props.db_port,
                "ToPort": props.db_port,
            }),
        )?;

        let alb_sg = stack.add(
            &format!("{}-alb-sg", id),
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": "REDCap load balancer",
                "VpcId": props.vpc_id,
                "SecurityGroupIngress": [{
                    "CidrIp": "0.0.0.0/0",
                    "Description": "Allow traffic for HTTPS :443",
                    "FromPort": 443,
                    "ToPort": 443,
                    "IpProtocol": "tcp",
                }],
                "SecurityGroupEgress": [{
                    "DestinationSecurityGroupId": ecs_sg.attr("GroupId"),
                    "FromPort": props.port,
                    "ToPort": props.port,
                    "IpProtocol": "tcp",
                }],
            }),
        )?;
        stack.add(
            &format!("{}-alb-to-ecs", id),
            "AWS::EC2::SecurityGroupIngress",
            json!({
                "GroupId": ecs_sg.attr("GroupId"),
                "SourceSecurityGroupId": alb_sg.attr("GroupId"),
                "IpProtocol": "tcp",
                "FromPort": props.port,
                "ToPort": props.port,
            }),
        )?;

        let mut cluster_props = json!({});
        if props.container_insights {
            cluster_props["ClusterSettings"] = json!([{ "Name": "containerInsights", "Value": "enabled" }]);
        }
        let cluster = stack.add(&format!("{}-cluster", id), "AWS::ECS::Cluster", cluster_props)?;

        let mut log_group_props = json!({});
        if let Some(days) = props.log_retention.days() {
            log_group_props["RetentionInDays"] = json!(days);
        }
        let log_group = stack.add(&format!("{}-log-group", id), "AWS::Logs::LogGroup", log_group_props)?;

        let execution_role = service_role(
            stack,
            &format!("{}-execution-role", id),
            "ecs-tasks.amazonaws.com",
            &["service-role/AmazonECSTaskExecutionRolePolicy"],
        )?;
        let task_role = service_role(stack, &format!("{}-task-role", id), "ecs-tasks.amazonaws.com", &[])?;

        let environment: Vec<Value> = props
            .environment
            .iter()
            .map(|(name, value)| json!({ "Name": name, "Value": value }))
            .collect();
        let task_definition = stack.add(
            &format!("{}-task-definition", id),
            "AWS::ECS::TaskDefinition",
            json!({
                "Family": format!("{}-redcap", props.app_name),
                "RequiresCompatibilities": ["FARGATE"],
                "NetworkMode": "awsvpc",
                "Cpu": props.cpu.units().to_string(),
                "Memory": props.memory.mib().to_string(),
                "ExecutionRoleArn": execution_role.arn(),
                "TaskRoleArn": task_role.arn(),
                "ContainerDefinitions": [{
                    "Name": "redcap",
                    "Essential": true,
                    "Image": join(":", vec![props.repository_uri.clone(), json!(props.tag)]),
                    "PortMappings": [{ "ContainerPort": props.port, "Protocol": "tcp" }],
                    "Environment": environment,
                    "LogConfiguration": {
                        "LogDriver": "awslogs",
                        "Options": {
                            "awslogs-group": log_group.reference(),
                            "awslogs-region": region,
                            "awslogs-stream-prefix": "redcap",
                        },
                    },
                }],
            }),
        )?;

        let load_balancer = stack.add(
            &format!("{}-alb", id),
            "AWS::ElasticLoadBalancingV2::LoadBalancer",
            json!({
                "Type": "application",
                "Scheme": "internet-facing",
                "Subnets": props.public_subnets,
                "SecurityGroups": [alb_sg.attr("GroupId")],
                "LoadBalancerAttributes": [
                    { "Key": "idle_timeout.timeout_seconds", "Value": ALB_IDLE_TIMEOUT_SECS.to_string() },
                    { "Key": "access_logs.s3.enabled", "Value": "true" },
                    { "Key": "access_logs.s3.bucket", "Value": log_bucket.name() },
                    { "Key": "access_logs.s3.prefix", "Value": format!("{}-redcap-alb-logs", props.stage) },
                ],
            }),
        )?;
        let target_group = stack.add(
            &format!("{}-target-group", id),
            "AWS::ElasticLoadBalancingV2::TargetGroup",
            json!({
                "Port": props.port,
                "Protocol": "HTTP",
                "TargetType": "ip",
                "VpcId": props.vpc_id,
                "HealthCheckPath": "/",
                "Matcher": { "HttpCode": "200-399" },
            }),
        )?;
        let listener = stack.add(
            &format!("{}-listener", id),
            "AWS::ElasticLoadBalancingV2::Listener",
            json!({
                "LoadBalancerArn": load_balancer.reference(),
                "Port": 443,
                "Protocol": "HTTPS",
                "SslPolicy": RECOMMENDED_TLS_POLICY,
                "Certificates": [{ "CertificateArn": props.certificate_arn }],
                "DefaultActions": [{ "Type": "forward", "TargetGroupArn": target_group.reference() }],
            }),
        )?;

        let service = stack.add(
            &format!("{}-service", id),
            "AWS::ECS::Service",
            json!({
                "Cluster": cluster.reference(),
                "TaskDefinition": task_definition.reference(),
                "LaunchType": "FARGATE",
                "DesiredCount": props.scaling.min_containers,
                "DeploymentConfiguration": {
                    "DeploymentCircuitBreaker": { "Enable": true, "Rollback": true },
                    "MaximumPercent": 200,
                    "MinimumHealthyPercent": 50,
                },
                "NetworkConfiguration": {
                    "AwsvpcConfiguration": {
                        "AssignPublicIp": "DISABLED",
                        "Subnets": props.private_subnets,
                        "SecurityGroups": [ecs_sg.attr("GroupId")],
                    },
                },
                "LoadBalancers": [{
                    "ContainerName": "redcap",
                    "ContainerPort": props.port,
                    "TargetGroupArn": target_group.reference(),
                }],
            }),
        )?;
        stack.add_dependency(&service, &listener);

        Self::autoscaling(stack, id, props, &cluster, &service, &load_balancer, &target_group)?;

        let custom_domain = match &props.zone {
            Some((zone, domain_name)) => {
                alias_record(
                    stack,
                    &format!("{}-alb-a-record", id),
                    zone,
                    domain_name,
                    load_balancer.attr("DNSName"),
                    load_balancer.attr("CanonicalHostedZoneID"),
                )?;
                Some(domain_name.clone())
            }
            None => None,
        };

        Self::redeploy_on_push(stack, id, props, &cluster, &service)?;

        debug!(service = %props.app_name, cpu = %props.cpu, memory = %props.memory, "Declared ECS Fargate service");

        Ok(Self {
            url: load_balancer.attr("DNSName"),
            cluster,
            service,
            task_role,
            load_balancer,
            security_group: ecs_sg,
            custom_domain,
        })
    }

    fn autoscaling(
        stack: &mut Stack,
        id: &str,
        props: &EcsFargateProps<'_>,
        cluster: &ResourceRef,
        service: &ResourceRef,
        load_balancer: &ResourceRef,
        target_group: &ResourceRef,
    ) -> Result<()> {
        let target = stack.add(
            &format!("{}-scalable-target", id),
            "AWS::ApplicationAutoScaling::ScalableTarget",
            json!({
                "ServiceNamespace": "ecs",
                "ScalableDimension": "ecs:service:DesiredCount",
                "ResourceId": join("/", vec![json!("service"), cluster.reference(), service.attr("Name")]),
                "MinCapacity": props.scaling.min_containers,
                "MaxCapacity": props.scaling.max_containers,
            }),
        )?;
        if let Some(cpu) = props.scaling.cpu_utilization {
            stack.add(
                &format!("{}-cpu-scaling", id),
                "AWS::ApplicationAutoScaling::ScalingPolicy",
                json!({
                    "PolicyName": format!("{}-cpu", props.app_name),
                    "PolicyType": "TargetTrackingScaling",
                    "ScalingTargetId": target.reference(),
                    "TargetTrackingScalingPolicyConfiguration": {
                        "TargetValue": cpu,
                        "PredefinedMetricSpecification": { "PredefinedMetricType": "ECSServiceAverageCPUUtilization" },
                    },
                }),
            )?;
        }
        if let Some(requests) = props.scaling.requests_per_container {
            stack.add(
                &format!("{}-request-scaling", id),
                "AWS::ApplicationAutoScaling::ScalingPolicy",
                json!({
                    "PolicyName": format!("{}-requests", props.app_name),
                    "PolicyType": "TargetTrackingScaling",
                    "ScalingTargetId": target.reference(),
                    "TargetTrackingScalingPolicyConfiguration": {
                        "TargetValue": requests,
                        "PredefinedMetricSpecification": {
                            "PredefinedMetricType": "ALBRequestCountPerTarget",
                            "ResourceLabel": join(
                                "/",
                                vec![load_balancer.attr("LoadBalancerFullName"), target_group.attr("TargetGroupFullName")],
                            ),
                        },
                    },
                }),
            )?;
        }
        Ok(())
    }

    fn redeploy_on_push(
        stack: &mut Stack,
        id: &str,
        props: &EcsFargateProps<'_>,
        cluster: &ResourceRef,
        service: &ResourceRef,
    ) -> Result<()> {
        let log_group = stack.add(&format!("{}-sfnLogGroup", id), "AWS::Logs::LogGroup", json!({}))?;
        stack.apply_removal_policy(&log_group, RemovalPolicy::Destroy);

        let role = service_role(stack, &format!("{}-ecrStateMachine-role", id), "states.amazonaws.com", &[])?;
        grant(
            stack,
            &format!("{}-ecrStateMachine-policy", id),
            &Grantee::Role(role.clone()),
            &[
                PolicyStatement::allow(&["ecs:UpdateService"], vec![service.reference()]),
                PolicyStatement::allow(
                    &[
                        "logs:CreateLogDelivery",
                        "logs:GetLogDelivery",
                        "logs:UpdateLogDelivery",
                        "logs:DeleteLogDelivery",
                        "logs:ListLogDeliveries",
                        "logs:PutResourcePolicy",
                        "logs:DescribeResourcePolicies",
                        "logs:DescribeLogGroups",
                    ],
                    vec![json!("*")],
                ),
                PolicyStatement::allow(
                    &["xray:PutTraceSegments", "xray:PutTelemetryRecords", "xray:GetSamplingRules", "xray:GetSamplingTargets"],
                    vec![json!("*")],
                ),
            ],
        )?;

        let definition = json!({
            "StartAt": format!("{}-ecsUpdate", id),
            "States": {
                format!("{}-ecsUpdate", id): {
                    "Type": "Task",
                    "Resource": "arn:aws:states:::aws-sdk:ecs:updateService",
                    "Parameters": {
                        "Service": "${ServiceName}",
                        "Cluster": "${ClusterName}",
                        "ForceNewDeployment": true,
                    },
                    "End": true,
                },
            },
        });
        let state_machine = stack.add(
            &format!("{}-ecrStateMachine", id),
            "AWS::StepFunctions::StateMachine",
            json!({
                "RoleArn": role.arn(),
                "DefinitionString": definition.to_string(),
                "DefinitionSubstitutions": {
                    "ServiceName": service.attr("Name"),
                    "ClusterName": cluster.reference(),
                },
                "LoggingConfiguration": {
                    "Level": "ALL",
                    "IncludeExecutionData": false,
                    "Destinations": [{ "CloudWatchLogsLogGroup": { "LogGroupArn": log_group.arn() } }],
                },
                "TracingConfiguration": { "Enabled": true },
            }),
        )?;

        let events_role = service_role(stack, &format!("{}-ecrUpdateRule-role", id), "events.amazonaws.com", &[])?;
        grant(
            stack,
            &format!("{}-ecrUpdateRule-policy", id),
            &Grantee::Role(events_role.clone()),
            &[PolicyStatement::allow(&["states:StartExecution"], vec![state_machine.reference()])],
        )?;
        stack.add(
            &format!("{}-ecrUpdateRule", id),
            "AWS::Events::Rule",
            json!({
                "State": "ENABLED",
                "EventPattern": {
                    "source": ["aws.ecr"],
                    "detail": {
                        "action-type": ["PUSH"],
                        "repository-name": [props.repository_name],
                    },
                },
                "Targets": [{
                    "Arn": state_machine.reference(),
                    "Id": "Target0",
                    "RoleArn": events_role.arn(),
                }],
            }),
        )?;
        Ok(())
    }
}
