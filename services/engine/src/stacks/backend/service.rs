//! Compute backend selection and wiring
//!
//! Exactly one of App Runner or ECS Fargate runs REDCap. Whichever is chosen
//! gets the same secrets, one web ACL association and the cron scheduler.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::{Cpu, EcsConfig, Memory, RedcapConfig};
use crate::constructs::iam::{grant, service_role, Grantee, PolicyStatement};
use crate::constructs::route53::{certificate, https_url, CertificateSource};
use crate::constructs::waf::CRON_PATH;
use crate::constructs::{AppRunner, AppRunnerProps, AppRunnerScaling, EcsFargate, EcsFargateProps, HostedZone, WebAcl};
use crate::error::{Result, SynthError};
use crate::stacks::backend::waf_rules::CRON_SECRET_PARAM;
use crate::stacks::build_image::BuildImageOutputs;
use crate::stacks::database::DatabaseOutputs;
use crate::stacks::network::NetworkOutputs;
use crate::stacks::StackContext;
use crate::template::{join, ResourceRef, Stack};

/// Database user the backends authenticate as through IAM
pub const DB_IAM_USER: &str = "redcap_user";

/// The compute backend of a stage
#[derive(Debug, Clone, PartialEq)]
pub enum DeploymentTarget<'a> {
    AppRunner(AppRunnerScaling),
    Ecs(&'a EcsConfig),
}

impl<'a> DeploymentTarget<'a> {
    /// ECS when an `ecs:` block is present, App Runner otherwise
    pub fn select(cfg: &'a RedcapConfig) -> Result<Self> {
        match &cfg.ecs {
            Some(ecs) => {
                let app_runner_keys = cfg.app_runner_keys();
                if !app_runner_keys.is_empty() {
                    return Err(SynthError::ConflictingBackends { app_runner_keys });
                }
                Ok(DeploymentTarget::Ecs(ecs))
            }
            None => Ok(DeploymentTarget::AppRunner(AppRunnerScaling {
                max_concurrency: cfg.app_runner_concurrency(),
                max_size: cfg.app_runner_max_size(),
                min_size: cfg.app_runner_min_size(),
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeploymentTarget::AppRunner(_) => "apprunner",
            DeploymentTarget::Ecs(_) => "ecs",
        }
    }

    /// Prefix of the scheduler resources
    fn cron_prefix(&self) -> &'static str {
        match self {
            DeploymentTarget::AppRunner(_) => "apprunner-service",
            DeploymentTarget::Ecs(_) => "ecs-service",
        }
    }

    fn waf_association_id(&self) -> &'static str {
        match self {
            DeploymentTarget::AppRunner(_) => "apprunner-redcap",
            DeploymentTarget::Ecs(_) => "ecs-redcap",
        }
    }
}

/// Secrets every backend can read
#[derive(Debug, Clone, PartialEq)]
pub struct SecretsBundle {
    pub db_secret: Value,
    pub db_salt: Value,
    pub ses_credentials: Value,
    pub s3_credentials: Value,
}

impl SecretsBundle {
    pub fn arns(&self) -> Vec<Value> {
        vec![
            self.db_secret.clone(),
            self.db_salt.clone(),
            self.ses_credentials.clone(),
            self.s3_credentials.clone(),
        ]
    }

    /// Read access to every secret plus IAM connect as [`DB_IAM_USER`]
    pub fn grant_statements(&self, cluster_resource_id: Value) -> Vec<PolicyStatement> {
        let mut statements: Vec<PolicyStatement> = self.arns().into_iter().map(PolicyStatement::secret_read).collect();
        statements.push(PolicyStatement::db_connect(cluster_resource_id, DB_IAM_USER));
        statements
    }
}

/// Everything the selected backend is wired to
pub struct ServiceInputs<'a> {
    pub network: &'a NetworkOutputs,
    pub image: &'a BuildImageOutputs,
    pub database: &'a DatabaseOutputs,
    pub secrets: &'a SecretsBundle,
    pub zone: Option<&'a HostedZone>,
    pub waf: &'a WebAcl,
    pub environment: BTreeMap<String, Value>,
    pub cron_token: Option<&'a str>,
}

/// The deployed backend and its reachable URLs
#[derive(Debug, Clone)]
pub struct DeployedService {
    pub target: &'static str,
    /// `https://` URL of the service endpoint
    pub service_url: Value,
    /// `https://` URL of the custom domain, when one is managed
    pub custom_url: Option<String>,
    pub cron_rule: Option<ResourceRef>,
}

fn default_size(cfg: &RedcapConfig, ecs: Option<&EcsConfig>) -> (Cpu, Memory) {
    let cpu = ecs.and_then(|e| e.cpu).or(cfg.cpu).unwrap_or_default();
    let memory = ecs.and_then(|e| e.memory).or(cfg.memory).unwrap_or_default();
    (cpu, memory)
}

pub fn deploy(
    stack: &mut Stack,
    ctx: &StackContext<'_>,
    target: &DeploymentTarget<'_>,
    inputs: ServiceInputs<'_>,
) -> Result<DeployedService> {
    let cfg = ctx.cfg;
    let custom_domain = inputs.zone.and(cfg.custom_domain_name());

    let (grantee, resource_arn, service_url, custom_url, cron_base) = match target {
        DeploymentTarget::AppRunner(scaling) => {
            let (cpu, memory) = default_size(cfg, None);
            let runner = AppRunner::new(
                stack,
                &ctx.resource_name("service"),
                &AppRunnerProps {
                    app_name: ctx.prefix(),
                    repository_uri: inputs.image.repository_uri.clone(),
                    tag: inputs.image.tag.clone(),
                    port: cfg.port(),
                    cpu,
                    memory,
                    environment: inputs.environment,
                    auto_deployments_enabled: cfg.auto_deployments_enabled,
                    access_role_arn: cfg.app_runner_access_role_arn.clone(),
                    subnets: inputs.network.private_subnets.clone(),
                    security_groups: vec![inputs.database.allowed_security_group_id.clone()],
                    scaling: *scaling,
                    notification_email: cfg.email().map(str::to_string),
                    health_check_path: None,
                    custom_domain: inputs.zone.zip(custom_domain.clone()),
                },
            )?;
            let service_url = https_url(runner.service_url.clone());
            let custom_url = runner.custom_domain.as_ref().map(|d| format!("https://{}", d));
            let cron_base = service_url.clone();
            (Grantee::Role(runner.instance_role.clone()), runner.arn(), service_url, custom_url, cron_base)
        }
        DeploymentTarget::Ecs(ecs) => {
            let certificate_source = match (inputs.zone, &custom_domain, &ecs.certificate_arn) {
                (Some(zone), Some(domain_name), _) => CertificateSource::Dns {
                    zone,
                    domain_name: domain_name.clone(),
                },
                (_, _, Some(arn)) => CertificateSource::Imported(arn.clone()),
                _ => return Err(SynthError::MissingCertificate),
            };
            let certificate_arn = certificate(stack, &ctx.resource_name("certificate"), certificate_source)?;

            let (cpu, memory) = default_size(cfg, Some(*ecs));
            let fargate = EcsFargate::new(
                stack,
                &ctx.resource_name("ecs-service"),
                &EcsFargateProps {
                    stage: ctx.stage.to_string(),
                    app_name: ctx.prefix(),
                    production: ctx.production(),
                    vpc_id: inputs.network.vpc_id.clone(),
                    public_subnets: inputs.network.public_subnets.clone(),
                    private_subnets: inputs.network.private_subnets.clone(),
                    port: cfg.port(),
                    cpu,
                    memory,
                    scaling: ecs.scaling.clone(),
                    log_retention: ecs.log_retention,
                    environment: inputs.environment,
                    repository_uri: inputs.image.repository_uri.clone(),
                    repository_name: inputs.image.repository_name.clone(),
                    tag: inputs.image.tag.clone(),
                    certificate_arn,
                    db_security_group_id: inputs.database.cluster_security_group_id.clone(),
                    db_port: inputs.database.port,
                    container_insights: true,
                    zone: inputs.zone.zip(custom_domain.clone()),
                },
            )?;
            let service_url = https_url(fargate.url.clone());
            let custom_url = fargate.custom_domain.as_ref().map(|d| format!("https://{}", d));
            // The listener certificate only covers the custom domain
            let cron_base = match &custom_url {
                Some(url) => json!(url),
                None => service_url.clone(),
            };
            (
                Grantee::Role(fargate.task_role.clone()),
                fargate.load_balancer.reference(),
                service_url,
                custom_url,
                cron_base,
            )
        }
    };

    grant(
        stack,
        &format!("{}-secrets-grant", target.name()),
        &grantee,
        &inputs.secrets.grant_statements(inputs.database.cluster_resource_id.clone()),
    )?;
    inputs.waf.associate(stack, target.waf_association_id(), resource_arn)?;

    let cron_rule = schedule_cron(stack, target.cron_prefix(), cron_base, inputs.cron_token, cfg.cron_minutes())?;

    info!(
        target = target.name(),
        custom_domain = custom_url.as_deref().unwrap_or("-"),
        cron = cron_rule.is_some(),
        "Compute backend planned"
    );

    Ok(DeployedService {
        target: target.name(),
        service_url,
        custom_url,
        cron_rule,
    })
}

/// `rate(N minutes)`
pub fn rate_expression(minutes: u32) -> String {
    if minutes == 1 {
        "rate(1 minute)".to_string()
    } else {
        format!("rate({} minutes)", minutes)
    }
}

/// `{base}/cron.php`, with `?secret=<token>` when a token is set
pub fn cron_endpoint(base_url: Value, token: Option<&str>) -> Value {
    let suffix = match token {
        Some(token) => format!("/{}?{}={}", CRON_PATH, CRON_SECRET_PARAM, token),
        None => format!("/{}", CRON_PATH),
    };
    match base_url {
        Value::String(base) => json!(format!("{}{}", base, suffix)),
        other => join("", vec![other, json!(suffix)]),
    }
}

/// Recurring GET of the cron endpoint; `minutes == 0` schedules nothing
pub fn schedule_cron(
    stack: &mut Stack,
    prefix: &str,
    base_url: Value,
    token: Option<&str>,
    minutes: u32,
) -> Result<Option<ResourceRef>> {
    if minutes == 0 {
        warn!("cronMinutes is 0, the REDCap cron endpoint is not scheduled");
        return Ok(None);
    }

    // REDCap does not authenticate the cron call; the connection requires
    // credentials anyway and the token rule guards the endpoint
    let connection = stack.add(
        "redcap-connection",
        "AWS::Events::Connection",
        json!({
            "AuthorizationType": "BASIC",
            "AuthParameters": {
                "BasicAuthParameters": { "Username": "redcap-cron-user", "Password": "nopassword" },
            },
            "Description": "Connection to REDCap cronjob",
        }),
    )?;
    let destination = stack.add(
        &format!("{}-destination", prefix),
        "AWS::Events::ApiDestination",
        json!({
            "ConnectionArn": connection.arn(),
            "InvocationEndpoint": cron_endpoint(base_url, token),
            "HttpMethod": "GET",
            "Description": format!("Call cron on REDCap deployment {}", prefix),
        }),
    )?;
    let role = service_role(stack, &format!("{}-cron-role", prefix), "events.amazonaws.com", &[])?;
    grant(
        stack,
        &format!("{}-cron-role-policy", prefix),
        &Grantee::Role(role.clone()),
        &[PolicyStatement::allow(&["events:InvokeApiDestination"], vec![destination.arn()])],
    )?;
    let rule = stack.add(
        &format!("{}-cron", prefix),
        "AWS::Events::Rule",
        json!({
            "ScheduleExpression": rate_expression(minutes),
            "State": "ENABLED",
            "Targets": [{
                "Arn": destination.arn(),
                "Id": "Target0",
                "RoleArn": role.arn(),
            }],
        }),
    )?;
    Ok(Some(rule))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stacks::tests::redcap_config;

    #[test]
    fn test_app_runner_is_default() {
        let cfg = redcap_config("");
        let target = DeploymentTarget::select(&cfg).unwrap();
        assert_eq!(
            target,
            DeploymentTarget::AppRunner(AppRunnerScaling {
                max_concurrency: 10,
                max_size: 2,
                min_size: 1
            })
        );
    }

    #[test]
    fn test_ecs_block_selects_ecs() {
        let cfg = redcap_config("ecs:\n  certificateArn: arn:aws:acm:us-east-1:123:certificate/abc\n");
        assert_eq!(DeploymentTarget::select(&cfg).unwrap().name(), "ecs");
    }

    #[test]
    fn test_both_backends_rejected() {
        let mut cfg = redcap_config("ecs: {}\n");
        cfg.app_runner_max_size = Some(4);
        assert!(matches!(
            DeploymentTarget::select(&cfg),
            Err(SynthError::ConflictingBackends { .. })
        ));
    }

    #[test]
    fn test_rate_expression() {
        assert_eq!(rate_expression(1), "rate(1 minute)");
        assert_eq!(rate_expression(5), "rate(5 minutes)");
    }

    #[test]
    fn test_cron_endpoint_carries_token() {
        assert_eq!(
            cron_endpoint(json!("https://redcap.example.com"), Some("abc")),
            json!("https://redcap.example.com/cron.php?secret=abc")
        );
        let joined = cron_endpoint(json!({ "Fn::GetAtt": ["svc", "ServiceUrl"] }), None);
        assert_eq!(joined["Fn::Join"][1][1], "/cron.php");
    }

    #[test]
    fn test_scheduler_disabled_at_zero() {
        let mut stack = Stack::new("dev-REDCap-Backend", "us-east-1");
        let rule = schedule_cron(&mut stack, "apprunner-service", json!("https://x"), Some("t"), 0).unwrap();
        assert!(rule.is_none());
        assert_eq!(stack.resource_count(), 0);
    }

    #[test]
    fn test_scheduler_rule() {
        let mut stack = Stack::new("dev-REDCap-Backend", "us-east-1");
        let rule = schedule_cron(&mut stack, "ecs-service", json!("https://x"), Some("t"), 5)
            .unwrap()
            .unwrap();
        let rule = stack.resource(&rule).unwrap();
        assert_eq!(rule.properties["ScheduleExpression"], "rate(5 minutes)");
        let (_, destination) = stack.resources_of_type("AWS::Events::ApiDestination").next().unwrap();
        assert_eq!(destination.properties["InvocationEndpoint"], "https://x/cron.php?secret=t");
        assert_eq!(destination.properties["HttpMethod"], "GET");
    }

    #[test]
    fn test_secrets_bundle_grants() {
        let bundle = SecretsBundle {
            db_secret: json!("db"),
            db_salt: json!("salt"),
            ses_credentials: json!("ses"),
            s3_credentials: json!("s3"),
        };
        let statements = bundle.grant_statements(json!("cluster-id"));
        assert_eq!(statements.len(), 5);
        assert_eq!(statements[4].actions, vec!["rds-db:connect".to_string()]);
    }
}
