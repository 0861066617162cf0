//! Backend stack: DNS, email, storage, firewall and the REDCap service
//!
//! The stack reads the network, image and database stacks through their
//! exports and wires them into whichever compute backend the stage selects.

pub mod domain;
pub mod service;
pub mod waf_rules;

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::info;

use crate::config::parse_allowed_ips;
use crate::constructs::waf::WafScope;
use crate::constructs::{AccessUser, Bucket, EmailIdentity, Grantee, SesProps, SimpleEmailService, WebAcl, WebAclProps};
use crate::context::ZoneLookup;
use crate::error::{Result, SynthError};
use crate::stacks::build_image::BuildImageOutputs;
use crate::stacks::database::DatabaseOutputs;
use crate::stacks::network::NetworkOutputs;
use crate::stacks::StackContext;
use crate::template::{RemovalPolicy, Stack};

pub use domain::DomainStrategy;
pub use service::{DeployedService, DeploymentTarget, SecretsBundle};

/// Values the temporary server reuses, all readable from other stacks
#[derive(Debug, Clone)]
pub struct BackendOutputs {
    pub environment: BTreeMap<String, Value>,
    pub secrets: SecretsBundle,
    pub service: DeployedService,
}

/// Environment of the REDCap container
fn runner_environment(
    ctx: &StackContext<'_>,
    region: &str,
    database: &DatabaseOutputs,
    db_secret_name: Value,
    bucket_name: Value,
    secrets: &SecretsBundle,
) -> BTreeMap<String, Value> {
    let mut env = BTreeMap::from([
        ("AWS_REGION".to_string(), json!(region)),
        ("S3_BUCKET".to_string(), bucket_name),
        (
            "READ_REPLICA_HOSTNAME".to_string(),
            database.read_replica_hostname.clone().unwrap_or_else(|| json!("")),
        ),
        ("USE_IAM_DB_AUTH".to_string(), json!("true")),
        ("DB_SECRET_NAME".to_string(), db_secret_name),
        ("DB_SECRET_ID".to_string(), secrets.db_secret.clone()),
        ("DB_SALT_SECRET_ID".to_string(), secrets.db_salt.clone()),
        ("SES_CREDENTIALS_SECRET_ID".to_string(), secrets.ses_credentials.clone()),
        ("S3_SECRET_ID".to_string(), secrets.s3_credentials.clone()),
        ("PHP_TIMEZONE".to_string(), json!(ctx.cfg.php_timezone())),
    ]);
    if let Some(email) = ctx.cfg.email() {
        env.insert("SMTP_EMAIL".to_string(), json!(email));
    }
    env
}

pub fn build(
    ctx: &StackContext<'_>,
    lookup: &dyn ZoneLookup,
    network: &NetworkOutputs,
    image: &BuildImageOutputs,
    database: &DatabaseOutputs,
) -> Result<(Stack, BackendOutputs)> {
    let cfg = ctx.cfg;
    let db_secret = database.secret_arn.clone().ok_or(SynthError::MissingDatabaseSecret)?;
    let db_secret_name = database.secret_name.clone().ok_or(SynthError::MissingDatabaseSecret)?;
    let target = DeploymentTarget::select(cfg)?;
    let stage_rules = waf_rules::stage_rules(cfg)?;
    let allowed_ips = parse_allowed_ips(&cfg.allowed_ips)?;

    let mut stack = ctx.new_stack("Backend");
    if stage_rules.cron_token.is_none() && cfg.cron_minutes() > 0 {
        stack.warn("No cronSecret set, cron.php is reachable from any source without a token");
    }
    let region = stack.region().to_string();
    let prefix = ctx.prefix();

    let s3_user = AccessUser::new(
        &mut stack,
        &ctx.resource_name("s3-access"),
        &ctx.resource_name("s3-access"),
        &ctx.resource_name("groupS3"),
    )?;
    let ses_user = AccessUser::new(
        &mut stack,
        &ctx.resource_name("ses-access"),
        &ctx.resource_name("ses-access"),
        &ctx.resource_name("groupSES"),
    )?;

    let strategy = DomainStrategy::from_config(cfg);
    let zone = strategy.apply(&mut stack, &prefix, lookup)?;

    let ses = SimpleEmailService::new(
        &mut stack,
        &ctx.resource_name("redcap-ses"),
        SesProps {
            identity: EmailIdentity::resolve(zone.as_ref(), cfg.email())?,
            group: ses_user.group.clone(),
            user: ses_user.user.clone(),
            transform_credentials: Some(ses_user.secret.clone()),
            bounce_notification_email: cfg.bounce_notification_email.clone(),
        },
    )?;

    let db_salt = stack.add(
        &ctx.resource_name("dbsalt"),
        "AWS::SecretsManager::Secret",
        json!({
            "Description": "REDCap db salt secret, value must be hashed to sha256 before passing it to database.php",
            "GenerateSecretString": { "PasswordLength": 32, "ExcludePunctuation": true },
        }),
    )?;
    stack.apply_removal_policy(
        &db_salt,
        if ctx.production() { RemovalPolicy::Retain } else { RemovalPolicy::Destroy },
    );

    let bucket = Bucket::new(&mut stack, "appBucket", ctx.production())?;
    bucket.grant_read_write(&mut stack, "appBucket-s3-access", &Grantee::Group(s3_user.group.clone()))?;

    let secrets = SecretsBundle {
        db_secret,
        db_salt: db_salt.reference(),
        ses_credentials: ses.smtp_credentials_arn(),
        s3_credentials: s3_user.secret_arn(),
    };
    let environment = runner_environment(ctx, &region, database, db_secret_name.clone(), bucket.name(), &secrets);

    let waf = WebAcl::new(
        &mut stack,
        &ctx.resource_name("appwaf"),
        WebAclProps {
            scope: WafScope::Regional,
            allowed_ips,
            extra_rules: stage_rules.rules,
        },
    )?;

    let deployed = service::deploy(
        &mut stack,
        ctx,
        &target,
        service::ServiceInputs {
            network,
            image,
            database,
            secrets: &secrets,
            zone: zone.as_ref(),
            waf: &waf,
            environment,
            cron_token: stage_rules.cron_token.as_deref(),
        },
    )?;

    let url_key = match target {
        DeploymentTarget::AppRunner(_) => "AppRunnerServiceUrl",
        DeploymentTarget::Ecs(_) => "EcsServiceUrl",
    };
    stack.add_output(url_key, deployed.service_url.clone(), Some("Service endpoint"));
    if let Some(custom_url) = &deployed.custom_url {
        stack.add_output("RedcapCustomUrl", json!(custom_url), Some("Custom domain"));
    }
    if let Some(name_servers) = zone
        .as_ref()
        .filter(|z| z.resource.is_some())
        .and_then(|z| z.name_servers_joined())
    {
        stack.add_output("NameServers", name_servers, Some("Delegate the domain to these name servers"));
    }

    let exported_secrets = SecretsBundle {
        db_secret: secrets.db_secret.clone(),
        db_salt: stack.export("DbSaltSecretArn", secrets.db_salt.clone()),
        ses_credentials: stack.export("SesCredentialsSecretArn", secrets.ses_credentials.clone()),
        s3_credentials: stack.export("S3CredentialsSecretArn", secrets.s3_credentials.clone()),
    };
    let exported_bucket = stack.export("AppBucketName", bucket.name());
    let exported_environment =
        runner_environment(ctx, &region, database, db_secret_name, exported_bucket, &exported_secrets);

    info!(
        stack = %stack.name(),
        domain = strategy.label(),
        backend = deployed.target,
        waf_rules = waf.rules.len(),
        resources = stack.resource_count(),
        "Backend planned"
    );

    Ok((
        stack,
        BackendOutputs {
            environment: exported_environment,
            secrets: exported_secrets,
            service: deployed,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LookupContext;
    use crate::stacks::tests::{context, redcap_config};
    use crate::stacks::{build_image, database, network};

    fn plan(extra: &str, lookups: &LookupContext) -> Result<(Stack, BackendOutputs)> {
        let cfg = redcap_config(extra);
        let ctx = context("dev", &cfg);
        let (_, net) = network::build(&ctx)?;
        let (_, img) = build_image::build(&ctx, &net)?;
        let (_, db) = database::build(&ctx, &net)?;
        build(&ctx, lookups, &net, &img, &db)
    }

    #[test]
    fn test_no_domain_no_email_rejected() {
        let result = plan("", &LookupContext::default());
        assert!(matches!(result, Err(SynthError::MissingEmailIdentity)));
    }

    #[test]
    fn test_unmanaged_domain_without_email_rejected() {
        let result = plan("domain: example.com\nhostInRoute53: false\n", &LookupContext::default());
        assert!(matches!(result, Err(SynthError::MissingEmailIdentity)));
    }

    #[test]
    fn test_app_runner_backend_with_email() {
        let (stack, outputs) = plan(
            "email: admin@example.com\ncronSecret: mysecret\nallowedIps: ['192.0.3.0/24']\n",
            &LookupContext::default(),
        )
        .unwrap();

        assert_eq!(outputs.service.target, "apprunner");
        assert!(stack.output("AppRunnerServiceUrl").is_some());
        assert!(stack.output("RedcapCustomUrl").is_none());
        assert_eq!(stack.resources_of_type("AWS::AppRunner::Service").count(), 1);
        assert_eq!(stack.resources_of_type("AWS::WAFv2::WebACLAssociation").count(), 1);
        assert_eq!(stack.resources_of_type("AWS::Events::Rule").filter(|(_, r)| r.properties.get("ScheduleExpression").is_some()).count(), 1);

        let (_, acl) = stack.resources_of_type("AWS::WAFv2::WebACL").next().unwrap();
        let names: Vec<&str> = acl.properties["Rules"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|r| r["Name"].as_str())
            .collect();
        assert!(names.contains(&"ip-filter"));
        assert!(names.contains(&"cron-execution"));

        let token = crate::signing::cron_token("mysecret").unwrap();
        let (_, destination) = stack.resources_of_type("AWS::Events::ApiDestination").next().unwrap();
        assert!(destination.properties["InvocationEndpoint"]
            .to_string()
            .contains(&format!("/cron.php?secret={}", token)));

        assert_eq!(outputs.environment["USE_IAM_DB_AUTH"], "true");
        assert_eq!(outputs.environment["SMTP_EMAIL"], "admin@example.com");
        assert_eq!(
            outputs.environment["S3_BUCKET"],
            json!({ "Fn::ImportValue": "dev-REDCap-Backend-AppBucketName" })
        );
    }

    #[test]
    fn test_open_cron_endpoint_is_reported() {
        let (stack, _) = plan("email: admin@example.com\n", &LookupContext::default()).unwrap();
        assert_eq!(stack.warnings().len(), 1);
        assert!(stack.warnings()[0].contains("cronSecret"));
        assert_eq!(stack.to_document()["Metadata"]["Warnings"], json!(stack.warnings()));

        let (guarded, _) = plan("email: admin@example.com\ncronSecret: mysecret\n", &LookupContext::default()).unwrap();
        assert!(guarded.warnings().is_empty());
        assert!(guarded.to_document()["Metadata"].get("Warnings").is_none());

        let (unscheduled, _) = plan("email: admin@example.com\ncronMinutes: 0\n", &LookupContext::default()).unwrap();
        assert!(unscheduled.warnings().is_empty());
    }

    #[test]
    fn test_new_zone_outputs_name_servers_and_custom_url() {
        let (stack, outputs) = plan(
            "domain: example.com\nsubdomain: redcap\nhostInRoute53: true\n",
            &LookupContext::default(),
        )
        .unwrap();
        assert_eq!(outputs.service.custom_url.as_deref(), Some("https://redcap.example.com"));
        assert!(stack.output("NameServers").is_some());
        assert_eq!(stack.resources_of_type("AWS::SES::EmailIdentity").count(), 1);
    }

    #[test]
    fn test_ecs_backend_with_imported_certificate() {
        let (stack, outputs) = plan(
            "email: admin@example.com\necs:\n  certificateArn: arn:aws:acm:us-east-1:123:certificate/abc\n",
            &LookupContext::default(),
        )
        .unwrap();
        assert_eq!(outputs.service.target, "ecs");
        assert!(stack.output("EcsServiceUrl").is_some());
        assert_eq!(stack.resources_of_type("AWS::ECS::Service").count(), 1);
        assert_eq!(stack.resources_of_type("AWS::AppRunner::Service").count(), 0);
        assert!(stack.resources_of_type("AWS::WAFv2::WebACLAssociation").any(|(id, _)| id == "ecsredcap"));
    }

    #[test]
    fn test_ecs_without_certificate_rejected() {
        let result = plan("email: admin@example.com\necs: {}\n", &LookupContext::default());
        assert!(matches!(result, Err(SynthError::MissingCertificate)));
    }

    #[test]
    fn test_missing_database_secret() {
        let result = plan(
            "email: admin@example.com\ndb:\n  dbSnapshotId: snap-1\n  generateSnapshotCredentials: false\n",
            &LookupContext::default(),
        );
        assert!(matches!(result, Err(SynthError::MissingDatabaseSecret)));
    }

    #[test]
    fn test_backend_grants_secrets_and_db_connect() {
        let (stack, _) = plan("email: admin@example.com\n", &LookupContext::default()).unwrap();
        let (_, policy) = stack
            .resources_of_type("AWS::IAM::Policy")
            .find(|(id, _)| *id == "apprunnersecretsgrant")
            .unwrap();
        let statements = policy.properties["PolicyDocument"]["Statement"].as_array().unwrap();
        assert_eq!(statements.len(), 5);
        assert!(statements[4]["Resource"].to_string().contains("redcap_user"));
    }
}
