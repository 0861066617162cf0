//! BuildImage stack: container repository and the image build pipeline
//!
//! The REDCap release comes either from a bucket path (`redCapS3Path`) or from
//! a zip shipped with the build context (`redCapLocalVersion`). The image tag
//! is `deployTag` when set, otherwise the version in the release file name.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::RedcapConfig;
use crate::constructs::codebuild::kms_key;
use crate::constructs::{CodeBuildProject, CodeBuildProps, PolicyStatement};
use crate::error::{Result, SynthError};
use crate::stacks::network::NetworkOutputs;
use crate::stacks::StackContext;
use crate::template::{join, RemovalPolicy, ResourceRef, Stack};

pub const BUILD_CONTEXT_PATH: &str = "containers/redcap-docker-apache";
pub const BUILDSPEC_PATH: &str = "buildspec/redcap-build.yml";
pub const RELEASES_PATH: &str = "packages/REDCap/releases";
pub const LANGUAGES_PATH: &str = "packages/REDCap/languages";

/// Where the REDCap release is read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedcapSource {
    /// `bucket/path/redcap<version>.zip`
    S3Path(String),
    /// `redcap<version>.zip` under the releases directory
    Local(String),
}

impl RedcapSource {
    pub fn from_config(cfg: &RedcapConfig) -> Result<Self> {
        match (&cfg.red_cap_s3_path, &cfg.red_cap_local_version) {
            (Some(_), Some(_)) => Err(SynthError::ConflictingRedcapSource),
            (Some(path), None) => Ok(RedcapSource::S3Path(path.trim_start_matches("s3://").to_string())),
            (None, Some(local)) => {
                let file = if local.ends_with(".zip") {
                    local.clone()
                } else {
                    format!("{}.zip", local)
                };
                Ok(RedcapSource::Local(file))
            }
            (None, None) => Err(SynthError::MissingRedcapSource),
        }
    }

    /// File name carrying the version
    fn file_name(&self) -> &str {
        match self {
            RedcapSource::S3Path(path) => path.rsplit('/').next().unwrap_or(path),
            RedcapSource::Local(file) => file,
        }
    }
}

/// Extract `x.y.z` from the first `redcap<x.y.z>.zip` in `name`
pub fn extract_redcap_tag(name: &str) -> Option<String> {
    let mut rest = name;
    while let Some(start) = rest.find("redcap") {
        let candidate = &rest[start + "redcap".len()..];
        if let Some(end) = candidate.find(".zip") {
            let version = &candidate[..end];
            let parts: Vec<&str> = version.split('.').collect();
            if parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
                return Some(version.to_string());
            }
        }
        rest = candidate;
    }
    None
}

/// `deployTag`, else the release version
pub fn image_tag(cfg: &RedcapConfig, source: &RedcapSource) -> Result<String> {
    if let Some(tag) = cfg.deploy_tag.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        return Ok(tag.to_string());
    }
    extract_redcap_tag(source.file_name()).ok_or_else(|| SynthError::MissingImageTag(source.file_name().to_string()))
}

/// Imported handles of the image repository
#[derive(Debug, Clone)]
pub struct BuildImageOutputs {
    pub repository_uri: Value,
    pub repository_name: Value,
    pub repository_arn: Value,
    pub tag: String,
}

fn repository(stack: &mut Stack, ctx: &StackContext<'_>) -> Result<ResourceRef> {
    let key = kms_key(stack, "redcap-kms-key", "Container image encryption")?;
    let repository = stack.add(
        &ctx.resource_name("ecr"),
        "AWS::ECR::Repository",
        json!({
            "RepositoryName": ctx.resource_name("repository").to_lowercase(),
            "ImageScanningConfiguration": { "ScanOnPush": true },
            "EncryptionConfiguration": { "EncryptionType": "KMS", "KmsKey": key.arn() },
            "EmptyOnDelete": true,
        }),
    )?;
    stack.apply_removal_policy(&repository, RemovalPolicy::Destroy);
    Ok(repository)
}

/// Statements letting a principal pull images from `repository_arn`
pub fn repository_pull(repository_arn: Value) -> PolicyStatement {
    PolicyStatement::allow(
        &["ecr:BatchCheckLayerAvailability", "ecr:GetDownloadUrlForLayer", "ecr:BatchGetImage"],
        vec![repository_arn],
    )
}

fn repository_push(repository_arn: Value) -> PolicyStatement {
    PolicyStatement::allow(
        &[
            "ecr:PutImage",
            "ecr:InitiateLayerUpload",
            "ecr:UploadLayerPart",
            "ecr:CompleteLayerUpload",
        ],
        vec![repository_arn],
    )
}

pub fn build(ctx: &StackContext<'_>, network: &NetworkOutputs) -> Result<(Stack, BuildImageOutputs)> {
    let cfg = ctx.cfg;
    let source = RedcapSource::from_config(cfg)?;
    let tag = image_tag(cfg, &source)?;
    debug!(source = ?source, tag = %tag, "Resolved REDCap release");

    let mut stack = ctx.new_stack("BuildImage");
    let region = stack.region().to_string();

    let (redcap_s3_uri, redcap_s3_arn) = match &source {
        RedcapSource::S3Path(path) => (json!(format!("s3://{}", path)), json!(format!("arn:aws:s3:::{}", path))),
        RedcapSource::Local(file) => {
            let package = stack.add_asset(
                &ctx.resource_name("redcapPackage"),
                &format!("{}/{}", RELEASES_PATH, file),
            );
            let arn = join("", vec![json!("arn:aws:s3:::"), package.bucket(), json!("/"), package.key()]);
            (package.s3_url(), arn)
        }
    };

    let repository = repository(&mut stack, ctx)?;
    let languages = stack.add_asset(&ctx.resource_name("redcapLanguages"), LANGUAGES_PATH);
    let build_context = stack.add_asset("asset", BUILD_CONTEXT_PATH);

    let environment = BTreeMap::from([
        ("ECR_REPOSITORY_URI".to_string(), repository.attr("RepositoryUri")),
        ("IMAGE_TAG".to_string(), json!(tag)),
        ("REDCAP_S3_URI".to_string(), redcap_s3_uri),
        ("LANG_S3_URI".to_string(), languages.s3_url()),
        ("AWS_ACCOUNT_ID".to_string(), ctx.account_id()),
        ("PORT".to_string(), json!(cfg.port().to_string())),
    ]);

    let project = CodeBuildProject::new(
        &mut stack,
        &ctx.resource_name("codeBuildProject"),
        &CodeBuildProps {
            project_name: ctx.resource_name("build"),
            source: build_context.clone(),
            buildspec: BUILDSPEC_PATH.to_string(),
            environment,
            vpc_id: network.vpc_id.clone(),
            subnets: network.private_subnets.clone(),
        },
    )?;

    let asset_bucket_arn = join("", vec![json!("arn:aws:s3:::"), build_context.bucket()]);
    project.add_to_role_policy(
        &mut stack,
        &ctx.resource_name("build-grants"),
        &[
            repository_pull(repository.arn()),
            repository_push(repository.arn()),
            PolicyStatement::allow(
                &["s3:GetObject*", "s3:GetBucket*", "s3:List*"],
                vec![asset_bucket_arn.clone(), join("", vec![asset_bucket_arn, json!("/*")])],
            ),
            PolicyStatement::allow(
                &["ecr:GetAuthorizationToken", "ecr-public:GetAuthorizationToken", "sts:GetServiceBearerToken"],
                vec![json!("*")],
            ),
            PolicyStatement::allow(&["s3:GetObject", "s3:ListBucket"], vec![redcap_s3_arn]),
        ],
    )?;

    let nonce = cfg.rebuild_image.then(|| ctx.options.nonce());
    let build_function = project.add_lambda_trigger(&mut stack, "redcap-build", nonce.as_deref())?;

    stack.add_output(
        "UpdateDeploymentCommand",
        join(
            "",
            vec![
                json!("aws lambda invoke --function-name "),
                build_function.name(),
                json!(format!(" --region {} --profile {} deployLambdaResponse.json", region, cfg.profile)),
            ],
        ),
        Some("Rebuild the REDCap image"),
    );

    let outputs = BuildImageOutputs {
        repository_uri: stack.export("RepositoryUri", repository.attr("RepositoryUri")),
        repository_name: stack.export("RepositoryName", repository.reference()),
        repository_arn: stack.export("RepositoryArn", repository.arn()),
        tag,
    };
    info!(stack = %stack.name(), tag = %outputs.tag, rebuild = cfg.rebuild_image, "Build pipeline planned");
    Ok((stack, outputs))
}
