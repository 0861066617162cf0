//! CodeBuild project building the REDCap container image

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::constructs::function::{Function, FunctionProps};
use crate::constructs::iam::{grant, service_role, Grantee, PolicyStatement};
use crate::error::Result;
use crate::template::{join, sub, Asset, RemovalPolicy, ResourceRef, Stack};

/// Customer managed key with rotation, destroyed with the stack
pub fn kms_key(stack: &mut Stack, id: &str, description: &str) -> Result<ResourceRef> {
    let key = stack.add(
        id,
        "AWS::KMS::Key",
        json!({
            "Description": description,
            "EnableKeyRotation": true,
            "KeyPolicy": {
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": { "AWS": sub("arn:${AWS::Partition}:iam::${AWS::AccountId}:root") },
                    "Action": "kms:*",
                    "Resource": "*",
                }],
            },
        }),
    )?;
    stack.apply_removal_policy(&key, RemovalPolicy::Destroy);
    Ok(key)
}

#[derive(Debug, Clone)]
pub struct CodeBuildProps {
    pub project_name: String,
    pub source: Asset,
    pub buildspec: String,
    pub environment: BTreeMap<String, Value>,
    pub vpc_id: Value,
    pub subnets: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct CodeBuildProject {
    pub project: ResourceRef,
    pub role: ResourceRef,
    pub key: ResourceRef,
}

impl CodeBuildProject {
    pub fn new(stack: &mut Stack, id: &str, props: &CodeBuildProps) -> Result<Self> {
        let key = kms_key(stack, &format!("{}-CodeBuildProjectKey", id), "CodeBuild artifacts")?;
        let role = service_role(stack, &format!("{}-role", id), "codebuild.amazonaws.com", &[])?;
        let security_group = stack.add(
            &format!("{}-sg", id),
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": format!("Build job {}", props.project_name),
                "VpcId": props.vpc_id,
                "SecurityGroupEgress": [{ "IpProtocol": "-1", "CidrIp": "0.0.0.0/0" }],
            }),
        )?;

        let environment: Vec<Value> = props
            .environment
            .iter()
            .map(|(name, value)| json!({ "Name": name, "Type": "PLAINTEXT", "Value": value }))
            .collect();

        let project = stack.add(
            &format!("{}-buildJob", id),
            "AWS::CodeBuild::Project",
            json!({
                "Name": props.project_name,
                "ServiceRole": role.arn(),
                "EncryptionKey": key.arn(),
                "Source": {
                    "Type": "S3",
                    "Location": join("/", vec![props.source.bucket(), props.source.key()]),
                    "BuildSpec": props.buildspec,
                },
                "Artifacts": { "Type": "NO_ARTIFACTS" },
                "Cache": { "Type": "LOCAL", "Modes": ["LOCAL_DOCKER_LAYER_CACHE"] },
                "Environment": {
                    "Type": "LINUX_CONTAINER",
                    "ComputeType": "BUILD_GENERAL1_SMALL",
                    "Image": "aws/codebuild/standard:7.0",
                    "PrivilegedMode": true,
                    "EnvironmentVariables": environment,
                },
                "VpcConfig": {
                    "VpcId": props.vpc_id,
                    "Subnets": props.subnets,
                    "SecurityGroupIds": [security_group.attr("GroupId")],
                },
            }),
        )?;

        let build_logs = PolicyStatement::allow(
            &["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"],
            vec![sub(&format!(
                "arn:${{AWS::Partition}}:logs:${{AWS::Region}}:${{AWS::AccountId}}:log-group:/aws/codebuild/{}:*",
                props.project_name
            ))],
        );
        let network = PolicyStatement::allow(
            &[
                "ec2:CreateNetworkInterface",
                "ec2:DescribeNetworkInterfaces",
                "ec2:DeleteNetworkInterface",
                "ec2:DescribeSubnets",
                "ec2:DescribeSecurityGroups",
                "ec2:DescribeDhcpOptions",
                "ec2:DescribeVpcs",
                "ec2:CreateNetworkInterfacePermission",
            ],
            vec![json!("*")],
        );
        let encryption = PolicyStatement::allow(
            &["kms:Decrypt", "kms:Encrypt", "kms:ReEncrypt*", "kms:GenerateDataKey*"],
            vec![key.arn()],
        );
        let policy = grant(
            stack,
            &format!("{}-role-policy", id),
            &Grantee::Role(role.clone()),
            &[build_logs, network, encryption],
        )?;
        stack.add_dependency(&project, &policy);

        Ok(Self { project, role, key })
    }

    pub fn add_to_role_policy(&self, stack: &mut Stack, id: &str, statements: &[PolicyStatement]) -> Result<ResourceRef> {
        grant(stack, id, &Grantee::Role(self.role.clone()), statements)
    }

    /// Function that starts a build and waits for it, run once per deployment
    ///
    /// Returns the function so its name can be surfaced to operators.
    pub fn add_lambda_trigger(&self, stack: &mut Stack, name: &str, nonce: Option<&str>) -> Result<Function> {
        let function = Function::new(
            stack,
            &format!("{}-lambda-trigger", name),
            FunctionProps::new("startProjectBuild")
                .env("CODEBUILD_PROJECT_NAME", self.project.reference())
                .allow(PolicyStatement::allow(
                    &[
                        "codebuild:StartBuild",
                        "codebuild:ListBuildsForProject",
                        "codebuild:BatchGetBuilds",
                    ],
                    vec![self.project.arn()],
                ))
                .timeout_secs(600),
        )?;
        let trigger = function.trigger(stack, &format!("{}-trigger", name), 600, nonce)?;
        stack.add_dependency(&trigger, &self.project);
        Ok(function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(stack: &mut Stack) -> CodeBuildProject {
        let source = stack.add_asset("asset", "containers/redcap-docker-apache");
        CodeBuildProject::new(
            stack,
            "dev-REDCap-codeBuildProject",
            &CodeBuildProps {
                project_name: "dev-REDCap-build".to_string(),
                source,
                buildspec: "version: 0.2".to_string(),
                environment: BTreeMap::from([("IMAGE_TAG".to_string(), json!("14.0.1"))]),
                vpc_id: json!("vpc-1"),
                subnets: vec![json!("subnet-a")],
            },
        )
        .unwrap()
    }

    #[test]
    fn test_privileged_project_with_cache() {
        let mut stack = Stack::new("dev-REDCap-BuildImage", "us-east-1");
        let project = project(&mut stack);
        let props = &stack.resource(&project.project).unwrap().properties;
        assert_eq!(props["Environment"]["PrivilegedMode"], true);
        assert_eq!(props["Cache"]["Modes"], json!(["LOCAL_DOCKER_LAYER_CACHE"]));
        assert_eq!(
            props["Environment"]["EnvironmentVariables"][0],
            json!({ "Name": "IMAGE_TAG", "Type": "PLAINTEXT", "Value": "14.0.1" })
        );
        assert_eq!(props["EncryptionKey"], project.key.arn());
    }

    #[test]
    fn test_lambda_trigger_runs_after_project() {
        let mut stack = Stack::new("dev-REDCap-BuildImage", "us-east-1");
        let project = project(&mut stack);
        let function = project.add_lambda_trigger(&mut stack, "redcap-build", Some("1")).unwrap();
        assert_eq!(function.name(), json!({ "Ref": "redcapbuildlambdatrigger" }));
        let (_, trigger) = stack.resources_of_type("Custom::Trigger").next().unwrap();
        assert!(trigger.depends_on.contains(&project.project.logical_id().to_string()));
        assert_eq!(trigger.properties["Nonce"], "1");
    }
}
