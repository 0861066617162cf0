//! EC2Server stack: a temporary instance running the REDCap image
//!
//! The instance gets the backend environment and secret grants, and a state
//! machine deletes the whole stack once `ec2StackDuration` has elapsed. Every
//! resource is destroyed with the stack.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::info;

use crate::config::Ec2ServerConfig;
use crate::constructs::iam::{grant, service_role, Grantee};
use crate::constructs::{Function, FunctionProps, PolicyStatement};
use crate::error::Result;
use crate::stacks::backend::BackendOutputs;
use crate::stacks::build_image::{repository_pull, BuildImageOutputs};
use crate::stacks::database::DatabaseOutputs;
use crate::stacks::network::NetworkOutputs;
use crate::stacks::StackContext;
use crate::template::{join, sub, RemovalPolicy, Stack};

pub const PROFILE_PATH: &str = "/etc/profile.d/cdk_variables.sh";
pub const FORWARDED_PORT: u16 = 8081;
const AL2023_AMI: &str = "{{resolve:ssm:/aws/service/ami-amazon-linux-latest/al2023-ami-kernel-default-x86_64}}";

/// Variables passed from the login profile into the container
const DOCKER_ENV: &[&str] = &[
    "DB_SECRET_ID",
    "DB_SALT_SECRET_ID",
    "DB_SECRET_NAME",
    "S3_BUCKET",
    "S3_SECRET_ID",
    "SES_CREDENTIALS_SECRET_ID",
    "PHP_TIMEZONE",
    "SMTP_EMAIL",
];

/// Boot script: install docker, export the environment, run the image
fn user_data(ctx: &StackContext<'_>, region: &str, image_uri: Value, environment: &BTreeMap<String, Value>) -> Value {
    let mut parts = vec![json!(format!(
        "#!/bin/bash\nsudo dnf update -y\nsudo dnf install -y docker\nsudo service docker start\nsudo usermod -a -G docker ec2-user\naws ecr get-login-password --region {} | docker login --username AWS --password-stdin ",
        region
    ))];
    parts.push(ctx.account_id());
    parts.push(json!(format!(".dkr.ecr.{}.amazonaws.com\n", region)));

    parts.push(json!(format!("cat > {} <<'EOF'\n", PROFILE_PATH)));
    for (key, value) in environment {
        parts.push(json!(format!("export {}=\"", key)));
        parts.push(value.clone());
        parts.push(json!("\"\n"));
    }
    parts.push(json!(format!("EOF\nchmod +x {}\n", PROFILE_PATH)));

    let docker_env: String = DOCKER_ENV.iter().map(|key| format!(" -e {}=${}", key, key)).collect();
    parts.push(json!("docker pull "));
    parts.push(image_uri.clone());
    parts.push(json!(format!(
        "\nrunuser -l ec2-user -c 'docker run --rm -d --sig-proxy=false -p {port}:{port} -e AWS_REGION={region} -e USE_CERT=1 -e USE_IAM_DB_AUTH=true{env} ",
        port = FORWARDED_PORT,
        region = region,
        env = docker_env
    )));
    parts.push(image_uri);
    parts.push(json!("'\n"));

    json!({ "Fn::Base64": join("", parts) })
}

/// Wait, then delete the stack, retrying the delete three times
fn teardown_definition(stack_name: &str, wait_secs: u64) -> Value {
    json!({
        "StartAt": "wait",
        "States": {
            "wait": { "Type": "Wait", "Seconds": wait_secs, "Next": "deleteStack" },
            "deleteStack": {
                "Type": "Task",
                "Resource": "arn:aws:states:::aws-sdk:cloudformation:deleteStack",
                "Parameters": { "StackName": stack_name },
                "Retry": [{ "ErrorEquals": ["States.ALL"], "MaxAttempts": 3 }],
                "End": true,
            },
        },
    })
}

pub fn build(
    ctx: &StackContext<'_>,
    settings: &Ec2ServerConfig,
    network: &NetworkOutputs,
    image: &BuildImageOutputs,
    database: &DatabaseOutputs,
    backend: &BackendOutputs,
) -> Result<Stack> {
    let mut stack = ctx.new_stack("EC2Server");
    stack.set_default_removal_policy(Some(RemovalPolicy::Destroy));
    let region = stack.region().to_string();
    let stack_name = stack.name().to_string();

    let role = service_role(
        &mut stack,
        "EC2ServerInstance-role",
        "ec2.amazonaws.com",
        &["AmazonSSMManagedInstanceCore"],
    )?;
    let mut statements = backend.secrets.grant_statements(database.cluster_resource_id.clone());
    statements.push(repository_pull(image.repository_arn.clone()));
    statements.push(PolicyStatement::allow(&["ecr:GetAuthorizationToken"], vec![json!("*")]));
    grant(&mut stack, "EC2ServerInstance-role-policy", &Grantee::Role(role.clone()), &statements)?;

    let profile = stack.add(
        "EC2ServerInstance-profile",
        "AWS::IAM::InstanceProfile",
        json!({ "Roles": [role.reference()] }),
    )?;

    let image_uri = join(":", vec![image.repository_uri.clone(), json!(image.tag)]);
    let instance = stack.add(
        "EC2ServerInstance",
        "AWS::EC2::Instance",
        json!({
            "InstanceType": "t3.medium",
            "ImageId": AL2023_AMI,
            "SubnetId": network.private_subnets.first().cloned().unwrap_or(Value::Null),
            "SecurityGroupIds": [database.allowed_security_group_id],
            "IamInstanceProfile": profile.reference(),
            "Monitoring": true,
            "BlockDeviceMappings": [{
                "DeviceName": "/dev/sda1",
                "Ebs": {
                    "VolumeSize": 20,
                    "VolumeType": "gp2",
                    "Encrypted": true,
                    "DeleteOnTermination": true,
                },
            }],
            "UserData": user_data(ctx, &region, image_uri, &backend.environment),
        }),
    )?;

    let log_group = stack.add("deleteStackSfnLogGroup", "AWS::Logs::LogGroup", json!({}))?;
    let sfn_role = service_role(&mut stack, "deleteStackStateMachine-role", "states.amazonaws.com", &[])?;
    grant(
        &mut stack,
        "deleteStackStateMachine-role-policy",
        &Grantee::Role(sfn_role.clone()),
        &[
            PolicyStatement::allow(
                &["cloudformation:DeleteStack"],
                vec![sub(&format!(
                    "arn:${{AWS::Partition}}:cloudformation:${{AWS::Region}}:${{AWS::AccountId}}:stack/{}/*",
                    stack_name
                ))],
            ),
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
                    "xray:PutTraceSegments",
                    "xray:PutTelemetryRecords",
                ],
                vec![json!("*")],
            ),
        ],
    )?;
    let state_machine = stack.add(
        "deleteStackStateMachine",
        "AWS::StepFunctions::StateMachine",
        json!({
            "RoleArn": sfn_role.arn(),
            "DefinitionString": teardown_definition(&stack_name, settings.ec2_stack_duration.as_secs()).to_string(),
            "LoggingConfiguration": {
                "Level": "ALL",
                "IncludeExecutionData": true,
                "Destinations": [{ "CloudWatchLogsLogGroup": { "LogGroupArn": log_group.arn() } }],
            },
            "TracingConfiguration": { "Enabled": true },
        }),
    )?;

    let handler = Function::new(
        &mut stack,
        "stateMachineExecHandler",
        FunctionProps::new("stateMachineExec")
            .env("SFN_ARN", state_machine.reference())
            .allow(PolicyStatement::allow(&["states:StartExecution"], vec![state_machine.reference()])),
    )?;
    let trigger = handler.trigger(&mut stack, "terminateEC2Trigger", 60, None)?;
    stack.add_dependency(&trigger, &instance);

    stack.add_output(
        "ssmPortForward",
        join(
            "",
            vec![
                json!("aws ssm start-session --target "),
                instance.reference(),
                json!(format!(
                    " --document-name AWS-StartPortForwardingSession --parameters '{{\"portNumber\":[\"{port}\"],\"localPortNumber\":[\"{port}\"]}}' --region {} --profile {}",
                    region,
                    ctx.cfg.profile,
                    port = FORWARDED_PORT
                )),
            ],
        ),
        Some("Forward the REDCap port of the temporary server"),
    );

    info!(
        stack = %stack.name(),
        lifetime_secs = settings.ec2_stack_duration.as_secs(),
        "Temporary server planned"
    );
    Ok(stack)
}
