//! Lambda functions and deploy-time triggers

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::constructs::iam::{grant, service_role, Grantee, PolicyStatement};
use crate::error::Result;
use crate::template::{ResourceRef, Stack};

/// Directory holding the function sources, shipped as one asset per function
pub const FUNCTIONS_PATH: &str = "packages/functions/src";

#[derive(Debug, Clone)]
pub struct FunctionProps {
    /// Source file name without extension, e.g. `startProjectBuild`
    pub source: String,
    pub environment: BTreeMap<String, Value>,
    pub statements: Vec<PolicyStatement>,
    pub timeout_secs: u32,
}

impl FunctionProps {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            environment: BTreeMap::new(),
            statements: Vec::new(),
            timeout_secs: 60,
        }
    }

    pub fn env(mut self, name: &str, value: Value) -> Self {
        self.environment.insert(name.to_string(), value);
        self
    }

    pub fn allow(mut self, statement: PolicyStatement) -> Self {
        self.statements.push(statement);
        self
    }

    pub fn timeout_secs(mut self, secs: u32) -> Self {
        self.timeout_secs = secs;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub function: ResourceRef,
    pub role: ResourceRef,
}

impl Function {
    pub fn new(stack: &mut Stack, id: &str, props: FunctionProps) -> Result<Self> {
        let role = service_role(
            stack,
            &format!("{}-role", id),
            "lambda.amazonaws.com",
            &["service-role/AWSLambdaBasicExecutionRole"],
        )?;
        let policy = if props.statements.is_empty() {
            None
        } else {
            Some(grant(
                stack,
                &format!("{}-role-policy", id),
                &Grantee::Role(role.clone()),
                &props.statements,
            )?)
        };

        let asset = stack.add_asset(&format!("{}-code", id), &format!("{}/{}.ts", FUNCTIONS_PATH, props.source));
        let mut function_props = json!({
            "Runtime": "nodejs18.x",
            "Handler": "index.handler",
            "Code": { "S3Bucket": asset.bucket(), "S3Key": asset.key() },
            "Role": role.arn(),
            "Timeout": props.timeout_secs,
            "MemorySize": 1024,
        });
        if !props.environment.is_empty() {
            function_props["Environment"] = json!({ "Variables": props.environment });
        }
        let function = stack.add(id, "AWS::Lambda::Function", function_props)?;
        if let Some(policy) = &policy {
            stack.add_dependency(&function, policy);
        }
        Ok(Self { function, role })
    }

    pub fn name(&self) -> Value {
        self.function.reference()
    }

    pub fn arn(&self) -> Value {
        self.function.arn()
    }

    /// Invoke the function once the stack is deployed
    ///
    /// A `nonce` forces a new invocation on every deployment that changes it.
    pub fn trigger(&self, stack: &mut Stack, id: &str, timeout_secs: u32, nonce: Option<&str>) -> Result<ResourceRef> {
        let mut props = json!({
            "HandlerArn": self.arn(),
            "InvocationType": "RequestResponse",
            "Timeout": (timeout_secs * 1000).to_string(),
        });
        if let Some(nonce) = nonce {
            props["Nonce"] = json!(nonce);
        }
        let trigger = stack.add(id, "Custom::Trigger", props)?;
        stack.add_dependency(&trigger, &self.function);
        Ok(trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_with_policy_and_env() {
        let mut stack = Stack::new("s", "us-east-1");
        let function = Function::new(
            &mut stack,
            "redcap-build-lambda-trigger",
            FunctionProps::new("startProjectBuild")
                .env("CODEBUILD_PROJECT_NAME", json!({ "Ref": "project" }))
                .allow(PolicyStatement::allow(&["codebuild:StartBuild"], vec![json!("arn:project")]))
                .timeout_secs(600),
        )
        .unwrap();

        let resource = stack.resource(&function.function).unwrap();
        assert_eq!(resource.properties["Timeout"], 600);
        assert_eq!(
            resource.properties["Environment"]["Variables"]["CODEBUILD_PROJECT_NAME"],
            json!({ "Ref": "project" })
        );
        assert_eq!(resource.depends_on, vec!["redcapbuildlambdatriggerrolepolicy"]);
        assert_eq!(stack.assets()[0].path, "packages/functions/src/startProjectBuild.ts");
    }

    #[test]
    fn test_trigger_nonce() {
        let mut stack = Stack::new("s", "us-east-1");
        let function = Function::new(&mut stack, "fn", FunctionProps::new("stateMachineExec")).unwrap();
        let once = function.trigger(&mut stack, "once", 60, None).unwrap();
        let again = function.trigger(&mut stack, "again", 60, Some("1700000000")).unwrap();
        assert!(stack.resource(&once).unwrap().properties.get("Nonce").is_none());
        assert_eq!(stack.resource(&again).unwrap().properties["Nonce"], "1700000000");
        assert_eq!(stack.resource(&again).unwrap().properties["Timeout"], "60000");
    }
}
