//! IAM roles, policies and grants

use serde_json::{json, Value};

use crate::error::Result;
use crate::template::{sub, sub_with, ResourceRef, Stack};

/// One `Allow` statement
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyStatement {
    pub actions: Vec<String>,
    pub resources: Vec<Value>,
}

impl PolicyStatement {
    pub fn allow(actions: &[&str], resources: Vec<Value>) -> Self {
        Self {
            actions: actions.iter().map(|a| a.to_string()).collect(),
            resources,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "Effect": "Allow",
            "Action": self.actions,
            "Resource": self.resources,
        })
    }

    /// Read access to a Secrets Manager secret
    pub fn secret_read(secret_arn: Value) -> Self {
        Self::allow(
            &["secretsmanager:GetSecretValue", "secretsmanager:DescribeSecret"],
            vec![secret_arn],
        )
    }

    /// IAM database authentication for one database user
    pub fn db_connect(cluster_resource_id: Value, db_user: &str) -> Self {
        Self::allow(
            &["rds-db:connect"],
            vec![sub_with(
                &format!(
                    "arn:${{AWS::Partition}}:rds-db:${{AWS::Region}}:${{AWS::AccountId}}:dbuser:${{ClusterResourceId}}/{}",
                    db_user
                ),
                &[("ClusterResourceId", cluster_resource_id)],
            )],
        )
    }
}

/// Something a policy can be attached to
#[derive(Debug, Clone, PartialEq)]
pub enum Grantee {
    Role(ResourceRef),
    User(ResourceRef),
    Group(ResourceRef),
}

impl Grantee {
    fn attachment(&self) -> (&'static str, Value) {
        match self {
            Grantee::Role(r) => ("Roles", json!([r.reference()])),
            Grantee::User(r) => ("Users", json!([r.reference()])),
            Grantee::Group(r) => ("Groups", json!([r.reference()])),
        }
    }
}

/// Role assumable by an AWS service principal
pub fn service_role(
    stack: &mut Stack,
    id: &str,
    service: &str,
    managed_policies: &[&str],
) -> Result<ResourceRef> {
    let mut props = json!({
        "AssumeRolePolicyDocument": {
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": service },
                "Action": "sts:AssumeRole",
            }],
        },
    });
    if !managed_policies.is_empty() {
        props["ManagedPolicyArns"] = managed_policies
            .iter()
            .map(|name| sub(&format!("arn:${{AWS::Partition}}:iam::aws:policy/{}", name)))
            .collect::<Vec<_>>()
            .into();
    }
    stack.add(id, "AWS::IAM::Role", props)
}

/// Attach an inline policy to a grantee
pub fn grant(
    stack: &mut Stack,
    id: &str,
    grantee: &Grantee,
    statements: &[PolicyStatement],
) -> Result<ResourceRef> {
    let (key, targets) = grantee.attachment();
    let mut props = json!({
        "PolicyName": crate::template::logical_id(id),
        "PolicyDocument": {
            "Version": "2012-10-17",
            "Statement": statements.iter().map(PolicyStatement::to_json).collect::<Vec<_>>(),
        },
    });
    props[key] = targets;
    stack.add(id, "AWS::IAM::Policy", props)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_connect_scoped_to_user() {
        let statement = PolicyStatement::db_connect(json!({ "Fn::ImportValue": "db-ResourceId" }), "redcap_user");
        let resource = &statement.resources[0]["Fn::Sub"];
        assert!(resource[0].as_str().unwrap().ends_with(":dbuser:${ClusterResourceId}/redcap_user"));
        assert_eq!(resource[1]["ClusterResourceId"], json!({ "Fn::ImportValue": "db-ResourceId" }));
    }

    #[test]
    fn test_grant_to_role() {
        let mut stack = Stack::new("s", "us-east-1");
        let role = service_role(&mut stack, "task-role", "ecs-tasks.amazonaws.com", &[]).unwrap();
        let policy = grant(
            &mut stack,
            "task-role-secrets",
            &Grantee::Role(role.clone()),
            &[PolicyStatement::secret_read(json!("arn:secret"))],
        )
        .unwrap();
        let props = &stack.resource(&policy).unwrap().properties;
        assert_eq!(props["Roles"], json!([role.reference()]));
        assert_eq!(
            props["PolicyDocument"]["Statement"][0]["Action"],
            json!(["secretsmanager:GetSecretValue", "secretsmanager:DescribeSecret"])
        );
    }

    #[test]
    fn test_managed_policies() {
        let mut stack = Stack::new("s", "us-east-1");
        let role = service_role(
            &mut stack,
            "instance-role",
            "ec2.amazonaws.com",
            &["AmazonSSMManagedInstanceCore"],
        )
        .unwrap();
        let props = &stack.resource(&role).unwrap().properties;
        assert_eq!(
            props["ManagedPolicyArns"][0],
            json!({ "Fn::Sub": "arn:${AWS::Partition}:iam::aws:policy/AmazonSSMManagedInstanceCore" })
        );
    }
}
