//! IAM user with a programmatic access key kept in Secrets Manager

use serde_json::{json, Value};

use crate::error::Result;
use crate::template::{join, ResourceRef, Stack};

#[derive(Debug, Clone)]
pub struct AccessUser {
    pub user: ResourceRef,
    pub group: ResourceRef,
    pub access_key: ResourceRef,
    /// Secret holding `AccessKeyId` and `SecretAccessKey`
    pub secret: ResourceRef,
}

impl AccessUser {
    pub fn new(stack: &mut Stack, id: &str, user_name: &str, group_name: &str) -> Result<Self> {
        let user = stack.add(
            &format!("{}-user", id),
            "AWS::IAM::User",
            json!({ "UserName": user_name }),
        )?;
        let group = stack.add(
            &format!("{}-group", id),
            "AWS::IAM::Group",
            json!({ "GroupName": group_name }),
        )?;
        stack.add(
            &format!("{}-membership", id),
            "AWS::IAM::UserToGroupAddition",
            json!({
                "GroupName": group.reference(),
                "Users": [user.reference()],
            }),
        )?;
        let access_key = stack.add(
            &format!("{}-AccessKey", id),
            "AWS::IAM::AccessKey",
            json!({ "UserName": user.reference() }),
        )?;
        let secret = stack.add(
            &format!("{}-Secret", id),
            "AWS::SecretsManager::Secret",
            json!({
                "Description": format!("Access key of {}", user_name),
                "SecretString": join(
                    "",
                    vec![
                        json!("{\"AccessKeyId\":\""),
                        access_key.reference(),
                        json!("\",\"SecretAccessKey\":\""),
                        access_key.attr("SecretAccessKey"),
                        json!("\"}"),
                    ],
                ),
            }),
        )?;
        Ok(Self {
            user,
            group,
            access_key,
            secret,
        })
    }

    pub fn secret_arn(&self) -> Value {
        self.secret.reference()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_joins_group_and_key_is_stored() {
        let mut stack = Stack::new("dev-REDCap-Backend", "us-east-1");
        let access = AccessUser::new(&mut stack, "s3-access", "dev-REDCap-s3-access", "dev-REDCap-groupS3").unwrap();

        let (_, membership) = stack.resources_of_type("AWS::IAM::UserToGroupAddition").next().unwrap();
        assert_eq!(membership.properties["Users"], json!([access.user.reference()]));

        let secret = &stack.resource(&access.secret).unwrap().properties;
        let parts = secret["SecretString"]["Fn::Join"][1].as_array().unwrap();
        assert_eq!(parts[1], access.access_key.reference());
        assert_eq!(parts[3], access.access_key.attr("SecretAccessKey"));
    }
}
