//! Encrypted S3 buckets

use serde_json::{json, Value};

use crate::constructs::iam::{grant, Grantee, PolicyStatement};
use crate::error::Result;
use crate::template::{join, RemovalPolicy, ResourceRef, Stack};

#[derive(Debug, Clone)]
pub struct Bucket {
    pub bucket: ResourceRef,
}

impl Bucket {
    /// SSE-S3, public access blocked, TLS enforced, tiering after 90/180 days
    ///
    /// Production buckets are versioned and retained; every other stage
    /// destroys them with the stack.
    pub fn new(stack: &mut Stack, id: &str, production: bool) -> Result<Self> {
        Self::with_policy(stack, id, production, |_| Vec::new())
    }

    /// Like [`Bucket::new`] with extra bucket policy statements built from the bucket ARN
    pub fn with_policy(
        stack: &mut Stack,
        id: &str,
        production: bool,
        extra_statements: impl FnOnce(&Value) -> Vec<Value>,
    ) -> Result<Self> {
        let bucket = stack.add(
            id,
            "AWS::S3::Bucket",
            json!({
                "BucketEncryption": {
                    "ServerSideEncryptionConfiguration": [{
                        "ServerSideEncryptionByDefault": { "SSEAlgorithm": "AES256" },
                    }],
                },
                "PublicAccessBlockConfiguration": {
                    "BlockPublicAcls": true,
                    "BlockPublicPolicy": true,
                    "IgnorePublicAcls": true,
                    "RestrictPublicBuckets": true,
                },
                "VersioningConfiguration": { "Status": if production { "Enabled" } else { "Suspended" } },
                "LoggingConfiguration": { "LogFilePrefix": "/logs/bucket-access/" },
                "LifecycleConfiguration": {
                    "Rules": [{
                        "Status": "Enabled",
                        "Transitions": [
                            { "StorageClass": "STANDARD_IA", "TransitionInDays": 90 },
                            { "StorageClass": "INTELLIGENT_TIERING", "TransitionInDays": 180 },
                        ],
                    }],
                },
                "Tags": [{ "Key": "aws-cdk:auto-delete-objects", "Value": (!production).to_string() }],
            }),
        )?;
        stack.apply_removal_policy(
            &bucket,
            if production { RemovalPolicy::Retain } else { RemovalPolicy::Destroy },
        );

        let mut statements = vec![json!({
            "Effect": "Deny",
            "Principal": { "AWS": "*" },
            "Action": "s3:*",
            "Condition": { "Bool": { "aws:SecureTransport": "false" } },
            "Resource": [bucket.arn(), join("", vec![bucket.arn(), json!("/*")])],
        })];
        statements.extend(extra_statements(&bucket.arn()));
        stack.add(
            &format!("{}-policy", id),
            "AWS::S3::BucketPolicy",
            json!({
                "Bucket": bucket.reference(),
                "PolicyDocument": { "Version": "2012-10-17", "Statement": statements },
            }),
        )?;
        Ok(Self { bucket })
    }

    pub fn name(&self) -> Value {
        self.bucket.reference()
    }

    pub fn grant_read_write(&self, stack: &mut Stack, id: &str, grantee: &Grantee) -> Result<ResourceRef> {
        grant(
            stack,
            id,
            grantee,
            &[PolicyStatement::allow(
                &[
                    "s3:GetObject*",
                    "s3:GetBucket*",
                    "s3:List*",
                    "s3:DeleteObject*",
                    "s3:PutObject",
                    "s3:PutObjectLegalHold",
                    "s3:PutObjectRetention",
                    "s3:PutObjectTagging",
                    "s3:PutObjectVersionTagging",
                    "s3:Abort*",
                ],
                vec![self.bucket.arn(), join("", vec![self.bucket.arn(), json!("/*")])],
            )],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prod_bucket_is_retained_and_versioned() {
        let mut stack = Stack::new("prod-REDCap-Backend", "us-east-1");
        let bucket = Bucket::new(&mut stack, "appBucket", true).unwrap();
        let resource = stack.resource(&bucket.bucket).unwrap();
        assert_eq!(resource.deletion_policy, Some(RemovalPolicy::Retain));
        assert_eq!(resource.properties["VersioningConfiguration"]["Status"], "Enabled");
    }

    #[test]
    fn test_bucket_enforces_tls() {
        let mut stack = Stack::new("dev-REDCap-Backend", "us-east-1");
        let bucket = Bucket::new(&mut stack, "appBucket", false).unwrap();
        assert_eq!(stack.resource(&bucket.bucket).unwrap().deletion_policy, Some(RemovalPolicy::Destroy));
        let (_, policy) = stack.resources_of_type("AWS::S3::BucketPolicy").next().unwrap();
        assert_eq!(
            policy.properties["PolicyDocument"]["Statement"][0]["Condition"]["Bool"]["aws:SecureTransport"],
            "false"
        );
    }
}
