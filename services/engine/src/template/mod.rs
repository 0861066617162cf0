//! Deployment plan documents
//!
//! A [`Stack`] collects resources, parameters and outputs and renders them as a
//! CloudFormation-shaped JSON document. Resources are addressed through
//! [`ResourceRef`] handles; values crossing stack boundaries go through
//! [`Stack::export`] and come back as `Fn::ImportValue` references.

pub mod intrinsics;

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Result, SynthError};

pub use intrinsics::{get_azs, import_value, join, select, split, sub, sub_with};

/// How a resource is treated when it leaves the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemovalPolicy {
    #[serde(rename = "Delete")]
    Destroy,
    Retain,
    Snapshot,
}

/// Intent of a synthesis run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SynthMode {
    #[default]
    Deploy,
    Dev,
    Remove,
}

impl std::fmt::Display for SynthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SynthMode::Deploy => write!(f, "deploy"),
            SynthMode::Dev => write!(f, "dev"),
            SynthMode::Remove => write!(f, "remove"),
        }
    }
}

impl RemovalPolicy {
    /// App-wide default for resources without an explicit policy
    ///
    /// The `dev` stage (or dev mode) destroys everything; `prod` retains when
    /// deploying. Other combinations keep per-resource defaults.
    pub fn default_for(stage: &str, mode: SynthMode) -> Option<Self> {
        if stage == "dev" || mode == SynthMode::Dev {
            Some(RemovalPolicy::Destroy)
        } else if stage == "prod" && mode == SynthMode::Deploy {
            Some(RemovalPolicy::Retain)
        } else {
            None
        }
    }
}

/// Handle to a resource declared in a stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    logical_id: String,
}

impl ResourceRef {
    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    /// `{"Ref": ...}`
    pub fn reference(&self) -> Value {
        json!({ "Ref": self.logical_id })
    }

    /// `{"Fn::GetAtt": [..., name]}`
    pub fn attr(&self, name: &str) -> Value {
        json!({ "Fn::GetAtt": [self.logical_id, name] })
    }

    pub fn arn(&self) -> Value {
        self.attr("Arn")
    }
}

/// One declared resource
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Properties", skip_serializing_if = "Value::is_null")]
    pub properties: Value,
    #[serde(rename = "DependsOn", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(rename = "DeletionPolicy", skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<RemovalPolicy>,
    #[serde(rename = "UpdateReplacePolicy", skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<RemovalPolicy>,
}

/// A stack output, optionally exported for other stacks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Output {
    #[serde(rename = "Value")]
    pub value: Value,
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "Export", skip_serializing_if = "Option::is_none")]
    pub export: Option<Value>,
}

/// A file or directory shipped with the plan (function code, build context)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Asset {
    pub id: String,
    pub path: String,
    #[serde(skip)]
    bucket_parameter: String,
    #[serde(skip)]
    key_parameter: String,
}

impl Asset {
    pub fn bucket(&self) -> Value {
        json!({ "Ref": self.bucket_parameter })
    }

    pub fn key(&self) -> Value {
        json!({ "Ref": self.key_parameter })
    }

    /// `s3://bucket/key`
    pub fn s3_url(&self) -> Value {
        join("", vec![json!("s3://"), self.bucket(), json!("/"), self.key()])
    }
}

/// Keep ASCII alphanumerics only, the way logical ids are derived from
/// construct names
pub fn logical_id(name: &str) -> String {
    name.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// A deployable unit of resources
#[derive(Debug, Clone)]
pub struct Stack {
    name: String,
    region: String,
    description: Option<String>,
    resources: BTreeMap<String, Resource>,
    parameters: BTreeMap<String, Value>,
    outputs: BTreeMap<String, Output>,
    assets: Vec<Asset>,
    tags: BTreeMap<String, String>,
    default_removal_policy: Option<RemovalPolicy>,
    warnings: Vec<String>,
}

impl Stack {
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            description: None,
            resources: BTreeMap::new(),
            parameters: BTreeMap::new(),
            outputs: BTreeMap::new(),
            assets: Vec::new(),
            tags: BTreeMap::new(),
            default_removal_policy: None,
            warnings: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Records a deployment concern that does not stop synthesis
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(stack = %self.name, "{}", message);
        self.warnings.push(message);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn set_default_removal_policy(&mut self, policy: Option<RemovalPolicy>) {
        self.default_removal_policy = policy;
    }

    /// Declare a resource; `name` is reduced to a logical id
    pub fn add(&mut self, name: &str, kind: &str, properties: Value) -> Result<ResourceRef> {
        let id = logical_id(name);
        if id.is_empty() || self.resources.contains_key(&id) {
            return Err(SynthError::DuplicateLogicalId {
                stack: self.name.clone(),
                logical_id: id,
            });
        }
        debug!(stack = %self.name, logical_id = %id, kind = %kind, "Declared resource");
        self.resources.insert(
            id.clone(),
            Resource {
                kind: kind.to_string(),
                properties,
                depends_on: Vec::new(),
                deletion_policy: None,
                update_replace_policy: None,
            },
        );
        Ok(ResourceRef { logical_id: id })
    }

    /// Make `dependent` wait for `dependency`
    pub fn add_dependency(&mut self, dependent: &ResourceRef, dependency: &ResourceRef) {
        if let Some(resource) = self.resources.get_mut(&dependent.logical_id) {
            if !resource.depends_on.contains(&dependency.logical_id) {
                resource.depends_on.push(dependency.logical_id.clone());
            }
        }
    }

    /// Pin the removal policy of one resource
    pub fn apply_removal_policy(&mut self, target: &ResourceRef, policy: RemovalPolicy) {
        if let Some(resource) = self.resources.get_mut(&target.logical_id) {
            resource.deletion_policy = Some(policy);
            resource.update_replace_policy = Some(policy);
        }
    }

    pub fn resource(&self, target: &ResourceRef) -> Option<&Resource> {
        self.resources.get(&target.logical_id)
    }

    /// All resources of a CloudFormation type
    pub fn resources_of_type<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = (&'a str, &'a Resource)> + 'a {
        self.resources
            .iter()
            .filter(move |(_, r)| r.kind == kind)
            .map(|(id, r)| (id.as_str(), r))
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn add_output(&mut self, key: &str, value: Value, description: Option<&str>) {
        self.outputs.insert(
            key.to_string(),
            Output {
                value,
                description: description.map(str::to_string),
                export: None,
            },
        );
    }

    /// Export a value and return the reference other stacks use to read it
    pub fn export(&mut self, key: &str, value: Value) -> Value {
        let export_name = format!("{}-{}", self.name, key);
        self.outputs.insert(
            key.to_string(),
            Output {
                value,
                description: None,
                export: Some(json!({ "Name": export_name })),
            },
        );
        import_value(&export_name)
    }

    pub fn outputs(&self) -> &BTreeMap<String, Output> {
        &self.outputs
    }

    pub fn output(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key).map(|o| &o.value)
    }

    /// Register an asset; its location is resolved through two parameters
    pub fn add_asset(&mut self, name: &str, path: &str) -> Asset {
        let id = logical_id(name);
        let bucket_parameter = format!("{}AssetBucket", id);
        let key_parameter = format!("{}AssetKey", id);
        self.parameters.insert(
            bucket_parameter.clone(),
            json!({ "Type": "String", "Description": format!("S3 bucket for asset {}", path) }),
        );
        self.parameters.insert(
            key_parameter.clone(),
            json!({ "Type": "String", "Description": format!("S3 key for asset {}", path) }),
        );
        let asset = Asset {
            id,
            path: path.to_string(),
            bucket_parameter,
            key_parameter,
        };
        self.assets.push(asset.clone());
        asset
    }

    pub fn assets(&self) -> &[Asset] {
        &self.assets
    }

    /// Render the stack as a template document
    pub fn to_document(&self) -> Value {
        let resources: BTreeMap<&String, Resource> = self
            .resources
            .iter()
            .map(|(id, resource)| {
                let mut resource = resource.clone();
                if resource.deletion_policy.is_none() {
                    resource.deletion_policy = self.default_removal_policy;
                    resource.update_replace_policy = self.default_removal_policy;
                }
                (id, resource)
            })
            .collect();

        let mut doc = json!({
            "AWSTemplateFormatVersion": "2010-09-09",
            "Metadata": { "Tags": self.tags },
            "Resources": resources,
        });
        if let Some(description) = &self.description {
            doc["Description"] = json!(description);
        }
        if !self.parameters.is_empty() {
            doc["Parameters"] = json!(self.parameters);
        }
        if !self.outputs.is_empty() {
            doc["Outputs"] = json!(self.outputs);
        }
        if !self.warnings.is_empty() {
            doc["Metadata"]["Warnings"] = json!(self.warnings);
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_id_sanitizing() {
        assert_eq!(logical_id("dev-REDCap-hostedzone"), "devREDCaphostedzone");
        assert_eq!(logical_id("redcap_app.bucket"), "redcapappbucket");
    }

    #[test]
    fn test_duplicate_logical_id_rejected() {
        let mut stack = Stack::new("dev-REDCap-Backend", "us-east-1");
        stack.add("app-bucket", "AWS::S3::Bucket", json!({})).unwrap();
        let err = stack.add("app.bucket", "AWS::S3::Bucket", json!({})).unwrap_err();
        assert!(matches!(err, SynthError::DuplicateLogicalId { logical_id, .. } if logical_id == "appbucket"));
    }

    #[test]
    fn test_refs_and_attrs() {
        let mut stack = Stack::new("s", "us-east-1");
        let zone = stack.add("zone", "AWS::Route53::HostedZone", json!({ "Name": "example.com" })).unwrap();
        assert_eq!(zone.reference(), json!({ "Ref": "zone" }));
        assert_eq!(zone.attr("NameServers"), json!({ "Fn::GetAtt": ["zone", "NameServers"] }));
        assert_eq!(zone.arn(), json!({ "Fn::GetAtt": ["zone", "Arn"] }));
    }

    #[test]
    fn test_export_returns_import() {
        let mut stack = Stack::new("dev-REDCap-Network", "us-east-1");
        let import = stack.export("VpcId", json!({ "Ref": "vpc" }));
        assert_eq!(import, json!({ "Fn::ImportValue": "dev-REDCap-Network-VpcId" }));
        let doc = stack.to_document();
        assert_eq!(doc["Outputs"]["VpcId"]["Export"]["Name"], "dev-REDCap-Network-VpcId");
    }

    #[test]
    fn test_default_removal_policy_does_not_override_explicit() {
        let mut stack = Stack::new("s", "us-east-1");
        stack.set_default_removal_policy(RemovalPolicy::default_for("prod", SynthMode::Deploy));
        let bucket = stack.add("bucket", "AWS::S3::Bucket", json!({})).unwrap();
        let repo = stack.add("repo", "AWS::ECR::Repository", json!({})).unwrap();
        stack.apply_removal_policy(&repo, RemovalPolicy::Destroy);

        let doc = stack.to_document();
        assert_eq!(doc["Resources"]["bucket"]["DeletionPolicy"], "Retain");
        assert_eq!(doc["Resources"]["repo"]["DeletionPolicy"], "Delete");
        assert!(stack.resource(&bucket).unwrap().deletion_policy.is_none());
    }

    #[test]
    fn test_removal_policy_defaults() {
        assert_eq!(RemovalPolicy::default_for("dev", SynthMode::Deploy), Some(RemovalPolicy::Destroy));
        assert_eq!(RemovalPolicy::default_for("qa", SynthMode::Dev), Some(RemovalPolicy::Destroy));
        assert_eq!(RemovalPolicy::default_for("prod", SynthMode::Deploy), Some(RemovalPolicy::Retain));
        assert_eq!(RemovalPolicy::default_for("prod", SynthMode::Remove), None);
        assert_eq!(RemovalPolicy::default_for("stage", SynthMode::Deploy), None);
    }

    #[test]
    fn test_dependencies_are_deduplicated() {
        let mut stack = Stack::new("s", "us-east-1");
        let zone = stack.add("zone", "AWS::Route53::HostedZone", json!({})).unwrap();
        let record = stack.add("record", "AWS::Route53::RecordSet", json!({})).unwrap();
        stack.add_dependency(&record, &zone);
        stack.add_dependency(&record, &zone);
        assert_eq!(stack.resource(&record).unwrap().depends_on, vec!["zone"]);
    }

    #[test]
    fn test_asset_parameters() {
        let mut stack = Stack::new("s", "us-east-1");
        let asset = stack.add_asset("build-context", "packages/REDCap");
        assert_eq!(asset.bucket(), json!({ "Ref": "buildcontextAssetBucket" }));
        let doc = stack.to_document();
        assert!(doc["Parameters"]["buildcontextAssetKey"].is_object());
        assert_eq!(stack.assets().len(), 1);
    }
}
