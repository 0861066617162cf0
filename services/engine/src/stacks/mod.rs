//! Deployable stacks and the application that orders them
//!
//! A REDCap stage synthesizes Network, BuildImage, Database and Backend, plus
//! EC2Server and Security when enabled. Later stacks read earlier ones through
//! exports only. A name-server stage synthesizes the Route53NS stack alone.

pub mod backend;
pub mod build_image;
pub mod database;
pub mod ec2_server;
pub mod network;
pub mod route53_ns;
pub mod security;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::info;

use crate::config::{RedcapConfig, StageSettings};
use crate::context::ZoneLookup;
use crate::error::Result;
use crate::template::{sub, RemovalPolicy, Stack, SynthMode};

/// Inputs of a run that are not part of the stage settings
#[derive(Debug, Clone, PartialEq)]
pub struct SynthOptions {
    pub mode: SynthMode,
    /// Literal account id; `${AWS::AccountId}` is used when absent
    pub account_id: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl SynthOptions {
    pub fn new(mode: SynthMode, account_id: Option<String>) -> Self {
        Self {
            mode,
            account_id,
            generated_at: Utc::now(),
        }
    }

    /// Changes on every run; used to force one-off triggers
    pub fn nonce(&self) -> String {
        self.generated_at.format("%Y%m%d%H%M%S").to_string()
    }
}

/// Naming and settings shared by every stack of a REDCap stage
#[derive(Debug, Clone)]
pub struct StackContext<'a> {
    pub stage: &'a str,
    pub cfg: &'a RedcapConfig,
    pub options: SynthOptions,
}

impl<'a> StackContext<'a> {
    pub fn new(stage: &'a str, cfg: &'a RedcapConfig, options: SynthOptions) -> Self {
        Self { stage, cfg, options }
    }

    /// `{stage}-{name}`
    pub fn prefix(&self) -> String {
        format!("{}-{}", self.stage, self.cfg.name)
    }

    pub fn resource_name(&self, suffix: &str) -> String {
        format!("{}-{}", self.prefix(), suffix)
    }

    pub fn production(&self) -> bool {
        self.stage == "prod"
    }

    pub fn new_stack(&self, suffix: &str) -> Stack {
        stage_stack(self.stage, &self.cfg.name, &self.cfg.region, suffix, self.options.mode)
    }

    pub fn account_id(&self) -> Value {
        match &self.options.account_id {
            Some(id) => json!(id),
            None => sub("${AWS::AccountId}"),
        }
    }
}

/// Empty stack `{stage}-{name}-{suffix}` with the stage tag and removal default
pub(crate) fn stage_stack(stage: &str, name: &str, region: &str, suffix: &str, mode: SynthMode) -> Stack {
    let mut stack = Stack::new(format!("{}-{}-{}", stage, name, suffix), region);
    stack.set_tag("deployment", format!("{}-{}", stage, region));
    stack.set_default_removal_policy(RemovalPolicy::default_for(stage, mode));
    stack
}

/// Every stack of one stage, in deployment order
#[derive(Debug, Clone)]
pub struct App {
    pub stage: String,
    pub kind: &'static str,
    pub region: String,
    pub mode: SynthMode,
    pub generated_at: DateTime<Utc>,
    pub stacks: Vec<Stack>,
}

impl App {
    /// Stack whose name ends with `-{suffix}`
    pub fn stack(&self, suffix: &str) -> Option<&Stack> {
        let ending = format!("-{}", suffix);
        self.stacks.iter().find(|s| s.name().ends_with(&ending))
    }

    /// Warnings of every stack, prefixed with the stack name
    pub fn warnings(&self) -> Vec<String> {
        self.stacks
            .iter()
            .flat_map(|s| s.warnings().iter().map(move |w| format!("{}: {}", s.name(), w)))
            .collect()
    }

    pub fn stack_names(&self) -> Vec<&str> {
        self.stacks.iter().map(Stack::name).collect()
    }

    /// Output values per stack
    pub fn outputs(&self) -> BTreeMap<String, BTreeMap<String, Value>> {
        self.stacks
            .iter()
            .filter(|s| !s.outputs().is_empty())
            .map(|s| {
                let values = s
                    .outputs()
                    .iter()
                    .map(|(key, output)| (key.clone(), output.value.clone()))
                    .collect();
                (s.name().to_string(), values)
            })
            .collect()
    }

    /// `(file name, template)` per stack
    pub fn documents(&self) -> Vec<(String, Value)> {
        self.stacks
            .iter()
            .map(|s| (format!("{}.json", s.name()), s.to_document()))
            .collect()
    }

    pub fn manifest(&self) -> Value {
        let stacks: Vec<Value> = self
            .stacks
            .iter()
            .map(|s| {
                json!({
                    "name": s.name(),
                    "template": format!("{}.json", s.name()),
                    "resources": s.resource_count(),
                    "assets": s.assets(),
                    "tags": s.tags(),
                    "warnings": s.warnings(),
                })
            })
            .collect();
        json!({
            "stage": self.stage,
            "kind": self.kind,
            "region": self.region,
            "mode": self.mode.to_string(),
            "generatedAt": self.generated_at.to_rfc3339(),
            "stacks": stacks,
            "outputs": self.outputs(),
        })
    }
}

/// Synthesize every stack of `stage`
pub fn synth_app(
    stage: &str,
    settings: &StageSettings,
    lookup: &dyn ZoneLookup,
    options: &SynthOptions,
) -> Result<App> {
    let stacks = match settings {
        StageSettings::DomainApps(cfg) => vec![route53_ns::build(stage, cfg, lookup, options.mode)?],
        StageSettings::Redcap(cfg) => redcap_stacks(&StackContext::new(stage, cfg, options.clone()), lookup)?,
    };

    info!(
        stage = %stage,
        kind = settings.kind(),
        stacks = stacks.len(),
        resources = stacks.iter().map(Stack::resource_count).sum::<usize>(),
        "Synthesized stage"
    );

    Ok(App {
        stage: stage.to_string(),
        kind: settings.kind(),
        region: settings.region().to_string(),
        mode: options.mode,
        generated_at: options.generated_at,
        stacks,
    })
}

fn redcap_stacks(ctx: &StackContext<'_>, lookup: &dyn ZoneLookup) -> Result<Vec<Stack>> {
    let (network_stack, network) = network::build(ctx)?;
    let (image_stack, image) = build_image::build(ctx, &network)?;
    let (database_stack, database) = database::build(ctx, &network)?;
    let (backend_stack, backend) = backend::build(ctx, lookup, &network, &image, &database)?;

    let mut stacks = vec![network_stack, image_stack, database_stack, backend_stack];
    if let Some(settings) = &ctx.cfg.ec2_server_stack {
        stacks.push(ec2_server::build(ctx, settings, &network, &image, &database, &backend)?);
    }
    if ctx.cfg.guard_duty {
        stacks.push(security::build(ctx)?);
    }
    Ok(stacks)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::StagesFile;
    use crate::context::LookupContext;
    use crate::error::SynthError;
    use chrono::TimeZone;

    const BASE: &str = "defaults:
  name: REDCap
  profile: default
  region: us-east-1
  redCapLocalVersion: redcap13.7.2
  allowedIps: []
  allowedCountries: []
";

    /// REDCap settings of a `test` stage: the defaults above plus `extra`
    pub(crate) fn redcap_config(extra: &str) -> RedcapConfig {
        match StagesFile::from_yaml(&stages_yaml("test", extra)).unwrap().stage("test").unwrap() {
            StageSettings::Redcap(cfg) => *cfg,
            other => panic!("expected a REDCap stage, got {}", other.kind()),
        }
    }

    pub(crate) fn context<'a>(stage: &'a str, cfg: &'a RedcapConfig) -> StackContext<'a> {
        StackContext::new(stage, cfg, options(SynthMode::Deploy))
    }

    fn options(mode: SynthMode) -> SynthOptions {
        SynthOptions {
            mode,
            account_id: None,
            generated_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    fn stages_yaml(stage: &str, extra: &str) -> String {
        let mut yaml = format!("{}stages:\n  {}:\n", BASE, stage);
        if extra.trim().is_empty() {
            yaml.push_str("    {}\n");
        }
        for line in extra.lines() {
            yaml.push_str("    ");
            yaml.push_str(line);
            yaml.push('\n');
        }
        yaml
    }

    fn synth(stage: &str, extra: &str, mode: SynthMode) -> Result<App> {
        let file = StagesFile::from_yaml(&stages_yaml(stage, extra))?;
        synth_app(stage, &file.stage(stage)?, &LookupContext::default(), &options(mode))
    }

    fn collect_imports(value: &Value, found: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                if let Some(Value::String(name)) = map.get("Fn::ImportValue") {
                    found.push(name.clone());
                }
                map.values().for_each(|v| collect_imports(v, found));
            }
            Value::Array(items) => items.iter().for_each(|v| collect_imports(v, found)),
            _ => {}
        }
    }

    #[test]
    fn test_context_naming() {
        let cfg = redcap_config("");
        let ctx = context("prod", &cfg);
        assert_eq!(ctx.prefix(), "prod-REDCap");
        assert_eq!(ctx.resource_name("appwaf"), "prod-REDCap-appwaf");
        assert!(ctx.production());
        assert_eq!(ctx.account_id(), json!({ "Fn::Sub": "${AWS::AccountId}" }));
        assert_eq!(ctx.options.nonce(), "20240301120000");

        let stack = ctx.new_stack("Network");
        assert_eq!(stack.name(), "prod-REDCap-Network");
        assert_eq!(stack.tags()["deployment"], "prod-us-east-1");
    }

    #[test]
    fn test_redcap_stage_stack_order() {
        let app = synth("dev", "email: admin@example.com\n", SynthMode::Deploy).unwrap();
        assert_eq!(app.kind, "redcap");
        assert_eq!(
            app.stack_names(),
            vec!["dev-REDCap-Network", "dev-REDCap-BuildImage", "dev-REDCap-Database", "dev-REDCap-Backend"]
        );
        assert!(app.stacks.iter().all(|s| s.tags()["deployment"] == "dev-us-east-1"));

        // No backend block selects App Runner
        let backend = app.stack("Backend").unwrap();
        assert_eq!(backend.resources_of_type("AWS::AppRunner::Service").count(), 1);
        assert_eq!(backend.resources_of_type("AWS::ECS::Service").count(), 0);
    }

    #[test]
    fn test_optional_stacks() {
        let app = synth(
            "stage",
            "email: admin@example.com\nguardDuty: true\nec2ServerStack:\n  ec2StackDuration: 2h\n",
            SynthMode::Deploy,
        )
        .unwrap();
        let names = app.stack_names();
        assert_eq!(names.len(), 6);
        assert_eq!(names[4], "stage-REDCap-EC2Server");
        assert_eq!(names[5], "stage-REDCap-Security");
    }

    #[test]
    fn test_imports_resolve_to_earlier_exports() {
        let app = synth(
            "stage",
            "email: admin@example.com\nec2ServerStack: {}\ncronSecret: mysecret\n",
            SynthMode::Deploy,
        )
        .unwrap();

        let mut exported: Vec<String> = Vec::new();
        for stack in &app.stacks {
            let mut imports = Vec::new();
            collect_imports(&stack.to_document(), &mut imports);
            for name in imports {
                assert!(exported.contains(&name), "{} imports {} before it is exported", stack.name(), name);
            }
            exported.extend(
                stack
                    .outputs()
                    .values()
                    .filter_map(|o| o.export.as_ref())
                    .filter_map(|e| e["Name"].as_str().map(str::to_string)),
            );
        }
    }

    fn vpc_deletion_policy(app: &App) -> Value {
        let network = app.stack("Network").unwrap();
        let (id, _) = network.resources_of_type("AWS::EC2::VPC").next().unwrap();
        network.to_document()["Resources"][id]["DeletionPolicy"].clone()
    }

    #[test]
    fn test_removal_policy_defaults() {
        let email = "email: admin@example.com\n";
        let dev = synth("dev", email, SynthMode::Deploy).unwrap();
        assert_eq!(vpc_deletion_policy(&dev), "Delete");

        let prod = synth("prod", email, SynthMode::Deploy).unwrap();
        assert_eq!(vpc_deletion_policy(&prod), "Retain");

        let prod_remove = synth("prod", email, SynthMode::Remove).unwrap();
        assert!(vpc_deletion_policy(&prod_remove).is_null());

        let stage_dev_mode = synth("stage", email, SynthMode::Dev).unwrap();
        assert_eq!(vpc_deletion_policy(&stage_dev_mode), "Delete");
    }

    #[test]
    fn test_name_server_stage() {
        let file = StagesFile::from_yaml(&format!(
            "{}stages:\n  shared:\n    domain: example.edu\n    apps:\n      - name: redcap\n        nsRecords: [ns-1.awsdns-01.org]\n",
            BASE
        ))
        .unwrap();
        let mut lookups = LookupContext::default();
        lookups.insert("example.edu", "ZROOT", vec![]);

        let app = synth_app("shared", &file.stage("shared").unwrap(), &lookups, &options(SynthMode::Deploy)).unwrap();
        assert_eq!(app.kind, "route53-ns");
        assert_eq!(app.stack_names(), vec!["shared-REDCap-Route53NS"]);
    }

    #[test]
    fn test_stage_errors_abort_synthesis() {
        assert!(matches!(synth("dev", "", SynthMode::Deploy), Err(SynthError::MissingEmailIdentity)));
        assert!(matches!(
            synth("dev", "email: a@example.com\nredCapS3Path: bucket/redcap13.7.2.zip\n", SynthMode::Deploy),
            Err(SynthError::ConflictingRedcapSource)
        ));
        assert!(matches!(
            synth("dev", "email: a@example.com\necs: {}\nappRunnerMaxSize: 4\n", SynthMode::Deploy),
            Err(SynthError::ConflictingBackends { .. })
        ));
    }

    #[test]
    fn test_sample_stages_synthesize() {
        let file = StagesFile::from_yaml(include_str!("../../../../stages.sample.yaml")).unwrap();
        let lookups = LookupContext::from_json(include_str!("../../../../lookups.sample.json")).unwrap();
        for stage in file.stage_names() {
            let settings = file.stage(stage).unwrap();
            let app = synth_app(stage, &settings, &lookups, &options(SynthMode::Deploy)).unwrap();
            assert!(!app.stacks.is_empty(), "{} produced no stacks", stage);
        }

        let prod = file.stage("prod").unwrap();
        let app = synth_app("prod", &prod, &lookups, &options(SynthMode::Deploy)).unwrap();
        let backend = app.stack("Backend").unwrap();
        assert_eq!(backend.resources_of_type("AWS::ECS::Service").count(), 1);
        assert!(app.stack("Security").is_some());
    }

    #[test]
    fn test_manifest() {
        let app = synth("dev", "email: admin@example.com\n", SynthMode::Dev).unwrap();
        let manifest = app.manifest();
        assert_eq!(manifest["mode"], "dev");
        assert_eq!(manifest["generatedAt"], "2024-03-01T12:00:00+00:00");
        assert_eq!(manifest["stacks"].as_array().unwrap().len(), 4);
        assert!(manifest["outputs"]["dev-REDCap-Backend"]["AppRunnerServiceUrl"].is_object());
        assert_eq!(app.documents()[0].0, "dev-REDCap-Network.json");

        assert_eq!(manifest["stacks"][3]["warnings"].as_array().unwrap().len(), 1);
        assert!(manifest["stacks"][0]["warnings"].as_array().unwrap().is_empty());
        let warnings = app.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("dev-REDCap-Backend: "));
    }
}
