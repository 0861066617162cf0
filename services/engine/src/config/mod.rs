//! Stage configuration (stages.yaml)
//!
//! A stage file carries a `defaults:` mapping and a `stages:` mapping. Each
//! stage is shallow-merged over the defaults, then deserialized and validated.

pub mod types;

use std::net::Ipv4Addr;
use std::path::Path;

use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::{Result, SynthError};

pub use types::{
    Cpu, DbConfig, DbEngine, DbScaling, DomainApp, DomainAppsConfig, Ec2ServerConfig, EcsConfig,
    EcsScaling, HostInRoute53, LogRetention, Memory, RedcapConfig, StackDuration, StageSettings,
    StagesFile,
};

impl StagesFile {
    /// Parse a stage file from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: Self = serde_yaml::from_str(yaml)?;
        Ok(file)
    }

    /// Read and parse a stage file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            SynthError::invalid("stages file", format!("{}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Stage names, sorted
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.keys().map(String::as_str).collect()
    }

    /// Merged raw mapping for one stage
    fn merged(&self, stage: &str) -> Result<Mapping> {
        let overrides = self
            .stages
            .get(stage)
            .ok_or_else(|| SynthError::UnknownStage(stage.to_string()))?;

        let mut merged = self.defaults.clone();
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
        Ok(merged)
    }

    /// Resolve and validate the settings of one stage
    pub fn stage(&self, stage: &str) -> Result<StageSettings> {
        let merged = self.merged(stage)?;
        let is_domain_apps = merged.contains_key("apps");
        debug!(stage = %stage, keys = merged.len(), domain_apps = is_domain_apps, "Merged stage settings");

        if is_domain_apps {
            let cfg: DomainAppsConfig = serde_yaml::from_value(Value::Mapping(merged))?;
            validate_domain_apps(&cfg)?;
            Ok(StageSettings::DomainApps(cfg))
        } else {
            let cfg: RedcapConfig = serde_yaml::from_value(Value::Mapping(merged))?;
            validate_redcap(&cfg)?;
            Ok(StageSettings::Redcap(Box::new(cfg)))
        }
    }
}

/// IPv4 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    /// Parse `a.b.c.d/n`; a bare address is not accepted
    pub fn parse(entry: &str) -> Option<Self> {
        let (address, prefix) = entry.trim().split_once('/')?;
        let address: Ipv4Addr = address.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        if prefix > 32 {
            return None;
        }
        Some(Self { address, prefix })
    }

    fn mask(self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        }
    }

    pub fn contains(self, ip: Ipv4Addr) -> bool {
        let mask = self.mask();
        u32::from(self.address) & mask == u32::from(ip) & mask
    }

    /// The `index`-th sub-network of length `prefix` inside this network
    pub fn subnet(self, prefix: u8, index: u32) -> Option<Self> {
        if prefix < self.prefix || prefix > 32 {
            return None;
        }
        let count = 1u64 << (prefix - self.prefix);
        if u64::from(index) >= count {
            return None;
        }
        let size = 1u64 << (32 - prefix);
        let base = u64::from(u32::from(self.address) & self.mask());
        let start = base + u64::from(index) * size;
        Some(Self {
            address: Ipv4Addr::from(start as u32),
            prefix,
        })
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// Parse the `allowedIps` list, rejecting empty or malformed entries
pub fn parse_allowed_ips(entries: &[String]) -> Result<Vec<Ipv4Cidr>> {
    entries
        .iter()
        .map(|entry| {
            Ipv4Cidr::parse(entry).ok_or_else(|| SynthError::InvalidAllowListEntry {
                list: "allowedIps",
                entry: entry.clone(),
            })
        })
        .collect()
}

/// Validate the `allowedCountries` list (ISO 3166 alpha-2 codes)
pub fn parse_allowed_countries(entries: &[String]) -> Result<Vec<String>> {
    entries
        .iter()
        .map(|entry| {
            let code = entry.trim();
            if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
                Ok(code.to_ascii_uppercase())
            } else {
                Err(SynthError::InvalidAllowListEntry {
                    list: "allowedCountries",
                    entry: entry.clone(),
                })
            }
        })
        .collect()
}

fn validate_redcap(cfg: &RedcapConfig) -> Result<()> {
    if cfg.region.trim().is_empty() {
        return Err(SynthError::invalid("region", "must not be empty"));
    }
    if cfg.name.trim().is_empty() {
        return Err(SynthError::invalid("name", "must not be empty"));
    }

    parse_allowed_ips(&cfg.allowed_ips)?;
    parse_allowed_countries(&cfg.allowed_countries)?;

    match (&cfg.red_cap_s3_path, &cfg.red_cap_local_version) {
        (Some(_), Some(_)) => return Err(SynthError::ConflictingRedcapSource),
        (None, None) => return Err(SynthError::MissingRedcapSource),
        _ => {}
    }

    if cfg.ecs.is_some() {
        let app_runner_keys = cfg.app_runner_keys();
        if !app_runner_keys.is_empty() {
            return Err(SynthError::ConflictingBackends { app_runner_keys });
        }
    }

    if cfg.app_runner_min_size() == 0 {
        return Err(SynthError::invalid("appRunnerMinSize", "must be at least 1"));
    }
    if cfg.app_runner_min_size() > cfg.app_runner_max_size() {
        return Err(SynthError::invalid(
            "appRunnerMaxSize",
            format!(
                "{} is below appRunnerMinSize {}",
                cfg.app_runner_max_size(),
                cfg.app_runner_min_size()
            ),
        ));
    }
    if cfg.app_runner_concurrency() == 0 {
        return Err(SynthError::invalid("appRunnerConcurrency", "must be at least 1"));
    }

    if let Some(secret) = &cfg.cron_secret {
        if secret.is_empty() {
            return Err(SynthError::invalid("cronSecret", "must not be empty when set"));
        }
    }

    if let Some(email) = cfg.email() {
        if !email.contains('@') {
            return Err(SynthError::invalid("email", format!("{:?} is not an address", email)));
        }
    }

    let scaling = &cfg.db.scaling;
    if scaling.min_capacity_acu < 0.0 || scaling.max_capacity_acu > 256.0 {
        return Err(SynthError::invalid("db.scaling", "capacity must be within 0..=256 ACU"));
    }
    if scaling.max_capacity_acu < scaling.min_capacity_acu || scaling.max_capacity_acu <= 0.0 {
        return Err(SynthError::invalid(
            "db.scaling",
            format!(
                "maxCapacityAcu {} must be positive and not below minCapacityAcu {}",
                scaling.max_capacity_acu, scaling.min_capacity_acu
            ),
        ));
    }

    if let Some(ecs) = &cfg.ecs {
        if ecs.scaling.min_containers > ecs.scaling.max_containers {
            return Err(SynthError::invalid(
                "ecs.scaling",
                "minContainers must not exceed maxContainers",
            ));
        }
    }

    Ok(())
}

fn validate_domain_apps(cfg: &DomainAppsConfig) -> Result<()> {
    if cfg.region.trim().is_empty() {
        return Err(SynthError::invalid("region", "must not be empty"));
    }
    for app in &cfg.apps {
        if app.name.trim().is_empty() {
            return Err(SynthError::invalid("apps.name", "must not be empty"));
        }
    }
    Ok(())
}
