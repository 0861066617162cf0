//! Stage settings types
//!
//! Keys are camelCase in `stages.yaml`. Absent keys fall back to the defaults
//! documented on each field.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::SynthError;

/// How DNS is hosted for the stage
///
/// `hostInRoute53` accepts a boolean or the name of an existing hosted zone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HostInRoute53 {
    /// No DNS is managed (`false`, empty string or absent)
    #[default]
    Disabled,
    /// Create a new public hosted zone (`true`)
    Create,
    /// Look up an existing zone owned outside this deployment
    Existing(String),
}

impl<'de> Deserialize<'de> for HostInRoute53 {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Zone(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Flag(true) => HostInRoute53::Create,
            Raw::Flag(false) => HostInRoute53::Disabled,
            Raw::Zone(zone) if zone.trim().is_empty() => HostInRoute53::Disabled,
            Raw::Zone(zone) => HostInRoute53::Existing(zone.trim().to_string()),
        })
    }
}

/// CPU size in units (1024 units per vCPU)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct Cpu(u32);

impl Cpu {
    pub const fn from_units(units: u32) -> Self {
        Cpu(units)
    }

    pub fn units(self) -> u32 {
        self.0
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Cpu(2048)
    }
}

impl FromStr for Cpu {
    type Err = SynthError;

    /// Accepts `"2 vCPU"`, `"0.25 vCPU"` or raw units like `"1024"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (number, scale) = match trimmed.strip_suffix("vCPU") {
            Some(n) => (n.trim(), 1024.0),
            None => (trimmed, 1.0),
        };
        let value: f64 = number
            .parse()
            .map_err(|_| SynthError::invalid("cpu", format!("cannot parse {:?}", s)))?;
        let units = value * scale;
        if units <= 0.0 || units.fract() != 0.0 {
            return Err(SynthError::invalid("cpu", format!("{:?} is not a whole number of CPU units", s)));
        }
        Ok(Cpu(units as u32))
    }
}

impl TryFrom<String> for Cpu {
    type Error = SynthError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vCPU", self.0 as f64 / 1024.0)
    }
}

/// Memory size in MiB
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct Memory(u32);

impl Memory {
    pub const fn from_mib(mib: u32) -> Self {
        Memory(mib)
    }

    pub fn mib(self) -> u32 {
        self.0
    }
}

impl Default for Memory {
    fn default() -> Self {
        Memory(4096)
    }
}

impl FromStr for Memory {
    type Err = SynthError;

    /// Accepts `"4 GB"`, `"0.5 GB"`, `"512 MB"` or raw MiB like `"2048"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (number, scale) = if let Some(n) = trimmed.strip_suffix("GB") {
            (n.trim(), 1024.0)
        } else if let Some(n) = trimmed.strip_suffix("MB") {
            (n.trim(), 1.0)
        } else {
            (trimmed, 1.0)
        };
        let value: f64 = number
            .parse()
            .map_err(|_| SynthError::invalid("memory", format!("cannot parse {:?}", s)))?;
        let mib = value * scale;
        if mib <= 0.0 || mib.fract() != 0.0 {
            return Err(SynthError::invalid("memory", format!("{:?} is not a whole number of MiB", s)));
        }
        Ok(Memory(mib as u32))
    }
}

impl TryFrom<String> for Memory {
    type Error = SynthError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} GB", self.0 as f64 / 1024.0)
    }
}

/// Lifetime of the temporary EC2 server stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct StackDuration(Duration);

impl StackDuration {
    pub fn as_duration(self) -> Duration {
        self.0
    }

    pub fn as_secs(self) -> u64 {
        self.0.as_secs()
    }
}

impl Default for StackDuration {
    fn default() -> Self {
        StackDuration(Duration::from_secs(3 * 3600))
    }
}

/// Step Functions standard executions stop after one year
pub const MAX_STACK_DURATION_SECS: u64 = 365 * 86_400;

impl FromStr for StackDuration {
    type Err = SynthError;

    /// Accepts a positive integer followed by `s`, `m`, `h` or `d`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| SynthError::InvalidDuration(s.to_string()))?;
        let (number, unit) = trimmed.split_at(split);
        let value: u64 = number
            .parse()
            .map_err(|_| SynthError::InvalidDuration(s.to_string()))?;
        let multiplier = match unit.trim() {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86_400,
            _ => return Err(SynthError::InvalidDuration(s.to_string())),
        };
        let seconds = value
            .checked_mul(multiplier)
            .ok_or_else(|| SynthError::InvalidDuration(s.to_string()))?;
        if seconds == 0 || seconds > MAX_STACK_DURATION_SECS {
            return Err(SynthError::InvalidDuration(s.to_string()));
        }
        Ok(StackDuration(Duration::from_secs(seconds)))
    }
}

impl TryFrom<String> for StackDuration {
    type Error = SynthError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Aurora engine and version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum DbEngine {
    #[default]
    #[serde(rename = "mysql8.0")]
    Mysql80,
    #[serde(rename = "postgresql13.10")]
    Postgres1310,
    #[serde(rename = "postgresql14.7")]
    Postgres147,
    #[serde(rename = "postgresql15.2")]
    Postgres152,
}

impl DbEngine {
    /// CloudFormation `Engine` value
    pub fn engine(self) -> &'static str {
        match self {
            DbEngine::Mysql80 => "aurora-mysql",
            _ => "aurora-postgresql",
        }
    }

    /// CloudFormation `EngineVersion` value
    pub fn version(self) -> &'static str {
        match self {
            DbEngine::Mysql80 => "8.0.mysql_aurora.3.04.0",
            DbEngine::Postgres1310 => "13.10",
            DbEngine::Postgres147 => "14.7",
            DbEngine::Postgres152 => "15.2",
        }
    }

    pub fn parameter_group_family(self) -> &'static str {
        match self {
            DbEngine::Mysql80 => "aurora-mysql8.0",
            DbEngine::Postgres1310 => "aurora-postgresql13",
            DbEngine::Postgres147 => "aurora-postgresql14",
            DbEngine::Postgres152 => "aurora-postgresql15",
        }
    }

    pub fn is_mysql(self) -> bool {
        matches!(self, DbEngine::Mysql80)
    }

    pub fn default_port(self) -> u16 {
        if self.is_mysql() {
            3306
        } else {
            5432
        }
    }
}

/// Serverless v2 capacity range in Aurora capacity units
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbScaling {
    #[serde(default = "default_min_acu")]
    pub min_capacity_acu: f64,
    #[serde(default = "default_max_acu")]
    pub max_capacity_acu: f64,
}

impl Default for DbScaling {
    fn default() -> Self {
        Self {
            min_capacity_acu: default_min_acu(),
            max_capacity_acu: default_max_acu(),
        }
    }
}

/// Database settings (`db:` block)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbConfig {
    /// Restore the cluster from this snapshot instead of creating it empty
    pub db_snapshot_id: Option<String>,
    /// Generate fresh credentials when restoring from a snapshot (default true)
    #[serde(default = "default_true")]
    pub generate_snapshot_credentials: bool,
    /// MySQL `max_allowed_packet` (default "4194304")
    #[serde(default = "default_max_allowed_packet")]
    pub max_allowed_packet: String,
    /// Number of reader instances (default 1)
    #[serde(default = "default_db_readers")]
    pub db_readers: u32,
    #[serde(default)]
    pub scaling: DbScaling,
    #[serde(default)]
    pub engine: DbEngine,
    /// Automated backup retention (default 30)
    #[serde(default = "default_backup_retention")]
    pub backup_retention_days: u32,
    /// Secret rotation interval (default 120)
    #[serde(default = "default_rotation")]
    pub rotate_secret_after_days: u32,
    /// Put an RDS proxy in front of the writer
    #[serde(default)]
    pub enable_proxy: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            db_snapshot_id: None,
            generate_snapshot_credentials: true,
            max_allowed_packet: default_max_allowed_packet(),
            db_readers: default_db_readers(),
            scaling: DbScaling::default(),
            engine: DbEngine::default(),
            backup_retention_days: default_backup_retention(),
            rotate_secret_after_days: default_rotation(),
            enable_proxy: false,
        }
    }
}

/// ECS service autoscaling
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcsScaling {
    #[serde(default = "default_one")]
    pub min_containers: u32,
    #[serde(default = "default_one")]
    pub max_containers: u32,
    /// Target ALB requests per container
    pub requests_per_container: Option<u32>,
    /// Target average CPU utilization in percent
    pub cpu_utilization: Option<u32>,
}

impl Default for EcsScaling {
    fn default() -> Self {
        Self {
            min_containers: 1,
            max_containers: 1,
            requests_per_container: None,
            cpu_utilization: None,
        }
    }
}

/// CloudWatch log retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRetention {
    OneDay,
    ThreeDays,
    FiveDays,
    OneWeek,
    TwoWeeks,
    OneMonth,
    TwoMonths,
    ThreeMonths,
    FourMonths,
    FiveMonths,
    SixMonths,
    OneYear,
    ThirteenMonths,
    EighteenMonths,
    #[default]
    TwoYears,
    FiveYears,
    TenYears,
    Infinite,
}

impl LogRetention {
    /// `RetentionInDays` value, `None` when logs never expire
    pub fn days(self) -> Option<u32> {
        Some(match self {
            LogRetention::OneDay => 1,
            LogRetention::ThreeDays => 3,
            LogRetention::FiveDays => 5,
            LogRetention::OneWeek => 7,
            LogRetention::TwoWeeks => 14,
            LogRetention::OneMonth => 30,
            LogRetention::TwoMonths => 60,
            LogRetention::ThreeMonths => 90,
            LogRetention::FourMonths => 120,
            LogRetention::FiveMonths => 150,
            LogRetention::SixMonths => 180,
            LogRetention::OneYear => 365,
            LogRetention::ThirteenMonths => 400,
            LogRetention::EighteenMonths => 545,
            LogRetention::TwoYears => 731,
            LogRetention::FiveYears => 1827,
            LogRetention::TenYears => 3653,
            LogRetention::Infinite => return None,
        })
    }
}

/// Cluster-orchestration backend settings (`ecs:` block)
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcsConfig {
    pub cpu: Option<Cpu>,
    pub memory: Option<Memory>,
    #[serde(default)]
    pub scaling: EcsScaling,
    /// Imported certificate, used when no zone is managed
    pub certificate_arn: Option<String>,
    #[serde(default)]
    pub log_retention: LogRetention,
}

/// Temporary EC2 server settings (`ec2ServerStack:` block)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ec2ServerConfig {
    #[serde(default)]
    pub ec2_stack_duration: StackDuration,
}

/// Settings of a REDCap stage
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedcapConfig {
    /// Application name used in resource names (default "REDCap")
    #[serde(default = "default_app_name")]
    pub name: String,
    /// AWS CLI profile printed in operator commands (default "default")
    #[serde(default = "default_profile")]
    pub profile: String,
    pub region: String,
    /// IPv4 CIDR allow-list for the web ACL
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// ISO 3166 alpha-2 allow-list for the web ACL
    #[serde(default)]
    pub allowed_countries: Vec<String>,
    pub php_timezone: Option<String>,
    /// `bucket/path/redcap<version>.zip`
    pub red_cap_s3_path: Option<String>,
    /// `redcap<version>.zip` shipped with the build context
    pub red_cap_local_version: Option<String>,
    pub deploy_tag: Option<String>,
    #[serde(default)]
    pub rebuild_image: bool,
    pub domain: Option<String>,
    pub subdomain: Option<String>,
    #[serde(default)]
    pub host_in_route53: HostInRoute53,
    pub email: Option<String>,
    pub bounce_notification_email: Option<String>,
    pub app_runner_concurrency: Option<u32>,
    pub app_runner_max_size: Option<u32>,
    pub app_runner_min_size: Option<u32>,
    pub app_runner_access_role_arn: Option<String>,
    pub cpu: Option<Cpu>,
    pub memory: Option<Memory>,
    pub port: Option<u16>,
    pub cron_secret: Option<String>,
    pub cron_minutes: Option<u32>,
    #[serde(default = "default_true")]
    pub auto_deployments_enabled: bool,
    #[serde(default)]
    pub db: DbConfig,
    pub ecs: Option<EcsConfig>,
    pub ec2_server_stack: Option<Ec2ServerConfig>,
    #[serde(default)]
    pub guard_duty: bool,
}

impl RedcapConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8080)
    }

    pub fn php_timezone(&self) -> &str {
        self.php_timezone.as_deref().unwrap_or("UTC")
    }

    /// Scheduler interval; 0 disables the cron caller
    pub fn cron_minutes(&self) -> u32 {
        self.cron_minutes.unwrap_or(1)
    }

    pub fn app_runner_concurrency(&self) -> u32 {
        self.app_runner_concurrency.unwrap_or(10)
    }

    pub fn app_runner_max_size(&self) -> u32 {
        self.app_runner_max_size.unwrap_or(2)
    }

    pub fn app_runner_min_size(&self) -> u32 {
        self.app_runner_min_size.unwrap_or(1)
    }

    /// Non-empty domain, if any
    pub fn domain(&self) -> Option<&str> {
        non_empty(self.domain.as_deref())
    }

    /// Non-empty subdomain, if any
    pub fn subdomain(&self) -> Option<&str> {
        non_empty(self.subdomain.as_deref())
    }

    /// Non-empty notification email, if any
    pub fn email(&self) -> Option<&str> {
        non_empty(self.email.as_deref())
    }

    /// `{subdomain}.{domain}` or `{domain}`
    pub fn custom_domain_name(&self) -> Option<String> {
        let domain = self.domain()?;
        Some(match self.subdomain() {
            Some(sub) => format!("{}.{}", sub, domain),
            None => domain.to_string(),
        })
    }

    /// App Runner keys explicitly present in the stage
    pub fn app_runner_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if self.app_runner_concurrency.is_some() {
            keys.push("appRunnerConcurrency".to_string());
        }
        if self.app_runner_max_size.is_some() {
            keys.push("appRunnerMaxSize".to_string());
        }
        if self.app_runner_min_size.is_some() {
            keys.push("appRunnerMinSize".to_string());
        }
        if self.app_runner_access_role_arn.is_some() {
            keys.push("appRunnerAccessRoleArn".to_string());
        }
        keys
    }
}

/// One delegated application under the name-server stage's domain
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainApp {
    pub name: String,
    #[serde(default)]
    pub ns_records: Vec<String>,
}

/// Settings of a name-server delegation stage
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainAppsConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_profile")]
    pub profile: String,
    pub region: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub apps: Vec<DomainApp>,
}

/// Resolved settings for one stage
#[derive(Debug, Clone, PartialEq)]
pub enum StageSettings {
    Redcap(Box<RedcapConfig>),
    DomainApps(DomainAppsConfig),
}

impl StageSettings {
    pub fn region(&self) -> &str {
        match self {
            StageSettings::Redcap(cfg) => &cfg.region,
            StageSettings::DomainApps(cfg) => &cfg.region,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StageSettings::Redcap(_) => "redcap",
            StageSettings::DomainApps(_) => "route53-ns",
        }
    }
}

/// Raw stage file: shared defaults plus per-stage overrides
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StagesFile {
    #[serde(default)]
    pub defaults: serde_yaml::Mapping,
    #[serde(default)]
    pub stages: BTreeMap<String, serde_yaml::Mapping>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn default_app_name() -> String {
    "REDCap".to_string()
}

fn default_profile() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_one() -> u32 {
    1
}

fn default_min_acu() -> f64 {
    0.5
}

fn default_max_acu() -> f64 {
    8.0
}

fn default_max_allowed_packet() -> String {
    "4194304".to_string()
}

fn default_db_readers() -> u32 {
    1
}

fn default_backup_retention() -> u32 {
    30
}

fn default_rotation() -> u32 {
    120
}
