//! Synthesis errors
//!
//! Every failure here is a plan-time validation failure. Nothing is retried
//! and nothing is partially written: the caller aborts the synthesis.

use thiserror::Error;

/// Errors that can occur while loading stage settings or building stacks
#[derive(Debug, Error)]
pub enum SynthError {
    /// The stage file is not valid YAML or does not match the settings schema
    #[error("Failed to parse stage settings: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// The lookup context is not valid JSON
    #[error("Failed to parse lookup context: {0}")]
    ContextParse(#[from] serde_json::Error),

    /// The requested stage is not declared in the stage file
    #[error("Stage not found: {0}")]
    UnknownStage(String),

    /// A setting is present but out of range or malformed
    #[error("Invalid setting {field}: {reason}")]
    InvalidSetting { field: String, reason: String },

    /// An allow-list contains an empty or malformed entry
    #[error("Invalid entry in {list}: {entry:?}")]
    InvalidAllowListEntry { list: &'static str, entry: String },

    /// Neither a hosted zone nor a single address is available for SES
    #[error("No identity found to deploy Amazon SES: manage a hosted zone or set an email")]
    MissingEmailIdentity,

    /// The VPC would be created without any subnet group
    #[error("No subnet configuration enabled")]
    NoSubnets,

    /// The database cluster needs isolated subnets
    #[error("Isolated subnets are required to place the database cluster")]
    MissingIsolatedSubnets,

    /// Both REDCap install sources are set
    #[error("You must define only one REDCap install source, redCapLocalVersion (redcap<version>.zip) or redCapS3Path (bucket_name/path/redcap<version>.zip)")]
    ConflictingRedcapSource,

    /// No REDCap install source is set
    #[error("No REDCap install source found, define redCapLocalVersion or redCapS3Path in your stage file")]
    MissingRedcapSource,

    /// No image tag could be derived from the install source
    #[error("Cannot derive an image tag from {0:?}, set deployTag")]
    MissingImageTag(String),

    /// The ECS path has neither a DNS-validated nor an imported certificate
    #[error("Can not deploy ECS Fargate for REDCap without a valid certificate: manage a hosted zone or set ecs.certificateArn")]
    MissingCertificate,

    /// The database stack did not expose a credentials secret
    #[error("No database secret found")]
    MissingDatabaseSecret,

    /// Both backend blocks are configured
    #[error("Both ecs and App Runner settings are present ({}); configure only one backend", .app_runner_keys.join(", "))]
    ConflictingBackends { app_runner_keys: Vec<String> },

    /// The CPU/memory pair is not offered by the chosen backend
    #[error("Unsupported {backend} size: {cpu} with {memory}")]
    UnsupportedSize {
        backend: &'static str,
        cpu: String,
        memory: String,
    },

    /// A hosted zone lookup found nothing
    #[error("Hosted zone not found: {0}")]
    ZoneNotFound(String),

    /// Two resources in one stack resolve to the same logical id
    #[error("Duplicate logical id {logical_id} in stack {stack}")]
    DuplicateLogicalId { stack: String, logical_id: String },

    /// Two WAF rules in one web ACL share a priority
    #[error("WAF rule priority {priority} is used by both {first} and {second}")]
    PriorityCollision {
        priority: u32,
        first: String,
        second: String,
    },

    /// A duration string could not be parsed
    #[error("Invalid duration: {0:?} (expected e.g. 45m, 3h, 1d, at most 365d)")]
    InvalidDuration(String),
}

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, SynthError>;

impl SynthError {
    /// Shorthand for [`SynthError::InvalidSetting`]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        SynthError::InvalidSetting {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
