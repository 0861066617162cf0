//! REDCap on AWS deployment planner
//!
//! Turns one stage of a stage file into an ordered set of CloudFormation
//! stacks: network, image pipeline, database, backend and the optional extras.

pub mod config;
pub mod constructs;
pub mod context;
pub mod error;
pub mod signing;
pub mod stacks;
pub mod template;

pub use config::{RedcapConfig, StageSettings, StagesFile};
pub use context::{LookupContext, ZoneLookup};
pub use error::{Result, SynthError};
pub use stacks::{synth_app, App, SynthOptions};
pub use template::{Stack, SynthMode};
