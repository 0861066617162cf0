//! Route53NS stack: delegate application subdomains from a shared zone

use tracing::{info, warn};

use crate::config::DomainAppsConfig;
use crate::constructs::route53::ns_record;
use crate::constructs::HostedZone;
use crate::context::ZoneLookup;
use crate::error::Result;
use crate::template::{SynthMode, Stack};

pub fn build(stage: &str, cfg: &DomainAppsConfig, lookup: &dyn ZoneLookup, mode: SynthMode) -> Result<Stack> {
    let mut stack = super::stage_stack(stage, &cfg.name, &cfg.region, "Route53NS", mode);

    if cfg.domain.trim().is_empty() || cfg.apps.is_empty() {
        warn!(stage = %stage, "No domain or apps configured, nothing to delegate");
        return Ok(stack);
    }

    let zone = HostedZone::from_lookup(lookup, &cfg.domain)?;
    for app in &cfg.apps {
        ns_record(
            &mut stack,
            &format!("ns-{}-{}", cfg.domain, app.name),
            &zone,
            &format!("{}.{}", app.name, zone.zone_name),
            &app.ns_records,
        )?;
    }
    info!(zone = %zone.zone_name, apps = cfg.apps.len(), "Delegated application subdomains");
    Ok(stack)
}
