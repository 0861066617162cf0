//! Hosting strategy for the public DNS zone
//!
//! `domain`, `subdomain` and `hostInRoute53` collapse into one
//! [`DomainStrategy`], resolved once, then applied to the backend stack.

use tracing::{debug, info};

use crate::config::{HostInRoute53, RedcapConfig};
use crate::constructs::route53::zone_delegation_record;
use crate::constructs::HostedZone;
use crate::context::ZoneLookup;
use crate::error::{Result, SynthError};
use crate::template::Stack;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainStrategy {
    /// No zone is managed; the service endpoint is used as is
    None,
    /// Create a public zone
    NewZone { zone_name: String },
    /// Reuse a zone owned outside the deployment
    ExternalLookup { zone: String },
    /// Create `child` and delegate it from the looked-up `root`
    DelegatedSubdomain { root: String, child: String },
}

impl DomainStrategy {
    pub fn resolve(domain: Option<&str>, subdomain: Option<&str>, host_in_route53: &HostInRoute53) -> Self {
        let Some(domain) = domain else {
            return DomainStrategy::None;
        };
        match (host_in_route53, subdomain) {
            (HostInRoute53::Disabled, _) => DomainStrategy::None,
            (HostInRoute53::Create, Some(sub)) => DomainStrategy::NewZone {
                zone_name: format!("{}.{}", sub, domain),
            },
            (HostInRoute53::Create, None) => DomainStrategy::NewZone {
                zone_name: domain.to_string(),
            },
            (HostInRoute53::Existing(zone), None) => DomainStrategy::ExternalLookup { zone: zone.clone() },
            (HostInRoute53::Existing(zone), Some(sub)) => DomainStrategy::DelegatedSubdomain {
                root: zone.clone(),
                child: format!("{}.{}", sub, domain),
            },
        }
    }

    pub fn from_config(cfg: &RedcapConfig) -> Self {
        Self::resolve(cfg.domain(), cfg.subdomain(), &cfg.host_in_route53)
    }

    /// Declare or look up the zone; `prefix` is `{stage}-{name}`
    pub fn apply(&self, stack: &mut Stack, prefix: &str, lookup: &dyn ZoneLookup) -> Result<Option<HostedZone>> {
        let zone = match self {
            DomainStrategy::None => None,
            DomainStrategy::NewZone { zone_name } => {
                Some(HostedZone::create(stack, &format!("{}-hostedzone", prefix), zone_name)?)
            }
            DomainStrategy::ExternalLookup { zone } => Some(HostedZone::from_lookup(lookup, zone)?),
            DomainStrategy::DelegatedSubdomain { root, child } => {
                let root_zone = HostedZone::from_lookup(lookup, root)?;
                let child_zone = HostedZone::create(stack, &format!("{}-hostedzone", prefix), child)?;
                let name_servers = child_zone
                    .name_servers
                    .clone()
                    .ok_or_else(|| SynthError::ZoneNotFound(child.clone()))?;
                let record = zone_delegation_record(
                    stack,
                    &format!("{}-delegation-records", prefix),
                    &root_zone,
                    child,
                    name_servers,
                    true,
                )?;
                if let Some(child_resource) = &child_zone.resource {
                    stack.add_dependency(&record, child_resource);
                }
                debug!(root = %root_zone.zone_name, child = %child, "Delegated subdomain");
                Some(child_zone)
            }
        };
        if let Some(zone) = &zone {
            info!(strategy = self.label(), zone = %zone.zone_name, "Resolved hosted zone");
        }
        Ok(zone)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DomainStrategy::None => "none",
            DomainStrategy::NewZone { .. } => "new-zone",
            DomainStrategy::ExternalLookup { .. } => "external-lookup",
            DomainStrategy::DelegatedSubdomain { .. } => "delegated-subdomain",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LookupContext;
    use serde_json::json;

    fn existing(zone: &str) -> HostInRoute53 {
        HostInRoute53::Existing(zone.to_string())
    }

    fn lookups() -> LookupContext {
        let mut ctx = LookupContext::default();
        ctx.insert("example.com", "Z123", vec!["ns-1.awsdns-00.org".to_string()]);
        ctx
    }

    #[test]
    fn test_resolve_branches() {
        assert_eq!(DomainStrategy::resolve(None, Some("app"), &HostInRoute53::Create), DomainStrategy::None);
        assert_eq!(
            DomainStrategy::resolve(Some("example.com"), None, &HostInRoute53::Disabled),
            DomainStrategy::None
        );
        assert_eq!(
            DomainStrategy::resolve(Some("example.com"), Some("app"), &HostInRoute53::Create),
            DomainStrategy::NewZone {
                zone_name: "app.example.com".to_string()
            }
        );
        assert_eq!(
            DomainStrategy::resolve(Some("example.com"), None, &existing("example.com")),
            DomainStrategy::ExternalLookup {
                zone: "example.com".to_string()
            }
        );
        assert_eq!(
            DomainStrategy::resolve(Some("example.com"), Some("app"), &existing("example.com")),
            DomainStrategy::DelegatedSubdomain {
                root: "example.com".to_string(),
                child: "app.example.com".to_string()
            }
        );
    }

    #[test]
    fn test_delegation_record_points_at_child_zone() {
        let mut stack = Stack::new("dev-REDCap-Backend", "us-east-1");
        let strategy = DomainStrategy::resolve(Some("example.com"), Some("app"), &existing("example.com"));
        let zone = strategy
            .apply(&mut stack, "dev-REDCap", &lookups())
            .unwrap()
            .unwrap();
        assert_eq!(zone.zone_name, "app.example.com");

        let (_, record) = stack
            .resources_of_type("AWS::Route53::RecordSet")
            .find(|(_, r)| r.properties["Type"] == "NS")
            .unwrap();
        assert_eq!(record.properties["Name"], "app.example.com");
        assert_eq!(record.properties["HostedZoneId"], "Z123");
        assert_eq!(record.properties["ResourceRecords"], json!({ "Fn::GetAtt": ["devREDCaphostedzone", "NameServers"] }));
        assert!(record.depends_on.contains(&"devREDCaphostedzone".to_string()));
        assert_eq!(stack.resources_of_type("Custom::DeleteExistingRecordSet").count(), 1);
    }

    #[test]
    fn test_external_lookup_declares_nothing() {
        let mut stack = Stack::new("dev-REDCap-Backend", "us-east-1");
        let strategy = DomainStrategy::resolve(Some("example.com"), None, &existing("example.com"));
        let zone = strategy.apply(&mut stack, "dev-REDCap", &lookups()).unwrap().unwrap();
        assert_eq!(zone.zone_id, json!("Z123"));
        assert_eq!(stack.resource_count(), 0);
    }

    #[test]
    fn test_missing_external_zone_is_fatal() {
        let mut stack = Stack::new("dev-REDCap-Backend", "us-east-1");
        let strategy = DomainStrategy::resolve(Some("other.org"), None, &existing("other.org"));
        assert!(matches!(
            strategy.apply(&mut stack, "dev-REDCap", &lookups()),
            Err(SynthError::ZoneNotFound(_))
        ));
    }
}
