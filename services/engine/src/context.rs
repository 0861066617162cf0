//! Lookup context
//!
//! Hosted zones owned outside the deployment are resolved from a context file
//! (`lookups.json`) instead of live API calls, so synthesis stays offline and
//! repeatable.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SynthError};

/// A hosted zone resolved by lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookedUpZone {
    pub zone_id: String,
    /// Zone name without the trailing dot
    #[serde(default)]
    pub zone_name: String,
    #[serde(default)]
    pub name_servers: Vec<String>,
}

/// Resolves externally owned hosted zones by domain name
pub trait ZoneLookup {
    fn lookup_zone(&self, domain_name: &str) -> Result<LookedUpZone>;
}

/// Zone lookups backed by a JSON context file
///
/// ```json
/// { "hostedZones": { "example.com": { "zoneId": "Z123", "nameServers": ["ns-1.awsdns-00.org"] } } }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupContext {
    #[serde(default)]
    hosted_zones: BTreeMap<String, LookedUpZone>,
}

fn normalize(domain_name: &str) -> String {
    domain_name.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl LookupContext {
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: LookupContext = serde_json::from_str(json)?;
        let hosted_zones = raw
            .hosted_zones
            .into_iter()
            .map(|(name, mut zone)| {
                let key = normalize(&name);
                if zone.zone_name.is_empty() {
                    zone.zone_name = key.clone();
                }
                (key, zone)
            })
            .collect();
        Ok(Self { hosted_zones })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            SynthError::invalid("lookups file", format!("{}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn insert(&mut self, domain_name: &str, zone_id: &str, name_servers: Vec<String>) {
        let key = normalize(domain_name);
        self.hosted_zones.insert(
            key.clone(),
            LookedUpZone {
                zone_id: zone_id.to_string(),
                zone_name: key,
                name_servers,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.hosted_zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosted_zones.is_empty()
    }
}

impl ZoneLookup for LookupContext {
    fn lookup_zone(&self, domain_name: &str) -> Result<LookedUpZone> {
        let key = normalize(domain_name);
        let zone = self
            .hosted_zones
            .get(&key)
            .cloned()
            .ok_or_else(|| SynthError::ZoneNotFound(domain_name.to_string()))?;
        debug!(domain = %key, zone_id = %zone.zone_id, "Resolved hosted zone from context");
        Ok(zone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const LOOKUPS: &str = r#"{
  "hostedZones": {
    "Example.com.": { "zoneId": "Z0123456789", "nameServers": ["ns-1.awsdns-00.org"] }
  }
}"#;

    #[test]
    fn test_lookup_normalizes_names() {
        let ctx = LookupContext::from_json(LOOKUPS).unwrap();
        let zone = ctx.lookup_zone("example.com").unwrap();
        assert_eq!(zone.zone_id, "Z0123456789");
        assert_eq!(zone.zone_name, "example.com");
        assert_eq!(ctx.lookup_zone("EXAMPLE.COM.").unwrap(), zone);
    }

    #[test]
    fn test_missing_zone_is_terminal() {
        let ctx = LookupContext::default();
        assert!(ctx.is_empty());
        assert!(matches!(
            ctx.lookup_zone("example.org"),
            Err(SynthError::ZoneNotFound(name)) if name == "example.org"
        ));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            LookupContext::from_json("{ not json"),
            Err(SynthError::ContextParse(_))
        ));
    }

    #[tokio::test]
    async fn test_load_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LOOKUPS.as_bytes()).unwrap();
        let ctx = LookupContext::load(file.path()).await.unwrap();
        assert_eq!(ctx.len(), 1);
    }
}
