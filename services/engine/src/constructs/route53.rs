//! Route53 zones, records and certificates

use serde_json::{json, Value};

use crate::context::ZoneLookup;
use crate::error::Result;
use crate::template::{join, ResourceRef, Stack};

/// A public hosted zone, declared in the stack or resolved by lookup
#[derive(Debug, Clone, PartialEq)]
pub struct HostedZone {
    pub zone_name: String,
    pub zone_id: Value,
    /// Name server list, known for declared zones and context lookups
    pub name_servers: Option<Value>,
    /// Set when the zone is declared in the current stack
    pub resource: Option<ResourceRef>,
}

impl HostedZone {
    /// Declare a new public hosted zone
    pub fn create(stack: &mut Stack, id: &str, zone_name: &str) -> Result<Self> {
        let zone = stack.add(
            id,
            "AWS::Route53::HostedZone",
            json!({ "Name": format!("{}.", zone_name.trim_end_matches('.')) }),
        )?;
        Ok(Self {
            zone_name: zone_name.trim_end_matches('.').to_string(),
            zone_id: zone.reference(),
            name_servers: Some(zone.attr("NameServers")),
            resource: Some(zone),
        })
    }

    /// Resolve a zone owned outside this deployment
    pub fn from_lookup(lookup: &dyn ZoneLookup, domain_name: &str) -> Result<Self> {
        let found = lookup.lookup_zone(domain_name)?;
        let name_servers = if found.name_servers.is_empty() {
            None
        } else {
            Some(json!(found.name_servers))
        };
        Ok(Self {
            zone_name: found.zone_name,
            zone_id: json!(found.zone_id),
            name_servers,
            resource: None,
        })
    }

    /// Comma-joined name servers for operator outputs
    pub fn name_servers_joined(&self) -> Option<Value> {
        self.name_servers
            .as_ref()
            .map(|ns| json!({ "Fn::Join": [",", ns] }))
    }
}

/// Remove a record of the same name and type before the new one is created
fn delete_existing_record(
    stack: &mut Stack,
    id: &str,
    zone: &HostedZone,
    record_name: &str,
    record_type: &str,
) -> Result<ResourceRef> {
    stack.add(
        &format!("{}-delete-existing", id),
        "Custom::DeleteExistingRecordSet",
        json!({
            "HostedZoneId": zone.zone_id,
            "RecordName": record_name,
            "RecordType": record_type,
        }),
    )
}

/// NS record in `parent` delegating `record_name` to `name_servers`
pub fn zone_delegation_record(
    stack: &mut Stack,
    id: &str,
    parent: &HostedZone,
    record_name: &str,
    name_servers: Value,
    delete_existing: bool,
) -> Result<ResourceRef> {
    let record = stack.add(
        id,
        "AWS::Route53::RecordSet",
        json!({
            "HostedZoneId": parent.zone_id,
            "Name": record_name,
            "Type": "NS",
            "TTL": "172800",
            "ResourceRecords": name_servers,
        }),
    )?;
    if delete_existing {
        let cleanup = delete_existing_record(stack, id, parent, record_name, "NS")?;
        stack.add_dependency(&record, &cleanup);
    }
    Ok(record)
}

/// NS record with literal values
pub fn ns_record(
    stack: &mut Stack,
    id: &str,
    zone: &HostedZone,
    record_name: &str,
    values: &[String],
) -> Result<ResourceRef> {
    stack.add(
        id,
        "AWS::Route53::RecordSet",
        json!({
            "HostedZoneId": zone.zone_id,
            "Name": record_name,
            "Type": "NS",
            "TTL": "1800",
            "ResourceRecords": values,
        }),
    )
}

/// A-record alias to a regional endpoint
pub fn alias_record(
    stack: &mut Stack,
    id: &str,
    zone: &HostedZone,
    record_name: &str,
    target_dns_name: Value,
    target_zone_id: Value,
) -> Result<ResourceRef> {
    stack.add(
        id,
        "AWS::Route53::RecordSet",
        json!({
            "HostedZoneId": zone.zone_id,
            "Name": record_name,
            "Type": "A",
            "AliasTarget": {
                "DNSName": target_dns_name,
                "HostedZoneId": target_zone_id,
            },
        }),
    )
}

pub fn cname_record(
    stack: &mut Stack,
    id: &str,
    zone: &HostedZone,
    record_name: &str,
    value: Value,
) -> Result<ResourceRef> {
    stack.add(
        id,
        "AWS::Route53::RecordSet",
        json!({
            "HostedZoneId": zone.zone_id,
            "Name": record_name,
            "Type": "CNAME",
            "TTL": "1800",
            "ResourceRecords": [value],
        }),
    )
}

/// MX and TXT records for a mail-from domain
pub fn mail_from_records(
    stack: &mut Stack,
    id: &str,
    zone: &HostedZone,
    mail_from_domain: &str,
    region: &str,
) -> Result<(ResourceRef, ResourceRef)> {
    let mx = stack.add(
        &format!("{}-mx", id),
        "AWS::Route53::RecordSet",
        json!({
            "HostedZoneId": zone.zone_id,
            "Name": mail_from_domain,
            "Type": "MX",
            "TTL": "1800",
            "ResourceRecords": [format!("10 feedback-smtp.{}.amazonses.com", region)],
        }),
    )?;
    let txt = stack.add(
        &format!("{}-spf", id),
        "AWS::Route53::RecordSet",
        json!({
            "HostedZoneId": zone.zone_id,
            "Name": mail_from_domain,
            "Type": "TXT",
            "TTL": "1800",
            "ResourceRecords": ["\"v=spf1 include:amazonses.com ~all\""],
        }),
    )?;
    Ok((mx, txt))
}

/// Where a TLS certificate comes from
#[derive(Debug, Clone)]
pub enum CertificateSource<'a> {
    /// New certificate validated through records in the zone
    Dns {
        zone: &'a HostedZone,
        domain_name: String,
    },
    /// Existing certificate ARN
    Imported(String),
}

/// Declare or import a certificate and return its ARN
pub fn certificate(stack: &mut Stack, id: &str, source: CertificateSource<'_>) -> Result<Value> {
    match source {
        CertificateSource::Dns { zone, domain_name } => {
            let cert = stack.add(
                id,
                "AWS::CertificateManager::Certificate",
                json!({
                    "DomainName": domain_name,
                    "ValidationMethod": "DNS",
                    "DomainValidationOptions": [{
                        "DomainName": domain_name,
                        "HostedZoneId": zone.zone_id,
                    }],
                }),
            )?;
            Ok(cert.reference())
        }
        CertificateSource::Imported(arn) => Ok(json!(arn)),
    }
}

/// `https://` + host
pub fn https_url(host: Value) -> Value {
    match host {
        Value::String(host) => json!(format!("https://{}", host)),
        other => join("", vec![json!("https://"), other]),
    }
}
