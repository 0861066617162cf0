//! Web application firewall
//!
//! Rules are typed values until they are rendered into a `AWS::WAFv2::WebACL`.
//! [`compose_rules`] merges the baseline with caller rules; [`evaluate`] runs a
//! request through the terminating rules of a list, which is how the cron
//! exemptions are checked without deploying anything.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde_json::{json, Value};
use tracing::debug;

use crate::config::Ipv4Cidr;
use crate::error::{Result, SynthError};
use crate::template::{ResourceRef, Stack};

/// Path suffix of the REDCap maintenance endpoint
pub const CRON_PATH: &str = "cron.php";

/// Body key of the custom 403 response
pub const DENIED_BODY_KEY: &str = "response";

/// Part of the request a byte match inspects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldToMatch {
    UriPath,
    QueryArgument(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionalConstraint {
    Exactly,
    StartsWith,
    EndsWith,
    Contains,
}

impl PositionalConstraint {
    fn as_str(self) -> &'static str {
        match self {
            PositionalConstraint::Exactly => "EXACTLY",
            PositionalConstraint::StartsWith => "STARTS_WITH",
            PositionalConstraint::EndsWith => "ENDS_WITH",
            PositionalConstraint::Contains => "CONTAINS",
        }
    }

    fn test(self, haystack: &str, needle: &str) -> bool {
        match self {
            PositionalConstraint::Exactly => haystack == needle,
            PositionalConstraint::StartsWith => haystack.starts_with(needle),
            PositionalConstraint::EndsWith => haystack.ends_with(needle),
            PositionalConstraint::Contains => haystack.contains(needle),
        }
    }
}

/// Match statement of a rule
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    ByteMatch {
        search_string: String,
        field: FieldToMatch,
        constraint: PositionalConstraint,
    },
    IpSetReference {
        arn: Value,
        addresses: Vec<Ipv4Cidr>,
    },
    GeoMatch {
        country_codes: Vec<String>,
    },
    RateBased {
        limit: u32,
    },
    ManagedRuleGroup {
        vendor: String,
        name: String,
        excluded_rules: Vec<String>,
    },
    And(Vec<Statement>),
    Not(Box<Statement>),
}

impl Statement {
    /// Requests whose path ends with `cron.php`
    pub fn cron_path() -> Self {
        Statement::ByteMatch {
            search_string: CRON_PATH.to_string(),
            field: FieldToMatch::UriPath,
            constraint: PositionalConstraint::EndsWith,
        }
    }

    pub fn not(statement: Statement) -> Self {
        Statement::Not(Box::new(statement))
    }

    fn managed(name: &str, excluded_rules: &[&str]) -> Self {
        Statement::ManagedRuleGroup {
            vendor: "AWS".to_string(),
            name: name.to_string(),
            excluded_rules: excluded_rules.iter().map(|r| r.to_string()).collect(),
        }
    }

    /// True when this statement is the cron path match or excludes it
    pub fn exempts_cron_path(&self) -> bool {
        match self {
            Statement::And(statements) => statements
                .iter()
                .any(|s| matches!(s, Statement::Not(inner) if **inner == Statement::cron_path())),
            _ => false,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Statement::ByteMatch {
                search_string,
                field,
                constraint,
            } => {
                let field = match field {
                    FieldToMatch::UriPath => json!({ "UriPath": {} }),
                    FieldToMatch::QueryArgument(name) => {
                        json!({ "SingleQueryArgument": { "Name": name } })
                    }
                };
                json!({
                    "ByteMatchStatement": {
                        "SearchString": search_string,
                        "FieldToMatch": field,
                        "TextTransformations": [{ "Priority": 0, "Type": "NONE" }],
                        "PositionalConstraint": constraint.as_str(),
                    }
                })
            }
            Statement::IpSetReference { arn, .. } => {
                json!({ "IPSetReferenceStatement": { "Arn": arn } })
            }
            Statement::GeoMatch { country_codes } => {
                json!({ "GeoMatchStatement": { "CountryCodes": country_codes } })
            }
            Statement::RateBased { limit } => {
                json!({ "RateBasedStatement": { "Limit": limit, "AggregateKeyType": "IP" } })
            }
            Statement::ManagedRuleGroup {
                vendor,
                name,
                excluded_rules,
            } => {
                let mut group = json!({ "VendorName": vendor, "Name": name });
                if !excluded_rules.is_empty() {
                    group["ExcludedRules"] = excluded_rules
                        .iter()
                        .map(|r| json!({ "Name": r }))
                        .collect::<Vec<_>>()
                        .into();
                }
                json!({ "ManagedRuleGroupStatement": group })
            }
            Statement::And(statements) => json!({
                "AndStatement": {
                    "Statements": statements.iter().map(Statement::to_json).collect::<Vec<_>>()
                }
            }),
            Statement::Not(inner) => json!({ "NotStatement": { "Statement": inner.to_json() } }),
        }
    }

    /// Evaluate against a request; `None` when the statement depends on
    /// state outside the request (rate counters, managed rule groups)
    pub fn matches(&self, request: &HttpRequest) -> Option<bool> {
        match self {
            Statement::ByteMatch {
                search_string,
                field,
                constraint,
            } => Some(match field {
                FieldToMatch::UriPath => constraint.test(&request.path, search_string),
                FieldToMatch::QueryArgument(name) => request
                    .query_argument(name)
                    .is_some_and(|value| constraint.test(value, search_string)),
            }),
            Statement::IpSetReference { addresses, .. } => {
                Some(addresses.iter().any(|cidr| cidr.contains(request.source_ip)))
            }
            Statement::GeoMatch { country_codes } => Some(
                country_codes
                    .iter()
                    .any(|code| code.eq_ignore_ascii_case(&request.country)),
            ),
            Statement::RateBased { .. } | Statement::ManagedRuleGroup { .. } => None,
            Statement::And(statements) => {
                let mut all = true;
                for statement in statements {
                    all &= statement.matches(request)?;
                }
                Some(all)
            }
            Statement::Not(inner) => inner.matches(request).map(|m| !m),
        }
    }
}

/// What a matching rule does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Block,
    /// Block with a custom status and the shared response body
    BlockWithResponse { status: u16 },
    /// Managed rule groups keep their own actions
    NoOverride,
}

impl RuleAction {
    fn denied() -> Self {
        RuleAction::BlockWithResponse { status: 403 }
    }
}

/// Rule body as attached to the web ACL
#[derive(Debug, Clone, PartialEq)]
pub struct RuleBody {
    pub name: String,
    pub priority: u32,
    pub statement: Statement,
    pub action: RuleAction,
    pub metric_name: String,
}

impl RuleBody {
    pub fn to_json(&self) -> Value {
        let mut rule = json!({
            "Name": self.name,
            "Priority": self.priority,
            "Statement": self.statement.to_json(),
            "VisibilityConfig": {
                "SampledRequestsEnabled": true,
                "CloudWatchMetricsEnabled": true,
                "MetricName": self.metric_name,
            },
        });
        match &self.action {
            RuleAction::Allow => rule["Action"] = json!({ "Allow": {} }),
            RuleAction::Block => rule["Action"] = json!({ "Block": {} }),
            RuleAction::BlockWithResponse { status } => {
                rule["Action"] = json!({
                    "Block": {
                        "CustomResponse": {
                            "ResponseCode": status,
                            "CustomResponseBodyKey": DENIED_BODY_KEY,
                        }
                    }
                })
            }
            RuleAction::NoOverride => rule["OverrideAction"] = json!({ "None": {} }),
        }
        rule
    }
}

/// A rule keyed by a unique name
#[derive(Debug, Clone, PartialEq)]
pub struct WafRule {
    pub name: String,
    pub rule: RuleBody,
}

impl WafRule {
    pub fn priority(&self) -> u32 {
        self.rule.priority
    }
}

fn managed_rule(key: &str, group: &str, priority: u32, excluded: &[&str], metric: &str) -> WafRule {
    WafRule {
        name: key.to_string(),
        rule: RuleBody {
            name: key.to_string(),
            priority,
            statement: Statement::managed(group, excluded),
            action: RuleAction::NoOverride,
            metric_name: metric.to_string(),
        },
    }
}

/// The five rules every web ACL starts from
pub fn baseline_rules() -> Vec<WafRule> {
    vec![
        WafRule {
            name: "rate-filter".to_string(),
            rule: RuleBody {
                name: "rate-filter".to_string(),
                priority: 30,
                statement: Statement::RateBased { limit: 3000 },
                action: RuleAction::Block,
                metric_name: "rate-filter".to_string(),
            },
        },
        managed_rule(
            "AWS-AWSManagedRulesAmazonIpReputationList",
            "AWSManagedRulesAmazonIpReputationList",
            200,
            &[],
            "AWSManagedRulesAmazonIpReputationList",
        ),
        // Body rules are excluded so SNS notifications and file uploads pass
        managed_rule(
            "AWS-AWSManagedRulesCommonRuleSet",
            "AWSManagedRulesCommonRuleSet",
            300,
            &[
                "GenericRFI_BODY",
                "SizeRestrictions_BODY",
                "CrossSiteScripting_BODY",
                "NoUserAgent_HEADER",
            ],
            "AWS-AWSManagedRulesCommonRuleSet",
        ),
        managed_rule(
            "AWS-AWSManagedRulesKnownBadInputsRuleSet",
            "AWSManagedRulesKnownBadInputsRuleSet",
            400,
            &[],
            "AWS-AWSManagedRulesKnownBadInputsRuleSet",
        ),
        managed_rule(
            "AWS-AWSManagedRulesSQLiRuleSet",
            "AWSManagedRulesSQLiRuleSet",
            500,
            &[],
            "AWS-AWSManagedRulesSQLiRuleSet",
        ),
    ]
}

/// Block everything outside the allow-list except the cron endpoint
pub fn ip_filter_rule(ip_set_arn: Value, addresses: Vec<Ipv4Cidr>, priority: Option<u32>) -> WafRule {
    WafRule {
        name: "ip-filter".to_string(),
        rule: RuleBody {
            name: "ip-filter".to_string(),
            priority: priority.unwrap_or(40),
            statement: Statement::And(vec![
                Statement::not(Statement::IpSetReference {
                    arn: ip_set_arn,
                    addresses,
                }),
                Statement::not(Statement::cron_path()),
            ]),
            action: RuleAction::denied(),
            metric_name: "ip-filter".to_string(),
        },
    }
}

/// Merge baseline and caller rules into one priority-ordered list
///
/// Rules are keyed by name and a later rule replaces an earlier one with the
/// same name, so caller rules override baseline rules. Two different rules on
/// the same priority are rejected.
pub fn compose_rules(baseline: &[WafRule], extra: &[WafRule]) -> Result<Vec<WafRule>> {
    let mut merged: Vec<WafRule> = Vec::with_capacity(baseline.len() + extra.len());
    for rule in baseline.iter().chain(extra) {
        match merged.iter().position(|r| r.name == rule.name) {
            Some(pos) => merged[pos] = rule.clone(),
            None => merged.push(rule.clone()),
        }
    }
    merged.sort_by_key(WafRule::priority);

    for pair in merged.windows(2) {
        if pair[0].priority() == pair[1].priority() {
            return Err(SynthError::PriorityCollision {
                priority: pair[0].priority(),
                first: pair[0].name.clone(),
                second: pair[1].name.clone(),
            });
        }
    }
    Ok(merged)
}

/// A request as seen by the firewall
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub source_ip: Ipv4Addr,
    /// ISO 3166 alpha-2 code of the source
    pub country: String,
}

impl HttpRequest {
    pub fn new(path: &str, source_ip: Ipv4Addr, country: &str) -> Self {
        Self {
            path: path.to_string(),
            query: BTreeMap::new(),
            source_ip,
            country: country.to_string(),
        }
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    fn query_argument(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Outcome of [`evaluate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block { rule: String, status: u16 },
}

/// Run a request through the rules in priority order
///
/// The first matching terminating rule decides. Rules that cannot be decided
/// from the request alone are skipped; the default action allows.
pub fn evaluate(rules: &[WafRule], request: &HttpRequest) -> Verdict {
    for rule in rules {
        if rule.rule.statement.matches(request) != Some(true) {
            continue;
        }
        match rule.rule.action {
            RuleAction::Allow => return Verdict::Allow,
            RuleAction::Block => {
                return Verdict::Block {
                    rule: rule.name.clone(),
                    status: 403,
                }
            }
            RuleAction::BlockWithResponse { status } => {
                return Verdict::Block {
                    rule: rule.name.clone(),
                    status,
                }
            }
            RuleAction::NoOverride => {}
        }
    }
    Verdict::Allow
}

/// Where the web ACL is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WafScope {
    #[default]
    Regional,
    CloudFront,
}

impl WafScope {
    fn as_str(self) -> &'static str {
        match self {
            WafScope::Regional => "REGIONAL",
            WafScope::CloudFront => "CLOUDFRONT",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WebAclProps {
    pub scope: WafScope,
    pub allowed_ips: Vec<Ipv4Cidr>,
    pub extra_rules: Vec<WafRule>,
}

/// A declared web ACL and the rules it carries
#[derive(Debug, Clone)]
pub struct WebAcl {
    pub acl: ResourceRef,
    pub ip_set: Option<ResourceRef>,
    pub rules: Vec<WafRule>,
}

impl WebAcl {
    pub fn new(stack: &mut Stack, id: &str, props: WebAclProps) -> Result<Self> {
        let mut extra = props.extra_rules;

        let ip_set = if props.allowed_ips.is_empty() {
            None
        } else {
            let addresses: Vec<String> = props.allowed_ips.iter().map(|c| c.to_string()).collect();
            let ip_set = stack.add(
                &format!("{}-ipset", id),
                "AWS::WAFv2::IPSet",
                json!({
                    "Addresses": addresses,
                    "IPAddressVersion": "IPV4",
                    "Scope": props.scope.as_str(),
                    "Description": "Webapp allowed IPV4",
                    "Name": format!("{}-webapp-ip-list", id),
                }),
            )?;
            extra.push(ip_filter_rule(ip_set.arn(), props.allowed_ips.clone(), None));
            Some(ip_set)
        };

        let rules = compose_rules(&baseline_rules(), &extra)?;
        debug!(web_acl = %id, rules = rules.len(), "Composed WAF rules");

        let acl = stack.add(
            &format!("{}-WAFv2", id),
            "AWS::WAFv2::WebACL",
            json!({
                "DefaultAction": { "Allow": {} },
                "Scope": props.scope.as_str(),
                "Name": format!("{}-waf", id),
                "VisibilityConfig": {
                    "CloudWatchMetricsEnabled": true,
                    "MetricName": format!("{}-metric", id),
                    "SampledRequestsEnabled": false,
                },
                "CustomResponseBodies": {
                    DENIED_BODY_KEY: {
                        "ContentType": "TEXT_HTML",
                        "Content": "<div> Access denied </div>",
                    }
                },
                "Rules": rules.iter().map(|r| r.rule.to_json()).collect::<Vec<_>>(),
            }),
        )?;

        Ok(Self { acl, ip_set, rules })
    }

    /// Attach the web ACL to a regional resource (App Runner service or ALB)
    pub fn associate(&self, stack: &mut Stack, id: &str, resource_arn: Value) -> Result<ResourceRef> {
        stack.add(
            id,
            "AWS::WAFv2::WebACLAssociation",
            json!({
                "ResourceArn": resource_arn,
                "WebACLArn": self.acl.arn(),
            }),
        )
    }

    pub fn rule(&self, name: &str) -> Option<&WafRule> {
        self.rules.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow_list() -> Vec<Ipv4Cidr> {
        vec![Ipv4Cidr::parse("203.0.113.0/24").unwrap()]
    }

    fn custom_rule(name: &str, priority: u32) -> WafRule {
        WafRule {
            name: name.to_string(),
            rule: RuleBody {
                name: name.to_string(),
                priority,
                statement: Statement::cron_path(),
                action: RuleAction::Block,
                metric_name: name.to_string(),
            },
        }
    }

    #[test]
    fn test_baseline_is_sorted_and_unique() {
        let rules = compose_rules(&baseline_rules(), &[]).unwrap();
        let priorities: Vec<u32> = rules.iter().map(WafRule::priority).collect();
        assert_eq!(priorities, vec![30, 200, 300, 400, 500]);
    }

    #[test]
    fn test_caller_rule_replaces_baseline() {
        let replacement = custom_rule("rate-filter", 35);
        let rules = compose_rules(&baseline_rules(), &[replacement.clone()]).unwrap();
        assert_eq!(rules.len(), 5);
        assert_eq!(rules[0], replacement);
    }

    #[test]
    fn test_composition_is_idempotent() {
        let extra = vec![custom_rule("a", 10), custom_rule("b", 20)];
        let first = compose_rules(&baseline_rules(), &extra).unwrap();
        let second = compose_rules(&baseline_rules(), &extra).unwrap();
        assert_eq!(first, second);

        let remerged = compose_rules(&first, &extra).unwrap();
        assert_eq!(first, remerged);
    }

    #[test]
    fn test_priority_collision_rejected() {
        let err = compose_rules(&baseline_rules(), &[custom_rule("mine", 200)]).unwrap_err();
        assert!(matches!(err, SynthError::PriorityCollision { priority: 200, .. }));
    }

    #[test]
    fn test_ip_filter_exempts_cron_path() {
        let rule = ip_filter_rule(json!("arn"), allow_list(), None);
        assert_eq!(rule.priority(), 40);
        assert!(rule.rule.statement.exempts_cron_path());

        let rules = compose_rules(&baseline_rules(), &[rule]).unwrap();
        let outsider: Ipv4Addr = "198.51.100.7".parse().unwrap();
        let insider: Ipv4Addr = "203.0.113.9".parse().unwrap();

        assert_eq!(
            evaluate(&rules, &HttpRequest::new("/index.php", outsider, "US")),
            Verdict::Block {
                rule: "ip-filter".to_string(),
                status: 403
            }
        );
        assert_eq!(evaluate(&rules, &HttpRequest::new("/index.php", insider, "US")), Verdict::Allow);
        assert_eq!(evaluate(&rules, &HttpRequest::new("/cron.php", outsider, "US")), Verdict::Allow);
    }

    #[test]
    fn test_rule_json_shape() {
        let rule = ip_filter_rule(json!({ "Fn::GetAtt": ["ipset", "Arn"] }), allow_list(), None);
        let value = rule.rule.to_json();
        assert_eq!(value["Action"]["Block"]["CustomResponse"]["ResponseCode"], 403);
        let statements = &value["Statement"]["AndStatement"]["Statements"];
        assert_eq!(
            statements[0]["NotStatement"]["Statement"]["IPSetReferenceStatement"]["Arn"],
            json!({ "Fn::GetAtt": ["ipset", "Arn"] })
        );
        assert_eq!(
            statements[1]["NotStatement"]["Statement"]["ByteMatchStatement"]["PositionalConstraint"],
            "ENDS_WITH"
        );

        let managed = baseline_rules()[2].rule.to_json();
        assert_eq!(managed["OverrideAction"], json!({ "None": {} }));
        assert_eq!(
            managed["Statement"]["ManagedRuleGroupStatement"]["ExcludedRules"][0]["Name"],
            "GenericRFI_BODY"
        );
    }

    #[test]
    fn test_web_acl_with_allow_list() {
        let mut stack = Stack::new("dev-REDCap-Backend", "us-east-1");
        let waf = WebAcl::new(
            &mut stack,
            "dev-REDCap-appwaf",
            WebAclProps {
                allowed_ips: allow_list(),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(waf.ip_set.is_some());
        assert_eq!(waf.rules.iter().filter(|r| r.name == "ip-filter").count(), 1);

        let doc = stack.to_document();
        let acl = &doc["Resources"]["devREDCapappwafWAFv2"]["Properties"];
        assert_eq!(acl["Name"], "dev-REDCap-appwaf-waf");
        assert_eq!(acl["DefaultAction"], json!({ "Allow": {} }));
        assert_eq!(acl["Rules"].as_array().unwrap().len(), 6);
        assert_eq!(
            doc["Resources"]["devREDCapappwafipset"]["Properties"]["Name"],
            "dev-REDCap-appwaf-webapp-ip-list"
        );
    }

    #[test]
    fn test_web_acl_without_allow_list() {
        let mut stack = Stack::new("s", "us-east-1");
        let waf = WebAcl::new(&mut stack, "waf", WebAclProps::default()).unwrap();
        assert!(waf.ip_set.is_none());
        assert!(waf.rule("ip-filter").is_none());
        assert_eq!(stack.resources_of_type("AWS::WAFv2::IPSet").count(), 0);
    }

    #[test]
    fn test_association() {
        let mut stack = Stack::new("s", "us-east-1");
        let waf = WebAcl::new(&mut stack, "waf", WebAclProps::default()).unwrap();
        let assoc = waf.associate(&mut stack, "apprunner-redcap", json!("arn:service")).unwrap();
        let props = &stack.resource(&assoc).unwrap().properties;
        assert_eq!(props["WebACLArn"], waf.acl.arn());
    }
}
