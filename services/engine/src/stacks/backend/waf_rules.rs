//! REDCap-specific firewall rules layered over the baseline

use crate::config::{parse_allowed_countries, RedcapConfig};
use crate::constructs::waf::{FieldToMatch, PositionalConstraint, RuleAction, RuleBody, Statement, WafRule};
use crate::error::Result;
use crate::signing::cron_token;

pub const CRON_RULE_KEY: &str = "REDCAP-cronjob";
pub const COUNTRY_RULE_KEY: &str = "country-list";
/// Query parameter carrying the cron token
pub const CRON_SECRET_PARAM: &str = "secret";

const CRON_RULE_PRIORITY: u32 = 20;
const COUNTRY_RULE_PRIORITY: u32 = 10;

/// Block calls to the cron endpoint that do not carry `token`
pub fn cron_rule(token: &str, priority: Option<u32>) -> WafRule {
    WafRule {
        name: CRON_RULE_KEY.to_string(),
        rule: RuleBody {
            name: "cron-execution".to_string(),
            priority: priority.unwrap_or(CRON_RULE_PRIORITY),
            statement: Statement::And(vec![
                Statement::cron_path(),
                Statement::not(Statement::ByteMatch {
                    search_string: token.to_string(),
                    field: FieldToMatch::QueryArgument(CRON_SECRET_PARAM.to_string()),
                    constraint: PositionalConstraint::Exactly,
                }),
            ]),
            action: RuleAction::Block,
            metric_name: "redcap-cron-exec".to_string(),
        },
    }
}

/// Block sources outside `countries`, except for the cron endpoint
///
/// An empty list means no geo restriction.
pub fn country_rule(countries: &[String], priority: Option<u32>) -> Option<WafRule> {
    if countries.is_empty() {
        return None;
    }
    Some(WafRule {
        name: COUNTRY_RULE_KEY.to_string(),
        rule: RuleBody {
            name: COUNTRY_RULE_KEY.to_string(),
            priority: priority.unwrap_or(COUNTRY_RULE_PRIORITY),
            statement: Statement::And(vec![
                Statement::not(Statement::GeoMatch {
                    country_codes: countries.to_vec(),
                }),
                Statement::not(Statement::cron_path()),
            ]),
            action: RuleAction::BlockWithResponse { status: 403 },
            metric_name: COUNTRY_RULE_KEY.to_string(),
        },
    })
}

/// Extra rules of a stage and the cron token they protect
#[derive(Debug, Clone, PartialEq)]
pub struct StageRules {
    pub rules: Vec<WafRule>,
    pub cron_token: Option<String>,
}

pub fn stage_rules(cfg: &RedcapConfig) -> Result<StageRules> {
    let mut rules = Vec::new();

    let token = match cfg.cron_secret.as_deref() {
        Some(secret) => {
            let token = cron_token(secret)?;
            rules.push(cron_rule(&token, None));
            Some(token)
        }
        None => None,
    };

    let countries = parse_allowed_countries(&cfg.allowed_countries)?;
    rules.extend(country_rule(&countries, None));

    Ok(StageRules {
        rules,
        cron_token: token,
    })
}
