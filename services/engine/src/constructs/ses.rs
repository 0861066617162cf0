//! Amazon SES identity and SMTP credentials

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::constructs::function::{Function, FunctionProps};
use crate::constructs::iam::{grant, Grantee, PolicyStatement};
use crate::constructs::route53::{mail_from_records, HostedZone};
use crate::error::{Result, SynthError};
use crate::template::{RemovalPolicy, ResourceRef, Stack};

/// What SES verifies for sending
#[derive(Debug, Clone)]
pub enum EmailIdentity<'a> {
    /// Domain identity of a managed zone, records written into the zone
    HostedZone(&'a HostedZone),
    /// Single address verification
    Address(String),
}

impl<'a> EmailIdentity<'a> {
    /// Prefer the managed zone, fall back to the configured address
    pub fn resolve(zone: Option<&'a HostedZone>, email: Option<&str>) -> Result<Self> {
        match (zone, email) {
            (Some(zone), _) => Ok(EmailIdentity::HostedZone(zone)),
            (None, Some(email)) => {
                warn!(email = %email, "No managed zone, SES will only verify a single address");
                Ok(EmailIdentity::Address(email.to_string()))
            }
            (None, None) => Err(SynthError::MissingEmailIdentity),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SesProps<'a> {
    pub identity: EmailIdentity<'a>,
    /// Group allowed to send, usually the SES access user's group
    pub group: ResourceRef,
    pub user: ResourceRef,
    /// Secret with an access key to turn into SMTP credentials
    pub transform_credentials: Option<ResourceRef>,
    pub bounce_notification_email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SimpleEmailService {
    /// Secret populated with `{"username","password"}` SMTP credentials
    pub smtp_credentials: ResourceRef,
    pub identity: ResourceRef,
    pub bounce_topic: Option<ResourceRef>,
}

impl SimpleEmailService {
    pub fn new(stack: &mut Stack, id: &str, props: SesProps<'_>) -> Result<Self> {
        let region = stack.region().to_string();

        let configuration_set = match &props.bounce_notification_email {
            Some(address) => Some(Self::bounce_notifications(stack, id, address)?),
            None => None,
        };

        let identity = match &props.identity {
            EmailIdentity::HostedZone(zone) => {
                let mail_from = format!("mail.{}", zone.zone_name);
                let mut identity_props = json!({
                    "EmailIdentity": zone.zone_name,
                    "MailFromAttributes": {
                        "MailFromDomain": mail_from,
                        "BehaviorOnMxFailure": "USE_DEFAULT_VALUE",
                    },
                    "DkimAttributes": { "SigningEnabled": true },
                });
                if let Some((set, _)) = &configuration_set {
                    identity_props["ConfigurationSetAttributes"] = json!({ "ConfigurationSetName": set.reference() });
                }
                let identity = stack.add(&format!("{}-identity", id), "AWS::SES::EmailIdentity", identity_props)?;
                for n in 1..=3 {
                    stack.add(
                        &format!("{}-identity-DkimDnsToken{}", id, n),
                        "AWS::Route53::RecordSet",
                        json!({
                            "HostedZoneId": zone.zone_id,
                            "Name": identity.attr(&format!("DkimDNSTokenName{}", n)),
                            "Type": "CNAME",
                            "TTL": "1800",
                            "ResourceRecords": [identity.attr(&format!("DkimDNSTokenValue{}", n))],
                        }),
                    )?;
                }
                mail_from_records(stack, &format!("{}-identity-mail-from", id), zone, &mail_from, &region)?;
                debug!(zone = %zone.zone_name, mail_from = %mail_from, "Declared SES domain identity");
                identity
            }
            EmailIdentity::Address(address) => {
                let mut identity_props = json!({
                    "EmailAddress": address,
                    "Region": region,
                    "PhysicalResourceId": format!("verify-{}", address),
                });
                if let Some((set, _)) = &configuration_set {
                    identity_props["ConfigurationSetName"] = set.reference();
                }
                stack.add(
                    &format!("verifyEmailIdentity-{}", address),
                    "Custom::VerifyEmailIdentity",
                    identity_props,
                )?
            }
        };

        grant(
            stack,
            &format!("{}-user-policy", id),
            &Grantee::Group(props.group.clone()),
            &[PolicyStatement::allow(
                &["ses:SendRawEmail", "ses:SendEmail"],
                vec![json!("*")],
            )],
        )?;

        let smtp_credentials = stack.add(
            &format!("{}-ses-user-password", id),
            "AWS::SecretsManager::Secret",
            json!({ "Description": "SES SMTP credentials" }),
        )?;
        stack.apply_removal_policy(&smtp_credentials, RemovalPolicy::Destroy);

        let mut function = FunctionProps::new("createSesCredentials")
            .env("SES_USERNAME", props.user.reference())
            .env("SES_USER_PASSWORD_ARN", smtp_credentials.reference())
            .env(
                "TRANSFORM_CREDENTIALS_ARN",
                props.transform_credentials.as_ref().map_or(json!(""), ResourceRef::reference),
            )
            .allow(PolicyStatement::allow(
                &["iam:CreateAccessKey", "iam:ListAccessKeys"],
                vec![props.user.arn()],
            ))
            .allow(PolicyStatement::allow(
                &[
                    "secretsmanager:GetSecretValue",
                    "secretsmanager:UpdateSecret",
                    "secretsmanager:PutSecretValue",
                ],
                vec![smtp_credentials.reference()],
            ));
        if let Some(source) = &props.transform_credentials {
            function = function.allow(PolicyStatement::allow(
                &["secretsmanager:GetSecretValue"],
                vec![source.reference()],
            ));
        }
        let function = Function::new(stack, &format!("{}-get-credentials", id), function)?;
        function.trigger(stack, &format!("{}-create-credentials-ses", id), 60, None)?;

        Ok(Self {
            smtp_credentials,
            identity,
            bounce_topic: configuration_set.map(|(_, topic)| topic),
        })
    }

    fn bounce_notifications(stack: &mut Stack, id: &str, address: &str) -> Result<(ResourceRef, ResourceRef)> {
        let topic = stack.add(
            &format!("{}-bounce-topic", id),
            "AWS::SNS::Topic",
            json!({
                "DisplayName": "REDCap email bounces",
                "KmsMasterKeyId": "alias/aws/sns",
                "Subscription": [{ "Protocol": "email", "Endpoint": address }],
            }),
        )?;
        stack.add(
            &format!("{}-bounce-topic-policy", id),
            "AWS::SNS::TopicPolicy",
            json!({
                "Topics": [topic.reference()],
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Principal": { "Service": "ses.amazonaws.com" },
                        "Action": "sns:Publish",
                        "Resource": topic.reference(),
                    }],
                },
            }),
        )?;
        let set = stack.add(&format!("{}-configuration-set", id), "AWS::SES::ConfigurationSet", json!({}))?;
        stack.add(
            &format!("{}-bounce-destination", id),
            "AWS::SES::ConfigurationSetEventDestination",
            json!({
                "ConfigurationSetName": set.reference(),
                "EventDestination": {
                    "Enabled": true,
                    "MatchingEventTypes": ["bounce", "complaint"],
                    "SnsDestination": { "TopicARN": topic.reference() },
                },
            }),
        )?;
        Ok((set, topic))
    }

    pub fn smtp_credentials_arn(&self) -> Value {
        self.smtp_credentials.reference()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constructs::access_user::AccessUser;

    fn props<'a>(identity: EmailIdentity<'a>, access: &AccessUser) -> SesProps<'a> {
        SesProps {
            identity,
            group: access.group.clone(),
            user: access.user.clone(),
            transform_credentials: Some(access.secret.clone()),
            bounce_notification_email: None,
        }
    }

    #[test]
    fn test_identity_resolution() {
        let zone = HostedZone {
            zone_name: "redcap.example.com".to_string(),
            zone_id: json!("Z1"),
            name_servers: None,
            resource: None,
        };
        assert!(matches!(
            EmailIdentity::resolve(Some(&zone), Some("a@b.org")).unwrap(),
            EmailIdentity::HostedZone(_)
        ));
        assert!(matches!(
            EmailIdentity::resolve(None, Some("a@b.org")).unwrap(),
            EmailIdentity::Address(a) if a == "a@b.org"
        ));
        assert!(matches!(
            EmailIdentity::resolve(None, None),
            Err(SynthError::MissingEmailIdentity)
        ));
    }

    #[test]
    fn test_zone_identity_writes_records() {
        let mut stack = Stack::new("dev-REDCap-Backend", "us-east-1");
        let zone = HostedZone::create(&mut stack, "zone", "redcap.example.com").unwrap();
        let access = AccessUser::new(&mut stack, "ses-access", "u", "g").unwrap();
        let ses = SimpleEmailService::new(&mut stack, "ses", props(EmailIdentity::HostedZone(&zone), &access)).unwrap();

        let identity = &stack.resource(&ses.identity).unwrap().properties;
        assert_eq!(identity["MailFromAttributes"]["MailFromDomain"], "mail.redcap.example.com");
        // 3 DKIM CNAMEs plus MX and SPF
        assert_eq!(stack.resources_of_type("AWS::Route53::RecordSet").count(), 5);
        assert!(ses.bounce_topic.is_none());
    }

    #[test]
    fn test_address_identity_and_credentials_function() {
        let mut stack = Stack::new("s", "eu-west-1");
        let access = AccessUser::new(&mut stack, "ses-access", "u", "g").unwrap();
        let ses = SimpleEmailService::new(
            &mut stack,
            "ses",
            props(EmailIdentity::Address("admin@example.org".to_string()), &access),
        )
        .unwrap();

        let verify = &stack.resource(&ses.identity).unwrap();
        assert_eq!(verify.kind, "Custom::VerifyEmailIdentity");
        assert_eq!(verify.properties["Region"], "eu-west-1");

        let (_, function) = stack.resources_of_type("AWS::Lambda::Function").next().unwrap();
        let env = &function.properties["Environment"]["Variables"];
        assert_eq!(env["SES_USER_PASSWORD_ARN"], ses.smtp_credentials_arn());
        assert_eq!(env["TRANSFORM_CREDENTIALS_ARN"], access.secret.reference());
        assert_eq!(stack.resources_of_type("Custom::Trigger").count(), 1);
        assert_eq!(
            stack.resource(&ses.smtp_credentials).unwrap().deletion_policy,
            Some(RemovalPolicy::Destroy)
        );
    }

    #[test]
    fn test_bounce_topic() {
        let mut stack = Stack::new("s", "us-east-1");
        let access = AccessUser::new(&mut stack, "ses-access", "u", "g").unwrap();
        let ses = SimpleEmailService::new(
            &mut stack,
            "ses",
            SesProps {
                bounce_notification_email: Some("bounces@example.org".to_string()),
                ..props(EmailIdentity::Address("admin@example.org".to_string()), &access)
            },
        )
        .unwrap();
        let topic = stack.resource(ses.bounce_topic.as_ref().unwrap()).unwrap();
        assert_eq!(topic.properties["Subscription"][0]["Endpoint"], "bounces@example.org");
        assert_eq!(stack.resources_of_type("AWS::SES::ConfigurationSetEventDestination").count(), 1);
    }
}
