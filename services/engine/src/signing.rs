//! HMAC derivations used by the plan
//!
//! Both values are computed at synthesis time: the cron bypass token ends up
//! in the WAF rule and the scheduler URL, the SMTP password is what the
//! credential trigger writes into the SES secret.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Result, SynthError};

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| SynthError::invalid("hmac key", e.to_string()))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Token the scheduler presents as `?secret=` on `/cron.php`
///
/// HMAC-SHA256 keyed with the secret over the secret reversed, hex encoded.
pub fn cron_token(secret: &str) -> Result<String> {
    if secret.is_empty() {
        return Err(SynthError::invalid("cronSecret", "must not be empty"));
    }
    let reversed = reverse_utf16(secret);
    Ok(hex::encode(hmac_sha256(secret.as_bytes(), reversed.as_bytes())?))
}

/// Reverses UTF-16 code units, so a surrogate pair splits into two U+FFFD
fn reverse_utf16(s: &str) -> String {
    let mut units: Vec<u16> = s.encode_utf16().collect();
    units.reverse();
    String::from_utf16_lossy(&units)
}

const SMTP_DATE: &str = "11111111";
const SMTP_SERVICE: &str = "ses";
const SMTP_TERMINAL: &str = "aws4_request";
const SMTP_MESSAGE: &str = "SendRawEmail";
const SMTP_VERSION: u8 = 0x04;

/// SES SMTP password for an IAM secret access key in `region`
pub fn smtp_password(secret_access_key: &str, region: &str) -> Result<String> {
    if secret_access_key.is_empty() {
        return Err(SynthError::invalid("secretAccessKey", "must not be empty"));
    }
    if region.is_empty() {
        return Err(SynthError::invalid("region", "must not be empty"));
    }
    let mut signature = hmac_sha256(format!("AWS4{}", secret_access_key).as_bytes(), SMTP_DATE.as_bytes())?;
    for step in [region, SMTP_SERVICE, SMTP_TERMINAL, SMTP_MESSAGE] {
        signature = hmac_sha256(&signature, step.as_bytes())?;
    }

    let mut versioned = Vec::with_capacity(signature.len() + 1);
    versioned.push(SMTP_VERSION);
    versioned.extend_from_slice(&signature);
    Ok(STANDARD.encode(versioned))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cron_token_is_stable() {
        let first = cron_token("mysecret").unwrap();
        let second = cron_token("mysecret").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_cron_token_differs_per_secret() {
        assert_ne!(cron_token("mysecret").unwrap(), cron_token("othersecret").unwrap());
    }

    #[test]
    fn test_cron_token_hides_secret() {
        let token = cron_token("mysecret").unwrap();
        assert!(!token.contains("mysecret"));
        assert!(!token.contains("terceSym"));
    }

    #[test]
    fn test_cron_token_matches_manual_hmac() {
        let mut mac = HmacSha256::new_from_slice(b"abc").unwrap();
        mac.update(b"cba");
        assert_eq!(cron_token("abc").unwrap(), hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn test_cron_token_reverses_code_units() {
        assert_eq!(reverse_utf16("année"), "eénna");
        // U+1F600 is a surrogate pair; reversed, both halves are unpaired
        assert_eq!(reverse_utf16("a\u{1F600}"), "\u{FFFD}\u{FFFD}a");

        let mut mac = HmacSha256::new_from_slice("a\u{1F600}".as_bytes()).unwrap();
        mac.update("\u{FFFD}\u{FFFD}a".as_bytes());
        assert_eq!(cron_token("a\u{1F600}").unwrap(), hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn test_empty_cron_secret_rejected() {
        assert!(cron_token("").is_err());
    }

    #[test]
    fn test_smtp_password_shape() {
        let password = smtp_password("wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY", "us-east-1").unwrap();
        // 33 bytes encode to 44 characters; a leading 0x04 always encodes to 'B'
        assert_eq!(password.len(), 44);
        assert!(password.starts_with('B'));
        let decoded = STANDARD.decode(&password).unwrap();
        assert_eq!(decoded[0], 0x04);
    }

    #[test]
    fn test_smtp_password_depends_on_region() {
        let key = "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY";
        assert_ne!(smtp_password(key, "us-east-1").unwrap(), smtp_password(key, "eu-west-1").unwrap());
        assert_eq!(smtp_password(key, "us-east-1").unwrap(), smtp_password(key, "us-east-1").unwrap());
    }

    #[test]
    fn test_smtp_password_chain() {
        let mut key = hmac_sha256(b"AWS4secret", b"11111111").unwrap();
        for step in ["ap-northeast-1", "ses", "aws4_request", "SendRawEmail"] {
            key = hmac_sha256(&key, step.as_bytes()).unwrap();
        }
        let decoded = STANDARD.decode(smtp_password("secret", "ap-northeast-1").unwrap()).unwrap();
        assert_eq!(&decoded[1..], key.as_slice());
    }
}
