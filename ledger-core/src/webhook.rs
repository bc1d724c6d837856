//! HMAC-SHA256 verification for broker webhooks, independent of any HTTP
//! framework. The raw body -- not a re-serialized parse -- is always the
//! signed payload.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Broker-Signature";
pub const ALGO_HEADER: &str = "X-Broker-Signature-Alg";
pub const EXPECTED_ALGO: &str = "HMAC-SHA256";

const PLACEHOLDER_SECRETS: &[&str] = &["changeme", "default", "secret", ""];

/// Primary key plus an ordered list of rotated keys. The primary stays
/// identifiable (it's used for outbound signing, not just inbound checks),
/// so this is a list rather than a set.
#[derive(Clone, Debug)]
pub struct WebhookSecrets {
    pub primary: String,
    pub additional: Vec<String>,
}

impl WebhookSecrets {
    pub fn from_env(primary: Option<String>, additional_csv: Option<String>) -> Self {
        let additional = additional_csv
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self { primary: primary.unwrap_or_default(), additional }
    }

    fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.additional.iter().map(String::as_str))
    }

    /// Startup guard: in non-debug mode, a missing or placeholder secret
    /// must abort the process before it serves a single webhook.
    pub fn validate_for_production(&self) -> Result<(), String> {
        if self.primary.is_empty() || PLACEHOLDER_SECRETS.contains(&self.primary.as_str()) {
            return Err("BROKER_WEBHOOK_SECRET is missing or a placeholder value".to_string());
        }
        for extra in &self.additional {
            if PLACEHOLDER_SECRETS.contains(&extra.as_str()) {
                return Err("BROKER_WEBHOOK_ADDITIONAL_SECRETS contains a placeholder value".to_string());
            }
        }
        Ok(())
    }

    pub fn sign(&self, raw_body: &[u8]) -> String {
        compute_signature(raw_body, &self.primary)
    }
}

pub fn compute_signature(raw_body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(raw_body);
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Eq, PartialEq)]
pub enum VerifyError {
    MissingSignature,
    UnsupportedAlgorithm,
    Invalid,
}

/// Any candidate secret (primary or rotated) matching accepts the request.
/// `hmac::Mac::verify_slice` performs a constant-time comparison, so
/// rejection latency doesn't leak which candidate -- if any -- came close.
pub fn verify_signature(
    raw_body: &[u8],
    provided_signature: Option<&str>,
    provided_algo: Option<&str>,
    secrets: &WebhookSecrets,
) -> Result<(), VerifyError> {
    let Some(provided) = provided_signature else {
        return Err(VerifyError::MissingSignature);
    };
    if let Some(algo) = provided_algo {
        if algo != EXPECTED_ALGO {
            return Err(VerifyError::UnsupportedAlgorithm);
        }
    }
    let Ok(provided_bytes) = hex::decode(provided) else {
        return Err(VerifyError::Invalid);
    };

    for secret in secrets.candidates() {
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            continue;
        };
        mac.update(raw_body);
        if mac.verify_slice(&provided_bytes).is_ok() {
            return Ok(());
        }
    }
    Err(VerifyError::Invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> WebhookSecrets {
        WebhookSecrets { primary: "s1-secret".into(), additional: vec!["s2-rotated".into()] }
    }

    #[test]
    fn accepts_signature_from_primary_secret() {
        let body = br#"{"order_id":1}"#;
        let sig = compute_signature(body, "s1-secret");
        assert!(verify_signature(body, Some(&sig), Some(EXPECTED_ALGO), &secrets()).is_ok());
    }

    #[test]
    fn accepts_signature_from_rotated_secret() {
        let body = br#"{"order_id":1}"#;
        let sig = compute_signature(body, "s2-rotated");
        assert!(verify_signature(body, Some(&sig), None, &secrets()).is_ok());
    }

    #[test]
    fn rejects_signature_from_unknown_secret() {
        let body = br#"{"order_id":1}"#;
        let sig = compute_signature(body, "not-a-configured-secret");
        assert_eq!(
            verify_signature(body, Some(&sig), None, &secrets()),
            Err(VerifyError::Invalid)
        );
    }

    #[test]
    fn rejects_missing_signature() {
        let body = br#"{}"#;
        assert_eq!(
            verify_signature(body, None, None, &secrets()),
            Err(VerifyError::MissingSignature)
        );
    }

    #[test]
    fn rejects_unsupported_algorithm() {
        let body = br#"{}"#;
        let sig = compute_signature(body, "s1-secret");
        assert_eq!(
            verify_signature(body, Some(&sig), Some("HMAC-SHA1"), &secrets()),
            Err(VerifyError::UnsupportedAlgorithm)
        );
    }

    #[test]
    fn production_guard_rejects_placeholder_secrets() {
        let placeholder = WebhookSecrets { primary: "changeme".into(), additional: vec![] };
        assert!(placeholder.validate_for_production().is_err());

        let ok = WebhookSecrets { primary: "a-real-secret".into(), additional: vec![] };
        assert!(ok.validate_for_production().is_ok());
    }
}
