use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `t=<unix seconds>,v1=<hex hmac>` signatures.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Event type the reconciler acts on.
pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Stale,
    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies a webhook signature against the raw request body.
///
/// The payload must not be parsed before this succeeds.
pub fn verify_signature(
    payload: &[u8],
    header: Option<&str>,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::Missing)?;

    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }
    let signed_at: i64 = timestamp.parse().map_err(|_| SignatureError::Malformed)?;
    // The timestamp is attacker-controlled until the MAC checks out.
    let tolerance = u64::try_from(tolerance_secs).unwrap_or(0);
    match now.checked_sub(signed_at).map(i64::unsigned_abs) {
        Some(skew) if skew <= tolerance => {}
        _ => return Err(SignatureError::Stale),
    }

    // Several v1 entries are sent while a secret is being rolled.
    for candidate in candidates {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| SignatureError::Malformed)?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(SignatureError::Mismatch)
}

/// Builds a signature header for `payload`, as the gateway would.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}

/// Envelope of an inbound gateway event.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

impl WebhookEvent {
    /// Id of the object the event is about (the session for checkout events).
    pub fn object_id(&self) -> Option<&str> {
        self.data.object.get("id").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const BODY: &[u8] = br#"{"id":"evt_1","type":"checkout.session.completed"}"#;

    #[test]
    fn accepts_a_fresh_valid_signature() {
        let header = sign_payload(BODY, SECRET, 1_700_000_000);
        assert_eq!(
            verify_signature(BODY, Some(&header), SECRET, 300, 1_700_000_100),
            Ok(())
        );
    }

    #[test]
    fn rejects_tampered_body_and_wrong_secret() {
        let header = sign_payload(BODY, SECRET, 1_700_000_000);
        assert_eq!(
            verify_signature(b"{}", Some(&header), SECRET, 300, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_signature(BODY, Some(&header), "whsec_other", 300, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_replayed_timestamps() {
        let header = sign_payload(BODY, SECRET, 1_700_000_000);
        assert_eq!(
            verify_signature(BODY, Some(&header), SECRET, 300, 1_700_000_301),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn rejects_missing_or_malformed_headers() {
        assert_eq!(
            verify_signature(BODY, None, SECRET, 300, 0),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_signature(BODY, Some("v1=abcd"), SECRET, 300, 0),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_signature(BODY, Some("t=abc,v1=abcd"), SECRET, 300, 0),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn extreme_timestamps_are_stale_not_a_panic() {
        for header in [
            "t=-9223372036854775808,v1=00",
            "t=9223372036854775807,v1=00",
        ] {
            assert_eq!(
                verify_signature(b"{}", Some(header), SECRET, 300, 1_700_000_000),
                Err(SignatureError::Stale)
            );
        }
        assert_eq!(
            verify_signature(b"{}", Some("t=0,v1=00"), SECRET, 300, i64::MIN),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn any_matching_v1_entry_is_enough() {
        let valid = sign_payload(BODY, SECRET, 1_700_000_000);
        let v1 = valid.split_once("v1=").unwrap().1;
        let header = format!("t=1700000000,v1=deadbeef,v1={v1}");
        assert_eq!(
            verify_signature(BODY, Some(&header), SECRET, 300, 1_700_000_000),
            Ok(())
        );
    }
}
