//! Webhook payload signing.
//!
//! The signature is the hex-encoded HMAC-SHA256 of `"{timestamp}.{body}"`
//! keyed with the endpoint secret. Receivers recompute it from the
//! `X-Dispatch-Timestamp` header and the raw body.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the unix timestamp (seconds) that was signed.
pub const TIMESTAMP_HEADER: &str = "X-Dispatch-Timestamp";

/// Header carrying the hex signature.
pub const SIGNATURE_HEADER: &str = "X-Dispatch-Signature";

/// Header carrying the event type (informational, not signed).
pub const EVENT_HEADER: &str = "X-Dispatch-Event";

/// Header carrying the delivery id (informational, not signed).
pub const DELIVERY_HEADER: &str = "X-Dispatch-Delivery";

fn mac_for(secret: &str, timestamp: i64, body: &str) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    mac
}

/// Signs `body` sent at `timestamp` with `secret`.
pub fn sign(secret: &str, timestamp: i64, body: &str) -> String {
    hex::encode(mac_for(secret, timestamp, body).finalize().into_bytes())
}

/// Checks a hex signature in constant time.
pub fn verify(secret: &str, timestamp: i64, body: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    mac_for(secret, timestamp, body)
        .verify_slice(&expected)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{"hello":"world"}"#;

    #[test]
    fn sign_matches_known_vector() {
        assert_eq!(
            sign("test_secret", 1710000000, BODY),
            "e51dd5274a908b34ec3ff08c790c665da0f182d57181a2cb42f28e1a115b58b8"
        );
    }

    #[test]
    fn sign_is_deterministic_and_lowercase_hex() {
        let a = sign("test_secret", 1710000000, BODY);
        let b = sign("test_secret", 1710000000, BODY);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn sign_depends_on_every_input() {
        let base = sign("test_secret", 1710000000, BODY);
        assert_eq!(
            sign("other_secret", 1710000000, BODY),
            "4334a6355f2724e714aa9699b03f751ab0139d8a399090ba940dc33577c0d7b5"
        );
        assert_ne!(base, sign("test_secret", 1710000001, BODY));
        assert_ne!(base, sign("test_secret", 1710000000, r#"{"hello":"World"}"#));
    }

    #[test]
    fn verify_accepts_matching_signature() {
        let signature = sign("test_secret", 1710000000, BODY);
        assert!(verify("test_secret", 1710000000, BODY, &signature));
    }

    #[test]
    fn verify_rejects_tampering() {
        let signature = sign("test_secret", 1710000000, BODY);
        assert!(!verify("wrong", 1710000000, BODY, &signature));
        assert!(!verify("test_secret", 1710000099, BODY, &signature));
        assert!(!verify("test_secret", 1710000000, "{}", &signature));
        assert!(!verify("test_secret", 1710000000, BODY, "not-hex"));
        assert!(!verify("test_secret", 1710000000, BODY, &signature[..10]));
    }
}
