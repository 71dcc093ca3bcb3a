//! External-IdP lifecycle webhook (spec §6 `POST /webhooks/clerk`): Svix-style
//! signature verification over `{svix_id}.{svix_timestamp}.{body}`, the same
//! shape Clerk's own webhook delivery uses.
//!
//! Grounded on `webhook::sign`/`webhook::verify`'s HMAC-over-canonical-message
//! pattern, adapted to the header layout an external Svix-backed sender uses
//! instead of the core's own outbound scheme.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct ClerkHeaders {
    pub svix_id: String,
    pub svix_timestamp: String,
    pub svix_signature: String,
}

/// Verifies a Svix-style webhook. `secret` is the raw value after stripping
/// a `whsec_` prefix if present (Svix base64-encodes its secrets). Returns
/// `false` on any malformed input rather than erroring — a verification
/// seam should never panic on attacker-controlled bytes.
pub fn verify(secret: &str, headers: &ClerkHeaders, body: &[u8], now: i64, tolerance_secs: i64) -> bool {
    let Ok(timestamp) = headers.svix_timestamp.parse::<i64>() else { return false };
    if (now - timestamp).abs() > tolerance_secs {
        return false;
    }

    let secret_bytes = decode_secret(secret);
    let signed_content = format!("{}.{}.{}", headers.svix_id, headers.svix_timestamp, String::from_utf8_lossy(body));

    let Ok(mut mac) = HmacSha256::new_from_slice(&secret_bytes) else { return false };
    mac.update(signed_content.as_bytes());
    let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    headers
        .svix_signature
        .split_whitespace()
        .filter_map(|part| part.strip_prefix("v1,"))
        .any(|candidate| bool::from(candidate.as_bytes().ct_eq(expected.as_bytes())))
}

fn decode_secret(secret: &str) -> Vec<u8> {
    let stripped = secret.strip_prefix("whsec_").unwrap_or(secret);
    base64::engine::general_purpose::STANDARD.decode(stripped).unwrap_or_else(|_| stripped.as_bytes().to_vec())
}

/// The subset of a Clerk lifecycle event this core acts on (spec §6 "mutates
/// UserBalance and tier state"); everything else is forwarded-but-ignored.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ClerkEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: ClerkEventData,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ClerkEventData {
    pub user_id: String,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub amount_usd: Option<f64>,
    #[serde(default)]
    pub external_payment_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, id: &str, timestamp: &str, body: &[u8]) -> String {
        let secret_bytes = decode_secret(secret);
        let signed_content = format!("{id}.{timestamp}.{}", String::from_utf8_lossy(body));
        let mut mac = HmacSha256::new_from_slice(&secret_bytes).unwrap();
        mac.update(signed_content.as_bytes());
        format!("v1,{}", base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_verify_accepts_matching_signature() {
        let secret = "whsec_c2VjcmV0";
        let body = br#"{"type":"subscription.created"}"#;
        let signature = sign(secret, "msg_1", "1000", body);
        let headers = ClerkHeaders { svix_id: "msg_1".into(), svix_timestamp: "1000".into(), svix_signature: signature };
        assert!(verify(secret, &headers, body, 1000, 300));
    }

    #[test]
    fn test_verify_rejects_stale_timestamp() {
        let secret = "whsec_c2VjcmV0";
        let body = b"{}";
        let signature = sign(secret, "msg_1", "1000", body);
        let headers = ClerkHeaders { svix_id: "msg_1".into(), svix_timestamp: "1000".into(), svix_signature: signature };
        assert!(!verify(secret, &headers, body, 1000 + 400, 300));
    }

    #[test]
    fn test_verify_rejects_tampered_body() {
        let secret = "whsec_c2VjcmV0";
        let signature = sign(secret, "msg_1", "1000", b"{}");
        let headers = ClerkHeaders { svix_id: "msg_1".into(), svix_timestamp: "1000".into(), svix_signature: signature };
        assert!(!verify(secret, &headers, b"{\"tampered\":true}", 1000, 300));
    }
}
