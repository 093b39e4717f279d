//! Inbound webhook handling for the external merchant bulk-search service
//! (§4.5.3). The durable `event_id` dedup insert happens before anything
//! else so a 2xx can be returned immediately even when driving the state
//! transition afterwards is slow — late or duplicate deliveries for a
//! cancelled/terminal search are silently dropped, never an error.

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::errors::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub event_id: Uuid,
    pub search_id: Uuid,
    #[serde(default)]
    pub event_type: String,
}

/// Verifies the vendor's HMAC-SHA256 signature over the raw request body.
/// `signature` is the base64-encoded digest carried in the request's
/// signature header; constant-time comparison is `hmac`'s own (`Mac::verify_slice`).
pub fn verify_signature(secret: &str, body: &[u8], signature_b64: &str) -> Result<()> {
    let expected = base64::engine::general_purpose::STANDARD
        .decode(signature_b64)
        .map_err(|_| Error::InputError { message: "malformed webhook signature encoding".to_string() })?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| Error::Other(e.into()))?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| Error::InputError { message: "webhook signature verification failed".to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_a_matching_signature() {
        let body = br#"{"event_id":"11111111-1111-1111-1111-111111111111"}"#;
        let sig = sign("shhh", body);
        assert!(verify_signature("shhh", body, &sig).is_ok());
    }

    #[test]
    fn rejects_a_tampered_body() {
        let body = br#"{"event_id":"11111111-1111-1111-1111-111111111111"}"#;
        let sig = sign("shhh", body);
        assert!(verify_signature("shhh", b"{\"tampered\":true}", &sig).is_err());
    }

    #[test]
    fn rejects_a_wrong_secret() {
        let body = br#"{"event_id":"11111111-1111-1111-1111-111111111111"}"#;
        let sig = sign("shhh", body);
        assert!(verify_signature("not-it", body, &sig).is_err());
    }
}
