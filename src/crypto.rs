//! Message signing
//!
//! HMAC-SHA256 over the stream key, publish time and canonical payload, so a
//! signature cannot be replayed onto another stream or another timestamp.
//! Signatures travel base64-encoded in the envelope.

use crate::error::{BusError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies message envelopes with a shared key
#[derive(Clone)]
pub struct MessageSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for MessageSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSigner").finish_non_exhaustive()
    }
}

impl MessageSigner {
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(BusError::Config("signing key must not be empty".to_string()));
        }
        Ok(Self { key: key.to_vec() })
    }

    /// Base64 signature for a message about to be appended to `key`
    pub fn sign(
        &self,
        key: &str,
        published_at: DateTime<Utc>,
        payload: &serde_json::Value,
    ) -> Result<String> {
        let mac = self.mac(key, published_at, payload)?;
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Check a signature in constant time
    pub fn verify(
        &self,
        key: &str,
        published_at: DateTime<Utc>,
        payload: &serde_json::Value,
        signature: Option<&str>,
    ) -> Result<()> {
        let signature =
            signature.ok_or_else(|| BusError::Signature("message is not signed".to_string()))?;
        let expected = BASE64
            .decode(signature)
            .map_err(|e| BusError::Signature(format!("malformed signature: {}", e)))?;

        self.mac(key, published_at, payload)?
            .verify_slice(&expected)
            .map_err(|_| BusError::Signature("signature mismatch".to_string()))
    }

    fn mac(
        &self,
        key: &str,
        published_at: DateTime<Utc>,
        payload: &serde_json::Value,
    ) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| BusError::Signature(format!("invalid key: {}", e)))?;
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(published_at.timestamp_millis().to_string().as_bytes());
        mac.update(b"\n");
        mac.update(&serde_json::to_vec(payload)?);
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signer() -> MessageSigner {
        MessageSigner::new("test-secret").unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let now = Utc::now();
        let payload = json!({"ticker": "SOL", "price": 14_250_000_000u64});
        let sig = signer().sign("price:update", now, &payload).unwrap();

        assert!(signer().verify("price:update", now, &payload, Some(&sig)).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = Utc::now();
        let sig = signer().sign("price:update", now, &json!({"price": 1})).unwrap();

        let err = signer()
            .verify("price:update", now, &json!({"price": 2}), Some(&sig))
            .unwrap_err();
        assert!(matches!(err, BusError::Signature(_)));
    }

    #[test]
    fn test_signature_bound_to_stream_and_time() {
        let now = Utc::now();
        let payload = json!({"price": 1});
        let sig = signer().sign("price:update", now, &payload).unwrap();

        assert!(signer().verify("order:request", now, &payload, Some(&sig)).is_err());
        let later = now + chrono::Duration::milliseconds(1);
        assert!(signer().verify("price:update", later, &payload, Some(&sig)).is_err());
    }

    #[test]
    fn test_wrong_key_missing_and_malformed() {
        let now = Utc::now();
        let payload = json!({});
        let sig = signer().sign("k", now, &payload).unwrap();
        let other = MessageSigner::new("other-secret").unwrap();

        assert!(other.verify("k", now, &payload, Some(&sig)).is_err());
        assert!(signer().verify("k", now, &payload, None).is_err());
        assert!(signer().verify("k", now, &payload, Some("!!not base64")).is_err());
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(MessageSigner::new(""), Err(BusError::Config(_))));
    }

    #[test]
    fn test_debug_hides_key() {
        assert!(!format!("{:?}", signer()).contains("test-secret"));
    }
}
