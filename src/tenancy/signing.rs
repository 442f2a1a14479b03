//! Cross-tenant message signing.
//!
//! Messages between tenants carry an HMAC-SHA256 signature over the
//! canonical string `source|target|timestamp|nonce|sha256(payload)`.
//! Each project may carry its own signing secret; projects without one
//! fall back to the bus-level key. Verification is constant-time.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::envelope::EventEnvelope;
use crate::{BusError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Originating side of a cross-tenant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub project_id: String,
    pub namespace: String,
    pub version: String,
}

/// Destination side of a cross-tenant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRef {
    pub project_id: String,
    pub namespace: String,
}

/// Signature block attached to every cross-tenant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityBlock {
    pub signature: String,
    pub timestamp: DateTime<Utc>,
    pub nonce: String,
}

/// Wire form of a message between tenants: routing references around the
/// inner envelope, plus the signature block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossTenantEnvelope {
    pub source: SourceRef,
    pub target: TargetRef,
    pub payload: EventEnvelope,
    pub security: SecurityBlock,
}

impl CrossTenantEnvelope {
    /// Build and sign an envelope with a fresh nonce and current
    /// timestamp.
    pub fn sealed(
        source: SourceRef,
        target: TargetRef,
        payload: EventEnvelope,
        secret: &str,
    ) -> Result<Self> {
        let timestamp = Utc::now();
        let nonce = Uuid::new_v4().simple().to_string();
        let signature = sign(
            secret,
            &source.project_id,
            &target.project_id,
            timestamp,
            &nonce,
            &payload,
        )?;
        Ok(Self {
            source,
            target,
            payload,
            security: SecurityBlock {
                signature,
                timestamp,
                nonce,
            },
        })
    }

    /// Verify the signature block against `secret`.
    pub fn verify(&self, secret: &str) -> Result<()> {
        verify(
            secret,
            &self.source.project_id,
            &self.target.project_id,
            self.security.timestamp,
            &self.security.nonce,
            &self.payload,
            &self.security.signature,
        )
    }

    /// Whether the message's send timestamp is older than `window_secs`.
    pub fn is_stale(&self, now: DateTime<Utc>, window_secs: u64) -> bool {
        now.signed_duration_since(self.security.timestamp)
            .num_seconds()
            > window_secs as i64
    }
}

fn canonical(
    source_project: &str,
    target_project: &str,
    timestamp: DateTime<Utc>,
    nonce: &str,
    payload: &EventEnvelope,
) -> Result<String> {
    let payload_hash = hex::encode(Sha256::digest(serde_json::to_vec(payload)?));
    Ok(format!(
        "{}|{}|{}|{}|{}",
        source_project,
        target_project,
        timestamp.timestamp_millis(),
        nonce,
        payload_hash
    ))
}

/// HMAC-SHA256 signature over the canonical message string, hex-encoded.
pub fn sign(
    secret: &str,
    source_project: &str,
    target_project: &str,
    timestamp: DateTime<Utc>,
    nonce: &str,
    payload: &EventEnvelope,
) -> Result<String> {
    let input = canonical(source_project, target_project, timestamp, nonce, payload)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BusError::Security(format!("invalid signing key: {}", e)))?;
    mac.update(input.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification of a hex-encoded signature.
pub fn verify(
    secret: &str,
    source_project: &str,
    target_project: &str,
    timestamp: DateTime<Utc>,
    nonce: &str,
    payload: &EventEnvelope,
    signature: &str,
) -> Result<()> {
    let input = canonical(source_project, target_project, timestamp, nonce, payload)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BusError::Security(format!("invalid signing key: {}", e)))?;
    mac.update(input.as_bytes());
    let expected =
        hex::decode(signature).map_err(|_| BusError::Security("malformed signature".into()))?;
    mac.verify_slice(&expected)
        .map_err(|_| BusError::Security("signature mismatch".into()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn refs() -> (SourceRef, TargetRef) {
        (
            SourceRef {
                project_id: "billing".into(),
                namespace: "billing".into(),
                version: "1.0.0".into(),
            },
            TargetRef {
                project_id: "notify".into(),
                namespace: "notify".into(),
            },
        )
    }

    #[test]
    fn test_seal_and_verify() {
        let (source, target) = refs();
        let payload = EventEnvelope::new("invoice.created", "billing", json!({"amount": 42}));
        let sealed = CrossTenantEnvelope::sealed(source, target, payload, "secret").unwrap();
        sealed.verify("secret").unwrap();
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (source, target) = refs();
        let payload = EventEnvelope::new("invoice.created", "billing", json!({"amount": 42}));
        let sealed = CrossTenantEnvelope::sealed(source, target, payload, "secret").unwrap();
        assert!(matches!(
            sealed.verify("other"),
            Err(BusError::Security(_))
        ));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let (source, target) = refs();
        let payload = EventEnvelope::new("invoice.created", "billing", json!({"amount": 42}));
        let mut sealed = CrossTenantEnvelope::sealed(source, target, payload, "secret").unwrap();
        sealed.payload.payload = json!({"amount": 9000});
        assert!(sealed.verify("secret").is_err());
    }

    #[test]
    fn test_staleness_window() {
        let (source, target) = refs();
        let payload = EventEnvelope::new("invoice.created", "billing", json!({}));
        let sealed = CrossTenantEnvelope::sealed(source, target, payload, "secret").unwrap();
        let sent = sealed.security.timestamp;
        assert!(!sealed.is_stale(sent + chrono::Duration::seconds(299), 300));
        assert!(sealed.is_stale(sent + chrono::Duration::seconds(301), 300));
    }
}
