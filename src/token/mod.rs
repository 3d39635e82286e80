//! Capability token utilities (C1) — the trust anchor of the data path.
//!
//! A token commits to one I/O: it binds `(token_id, volume_id, op, offset,
//! length)` and is signed with a cluster-wide shared secret using
//! HMAC-SHA256 over the canonical string
//! `token_id|volume_id|op|offset|length`. Verification is constant-time.
//! Grounded on `shared/token_utils.py` from the original implementation.

pub mod authority;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::model::{IoOp, VolumeId};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOKEN_TTL_SECS: i64 = 300;

/// The token payload as it travels on the wire (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub token_id: String,
    pub volume_id: VolumeId,
    pub sdc_id: crate::model::SdcId,
    pub operation: IoOp,
    pub offset_bytes: u64,
    pub length_bytes: u64,
    pub signature: String,
    pub expires_at: DateTime<Utc>,
    pub io_plan: serde_json::Value,
}

fn op_str(op: IoOp) -> &'static str {
    match op {
        IoOp::Read => "read",
        IoOp::Write => "write",
    }
}

pub fn generate_token_id() -> String {
    Uuid::new_v4().to_string()
}

fn canonical_message(
    token_id: &str,
    volume_id: VolumeId,
    op: IoOp,
    offset_bytes: u64,
    length_bytes: u64,
) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        token_id,
        volume_id.0,
        op_str(op),
        offset_bytes,
        length_bytes
    )
}

/// Signs a token's canonical message, returning a hex HMAC-SHA256 digest.
pub fn sign_token(
    token_id: &str,
    volume_id: VolumeId,
    op: IoOp,
    offset_bytes: u64,
    length_bytes: u64,
    cluster_secret: &str,
) -> String {
    let message = canonical_message(token_id, volume_id, op, offset_bytes, length_bytes);
    let mut mac =
        HmacSha256::new_from_slice(cluster_secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a token's signature in constant time.
pub fn verify_signature(
    token_id: &str,
    volume_id: VolumeId,
    op: IoOp,
    offset_bytes: u64,
    length_bytes: u64,
    cluster_secret: &str,
    signature: &str,
) -> bool {
    let expected = sign_token(token_id, volume_id, op, offset_bytes, length_bytes, cluster_secret);
    let expected_bytes = expected.as_bytes();
    let actual_bytes = signature.as_bytes();
    if expected_bytes.len() != actual_bytes.len() {
        return false;
    }
    expected_bytes.ct_eq(actual_bytes).into()
}

pub fn is_token_expired(expires_at: DateTime<Utc>) -> bool {
    Utc::now() >= expires_at
}

pub fn compute_token_expiry(ttl_secs: i64) -> DateTime<Utc> {
    Utc::now() + Duration::seconds(ttl_secs)
}

/// Full validation order for an I/O request against a token, per spec.md
/// §3 invariant 7: expiry → volume match → operation match → offset/length
/// containment → signature. Returns `Ok(())` or a human-readable reason.
pub fn validate_token_for_io(
    token: &TokenPayload,
    cluster_secret: &str,
    volume_id: VolumeId,
    op: IoOp,
    offset_bytes: u64,
    length_bytes: u64,
) -> Result<(), String> {
    if is_token_expired(token.expires_at) {
        return Err("token expired".to_string());
    }
    if token.volume_id != volume_id {
        return Err("token volume mismatch".to_string());
    }
    if token.operation != op {
        return Err("token operation mismatch".to_string());
    }
    let token_end = token.offset_bytes + token.length_bytes;
    let request_end = offset_bytes + length_bytes;
    if offset_bytes < token.offset_bytes || request_end > token_end {
        return Err("token range mismatch".to_string());
    }
    if !verify_signature(
        &token.token_id,
        token.volume_id,
        token.operation,
        token.offset_bytes,
        token.length_bytes,
        cluster_secret,
        &token.signature,
    ) {
        return Err("token signature invalid".to_string());
    }
    Ok(())
}

/// Component auth token for the discovery handshake: `SHA256(cluster_secret
/// || component_id)`, hex-encoded.
pub fn component_auth_token(cluster_secret: &str, component_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cluster_secret.as_bytes());
    hasher.update(component_id.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn verify_component_auth_token(
    cluster_secret: &str,
    component_id: &str,
    presented: &str,
) -> bool {
    let expected = component_auth_token(cluster_secret, component_id);
    let expected_bytes = expected.as_bytes();
    let actual_bytes = presented.as_bytes();
    expected_bytes.len() == actual_bytes.len() && expected_bytes.ct_eq(actual_bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SdcId;

    const SECRET: &str = "test-secret";

    fn sample_payload(volume: VolumeId, op: IoOp, offset: u64, length: u64) -> TokenPayload {
        let token_id = generate_token_id();
        let signature = sign_token(&token_id, volume, op, offset, length, SECRET);
        TokenPayload {
            token_id,
            volume_id: volume,
            sdc_id: SdcId(1),
            operation: op,
            offset_bytes: offset,
            length_bytes: length,
            signature,
            expires_at: compute_token_expiry(DEFAULT_TOKEN_TTL_SECS),
            io_plan: serde_json::json!({}),
        }
    }

    #[test]
    fn round_trip_valid() {
        let token = sample_payload(VolumeId(1), IoOp::Write, 4096, 1024);
        assert!(validate_token_for_io(&token, SECRET, VolumeId(1), IoOp::Write, 4096, 1024).is_ok());
    }

    #[test]
    fn tampered_volume_rejected() {
        let token = sample_payload(VolumeId(1), IoOp::Write, 4096, 1024);
        assert!(validate_token_for_io(&token, SECRET, VolumeId(2), IoOp::Write, 4096, 1024).is_err());
    }

    #[test]
    fn tampered_signature_rejected() {
        let mut token = sample_payload(VolumeId(1), IoOp::Write, 4096, 1024);
        token.signature.push('0');
        assert!(validate_token_for_io(&token, SECRET, VolumeId(1), IoOp::Write, 4096, 1024).is_err());
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = sample_payload(VolumeId(1), IoOp::Write, 4096, 1024);
        assert!(
            validate_token_for_io(&token, "other-secret", VolumeId(1), IoOp::Write, 4096, 1024)
                .is_err()
        );
    }

    #[test]
    fn exactly_at_expiry_is_invalid() {
        let mut token = sample_payload(VolumeId(1), IoOp::Write, 4096, 1024);
        token.expires_at = Utc::now();
        assert!(is_token_expired(token.expires_at));
    }

    #[test]
    fn range_outside_token_rejected() {
        let token = sample_payload(VolumeId(1), IoOp::Write, 4096, 1024);
        assert!(validate_token_for_io(&token, SECRET, VolumeId(1), IoOp::Write, 0, 8192).is_err());
    }
}
