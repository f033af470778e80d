//! Deterministic request fingerprints.
//!
//! A fingerprint is a stable hash over the claim kind and a canonical
//! serialization of the payload, bucketed by a coarse time window so
//! near-simultaneous identical requests land on the same cache key.
//! Fingerprints never leave the process.

use sha2::{Digest, Sha256};

use crate::models::VerificationRequest;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Fingerprint for a verification request.
///
/// serde_json maps are BTree-backed, so object keys serialize in sorted
/// order and the byte stream is canonical for identical payloads.
pub fn request_fingerprint(request: &VerificationRequest, window_secs: u64) -> String {
    let canonical = serde_json::to_value(&request.claim)
        .map(|value| value.to_string())
        .unwrap_or_default();

    let bucket = request.created_at / (window_secs.max(1) * NANOS_PER_SEC);

    let mut hasher = Sha256::new();
    hasher.update(request.claim.kind().as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    hasher.update([0u8]);
    hasher.update(bucket.to_le_bytes());

    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Cache key for one source's quote on one pair, bucketed the same way.
pub fn quote_fingerprint(source_id: &str, pair: &str, at: Option<i64>, window_secs: u64) -> String {
    let bucket = at.unwrap_or(0).div_euclid(window_secs.max(1) as i64);
    format!("quote:{source_id}:{pair}:{bucket}")
}
