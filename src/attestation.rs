//! Commitment-based attestations over verification outcomes.
//!
//! An attestation binds a minimum disclosure view (status, risk grade,
//! compliance booleans) to a secret salt via HMAC-SHA256, then encodes the
//! scheme tag, commitment, and public view as a URL-safe string. It hides
//! the inputs but is a commitment, not a zero-knowledge proof, and the API
//! makes no stronger claim.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Scheme identifier and version baked into every attestation.
pub const SCHEME_TAG: &str = "twc1";

/// Hard cap on the encoded attestation.
pub const MAX_ATTESTATION_BYTES: usize = 512;

/// How much of the view is published alongside the commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    /// Commitment plus the cleartext view.
    Standard,
    /// Commitment only; the view stays with the caller.
    Maximum,
}

/// The minimum set of fields the caller authorises for disclosure.
///
/// The raw claim payload never reaches this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisclosureView {
    pub status: String,
    pub risk_grade: String,
    pub compliance: BTreeMap<String, bool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AttestationEnvelope {
    scheme: String,
    nonce: u64,
    commitment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    view: Option<DisclosureView>,
}

/// Stateless commitment generator (apart from a monotonic nonce counter).
pub struct AttestationGenerator {
    secret_salt: [u8; 32],
    counter: AtomicU64,
}

impl AttestationGenerator {
    /// Generator with a process-local random salt.
    pub fn new() -> Self {
        let mut secret_salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret_salt);
        Self {
            secret_salt,
            counter: AtomicU64::new(0),
        }
    }

    /// Generator with a fixed salt, for reproducible tests.
    pub fn with_salt(secret_salt: [u8; 32]) -> Self {
        Self {
            secret_salt,
            counter: AtomicU64::new(0),
        }
    }

    /// Produce an opaque attestation string for the given view.
    pub fn attest(&self, view: &DisclosureView, privacy: PrivacyLevel) -> Result<String> {
        let nonce = self.counter.fetch_add(1, Ordering::Relaxed);
        let canonical = serde_json::to_vec(view).context("serializing disclosure view")?;

        let mut mac = HmacSha256::new_from_slice(&self.secret_salt)
            .context("initialising commitment MAC")?;
        mac.update(&canonical);
        mac.update(&nonce.to_le_bytes());
        let commitment = hex::encode(mac.finalize().into_bytes());

        let envelope = AttestationEnvelope {
            scheme: SCHEME_TAG.to_string(),
            nonce,
            commitment,
            view: match privacy {
                PrivacyLevel::Standard => Some(view.clone()),
                PrivacyLevel::Maximum => None,
            },
        };

        let encoded =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&envelope).context("encoding attestation")?);
        if encoded.len() > MAX_ATTESTATION_BYTES {
            bail!(
                "attestation of {} bytes exceeds the {} byte cap",
                encoded.len(),
                MAX_ATTESTATION_BYTES
            );
        }
        Ok(encoded)
    }
}

impl Default for AttestationGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheme tag carried by an encoded attestation.
pub fn decode_scheme_tag(attestation: &str) -> Result<String> {
    let raw = URL_SAFE_NO_PAD
        .decode(attestation)
        .context("attestation is not URL-safe base64")?;
    let envelope: AttestationEnvelope =
        serde_json::from_slice(&raw).context("attestation envelope is malformed")?;
    Ok(envelope.scheme)
}
