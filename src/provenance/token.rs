//! Provenance tokens.
//!
//! Each token records one grant along four axes: what ran (resource, size),
//! what it depended on, the context it ran in, and why it was allowed. Tokens
//! carry a keyed HMAC-SHA256 signature over their immutable fields and a
//! parent reference forming a chain.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::firewall::request::{now_unix, Intent};

type HmacSha256 = Hmac<Sha256>;

/// Input/output resource identifiers a grant depended on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dependencies {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// Capacity state and telemetry at grant time. Telemetry keys are ordered so
/// the signing payload is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub capacity_used_mb: f64,
    pub capacity_free_mb: f64,
    #[serde(default)]
    pub telemetry: BTreeMap<String, f64>,
}

/// One signed provenance record. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceToken {
    pub id: String,

    /// Unix timestamp, fractional seconds.
    pub timestamp: f64,

    /// Resource or kernel name that was granted.
    pub resource: String,

    /// Size of the grant in MB.
    pub size_mb: f64,

    pub dependencies: Dependencies,
    pub context: ContextSnapshot,

    pub intent: Intent,

    /// Human-readable reason for the grant.
    pub reason: String,

    /// Id of the preceding token, if any.
    pub parent: Option<String>,

    /// HMAC-SHA256 over the fields above, hex-encoded.
    pub signature: String,
}

impl ProvenanceToken {
    /// Create and sign a new token.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        resource: &str,
        size_mb: f64,
        intent: Intent,
        reason: &str,
        dependencies: Dependencies,
        context: ContextSnapshot,
        parent: Option<String>,
        key: &[u8],
    ) -> Self {
        let timestamp = now_unix();
        let id = derive_id(timestamp, resource, intent);

        let mut token = Self {
            id,
            timestamp,
            resource: resource.to_string(),
            size_mb,
            dependencies,
            context,
            intent,
            reason: reason.to_string(),
            parent,
            signature: String::new(),
        };
        token.signature = token.sign(key);
        token
    }

    /// Compute the signature over the immutable fields.
    fn sign(&self, key: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(key)
            .expect("HMAC accepts keys of any length");
        mac.update(self.signing_payload().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Whether the signature matches the current field values.
    pub fn verify(&self, key: &[u8]) -> bool {
        let mut mac = match HmacSha256::new_from_slice(key) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(self.signing_payload().as_bytes());
        let expected = match hex::decode(&self.signature) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        mac.verify_slice(&expected).is_ok()
    }

    /// Deterministic serialization of every field the signature covers.
    fn signing_payload(&self) -> String {
        let telemetry: Vec<String> = self
            .context
            .telemetry
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!(
            "{id}|{ts}|{res}|{size}|in:{inputs}|out:{outputs}|used:{used}|free:{free}|tel:{tel}|{intent}|{reason}|parent:{parent}",
            id = self.id,
            ts = self.timestamp,
            res = self.resource,
            size = self.size_mb,
            inputs = self.dependencies.inputs.join(","),
            outputs = self.dependencies.outputs.join(","),
            used = self.context.capacity_used_mb,
            free = self.context.capacity_free_mb,
            tel = telemetry.join(","),
            intent = self.intent,
            reason = self.reason,
            parent = self.parent.as_deref().unwrap_or("-"),
        )
    }
}

/// Token ids are a truncated digest of creation time, subject, and intent.
fn derive_id(timestamp: f64, resource: &str, intent: Intent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{timestamp}{resource}{intent}"));
    hex::encode(hasher.finalize())[..16].to_string()
}
