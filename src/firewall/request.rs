//! Capacity request and verdict types.
//!
//! A [`CapacityRequest`] is immutable once created; the firewall produces one
//! [`Verdict`] per request and never mutates it afterwards.

use serde::{Deserialize, Serialize};

/// Declared purpose of a GPU request. Classification is qualitative:
/// what the capacity is *for*, not just how much is asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    /// Full LLM inference.
    Inference,
    /// Text completion (attention + output head focused).
    Completion,
    /// Audio/video transcription.
    Transcription,
    /// Vector embedding computation.
    Embedding,
    /// Model training (restricted).
    Training,
    /// Image/video analysis.
    Vision,
    /// Cryptomining. Always blocked.
    Crypto,
    /// Unclassified. Not malicious, but treated cautiously.
    Unknown,
}

impl Intent {
    /// Parse an intent tag, mapping anything unrecognized to `Unknown`.
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "inference" => Intent::Inference,
            "completion" => Intent::Completion,
            "transcription" => Intent::Transcription,
            "embedding" => Intent::Embedding,
            "training" => Intent::Training,
            "vision" => Intent::Vision,
            "crypto" => Intent::Crypto,
            _ => Intent::Unknown,
        }
    }

    /// The tag string used in capability sets and exports.
    pub fn tag(&self) -> &'static str {
        match self {
            Intent::Inference => "inference",
            Intent::Completion => "completion",
            Intent::Transcription => "transcription",
            Intent::Embedding => "embedding",
            Intent::Training => "training",
            Intent::Vision => "vision",
            Intent::Crypto => "crypto",
            Intent::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Threat classification attached to every verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Safe,
    Suspicious,
    Blocked,
    Quarantined,
}

/// An inbound request for GPU capacity. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityRequest {
    /// Declared intent tag.
    pub intent: Intent,

    /// Model or kernel name being requested.
    pub resource: String,

    /// Requesting identity.
    pub actor: String,

    /// Capacity requested in MB.
    pub capacity_mb: u64,

    /// Estimated duration in seconds.
    pub estimated_duration_secs: f64,

    /// Optional parent provenance token id, linking this request into a chain.
    #[serde(default)]
    pub parent_token: Option<String>,
}

/// Narrowed limits attached to an allowed-with-restrictions verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Restrictions {
    /// Capacity cap in MB, if narrowed.
    pub capacity_mb: Option<u64>,

    /// Duration cap in seconds, if narrowed.
    pub duration_secs: Option<f64>,
}

/// The firewall's decision about a request. Produced once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub allowed: bool,
    pub threat_level: ThreatLevel,
    pub reason: String,

    /// Present when the request is allowed but narrowed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restrictions: Option<Restrictions>,

    /// Unix timestamp (seconds) after which this verdict is stale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<f64>,
}

impl Verdict {
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            threat_level: ThreatLevel::Blocked,
            reason: reason.into(),
            restrictions: None,
            expires_at: None,
        }
    }

    pub fn suspicious(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            threat_level: ThreatLevel::Suspicious,
            reason: reason.into(),
            restrictions: None,
            expires_at: None,
        }
    }

    /// Whether the verdict has expired relative to the given unix time.
    pub fn is_expired(&self, now_unix: f64) -> bool {
        matches!(self.expires_at, Some(exp) if now_unix > exp)
    }
}

/// Current unix time in fractional seconds.
pub fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_from_tag() {
        assert_eq!(Intent::from_tag("inference"), Intent::Inference);
        assert_eq!(Intent::from_tag("TRANSCRIPTION"), Intent::Transcription);
        assert_eq!(Intent::from_tag("quantum-folding"), Intent::Unknown);
    }

    #[test]
    fn test_verdict_expiry() {
        let mut v = Verdict::blocked("nope");
        assert!(!v.is_expired(1000.0));

        v.expires_at = Some(500.0);
        assert!(v.is_expired(1000.0));
        assert!(!v.is_expired(400.0));
    }
}
