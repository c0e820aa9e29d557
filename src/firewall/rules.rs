//! Static rule tables: abuse signatures and per-intent capacity ceilings.
//!
//! The pattern lists are compiled once at firewall construction. Ceilings are
//! a fixed table; every intent has an explicit row, including `Unknown`,
//! which gets the most restrictive ceiling rather than rejection.

use regex::RegexSet;

use crate::firewall::request::Intent;

/// Known cryptomining kernel/model name signatures. A match is a hard block
/// with a cooldown penalty.
const DISALLOWED_PATTERNS: &[&str] = &[
    r"xmrig",
    r"ethminer",
    r"phoenixminer",
    r"trex",
    r"nicehash",
    r"kawpow",
    r"randomx",
    r"ethash",
    r"cryptonight",
    r"equihash",
    r"beam",
    r"grin",
];

/// Weaker abuse signals. A match denies the request but carries no cooldown.
const SUSPICIOUS_PATTERNS: &[&str] = &[
    r"miner",
    r"hash",
    r"coin",
    r"benchmark.*loop",
];

/// Compiled pattern tables.
pub struct RuleSet {
    disallowed: RegexSet,
    suspicious: RegexSet,
}

impl RuleSet {
    pub fn new() -> Self {
        Self {
            disallowed: RegexSet::new(DISALLOWED_PATTERNS)
                .expect("disallowed pattern table must compile"),
            suspicious: RegexSet::new(SUSPICIOUS_PATTERNS)
                .expect("suspicious pattern table must compile"),
        }
    }

    /// First disallowed pattern matching the resource name, if any.
    pub fn match_disallowed(&self, resource: &str) -> Option<&'static str> {
        let lower = resource.to_ascii_lowercase();
        self.disallowed
            .matches(&lower)
            .iter()
            .next()
            .map(|i| DISALLOWED_PATTERNS[i])
    }

    /// First suspicious pattern matching the resource name, if any.
    pub fn match_suspicious(&self, resource: &str) -> Option<&'static str> {
        let lower = resource.to_ascii_lowercase();
        self.suspicious
            .matches(&lower)
            .iter()
            .next()
            .map(|i| SUSPICIOUS_PATTERNS[i])
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Maximum capacity in MB an intent may request in a single call.
pub fn intent_ceiling_mb(intent: Intent) -> u64 {
    match intent {
        Intent::Inference => 8000,
        Intent::Completion => 8000,
        Intent::Transcription => 4000,
        Intent::Embedding => 2000,
        Intent::Vision => 6000,
        Intent::Training => 10000,
        Intent::Crypto => 0,
        Intent::Unknown => 1000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disallowed_match() {
        let rules = RuleSet::new();
        assert_eq!(rules.match_disallowed("xmrig-cuda"), Some("xmrig"));
        assert_eq!(rules.match_disallowed("XMRig-CUDA"), Some("xmrig"));
        assert!(rules.match_disallowed("phi3:security").is_none());
    }

    #[test]
    fn test_suspicious_match() {
        let rules = RuleSet::new();
        assert!(rules.match_suspicious("super-miner-v2").is_some());
        assert!(rules.match_suspicious("benchmark-forever-loop").is_some());
        assert!(rules.match_suspicious("qwen2.5:7b").is_none());
    }

    #[test]
    fn test_ceiling_table_covers_unknown() {
        assert_eq!(intent_ceiling_mb(Intent::Unknown), 1000);
        assert_eq!(intent_ceiling_mb(Intent::Crypto), 0);
        assert!(intent_ceiling_mb(Intent::Training) > intent_ceiling_mb(Intent::Embedding));
    }
}
