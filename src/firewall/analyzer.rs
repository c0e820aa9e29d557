//! The firewall rule pipeline.
//!
//! `analyze` runs nine ordered checks, short-circuiting on the first
//! violation. The only state it mutates is rate-limit history and the
//! temporary block list; verdicts themselves are pure values.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::FirewallConfig;
use crate::firewall::predicate::PredicateOutcome;
use crate::firewall::request::{now_unix, CapacityRequest, Intent, Restrictions, ThreatLevel, Verdict};
use crate::firewall::rules::{intent_ceiling_mb, RuleSet};

/// Firewall statistics for the monitoring surface.
#[derive(Debug, Clone, Serialize)]
pub struct FirewallStats {
    pub total_requests: u64,
    pub denied_requests: u64,
    pub blocked_actors: usize,
    pub requests_last_minute: usize,
}

/// The admission firewall. One instance per governor; no global state.
pub struct Firewall {
    config: FirewallConfig,
    rules: RuleSet,

    /// (actor, arrival) pairs for the sliding rate window. Pruned lazily.
    request_history: Vec<(String, Instant)>,

    /// Actors on cooldown, with the instant the block lifts. Expiry is
    /// checked lazily at decision time, not by a background timer.
    blocked_actors: HashMap<String, Instant>,

    /// Externally supplied trust scores. Absent actors are neutral (0.5).
    trust_scores: HashMap<String, f64>,

    total_requests: u64,
    denied_requests: u64,
}

impl Firewall {
    pub fn new(config: FirewallConfig) -> Self {
        Self {
            config,
            rules: RuleSet::new(),
            request_history: Vec::new(),
            blocked_actors: HashMap::new(),
            trust_scores: HashMap::new(),
            total_requests: 0,
            denied_requests: 0,
        }
    }

    /// Analyze a request and produce a verdict.
    pub fn analyze(&mut self, request: &CapacityRequest) -> Verdict {
        self.analyze_at(request, Instant::now())
    }

    /// Set the trust score for an actor (clamped to 0.0 - 1.0).
    pub fn set_trust(&mut self, actor: &str, score: f64) {
        self.trust_scores
            .insert(actor.to_string(), score.clamp(0.0, 1.0));
    }

    /// Decision pipeline with an explicit clock, so tests can replay windows.
    pub fn analyze_at(&mut self, request: &CapacityRequest, now: Instant) -> Verdict {
        self.total_requests += 1;
        let verdict = self.run_checks(request, now);
        if !verdict.allowed {
            self.denied_requests += 1;
            debug!(
                actor = %request.actor,
                resource = %request.resource,
                threat = ?verdict.threat_level,
                reason = %verdict.reason,
                "Request denied"
            );
        }
        verdict
    }

    fn run_checks(&mut self, request: &CapacityRequest, now: Instant) -> Verdict {
        // Check 1: actor on the block list?
        if let Some(&until) = self.blocked_actors.get(&request.actor) {
            if now < until {
                let remaining = until.duration_since(now).as_secs();
                return Verdict::blocked(format!(
                    "actor '{}' is blocked for another {remaining}s",
                    request.actor
                ));
            }
            self.blocked_actors.remove(&request.actor);
        }

        // Check 2: cryptomining intent is an instant block with cooldown.
        if request.intent == Intent::Crypto {
            self.block_actor(&request.actor, now);
            warn!(actor = %request.actor, "Cryptomining intent, actor blocked");
            return Verdict::blocked("cryptomining intent detected");
        }

        // Check 3: known-abuse signature in the resource name.
        if let Some(pattern) = self.rules.match_disallowed(&request.resource) {
            self.block_actor(&request.actor, now);
            warn!(
                actor = %request.actor,
                resource = %request.resource,
                pattern,
                "Disallowed resource pattern, actor blocked"
            );
            return Verdict::blocked(format!(
                "disallowed pattern '{pattern}' in resource name"
            ));
        }

        // Check 4: weaker abuse signal. Denied, no cooldown.
        if let Some(pattern) = self.rules.match_suspicious(&request.resource) {
            return Verdict::suspicious(format!(
                "suspicious pattern '{pattern}' in resource name"
            ));
        }

        // Check 5: per-intent capacity ceiling.
        let ceiling = intent_ceiling_mb(request.intent);
        if request.capacity_mb > ceiling {
            return Verdict::suspicious(format!(
                "capacity request ({} MB) exceeds {} ceiling ({ceiling} MB)",
                request.capacity_mb, request.intent
            ));
        }

        // Check 6: over-long duration is clamped, not rejected.
        if request.estimated_duration_secs > self.config.max_duration_secs {
            return Verdict {
                allowed: true,
                threat_level: ThreatLevel::Suspicious,
                reason: format!(
                    "duration clamped to {}s",
                    self.config.max_duration_secs
                ),
                restrictions: Some(Restrictions {
                    capacity_mb: None,
                    duration_secs: Some(self.config.max_duration_secs),
                }),
                expires_at: Some(now_unix() + self.config.max_duration_secs),
            };
        }

        // Check 7: sliding-window rate limit per actor.
        let window = Duration::from_secs(60);
        self.request_history
            .retain(|(_, ts)| now.duration_since(*ts) < window);
        let recent = self
            .request_history
            .iter()
            .filter(|(actor, _)| actor == &request.actor)
            .count();
        if recent >= self.config.rate_limit_per_minute {
            return Verdict::suspicious(format!(
                "rate limit reached ({}/min) for actor '{}'",
                self.config.rate_limit_per_minute, request.actor
            ));
        }

        // Check 8: low-trust actors run with narrowed limits.
        let trust = self
            .trust_scores
            .get(&request.actor)
            .copied()
            .unwrap_or(0.5);
        if trust < self.config.trust_threshold {
            return Verdict {
                allowed: true,
                threat_level: ThreatLevel::Suspicious,
                reason: format!("low trust ({trust:.2}), restricted resources"),
                restrictions: Some(Restrictions {
                    capacity_mb: Some(
                        request.capacity_mb.min(self.config.low_trust_capacity_mb),
                    ),
                    duration_secs: Some(
                        request
                            .estimated_duration_secs
                            .min(self.config.low_trust_duration_secs),
                    ),
                }),
                expires_at: None,
            };
        }

        // Check 9: operator-defined predicates. A broken predicate denies.
        for predicate in &self.config.predicates {
            if let PredicateOutcome::Fail(reason) = predicate.evaluate(request) {
                return Verdict::suspicious(format!("constraint violated: {reason}"));
            }
        }

        // All checks passed. Record into the rate window.
        self.request_history.push((request.actor.clone(), now));
        Verdict {
            allowed: true,
            threat_level: ThreatLevel::Safe,
            reason: "request approved".to_string(),
            restrictions: None,
            expires_at: Some(now_unix() + request.estimated_duration_secs),
        }
    }

    fn block_actor(&mut self, actor: &str, now: Instant) {
        let cooldown = Duration::from_secs(self.config.block_cooldown_hours * 3600);
        self.blocked_actors.insert(actor.to_string(), now + cooldown);
    }

    /// Export firewall statistics.
    pub fn stats(&self) -> FirewallStats {
        let now = Instant::now();
        FirewallStats {
            total_requests: self.total_requests,
            denied_requests: self.denied_requests,
            blocked_actors: self.blocked_actors.len(),
            requests_last_minute: self
                .request_history
                .iter()
                .filter(|(_, ts)| now.duration_since(*ts) < Duration::from_secs(60))
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn firewall() -> Firewall {
        Firewall::new(FirewallConfig::default())
    }

    fn request(intent: Intent, resource: &str, actor: &str, capacity: u64) -> CapacityRequest {
        CapacityRequest {
            intent,
            resource: resource.to_string(),
            actor: actor.to_string(),
            capacity_mb: capacity,
            estimated_duration_secs: 30.0,
            parent_token: None,
        }
    }

    #[test]
    fn test_clean_request_approved() {
        let mut fw = firewall();
        let v = fw.analyze(&request(Intent::Inference, "phi3:security", "brain_api", 3500));
        assert!(v.allowed);
        assert_eq!(v.threat_level, ThreatLevel::Safe);
        assert!(v.expires_at.is_some());
    }

    #[test]
    fn test_crypto_intent_blocks_with_cooldown() {
        let mut fw = firewall();
        let v = fw.analyze(&request(Intent::Crypto, "anything", "mallory", 500));
        assert!(!v.allowed);
        assert_eq!(v.threat_level, ThreatLevel::Blocked);

        // Second request from the same actor hits the block list first.
        let v2 = fw.analyze(&request(Intent::Inference, "phi3", "mallory", 500));
        assert!(!v2.allowed);
        assert!(v2.reason.contains("blocked for another"));
    }

    #[test]
    fn test_disallowed_pattern_blocks() {
        let mut fw = firewall();
        let v = fw.analyze(&request(Intent::Inference, "xmrig-cuda", "mallory", 500));
        assert!(!v.allowed);
        assert_eq!(v.threat_level, ThreatLevel::Blocked);
        assert!(v.reason.contains("xmrig"));
    }

    #[test]
    fn test_suspicious_pattern_denies_without_cooldown() {
        let mut fw = firewall();
        let v = fw.analyze(&request(Intent::Inference, "turbo-miner", "eve", 500));
        assert!(!v.allowed);
        assert_eq!(v.threat_level, ThreatLevel::Suspicious);

        // No cooldown: an innocent follow-up is judged on its own merits.
        let v2 = fw.analyze(&request(Intent::Inference, "phi3", "eve", 500));
        assert!(v2.allowed);
    }

    #[test]
    fn test_unknown_intent_uses_restrictive_ceiling() {
        let mut fw = firewall();
        let v = fw.analyze(&request(Intent::Unknown, "mystery", "carol", 1500));
        assert!(!v.allowed);
        assert!(v.reason.contains("ceiling"));

        let v2 = fw.analyze(&request(Intent::Unknown, "mystery", "carol", 800));
        assert!(v2.allowed);
    }

    #[test]
    fn test_duration_clamped_not_rejected() {
        let mut fw = firewall();
        let mut req = request(Intent::Inference, "phi3", "brain_api", 3500);
        req.estimated_duration_secs = 86400.0;
        let v = fw.analyze(&req);
        assert!(v.allowed);
        let r = v.restrictions.expect("restrictions present");
        assert_eq!(r.duration_secs, Some(3600.0));
        assert!(v.expires_at.is_some());
    }

    #[test]
    fn test_rate_limit() {
        let mut fw = firewall();
        for _ in 0..10 {
            let v = fw.analyze(&request(Intent::Inference, "phi3", "chatty", 500));
            assert!(v.allowed);
        }
        let v = fw.analyze(&request(Intent::Inference, "phi3", "chatty", 500));
        assert!(!v.allowed);
        assert!(v.reason.contains("rate limit"));
    }

    #[test]
    fn test_low_trust_restricted() {
        let mut fw = firewall();
        fw.set_trust("newbie", 0.2);
        let v = fw.analyze(&request(Intent::Inference, "phi3", "newbie", 6000));
        assert!(v.allowed);
        let r = v.restrictions.expect("restrictions present");
        assert_eq!(r.capacity_mb, Some(2000));
        assert_eq!(r.duration_secs, Some(30.0));
    }

    #[test]
    fn test_block_expiry_is_lazy() {
        let mut cfg = FirewallConfig::default();
        cfg.block_cooldown_hours = 0; // cooldown of zero expires immediately
        let mut fw = Firewall::new(cfg);

        fw.analyze(&request(Intent::Crypto, "anything", "mallory", 500));
        // Cooldown already lapsed; block is removed at the next decision.
        let v = fw.analyze(&request(Intent::Inference, "phi3", "mallory", 500));
        assert!(v.allowed);
    }

    #[test]
    fn test_custom_predicate_denies() {
        use crate::firewall::predicate::{NumericField, Predicate};
        let mut cfg = FirewallConfig::default();
        cfg.predicates.push(Predicate::NumericAtMost {
            field: NumericField::CapacityMb,
            max: 1000.0,
        });
        let mut fw = Firewall::new(cfg);
        let v = fw.analyze(&request(Intent::Inference, "phi3", "brain_api", 2000));
        assert!(!v.allowed);
        assert!(v.reason.contains("constraint"));
    }
}
