//! Intent-based admission firewall.
//!
//! Classifies each inbound capacity request and rejects disallowed or abusive
//! requests before any resource is touched:
//! - [`request`]: CapacityRequest, Intent, Verdict, ThreatLevel definitions
//! - [`rules`]: Disallowed/suspicious pattern tables and per-intent ceilings
//! - [`predicate`]: Closed predicate set for operator-defined constraints
//! - [`analyzer`]: The ordered rule pipeline with rate limiting and cooldowns

pub mod analyzer;
pub mod predicate;
pub mod request;
pub mod rules;
