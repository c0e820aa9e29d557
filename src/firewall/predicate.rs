//! Operator-defined safety constraints as a closed predicate set.
//!
//! Constraints are structured data evaluated by a small interpreter, never
//! arbitrary code. An unevaluable predicate (e.g. malformed pattern) fails
//! closed: the request is denied.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::firewall::request::{CapacityRequest, Intent};

/// Numeric field of a request a threshold predicate can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericField {
    CapacityMb,
    DurationSecs,
}

/// A single constraint. Each variant is one predicate kind; there is no
/// escape hatch into expression evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// A numeric field must not exceed a threshold.
    NumericAtMost { field: NumericField, max: f64 },

    /// The resource name must match (or must not match) a pattern.
    ResourceMatches { pattern: String, require: bool },

    /// The declared intent must be one of the listed tags.
    IntentIn { allowed: Vec<Intent> },
}

/// Outcome of evaluating one predicate against one request.
#[derive(Debug, Clone, PartialEq)]
pub enum PredicateOutcome {
    Pass,
    /// The predicate failed; the reason names the violated constraint.
    Fail(String),
}

impl Predicate {
    /// Evaluate against a request. Evaluation errors are reported as `Fail`
    /// so that a broken constraint denies rather than silently admits.
    pub fn evaluate(&self, request: &CapacityRequest) -> PredicateOutcome {
        match self {
            Predicate::NumericAtMost { field, max } => {
                let value = match field {
                    NumericField::CapacityMb => request.capacity_mb as f64,
                    NumericField::DurationSecs => request.estimated_duration_secs,
                };
                if value <= *max {
                    PredicateOutcome::Pass
                } else {
                    PredicateOutcome::Fail(format!(
                        "{field:?} = {value} exceeds constraint max {max}"
                    ))
                }
            }
            Predicate::ResourceMatches { pattern, require } => {
                let re = match Regex::new(pattern) {
                    Ok(re) => re,
                    Err(e) => {
                        return PredicateOutcome::Fail(format!(
                            "unevaluable resource pattern '{pattern}': {e}"
                        ))
                    }
                };
                let matched = re.is_match(&request.resource);
                if matched == *require {
                    PredicateOutcome::Pass
                } else if *require {
                    PredicateOutcome::Fail(format!(
                        "resource '{}' does not match required pattern '{pattern}'",
                        request.resource
                    ))
                } else {
                    PredicateOutcome::Fail(format!(
                        "resource '{}' matches forbidden pattern '{pattern}'",
                        request.resource
                    ))
                }
            }
            Predicate::IntentIn { allowed } => {
                if allowed.contains(&request.intent) {
                    PredicateOutcome::Pass
                } else {
                    PredicateOutcome::Fail(format!(
                        "intent '{}' not in allowed set",
                        request.intent
                    ))
                }
            }
        }
    }
}
