//! Crate-wide error taxonomy.
//!
//! Every denial the governor can produce is an explicit result value so
//! callers can branch on the category without unwinding:
//! - [`GovernorError::PolicyDenied`]: firewall or budget refused; always recoverable
//! - [`GovernorError::CapacityExhausted`]: layer cache could not free room
//! - [`GovernorError::NoNodeAvailable`]: no routing candidate; caller must back off
//! - [`GovernorError::Integrity`]: provenance chain failed verification
//! - [`GovernorError::Internal`]: unexpected fault; admission fails closed

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GovernorError {
    /// The firewall or budget ledger rejected the request.
    #[error("policy denied: {reason}")]
    PolicyDenied {
        reason: String,
        /// Suggested remediation for the caller (retry later, request less).
        remediation: String,
    },

    /// The layer cache could not free enough capacity on the target node.
    #[error("capacity exhausted on node '{node}': needed {needed_mb} MB, freeable {freeable_mb} MB")]
    CapacityExhausted {
        node: String,
        needed_mb: f64,
        freeable_mb: f64,
    },

    /// The router found no viable node for the request.
    #[error("no node available for intent '{intent}'")]
    NoNodeAvailable { intent: String },

    /// Provenance chain verification failed. Fatal for audit purposes, but
    /// does not block new admissions.
    #[error("provenance chain integrity failure at token {token_id}")]
    Integrity { token_id: String },

    /// The named resource was never registered with the layer cache.
    #[error("unknown resource '{0}'")]
    UnknownResource(String),

    /// Unexpected internal fault. Admission paths treat this as denial.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GovernorError {
    /// Whether the caller can reasonably retry after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, GovernorError::Integrity { .. } | GovernorError::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability() {
        let denied = GovernorError::PolicyDenied {
            reason: "over quota".into(),
            remediation: "retry after reset".into(),
        };
        assert!(denied.is_recoverable());

        let integrity = GovernorError::Integrity { token_id: "abc".into() };
        assert!(!integrity.is_recoverable());
    }
}
