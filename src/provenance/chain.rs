//! Bounded provenance chain.
//!
//! Tokens are appended in order, each linked to its predecessor by id. The
//! chain is verified by walking every signature and every parent link. Once
//! the chain reaches its configured maximum, the oldest token is dropped and
//! the new head's parent reference is allowed to dangle.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::ChainConfig;
use crate::error::GovernorError;
use crate::firewall::request::Intent;
use crate::provenance::token::{ContextSnapshot, Dependencies, ProvenanceToken};

/// Summary counters exposed on the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct ChainStats {
    pub token_count: usize,
    pub total_size_mb: f64,
    pub tokens_by_intent: HashMap<String, usize>,
    pub valid: bool,
}

/// Append-only signed audit log of grants.
pub struct ProvenanceChain {
    config: ChainConfig,
    tokens: Vec<ProvenanceToken>,
}

impl ProvenanceChain {
    pub fn new(config: ChainConfig) -> Self {
        Self {
            config,
            tokens: Vec::new(),
        }
    }

    /// Sign and append a token for a grant. Returns the new token's id.
    pub fn append(
        &mut self,
        resource: &str,
        size_mb: f64,
        intent: Intent,
        reason: &str,
        dependencies: Dependencies,
        context: ContextSnapshot,
    ) -> String {
        let parent = self.tokens.last().map(|t| t.id.clone());
        let token = ProvenanceToken::create(
            resource,
            size_mb,
            intent,
            reason,
            dependencies,
            context,
            parent,
            self.config.signing_key.as_bytes(),
        );
        let id = token.id.clone();
        self.tokens.push(token);

        if self.tokens.len() > self.config.max_tokens {
            let excess = self.tokens.len() - self.config.max_tokens;
            self.tokens.drain(..excess);
        }
        id
    }

    /// Walk the whole chain, checking every signature and every parent link.
    ///
    /// The head token's parent is not checked against anything: after a trim
    /// it legitimately names a token that no longer exists.
    pub fn verify(&self) -> Result<(), GovernorError> {
        let key = self.config.signing_key.as_bytes();
        for (i, token) in self.tokens.iter().enumerate() {
            if !token.verify(key) {
                return Err(GovernorError::Integrity {
                    token_id: token.id.clone(),
                });
            }
            if i > 0 {
                let prev_id = &self.tokens[i - 1].id;
                if token.parent.as_deref() != Some(prev_id.as_str()) {
                    return Err(GovernorError::Integrity {
                        token_id: token.id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ProvenanceToken> {
        self.tokens.iter().find(|t| t.id == id)
    }

    pub fn last(&self) -> Option<&ProvenanceToken> {
        self.tokens.last()
    }

    pub fn stats(&self) -> ChainStats {
        let mut by_intent: HashMap<String, usize> = HashMap::new();
        for token in &self.tokens {
            *by_intent.entry(token.intent.tag().to_string()).or_insert(0) += 1;
        }
        ChainStats {
            token_count: self.tokens.len(),
            total_size_mb: self.tokens.iter().map(|t| t.size_mb).sum(),
            tokens_by_intent: by_intent,
            valid: self.is_valid(),
        }
    }
}
