//! Model layer types and the residency state machine.
//!
//! A layer is the unit of movement in and out of a node's bounded capacity.
//! Lifecycle: created on-disk at registration, moves forward through
//! staging → transferring → resident (→ active while in use), and returns
//! to on-disk only via eviction. An active layer is never evicted.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Structural role of a layer within its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerCategory {
    Embedding,
    Attention,
    FeedForward,
    OutputHead,
}

impl LayerCategory {
    /// Parse a category tag as used in registration payloads.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "embedding" => Some(LayerCategory::Embedding),
            "attention" => Some(LayerCategory::Attention),
            "ffn" | "feed_forward" => Some(LayerCategory::FeedForward),
            "lm_head" | "output_head" => Some(LayerCategory::OutputHead),
            _ => None,
        }
    }
}

/// Where a layer currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Residency {
    /// On storage, not loaded.
    OnDisk,
    /// In the staging buffer, queued for transfer.
    Staging,
    /// Transfer to the node in progress.
    Transferring,
    /// In node capacity, ready for use.
    Resident,
    /// In node capacity and currently in use. Not evictable.
    Active,
    /// Being removed from node capacity.
    Evicting,
}

impl std::fmt::Display for Residency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Residency::OnDisk => "on_disk",
            Residency::Staging => "staging",
            Residency::Transferring => "transferring",
            Residency::Resident => "resident",
            Residency::Active => "active",
            Residency::Evicting => "evicting",
        };
        write!(f, "{s}")
    }
}

/// Layer description supplied at model registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub size_mb: f64,
    /// Category tag ("embedding", "attention", "ffn", "lm_head").
    pub category: String,
}

/// One layer of a registered resource.
#[derive(Debug, Clone)]
pub struct ModelLayer {
    pub name: String,
    pub size_mb: f64,
    pub category: LayerCategory,
    pub residency: Residency,

    /// Ordinal position within the resource (1 = first).
    pub priority: usize,

    /// When the layer was last used, if ever.
    pub last_used: Option<Instant>,
}

impl ModelLayer {
    pub fn new(name: &str, size_mb: f64, category: LayerCategory, priority: usize) -> Self {
        Self {
            name: name.to_string(),
            size_mb,
            category,
            residency: Residency::OnDisk,
            priority,
            last_used: None,
        }
    }

    /// Whether the layer currently occupies node capacity.
    pub fn is_resident(&self) -> bool {
        matches!(self.residency, Residency::Resident | Residency::Active)
    }

    /// Record a use.
    pub fn touch(&mut self, now: Instant) {
        self.last_used = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_tags() {
        assert_eq!(LayerCategory::from_tag("embedding"), Some(LayerCategory::Embedding));
        assert_eq!(LayerCategory::from_tag("ffn"), Some(LayerCategory::FeedForward));
        assert_eq!(LayerCategory::from_tag("lm_head"), Some(LayerCategory::OutputHead));
        assert_eq!(LayerCategory::from_tag("glue"), None);
    }

    #[test]
    fn test_residency_predicate() {
        let mut layer = ModelLayer::new("l0", 512.0, LayerCategory::Attention, 1);
        assert!(!layer.is_resident());

        layer.residency = Residency::Resident;
        assert!(layer.is_resident());

        layer.residency = Residency::Active;
        assert!(layer.is_resident());

        layer.residency = Residency::Evicting;
        assert!(!layer.is_resident());
    }
}
