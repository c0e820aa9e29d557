//! Per-node layer cache: residency planning, admission, and eviction.
//!
//! `ensure_resident` is the core allocator operation. On a miss it evicts the
//! globally least-recently-used inactive layers — across all registered
//! resources on the node, not just the requested one — until the new layer
//! fits. If the inactive layers cannot free enough room, the call fails
//! explicitly instead of overcommitting.
//!
//! Transfers are modeled, not performed: each operation reports an estimated
//! duration derived from size and a bandwidth constant, and a real deployment
//! would await the corresponding asynchronous copy. Nothing here sleeps.
//!
//! Callers wrap each node's cache in its own lock so that an
//! eviction-then-admit sequence cannot interleave with another eviction
//! decision on the same node.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::layer::{LayerCategory, LayerSpec, ModelLayer, Residency};
use crate::config::CacheConfig;
use crate::error::GovernorError;
use crate::firewall::request::Intent;

/// Which categories an intent needs resident. `None` means all layers.
///
/// This mapping is declarative and covers every intent explicitly; it is not
/// a heuristic.
fn categories_for_intent(intent: Intent) -> Option<&'static [LayerCategory]> {
    match intent {
        Intent::Embedding => Some(&[LayerCategory::Embedding]),
        Intent::Completion => Some(&[
            LayerCategory::Attention,
            LayerCategory::OutputHead,
            LayerCategory::Embedding,
        ]),
        Intent::Inference
        | Intent::Transcription
        | Intent::Training
        | Intent::Vision
        | Intent::Crypto
        | Intent::Unknown => None,
    }
}

/// Result of planning residency for one request.
#[derive(Debug, Clone, Serialize)]
pub struct ResidencyPlan {
    pub resource: String,
    pub intent: Intent,

    /// Names of layers the intent needs, in resource order.
    pub layers_needed: Vec<String>,

    pub total_size_mb: f64,
    pub already_resident: usize,
    pub to_transfer: usize,

    /// Modeled time to transfer the missing layers, in ms.
    pub estimated_transfer_ms: f64,
}

/// Result of one `ensure_resident` call.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmitOutcome {
    /// False when the layer was already resident (cache hit).
    pub transferred: bool,

    /// Layers evicted to make room.
    pub evicted: Vec<String>,

    /// Modeled transfer time in ms (0 on a hit).
    pub estimated_transfer_ms: f64,
}

/// Cache counters for the monitoring surface.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub layers_loaded: u64,
    pub layers_evicted: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub prefetch_loads: u64,
    pub prefetch_skips: u64,
}

/// One resident layer in the snapshot export.
#[derive(Debug, Clone, Serialize)]
pub struct ResidentLayer {
    pub resource: String,
    pub layer: String,
    pub size_mb: f64,
    pub state: Residency,
}

/// Point-in-time residency snapshot for one node.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub node: String,
    pub capacity_mb: f64,
    pub used_mb: f64,
    pub free_mb: f64,
    pub usage_pct: f64,
    pub resident_layers: Vec<ResidentLayer>,
    pub stats: CacheStats,
}

/// Layer cache for a single node's bounded capacity.
pub struct LayerCache {
    node: String,
    capacity_mb: f64,
    used_mb: f64,
    config: CacheConfig,

    /// Registered resources, each an ordered layer list.
    resources: HashMap<String, Vec<ModelLayer>>,

    stats: CacheStats,
}

impl LayerCache {
    pub fn new(node: &str, capacity_mb: u64, config: CacheConfig) -> Self {
        Self {
            node: node.to_string(),
            capacity_mb: capacity_mb as f64,
            used_mb: 0.0,
            config,
            resources: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Register a resource and its ordered layers. Re-registration replaces
    /// the layer list; any residency of the old layers is released.
    pub fn register_resource(&mut self, name: &str, specs: &[LayerSpec]) -> Result<(), GovernorError> {
        let mut layers = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let category = LayerCategory::from_tag(&spec.category).ok_or_else(|| {
                GovernorError::Internal(format!(
                    "unknown layer category '{}' for layer '{}'",
                    spec.category, spec.name
                ))
            })?;
            layers.push(ModelLayer::new(&spec.name, spec.size_mb, category, i + 1));
        }

        if let Some(old) = self.resources.insert(name.to_string(), layers) {
            for layer in old.iter().filter(|l| l.is_resident()) {
                self.used_mb = (self.used_mb - layer.size_mb).max(0.0);
            }
        }
        info!(node = %self.node, resource = name, layers = specs.len(), "Resource registered");
        Ok(())
    }

    /// Plan which layers the intent needs and what must still move.
    pub fn plan_residency(
        &mut self,
        resource: &str,
        intent: Intent,
    ) -> Result<ResidencyPlan, GovernorError> {
        let layers = self
            .resources
            .get(resource)
            .ok_or_else(|| GovernorError::UnknownResource(resource.to_string()))?;

        let wanted = categories_for_intent(intent);
        let needed: Vec<&ModelLayer> = layers
            .iter()
            .filter(|l| match wanted {
                Some(cats) => cats.contains(&l.category),
                None => true,
            })
            .collect();

        let mut already_resident = 0;
        let mut to_transfer = 0;
        let mut transfer_mb = 0.0;
        for layer in &needed {
            if layer.is_resident() {
                already_resident += 1;
            } else {
                to_transfer += 1;
                transfer_mb += layer.size_mb;
            }
        }
        self.stats.cache_hits += already_resident as u64;
        self.stats.cache_misses += to_transfer as u64;

        Ok(ResidencyPlan {
            resource: resource.to_string(),
            intent,
            layers_needed: needed.iter().map(|l| l.name.clone()).collect(),
            total_size_mb: needed.iter().map(|l| l.size_mb).sum(),
            already_resident,
            to_transfer,
            estimated_transfer_ms: self.transfer_ms(transfer_mb),
        })
    }

    /// Make one layer resident, evicting LRU inactive layers if needed.
    pub fn ensure_resident(
        &mut self,
        resource: &str,
        layer_name: &str,
    ) -> Result<AdmitOutcome, GovernorError> {
        self.admit(resource, layer_name, true, Instant::now())
    }

    /// Best-effort prefetch of the next layers after `current_index`
    /// (0-based) in the resource's ordered list. Never evicts: a prefetch
    /// that does not fit in free capacity is skipped, so it can never take
    /// room the immediate request still needs. Returns the layers loaded.
    pub fn prefetch(
        &mut self,
        resource: &str,
        current_index: usize,
    ) -> Result<Vec<String>, GovernorError> {
        let layers = self
            .resources
            .get(resource)
            .ok_or_else(|| GovernorError::UnknownResource(resource.to_string()))?;

        let upcoming: Vec<String> = layers
            .iter()
            .skip(current_index + 1)
            .take(self.config.prefetch_ahead)
            .filter(|l| !l.is_resident())
            .map(|l| l.name.clone())
            .collect();

        let now = Instant::now();
        let mut loaded = Vec::new();
        for name in upcoming {
            match self.admit(resource, &name, false, now) {
                Ok(outcome) if outcome.transferred => {
                    self.stats.prefetch_loads += 1;
                    loaded.push(name);
                }
                Ok(_) => {}
                Err(_) => {
                    // Under pressure; skip the rest.
                    self.stats.prefetch_skips += 1;
                    break;
                }
            }
        }
        Ok(loaded)
    }

    /// Mark a resident layer active, pinning it against eviction.
    pub fn mark_active(&mut self, resource: &str, layer_name: &str) -> Result<(), GovernorError> {
        let layer = self.layer_mut(resource, layer_name)?;
        if !layer.is_resident() {
            return Err(GovernorError::Internal(format!(
                "layer '{layer_name}' cannot be activated from state {}",
                layer.residency
            )));
        }
        layer.residency = Residency::Active;
        layer.touch(Instant::now());
        Ok(())
    }

    /// Return an active layer to plain residency, making it evictable again.
    pub fn release(&mut self, resource: &str, layer_name: &str) -> Result<(), GovernorError> {
        let layer = self.layer_mut(resource, layer_name)?;
        if layer.residency == Residency::Active {
            layer.residency = Residency::Resident;
            layer.touch(Instant::now());
        }
        Ok(())
    }

    /// Residency snapshot for the monitoring surface.
    pub fn snapshot(&self) -> CacheSnapshot {
        let mut resident = Vec::new();
        for (resource, layers) in &self.resources {
            for layer in layers.iter().filter(|l| l.is_resident()) {
                resident.push(ResidentLayer {
                    resource: resource.clone(),
                    layer: layer.name.clone(),
                    size_mb: layer.size_mb,
                    state: layer.residency,
                });
            }
        }
        CacheSnapshot {
            node: self.node.clone(),
            capacity_mb: self.capacity_mb,
            used_mb: self.used_mb,
            free_mb: self.capacity_mb - self.used_mb,
            usage_pct: if self.capacity_mb > 0.0 {
                (self.used_mb / self.capacity_mb * 1000.0).round() / 10.0
            } else {
                0.0
            },
            resident_layers: resident,
            stats: self.stats,
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Residency state of one layer, mainly for tests and the dashboard.
    pub fn residency_of(&self, resource: &str, layer_name: &str) -> Option<Residency> {
        self.resources
            .get(resource)?
            .iter()
            .find(|l| l.name == layer_name)
            .map(|l| l.residency)
    }

    fn admit(
        &mut self,
        resource: &str,
        layer_name: &str,
        allow_evict: bool,
        now: Instant,
    ) -> Result<AdmitOutcome, GovernorError> {
        let layers = self
            .resources
            .get_mut(resource)
            .ok_or_else(|| GovernorError::UnknownResource(resource.to_string()))?;
        let idx = layers
            .iter()
            .position(|l| l.name == layer_name)
            .ok_or_else(|| {
                GovernorError::Internal(format!(
                    "layer '{layer_name}' not part of resource '{resource}'"
                ))
            })?;

        if layers[idx].is_resident() {
            layers[idx].touch(now);
            self.stats.cache_hits += 1;
            return Ok(AdmitOutcome {
                transferred: false,
                evicted: Vec::new(),
                estimated_transfer_ms: 0.0,
            });
        }

        let size_mb = layers[idx].size_mb;
        self.stats.cache_misses += 1;

        let mut evicted = Vec::new();
        let free = self.capacity_mb - self.used_mb;
        if free < size_mb {
            if !allow_evict {
                return Err(GovernorError::CapacityExhausted {
                    node: self.node.clone(),
                    needed_mb: size_mb,
                    freeable_mb: 0.0,
                });
            }
            evicted = self.evict_lru(size_mb - free)?;
        }

        // Transfer: on-disk → staging → transferring → resident. The real
        // copy is an async operation the caller awaits; here only the state
        // machine and the accounting advance.
        let layers = self
            .resources
            .get_mut(resource)
            .ok_or_else(|| GovernorError::UnknownResource(resource.to_string()))?;
        let layer = &mut layers[idx];
        layer.residency = Residency::Staging;
        layer.residency = Residency::Transferring;
        layer.residency = Residency::Resident;
        layer.touch(now);
        self.used_mb += size_mb;
        self.stats.layers_loaded += 1;

        debug!(
            node = %self.node,
            resource,
            layer = layer_name,
            size_mb,
            evicted = evicted.len(),
            "Layer admitted"
        );

        Ok(AdmitOutcome {
            transferred: true,
            evicted,
            estimated_transfer_ms: self.transfer_ms(size_mb),
        })
    }

    /// Evict least-recently-used inactive layers until `need_mb` is free.
    /// Fails without evicting anything if the inactive set cannot cover the
    /// need, so a doomed request does not churn the cache.
    fn evict_lru(&mut self, need_mb: f64) -> Result<Vec<String>, GovernorError> {
        // (resource, index, size, last_used) for every evictable layer.
        let mut candidates: Vec<(String, usize, f64, Option<Instant>)> = Vec::new();
        for (resource, layers) in &self.resources {
            for (i, layer) in layers.iter().enumerate() {
                if layer.residency == Residency::Resident {
                    candidates.push((resource.clone(), i, layer.size_mb, layer.last_used));
                }
            }
        }

        let freeable: f64 = candidates.iter().map(|(_, _, size, _)| size).sum();
        if freeable < need_mb {
            warn!(
                node = %self.node,
                need_mb,
                freeable_mb = freeable,
                "Eviction cannot free enough capacity"
            );
            return Err(GovernorError::CapacityExhausted {
                node: self.node.clone(),
                needed_mb: need_mb,
                freeable_mb: freeable,
            });
        }

        // Oldest first; never-used layers sort before any timestamp.
        candidates.sort_by_key(|(_, _, _, last_used)| *last_used);

        let mut freed = 0.0;
        let mut evicted = Vec::new();
        for (resource, idx, size, _) in candidates {
            if freed >= need_mb {
                break;
            }
            if let Some(layers) = self.resources.get_mut(&resource) {
                let layer = &mut layers[idx];
                layer.residency = Residency::Evicting;
                layer.residency = Residency::OnDisk;
                self.used_mb = (self.used_mb - size).max(0.0);
                freed += size;
                self.stats.layers_evicted += 1;
                evicted.push(layer.name.clone());
            }
        }

        debug!(node = %self.node, freed_mb = freed, count = evicted.len(), "Eviction complete");
        Ok(evicted)
    }

    fn layer_mut(
        &mut self,
        resource: &str,
        layer_name: &str,
    ) -> Result<&mut ModelLayer, GovernorError> {
        self.resources
            .get_mut(resource)
            .ok_or_else(|| GovernorError::UnknownResource(resource.to_string()))?
            .iter_mut()
            .find(|l| l.name == layer_name)
            .ok_or_else(|| {
                GovernorError::Internal(format!(
                    "layer '{layer_name}' not part of resource '{resource}'"
                ))
            })
    }

    fn transfer_ms(&self, size_mb: f64) -> f64 {
        if self.config.transfer_bandwidth_mb_per_sec <= 0.0 {
            return 0.0;
        }
        size_mb / self.config.transfer_bandwidth_mb_per_sec * 1000.0
    }
}
