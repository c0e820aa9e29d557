//! The admission pipeline.
//!
//! `Governor` owns one instance of each subsystem and runs every capacity
//! request through the same sequence: firewall verdict, budget quote and
//! charge, node routing, layer residency, provenance token. Nothing in the
//! pipeline is global; construct as many governors as you like.
//!
//! Locking is layered to keep the two correctness-critical sections small:
//! - firewall + ledger share one mutex, so verdict, quote, and charge are a
//!   single critical section and concurrent requests cannot overspend a quota
//! - the router sits behind a read-write lock (routing is read-mostly)
//! - each node's layer cache has its own mutex, so an eviction decision and
//!   the admit it makes room for cannot interleave on that node
//! - the provenance chain has its own mutex
//!
//! Locks are always taken in that order and never held across a lower layer's
//! await, so the pipeline cannot deadlock. Prefetch runs as a spawned task
//! after the grant is returned; it never blocks an admission.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::budget::ledger::{BudgetDashboard, BudgetLedger, ComputeCost, PeriodStats};
use crate::cache::layer::LayerSpec;
use crate::cache::residency::{CacheSnapshot, LayerCache, ResidencyPlan};
use crate::config::{Config, NodeDecl};
use crate::error::GovernorError;
use crate::firewall::analyzer::{Firewall, FirewallStats};
use crate::firewall::request::{now_unix, CapacityRequest, Verdict};
use crate::provenance::chain::{ChainStats, ProvenanceChain};
use crate::provenance::token::{ContextSnapshot, Dependencies};
use crate::router::balancer::{ClusterStatus, NodeRouter, RouteDecision};
use crate::router::node::Heartbeat;

/// Compute intensity assumed when the caller does not measure it.
const DEFAULT_INTENSITY: f64 = 1.0;

/// A successful admission: the request may execute on `route.target` within
/// the granted limits.
#[derive(Debug, Clone, Serialize)]
pub struct Grant {
    pub request_id: String,
    pub actor: String,
    pub resource: String,

    /// Capacity actually granted, after any firewall narrowing.
    pub granted_capacity_mb: u64,

    /// Duration actually granted, after any firewall narrowing.
    pub granted_duration_secs: f64,

    pub verdict: Verdict,
    pub cost: ComputeCost,
    pub route: RouteDecision,

    /// Residency plan on the target node, when the resource is layer-managed
    /// there.
    pub residency: Option<ResidencyPlan>,

    /// Layers evicted on the target node to make room.
    pub evicted: Vec<String>,

    /// 1-based position among actors ordered by wait estimate.
    pub queue_position: usize,

    /// Provenance token recording this grant.
    pub token_id: String,
}

/// Aggregated monitoring export across all subsystems.
#[derive(Debug, Serialize)]
pub struct GovernorDashboard {
    pub uptime_secs: u64,
    pub firewall: FirewallStats,
    pub budget: BudgetDashboard,
    pub cluster: ClusterStatus,
    pub caches: HashMap<String, CacheSnapshot>,
    pub chain: ChainStats,
}

/// Firewall and ledger share one lock: verdict, quote, and charge must be
/// atomic with respect to concurrent admissions.
struct AdmissionState {
    firewall: Firewall,
    ledger: BudgetLedger,
}

/// Composes the subsystems into one admission pipeline.
pub struct Governor {
    config: Arc<Config>,
    admission: Mutex<AdmissionState>,
    router: RwLock<NodeRouter>,
    caches: RwLock<HashMap<String, Arc<Mutex<LayerCache>>>>,
    chain: Mutex<ProvenanceChain>,
    start_time: Instant,
}

impl Governor {
    pub fn new(config: Arc<Config>) -> Self {
        let router = NodeRouter::new(config.router.clone());
        let caches = router
            .node_capacities()
            .into_iter()
            .map(|(name, capacity_mb)| {
                let cache = LayerCache::new(&name, capacity_mb, config.cache.clone());
                (name, Arc::new(Mutex::new(cache)))
            })
            .collect();

        Self {
            admission: Mutex::new(AdmissionState {
                firewall: Firewall::new(config.firewall.clone()),
                ledger: BudgetLedger::new(config.budget.clone()),
            }),
            router: RwLock::new(router),
            caches: RwLock::new(caches),
            chain: Mutex::new(ProvenanceChain::new(config.chain.clone())),
            config,
            start_time: Instant::now(),
        }
    }

    /// Run one request through the full pipeline.
    pub async fn admit(self: &Arc<Self>, request: CapacityRequest) -> Result<Grant, GovernorError> {
        let request_id = Uuid::new_v4().to_string();

        // Stage 1 + 2: firewall and budget, one critical section.
        let (verdict, capacity_mb, duration_secs, cost, queue_position) = {
            let mut state = self.admission.lock().await;

            let mut verdict = state.firewall.analyze(&request);
            if verdict.allowed && verdict.is_expired(now_unix()) {
                // A verdict can expire between issue and use; decide again
                // rather than honoring a stale approval.
                verdict = state.firewall.analyze(&request);
            }
            if !verdict.allowed {
                return Err(GovernorError::PolicyDenied {
                    reason: verdict.reason,
                    remediation: remediation_for(&verdict.threat_level),
                });
            }

            let (capacity_mb, duration_secs) = apply_restrictions(&request, &verdict);

            let cost = state.ledger.quote(
                &request.actor,
                capacity_mb,
                duration_secs,
                DEFAULT_INTENSITY,
            );
            if !cost.allowed {
                return Err(GovernorError::PolicyDenied {
                    reason: cost.reason,
                    remediation: "retry after the next budget reset or request less capacity"
                        .to_string(),
                });
            }

            // Charge now, while the lock still excludes other admissions.
            // Downstream failures refund.
            state.ledger.charge(&request.actor, &cost);
            let (queue_position, _) = state.ledger.queue_position(&request.actor);

            (verdict, capacity_mb, duration_secs, cost, queue_position)
        };

        // Stage 3: routing.
        let route = match self.router.read().await.route(
            request.intent,
            capacity_mb,
            Some(&request.resource),
        ) {
            Ok(route) => route,
            Err(e) => {
                self.refund(&request.actor, &cost).await;
                return Err(e);
            }
        };

        // Stage 4: layer residency on the target node.
        let cache = self.caches.read().await.get(&route.target).cloned();
        let (residency, evicted, context) = match cache {
            Some(cache) => {
                let mut cache = cache.lock().await;
                match self.ensure_layers(&mut cache, &request) {
                    Ok((residency, evicted)) => {
                        let snap = cache.snapshot();
                        drop(cache);
                        if residency.is_some() {
                            self.spawn_prefetch(&route.target, &request.resource);
                        }
                        (
                            residency,
                            evicted,
                            ContextSnapshot {
                                capacity_used_mb: snap.used_mb,
                                capacity_free_mb: snap.free_mb,
                                telemetry: Default::default(),
                            },
                        )
                    }
                    Err(e) => {
                        drop(cache);
                        self.refund(&request.actor, &cost).await;
                        return Err(e);
                    }
                }
            }
            None => (None, Vec::new(), ContextSnapshot::default()),
        };

        // Stage 5: provenance.
        let token_id = {
            let mut chain = self.chain.lock().await;
            chain.append(
                &request.resource,
                capacity_mb as f64,
                request.intent,
                &verdict.reason,
                Dependencies {
                    inputs: request.parent_token.iter().cloned().collect(),
                    outputs: Vec::new(),
                },
                context,
            )
        };

        info!(
            request_id,
            actor = %request.actor,
            resource = %request.resource,
            intent = %request.intent,
            node = %route.target,
            capacity_mb,
            token = %token_id,
            "Request admitted"
        );

        Ok(Grant {
            request_id,
            actor: request.actor,
            resource: request.resource,
            granted_capacity_mb: capacity_mb,
            granted_duration_secs: duration_secs,
            verdict,
            cost,
            route,
            residency,
            evicted,
            queue_position,
            token_id,
        })
    }

    /// Plan and load the layers the request's intent needs. Resources the
    /// node does not layer-manage pass through with no plan.
    fn ensure_layers(
        &self,
        cache: &mut LayerCache,
        request: &CapacityRequest,
    ) -> Result<(Option<ResidencyPlan>, Vec<String>), GovernorError> {
        let plan = match cache.plan_residency(&request.resource, request.intent) {
            Ok(plan) => plan,
            Err(GovernorError::UnknownResource(_)) => return Ok((None, Vec::new())),
            Err(e) => return Err(e),
        };

        let mut evicted = Vec::new();
        for layer in &plan.layers_needed {
            let outcome = cache.ensure_resident(&request.resource, layer)?;
            evicted.extend(outcome.evicted);
        }
        Ok((Some(plan), evicted))
    }

    /// Prefetch upcoming layers off the admission path. Best effort: a cache
    /// under pressure skips, never evicts.
    fn spawn_prefetch(self: &Arc<Self>, node: &str, resource: &str) {
        let governor = Arc::clone(self);
        let node = node.to_string();
        let resource = resource.to_string();
        tokio::spawn(async move {
            let cache = governor.caches.read().await.get(&node).cloned();
            if let Some(cache) = cache {
                match cache.lock().await.prefetch(&resource, 0) {
                    Ok(loaded) if !loaded.is_empty() => {
                        debug!(node = %node, resource = %resource, count = loaded.len(), "Prefetched layers");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(node = %node, resource = %resource, error = %e, "Prefetch failed");
                    }
                }
            }
        });
    }

    async fn refund(&self, actor: &str, cost: &ComputeCost) {
        let mut state = self.admission.lock().await;
        state.ledger.refund(actor, cost);
    }

    /// Apply a node heartbeat. Returns false for unknown nodes.
    pub async fn heartbeat(&self, node: &str, hb: &Heartbeat) -> bool {
        self.router.write().await.update_heartbeat(node, hb)
    }

    /// Register a node at runtime, with its own layer cache.
    pub async fn register_node(&self, decl: &NodeDecl) {
        self.router.write().await.register_node(decl);
        let cache = LayerCache::new(&decl.name, decl.capacity_mb, self.config.cache.clone());
        self.caches
            .write()
            .await
            .insert(decl.name.clone(), Arc::new(Mutex::new(cache)));
    }

    /// Register a layer-managed resource on every node's cache.
    pub async fn register_model(
        &self,
        name: &str,
        layers: &[LayerSpec],
    ) -> Result<(), GovernorError> {
        let caches = self.caches.read().await;
        for cache in caches.values() {
            cache.lock().await.register_resource(name, layers)?;
        }
        Ok(())
    }

    /// Set an actor's trust score.
    pub async fn set_trust(&self, actor: &str, score: f64) {
        self.admission.lock().await.firewall.set_trust(actor, score);
    }

    /// Register an actor with explicit quotas.
    pub async fn register_actor(
        &self,
        actor: &str,
        daily_capacity_seconds: f64,
        daily_compute_units: f64,
        distance: u32,
        weight: f64,
    ) {
        self.admission.lock().await.ledger.register_actor(
            actor,
            daily_capacity_seconds,
            daily_compute_units,
            distance,
            weight,
        );
    }

    /// Start a new budget period, archiving the old one.
    pub async fn reset_budgets(&self) -> PeriodStats {
        self.admission.lock().await.ledger.reset()
    }

    /// Verify the provenance chain end to end.
    pub async fn verify_chain(&self) -> Result<(), GovernorError> {
        self.chain.lock().await.verify()
    }

    /// Aggregate dashboard across all subsystems.
    pub async fn dashboard(&self) -> GovernorDashboard {
        let (firewall, budget) = {
            let state = self.admission.lock().await;
            (state.firewall.stats(), state.ledger.dashboard())
        };
        let cluster = self.router.read().await.cluster_status();

        let mut caches = HashMap::new();
        for (name, cache) in self.caches.read().await.iter() {
            caches.insert(name.clone(), cache.lock().await.snapshot());
        }

        let chain = self.chain.lock().await.stats();

        GovernorDashboard {
            uptime_secs: self.start_time.elapsed().as_secs(),
            firewall,
            budget,
            cluster,
            caches,
            chain,
        }
    }
}

/// Narrow the request to any verdict restrictions.
fn apply_restrictions(request: &CapacityRequest, verdict: &Verdict) -> (u64, f64) {
    let mut capacity_mb = request.capacity_mb;
    let mut duration_secs = request.estimated_duration_secs;
    if let Some(r) = &verdict.restrictions {
        if let Some(cap) = r.capacity_mb {
            capacity_mb = capacity_mb.min(cap);
        }
        if let Some(dur) = r.duration_secs {
            duration_secs = duration_secs.min(dur);
        }
    }
    (capacity_mb, duration_secs)
}

fn remediation_for(threat: &crate::firewall::request::ThreatLevel) -> String {
    use crate::firewall::request::ThreatLevel;
    match threat {
        ThreatLevel::Blocked | ThreatLevel::Quarantined => {
            "actor is blocked; wait for the cooldown to lift".to_string()
        }
        ThreatLevel::Suspicious => {
            "adjust the request (intent, resource name, or size) and retry".to_string()
        }
        ThreatLevel::Safe => "retry later".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::firewall::request::Intent;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.router = RouterConfig {
            nodes: vec![NodeDecl {
                name: "node-a".to_string(),
                address: "node-a:11434".to_string(),
                capacity_mb: 12000,
                capabilities: vec!["heavy".to_string()],
                warm_resources: Vec::new(),
            }],
            ..Default::default()
        };
        config
    }

    async fn governor() -> Arc<Governor> {
        let g = Arc::new(Governor::new(Arc::new(test_config())));
        g.heartbeat(
            "node-a",
            &Heartbeat {
                capacity_used_mb: 0,
                active_tasks: 0,
                warm_resources: None,
                latency_ms: None,
            },
        )
        .await;
        g
    }

    fn request(intent: Intent, resource: &str, actor: &str) -> CapacityRequest {
        CapacityRequest {
            intent,
            resource: resource.to_string(),
            actor: actor.to_string(),
            capacity_mb: 3500,
            estimated_duration_secs: 30.0,
            parent_token: None,
        }
    }

    #[tokio::test]
    async fn test_clean_request_granted() {
        let g = governor().await;
        let grant = g
            .admit(request(Intent::Inference, "phi3:security", "brain_api"))
            .await
            .unwrap();
        assert_eq!(grant.route.target, "node-a");
        assert_eq!(grant.granted_capacity_mb, 3500);
        assert!(!grant.token_id.is_empty());
        assert!(g.verify_chain().await.is_ok());
    }

    #[tokio::test]
    async fn test_blocked_request_denied_with_remediation() {
        let g = governor().await;
        let err = g
            .admit(request(Intent::Crypto, "anything", "mallory"))
            .await
            .unwrap_err();
        match err {
            GovernorError::PolicyDenied { remediation, .. } => {
                assert!(remediation.contains("blocked"));
            }
            other => panic!("expected PolicyDenied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_routing_failure_refunds_budget() {
        let config = test_config();
        let g = Arc::new(Governor::new(Arc::new(config)));
        // No heartbeat: routing must fail after the charge.
        let err = g
            .admit(request(Intent::Inference, "phi3", "brain_api"))
            .await
            .unwrap_err();
        assert!(matches!(err, GovernorError::NoNodeAvailable { .. }));

        let dash = g.dashboard().await;
        assert_eq!(dash.budget.period.total_requests, 0);
        let actor = dash.budget.actors.get("brain_api").unwrap();
        assert_eq!(actor.requests_this_period, 0);
    }

    #[tokio::test]
    async fn test_registered_model_gets_residency_plan() {
        let g = governor().await;
        g.register_model(
            "phi3:security",
            &[
                LayerSpec {
                    name: "embed_tokens".to_string(),
                    size_mb: 256.0,
                    category: "embedding".to_string(),
                },
                LayerSpec {
                    name: "lm_head".to_string(),
                    size_mb: 256.0,
                    category: "lm_head".to_string(),
                },
            ],
        )
        .await
        .unwrap();

        let grant = g
            .admit(request(Intent::Inference, "phi3:security", "brain_api"))
            .await
            .unwrap();
        let plan = grant.residency.expect("layer-managed resource has a plan");
        assert_eq!(plan.layers_needed.len(), 2);
    }

    #[tokio::test]
    async fn test_unmanaged_resource_admits_without_plan() {
        let g = governor().await;
        let grant = g
            .admit(request(Intent::Inference, "adhoc-kernel", "brain_api"))
            .await
            .unwrap();
        assert!(grant.residency.is_none());
    }

    #[tokio::test]
    async fn test_low_trust_narrowing_flows_into_grant() {
        let g = governor().await;
        g.set_trust("newbie", 0.1).await;
        let grant = g
            .admit(request(Intent::Inference, "phi3", "newbie"))
            .await
            .unwrap();
        assert_eq!(grant.granted_capacity_mb, 2000);
        // Cost is quoted against the narrowed capacity.
        assert_eq!(grant.cost.capacity_seconds, 2000.0 * 30.0);
    }

    #[tokio::test]
    async fn test_concurrent_admissions_never_overspend() {
        let g = governor().await;
        // Quota covers exactly two grants of 3500 MB x 30 s.
        g.register_actor("tight", 210_000.0, 10_000.0, 5, 1.0).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let g = Arc::clone(&g);
            handles.push(tokio::spawn(async move {
                g.admit(request(Intent::Inference, "phi3", "tight")).await
            }));
        }

        let mut granted = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                granted += 1;
            }
        }
        assert_eq!(granted, 2);

        let dash = g.dashboard().await;
        let actor = dash.budget.actors.get("tight").unwrap();
        assert_eq!(actor.remaining_capacity_seconds, 0.0);
    }
}
