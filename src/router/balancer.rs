//! The routing algorithm.
//!
//! Candidate nodes are filtered by liveness and capability, then chosen by
//! warm-resource affinity first (cold-start cost dominates latency for large
//! resources) and load factor second. When nothing has free capacity the
//! request queues on the least-loaded candidate; when nothing matches at all
//! the caller gets an explicit hard failure, never a silent retry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::{NodeDecl, RouterConfig};
use crate::error::GovernorError;
use crate::firewall::request::Intent;
use crate::router::node::{GpuNode, Heartbeat, NodeStatus};

/// A routing decision for one request.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    /// Node that should serve the request.
    pub target: String,

    /// Why this node was chosen.
    pub reason: String,

    /// Estimated wait before execution starts, in ms.
    pub estimated_wait_ms: f64,

    /// Second-best candidate, if one existed.
    pub fallback: Option<String>,
}

/// Per-node row in the cluster status export.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub address: String,
    pub status: NodeStatus,
    pub load_factor: f64,
    pub capacity_used_mb: u64,
    pub capacity_mb: u64,
    pub active_tasks: u32,
    pub warm_resources: Vec<String>,
    pub tasks_completed: u64,
    pub avg_latency_ms: f64,
}

/// Cluster-wide status export.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub total_capacity_mb: u64,
    pub used_capacity_mb: u64,
    pub utilization_pct: f64,
    pub nodes_online: usize,
    pub nodes: HashMap<String, NodeSnapshot>,
}

/// Routes requests across the registered node pool.
pub struct NodeRouter {
    config: RouterConfig,
    nodes: HashMap<String, GpuNode>,
}

impl NodeRouter {
    pub fn new(config: RouterConfig) -> Self {
        let nodes = config
            .nodes
            .iter()
            .map(|decl| (decl.name.clone(), GpuNode::from_decl(decl)))
            .collect();
        Self { config, nodes }
    }

    /// Register a node after startup.
    pub fn register_node(&mut self, decl: &NodeDecl) {
        info!(node = %decl.name, capacity_mb = decl.capacity_mb, "Node registered");
        self.nodes
            .insert(decl.name.clone(), GpuNode::from_decl(decl));
    }

    /// Apply a heartbeat. Returns false for unknown nodes.
    pub fn update_heartbeat(&mut self, name: &str, hb: &Heartbeat) -> bool {
        self.update_heartbeat_at(name, hb, Instant::now())
    }

    pub fn update_heartbeat_at(&mut self, name: &str, hb: &Heartbeat, now: Instant) -> bool {
        let Some(node) = self.nodes.get_mut(name) else {
            return false;
        };
        node.apply_heartbeat(hb, now);
        debug!(
            node = name,
            load = node.load_factor(),
            status = %node.status,
            "Heartbeat applied"
        );
        true
    }

    /// Choose a node for the request.
    pub fn route(
        &self,
        intent: Intent,
        capacity_needed_mb: u64,
        preferred_resource: Option<&str>,
    ) -> Result<RouteDecision, GovernorError> {
        self.route_at(intent, capacity_needed_mb, preferred_resource, Instant::now())
    }

    pub fn route_at(
        &self,
        intent: Intent,
        capacity_needed_mb: u64,
        preferred_resource: Option<&str>,
        now: Instant,
    ) -> Result<RouteDecision, GovernorError> {
        let timeout = Duration::from_secs(self.config.heartbeat_timeout_secs);

        let candidates: Vec<&GpuNode> = self
            .nodes
            .values()
            .filter(|n| n.status != NodeStatus::Offline)
            .filter(|n| n.is_live(timeout, now))
            .filter(|n| n.can_serve(intent))
            .collect();

        if candidates.is_empty() {
            return Err(GovernorError::NoNodeAvailable {
                intent: intent.tag().to_string(),
            });
        }

        // Warm affinity: a node already holding the resource skips the
        // cold-start transfer, unless it is effectively overloaded.
        if let Some(resource) = preferred_resource {
            let warm = candidates
                .iter()
                .copied()
                .filter(|n| n.warm_resources.contains(resource))
                .filter(|n| n.load_factor() < self.config.warm_overload_threshold)
                .min_by(|a, b| a.load_factor().total_cmp(&b.load_factor()));
            if let Some(node) = warm {
                return Ok(RouteDecision {
                    target: node.name.clone(),
                    reason: format!("resource '{resource}' is warm on {}", node.name),
                    estimated_wait_ms: node.load_factor() * 1000.0,
                    fallback: None,
                });
            }
        }

        // Lowest load among nodes with room for the request.
        let mut accepting: Vec<&GpuNode> = candidates
            .iter()
            .copied()
            .filter(|n| n.can_accept(capacity_needed_mb))
            .collect();
        accepting.sort_by(|a, b| a.load_factor().total_cmp(&b.load_factor()));

        if let Some(best) = accepting.first() {
            return Ok(RouteDecision {
                target: best.name.clone(),
                reason: format!(
                    "lowest load ({:.0}%) with free capacity",
                    best.load_factor() * 100.0
                ),
                estimated_wait_ms: best.load_factor() * 500.0,
                fallback: accepting.get(1).map(|n| n.name.clone()),
            });
        }

        // Nothing fits: queue on the globally least-loaded candidate. The
        // inflated wait reflects queuing rather than direct execution.
        let best = candidates
            .iter()
            .min_by(|a, b| a.load_factor().total_cmp(&b.load_factor()))
            .ok_or_else(|| GovernorError::NoNodeAvailable {
                intent: intent.tag().to_string(),
            })?;
        Ok(RouteDecision {
            target: best.name.clone(),
            reason: format!("all nodes full, queuing on {}", best.name),
            estimated_wait_ms: (best.load_factor() + 0.5) * 2000.0,
            fallback: None,
        })
    }

    pub fn get(&self, name: &str) -> Option<&GpuNode> {
        self.nodes.get(name)
    }

    /// All node names and capacity limits, for wiring up per-node caches.
    pub fn node_capacities(&self) -> Vec<(String, u64)> {
        self.nodes
            .values()
            .map(|n| (n.name.clone(), n.capacity_mb))
            .collect()
    }

    /// Cluster-wide status export.
    pub fn cluster_status(&self) -> ClusterStatus {
        let total: u64 = self.nodes.values().map(|n| n.capacity_mb).sum();
        let used: u64 = self.nodes.values().map(|n| n.capacity_used_mb).sum();
        ClusterStatus {
            total_capacity_mb: total,
            used_capacity_mb: used,
            utilization_pct: if total > 0 {
                (used as f64 / total as f64 * 1000.0).round() / 10.0
            } else {
                0.0
            },
            nodes_online: self
                .nodes
                .values()
                .filter(|n| n.status != NodeStatus::Offline)
                .count(),
            nodes: self
                .nodes
                .iter()
                .map(|(name, n)| {
                    (
                        name.clone(),
                        NodeSnapshot {
                            address: n.address.clone(),
                            status: n.status,
                            load_factor: n.load_factor(),
                            capacity_used_mb: n.capacity_used_mb,
                            capacity_mb: n.capacity_mb,
                            active_tasks: n.active_tasks,
                            warm_resources: n.warm_resources.iter().cloned().collect(),
                            tasks_completed: n.tasks_completed,
                            avg_latency_ms: n.avg_latency_ms,
                        },
                    )
                })
                .collect(),
        }
    }
}
