//! GPU node state.
//!
//! Node status is never set directly: it is recomputed from the load factor
//! on every heartbeat. Liveness is judged by heartbeat age at routing time.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::NodeDecl;
use crate::firewall::request::Intent;

/// Derived availability of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Load at or below 50%.
    Idle,
    /// Load between 50% and 90%.
    Busy,
    /// Load above 90%; no new tasks.
    Overloaded,
    /// Not reachable. Initial state until the first heartbeat.
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Idle => "idle",
            NodeStatus::Busy => "busy",
            NodeStatus::Overloaded => "overloaded",
            NodeStatus::Offline => "offline",
        };
        write!(f, "{s}")
    }
}

/// A declared capability. `Heavy` is the generic wildcard matching any intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Intent(Intent),
    Heavy,
}

impl Capability {
    pub fn from_tag(tag: &str) -> Self {
        if tag.eq_ignore_ascii_case("heavy") {
            Capability::Heavy
        } else {
            Capability::Intent(Intent::from_tag(tag))
        }
    }
}

/// Telemetry payload pushed by a node's reporting agent.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Heartbeat {
    /// Capacity currently in use, MB.
    pub capacity_used_mb: u64,

    /// Number of active tasks.
    pub active_tasks: u32,

    /// Resources currently warm on the node, if reported.
    #[serde(default)]
    pub warm_resources: Option<Vec<String>>,

    /// Latest observed task latency in ms, folded into the rolling average.
    #[serde(default)]
    pub latency_ms: Option<f64>,
}

/// One GPU node in the pool. Mutated by heartbeat updates only.
#[derive(Debug, Clone)]
pub struct GpuNode {
    pub name: String,
    pub address: String,

    /// Total capacity in MB.
    pub capacity_mb: u64,

    /// Capacity currently used, MB.
    pub capacity_used_mb: u64,

    /// Active task count.
    pub active_tasks: u32,

    /// Derived from load on each heartbeat.
    pub status: NodeStatus,

    /// What this node can serve.
    pub capabilities: HashSet<Capability>,

    /// Resources currently resident on the node.
    pub warm_resources: HashSet<String>,

    /// Time of the last heartbeat, if any.
    pub last_heartbeat: Option<Instant>,

    /// Cumulative completed task count.
    pub tasks_completed: u64,

    /// Rolling average task latency, ms.
    pub avg_latency_ms: f64,
}

impl GpuNode {
    pub fn from_decl(decl: &NodeDecl) -> Self {
        Self {
            name: decl.name.clone(),
            address: decl.address.clone(),
            capacity_mb: decl.capacity_mb,
            capacity_used_mb: 0,
            active_tasks: 0,
            status: NodeStatus::Offline,
            capabilities: decl
                .capabilities
                .iter()
                .map(|t| Capability::from_tag(t))
                .collect(),
            warm_resources: decl.warm_resources.iter().cloned().collect(),
            last_heartbeat: None,
            tasks_completed: 0,
            avg_latency_ms: 0.0,
        }
    }

    /// Used capacity as a fraction of the limit. A zero-capacity node is
    /// treated as fully loaded.
    pub fn load_factor(&self) -> f64 {
        if self.capacity_mb == 0 {
            return 1.0;
        }
        self.capacity_used_mb as f64 / self.capacity_mb as f64
    }

    /// Whether the node can serve the given intent.
    pub fn can_serve(&self, intent: Intent) -> bool {
        self.capabilities.contains(&Capability::Heavy)
            || self.capabilities.contains(&Capability::Intent(intent))
    }

    /// Whether the node has free capacity for the request and is accepting.
    pub fn can_accept(&self, capacity_needed_mb: u64) -> bool {
        if matches!(self.status, NodeStatus::Overloaded | NodeStatus::Offline) {
            return false;
        }
        self.capacity_mb.saturating_sub(self.capacity_used_mb) >= capacity_needed_mb
    }

    /// Apply a heartbeat and recompute status from the new load.
    pub fn apply_heartbeat(&mut self, hb: &Heartbeat, now: Instant) {
        self.capacity_used_mb = hb.capacity_used_mb;
        self.active_tasks = hb.active_tasks;
        self.last_heartbeat = Some(now);

        if let Some(warm) = &hb.warm_resources {
            self.warm_resources = warm.iter().cloned().collect();
        }
        if let Some(latency) = hb.latency_ms {
            self.tasks_completed += 1;
            // Rolling average over completed tasks.
            let n = self.tasks_completed as f64;
            self.avg_latency_ms += (latency - self.avg_latency_ms) / n;
        }

        let load = self.load_factor();
        self.status = if load > 0.9 {
            NodeStatus::Overloaded
        } else if load > 0.5 {
            NodeStatus::Busy
        } else {
            NodeStatus::Idle
        };
    }

    /// Whether the last heartbeat is within the liveness window.
    pub fn is_live(&self, timeout: Duration, now: Instant) -> bool {
        match self.last_heartbeat {
            Some(ts) => now.duration_since(ts) <= timeout,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(capacity: u64) -> GpuNode {
        GpuNode::from_decl(&NodeDecl {
            name: "test".to_string(),
            address: "localhost:11434".to_string(),
            capacity_mb: capacity,
            capabilities: vec!["inference".to_string()],
            warm_resources: vec![],
        })
    }

    #[test]
    fn test_status_derived_from_load() {
        let mut n = node(10000);
        let now = Instant::now();

        n.apply_heartbeat(
            &Heartbeat {
                capacity_used_mb: 4000,
                active_tasks: 1,
                warm_resources: None,
                latency_ms: None,
            },
            now,
        );
        assert_eq!(n.status, NodeStatus::Idle);

        n.apply_heartbeat(
            &Heartbeat {
                capacity_used_mb: 7000,
                active_tasks: 2,
                warm_resources: None,
                latency_ms: None,
            },
            now,
        );
        assert_eq!(n.status, NodeStatus::Busy);

        n.apply_heartbeat(
            &Heartbeat {
                capacity_used_mb: 9500,
                active_tasks: 3,
                warm_resources: None,
                latency_ms: None,
            },
            now,
        );
        assert_eq!(n.status, NodeStatus::Overloaded);
    }

    #[test]
    fn test_heavy_capability_matches_any_intent() {
        let mut n = node(10000);
        n.capabilities.insert(Capability::Heavy);
        assert!(n.can_serve(Intent::Transcription));
        assert!(n.can_serve(Intent::Unknown));
    }

    #[test]
    fn test_can_accept_respects_free_capacity() {
        let mut n = node(10000);
        n.status = NodeStatus::Busy;
        n.capacity_used_mb = 8000;
        assert!(n.can_accept(2000));
        assert!(!n.can_accept(2001));

        n.status = NodeStatus::Overloaded;
        assert!(!n.can_accept(100));
    }

    #[test]
    fn test_liveness_window() {
        let mut n = node(10000);
        let now = Instant::now();
        assert!(!n.is_live(Duration::from_secs(30), now));

        n.apply_heartbeat(
            &Heartbeat {
                capacity_used_mb: 0,
                active_tasks: 0,
                warm_resources: None,
                latency_ms: None,
            },
            now,
        );
        assert!(n.is_live(Duration::from_secs(30), now));
    }

    #[test]
    fn test_rolling_latency() {
        let mut n = node(10000);
        let now = Instant::now();
        for latency in [100.0, 200.0, 300.0] {
            n.apply_heartbeat(
                &Heartbeat {
                    capacity_used_mb: 0,
                    active_tasks: 0,
                    warm_resources: None,
                    latency_ms: Some(latency),
                },
                now,
            );
        }
        assert!((n.avg_latency_ms - 200.0).abs() < 1e-9);
    }
}
