//! Multi-node routing with warm-resource affinity.
//!
//! - [`node`]: GpuNode state, load-derived status, heartbeat updates
//! - [`balancer`]: The routing algorithm and cluster status export

pub mod balancer;
pub mod node;
