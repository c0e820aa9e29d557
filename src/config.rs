//! Runtime configuration for gpu-governor.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All policy knobs (firewall ceilings, budget quotas, routing windows, cache
//! bandwidth, chain bounds) live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::firewall::predicate::Predicate;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "gpu-governor", about = "Intent-based GPU resource governance server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Firewall policy tuning.
    #[serde(default)]
    pub firewall: FirewallConfig,

    /// Budget ledger quotas and cost constants.
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Node routing settings.
    #[serde(default)]
    pub router: RouterConfig,

    /// Layer cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Provenance chain settings.
    #[serde(default)]
    pub chain: ChainConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Maximum concurrent admission requests.
    pub max_concurrent_requests: usize,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            max_concurrent_requests: 16,
            request_timeout_secs: 30,
        }
    }
}

/// Firewall policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Actors with a trust score below this get narrowed restrictions.
    pub trust_threshold: f64,

    /// Global maximum estimated duration in seconds. Longer requests are
    /// clamped, not rejected.
    pub max_duration_secs: f64,

    /// Maximum requests per actor in the trailing 60 seconds.
    pub rate_limit_per_minute: usize,

    /// How long a disallowed-pattern offender stays blocked, in hours.
    pub block_cooldown_hours: u64,

    /// Capacity cap (MB) applied to low-trust actors.
    pub low_trust_capacity_mb: u64,

    /// Duration cap (seconds) applied to low-trust actors.
    pub low_trust_duration_secs: f64,

    /// Operator-defined predicates checked after the built-in rules.
    #[serde(default)]
    pub predicates: Vec<Predicate>,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            trust_threshold: 0.5,
            max_duration_secs: 3600.0,
            rate_limit_per_minute: 10,
            block_cooldown_hours: 24,
            low_trust_capacity_mb: 2000,
            low_trust_duration_secs: 300.0,
            predicates: Vec::new(),
        }
    }
}

/// Budget ledger quotas and cost-model constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Default daily capacity-seconds quota for auto-registered actors.
    pub default_capacity_seconds: f64,

    /// Default daily compute-unit quota for auto-registered actors.
    pub default_compute_units: f64,

    /// Default priority distance for auto-registered actors (lower = served first).
    pub default_distance: u32,

    /// Mass per capacity MB in the energy formula.
    pub mass_per_mb: f64,

    /// Ceiling on compute intensity in the energy formula.
    pub max_intensity: f64,

    /// Divisor converting energy x duration into compute units.
    pub compute_unit_divisor: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_capacity_seconds: 3_600_000.0,
            default_compute_units: 10_000.0,
            default_distance: 5,
            mass_per_mb: 0.001,
            max_intensity: 100.0,
            compute_unit_divisor: 1000.0,
        }
    }
}

/// A node declared in configuration, registered at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDecl {
    /// Node name (e.g. "oomllama").
    pub name: String,

    /// Network address (host:port).
    pub address: String,

    /// Total capacity in MB.
    pub capacity_mb: u64,

    /// Intent tags this node can serve. "heavy" matches any intent.
    pub capabilities: Vec<String>,

    /// Resources assumed warm at startup.
    #[serde(default)]
    pub warm_resources: Vec<String>,
}

/// Node routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Nodes registered at startup.
    pub nodes: Vec<NodeDecl>,

    /// A node with no heartbeat within this window is excluded from routing.
    pub heartbeat_timeout_secs: u64,

    /// Warm nodes above this load factor lose their warm preference.
    pub warm_overload_threshold: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            heartbeat_timeout_secs: 30,
            warm_overload_threshold: 0.90,
        }
    }
}

/// Layer cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Modeled transfer bandwidth in MB/s, used for transfer-time estimates.
    pub transfer_bandwidth_mb_per_sec: f64,

    /// Number of layers to prefetch ahead of the current one.
    pub prefetch_ahead: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            transfer_bandwidth_mb_per_sec: 2000.0,
            prefetch_ahead: 2,
        }
    }
}

/// Provenance chain settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Maximum tokens kept; oldest entries are trimmed past this.
    pub max_tokens: usize,

    /// HMAC signing key. A deployment must override the default.
    pub signing_key: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            signing_key: "gpu-governor-dev-key".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.firewall.rate_limit_per_minute, 10);
        assert_eq!(cfg.budget.default_distance, 5);
        assert_eq!(cfg.chain.max_tokens, 1000);
    }

    #[test]
    fn test_config_roundtrip() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cache.prefetch_ahead, cfg.cache.prefetch_ahead);
        assert_eq!(back.firewall.max_duration_secs, cfg.firewall.max_duration_secs);
    }
}
