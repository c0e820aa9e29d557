//! gpu-governor: Intent-based GPU resource governance.
//!
//! Admission control for shared GPU capacity. Every request declares what the
//! capacity is *for*, and flows through five subsystems:
//!   firewall (policy) → budget ledger (quotas) → node router (placement)
//!   → layer cache (residency) → provenance chain (audit)
//!
//! Exposes a small HTTP API for requests, node telemetry, and monitoring.

pub mod budget;
pub mod cache;
pub mod config;
pub mod error;
pub mod firewall;
pub mod governor;
pub mod provenance;
pub mod router;
pub mod server;
