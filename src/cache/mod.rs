//! Layer residency management.
//!
//! This module contains the per-node layer cache:
//! - [`layer`]: ModelLayer, LayerCategory, residency state machine
//! - [`residency`]: Intent-driven residency planning, the allocator with
//!   global-LRU eviction, and best-effort prefetch

pub mod layer;
pub mod residency;
