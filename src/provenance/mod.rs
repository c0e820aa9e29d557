//! Tamper-evident provenance records.
//!
//! - [`token`]: Signed tokens recording what was granted and why
//! - [`chain`]: The bounded, append-only chain and its verification walk

pub mod chain;
pub mod token;
