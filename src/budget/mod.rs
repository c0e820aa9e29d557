//! Per-actor capacity budgeting.
//!
//! - [`ledger`]: ActorBudget accounting, the cost model, quote/charge/reset,
//!   and queue-priority wait estimation

pub mod ledger;
