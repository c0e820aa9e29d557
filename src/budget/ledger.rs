//! Budget ledger: admission control and consumption tracking per actor.
//!
//! The cost model is documented so it can be re-derived and tested:
//!
//! ```text
//! capacity_seconds = capacity_mb × duration_secs
//! energy           = (capacity_mb × mass_per_mb) × min(intensity × 10, max_intensity)²
//! compute_units    = energy × duration_secs / compute_unit_divisor
//! wait_estimate    = sqrt(distance³) / weight
//! ```
//!
//! A request is affordable only if both remaining capacity-seconds and
//! remaining compute-units cover the quoted cost. The wait formula is convex
//! in distance so low-priority actors see disproportionately larger waits;
//! its exact exponents are policy, not an invariant — only monotonicity
//! (lower distance ⇒ wait ≤ higher distance, equal weight) is relied on.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::BudgetConfig;
use crate::firewall::request::now_unix;

/// Dashboard color band derived from usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetState {
    /// Below 70% of quota.
    Green,
    /// 70-90%.
    Yellow,
    /// 90-100%.
    Orange,
    /// Quota exceeded.
    Red,
}

/// Budget for one actor. Mutated only by `charge` and the periodic reset.
#[derive(Debug, Clone, Serialize)]
pub struct ActorBudget {
    pub actor: String,

    /// Daily capacity-seconds quota (MB x seconds).
    pub daily_capacity_seconds: f64,

    /// Daily compute-unit quota.
    pub daily_compute_units: f64,

    /// Cumulative capacity-seconds used since the last reset.
    pub used_capacity_seconds: f64,

    /// Cumulative compute-units used since the last reset.
    pub used_compute_units: f64,

    /// Priority distance: lower is served first.
    pub distance: u32,

    /// Relative weight; heavier actors wait less.
    pub weight: f64,

    /// Unix timestamp of the last period reset.
    pub last_reset: f64,

    /// Requests charged since the last reset.
    pub request_count: u64,
}

impl ActorBudget {
    pub fn remaining_capacity_seconds(&self) -> f64 {
        (self.daily_capacity_seconds - self.used_capacity_seconds).max(0.0)
    }

    pub fn remaining_compute_units(&self) -> f64 {
        (self.daily_compute_units - self.used_compute_units).max(0.0)
    }

    /// Usage as a percentage, taking the more constrained dimension.
    pub fn usage_percentage(&self) -> f64 {
        let cap_pct = self.used_capacity_seconds / self.daily_capacity_seconds * 100.0;
        let cu_pct = self.used_compute_units / self.daily_compute_units * 100.0;
        cap_pct.max(cu_pct)
    }

    pub fn state(&self) -> BudgetState {
        let pct = self.usage_percentage();
        if pct >= 100.0 {
            BudgetState::Red
        } else if pct >= 90.0 {
            BudgetState::Orange
        } else if pct >= 70.0 {
            BudgetState::Yellow
        } else {
            BudgetState::Green
        }
    }
}

/// Quoted cost of one operation. Pure function of request + budget state.
#[derive(Debug, Clone, Serialize)]
pub struct ComputeCost {
    pub capacity_seconds: f64,
    pub compute_units: f64,
    pub energy: f64,
    pub wait_estimate_secs: f64,
    pub allowed: bool,
    pub reason: String,
}

/// Aggregate totals for one budget period.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeriodStats {
    pub total_capacity_seconds: f64,
    pub total_compute_units: f64,
    pub total_requests: u64,
    pub rejected_requests: u64,
}

/// Per-actor dashboard row.
#[derive(Debug, Clone, Serialize)]
pub struct ActorDashboard {
    pub state: BudgetState,
    pub usage_pct: f64,
    pub remaining_capacity_seconds: f64,
    pub remaining_compute_units: f64,
    pub queue_position: usize,
    pub wait_estimate_secs: f64,
    pub requests_this_period: u64,
}

/// Ledger-wide dashboard export.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetDashboard {
    pub period: PeriodStats,
    pub actors: HashMap<String, ActorDashboard>,
}

/// The budget ledger. Callers must serialize quote-then-charge themselves;
/// the governor holds one lock across the whole admission path.
pub struct BudgetLedger {
    config: BudgetConfig,
    budgets: HashMap<String, ActorBudget>,
    period: PeriodStats,
}

impl BudgetLedger {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            budgets: HashMap::new(),
            period: PeriodStats::default(),
        }
    }

    /// Register an actor with explicit quotas and priority.
    pub fn register_actor(
        &mut self,
        actor: &str,
        daily_capacity_seconds: f64,
        daily_compute_units: f64,
        distance: u32,
        weight: f64,
    ) -> &ActorBudget {
        let budget = ActorBudget {
            actor: actor.to_string(),
            daily_capacity_seconds,
            daily_compute_units,
            used_capacity_seconds: 0.0,
            used_compute_units: 0.0,
            distance,
            weight,
            last_reset: now_unix(),
            request_count: 0,
        };
        match self.budgets.entry(actor.to_string()) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.insert(budget);
                e.into_mut()
            }
            std::collections::hash_map::Entry::Vacant(e) => e.insert(budget),
        }
    }

    /// Quote the cost of an operation against the actor's remaining budget.
    /// Unregistered actors are auto-registered with default quotas.
    pub fn quote(
        &mut self,
        actor: &str,
        capacity_mb: u64,
        duration_secs: f64,
        intensity: f64,
    ) -> ComputeCost {
        if !self.budgets.contains_key(actor) {
            debug!(actor, "Auto-registering actor with default quota");
            self.register_actor(
                actor,
                self.config.default_capacity_seconds,
                self.config.default_compute_units,
                self.config.default_distance,
                1.0,
            );
        }

        let capacity_seconds = capacity_mb as f64 * duration_secs;

        let mass = capacity_mb as f64 * self.config.mass_per_mb;
        let intensity_scaled = (intensity * 10.0).min(self.config.max_intensity);
        let energy = mass * intensity_scaled * intensity_scaled;
        let compute_units = energy * duration_secs / self.config.compute_unit_divisor;

        let budget = &self.budgets[actor];
        let wait_estimate_secs = wait_estimate(budget.distance, budget.weight);

        let remaining_cap = budget.remaining_capacity_seconds();
        if remaining_cap < capacity_seconds {
            self.period.rejected_requests += 1;
            return ComputeCost {
                capacity_seconds,
                compute_units,
                energy,
                wait_estimate_secs,
                allowed: false,
                reason: format!(
                    "capacity-seconds quota insufficient: need {capacity_seconds:.0}, \
                     remaining {remaining_cap:.0} (deficit {:.0})",
                    capacity_seconds - remaining_cap
                ),
            };
        }

        let remaining_cu = budget.remaining_compute_units();
        if remaining_cu < compute_units {
            self.period.rejected_requests += 1;
            return ComputeCost {
                capacity_seconds,
                compute_units,
                energy,
                wait_estimate_secs,
                allowed: false,
                reason: format!(
                    "compute-unit quota insufficient: need {compute_units:.2}, \
                     remaining {remaining_cu:.2} (deficit {:.2})",
                    compute_units - remaining_cu
                ),
            };
        }

        ComputeCost {
            capacity_seconds,
            compute_units,
            energy,
            wait_estimate_secs,
            allowed: true,
            reason: "budget ok".to_string(),
        }
    }

    /// Debit the actor's budget for an executed operation. Each call adds to
    /// cumulative usage; callers must call exactly once per execution.
    pub fn charge(&mut self, actor: &str, cost: &ComputeCost) -> bool {
        let Some(budget) = self.budgets.get_mut(actor) else {
            return false;
        };

        budget.used_capacity_seconds += cost.capacity_seconds;
        budget.used_compute_units += cost.compute_units;
        budget.request_count += 1;

        self.period.total_capacity_seconds += cost.capacity_seconds;
        self.period.total_compute_units += cost.compute_units;
        self.period.total_requests += 1;

        true
    }

    /// Reverse a charge whose operation never executed. Usage never goes
    /// below zero even if called spuriously.
    pub fn refund(&mut self, actor: &str, cost: &ComputeCost) -> bool {
        let Some(budget) = self.budgets.get_mut(actor) else {
            return false;
        };

        budget.used_capacity_seconds =
            (budget.used_capacity_seconds - cost.capacity_seconds).max(0.0);
        budget.used_compute_units = (budget.used_compute_units - cost.compute_units).max(0.0);
        budget.request_count = budget.request_count.saturating_sub(1);

        self.period.total_capacity_seconds =
            (self.period.total_capacity_seconds - cost.capacity_seconds).max(0.0);
        self.period.total_compute_units =
            (self.period.total_compute_units - cost.compute_units).max(0.0);
        self.period.total_requests = self.period.total_requests.saturating_sub(1);

        true
    }

    /// Queue position among all actors (1-based) and the wait estimate.
    pub fn queue_position(&self, actor: &str) -> (usize, f64) {
        let Some(budget) = self.budgets.get(actor) else {
            return (usize::MAX, f64::INFINITY);
        };

        let own_wait = wait_estimate(budget.distance, budget.weight);
        let ahead = self
            .budgets
            .values()
            .filter(|b| wait_estimate(b.distance, b.weight) < own_wait)
            .count();
        (ahead + 1, own_wait)
    }

    /// Zero all used counters and archive the prior period's totals.
    /// Atomicity with respect to quote/charge is the caller's lock.
    pub fn reset(&mut self) -> PeriodStats {
        let now = now_unix();
        for budget in self.budgets.values_mut() {
            budget.used_capacity_seconds = 0.0;
            budget.used_compute_units = 0.0;
            budget.request_count = 0;
            budget.last_reset = now;
        }
        let archived = std::mem::take(&mut self.period);
        info!(
            requests = archived.total_requests,
            capacity_seconds = archived.total_capacity_seconds,
            "Budget period reset"
        );
        archived
    }

    pub fn get(&self, actor: &str) -> Option<&ActorBudget> {
        self.budgets.get(actor)
    }

    /// Dashboard export across all actors.
    pub fn dashboard(&self) -> BudgetDashboard {
        let actors = self
            .budgets
            .iter()
            .map(|(name, b)| {
                let (pos, wait) = self.queue_position(name);
                (
                    name.clone(),
                    ActorDashboard {
                        state: b.state(),
                        usage_pct: (b.usage_percentage() * 10.0).round() / 10.0,
                        remaining_capacity_seconds: b.remaining_capacity_seconds().round(),
                        remaining_compute_units: b.remaining_compute_units().round(),
                        queue_position: pos,
                        wait_estimate_secs: (wait * 100.0).round() / 100.0,
                        requests_this_period: b.request_count,
                    },
                )
            })
            .collect();

        BudgetDashboard {
            period: self.period.clone(),
            actors,
        }
    }
}

/// Wait grows convexly with distance and shrinks with weight.
fn wait_estimate(distance: u32, weight: f64) -> f64 {
    let d = distance as f64;
    (d * d * d).sqrt() / weight.max(f64::EPSILON)
}
