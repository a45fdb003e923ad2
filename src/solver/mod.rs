//! Dispatch Solver: cost-minimizing assignment of supplies to nodes under
//! capacity and ramp constraints.
//!
//! The solver is modeled as a pure function `solve(request) -> SolveOutcome`
//! (Design Note 9). The default, always-available path is a deterministic
//! greedy algorithm (`greedy`) — this is also the `BudgetExceeded`
//! fallback, so in the default build the "solver" and the "fallback" are
//! the same deterministic code, which is exactly what the substitution
//! tests rely on. An optional
//! `milp` feature links a real MILP backend for production use; when it is
//! enabled, `solve` tries it first and only falls back to the greedy path
//! on infeasibility or budget overrun.

mod greedy;
#[cfg(feature = "milp")]
mod milp;

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

pub use greedy::solve_greedy;

/// Immutable, startup-configured description of one supply source.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct SourceSpec {
    pub source_id: u8,
    pub max_capacity: f64,
    pub cost_per_amp: f64,
    pub ramp_limit: f64,
    pub green: bool,
}

/// One consumer's single-step forecast demand, as fed to the solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumerDemand {
    pub node_id: u8,
    pub forecast_demand: f64,
}

/// One `(source, node) -> amps` allocation.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AllocationEntry {
    pub source_id: u8,
    pub node_id: u8,
    pub amps: f64,
}

/// Outcome status, named the way a solver-IPC boundary would name it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolutionStatus {
    Optimal,
    Infeasible,
    Timeout,
}

/// Everything the Confidence Gate and Tick Loop need from one solve.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub allocations: Vec<AllocationEntry>,
    /// Per-source total amps used this tick, including any ramp-floor
    /// must-run surplus that could not be attached to a consumer.
    pub per_source_used: HashMap<u8, f64>,
    /// Per-node unmet demand (amps), the slack variable in the assignment
    /// formulation.
    pub unmet: HashMap<u8, f64>,
    pub used_fallback: bool,
    pub wall_time: Duration,
    pub status: SolutionStatus,
}

impl SolveOutcome {
    pub fn total_unmet(&self) -> f64 {
        self.unmet.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SolverError {
    InvalidInput(String),
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid solver input: {msg}"),
        }
    }
}

impl std::error::Error for SolverError {}

/// One solve request.
pub struct SolveRequest<'a> {
    pub consumers: &'a [ConsumerDemand],
    pub sources: &'a [SourceSpec],
    pub prev_totals: &'a HashMap<u8, f64>,
    pub solve_budget: Duration,
}

/// Penalty weight on unmet demand: large enough to dominate any feasible
/// cost, per spec default (10x the most expensive source).
pub fn unmet_penalty(sources: &[SourceSpec]) -> f64 {
    let max_cost = sources
        .iter()
        .map(|s| s.cost_per_amp)
        .fold(0.0_f64, f64::max);
    10.0 * max_cost.max(1.0)
}

/// Solve for this tick's allocation.
///
/// With the `milp` feature disabled (the default, and the path tests run
/// against per Design Note 9) this always takes the deterministic greedy
/// path and `used_fallback` is `false` — there is nothing to fall back
/// from. With `milp` enabled, a real MILP solve is attempted first and
/// the greedy path is used as the fallback on timeout or infeasibility.
pub fn solve(req: &SolveRequest<'_>) -> Result<SolveOutcome, SolverError> {
    validate(req)?;

    #[cfg(feature = "milp")]
    {
        let started = Instant::now();
        match milp::solve_milp(req, started) {
            Ok(outcome) => return Ok(outcome),
            Err(_) => {
                let mut outcome = solve_greedy(req);
                outcome.used_fallback = true;
                return Ok(outcome);
            }
        }
    }

    #[cfg(not(feature = "milp"))]
    {
        Ok(solve_greedy(req))
    }
}

/// Test/ops hook: force the solver to behave as though the primary path
/// exceeded `SOLVE_BUDGET_MS`, exercising the budget-exceeded fallback
/// path. Always produces the same allocation as a plain `solve_greedy`
/// call — the fallback is deterministic and matches the primary path.
pub fn solve_forcing_fallback(req: &SolveRequest<'_>) -> Result<SolveOutcome, SolverError> {
    validate(req)?;
    let mut outcome = solve_greedy(req);
    outcome.used_fallback = true;
    outcome.status = SolutionStatus::Timeout;
    Ok(outcome)
}

fn validate(req: &SolveRequest<'_>) -> Result<(), SolverError> {
    for s in req.sources {
        if s.max_capacity < 0.0 {
            return Err(SolverError::InvalidInput(format!(
                "source {} has negative max_capacity",
                s.source_id
            )));
        }
        if s.ramp_limit < 0.0 {
            return Err(SolverError::InvalidInput(format!(
                "source {} has negative ramp_limit",
                s.source_id
            )));
        }
    }
    for c in req.consumers {
        if c.forecast_demand < 0.0 {
            return Err(SolverError::InvalidInput(format!(
                "node {} has negative forecast demand",
                c.node_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources() -> Vec<SourceSpec> {
        vec![
            SourceSpec {
                source_id: 1,
                max_capacity: 5.0,
                cost_per_amp: 0.10,
                ramp_limit: 10.0,
                green: false,
            },
            SourceSpec {
                source_id: 2,
                max_capacity: 5.0,
                cost_per_amp: 0.20,
                ramp_limit: 10.0,
                green: true,
            },
        ]
    }

    #[test]
    fn rejects_negative_capacity() {
        let bad = vec![SourceSpec {
            source_id: 1,
            max_capacity: -1.0,
            cost_per_amp: 0.1,
            ramp_limit: 1.0,
            green: false,
        }];
        let req = SolveRequest {
            consumers: &[],
            sources: &bad,
            prev_totals: &HashMap::new(),
            solve_budget: Duration::from_millis(25),
        };
        assert!(matches!(solve(&req), Err(SolverError::InvalidInput(_))));
    }

    #[test]
    fn forcing_fallback_matches_plain_greedy() {
        let srcs = sources();
        let consumers = vec![
            ConsumerDemand {
                node_id: 1,
                forecast_demand: 2.5,
            },
            ConsumerDemand {
                node_id: 2,
                forecast_demand: 1.8,
            },
        ];
        let prev = HashMap::new();
        let req = SolveRequest {
            consumers: &consumers,
            sources: &srcs,
            prev_totals: &prev,
            solve_budget: Duration::from_millis(25),
        };

        let direct = solve_greedy(&req);
        let forced = solve_forcing_fallback(&req).unwrap();

        assert!(forced.used_fallback);
        assert_eq!(forced.per_source_used, direct.per_source_used);
        assert_eq!(forced.unmet, direct.unmet);
    }
}
