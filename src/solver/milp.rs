//! Optional MILP/LP backend (feature `milp`), a real solve ahead of the
//! deterministic greedy fallback.
//!
//! Formulated as the LP relaxation of the assignment problem: minimize
//! total cost plus a large penalty on unmet demand, subject to per-source
//! capacity and the ramp window computed from `prev_totals`. Amps are a
//! continuous quantity here, so relaxing the integrality is exact, not an
//! approximation.

use std::collections::HashMap;
use std::time::Instant;

use good_lp::{
    constraint, default_solver, variable, Expression, ProblemVariables, Solution, SolverModel,
};

use super::{AllocationEntry, SolveOutcome, SolveRequest, SolutionStatus, unmet_penalty};

#[derive(Debug)]
pub struct MilpError(pub String);

impl std::fmt::Display for MilpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "milp solve failed: {}", self.0)
    }
}

impl std::error::Error for MilpError {}

pub fn solve_milp(req: &SolveRequest<'_>, started: Instant) -> Result<SolveOutcome, MilpError> {
    let penalty = unmet_penalty(req.sources);

    let mut vars = ProblemVariables::new();

    // x[s][c]: amps delivered from source s to consumer c.
    let mut x = HashMap::new();
    for s in req.sources {
        for c in req.consumers {
            let v = vars.add(variable().min(0.0));
            x.insert((s.source_id, c.node_id), v);
        }
    }
    // slack[c]: unmet demand at consumer c.
    let mut slack = HashMap::new();
    for c in req.consumers {
        let v = vars.add(variable().min(0.0));
        slack.insert(c.node_id, v);
    }

    let mut objective = Expression::from(0.0);
    for s in req.sources {
        for c in req.consumers {
            objective += x[&(s.source_id, c.node_id)] * s.cost_per_amp;
        }
    }
    for c in req.consumers {
        objective += slack[&c.node_id] * penalty;
    }

    let mut model = vars.minimise(objective.clone()).using(default_solver);

    // Demand satisfaction: sum over sources + slack == demand.
    for c in req.consumers {
        let mut lhs = Expression::from(0.0);
        for s in req.sources {
            lhs += x[&(s.source_id, c.node_id)];
        }
        lhs += slack[&c.node_id];
        model = model.with(constraint!(lhs == c.forecast_demand));
    }

    // Capacity + ramp window per source.
    for s in req.sources {
        let prev = req.prev_totals.get(&s.source_id).copied().unwrap_or(0.0);
        let lo = (prev - s.ramp_limit).max(0.0);
        let hi = (prev + s.ramp_limit).min(s.max_capacity).max(lo);

        let mut total = Expression::from(0.0);
        for c in req.consumers {
            total += x[&(s.source_id, c.node_id)];
        }
        model = model.with(constraint!(total.clone() <= hi));
        model = model.with(constraint!(total >= lo));
    }

    if started.elapsed() > req.solve_budget {
        return Err(MilpError("solve budget exceeded before solving".into()));
    }

    let solution = model
        .solve()
        .map_err(|e| MilpError(format!("{e:?}")))?;

    let mut allocations = Vec::new();
    let mut per_source_used: HashMap<u8, f64> = req
        .sources
        .iter()
        .map(|s| (s.source_id, 0.0))
        .collect();
    for s in req.sources {
        for c in req.consumers {
            let amps = solution.value(x[&(s.source_id, c.node_id)]);
            if amps > 1e-9 {
                allocations.push(AllocationEntry {
                    source_id: s.source_id,
                    node_id: c.node_id,
                    amps,
                });
                *per_source_used.get_mut(&s.source_id).unwrap() += amps;
            }
        }
    }

    let mut unmet = HashMap::new();
    for c in req.consumers {
        let u = solution.value(slack[&c.node_id]);
        if u > 1e-9 {
            unmet.insert(c.node_id, u);
        }
    }

    Ok(SolveOutcome {
        allocations,
        per_source_used,
        unmet,
        used_fallback: false,
        wall_time: started.elapsed(),
        status: SolutionStatus::Optimal,
    })
}
