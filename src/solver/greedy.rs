//! Deterministic greedy solver.
//!
//! Sort sources by `cost_per_amp` ascending (ties broken by ascending
//! `source_id`, green preferred as a final tie-break though `source_id` is
//! already unique so that key is rarely decisive), then fill each
//! consumer's demand in that order, respecting each source's capacity and
//! ramp window. This is both the default primary solve path and the
//! spec's own description of the `BudgetExceeded` fallback, so the two
//! are identical by construction.

use std::collections::HashMap;
use std::time::Instant;

use super::{AllocationEntry, ConsumerDemand, SolveOutcome, SolveRequest, SolutionStatus};

/// Per-source feasible window for this tick's total output, from the
/// ramp constraint clamped by capacity: `[max(0, prev-ramp), min(cap,
/// prev+ramp)]`.
fn ramp_window(max_capacity: f64, ramp_limit: f64, prev_total: f64) -> (f64, f64) {
    let lo = (prev_total - ramp_limit).max(0.0);
    let hi = (prev_total + ramp_limit).min(max_capacity).max(0.0);
    (lo, hi.max(lo.min(max_capacity)))
}

pub fn solve_greedy(req: &SolveRequest<'_>) -> SolveOutcome {
    let started = Instant::now();

    let mut order: Vec<&super::SourceSpec> = req.sources.iter().collect();
    order.sort_by(|a, b| {
        a.cost_per_amp
            .total_cmp(&b.cost_per_amp)
            .then(a.source_id.cmp(&b.source_id))
            .then(b.green.cmp(&a.green))
    });

    let mut ceiling: HashMap<u8, f64> = HashMap::new();
    let mut floor: HashMap<u8, f64> = HashMap::new();
    for s in &order {
        let prev = req.prev_totals.get(&s.source_id).copied().unwrap_or(0.0);
        let (lo, hi) = ramp_window(s.max_capacity, s.ramp_limit, prev);
        floor.insert(s.source_id, lo);
        ceiling.insert(s.source_id, hi);
    }

    let mut remaining_capacity: HashMap<u8, f64> = ceiling.clone();
    let mut used: HashMap<u8, f64> = order.iter().map(|s| (s.source_id, 0.0)).collect();
    let mut unmet: HashMap<u8, f64> = HashMap::new();
    let mut allocations = Vec::new();

    let mut consumers: Vec<&ConsumerDemand> = req.consumers.iter().collect();
    consumers.sort_by_key(|c| c.node_id);

    for c in &consumers {
        let mut need = c.forecast_demand;
        for s in &order {
            if need <= 1e-12 {
                break;
            }
            let cap = remaining_capacity.get_mut(&s.source_id).unwrap();
            if *cap <= 1e-12 {
                continue;
            }
            let take = need.min(*cap);
            if take > 0.0 {
                allocations.push(AllocationEntry {
                    source_id: s.source_id,
                    node_id: c.node_id,
                    amps: take,
                });
                *cap -= take;
                *used.get_mut(&s.source_id).unwrap() += take;
                need -= take;
            }
        }
        if need > 1e-9 {
            unmet.insert(c.node_id, need);
        }
    }

    // Ramp-down floor: a source cannot cut output faster than its ramp
    // limit allows even if demand no longer calls for it. Bump its
    // recorded usage up to the floor; this portion has no consumer to
    // attach to and is reported as must-run surplus in `per_source_used`
    // only (not in `allocations`/`dispatch_details`).
    for s in &order {
        let lo = *floor.get(&s.source_id).unwrap();
        let entry = used.get_mut(&s.source_id).unwrap();
        if *entry < lo {
            *entry = lo;
        }
    }

    // Unmet demand is satisfied via slack, not structural infeasibility,
    // so this is always a feasible solve.
    SolveOutcome {
        allocations,
        per_source_used: used,
        unmet,
        used_fallback: false,
        wall_time: started.elapsed(),
        status: SolutionStatus::Optimal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::SourceSpec;
    use std::time::Duration;

    fn two_sources() -> Vec<SourceSpec> {
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
                green: false,
            },
        ]
    }

    #[test]
    fn feasible_steady_state() {
        let srcs = two_sources();
        let consumers = vec![
            ConsumerDemand {
                node_id: 1,
                forecast_demand: 2.5,
            },
            ConsumerDemand {
                node_id: 2,
                forecast_demand: 1.8,
            },
            ConsumerDemand {
                node_id: 3,
                forecast_demand: 3.2,
            },
        ];
        let prev = HashMap::new();
        let req = SolveRequest {
            consumers: &consumers,
            sources: &srcs,
            prev_totals: &prev,
            solve_budget: Duration::from_millis(25),
        };
        let out = solve_greedy(&req);

        assert!(out.unmet.is_empty());
        assert!((out.per_source_used[&1] - 5.0).abs() < 1e-9);
        assert!((out.per_source_used[&2] - 2.5).abs() < 1e-9);
    }

    #[test]
    fn ramp_limited_change() {
        let srcs = vec![
            SourceSpec {
                source_id: 1,
                max_capacity: 10.0,
                cost_per_amp: 0.10,
                ramp_limit: 0.5,
                green: false,
            },
            SourceSpec {
                source_id: 2,
                max_capacity: 10.0,
                cost_per_amp: 0.20,
                ramp_limit: 10.0,
                green: false,
            },
        ];
        let consumers = vec![ConsumerDemand {
            node_id: 1,
            forecast_demand: 5.0,
        }];
        let mut prev = HashMap::new();
        prev.insert(1u8, 4.0);
        let req = SolveRequest {
            consumers: &consumers,
            sources: &srcs,
            prev_totals: &prev,
            solve_budget: Duration::from_millis(25),
        };
        let out = solve_greedy(&req);

        assert!((out.per_source_used[&1] - 4.5).abs() < 1e-9);
        assert!((out.per_source_used[&2] - 0.5).abs() < 1e-9);
        assert!(out.unmet.is_empty());
    }

    #[test]
    fn infeasible_slack_path() {
        let srcs = two_sources();
        let consumers = vec![
            ConsumerDemand {
                node_id: 1,
                forecast_demand: 6.0,
            },
            ConsumerDemand {
                node_id: 2,
                forecast_demand: 6.0,
            },
        ];
        let prev = HashMap::new();
        let req = SolveRequest {
            consumers: &consumers,
            sources: &srcs,
            prev_totals: &prev,
            solve_budget: Duration::from_millis(25),
        };
        let out = solve_greedy(&req);

        assert!(out.total_unmet() > 0.0);
        let total_capacity: f64 = srcs.iter().map(|s| s.max_capacity).sum();
        let total_used: f64 = out.per_source_used.values().sum();
        assert!((total_used - total_capacity).abs() < 1e-6);
    }

    #[test]
    fn capacity_and_demand_balance_holds() {
        let srcs = two_sources();
        let consumers = vec![
            ConsumerDemand {
                node_id: 1,
                forecast_demand: 1.0,
            },
            ConsumerDemand {
                node_id: 2,
                forecast_demand: 2.0,
            },
        ];
        let prev = HashMap::new();
        let req = SolveRequest {
            consumers: &consumers,
            sources: &srcs,
            prev_totals: &prev,
            solve_budget: Duration::from_millis(25),
        };
        let out = solve_greedy(&req);

        let total_allocated: f64 = out.allocations.iter().map(|a| a.amps).sum();
        let total_unmet = out.total_unmet();
        let total_demand: f64 = consumers.iter().map(|c| c.forecast_demand).sum();
        assert!((total_allocated + total_unmet - total_demand).abs() < 1e-6);
    }

    #[test]
    fn cheaper_source_filled_first() {
        let srcs = two_sources();
        let consumers = vec![ConsumerDemand {
            node_id: 1,
            forecast_demand: 3.0,
        }];
        let prev = HashMap::new();
        let req = SolveRequest {
            consumers: &consumers,
            sources: &srcs,
            prev_totals: &prev,
            solve_budget: Duration::from_millis(25),
        };
        let out = solve_greedy(&req);
        assert_eq!(out.allocations.len(), 1);
        assert_eq!(out.allocations[0].source_id, 1);
    }
}
