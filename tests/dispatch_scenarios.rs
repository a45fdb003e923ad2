//! Cross-module scenarios from the dispatch pipeline's testable
//! properties: solver output feeding the confidence gate exactly as the
//! tick loop would use it.

use std::collections::HashMap;
use std::time::Duration;

use microgrid_dispatch::confidence::{ConfidenceGate, ConfidenceWeights};
use microgrid_dispatch::solver::{solve, ConsumerDemand, SolveRequest, SourceSpec};

fn two_sources() -> Vec<SourceSpec> {
    vec![
        SourceSpec {
            source_id: 1,
            max_capacity: 5.0,
            cost_per_amp: 0.10,
            ramp_limit: 10.0,
            green: true,
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
fn feasible_steady_state_confidence_is_high() {
    let sources = two_sources();
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
        sources: &sources,
        prev_totals: &prev,
        solve_budget: Duration::from_millis(25),
    };
    let outcome = solve(&req).unwrap();

    assert!(outcome.unmet.is_empty());
    assert!((outcome.per_source_used[&1] - 5.0).abs() < 1e-9);
    assert!((outcome.per_source_used[&2] - 2.5).abs() < 1e-9);
    assert!(!outcome.used_fallback);

    let total_demand: f64 = consumers.iter().map(|c| c.forecast_demand).sum();
    let mut gate = ConfidenceGate::new(ConfidenceWeights::default(), 0.5);
    let result = gate.evaluate(&outcome, &sources, total_demand, 0.0);
    assert!(!result.escalating, "score = {}", result.score);
}

#[test]
fn ramp_limited_change_spills_to_second_source() {
    let sources = vec![
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
        sources: &sources,
        prev_totals: &prev,
        solve_budget: Duration::from_millis(25),
    };
    let outcome = solve(&req).unwrap();

    assert!((outcome.per_source_used[&1] - 4.5).abs() < 1e-9);
    assert!((outcome.per_source_used[&2] - 0.5).abs() < 1e-9);
    assert!(outcome.unmet.is_empty());
}

#[test]
fn infeasible_demand_escalates_with_low_confidence() {
    let sources = two_sources();
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
        sources: &sources,
        prev_totals: &prev,
        solve_budget: Duration::from_millis(25),
    };
    let outcome = solve(&req).unwrap();
    assert!(outcome.total_unmet() > 0.0);

    let total_demand: f64 = consumers.iter().map(|c| c.forecast_demand).sum();
    let mut gate = ConfidenceGate::new(ConfidenceWeights::default(), 0.5);
    let result = gate.evaluate(&outcome, &sources, total_demand, 0.0);

    assert!(result.score < 0.5, "score = {}", result.score);
    assert!(result.escalating);
}

#[test]
fn demand_balance_invariant_holds_across_scenarios() {
    let sources = two_sources();
    for demand in [1.0, 4.9, 5.0, 9.9, 12.0] {
        let consumers = vec![ConsumerDemand {
            node_id: 1,
            forecast_demand: demand,
        }];
        let prev = HashMap::new();
        let req = SolveRequest {
            consumers: &consumers,
            sources: &sources,
            prev_totals: &prev,
            solve_budget: Duration::from_millis(25),
        };
        let outcome = solve(&req).unwrap();
        let allocated: f64 = outcome.allocations.iter().map(|a| a.amps).sum();
        assert!(
            (allocated + outcome.total_unmet() - demand).abs() < 1e-6,
            "demand {demand}: allocated {allocated} unmet {}",
            outcome.total_unmet()
        );
    }
}
