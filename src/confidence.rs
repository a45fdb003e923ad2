//! Confidence Gate: scores a solve outcome and decides whether the tick
//! should escalate to the Oracle Client.
//!
//! Stateful only in the "near capacity for two consecutive ticks" streak
//! counter; everything else is a pure function of the current tick's
//! inputs, owned and driven exclusively by the Tick Loop.

use std::collections::HashMap;

use crate::solver::{SolveOutcome, SourceSpec};

#[derive(Debug, Clone, Copy)]
pub struct ConfidenceWeights {
    pub feasibility: f64,
    pub variance: f64,
    pub headroom: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            feasibility: 0.5,
            variance: 0.3,
            headroom: 0.2,
        }
    }
}

/// Fraction of capacity at or above which a source counts as "near
/// capacity" for the two-consecutive-ticks escalation rule.
const NEAR_CAPACITY_FRACTION: f64 = 0.95;

#[derive(Debug, Clone, Copy)]
pub struct ConfidenceResult {
    pub score: f64,
    pub escalating: bool,
}

pub struct ConfidenceGate {
    weights: ConfidenceWeights,
    threshold: f64,
    near_capacity_streak: HashMap<u8, u32>,
}

impl ConfidenceGate {
    pub fn new(weights: ConfidenceWeights, threshold: f64) -> Self {
        Self {
            weights,
            threshold,
            near_capacity_streak: HashMap::new(),
        }
    }

    /// Evaluate this tick's outcome. `total_demand` and `mean_forecast_variance`
    /// come from the forecaster; `sources` is the immutable startup fleet.
    pub fn evaluate(
        &mut self,
        outcome: &SolveOutcome,
        sources: &[SourceSpec],
        total_demand: f64,
        mean_forecast_variance: f64,
    ) -> ConfidenceResult {
        let feasibility = if total_demand > 0.0 {
            (1.0 - outcome.total_unmet() / total_demand).clamp(0.0, 1.0)
        } else {
            1.0
        };

        // Squash unbounded variance into [0, 1) so the weighted sum stays
        // in range regardless of the node's demand scale.
        let normalized_variance = mean_forecast_variance / (mean_forecast_variance + 1.0);

        let headroom = sources
            .iter()
            .map(|s| {
                let used = outcome.per_source_used.get(&s.source_id).copied().unwrap_or(0.0);
                if s.max_capacity <= 0.0 {
                    0.0
                } else {
                    (1.0 - used / s.max_capacity).max(0.0)
                }
            })
            .fold(f64::INFINITY, f64::min)
            .min(1.0);
        let headroom = if headroom.is_finite() { headroom } else { 1.0 };

        let score = self.weights.feasibility * feasibility
            + self.weights.variance * (1.0 - normalized_variance)
            + self.weights.headroom * headroom;

        let near_capacity_two_ticks = self.update_near_capacity_streak(outcome, sources);

        let escalating =
            score < self.threshold || outcome.used_fallback || near_capacity_two_ticks;

        ConfidenceResult { score, escalating }
    }

    fn update_near_capacity_streak(&mut self, outcome: &SolveOutcome, sources: &[SourceSpec]) -> bool {
        let mut any_two_consecutive = false;
        for s in sources {
            let used = outcome.per_source_used.get(&s.source_id).copied().unwrap_or(0.0);
            let near = s.max_capacity > 0.0 && used / s.max_capacity >= NEAR_CAPACITY_FRACTION;
            let streak = self.near_capacity_streak.entry(s.source_id).or_insert(0);
            if near {
                *streak += 1;
            } else {
                *streak = 0;
            }
            if *streak >= 2 {
                any_two_consecutive = true;
            }
        }
        any_two_consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn sources() -> Vec<SourceSpec> {
        vec![SourceSpec {
            source_id: 1,
            max_capacity: 10.0,
            cost_per_amp: 0.1,
            ramp_limit: 5.0,
            green: false,
        }]
    }

    fn outcome(used: f64, unmet: f64) -> SolveOutcome {
        let mut per_source_used = Map::new();
        per_source_used.insert(1u8, used);
        let mut unmet_map = Map::new();
        if unmet > 0.0 {
            unmet_map.insert(1u8, unmet);
        }
        SolveOutcome {
            allocations: vec![],
            per_source_used,
            unmet: unmet_map,
            used_fallback: false,
            wall_time: std::time::Duration::from_millis(1),
            status: crate::solver::SolutionStatus::Optimal,
        }
    }

    #[test]
    fn full_feasibility_and_headroom_scores_high() {
        let mut gate = ConfidenceGate::new(ConfidenceWeights::default(), 0.5);
        let out = outcome(2.0, 0.0);
        let r = gate.evaluate(&out, &sources(), 2.0, 0.0);
        assert!(r.score > 0.8, "score = {}", r.score);
        assert!(!r.escalating);
    }

    #[test]
    fn unmet_demand_lowers_score_and_escalates() {
        let mut gate = ConfidenceGate::new(ConfidenceWeights::default(), 0.5);
        let out = outcome(10.0, 6.0);
        let r = gate.evaluate(&out, &sources(), 16.0, 0.0);
        assert!(r.score < 0.5, "score = {}", r.score);
        assert!(r.escalating);
    }

    #[test]
    fn fallback_always_escalates() {
        let mut gate = ConfidenceGate::new(ConfidenceWeights::default(), 0.5);
        let mut out = outcome(2.0, 0.0);
        out.used_fallback = true;
        let r = gate.evaluate(&out, &sources(), 2.0, 0.0);
        assert!(r.escalating);
    }

    #[test]
    fn near_capacity_escalates_on_second_consecutive_tick() {
        let mut gate = ConfidenceGate::new(ConfidenceWeights::default(), 0.0);
        let out = outcome(9.8, 0.0);
        let first = gate.evaluate(&out, &sources(), 9.8, 0.0);
        assert!(!first.escalating);
        let second = gate.evaluate(&out, &sources(), 9.8, 0.0);
        assert!(second.escalating);
    }
}
