//! The aggregated, immutable per-tick state served to observers.

use std::collections::HashMap;

use serde::Serialize;

use crate::wire::NodeRole;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotNode {
    pub id: u8,
    #[serde(rename = "type")]
    pub role: NodeRole,
    pub demand: f32,
    pub fulfillment: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceUsage {
    pub amps: f64,
    pub cost: f64,
    pub cost_per_amp: f64,
    pub max_capacity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchDetail {
    pub id: u8,
    pub supply_amps: f64,
    pub source_id: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct EconomicSummary {
    /// Cumulative cost since process start.
    pub total_cost: f64,
    /// Instantaneous cost rate for this tick, in cost-units/second.
    pub cost_per_second: f64,
    pub cost_per_amp: f64,
    pub total_demand: f64,
    pub total_supply: f64,
    pub unmet_demand: f64,
    pub efficiency_percent: f64,
    pub green_energy_percent: f64,
    pub source_usage: HashMap<u8, SourceUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub timestamp_ms: u32,
    pub nodes: Vec<SnapshotNode>,
    pub optimization_time_ms: f64,
    pub confidence_score: f64,
    pub dispatch_count: usize,
    pub economic: EconomicSummary,
    pub dispatch_details: Vec<DispatchDetail>,
    pub link_down: bool,
    pub used_fallback: bool,
    pub escalating: bool,
}

impl EconomicSummary {
    pub fn efficiency_percent(total_supply: f64, total_demand: f64) -> f64 {
        if total_demand <= 0.0 {
            100.0
        } else {
            (total_supply / total_demand * 100.0).clamp(0.0, 100.0)
        }
    }

    pub fn green_energy_percent(source_usage: &HashMap<u8, SourceUsage>, green_ids: &[u8]) -> f64 {
        let total: f64 = source_usage.values().map(|u| u.amps).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let green: f64 = source_usage
            .iter()
            .filter(|(id, _)| green_ids.contains(id))
            .map(|(_, u)| u.amps)
            .sum();
        (green / total * 100.0).clamp(0.0, 100.0)
    }
}
