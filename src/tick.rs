//! Tick Loop: the sole mutator of history, per-tick snapshot state, and
//! dispatch scheduling. Drives the whole pipeline at a fixed cadence.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use quanta::Clock;
use tracing::{debug, info, warn};

use crate::broadcaster::SnapshotBroadcaster;
use crate::confidence::{ConfidenceGate, ConfidenceWeights};
use crate::endpoint::EndpointLink;
use crate::forecaster::{self, ForecasterConfig};
use crate::node::HistoryBuffer;
use crate::oracle::{self, OracleClient};
use crate::snapshot::{DispatchDetail, EconomicSummary, Snapshot, SnapshotNode, SourceUsage};
use crate::solver::{self, ConsumerDemand, SolveOutcome, SolveRequest, SourceSpec};
use crate::wire::{DispatchFrame, DispatchNode};

const MAX_SNAPSHOT_HISTORY: usize = 10;

pub struct TickLoopConfig {
    pub tick_interval: Duration,
    pub history_capacity: usize,
    pub node_stale_after: Duration,
    pub forecast_horizon: usize,
    pub forecaster: ForecasterConfig,
    pub solve_budget: Duration,
    pub confidence_weights: ConfidenceWeights,
    pub confidence_threshold: f64,
    pub sources: Vec<SourceSpec>,
    /// Reference current used to normalize amps into a `[0,1]` PWM level
    /// for a node without a per-node override. Startup-configured.
    pub default_nominal_current: f32,
}

pub struct TickLoop {
    cfg: TickLoopConfig,
    history: HistoryBuffer,
    prev_totals: HashMap<u8, f64>,
    confidence_gate: ConfidenceGate,
    endpoint: Arc<EndpointLink>,
    oracle: Arc<OracleClient>,
    broadcaster: Arc<SnapshotBroadcaster>,
    snapshot_history: VecDeque<Arc<Snapshot>>,
    last_timestamp_ms: u32,
    cumulative_cost: f64,
    clock: Clock,
}

impl TickLoop {
    pub fn new(
        cfg: TickLoopConfig,
        endpoint: Arc<EndpointLink>,
        oracle: Arc<OracleClient>,
        broadcaster: Arc<SnapshotBroadcaster>,
    ) -> Self {
        let confidence_gate = ConfidenceGate::new(cfg.confidence_weights, cfg.confidence_threshold);
        let history = HistoryBuffer::new(cfg.history_capacity, cfg.node_stale_after);
        Self {
            cfg,
            history,
            prev_totals: HashMap::new(),
            confidence_gate,
            endpoint,
            oracle,
            broadcaster,
            snapshot_history: VecDeque::with_capacity(MAX_SNAPSHOT_HISTORY),
            last_timestamp_ms: 0,
            cumulative_cost: 0.0,
            clock: Clock::new(),
        }
    }

    /// Run forever at the configured cadence until `shutdown` resolves.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.cfg.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_one_tick();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("tick loop received shutdown signal");
                        self.run_shutdown_tick();
                        return;
                    }
                }
            }
        }
    }

    fn run_shutdown_tick(&mut self) {
        // Best-effort zero-demand dispatch so the hardware endpoint doesn't
        // keep the previous tick's supply commands live after we stop.
        let zero_frame = DispatchFrame { nodes: vec![] };
        self.endpoint.send_dispatch(&zero_frame);
    }

    fn run_one_tick(&mut self) {
        let tick_started = self.clock.now();

        if let Some(frame) = self.endpoint.take_latest_telemetry() {
            if frame.timestamp_ms >= self.last_timestamp_ms || self.last_timestamp_ms == 0 {
                self.last_timestamp_ms = frame.timestamp_ms;
            }
            self.history.ingest(&frame);
        }
        let retired = self.history.retire_stale();
        for id in &retired {
            debug!("retiring stale node {id}");
        }
        if !retired.is_empty() {
            metrics::counter!(crate::metrics::NODES_RETIRED_TOTAL).increment(retired.len() as u64);
        }
        metrics::gauge!(crate::metrics::NODES_TRACKED).set(self.history.len() as f64);

        let consumers = self.history.consumers();
        let histories: Vec<(u8, &VecDeque<f32>)> =
            consumers.iter().map(|n| (n.id, n.history())).collect();
        let forecasts = forecaster::forecast_all(&histories, self.cfg.forecast_horizon, &self.cfg.forecaster);

        let demand_by_node: HashMap<u8, f64> = forecasts
            .iter()
            .map(|f| (f.node_id, *f.projection.first().unwrap_or(&0.0) as f64))
            .collect();
        let mean_variance = if forecasts.is_empty() {
            0.0
        } else {
            forecasts.iter().map(|f| f.variance).sum::<f64>() / forecasts.len() as f64
        };

        let consumer_demands: Vec<ConsumerDemand> = demand_by_node
            .iter()
            .map(|(&node_id, &forecast_demand)| ConsumerDemand {
                node_id,
                forecast_demand,
            })
            .collect();
        let total_demand: f64 = consumer_demands.iter().map(|c| c.forecast_demand).sum();

        let solve_req = SolveRequest {
            consumers: &consumer_demands,
            sources: &self.cfg.sources,
            prev_totals: &self.prev_totals,
            solve_budget: self.cfg.solve_budget,
        };

        let mut outcome = match solver::solve(&solve_req) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("solver rejected input, using empty outcome: {e}");
                SolveOutcome {
                    allocations: vec![],
                    per_source_used: HashMap::new(),
                    unmet: HashMap::new(),
                    used_fallback: true,
                    wall_time: Duration::ZERO,
                    status: solver::SolutionStatus::Infeasible,
                }
            }
        };
        if outcome.used_fallback {
            metrics::counter!(crate::metrics::FALLBACK_TOTAL).increment(1);
        }
        metrics::histogram!(crate::metrics::SOLVE_DURATION_MS)
            .record(outcome.wall_time.as_secs_f64() * 1000.0);

        let confidence = self
            .confidence_gate
            .evaluate(&outcome, &self.cfg.sources, total_demand, mean_variance);
        metrics::gauge!(crate::metrics::CONFIDENCE_SCORE).set(confidence.score);

        if let Some(ready) = self.oracle.take_ready_result() {
            if oracle::validate_override(&ready.allocations, &self.cfg.sources, &self.prev_totals) {
                info!("applying oracle override {}", ready.request_id);
                let mut per_source_used: HashMap<u8, f64> = HashMap::new();
                for a in &ready.allocations {
                    *per_source_used.entry(a.source_id).or_insert(0.0) += a.amps;
                }
                outcome = SolveOutcome {
                    allocations: ready.allocations.clone(),
                    per_source_used,
                    unmet: outcome.unmet,
                    used_fallback: outcome.used_fallback,
                    wall_time: outcome.wall_time,
                    status: solver::SolutionStatus::Optimal,
                };
            } else {
                warn!("discarding oracle override {}: violates constraints", ready.request_id);
                metrics::counter!(crate::metrics::ORACLE_TIMEOUTS_TOTAL).increment(1);
            }
        }

        if confidence.escalating && !self.oracle.has_outstanding_request() {
            let dispatched = self.oracle.escalate(
                self.snapshot_history.make_contiguous(),
                &self.cfg.sources,
                &outcome.allocations,
            );
            if dispatched {
                metrics::counter!(crate::metrics::ORACLE_ESCALATIONS_TOTAL).increment(1);
            }
        }

        self.prev_totals = outcome.per_source_used.clone();

        let dispatch_frame = self.build_dispatch_frame(&outcome);
        let link_down = self.endpoint.is_link_down();
        if !link_down {
            self.endpoint.send_dispatch(&dispatch_frame);
        }

        let optimization_time_ms = tick_started.elapsed().as_secs_f64() * 1000.0;
        let tick_cost: f64 = self
            .cfg
            .sources
            .iter()
            .map(|s| outcome.per_source_used.get(&s.source_id).copied().unwrap_or(0.0) * s.cost_per_amp)
            .sum();
        let snapshot = self.build_snapshot(
            &outcome,
            &confidence,
            &dispatch_frame,
            total_demand,
            optimization_time_ms,
            link_down,
            tick_cost,
        );
        self.cumulative_cost += tick_cost;

        metrics::gauge!(crate::metrics::UNMET_DEMAND_AMPS).set(outcome.total_unmet());
        metrics::histogram!(crate::metrics::TICK_DURATION_MS).record(optimization_time_ms);

        let snapshot = Arc::new(snapshot);
        self.snapshot_history.push_back(snapshot.clone());
        if self.snapshot_history.len() > MAX_SNAPSHOT_HISTORY {
            self.snapshot_history.pop_front();
        }
        self.broadcaster.publish((*snapshot).clone());
    }

    /// A node may be served by more than one source; the dispatch frame
    /// reports only the largest single contributor as `source_id` (the
    /// wire format carries one source per node).
    fn build_dispatch_frame(&self, outcome: &SolveOutcome) -> DispatchFrame {
        let mut per_node: HashMap<u8, (f64, f64, u8)> = HashMap::new(); // total, max_single, source of max
        for a in &outcome.allocations {
            let entry = per_node.entry(a.node_id).or_insert((0.0, 0.0, a.source_id));
            entry.0 += a.amps;
            if a.amps > entry.1 {
                entry.1 = a.amps;
                entry.2 = a.source_id;
            }
        }
        let nodes = per_node
            .into_iter()
            .map(|(node_id, (total_amps, _, source_id))| {
                let supply = (total_amps as f32 / self.cfg.default_nominal_current).clamp(0.0, 1.0);
                DispatchNode {
                    node_id,
                    supply,
                    source_id,
                }
            })
            .collect();
        DispatchFrame { nodes }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_snapshot(
        &self,
        outcome: &SolveOutcome,
        confidence: &crate::confidence::ConfidenceResult,
        dispatch_frame: &DispatchFrame,
        total_demand: f64,
        optimization_time_ms: f64,
        link_down: bool,
        tick_cost: f64,
    ) -> Snapshot {
        let nodes: Vec<SnapshotNode> = self
            .history
            .all()
            .into_iter()
            .map(|n| SnapshotNode {
                id: n.id,
                role: n.role,
                demand: n.demand,
                fulfillment: n.fulfillment,
            })
            .collect();

        let mut source_usage = HashMap::new();
        let mut total_supply = 0.0;
        let green_ids: Vec<u8> = self.cfg.sources.iter().filter(|s| s.green).map(|s| s.source_id).collect();

        for s in &self.cfg.sources {
            let amps = outcome.per_source_used.get(&s.source_id).copied().unwrap_or(0.0);
            total_supply += amps;
            source_usage.insert(
                s.source_id,
                SourceUsage {
                    amps,
                    cost: amps * s.cost_per_amp,
                    cost_per_amp: s.cost_per_amp,
                    max_capacity: s.max_capacity,
                },
            );
        }

        let cost_per_second = tick_cost / self.cfg.tick_interval.as_secs_f64();
        let cost_per_amp = if total_supply > 0.0 { tick_cost / total_supply } else { 0.0 };

        let dispatch_details: Vec<DispatchDetail> = dispatch_frame
            .nodes
            .iter()
            .map(|n| DispatchDetail {
                id: n.node_id,
                supply_amps: n.supply as f64 * self.cfg.default_nominal_current as f64,
                source_id: n.source_id,
            })
            .collect();

        let economic = EconomicSummary {
            total_cost: self.cumulative_cost + tick_cost,
            cost_per_second,
            cost_per_amp,
            total_demand,
            total_supply,
            unmet_demand: outcome.total_unmet(),
            efficiency_percent: EconomicSummary::efficiency_percent(total_supply, total_demand),
            green_energy_percent: EconomicSummary::green_energy_percent(&source_usage, &green_ids),
            source_usage,
        };

        Snapshot {
            timestamp_ms: self.last_timestamp_ms,
            nodes,
            optimization_time_ms,
            confidence_score: confidence.score,
            dispatch_count: dispatch_frame.nodes.len(),
            economic,
            dispatch_details,
            link_down,
            used_fallback: outcome.used_fallback,
            escalating: confidence.escalating,
        }
    }
}
