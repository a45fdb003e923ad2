//! Node bookkeeping: per-node identity, role, and demand history.
//!
//! Nodes are ephemeral per run — created on first sighting in a telemetry
//! frame, retired when unseen past the staleness window. Owned exclusively
//! by the Tick Loop.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::wire::{NodeRole, TelemetryFrame};

/// Default ring capacity for per-node demand history.
pub const DEFAULT_HISTORY_H: usize = 200;

/// One tracked node and its demand ring buffer.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub id: u8,
    pub role: NodeRole,
    pub demand: f32,
    pub fulfillment: f32,
    history: VecDeque<f32>,
    history_cap: usize,
    last_seen: Instant,
}

impl NodeState {
    fn new(id: u8, role: NodeRole, history_cap: usize) -> Self {
        Self {
            id,
            role,
            demand: 0.0,
            fulfillment: 0.0,
            history: VecDeque::with_capacity(history_cap),
            history_cap,
            last_seen: Instant::now(),
        }
    }

    fn observe(&mut self, demand: f32, fulfillment: f32, now: Instant) {
        self.demand = demand;
        self.fulfillment = fulfillment;
        self.last_seen = now;
        if self.history.len() == self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(demand);
    }

    /// Demand samples, oldest first, most recent last.
    pub fn history(&self) -> &VecDeque<f32> {
        &self.history
    }

    pub fn sample_count(&self) -> usize {
        self.history.len()
    }
}

/// The Tick Loop's sole-owned table of known nodes and their history.
///
/// Mutated only between ticks: one `ingest` call per tick followed by one
/// `retire_stale` call.
pub struct HistoryBuffer {
    history_cap: usize,
    stale_after: Duration,
    nodes: HashMap<u8, NodeState>,
}

impl HistoryBuffer {
    pub fn new(history_cap: usize, stale_after: Duration) -> Self {
        Self {
            history_cap,
            stale_after,
            nodes: HashMap::new(),
        }
    }

    /// Apply one telemetry frame: update existing nodes, create new ones.
    pub fn ingest(&mut self, frame: &TelemetryFrame) {
        let now = Instant::now();
        for n in &frame.nodes {
            let cap = self.history_cap;
            let entry = self
                .nodes
                .entry(n.id)
                .or_insert_with(|| NodeState::new(n.id, n.role, cap));
            entry.observe(n.demand, n.fulfillment, now);
        }
    }

    /// Drop nodes unseen for longer than the configured staleness window.
    /// Returns the ids retired this call.
    pub fn retire_stale(&mut self) -> Vec<u8> {
        let now = Instant::now();
        let stale_after = self.stale_after;
        let mut retired = Vec::new();
        self.nodes.retain(|id, state| {
            let keep = now.duration_since(state.last_seen) <= stale_after;
            if !keep {
                retired.push(*id);
            }
            keep
        });
        retired
    }

    /// All currently-known consumer nodes, in ascending id order (stable
    /// tie-breaks for the solver).
    pub fn consumers(&self) -> Vec<&NodeState> {
        let mut out: Vec<&NodeState> = self
            .nodes
            .values()
            .filter(|n| matches!(n.role, NodeRole::Consumer))
            .collect();
        out.sort_by_key(|n| n.id);
        out
    }

    /// All currently-known nodes (any role), in ascending id order.
    pub fn all(&self) -> Vec<&NodeState> {
        let mut out: Vec<&NodeState> = self.nodes.values().collect();
        out.sort_by_key(|n| n.id);
        out
    }

    pub fn get(&self, id: u8) -> Option<&NodeState> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::TelemetryNode;

    fn frame(ts: u32, nodes: Vec<(u8, NodeRole, f32)>) -> TelemetryFrame {
        TelemetryFrame {
            timestamp_ms: ts,
            nodes: nodes
                .into_iter()
                .map(|(id, role, demand)| TelemetryNode {
                    id,
                    role,
                    demand,
                    fulfillment: demand,
                })
                .collect(),
        }
    }

    #[test]
    fn ingest_creates_and_updates_nodes() {
        let mut hb = HistoryBuffer::new(DEFAULT_HISTORY_H, Duration::from_secs(5));
        hb.ingest(&frame(0, vec![(1, NodeRole::Consumer, 2.0)]));
        hb.ingest(&frame(1, vec![(1, NodeRole::Consumer, 3.0)]));

        let consumers = hb.consumers();
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0].demand, 3.0);
        assert_eq!(consumers[0].sample_count(), 2);
    }

    #[test]
    fn history_ring_respects_capacity() {
        let mut hb = HistoryBuffer::new(3, Duration::from_secs(5));
        for i in 0..10 {
            hb.ingest(&frame(i, vec![(1, NodeRole::Consumer, i as f32)]));
        }
        let consumers = hb.consumers();
        assert_eq!(consumers[0].sample_count(), 3);
        assert_eq!(
            consumers[0].history().iter().copied().collect::<Vec<_>>(),
            vec![7.0, 8.0, 9.0]
        );
    }

    #[test]
    fn consumers_sorted_by_ascending_id() {
        let mut hb = HistoryBuffer::new(DEFAULT_HISTORY_H, Duration::from_secs(5));
        hb.ingest(&frame(
            0,
            vec![
                (5, NodeRole::Consumer, 1.0),
                (2, NodeRole::Consumer, 1.0),
                (9, NodeRole::Power, 0.0),
            ],
        ));
        let ids: Vec<u8> = hb.consumers().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![2, 5]);
    }

    #[test]
    fn stale_node_is_retired() {
        let mut hb = HistoryBuffer::new(DEFAULT_HISTORY_H, Duration::from_millis(10));
        hb.ingest(&frame(0, vec![(4, NodeRole::Consumer, 1.0)]));
        std::thread::sleep(Duration::from_millis(25));
        let retired = hb.retire_stale();
        assert_eq!(retired, vec![4]);
        assert!(hb.is_empty());
    }
}
