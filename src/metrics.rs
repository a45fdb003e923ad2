//! Metrics installation and the counter/gauge/histogram names this crate
//! emits. A thin layer over the `metrics` facade, following the same
//! install-once-at-startup pattern as this codebase's tracing init.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const TICK_DURATION_MS: &str = "microgrid_tick_duration_ms";
pub const SOLVE_DURATION_MS: &str = "microgrid_solve_duration_ms";
pub const FALLBACK_TOTAL: &str = "microgrid_fallback_total";
pub const ORACLE_ESCALATIONS_TOTAL: &str = "microgrid_oracle_escalations_total";
pub const ORACLE_TIMEOUTS_TOTAL: &str = "microgrid_oracle_timeouts_total";
pub const ENDPOINT_RECONNECTS_TOTAL: &str = "microgrid_endpoint_reconnects_total";
pub const ENDPOINT_RESYNCS_TOTAL: &str = "microgrid_endpoint_resyncs_total";
pub const FRAMES_DECODED_TOTAL: &str = "microgrid_frames_decoded_total";
pub const FRAMES_REJECTED_TOTAL: &str = "microgrid_frames_rejected_total";
pub const UNMET_DEMAND_AMPS: &str = "microgrid_unmet_demand_amps";
pub const NODES_TRACKED: &str = "microgrid_nodes_tracked";
pub const NODES_RETIRED_TOTAL: &str = "microgrid_nodes_retired_total";
pub const CONFIDENCE_SCORE: &str = "microgrid_confidence_score";

/// Install the Prometheus recorder globally and return a handle that
/// renders the current snapshot on demand. The observer's axum router
/// serves that rendering on `GET /metrics` rather than this crate
/// running a second standalone listener.
pub fn install() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")
}
