//! Oracle Client: single-flight escalation channel to an external
//! reasoning service.
//!
//! At most one request is outstanding at a time; further escalations
//! while one is in flight are coalesced (silently dropped — the Tick
//! Loop will simply escalate again next tick if still warranted). The
//! response carries its own absolute deadline; a late arrival is
//! discarded rather than retroactively applied, per the ordering
//! guarantee that nothing before tick K+1 can be affected by a request
//! issued during tick K.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::snapshot::Snapshot;
use crate::solver::{AllocationEntry, SourceSpec};

const CONTEXT_WINDOW: usize = 10;

#[derive(Debug, Serialize)]
struct OracleRequestBody<'a> {
    request_id: Uuid,
    snapshots: &'a [Arc<Snapshot>],
    sources: &'a [SourceSpec],
    rejected_allocation: &'a [AllocationEntry],
}

#[derive(Debug, Deserialize)]
struct OracleResponseBody {
    allocation: Vec<AllocationEntry>,
}

#[derive(Debug, Clone)]
pub struct OracleOutcome {
    pub request_id: Uuid,
    pub allocations: Vec<AllocationEntry>,
    pub received_at: Instant,
    pub deadline: Instant,
}

impl OracleOutcome {
    pub fn is_stale(&self, now: Instant) -> bool {
        now > self.deadline
    }
}

pub struct OracleClient {
    http: reqwest::Client,
    url: Option<String>,
    timeout: Duration,
    in_flight: Arc<AtomicBool>,
    current_request: Mutex<Option<Uuid>>,
    result: Arc<ArcSwapOption<OracleOutcome>>,
}

impl OracleClient {
    pub fn new(url: Option<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            timeout,
            in_flight: Arc::new(AtomicBool::new(false)),
            current_request: Mutex::new(None),
            result: Arc::new(ArcSwapOption::from(None)),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    pub fn has_outstanding_request(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Submit an escalation if one isn't already outstanding. Returns
    /// `true` if a request was actually dispatched.
    pub fn escalate(
        &self,
        history: &[Arc<Snapshot>],
        sources: &[SourceSpec],
        rejected_allocation: &[AllocationEntry],
    ) -> bool {
        let Some(url) = self.url.clone() else {
            return false;
        };
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("oracle escalation coalesced: request already outstanding");
            return false;
        }

        let request_id = Uuid::new_v4();
        *self.current_request.lock() = Some(request_id);

        let context_start = history.len().saturating_sub(CONTEXT_WINDOW);
        let body = OracleRequestBody {
            request_id,
            snapshots: &history[context_start..],
            sources,
            rejected_allocation,
        };
        let payload = serde_json::to_value(&body).expect("oracle request always serializes");

        let http = self.http.clone();
        let timeout = self.timeout;
        let in_flight = self.in_flight.clone();
        let result = self.result.clone();
        let deadline = Instant::now() + timeout;

        tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, http.post(&url).json(&payload).send())
                .await
                .ok()
                .and_then(|r| r.ok());

            if let Some(response) = outcome {
                match response.json::<OracleResponseBody>().await {
                    Ok(parsed) => {
                        result.store(Some(Arc::new(OracleOutcome {
                            request_id,
                            allocations: parsed.allocation,
                            received_at: Instant::now(),
                            deadline,
                        })));
                    }
                    Err(e) => warn!("oracle response did not parse: {e}"),
                }
            } else {
                warn!("oracle request timed out or failed after {:?}", timeout);
            }
            in_flight.store(false, Ordering::Release);
        });

        true
    }

    /// Take the current ready result, if any, and clear the slot — a
    /// response is applied at most once, per the "not retroactive"
    /// ordering guarantee.
    pub fn take_ready_result(&self) -> Option<Arc<OracleOutcome>> {
        let outcome = self.result.swap(None)?;
        if outcome.is_stale(Instant::now()) {
            debug!("discarding stale oracle response {}", outcome.request_id);
            return None;
        }
        Some(outcome)
    }
}

/// Validate an oracle-proposed allocation against the same capacity and
/// ramp constraints solver output must satisfy.
pub fn validate_override(
    allocations: &[AllocationEntry],
    sources: &[SourceSpec],
    prev_totals: &std::collections::HashMap<u8, f64>,
) -> bool {
    let mut totals: std::collections::HashMap<u8, f64> = std::collections::HashMap::new();
    for a in allocations {
        *totals.entry(a.source_id).or_insert(0.0) += a.amps;
    }
    for s in sources {
        let used = totals.get(&s.source_id).copied().unwrap_or(0.0);
        if used > s.max_capacity + 1e-6 {
            return false;
        }
        let prev = prev_totals.get(&s.source_id).copied().unwrap_or(0.0);
        if (used - prev).abs() > s.ramp_limit + 1e-6 {
            return false;
        }
    }
    true
}
