//! Single-slot, many-reader cell for the latest published Snapshot.
//!
//! One writer (the Tick Loop), any number of readers (the Observer's HTTP
//! handlers). Reads never block writes and vice versa: `ArcSwap` gives us
//! a lock-free load-acquire/store-release pair, which is exactly the
//! "atomic swap cell" shared-resource policy calls for.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::snapshot::Snapshot;

#[derive(Default)]
pub struct SnapshotBroadcaster {
    slot: ArcSwapOption<Snapshot>,
}

impl SnapshotBroadcaster {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::from(None),
        }
    }

    pub fn publish(&self, snapshot: Snapshot) {
        self.slot.store(Some(Arc::new(snapshot)));
    }

    /// The most recently published snapshot, or `None` if no tick has
    /// completed yet (the observer interface's "not ready" sentinel).
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.slot.load_full()
    }
}
