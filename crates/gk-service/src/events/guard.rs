//! Single-flight concurrency guard for new-member processing.
//!
//! A process-wide set of in-flight (member, group) keys serializes the
//! "process new member" critical section against re-entrant and duplicate
//! triggers. The key is released a short grace period after completion,
//! not immediately, to absorb bursts of near-simultaneous duplicates that
//! survived debouncing.
//!
//! Process-local optimization only: the at-most-one-pending-session
//! invariant is enforced by the state machine layer and holds without
//! this guard.

use common::types::{GroupId, MemberId};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Grace period between completion and key release.
pub const RELEASE_GRACE: Duration = Duration::from_secs(3);

/// Single-flight guard keyed by (member, group).
#[derive(Clone)]
pub struct SingleFlight {
    in_flight: Arc<Mutex<HashSet<(MemberId, GroupId)>>>,
    release_grace: Duration,
}

impl SingleFlight {
    /// Create a guard with the default release grace.
    #[must_use]
    pub fn new() -> Self {
        Self::with_grace(RELEASE_GRACE)
    }

    /// Create a guard with an explicit release grace (for tests).
    #[must_use]
    pub fn with_grace(release_grace: Duration) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            release_grace,
        }
    }

    /// Try to enter the critical section for (member, group).
    ///
    /// Returns `true` if the caller holds the key and must later call
    /// [`SingleFlight::finish`]; `false` if another invocation is already
    /// handling this pair and the event should be dropped.
    pub fn try_begin(&self, member_id: MemberId, group_id: GroupId) -> bool {
        let Ok(mut set) = self.in_flight.lock() else {
            // A poisoned set only ever admits extra work; the state machine
            // stays correct either way.
            return true;
        };

        let entered = set.insert((member_id, group_id));
        if !entered {
            debug!(
                target: "gk.events.guard",
                member_id = %member_id,
                group_id = %group_id,
                "Pair already being processed, dropping event"
            );
        }
        entered
    }

    /// Mark the critical section complete. The key stays held for the
    /// release grace and is then removed in the background.
    pub fn finish(&self, member_id: MemberId, group_id: GroupId) {
        let in_flight = Arc::clone(&self.in_flight);
        let grace = self.release_grace;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Ok(mut set) = in_flight.lock() {
                set.remove(&(member_id, group_id));
            }
        });
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}
