//! Membership event classification and debouncing.
//!
//! The upstream event source delivers raw (previous, new) membership-state
//! transitions, with duplicates and occasional reordering within a short
//! window. The debouncer discards duplicates per (member, group) pair;
//! classification then reduces each surviving transition to the one of
//! four outcomes the orchestrator acts on.

use crate::models::{MemberState, MemberStatus};
use common::types::{GroupId, MemberId};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Debounce window: events for the same pair arriving within this window
/// of a previously processed event are discarded unconditionally.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);

/// Bound on tracked pairs before stale entries are evicted.
const MAX_TRACKED_PAIRS: usize = 4096;

/// Classification of a membership transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The member entered the group.
    Joined,
    /// The member left or was removed.
    Left,
    /// The member is restricted with no live session and cannot post; a
    /// session needs to be (re)created.
    StillRestrictedNeedsCheck,
    /// Nothing the orchestrator acts on.
    None,
}

/// Classify a non-discarded membership transition.
///
/// `has_pending_session` is the caller-supplied answer to "does this pair
/// currently have a pending session" - needed only for the
/// still-restricted branch.
#[must_use]
pub fn classify(
    previous: &MemberState,
    new: &MemberState,
    has_pending_session: bool,
) -> Classification {
    // Joined: out-of-group -> any active status, or the explicit
    // membership flag flipping to true
    let was_out = matches!(
        previous.status,
        MemberStatus::Left | MemberStatus::Kicked | MemberStatus::NotMember
    );
    if (was_out && new.status.is_active())
        || (previous.is_member == Some(false) && new.is_member == Some(true))
    {
        return Classification::Joined;
    }

    // Left: in-group -> left/kicked
    let was_in = matches!(
        previous.status,
        MemberStatus::Member | MemberStatus::Restricted | MemberStatus::Admin
    );
    if was_in && matches!(new.status, MemberStatus::Left | MemberStatus::Kicked) {
        return Classification::Left;
    }

    // Still restricted with no session and no send capability: restriction
    // was applied by another actor, so a session needs to be created
    if previous.status == MemberStatus::Restricted
        && new.status == MemberStatus::Restricted
        && !has_pending_session
        && new.can_send_messages == Some(false)
    {
        return Classification::StillRestrictedNeedsCheck;
    }

    Classification::None
}

/// Per-pair duplicate-event suppressor.
///
/// Process-local best-effort cache only: it reduces redundant work under
/// duplicate delivery and is never a correctness mechanism (the session
/// state machine is).
pub struct Debouncer {
    window: Duration,
    last_seen: Mutex<HashMap<(MemberId, GroupId), Instant>>,
}

impl Debouncer {
    /// Create a debouncer with the default window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(DEBOUNCE_WINDOW)
    }

    /// Create a debouncer with an explicit window (for tests).
    #[must_use]
    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Observe an event for (member, group). Returns `true` if the event
    /// should be processed, `false` if it is a duplicate inside the window
    /// and must be discarded.
    pub fn observe(&self, member_id: MemberId, group_id: GroupId) -> bool {
        self.observe_at(member_id, group_id, Instant::now())
    }

    /// Deterministic variant of [`Debouncer::observe`] against an explicit
    /// instant (for tests).
    pub fn observe_at(&self, member_id: MemberId, group_id: GroupId, now: Instant) -> bool {
        let Ok(mut map) = self.last_seen.lock() else {
            // A poisoned map only ever skips deduplication; processing the
            // event is the safe direction.
            return true;
        };

        if let Some(last) = map.get(&(member_id, group_id)) {
            if now.duration_since(*last) < self.window {
                debug!(
                    target: "gk.events.debounce",
                    member_id = %member_id,
                    group_id = %group_id,
                    "Discarding duplicate membership event"
                );
                return false;
            }
        }

        // Keep the map bounded: drop entries already outside the window
        if map.len() >= MAX_TRACKED_PAIRS {
            let window = self.window;
            map.retain(|_, last| now.duration_since(*last) < window);
        }

        map.insert((member_id, group_id), now);
        true
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new()
    }
}
