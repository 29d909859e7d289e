//! Tracks how much of the server's history this client has observed.
//!
//! The cursor is the pair of the frontier [`Position`] and the forgotten
//! count (a pruning counter that only ever grows on an honest server).
//! Either component moving backwards means the remote tree was rebuilt and
//! the local view can no longer resume; the caller must discard everything
//! and synchronize from scratch.

use crate::protocol::Position;

/// Result of feeding a server-reported cursor into the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    /// The update was applied and the cursor advanced (or stayed put).
    pub accepted: bool,
    /// Backward motion detected; local state must be rebuilt. The tracker
    /// itself is left untouched.
    pub reset: bool,
}

#[derive(Debug, Default)]
pub struct PositionTracker {
    position: Option<Position>,
    forgotten: u64,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tracker from a published cursor, for comparison without
    /// touching the sync task's own state.
    pub fn from_parts(position: Option<Position>, forgotten: u64) -> Self {
        Self {
            position,
            forgotten,
        }
    }

    pub fn position(&self) -> Option<Position> {
        self.position
    }

    pub fn forgotten(&self) -> u64 {
        self.forgotten
    }

    /// Would accepting this cursor require discarding local state?
    ///
    /// True when the forgotten count regressed, or when both the held and
    /// incoming positions are defined and the incoming one is
    /// lexicographically earlier. Transitions between a defined and an
    /// undefined position are normal frontier movement, never backward.
    pub fn would_reset(&self, new_position: Option<Position>, new_forgotten: u64) -> bool {
        let forgotten_backwards = new_forgotten < self.forgotten;
        let position_backwards = matches!(
            (self.position, new_position),
            (Some(old), Some(new)) if new < old
        );
        forgotten_backwards || position_backwards
    }

    /// Apply a cursor reported by a successful poll.
    ///
    /// On backward motion nothing is mutated and `reset` is flagged;
    /// otherwise both components are stored unconditionally, even when
    /// unchanged.
    pub fn apply_update(&mut self, new_position: Option<Position>, new_forgotten: u64) -> Applied {
        if self.would_reset(new_position, new_forgotten) {
            return Applied {
                accepted: false,
                reset: true,
            };
        }
        self.position = new_position;
        self.forgotten = new_forgotten;
        Applied {
            accepted: true,
            reset: false,
        }
    }

    /// Exact cursor equality, with two undefined positions counting as
    /// equal. Used to classify change notifications that carry no visible
    /// cursor movement.
    pub fn same_view(&self, position: Option<Position>, forgotten: u64) -> bool {
        self.forgotten == forgotten && self.position == position
    }

    /// Forget everything, as if the page had just loaded.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
