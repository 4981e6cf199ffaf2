//! Positional mapping of step events onto a run's fixed step list.

/// Cursor state for one run's step reconciliation.
///
/// The runner emits no step identifiers, only an ordered stream of
/// `step:end` events, so the k-th event is mapped onto slot k-1 of the
/// template. The tracker owns the cursor; the supervisor's apply loop is the
/// single writer that advances it, so slot assignment is strictly ordered.
#[derive(Debug)]
pub struct StepTracker {
    cursor: usize,
    total: usize,
}

impl StepTracker {
    /// Track a run whose template has `total` step slots.
    pub fn new(total: usize) -> Self {
        Self { cursor: 0, total }
    }

    /// Claim the next slot for a `step:end` event. Returns `None` once every
    /// slot has been written; the caller discards the event instead of
    /// writing out of bounds.
    pub fn claim_next(&mut self) -> Option<usize> {
        if self.cursor < self.total {
            let slot = self.cursor;
            self.cursor += 1;
            Some(slot)
        } else {
            None
        }
    }

    /// Bounds-check an artifact's self-reported step index. The index comes
    /// from a counter maintained inside the script, not from this cursor.
    pub fn artifact_slot(&self, index: usize) -> Option<usize> {
        if index < self.total { Some(index) } else { None }
    }

    /// Slot most recently claimed, if any. Used to spot disagreement between
    /// the cursor and an artifact's self-reported index.
    pub fn last_claimed(&self) -> Option<usize> {
        self.cursor.checked_sub(1)
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kth_event_claims_slot_k_minus_one() {
        let mut tracker = StepTracker::new(3);
        assert_eq!(tracker.claim_next(), Some(0));
        assert_eq!(tracker.claim_next(), Some(1));
        assert_eq!(tracker.claim_next(), Some(2));
    }

    #[test]
    fn test_claims_past_end_are_refused() {
        let mut tracker = StepTracker::new(2);
        tracker.claim_next();
        tracker.claim_next();
        assert_eq!(tracker.claim_next(), None);
        assert_eq!(tracker.claim_next(), None);
    }

    #[test]
    fn test_zero_length_template_refuses_everything() {
        let mut tracker = StepTracker::new(0);
        assert_eq!(tracker.claim_next(), None);
        assert_eq!(tracker.artifact_slot(0), None);
    }

    #[test]
    fn test_artifact_slot_bounds() {
        let tracker = StepTracker::new(3);
        assert_eq!(tracker.artifact_slot(0), Some(0));
        assert_eq!(tracker.artifact_slot(2), Some(2));
        assert_eq!(tracker.artifact_slot(3), None);
        assert_eq!(tracker.artifact_slot(5), None);
    }

    #[test]
    fn test_last_claimed_tracks_cursor() {
        let mut tracker = StepTracker::new(2);
        assert_eq!(tracker.last_claimed(), None);
        tracker.claim_next();
        assert_eq!(tracker.last_claimed(), Some(0));
        tracker.claim_next();
        assert_eq!(tracker.last_claimed(), Some(1));
    }
}
