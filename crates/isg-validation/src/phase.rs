//! Per-candidate validation state machine

use crate::error::ValidationError;
use isg_core::{CandidateId, ValidationPhase};
use std::time::{Duration, Instant};
use tracing::debug;

/// True if `from -> to` is a legal transition
///
/// Runs only move forward through overlay, build and test. Any
/// non-terminal phase may fail; terminal phases never change.
#[must_use]
pub fn is_allowed(from: ValidationPhase, to: ValidationPhase) -> bool {
    use ValidationPhase::{Building, Failed, Overlaying, Passed, Queued, Testing};
    matches!(
        (from, to),
        (Queued, Overlaying) | (Overlaying, Building) | (Building, Testing) | (Testing, Passed)
    ) || (to == Failed && !from.is_terminal())
}

/// Tracks one run through the phase table
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    candidate: CandidateId,
    phase: ValidationPhase,
    entered: Instant,
    history: Vec<(ValidationPhase, Duration)>,
}

impl PhaseTracker {
    #[must_use]
    pub fn new(candidate: CandidateId) -> Self {
        Self {
            candidate,
            phase: ValidationPhase::Queued,
            entered: Instant::now(),
            history: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn phase(&self) -> ValidationPhase {
        self.phase
    }

    /// Phases left so far, with the time spent in each
    #[must_use]
    pub fn history(&self) -> &[(ValidationPhase, Duration)] {
        &self.history
    }

    /// Move to `to`
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::IllegalTransition`] if the table forbids it.
    pub fn advance(&mut self, to: ValidationPhase) -> Result<(), ValidationError> {
        if !is_allowed(self.phase, to) {
            return Err(ValidationError::IllegalTransition { from: self.phase, to });
        }
        let spent = self.entered.elapsed();
        debug!(candidate = %self.candidate.short(), from = %self.phase, to = %to, spent_ms = spent.as_millis() as u64, "phase transition");
        self.history.push((self.phase, spent));
        self.phase = to;
        self.entered = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isg_core::ContentHash;
    use ValidationPhase::*;

    fn tracker() -> PhaseTracker {
        PhaseTracker::new(CandidateId::from_hash(ContentHash::compute(b"c")))
    }

    #[test]
    fn happy_path_is_linear() {
        let mut t = tracker();
        for next in [Overlaying, Building, Testing, Passed] {
            t.advance(next).unwrap();
        }
        assert_eq!(t.phase(), Passed);
        assert_eq!(t.history().len(), 4);
    }

    #[test]
    fn skipping_and_reversing_rejected() {
        let mut t = tracker();
        assert!(t.advance(Building).is_err());
        t.advance(Overlaying).unwrap();
        assert!(t.advance(Passed).is_err());
        assert!(t.advance(Queued).is_err());
        assert_eq!(t.phase(), Overlaying);
    }

    #[test]
    fn terminal_phases_are_final() {
        for terminal in [Passed, Failed] {
            for to in [Queued, Overlaying, Building, Testing, Passed, Failed] {
                assert!(!is_allowed(terminal, to));
            }
        }
        assert!(is_allowed(Queued, Failed));
        assert!(is_allowed(Testing, Failed));
    }
}
