//! Replanner (§4.11): turns a failed step into either a `PlanPatch` request
//! to the model or, after repeated failure on the same step, an escalation
//! to `StopReason::Blocked`.
//!
//! Grounded on `deepseek-agent/src/mode_router.rs`'s `FailureTracker`: a
//! per-key consecutive-failure counter that escalates once a threshold is
//! crossed, generalized here from "failures of a whole mode" to "failed
//! replan attempts on one step id" per §4.11 ("three consecutive failed
//! replans targeting the same step escalate to BLOCKED").

use std::collections::HashMap;

const CONSECUTIVE_FAILURE_LIMIT: u32 = 3;

/// Why the Replanner gave up on a step rather than asking the model to try
/// again (mirrors the teacher's `EscalationReason` shape: a reason plus the
/// failure count that triggered it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalation {
    pub step_id: String,
    pub consecutive_failures: u32,
    pub reason: String,
}

/// Per-step consecutive-replan-failure counters (§4.11). A successful
/// replan, or a step moving to a new attempt of a *different* failure,
/// resets its counter back to zero.
#[derive(Debug, Default)]
pub struct FailureTracker {
    counts: HashMap<String, u32>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one failed replan attempt for `step_id` and returns an
    /// `Escalation` once the limit is reached, resetting the counter so
    /// a subsequent manual retry starts fresh.
    pub fn record_failure(&mut self, step_id: &str, reason: &str) -> Option<Escalation> {
        let count = self.counts.entry(step_id.to_string()).or_insert(0);
        *count += 1;
        if *count >= CONSECUTIVE_FAILURE_LIMIT {
            let consecutive_failures = *count;
            self.counts.insert(step_id.to_string(), 0);
            return Some(Escalation {
                step_id: step_id.to_string(),
                consecutive_failures,
                reason: reason.to_string(),
            });
        }
        None
    }

    pub fn record_success(&mut self, step_id: &str) {
        self.counts.remove(step_id);
    }

    pub fn failure_count(&self, step_id: &str) -> u32 {
        self.counts.get(step_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn third_consecutive_failure_escalates() {
        let mut tracker = FailureTracker::new();
        assert!(tracker.record_failure("step-1", "timeout").is_none());
        assert!(tracker.record_failure("step-1", "timeout").is_none());
        let escalation = tracker.record_failure("step-1", "timeout").expect("escalates on third");
        assert_eq!(escalation.consecutive_failures, 3);
        assert_eq!(escalation.step_id, "step-1");
    }

    #[test]
    fn success_resets_the_counter() {
        let mut tracker = FailureTracker::new();
        tracker.record_failure("step-1", "timeout");
        tracker.record_failure("step-1", "timeout");
        tracker.record_success("step-1");
        assert_eq!(tracker.failure_count("step-1"), 0);
        assert!(tracker.record_failure("step-1", "timeout").is_none());
    }

    #[test]
    fn counters_are_independent_per_step() {
        let mut tracker = FailureTracker::new();
        tracker.record_failure("step-1", "timeout");
        tracker.record_failure("step-1", "timeout");
        assert!(tracker.record_failure("step-2", "conflict").is_none());
        assert_eq!(tracker.failure_count("step-1"), 2);
        assert_eq!(tracker.failure_count("step-2"), 1);
    }

    #[test]
    fn escalation_resets_so_a_later_retry_gets_a_fresh_budget() {
        let mut tracker = FailureTracker::new();
        tracker.record_failure("step-1", "timeout");
        tracker.record_failure("step-1", "timeout");
        tracker.record_failure("step-1", "timeout");
        assert_eq!(tracker.failure_count("step-1"), 0);
    }
}
