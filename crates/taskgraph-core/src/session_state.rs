//! Turn state machine (§4.1): the concrete type behind the Orchestrator's
//! `IDLE → CLASSIFYING → ROUTING → (PLANNING | DIRECT) →
//! [WAITING_FOR_APPROVAL] → EXECUTING ↔ REPLANNING → VERIFYING →
//! DONE | BLOCKED | MAX_ITER` state diagram.
//!
//! Grounded on the teacher's `codingbuddy-core::SessionState` +
//! `is_valid_session_state_transition`: a closed enum of phases plus a pure
//! function enumerating the legal edges between them, named one-for-one
//! after the phase names §4.1 gives the orchestrator rather than the
//! teacher's own (`Planning`/`ExecutingStep`/`AwaitingApproval`/...) phase
//! set.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Classifying,
    Routing,
    Planning,
    Direct,
    WaitingForApproval,
    Executing,
    Replanning,
    Verifying,
    Done,
    Blocked,
    MaxIter,
}

/// Whether `from -> to` is a legal edge of §4.1's state diagram. A
/// same-state "transition" is always legal (re-entrant phases, e.g.
/// `Executing -> Executing` across steps).
pub fn is_valid_session_state_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    if from == to {
        return true;
    }
    match from {
        Idle => matches!(to, Classifying),
        Classifying => matches!(to, Routing),
        Routing => matches!(to, Planning | Direct | WaitingForApproval | Blocked),
        Planning => matches!(to, WaitingForApproval | Executing | Blocked),
        Direct => matches!(to, Done | Blocked),
        // `WaitingForApproval` is entered twice over a turn's life: once at
        // the turn level (before `Planning`, for a high-risk intent) and
        // once at the step level (from `Executing`, on `E_APPROVAL_REQUIRED`,
        // back to either `Executing` on grant or `Replanning` on denial).
        WaitingForApproval => matches!(to, Planning | Executing | Replanning | Blocked),
        Executing => matches!(to, Replanning | Verifying | WaitingForApproval | Blocked | MaxIter | Done),
        Replanning => matches!(to, Executing | Blocked),
        Verifying => matches!(to, Executing | Done | Blocked),
        Done | Blocked | MaxIter => false,
    }
}
