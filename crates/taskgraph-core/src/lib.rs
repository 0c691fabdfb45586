//! Core data model for the agent orchestration core: messages, plans, tool
//! contracts, intents, risk levels and approval records, plus the layered
//! `AppConfig`. Nothing in this crate touches the filesystem beyond config
//! load/save and nothing here talks to an LLM or a subprocess — those are
//! the concern of `taskgraph-llm` and `taskgraph-tools`.

mod config;
mod intent;
mod message;
mod plan;
mod session_state;
mod tool;

pub use config::*;
pub use intent::*;
pub use message::*;
pub use plan::*;
pub use session_state::*;
pub use tool::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// The crate-wide fallible return type. Leaf crates (`taskgraph-policy`,
/// `taskgraph-diff`, ...) prefer a narrow `thiserror` enum; orchestration glue
/// uses this alias, matching the split already present in the teacher.
pub type Result<T> = anyhow::Result<T>;

/// Directory the core keeps its state under, rooted at the workspace.
pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".taskgraph")
}

/// Risk propagates Intent → Plan → Step; a tool's `side_effects` can only
/// raise it, never lower it (§3 RiskLevel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn max(self, other: RiskLevel) -> RiskLevel {
        std::cmp::max(self, other)
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// One decided-or-pending human approval for a high/critical risk plan
/// (§3 ApprovalRequest, §4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub trace_id: Uuid,
    pub risk_level: RiskLevel,
    pub intent_name: String,
    pub plan_summary: String,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalRequest {
    pub fn new(trace_id: Uuid, risk_level: RiskLevel, intent_name: &str, plan_summary: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            trace_id,
            risk_level,
            intent_name: intent_name.to_string(),
            plan_summary: plan_summary.to_string(),
            status: ApprovalStatus::Pending,
            requested_at: Utc::now(),
            decided_at: None,
            decided_by: None,
            comment: None,
        }
    }
}

/// Stop reasons a turn can terminate with (§7 user-visible failure behavior).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Done,
    Blocked,
    MaxIter,
    ProviderFailed,
    Cancelled,
}

/// Everything the orchestrator reports back for a completed turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub trace_id: Uuid,
    pub stop_reason: StopReason,
    pub last_step_id: Option<String>,
    pub summary: String,
}
