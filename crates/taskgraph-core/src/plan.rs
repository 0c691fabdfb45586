//! Plan / PlanPatch data model (§3 Plan, §4.4 Planner, §6 wire forms).
//!
//! `PlanDocument` is the duck-typed LLM output (§9 "no open extension —
//! unknown tags are errors"); `Plan` is the orchestrator's merged,
//! in-memory working copy. The Planner/Replanner (in `taskgraph-agent`) are
//! responsible for turning one into the other; this module only owns the
//! shapes and the structural invariants in `Plan::validate`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tools_expected: Vec<String>,
    pub status: StepStatus,
    /// Machine-readable cause when `status == Failed`, e.g.
    /// `"dependency_removed"` for a cascaded failure (§4.4). `None` for a
    /// step that failed directly from a tool/model error, where the detail
    /// already lives in the turn's event log rather than on the step itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Step {
    pub fn new_pending(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            dependencies: vec![],
            tools_expected: vec![],
            status: StepStatus::Pending,
            failure_reason: None,
        }
    }
}

/// The wire-level document the model is asked to emit, exactly one JSON
/// object (§4.4 parsing protocol, §6 wire forms).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanDocument {
    FullPlan { title: String, steps: Vec<Step> },
    PlanPatch { changes: Vec<PatchChange> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchChange {
    pub op: PatchOp,
    /// For `add`: insert after this step id (`None` = prepend).
    #[serde(default)]
    pub after_id: Option<String>,
    /// For `replace`/`remove`: the existing step id targeted.
    #[serde(default)]
    pub step_id: Option<String>,
    /// For `add`/`replace`: the step payload.
    #[serde(default)]
    pub step: Option<Step>,
}

/// The orchestrator's merged, mutable working plan (§3 Plan lifecycle:
/// "created by Planner, mutated only by Executor/Replanner, discarded at
/// turn end").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Uuid,
    pub version: u32,
    pub title: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("duplicate step id `{0}`")]
    DuplicateId(String),
    #[error("step `{0}` depends on unknown step `{1}`")]
    UnknownDependency(String, String),
    #[error("more than one step is in_progress")]
    MultipleInProgress,
    #[error("step `{0}` is in_progress but a dependency is not done")]
    InProgressBeforeDependenciesDone(String),
    #[error("plan has no steps")]
    Empty,
}

impl Plan {
    pub fn new(title: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            plan_id: Uuid::now_v7(),
            version: 1,
            title: title.into(),
            steps,
        }
    }

    pub fn to_full_plan_document(&self) -> PlanDocument {
        PlanDocument::FullPlan {
            title: self.title.clone(),
            steps: self.steps.clone(),
        }
    }

    pub fn from_full_plan(plan_id: Uuid, version: u32, title: String, steps: Vec<Step>) -> Self {
        Self {
            plan_id,
            version,
            title,
            steps,
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Every step that depends on `id` is still-reachable (its own deps are
    /// satisfied) and not already `done`.
    pub fn dependents_of(&self, id: &str) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.dependencies.iter().any(|d| d == id))
            .collect()
    }

    /// Checks the invariants of §3/§8: unique ids, dependencies resolve, at
    /// most one `in_progress`, and an `in_progress` step's dependencies are
    /// all `done`.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(PlanError::DuplicateId(step.id.clone()));
            }
        }

        let mut in_progress_count = 0;
        for step in &self.steps {
            for dep in &step.dependencies {
                if !self.steps.iter().any(|s| &s.id == dep) {
                    return Err(PlanError::UnknownDependency(step.id.clone(), dep.clone()));
                }
            }
            if step.status == StepStatus::InProgress {
                in_progress_count += 1;
                let deps_done = step.dependencies.iter().all(|dep| {
                    self.steps
                        .iter()
                        .find(|s| &s.id == dep)
                        .map(|s| s.status == StepStatus::Done)
                        .unwrap_or(false)
                });
                if !deps_done {
                    return Err(PlanError::InProgressBeforeDependenciesDone(
                        step.id.clone(),
                    ));
                }
            }
        }
        if in_progress_count > 1 {
            return Err(PlanError::MultipleInProgress);
        }
        Ok(())
    }

    /// A step may leave `pending` only once all its dependencies are `done`
    /// (§3 invariant).
    pub fn is_runnable(&self, id: &str) -> bool {
        match self.step(id) {
            Some(step) if step.status == StepStatus::Pending => step
                .dependencies
                .iter()
                .all(|dep| self.step(dep).map(|s| s.status == StepStatus::Done).unwrap_or(false)),
            _ => false,
        }
    }

    pub fn next_runnable(&self) -> Option<&Step> {
        self.steps.iter().find(|s| self.is_runnable(&s.id))
    }

    pub fn all_terminal(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Done | StepStatus::Failed | StepStatus::Skipped))
    }
}
