//! Planner (§4.4): extracts a `PlanDocument` from raw model text and merges
//! a `PlanPatch` into the orchestrator's working `Plan`.
//!
//! JSON extraction is grounded on `deepseek-agent/src/planner/parsing.rs`'s
//! fenced-code-block-or-bare-object extraction (strip a ```json fence if
//! present, else take the first balanced `{...}` span) rather than requiring
//! the whole message to be JSON, since models routinely wrap structured
//! output in prose or markdown fences.
//!
//! The patch merge rules (reject a patch targeting an `in_progress` step;
//! cascade-fail dependents of a removed step) are the two decisions recorded
//! under Open Questions in spec.md §9 and DESIGN.md, not teacher behavior —
//! the teacher's planner only ever emits full plans, never patches.

use taskgraph_core::{PatchChange, PatchOp, Plan, PlanDocument, PlanError, StepStatus};

use crate::util::extract_json_span;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlannerError {
    #[error("no JSON object found in model output")]
    NoJsonFound,
    #[error("model output did not parse as a PlanDocument: {0}")]
    Malformed(String),
    #[error("patch op `{op:?}` is missing a required field: {field}")]
    MissingField { op: PatchOp, field: &'static str },
    #[error("patch targets step `{0}` which is in_progress")]
    TargetsInProgressStep(String),
    #[error("patch references unknown step `{0}`")]
    UnknownStep(String),
    #[error(transparent)]
    Invariant(#[from] PlanError),
}

/// Strips a ```json fence if present, otherwise locates the first balanced
/// `{...}` span in `text` and parses it as a `PlanDocument` (§4.4 parsing
/// protocol: "extract exactly one JSON object from the response").
pub fn parse_plan_document(text: &str) -> Result<PlanDocument, PlannerError> {
    let candidate = extract_json_span(text).ok_or(PlannerError::NoJsonFound)?;
    serde_json::from_str(&candidate).map_err(|e| PlannerError::Malformed(e.to_string()))
}

/// Merges a `PlanPatch`'s changes into `plan` in order, enforcing §4.4's
/// merge semantics before bumping `plan.version` and re-validating.
pub fn apply_patch_document(plan: &mut Plan, changes: Vec<PatchChange>) -> Result<(), PlannerError> {
    for change in changes {
        apply_one_change(plan, change)?;
    }
    plan.version += 1;
    plan.validate()?;
    Ok(())
}

fn apply_one_change(plan: &mut Plan, change: PatchChange) -> Result<(), PlannerError> {
    match change.op {
        PatchOp::Add => {
            let step = change.step.ok_or(PlannerError::MissingField {
                op: PatchOp::Add,
                field: "step",
            })?;
            let insert_at = match &change.after_id {
                None => 0,
                Some(after_id) => {
                    let position = plan
                        .steps
                        .iter()
                        .position(|s| &s.id == after_id)
                        .ok_or_else(|| PlannerError::UnknownStep(after_id.clone()))?;
                    position + 1
                }
            };
            plan.steps.insert(insert_at, step);
        }
        PatchOp::Replace => {
            let step_id = change.step_id.clone().ok_or(PlannerError::MissingField {
                op: PatchOp::Replace,
                field: "step_id",
            })?;
            let new_step = change.step.ok_or(PlannerError::MissingField {
                op: PatchOp::Replace,
                field: "step",
            })?;
            reject_if_in_progress(plan, &step_id)?;
            let slot = plan
                .step_mut(&step_id)
                .ok_or_else(|| PlannerError::UnknownStep(step_id.clone()))?;
            *slot = new_step;
        }
        PatchOp::Remove => {
            let step_id = change.step_id.clone().ok_or(PlannerError::MissingField {
                op: PatchOp::Remove,
                field: "step_id",
            })?;
            // A patch may remove a step that has already failed even though
            // the general rule below would otherwise apply to it — removing
            // a failed step is exactly how a replan clears dead work.
            let status = plan
                .step(&step_id)
                .ok_or_else(|| PlannerError::UnknownStep(step_id.clone()))?
                .status;
            if status == StepStatus::InProgress {
                return Err(PlannerError::TargetsInProgressStep(step_id));
            }
            plan.steps.retain(|s| s.id != step_id);
            cascade_fail_dependents(plan, &step_id);
        }
    }
    Ok(())
}

fn reject_if_in_progress(plan: &Plan, step_id: &str) -> Result<(), PlannerError> {
    match plan.step(step_id) {
        Some(step) if step.status == StepStatus::InProgress => {
            Err(PlannerError::TargetsInProgressStep(step_id.to_string()))
        }
        Some(_) => Ok(()),
        None => Err(PlannerError::UnknownStep(step_id.to_string())),
    }
}

/// Every direct dependent of a removed step becomes `failed` (§4.4 "cascade:
/// dependents of a removed step become failed with a dependency_removed
/// reason"); this is a single-level cascade per change, not transitive —
/// a removed step's dependents-of-dependents only fail if the next replan
/// change removes them too.
fn cascade_fail_dependents(plan: &mut Plan, removed_id: &str) {
    for step in plan.steps.iter_mut() {
        if step.dependencies.iter().any(|d| d == removed_id) {
            step.status = StepStatus::Failed;
            step.failure_reason = Some("dependency_removed".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgraph_core::Step;
    use uuid::Uuid;

    fn step(id: &str, deps: &[&str], status: StepStatus) -> Step {
        Step {
            id: id.to_string(),
            description: format!("do {id}"),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            tools_expected: vec![],
            status,
            failure_reason: None,
        }
    }

    #[test]
    fn parse_plan_document_extracts_fenced_json() {
        let text = "Here is the plan:\n```json\n{\"type\": \"full_plan\", \"title\": \"t\", \"steps\": []}\n```\nDone.";
        let doc = parse_plan_document(text).unwrap();
        assert!(matches!(doc, PlanDocument::FullPlan { .. }));
    }

    #[test]
    fn parse_plan_document_extracts_bare_balanced_object() {
        let text = "sure, {\"type\": \"plan_patch\", \"changes\": []} there you go";
        let doc = parse_plan_document(text).unwrap();
        assert!(matches!(doc, PlanDocument::PlanPatch { .. }));
    }

    #[test]
    fn parse_plan_document_with_no_json_errors() {
        let err = parse_plan_document("no structured output here").unwrap_err();
        assert_eq!(err, PlannerError::NoJsonFound);
    }

    #[test]
    fn replace_on_in_progress_step_is_rejected() {
        let mut plan = Plan::from_full_plan(
            Uuid::now_v7(),
            1,
            "t".to_string(),
            vec![step("a", &[], StepStatus::InProgress)],
        );
        let changes = vec![PatchChange {
            op: PatchOp::Replace,
            after_id: None,
            step_id: Some("a".to_string()),
            step: Some(step("a", &[], StepStatus::Pending)),
        }];
        let err = apply_patch_document(&mut plan, changes).unwrap_err();
        assert_eq!(err, PlannerError::TargetsInProgressStep("a".to_string()));
    }

    #[test]
    fn remove_of_failed_step_cascades_dependent_to_failed() {
        let mut plan = Plan::from_full_plan(
            Uuid::now_v7(),
            1,
            "t".to_string(),
            vec![
                step("a", &[], StepStatus::Failed),
                step("b", &["a"], StepStatus::Pending),
            ],
        );
        let changes = vec![PatchChange {
            op: PatchOp::Remove,
            after_id: None,
            step_id: Some("a".to_string()),
            step: None,
        }];
        apply_patch_document(&mut plan, changes).unwrap();
        assert!(plan.step("a").is_none());
        assert_eq!(plan.step("b").unwrap().status, StepStatus::Failed);
        assert_eq!(plan.step("b").unwrap().failure_reason.as_deref(), Some("dependency_removed"));
    }

    #[test]
    fn add_after_id_inserts_in_the_right_position() {
        let mut plan = Plan::from_full_plan(
            Uuid::now_v7(),
            1,
            "t".to_string(),
            vec![step("a", &[], StepStatus::Done)],
        );
        let changes = vec![PatchChange {
            op: PatchOp::Add,
            after_id: Some("a".to_string()),
            step_id: None,
            step: Some(step("b", &[], StepStatus::Pending)),
        }];
        apply_patch_document(&mut plan, changes).unwrap();
        assert_eq!(plan.steps[1].id, "b");
        assert_eq!(plan.version, 2);
    }
}
