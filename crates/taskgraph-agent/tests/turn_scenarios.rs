//! End-to-end turn scenarios driving `Orchestrator::run_turn` against a
//! scripted model, covering the classify→plan→execute→replan state machine
//! and its audit trail.
//!
//! Grounded on the teacher's `ScriptedToolLlm` pattern
//! (`deepseek-agent/tests/tool_use_default.rs`): a queue of canned responses
//! behind a `Mutex`, popped one per `chat()` call, with small builder
//! functions for the three response shapes this system's protocol actually
//! uses (`full_plan`/`plan_patch` documents, bare tool calls, control
//! envelopes) instead of the teacher's provider-specific tool-call wire
//! shape.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use taskgraph_agent::{ApprovalPrompt, IntentRegistry, IntentRule, Orchestrator};
use taskgraph_core::{runtime_dir, ApprovalMode, IntentCategory, RiskLevel, StopReason};
use taskgraph_llm::{ChatRequest, ChatResponse, LlmClient, LlmError, Usage};
use uuid::Uuid;

struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
}

impl ScriptedLlm {
    fn new(responses: Vec<Result<ChatResponse, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from(responses)),
        }
    }
}

impl LlmClient for ScriptedLlm {
    fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Malformed("scripted llm exhausted".to_string())))
    }
}

fn text(body: impl Into<String>) -> Result<ChatResponse, LlmError> {
    Ok(ChatResponse {
        text: body.into(),
        usage: Usage { prompt_tokens: 120, completion_tokens: 40, total_tokens: 160 },
        model: "scripted-model".to_string(),
    })
}

fn tool_call(tool: &str, args: serde_json::Value) -> Result<ChatResponse, LlmError> {
    text(serde_json::json!({"tool": tool, "args": args}).to_string())
}

fn step_done() -> Result<ChatResponse, LlmError> {
    text(r#"{"control": "step_done"}"#)
}

fn replan_signal(reason: &str) -> Result<ChatResponse, LlmError> {
    text(serde_json::json!({"control": "replan", "reason": reason}).to_string())
}

/// A lone approval answer fixed at construction time, for scenarios that
/// drive `WAITING_FOR_APPROVAL` deterministically rather than through a
/// terminal prompt.
struct FixedApproval(bool);

impl ApprovalPrompt for FixedApproval {
    fn ask(&self, _risk: RiskLevel, _tool_name: &str, _summary: &str) -> bool {
        self.0
    }
}

fn set_approve_writes_never(workspace: &Path) {
    let mut config = taskgraph_core::AppConfig::default();
    config.policy.approve_writes = ApprovalMode::Never;
    config.save(workspace).unwrap();
}

/// Adds a high-risk rule on top of the built-in defaults so a turn-level
/// approval scenario doesn't need a custom `IntentCategory`.
fn add_high_risk_rule(workspace: &Path, keyword: &str) {
    let mut registry = IntentRegistry::defaults();
    registry.rules.push(IntentRule {
        category: IntentCategory::CodingTask,
        keywords: vec![keyword.to_string()],
        risk_level: RiskLevel::High,
        prompt_profile_ref: "coding_task".to_string(),
        tools: vec!["write".to_string()],
    });
    let path = IntentRegistry::path(workspace);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, serde_yaml::to_string(&registry).unwrap()).unwrap();
}

fn audit_events(workspace: &Path) -> Vec<serde_json::Value> {
    let raw = std::fs::read_to_string(runtime_dir(workspace).join("audit.log")).unwrap_or_default();
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("audit line is valid JSON"))
        .collect()
}

fn kinds_matching(events: &[serde_json::Value], kind: &str) -> Vec<serde_json::Value> {
    events
        .iter()
        .filter(|e| e.get("kind").and_then(|k| k.as_str()) == Some(kind))
        .cloned()
        .collect()
}

/// Scenario 1: a read-only query resolves in one step with one tool call and
/// no writes.
#[test]
fn read_only_query_dispatches_one_tool_and_finishes_done() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/a.rs"), "fn main() {}\n").unwrap();

    let llm = Box::new(ScriptedLlm::new(vec![
        text(
            serde_json::json!({
                "type": "full_plan",
                "title": "describe src layout",
                "steps": [{
                    "id": "step-1",
                    "description": "enumerate files under src",
                    "dependencies": [],
                    "tools_expected": ["list_dir"],
                    "status": "pending",
                }],
            })
            .to_string(),
        ),
        tool_call("list_dir", serde_json::json!({"path": "src"})),
        step_done(),
    ]));

    let mut orch = Orchestrator::new(dir.path().to_path_buf(), llm).unwrap();
    let outcome = orch.run_turn("explain how this project is organized", Uuid::now_v7(), "proj");

    assert_eq!(outcome.stop_reason, StopReason::Done);
    let events = audit_events(dir.path());
    assert_eq!(kinds_matching(&events, "tool_call_started").len(), 1);
    let finished = kinds_matching(&events, "tool_call_finished");
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0]["data"]["tool"], "list_dir");
    assert!(kinds_matching(&events, "approval_required").is_empty());
}

/// Scenario 2: a write step followed by a dependent verify step, both
/// dispatched and the turn finishing `done`.
#[test]
fn modify_then_verify_runs_both_steps_in_dependency_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.py"), "def foo():\n    pass\n").unwrap();
    set_approve_writes_never(dir.path());

    let llm = Box::new(ScriptedLlm::new(vec![
        text(
            serde_json::json!({
                "type": "full_plan",
                "title": "add a docstring",
                "steps": [
                    {
                        "id": "step-1",
                        "description": "write the docstring into a.py",
                        "dependencies": [],
                        "tools_expected": ["write_file"],
                        "status": "pending",
                    },
                    {
                        "id": "step-2",
                        "description": "read a.py back to confirm the edit applied",
                        "dependencies": ["step-1"],
                        "tools_expected": ["read_file"],
                        "status": "pending",
                    },
                ],
            })
            .to_string(),
        ),
        tool_call("write_file", serde_json::json!({"path": "a.py", "contents": "def foo():\n    \"\"\"doc\"\"\"\n    pass\n"})),
        step_done(),
        tool_call("read_file", serde_json::json!({"path": "a.py"})),
        step_done(),
    ]));

    let mut orch = Orchestrator::new(dir.path().to_path_buf(), llm).unwrap();
    let outcome = orch.run_turn("fix the bug in a.py", Uuid::now_v7(), "proj");

    assert_eq!(outcome.stop_reason, StopReason::Done);
    let contents = std::fs::read_to_string(dir.path().join("a.py")).unwrap();
    assert!(contents.contains("doc"));
    let finished = kinds_matching(&audit_events(dir.path()), "tool_call_finished");
    assert_eq!(finished.len(), 2);
    assert_eq!(finished[0]["data"]["tool"], "write_file");
    assert_eq!(finished[1]["data"]["tool"], "read_file");
}

/// Scenario 3: a patch conflict triggers a model-requested replan; the
/// replanned step keeps its id so the dependent step's reference still
/// resolves, and the dependent step still runs afterward.
#[test]
fn patch_conflict_triggers_replan_and_later_steps_still_run() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("auth.py"), "def login():\n    pass\n").unwrap();
    set_approve_writes_never(dir.path());

    let llm = Box::new(ScriptedLlm::new(vec![
        // plan_turn
        text(
            serde_json::json!({
                "type": "full_plan",
                "title": "restructure auth",
                "steps": [
                    {
                        "id": "step-1",
                        "description": "patch auth.py",
                        "dependencies": [],
                        "tools_expected": ["apply_patch"],
                        "status": "pending",
                    },
                    {
                        "id": "step-2",
                        "description": "re-read auth.py to confirm the patch landed",
                        "dependencies": ["step-1"],
                        "tools_expected": ["read_file"],
                        "status": "pending",
                    },
                ],
            })
            .to_string(),
        ),
        // step-1, attempt 1: stale context, dispatch returns e_conflict
        tool_call(
            "apply_patch",
            serde_json::json!({
                "path": "auth.py",
                "hunks": [{"before": "def old_login():", "after": "def old_login():\n    pass  # reviewed\n"}],
            }),
        ),
        replan_signal("patch context not found, file must have changed underneath"),
        // replan: replace step-1 in place (same id, so step-2's dependency still resolves)
        text(
            serde_json::json!({
                "type": "plan_patch",
                "changes": [{
                    "op": "replace",
                    "step_id": "step-1",
                    "step": {
                        "id": "step-1",
                        "description": "re-read auth.py then regenerate and apply the patch",
                        "dependencies": [],
                        "tools_expected": ["read_file", "apply_patch"],
                        "status": "pending",
                    },
                }],
            })
            .to_string(),
        ),
        // step-1, attempt 2
        tool_call("read_file", serde_json::json!({"path": "auth.py"})),
        tool_call(
            "apply_patch",
            serde_json::json!({
                "path": "auth.py",
                "hunks": [{"before": "def login():", "after": "def login():\n    pass  # reviewed\n"}],
            }),
        ),
        step_done(),
        // step-2
        tool_call("read_file", serde_json::json!({"path": "auth.py"})),
        step_done(),
    ]));

    let mut orch = Orchestrator::new(dir.path().to_path_buf(), llm).unwrap();
    let outcome = orch.run_turn("restructure the auth module", Uuid::now_v7(), "proj");

    assert_eq!(outcome.stop_reason, StopReason::Done);
    let contents = std::fs::read_to_string(dir.path().join("auth.py")).unwrap();
    assert!(contents.contains("reviewed"));

    let events = audit_events(dir.path());
    let replanned = kinds_matching(&events, "plan_generated");
    assert!(replanned.iter().any(|e| e["data"]["replanned"] == true));
    let finished = kinds_matching(&events, "tool_call_finished");
    assert_eq!(finished.iter().filter(|e| e["data"]["tool"] == "apply_patch").count(), 2);
    assert_eq!(finished.iter().filter(|e| e["data"]["tool"] == "read_file").count(), 2);
}

/// Scenario 4: three identical tool calls trip the stutter detector, which
/// surfaces a `control_signal` event and forces a replan that swaps in a
/// differently-shaped step.
#[test]
fn repeated_identical_tool_call_triggers_stutter_replan() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.rs"), "// TODO: fix this\nfn main() {}\n").unwrap();
    set_approve_writes_never(dir.path());

    let grep_args = serde_json::json!({"pattern": "TODO"});
    let llm = Box::new(ScriptedLlm::new(vec![
        text(
            serde_json::json!({
                "type": "full_plan",
                "title": "find TODOs",
                "steps": [{
                    "id": "step-1",
                    "description": "find leftover TODO markers",
                    "dependencies": [],
                    "tools_expected": ["grep"],
                    "status": "pending",
                }],
            })
            .to_string(),
        ),
        tool_call("grep", grep_args.clone()),
        tool_call("grep", grep_args.clone()),
        tool_call("grep", grep_args),
        // replan after E_STUTTERING
        text(
            serde_json::json!({
                "type": "plan_patch",
                "changes": [{
                    "op": "replace",
                    "step_id": "step-1",
                    "step": {
                        "id": "step-1",
                        "description": "glob for source files, then grep once across them",
                        "dependencies": [],
                        "tools_expected": ["glob", "grep"],
                        "status": "pending",
                    },
                }],
            })
            .to_string(),
        ),
        tool_call("glob", serde_json::json!({"pattern": "**/*.rs"})),
        step_done(),
    ]));

    let mut orch = Orchestrator::new(dir.path().to_path_buf(), llm).unwrap();
    let outcome = orch.run_turn("explain where the TODOs are in this repo", Uuid::now_v7(), "proj");

    assert_eq!(outcome.stop_reason, StopReason::Done);
    let events = audit_events(dir.path());
    let stutter_signal = kinds_matching(&events, "control_signal")
        .into_iter()
        .find(|e| e["data"]["reason"] == "stuttering");
    assert!(stutter_signal.is_some(), "expected a control_signal event flagging stuttering");
    assert_eq!(kinds_matching(&events, "tool_call_finished").iter().filter(|e| e["data"]["tool"] == "grep").count(), 2);
}

/// Scenario 5: a high-risk intent suspends the turn for approval before any
/// plan is produced; a rejection leaves the workspace untouched and an
/// approval leads to the step eventually executing.
#[test]
fn high_risk_intent_denied_blocks_before_any_plan_or_write() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.yaml"), "version: 1\n").unwrap();
    add_high_risk_rule(dir.path(), "delete");

    let llm = Box::new(ScriptedLlm::new(vec![]));
    let mut orch = Orchestrator::with_approval_prompt(dir.path().to_path_buf(), llm, Box::new(FixedApproval(false))).unwrap();
    let outcome = orch.run_turn("delete config.yaml", Uuid::now_v7(), "proj");

    assert_eq!(outcome.stop_reason, StopReason::Blocked);
    assert_eq!(std::fs::read_to_string(dir.path().join("config.yaml")).unwrap(), "version: 1\n");

    let events = audit_events(dir.path());
    assert_eq!(kinds_matching(&events, "approval_required").len(), 1);
    assert!(kinds_matching(&events, "plan_generated").is_empty());
    assert!(kinds_matching(&events, "tool_call_started").is_empty());
}

#[test]
fn high_risk_intent_approved_proceeds_through_plan_and_execute() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.yaml"), "version: 1\n").unwrap();
    add_high_risk_rule(dir.path(), "delete");

    let llm = Box::new(ScriptedLlm::new(vec![
        text(
            serde_json::json!({
                "type": "full_plan",
                "title": "clear config.yaml",
                "steps": [{
                    "id": "step-1",
                    "description": "empty out config.yaml",
                    "dependencies": [],
                    "tools_expected": ["write_file"],
                    "status": "pending",
                }],
            })
            .to_string(),
        ),
        // attempt 1: dispatched before any per-call approval is on file, so
        // the dispatcher's own risk gate denies it
        tool_call("write_file", serde_json::json!({"path": "config.yaml", "contents": ""})),
        // attempt 2: after the step-level approval is granted
        tool_call("write_file", serde_json::json!({"path": "config.yaml", "contents": ""})),
        step_done(),
    ]));

    let mut orch = Orchestrator::with_approval_prompt(dir.path().to_path_buf(), llm, Box::new(FixedApproval(true))).unwrap();
    let outcome = orch.run_turn("delete config.yaml", Uuid::now_v7(), "proj");

    assert_eq!(outcome.stop_reason, StopReason::Done);
    assert_eq!(std::fs::read_to_string(dir.path().join("config.yaml")).unwrap(), "");

    let events = audit_events(dir.path());
    let approvals = kinds_matching(&events, "approval_required");
    assert_eq!(approvals.len(), 2, "one turn-level approval plus one step-level retry approval");
    let first_approval_index = events.iter().position(|e| e["kind"] == "approval_required").unwrap();
    let first_write_index = events
        .iter()
        .position(|e| e["kind"] == "tool_call_started" && e["data"]["tool"] == "write_file")
        .unwrap();
    assert!(first_approval_index < first_write_index, "approval_required must precede any write");
}

/// Scenario 6: a transport failure during planning ends the turn
/// immediately with `provider_failed`, and the audit log records exactly
/// one `llm_error` for that call — the orchestrator does not retry a failed
/// top-level `chat()` in-band (only `HttpLlmClient`'s internal, unobserved
/// HTTP retry does, which this scripted client bypasses entirely).
#[test]
fn provider_timeout_ends_turn_immediately_with_one_llm_error() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Box::new(ScriptedLlm::new(vec![Err(LlmError::Timeout)]));

    let mut orch = Orchestrator::new(dir.path().to_path_buf(), llm).unwrap();
    let outcome = orch.run_turn("fix the crash in the parser", Uuid::now_v7(), "proj");

    assert_eq!(outcome.stop_reason, StopReason::ProviderFailed);
    let events = audit_events(dir.path());
    assert_eq!(kinds_matching(&events, "llm_error").len(), 1);
    assert!(kinds_matching(&events, "plan_generated").is_empty());
    assert!(kinds_matching(&events, "tool_call_started").is_empty());
}
