//! Orchestrator / Turn Driver (§4.1): the top-level state machine —
//! `IDLE → CLASSIFYING → ROUTING → (PLANNING | DIRECT) →
//! [WAITING_FOR_APPROVAL] → EXECUTING ↔ REPLANNING → VERIFYING →
//! DONE | BLOCKED | MAX_ITER` — wired around the Classifier/Router,
//! Prompt Composer, Planner, Step Executor and Replanner.
//!
//! Grounded on the teacher's `AgentEngine` (`deepseek-agent/src/engine/`):
//! one long-lived struct owning the LLM client, tool host, config and event
//! sink, with a single public `run_turn`-shaped entry point that threads a
//! trace id through every downstream call for the audit log. The teacher has
//! no explicit classify→plan→execute→replan state machine (it runs one flat
//! tool-use loop); that structure comes from this system's own §4.1-§4.11
//! rather than from the teacher.

use std::cell::RefCell;
use std::time::Duration;

use uuid::Uuid;

use taskgraph_core::{
    is_valid_session_state_transition, AppConfig, ApprovalStatus, Message, Plan, PlanDocument,
    RiskLevel, SessionState, Step, StepStatus, StopReason, TurnOutcome,
};
use taskgraph_errors::ErrorCode;
use taskgraph_llm::LlmClient;
use taskgraph_observe::{EventBus, EventEnvelope, EventKind};
use taskgraph_store::ApprovalStore;
use taskgraph_tools::{default_tool_specs, ApprovalGate, DispatchContext, Dispatcher};

use crate::executor::{StepExecutor, StepExecutorConfig, StepOutcome};
use crate::intent_registry::IntentRegistry;
use crate::planner::{apply_patch_document, parse_plan_document, PlannerError};
use crate::prompt::{compose_system_prompt, stage, PromptProfileRegistry, WorkspaceContext};
use crate::replanner::FailureTracker;
use crate::util::extract_json_span;

/// Moves `state` to `to`, logging (never panicking) if the edge isn't one
/// §4.1's diagram allows — the orchestrator's control flow is the real
/// source of truth, this is a cross-check on it, not a gate in front of it.
fn transition(state: &mut SessionState, to: SessionState) {
    if !is_valid_session_state_transition(*state, to) {
        tracing::warn!(from = ?*state, to = ?to, "unexpected turn state transition");
    }
    *state = to;
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] anyhow::Error),
    #[error(transparent)]
    Intents(#[from] crate::intent_registry::IntentRegistryError),
    #[error(transparent)]
    Prompts(#[from] crate::prompt::PromptRegistryError),
    #[error(transparent)]
    Store(#[from] taskgraph_store::StoreError),
    #[error(transparent)]
    Observe(anyhow::Error),
}

/// Asks a human whether a high/critical-risk call may proceed (§4.7, §4.12).
/// Blocking by design: the approval wait is the system's one unbounded
/// suspension point (§5). The CLI binds this to a terminal prompt; tests
/// bind it to a fixed answer.
pub trait ApprovalPrompt {
    fn ask(&self, risk: RiskLevel, tool_name: &str, summary: &str) -> bool;
}

/// Denies every request without prompting, for headless/non-interactive runs
/// where approval requests should simply surface as `E_APPROVAL_REQUIRED`.
pub struct AutoDenyApprovalPrompt;

impl ApprovalPrompt for AutoDenyApprovalPrompt {
    fn ask(&self, _risk: RiskLevel, _tool_name: &str, _summary: &str) -> bool {
        false
    }
}

/// Turn-scoped record of whether the operator has granted a step-level
/// approval, consulted by the dispatcher's `ApprovalGate` before each call
/// (§4.12 "the orchestrator consults [pending requests] before transitioning
/// out of WAITING_FOR_APPROVAL"). A single turn-wide flag rather than a
/// per-tool map: a step's `ApprovalRequest` is keyed by the step description,
/// not by the tool the model will retry with, so the only correlation the
/// orchestrator can make is "this turn has a standing approval".
struct TurnApprovalGate<'a> {
    store: &'a ApprovalStore,
    approved: RefCell<Option<Uuid>>,
}

impl TurnApprovalGate<'_> {
    fn grant(&self, request_id: Uuid) {
        *self.approved.borrow_mut() = Some(request_id);
    }
}

impl ApprovalGate for TurnApprovalGate<'_> {
    fn status_for(&self, _tool_name: &str, _args: &serde_json::Value) -> Option<ApprovalStatus> {
        let id = (*self.approved.borrow())?;
        self.store.get(id).ok().map(|r| r.status)
    }
}

pub struct Orchestrator {
    workspace_root: std::path::PathBuf,
    config: AppConfig,
    intents: IntentRegistry,
    profiles: PromptProfileRegistry,
    permission_rules: Vec<taskgraph_policy::PermissionRule>,
    llm: Box<dyn LlmClient>,
    events: EventBus,
    approvals: ApprovalStore,
    /// `RefCell` rather than a plain field: every turn-driving method below
    /// borrows `self` immutably (so they can run concurrently with the
    /// `Dispatcher`/`StepExecutor`, which themselves hold shared borrows of
    /// `self.events`/`self.llm` for the turn's duration) and only the
    /// failure counters actually need to change mid-turn.
    failures: RefCell<FailureTracker>,
    approval_prompt: Box<dyn ApprovalPrompt>,
}

impl Orchestrator {
    pub fn new(workspace_root: std::path::PathBuf, llm: Box<dyn LlmClient>) -> Result<Self, OrchestratorError> {
        Self::with_approval_prompt(workspace_root, llm, Box::new(AutoDenyApprovalPrompt))
    }

    pub fn with_approval_prompt(
        workspace_root: std::path::PathBuf,
        llm: Box<dyn LlmClient>,
        approval_prompt: Box<dyn ApprovalPrompt>,
    ) -> Result<Self, OrchestratorError> {
        Self::with_model_override(workspace_root, llm, approval_prompt, None)
    }

    /// Same as [`Self::with_approval_prompt`], but `model_override` — when
    /// given — replaces `config.llm.model` for every chat request this
    /// orchestrator issues, letting a caller (e.g. the CLI's `--model` flag)
    /// pin a model for one invocation without editing the workspace config.
    pub fn with_model_override(
        workspace_root: std::path::PathBuf,
        llm: Box<dyn LlmClient>,
        approval_prompt: Box<dyn ApprovalPrompt>,
        model_override: Option<String>,
    ) -> Result<Self, OrchestratorError> {
        let mut config = AppConfig::ensure(&workspace_root)?;
        if let Some(model) = model_override {
            config.llm.model = model;
        }
        let intents = IntentRegistry::ensure(&workspace_root)?;
        let profiles = PromptProfileRegistry::ensure(&workspace_root)?;
        let permission_rules = taskgraph_policy::load_permission_rules(&workspace_root)?;
        let events = EventBus::new(&workspace_root).map_err(OrchestratorError::Observe)?;
        let approvals = ApprovalStore::new(&workspace_root)?;
        Ok(Self {
            workspace_root,
            config,
            intents,
            profiles,
            permission_rules,
            llm,
            events,
            approvals,
            failures: RefCell::new(FailureTracker::new()),
            approval_prompt,
        })
    }

    /// Runs one turn to completion: classify, route, plan (or answer
    /// directly), execute the plan step by step, replanning on failure, until
    /// a terminal state is reached (§4.1).
    pub fn run_turn(&mut self, user_input: &str, session_id: Uuid, project_id: &str) -> TurnOutcome {
        let trace_id = Uuid::now_v7();
        self.emit(trace_id, session_id, project_id, EventKind::TurnStart, serde_json::json!({"input": user_input}));

        let mut state = SessionState::Idle;
        transition(&mut state, SessionState::Classifying);
        let intent = self.classify(user_input, trace_id, session_id, project_id);
        transition(&mut state, SessionState::Routing);
        self.emit(
            trace_id,
            session_id,
            project_id,
            EventKind::IntentClassified,
            serde_json::json!({"category": intent.category, "mode": intent.mode}),
        );

        let workspace_context = WorkspaceContext {
            cwd: self.workspace_root.display().to_string(),
            git_branch: None,
            os: std::env::consts::OS.to_string(),
        };
        let system_prompt = compose_system_prompt(
            &self.profiles,
            &intent.prompt_profile_ref,
            &self.config.policy,
            &workspace_context,
        );

        if !taskgraph_core::Mode::planning_enabled_for(intent.category) {
            transition(&mut state, SessionState::Direct);
            return self.run_direct(user_input, &system_prompt, trace_id, session_id, project_id);
        }

        if intent.risk_level >= RiskLevel::High {
            transition(&mut state, SessionState::WaitingForApproval);
            let summary = format!("{}: {}", intent.name, user_input);
            if self.request_turn_approval(trace_id, session_id, project_id, intent.risk_level, &intent.name, &summary).is_none() {
                transition(&mut state, SessionState::Blocked);
                self.emit(trace_id, session_id, project_id, EventKind::TurnComplete, serde_json::json!({"stop_reason": "blocked"}));
                return TurnOutcome {
                    trace_id,
                    stop_reason: StopReason::Blocked,
                    last_step_id: None,
                    summary: "Turn denied: high-risk intent was not approved".to_string(),
                };
            }
        }

        transition(&mut state, SessionState::Planning);
        let mut plan = match self.plan_turn(user_input, &system_prompt, trace_id, session_id, project_id) {
            Ok(plan) => plan,
            Err(outcome) => {
                transition(&mut state, SessionState::Blocked);
                return outcome;
            }
        };
        transition(&mut state, SessionState::Executing);
        self.emit(
            trace_id,
            session_id,
            project_id,
            EventKind::PlanGenerated,
            serde_json::json!({"plan_id": plan.plan_id, "steps": plan.steps.len()}),
        );

        let approval_gate = TurnApprovalGate {
            store: &self.approvals,
            approved: RefCell::new(None),
        };
        let dispatcher = Dispatcher::new(
            default_tool_specs(),
            self.config.cache.max_entries,
            Duration::from_secs(self.config.cache.ttl_seconds),
        )
        .with_event_bus(&self.events);
        let dispatch_ctx = DispatchContext {
            workspace_root: self.workspace_root.clone(),
            trace_id,
            session_id,
            project_id: project_id.to_string(),
            risk: intent.risk_level,
            caller_timeout: Some(Duration::from_secs(self.config.limits.tool_timeout_seconds)),
            policy: &self.config.policy,
            permission_rules: &self.permission_rules,
        };
        let executor = StepExecutor::new(
            &*self.llm,
            &dispatcher,
            &approval_gate,
            StepExecutorConfig {
                per_step_iteration_cap: 20,
                total_turn_cap: self.config.limits.max_iterations,
            },
        )
        .with_event_bus(&self.events);

        let mut messages = vec![Message::system(system_prompt.clone())];
        let mut turn_iterations: u32 = 0;
        let mut last_step_id: Option<String> = None;

        loop {
            let Some(step) = plan.next_runnable().cloned() else {
                break;
            };
            last_step_id = Some(step.id.clone());
            plan.step_mut(&step.id).expect("step came from this plan").status = StepStatus::InProgress;

            messages.push(Message::user(stage::execute_step(&step.description)));
            let outcome = executor.run_step(
                &mut messages,
                &self.config.llm.model,
                self.config.llm.temperature,
                Duration::from_secs(self.config.llm.timeout_seconds),
                &dispatch_ctx,
                self.config.observe.compression_level,
                &mut turn_iterations,
            );

            match outcome {
                StepOutcome::Done => {
                    plan.step_mut(&step.id).unwrap().status = StepStatus::Done;
                    self.failures.borrow_mut().record_success(&step.id);
                }
                StepOutcome::TurnCapReached => {
                    transition(&mut state, SessionState::MaxIter);
                    self.emit(trace_id, session_id, project_id, EventKind::TurnComplete, serde_json::json!({"stop_reason": "max_iter"}));
                    return TurnOutcome {
                        trace_id,
                        stop_reason: StopReason::MaxIter,
                        last_step_id,
                        summary: "Turn exceeded its total iteration cap".to_string(),
                    };
                }
                StepOutcome::Replan { reason } => {
                    // The step asked to replan rather than failing outright;
                    // drop it back to `pending` first so the merged patch can
                    // retarget or remove it (`PlanPatch::Replace`/`Remove`
                    // reject an `in_progress` step, and `next_runnable` never
                    // re-picks one either).
                    plan.step_mut(&step.id).unwrap().status = StepStatus::Pending;
                    transition(&mut state, SessionState::Replanning);
                    match self.replan(&mut plan, &step.id, reason.as_deref().unwrap_or("model requested a replan"), &system_prompt, trace_id, session_id, project_id) {
                        ReplanOutcome::Continue => {
                            transition(&mut state, SessionState::Executing);
                            continue;
                        }
                        ReplanOutcome::Blocked(summary) => {
                            transition(&mut state, SessionState::Blocked);
                            self.emit(trace_id, session_id, project_id, EventKind::TurnComplete, serde_json::json!({"stop_reason": "blocked"}));
                            return TurnOutcome { trace_id, stop_reason: StopReason::Blocked, last_step_id, summary };
                        }
                    }
                }
                StepOutcome::Failed { error_code, detail } => {
                    if error_code == ErrorCode::EApprovalRequired {
                        transition(&mut state, SessionState::WaitingForApproval);
                        let granted = self.request_turn_approval(trace_id, session_id, project_id, intent.risk_level, &step.description, &detail);
                        if let Some(request_id) = granted {
                            approval_gate.grant(request_id);
                            plan.step_mut(&step.id).unwrap().status = StepStatus::Pending;
                            transition(&mut state, SessionState::Executing);
                            continue;
                        }
                    }
                    plan.step_mut(&step.id).unwrap().status = StepStatus::Failed;
                    transition(&mut state, SessionState::Replanning);
                    match self.replan(&mut plan, &step.id, &detail, &system_prompt, trace_id, session_id, project_id) {
                        ReplanOutcome::Continue => {
                            transition(&mut state, SessionState::Executing);
                            continue;
                        }
                        ReplanOutcome::Blocked(summary) => {
                            transition(&mut state, SessionState::Blocked);
                            self.emit(trace_id, session_id, project_id, EventKind::TurnComplete, serde_json::json!({"stop_reason": "blocked"}));
                            return TurnOutcome { trace_id, stop_reason: StopReason::Blocked, last_step_id, summary };
                        }
                    }
                }
            }
        }

        let any_failed = plan.steps.iter().any(|s| s.status == StepStatus::Failed);
        if any_failed {
            transition(&mut state, SessionState::Blocked);
            self.emit(trace_id, session_id, project_id, EventKind::TurnComplete, serde_json::json!({"stop_reason": "blocked"}));
            return TurnOutcome {
                trace_id,
                stop_reason: StopReason::Blocked,
                last_step_id,
                summary: format!("Plan `{}` finished with {} step(s)", plan.title, plan.steps.len()),
            };
        }

        transition(&mut state, SessionState::Verifying);
        let (stop_reason, summary) = match self.verify_plan(&plan) {
            Ok(()) => {
                transition(&mut state, SessionState::Done);
                (StopReason::Done, format!("Plan `{}` finished with {} step(s)", plan.title, plan.steps.len()))
            }
            Err(reason) => {
                transition(&mut state, SessionState::Blocked);
                self.emit(
                    trace_id,
                    session_id,
                    project_id,
                    EventKind::ControlSignal,
                    serde_json::json!({"control": "verification_failed", "reason": reason}),
                );
                (StopReason::Blocked, format!("Plan `{}` failed verification: {}", plan.title, reason))
            }
        };
        self.emit(trace_id, session_id, project_id, EventKind::TurnComplete, serde_json::json!({"stop_reason": format!("{stop_reason:?}")}));
        TurnOutcome { trace_id, stop_reason, last_step_id, summary }
    }

    /// Verifier (§4.1 `VERIFYING` phase): re-checks the completed plan's
    /// invariants and confirms every step actually reached `Done` before the
    /// turn is allowed to conclude successfully, rather than trusting the
    /// step loop's bookkeeping at face value.
    fn verify_plan(&self, plan: &Plan) -> Result<(), String> {
        plan.validate().map_err(|e| e.to_string())?;
        if let Some(step) = plan.steps.iter().find(|s| s.status != StepStatus::Done) {
            return Err(format!("step `{}` did not reach `done` (status: {:?})", step.id, step.status));
        }
        Ok(())
    }

    fn run_direct(
        &self,
        user_input: &str,
        system_prompt: &str,
        trace_id: Uuid,
        session_id: Uuid,
        project_id: &str,
    ) -> TurnOutcome {
        let request = taskgraph_llm::ChatRequest {
            messages: vec![Message::system(system_prompt.to_string()), Message::user(user_input.to_string())],
            model: self.config.llm.model.clone(),
            temperature: self.config.llm.temperature,
            max_tokens: None,
            timeout: Duration::from_secs(self.config.llm.timeout_seconds),
        };
        let stop_reason = match self.llm.chat(&request) {
            Ok(response) => {
                self.emit_model_usage(trace_id, session_id, project_id, &response);
                self.emit(trace_id, session_id, project_id, EventKind::TurnComplete, serde_json::json!({"stop_reason": "done"}));
                return TurnOutcome {
                    trace_id,
                    stop_reason: StopReason::Done,
                    last_step_id: None,
                    summary: response.text,
                };
            }
            Err(e) => {
                tracing::warn!(error = %e, "direct-mode chat request failed");
                self.emit(trace_id, session_id, project_id, EventKind::LlmError, serde_json::json!({"error": e.to_string()}));
                StopReason::ProviderFailed
            }
        };
        self.emit(trace_id, session_id, project_id, EventKind::TurnComplete, serde_json::json!({"stop_reason": "provider_failed"}));
        TurnOutcome {
            trace_id,
            stop_reason,
            last_step_id: None,
            summary: "The provider could not be reached".to_string(),
        }
    }

    /// Router-first classification (§4.2): keyword-rule match against the
    /// Intent Registry; on a total miss, ask the model for a strict
    /// `{category, reason, confidence}` JSON object, retrying once on parse
    /// failure before falling back to `uncertain`.
    fn classify(&self, user_input: &str, trace_id: Uuid, session_id: Uuid, project_id: &str) -> taskgraph_core::IntentMatch {
        let keyword_match = self.intents.classify(user_input, taskgraph_core::Mode::Split);
        if keyword_match.category != taskgraph_core::IntentCategory::Uncertain {
            return keyword_match;
        }

        match self.classify_via_llm(user_input, trace_id, session_id, project_id) {
            Some(category) => self.match_for_category(category),
            None => keyword_match,
        }
    }

    /// Maps a classifier-decided category straight to its registry rule,
    /// bypassing keyword scoring (§4.2 "Router ... on [keyword] miss, maps
    /// the classifier category to a default profile").
    fn match_for_category(&self, category: taskgraph_core::IntentCategory) -> taskgraph_core::IntentMatch {
        let rule = self
            .intents
            .rules
            .iter()
            .find(|r| r.category == category)
            .unwrap_or_else(|| {
                self.intents
                    .rules
                    .iter()
                    .find(|r| r.category == taskgraph_core::IntentCategory::Uncertain)
                    .expect("defaults always carry an uncertain rule")
            });
        let mode = if taskgraph_core::Mode::planning_enabled_for(rule.category) {
            taskgraph_core::Mode::Split
        } else {
            taskgraph_core::Mode::Unified
        };
        taskgraph_core::IntentMatch::new(
            rule.category,
            rule.category.as_str(),
            rule.risk_level,
            rule.tools.clone(),
            rule.prompt_profile_ref.clone(),
            mode,
        )
    }

    fn classify_via_llm(
        &self,
        user_input: &str,
        trace_id: Uuid,
        session_id: Uuid,
        project_id: &str,
    ) -> Option<taskgraph_core::IntentCategory> {
        let prompt = format!(
            "Classify this request into exactly one category and respond with a single JSON object \
             {{\"category\": ..., \"reason\": ..., \"confidence\": ...}}. Request: {user_input}"
        );
        for _ in 0..2 {
            let request = taskgraph_llm::ChatRequest {
                messages: vec![Message::user(prompt.clone())],
                model: self.config.llm.model.clone(),
                temperature: 0.0,
                max_tokens: None,
                timeout: Duration::from_secs(self.config.llm.timeout_seconds),
            };
            let response = match self.llm.chat(&request) {
                Ok(r) => r,
                Err(e) => {
                    self.emit(
                        trace_id,
                        session_id,
                        project_id,
                        EventKind::LlmError,
                        serde_json::json!({"error": e.to_string(), "stage": "classify"}),
                    );
                    return None;
                }
            };
            self.emit_model_usage(trace_id, session_id, project_id, &response);
            if let Some(span) = extract_json_span(&response.text) {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&span) {
                    if let Some(category) = value.get("category").and_then(|c| c.as_str()) {
                        if let Ok(parsed) = serde_json::from_value::<taskgraph_core::IntentCategory>(serde_json::json!(category)) {
                            return Some(parsed);
                        }
                    }
                }
            }
        }
        None
    }

    /// Planner (§4.4): requests a `FullPlan`, retrying once with the parse
    /// error quoted back to the model, then falling back to tool-call-to-plan
    /// coercion before surfacing `E_PLAN_PARSE`.
    fn plan_turn(
        &self,
        user_input: &str,
        system_prompt: &str,
        trace_id: Uuid,
        session_id: Uuid,
        project_id: &str,
    ) -> Result<Plan, TurnOutcome> {
        let mut messages = vec![Message::system(system_prompt.to_string()), Message::user(stage::planning(user_input))];
        let mut last_error: Option<String> = None;

        for attempt in 0..2 {
            if attempt == 1 {
                if let Some(err) = &last_error {
                    messages.push(Message::user(format!(
                        "Your previous output did not parse as a plan document: {err}. Return exactly one JSON object."
                    )));
                }
            }
            let request = taskgraph_llm::ChatRequest {
                messages: messages.clone(),
                model: self.config.llm.model.clone(),
                temperature: self.config.llm.temperature,
                max_tokens: None,
                timeout: Duration::from_secs(self.config.llm.timeout_seconds),
            };
            let response = match self.llm.chat(&request) {
                Ok(r) => r,
                Err(e) => {
                    self.emit(trace_id, session_id, project_id, EventKind::LlmError, serde_json::json!({"error": e.to_string()}));
                    self.emit(trace_id, session_id, project_id, EventKind::TurnComplete, serde_json::json!({"stop_reason": "provider_failed"}));
                    return Err(TurnOutcome {
                        trace_id,
                        stop_reason: StopReason::ProviderFailed,
                        last_step_id: None,
                        summary: e.to_string(),
                    })
                }
            };
            self.emit_model_usage(trace_id, session_id, project_id, &response);
            match parse_plan_document(&response.text) {
                Ok(PlanDocument::FullPlan { title, steps }) => {
                    let plan = Plan::new(title, steps);
                    if plan.validate().is_ok() {
                        return Ok(plan);
                    }
                    last_error = Some("plan failed invariant validation".to_string());
                }
                Ok(PlanDocument::PlanPatch { .. }) => {
                    last_error = Some("expected a full_plan, got a plan_patch".to_string());
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                    if let PlannerError::NoJsonFound = e {
                        if let Some(call) = extract_json_span(&response.text)
                            .and_then(|span| serde_json::from_str::<taskgraph_core::ToolCall>(&span).ok())
                        {
                            let step = taskgraph_core::Step {
                                id: "step-1".to_string(),
                                description: format!("Call tool `{}`", call.tool),
                                dependencies: vec![],
                                tools_expected: vec![call.tool],
                                status: StepStatus::Pending,
                            };
                            return Ok(Plan::new("coerced single-tool plan", vec![step]));
                        }
                    }
                }
            }
        }

        self.emit(trace_id, session_id, project_id, EventKind::TurnComplete, serde_json::json!({"stop_reason": "blocked", "error": "E_PLAN_PARSE"}));
        Err(TurnOutcome {
            trace_id,
            stop_reason: StopReason::Blocked,
            last_step_id: None,
            summary: format!("Could not parse a plan from the model's output: {}", last_error.unwrap_or_default()),
        })
    }

    /// Replanner (§4.11): asks for a `PlanPatch` targeting the failed step,
    /// merges it, and escalates to `Blocked` after three consecutive failed
    /// replans on the same step id.
    fn replan(
        &self,
        plan: &mut Plan,
        failed_step_id: &str,
        reason: &str,
        system_prompt: &str,
        trace_id: Uuid,
        session_id: Uuid,
        project_id: &str,
    ) -> ReplanOutcome {
        let request = taskgraph_llm::ChatRequest {
            messages: vec![
                Message::system(system_prompt.to_string()),
                Message::user(stage::replan(reason, failed_step_id)),
            ],
            model: self.config.llm.model.clone(),
            temperature: self.config.llm.temperature,
            max_tokens: None,
            timeout: Duration::from_secs(self.config.llm.timeout_seconds),
        };

        let merged: Result<(), (String, Option<ErrorCode>)> = match self.llm.chat(&request) {
            Ok(response) => {
                self.emit_model_usage(trace_id, session_id, project_id, &response);
                match parse_plan_document(&response.text) {
                    Ok(PlanDocument::PlanPatch { changes }) => apply_patch_document(plan, changes).map_err(|e| {
                        let code = match &e {
                            PlannerError::TargetsInProgressStep(_) => Some(ErrorCode::EConflict),
                            _ => None,
                        };
                        (e.to_string(), code)
                    }),
                    Ok(PlanDocument::FullPlan { title, steps }) => {
                        *plan = Plan::from_full_plan(plan.plan_id, plan.version + 1, title, steps);
                        plan.validate().map_err(|e| (e.to_string(), None))
                    }
                    Err(e) => Err((e.to_string(), None)),
                }
            }
            Err(e) => {
                self.emit(trace_id, session_id, project_id, EventKind::LlmError, serde_json::json!({"error": e.to_string()}));
                Err((e.to_string(), None))
            }
        };

        match merged {
            Ok(()) => {
                self.emit(trace_id, session_id, project_id, EventKind::PlanGenerated, serde_json::json!({"plan_id": plan.plan_id, "replanned": true}));
                ReplanOutcome::Continue
            }
            Err((failure_reason, error_code)) => {
                if let Some(code) = error_code {
                    self.emit(
                        trace_id,
                        session_id,
                        project_id,
                        EventKind::ControlSignal,
                        serde_json::json!({"control": "plan_patch_rejected", "error_code": code.as_str(), "step_id": failed_step_id, "reason": failure_reason}),
                    );
                }
                match self.failures.borrow_mut().record_failure(failed_step_id, &failure_reason) {
                    Some(escalation) => ReplanOutcome::Blocked(format!(
                        "Step `{}` failed {} consecutive replans: {}",
                        escalation.step_id, escalation.consecutive_failures, escalation.reason
                    )),
                    None => ReplanOutcome::Continue,
                }
            }
        }
    }

    /// Creates and decides one `ApprovalRequest`, returning its id when the
    /// operator approves so the caller can stand up a `TurnApprovalGate`
    /// grant for the retried call.
    fn request_turn_approval(
        &self,
        trace_id: Uuid,
        session_id: Uuid,
        project_id: &str,
        risk: RiskLevel,
        tool_name: &str,
        summary: &str,
    ) -> Option<Uuid> {
        let Ok(request) = self.approvals.create(trace_id, risk, tool_name, summary) else {
            return None;
        };
        self.emit(
            trace_id,
            session_id,
            project_id,
            EventKind::ApprovalRequired,
            serde_json::json!({"request_id": request.id, "risk_level": risk, "tool_name": tool_name, "summary": summary}),
        );
        let approved = self.approval_prompt.ask(risk, tool_name, summary);
        if approved {
            let _ = self.approvals.approve(request.id, "operator", None);
            Some(request.id)
        } else {
            let _ = self.approvals.reject(request.id, "operator", None);
            None
        }
    }

    fn emit(&self, trace_id: Uuid, session_id: Uuid, project_id: &str, kind: EventKind, data: serde_json::Value) {
        let event = EventEnvelope::new(trace_id, session_id, project_id.to_string(), kind, data);
        let _ = self.events.publish(&event);
    }

    /// Emits the `model_selected`/`usage_updated` pair that accompanies every
    /// successful completion (§6's open "model" parameter; teacher always
    /// logs both next to an LLM call).
    fn emit_model_usage(
        &self,
        trace_id: Uuid,
        session_id: Uuid,
        project_id: &str,
        response: &taskgraph_llm::ChatResponse,
    ) {
        self.emit(
            trace_id,
            session_id,
            project_id,
            EventKind::ModelSelected,
            serde_json::json!({"model": response.model}),
        );
        self.emit(
            trace_id,
            session_id,
            project_id,
            EventKind::UsageUpdated,
            serde_json::json!({
                "prompt_tokens": response.usage.prompt_tokens,
                "completion_tokens": response.usage.completion_tokens,
                "total_tokens": response.usage.total_tokens,
            }),
        );
    }
}

enum ReplanOutcome {
    Continue,
    Blocked(String),
}
