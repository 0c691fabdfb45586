//! Step Executor (§4.5): drives a single `Step` through a think→act→observe
//! loop until it reports `step_done`, asks to `replan`, or exhausts one of
//! the three hard limits (per-step iteration cap, stutter detector, total
//! turn cap).
//!
//! Grounded on the teacher's tool-use conversation loop
//! (`deepseek-agent/src/tool_loop.rs`): request completion, parse the
//! response, dispatch any tool call, append both call and result to the
//! message log, loop — narrowed from the teacher's free-form
//! text-or-tool-calls response shape to this system's three-way parse order
//! (`ControlEnvelope` / `ToolCall` / legacy string token) from §4.5.

use serde_json::Value;
use taskgraph_core::{ControlEnvelope, Message, ToolCall};
use taskgraph_errors::ErrorCode;
use taskgraph_llm::{ChatRequest, ChatResponse, LlmClient, LlmError};
use taskgraph_observe::{EventBus, EventEnvelope, EventKind};
use taskgraph_tools::{ApprovalGate, DispatchContext, Dispatcher};

use crate::feedback::FeedbackShaper;
use crate::stutter::StutterTracker;
use crate::util::extract_json_span;

const INVALID_OUTPUT_LIMIT: u32 = 3;

/// Why a step stopped, handed back to the orchestrator to decide the next
/// state transition (§4.1).
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Done,
    Replan { reason: Option<String> },
    Failed { error_code: ErrorCode, detail: String },
    /// The total-turn cap (across every step in the turn) was hit mid-step;
    /// the orchestrator must stop the whole turn with `MaxIter`.
    TurnCapReached,
}

/// One parsed step-executor response (§4.5 step 3's parse order).
#[derive(Debug, Clone, PartialEq)]
enum ParsedStepOutput {
    Control(ControlEnvelope),
    Tool(ToolCall),
}

/// Parses model text in the order §4.5 specifies: a structured
/// `ControlEnvelope`, then a bare `ToolCall`, then the legacy string tokens
/// `STEP_DONE` / `REPLAN` (each logged as a warning since they're a
/// backward-compatible fallback, not the primary protocol).
fn parse_step_output(text: &str) -> Option<ParsedStepOutput> {
    if let Some(span) = extract_json_span(text) {
        if let Ok(envelope) = serde_json::from_str::<ControlEnvelope>(&span) {
            return Some(ParsedStepOutput::Control(envelope));
        }
        if let Ok(call) = serde_json::from_str::<ToolCall>(&span) {
            if !call.tool.is_empty() {
                return Some(ParsedStepOutput::Tool(call));
            }
        }
    }

    let trimmed = text.trim();
    if trimmed == "STEP_DONE" {
        tracing::warn!("model emitted legacy STEP_DONE token instead of a control envelope");
        return Some(ParsedStepOutput::Control(ControlEnvelope::StepDone));
    }
    if trimmed == "REPLAN" || trimmed.starts_with("REPLAN ") {
        tracing::warn!("model emitted legacy REPLAN token instead of a control envelope");
        let reason = trimmed.strip_prefix("REPLAN ").map(|s| s.trim().to_string());
        return Some(ParsedStepOutput::Control(ControlEnvelope::Replan { reason }));
    }

    None
}

pub struct StepExecutorConfig {
    pub per_step_iteration_cap: u32,
    pub total_turn_cap: u32,
}

/// Drives one step's loop. Holds the pieces the loop needs on every
/// iteration; the caller owns the conversation `messages` log and the
/// running `turn_iterations` counter so state survives across steps within
/// one turn (§4.5 "total-turn cap" spans every step, not just one).
pub struct StepExecutor<'a> {
    llm: &'a dyn LlmClient,
    dispatcher: &'a Dispatcher<'a>,
    approvals: &'a dyn ApprovalGate,
    events: Option<&'a EventBus>,
    config: StepExecutorConfig,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        llm: &'a dyn LlmClient,
        dispatcher: &'a Dispatcher<'a>,
        approvals: &'a dyn ApprovalGate,
        config: StepExecutorConfig,
    ) -> Self {
        Self {
            llm,
            dispatcher,
            approvals,
            events: None,
            config,
        }
    }

    pub fn with_event_bus(mut self, bus: &'a EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Runs the loop for one step. `messages` is the in-progress conversation
    /// (system + role prompts already appended by the caller); it is mutated
    /// in place so the orchestrator can hand it straight to the next step or
    /// to a replan prompt. `turn_iterations` is incremented on every LLM
    /// round trip and checked against the total-turn cap before each request.
    pub fn run_step(
        &self,
        messages: &mut Vec<Message>,
        chat_model: &str,
        chat_temperature: f32,
        chat_timeout: std::time::Duration,
        dispatch_ctx: &DispatchContext<'_>,
        compression: taskgraph_core::CompressionLevel,
        turn_iterations: &mut u32,
    ) -> StepOutcome {
        let mut stutter = StutterTracker::new(8, 3);
        let mut invalid_output_count: u32 = 0;

        for _ in 0..self.config.per_step_iteration_cap {
            if *turn_iterations >= self.config.total_turn_cap {
                return StepOutcome::TurnCapReached;
            }
            *turn_iterations += 1;

            let response = match self.request_completion(messages, chat_model, chat_temperature, chat_timeout) {
                Ok(r) => r,
                Err(e) => {
                    self.emit(dispatch_ctx, EventKind::LlmError, serde_json::json!({"error": e.to_string()}));
                    return StepOutcome::Failed {
                        error_code: ErrorCode::EProviderFailed,
                        detail: e.to_string(),
                    }
                }
            };
            self.emit(dispatch_ctx, EventKind::ModelSelected, serde_json::json!({"model": response.model}));
            self.emit(
                dispatch_ctx,
                EventKind::UsageUpdated,
                serde_json::json!({
                    "prompt_tokens": response.usage.prompt_tokens,
                    "completion_tokens": response.usage.completion_tokens,
                    "total_tokens": response.usage.total_tokens,
                }),
            );
            messages.push(Message::assistant(response.text.clone()));

            match parse_step_output(&response.text) {
                Some(ParsedStepOutput::Control(ControlEnvelope::StepDone)) => {
                    self.emit(dispatch_ctx, EventKind::ControlSignal, serde_json::json!({"control": "step_done"}));
                    return StepOutcome::Done;
                }
                Some(ParsedStepOutput::Control(ControlEnvelope::Replan { reason })) => {
                    self.emit(
                        dispatch_ctx,
                        EventKind::ControlSignal,
                        serde_json::json!({"control": "replan", "reason": reason}),
                    );
                    return StepOutcome::Replan { reason };
                }
                Some(ParsedStepOutput::Tool(call)) => {
                    if stutter.record(&call.tool, &call.args) {
                        self.emit(
                            dispatch_ctx,
                            EventKind::ControlSignal,
                            serde_json::json!({"control": "stuttering", "reason": "stuttering", "tool": call.tool}),
                        );
                        return StepOutcome::Failed {
                            error_code: ErrorCode::EStuttering,
                            detail: format!("tool `{}` called repeatedly with unchanged arguments", call.tool),
                        };
                    }

                    let result = self.dispatcher.dispatch(&call.tool, call.args.clone(), dispatch_ctx, self.approvals);
                    let feedback = FeedbackShaper::shape(&result.payload, result.ok, compression);
                    messages.push(Message::tool(format!(
                        "tool `{}` {}: {}",
                        call.tool,
                        if result.ok { "succeeded" } else { "failed" },
                        feedback
                    )));

                    if !result.ok {
                        if let Some(code) = result.error_code.as_deref() {
                            if code == ErrorCode::EApprovalRequired.as_str() {
                                return StepOutcome::Failed {
                                    error_code: ErrorCode::EApprovalRequired,
                                    detail: format!("tool `{}` requires approval", call.tool),
                                };
                            }
                        }
                    }
                }
                None => {
                    invalid_output_count += 1;
                    if invalid_output_count >= INVALID_OUTPUT_LIMIT {
                        return StepOutcome::Failed {
                            error_code: ErrorCode::EInvalidOutput,
                            detail: "model output did not parse as a control envelope, tool call, or legacy token after 3 attempts".to_string(),
                        };
                    }
                    messages.push(Message::user(
                        "Your last response did not match any expected form. Emit either a JSON tool call \
                         `{\"tool\": ..., \"args\": {...}}` or a control envelope `{\"control\": \"step_done\"}` \
                         / `{\"control\": \"replan\", \"reason\": \"...\"}`.",
                    ));
                }
            }
        }

        StepOutcome::Failed {
            error_code: ErrorCode::ETimeout,
            detail: format!("step exceeded its iteration cap of {}", self.config.per_step_iteration_cap),
        }
    }

    fn request_completion(
        &self,
        messages: &[Message],
        model: &str,
        temperature: f32,
        timeout: std::time::Duration,
    ) -> Result<ChatResponse, LlmError> {
        let request = ChatRequest {
            messages: messages.to_vec(),
            model: model.to_string(),
            temperature,
            max_tokens: None,
            timeout,
        };
        self.llm.chat(&request)
    }

    fn emit(&self, ctx: &DispatchContext<'_>, kind: EventKind, data: Value) {
        if let Some(bus) = self.events {
            let event = EventEnvelope::new(ctx.trace_id, ctx.session_id, ctx.project_id.clone(), kind, data);
            let _ = bus.publish(&event);
        }
    }
}
