//! Orchestration state machine: Classifier & Router, Prompt Composer,
//! Planner, Step Executor, Replanner and the ambient failure-tracking
//! pieces (stutter detection, feedback shaping, consecutive-failure
//! escalation) that tie them together (§4.1-§4.5, §4.10-§4.11).
//!
//! Grounded on the teacher's `deepseek-agent`: this crate plays the role of
//! the teacher's `AgentEngine` + `tool_loop` + `planner`, narrowed to the
//! turn state machine described by the spec rather than the teacher's wider
//! chat/subagent/skill surface.

pub mod executor;
pub mod feedback;
pub mod intent_registry;
pub mod orchestrator;
pub mod planner;
pub mod prompt;
pub mod replanner;
pub mod stutter;
pub mod util;

pub use executor::{StepExecutor, StepExecutorConfig, StepOutcome};
pub use feedback::FeedbackShaper;
pub use intent_registry::{IntentRegistry, IntentRegistryError, IntentRule};
pub use orchestrator::{ApprovalPrompt, AutoDenyApprovalPrompt, Orchestrator, OrchestratorError};
pub use planner::{apply_patch_document, parse_plan_document, PlannerError};
pub use prompt::{compose_system_prompt, PromptProfile, PromptProfileRegistry, WorkspaceContext};
pub use replanner::{Escalation, FailureTracker};
pub use stutter::StutterTracker;
pub use util::extract_json_span;
