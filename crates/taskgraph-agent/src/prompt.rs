//! Prompt Composer (§4.3): four stable layers — core, role, policy, context —
//! concatenated into one system prompt, plus phase-specific user prompts for
//! `Mode::Split` (planning / execute_step / replan).
//!
//! Grounded on the teacher's `build_tool_use_system_prompt`
//! (`deepseek-agent/src/prompts.rs`): one stable base block always present,
//! an environment section appended the same way `format_environment_section`
//! does, and override/append hooks. The role layer's per-category text is
//! new (the teacher has one fixed prompt for every category; §4.3 calls for
//! per-intent role guidance), loaded from a YAML registry the way
//! `intents.yaml` is, per SPEC_FULL.md §10.3.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use taskgraph_core::{runtime_dir, PolicyConfig};

#[derive(Debug, thiserror::Error)]
pub enum PromptRegistryError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Always-present base instructions, independent of the matched intent
/// (teacher's `TOOL_USE_SYSTEM_PROMPT`, generalized from a DeepSeek-specific
/// assistant identity to a neutral one).
pub const CORE_LAYER: &str = r#"You are an autonomous software engineering agent operating in a sandboxed workspace.

## CRITICAL RULES
1. ALWAYS use tools to gather information. NEVER fabricate file contents, paths, or project structure.
2. Read files before editing them. Search before guessing paths.
3. Be concise: no preamble, no restating the request.
4. Mimic the existing code style. Never assume a dependency is available without checking.
5. After making changes, verify with the relevant build or test command.

## CONTROL PROTOCOL
When a step is finished, emit a control envelope: `{"control": "step_done"}`.
When the current plan can no longer succeed as written, emit
`{"control": "replan", "reason": "..."}` instead of continuing to retry blindly.
"#;

/// One entry in `prompt_profiles.yaml`, keyed by `IntentMatch.prompt_profile_ref`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptProfile {
    pub name: String,
    pub role_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptProfileRegistry {
    pub profiles: Vec<PromptProfile>,
}

impl PromptProfileRegistry {
    pub fn path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("prompt_profiles.yaml")
    }

    pub fn ensure(workspace: &Path) -> Result<Self, PromptRegistryError> {
        let path = Self::path(workspace);
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            return Ok(serde_yaml::from_str(&raw)?);
        }
        fs::create_dir_all(path.parent().expect("registry path always has a parent"))?;
        let registry = Self::defaults();
        fs::write(&path, serde_yaml::to_string(&registry)?)?;
        Ok(registry)
    }

    pub fn defaults() -> Self {
        let profile = |name: &str, role_text: &str| PromptProfile {
            name: name.to_string(),
            role_text: role_text.to_string(),
        };
        Self {
            profiles: vec![
                profile(
                    "coding_task",
                    "Read every file you plan to modify before touching it. Grep for call sites before changing a signature. Work one file at a time.",
                ),
                profile(
                    "error_diagnosis",
                    "Reproduce the failure first. Read the stack trace and the code it points at before proposing a fix. Do not guess at root cause from the message alone.",
                ),
                profile(
                    "repo_analysis",
                    "Answer from what the tools return, never from memory. Prefer a short direct answer over a tour of the whole codebase.",
                ),
                profile(
                    "documentation_task",
                    "Match the existing documentation's tone and density. Do not document code you have not read.",
                ),
                profile(
                    "technical_consulting",
                    "Ground every recommendation in what this specific codebase actually does, not generic best practice.",
                ),
                profile(
                    "project_design",
                    "State the plan briefly before touching files: which files, in what order, what the risks are.",
                ),
                profile(
                    "security_consulting",
                    "Flag concrete, reproducible issues only. Do not speculate about vulnerabilities you have not confirmed by reading the code.",
                ),
                profile("capability_query", "Answer directly; no tool calls are usually needed."),
                profile("general_chat", "Respond briefly and naturally."),
                profile("casual_chat", "Respond briefly and naturally."),
                profile("uncertain", "Ask one clarifying question before proceeding, or make the most conservative reasonable assumption and say so."),
            ],
        }
    }

    pub fn role_text(&self, profile_ref: &str) -> Option<&str> {
        self.profiles
            .iter()
            .find(|p| p.name == profile_ref)
            .map(|p| p.role_text.as_str())
    }
}

/// Workspace facts injected into the context layer (teacher's
/// `WorkspaceContext`/`format_environment_section`).
pub struct WorkspaceContext {
    pub cwd: String,
    pub git_branch: Option<String>,
    pub os: String,
}

fn policy_layer(policy: &PolicyConfig) -> String {
    let mut out = String::from("\n# Policy\n\n");
    out.push_str(&format!(
        "- Writes require {}; exec requires {}.\n",
        approval_word(policy.approve_writes),
        approval_word(policy.approve_exec),
    ));
    if !policy.command_allowlist.is_empty() {
        out.push_str(&format!(
            "- Only these command prefixes are allowed: {}\n",
            policy.command_allowlist.join(", ")
        ));
    }
    out
}

fn approval_word(mode: taskgraph_core::ApprovalMode) -> &'static str {
    match mode {
        taskgraph_core::ApprovalMode::Always => "approval every time",
        taskgraph_core::ApprovalMode::Ask => "approval unless previously granted",
        taskgraph_core::ApprovalMode::Never => "no approval",
    }
}

fn context_layer(ctx: &WorkspaceContext) -> String {
    let mut section = String::from("\n# Environment\n\n");
    section.push_str(&format!("- Working directory: {}\n", ctx.cwd));
    if let Some(branch) = &ctx.git_branch {
        section.push_str(&format!("- Git branch: {branch}\n"));
    }
    section.push_str(&format!("- OS: {}\n", ctx.os));
    section
}

/// Composes the full four-layer system prompt for one turn (§4.3: "core /
/// role / policy / context, concatenated in that order").
pub fn compose_system_prompt(
    profiles: &PromptProfileRegistry,
    profile_ref: &str,
    policy: &PolicyConfig,
    workspace_context: &WorkspaceContext,
) -> String {
    let mut parts = vec![CORE_LAYER.to_string()];
    if let Some(role_text) = profiles.role_text(profile_ref) {
        parts.push(format!("\n# Role\n\n{role_text}\n"));
    }
    parts.push(policy_layer(policy));
    parts.push(context_layer(workspace_context));
    parts.join("")
}

/// Phase-specific user prompts for `Mode::Split` (§4.3 "separate stage
/// prompts: planning / execute_step / replan").
pub mod stage {
    pub fn planning(goal: &str) -> String {
        format!("Produce a plan to accomplish: {goal}\n\nReturn a JSON plan document as specified.")
    }

    pub fn execute_step(step_description: &str) -> String {
        format!("Execute this step: {step_description}\n\nCall a tool, or emit a control envelope when the step is done or unrecoverable.")
    }

    pub fn replan(reason: &str, failed_step: &str) -> String {
        format!(
            "The plan can no longer proceed as written.\nFailed step: {failed_step}\nReason: {reason}\n\nReturn a PlanPatch document with the minimal changes needed to recover."
        )
    }
}
