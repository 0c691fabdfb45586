//! Tool Dispatcher (§4.6): the 8-step `dispatch(name, args) -> ToolResult`
//! pipeline — resolve, validate, cache lookup, policy/approval gate,
//! timeout, execute, cache invalidation, event emission.
//!
//! Grounded on the teacher's `LocalToolHost::call_tool` dispatch loop in
//! `deepseek-tools/src/lib.rs` (resolve-then-execute-then-log shape), with
//! the cache lookup, schema validation and approval gate steps added since
//! the teacher dispatches directly with no cache or generic validation
//! layer.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use taskgraph_core::{ApprovalStatus, PolicyConfig, RiskLevel, SideEffects, ToolResult, ToolSpec};
use taskgraph_errors::ErrorCode;
use taskgraph_observe::{EventBus, EventEnvelope, EventKind};
use taskgraph_policy::{
    evaluate_permission_rules, requires_approval_gate, requires_confirmation, Decision,
    PermissionRule, RuleMatchInput,
};

use crate::cache::{cache_key, ToolCache};
use crate::handlers;
use crate::registry::index_by_name;
use crate::validate::validate_args;

/// A pending or decided high/critical-risk approval lookup, consulted by
/// the dispatcher before an execution requiring one (§4.7, §4.12). The
/// approval store itself lives in `taskgraph-store`; the dispatcher only
/// needs to ask "is there an approved request for this call".
pub trait ApprovalGate {
    fn status_for(&self, tool_name: &str, args: &Value) -> Option<ApprovalStatus>;
}

/// An `ApprovalGate` that never has a pending approval, for tests and for
/// callers that pre-filter high-risk calls before reaching the dispatcher.
pub struct NoApprovals;

impl ApprovalGate for NoApprovals {
    fn status_for(&self, _tool_name: &str, _args: &Value) -> Option<ApprovalStatus> {
        None
    }
}

pub struct DispatchContext<'a> {
    pub workspace_root: PathBuf,
    pub trace_id: Uuid,
    pub session_id: Uuid,
    pub project_id: String,
    pub risk: RiskLevel,
    pub caller_timeout: Option<Duration>,
    pub policy: &'a PolicyConfig,
    /// Optional richer `Tool(specifier)` rule layer (§4.7's command allowlist
    /// generalized to a DSL) consulted ahead of the plain allow/deny lists;
    /// empty when the workspace has no `permission_rules` configured.
    pub permission_rules: &'a [PermissionRule],
}

pub struct Dispatcher<'a> {
    specs: std::collections::BTreeMap<String, ToolSpec>,
    cache: Mutex<ToolCache>,
    events: Option<&'a EventBus>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(specs: Vec<ToolSpec>, cache_max_entries: usize, cache_ttl: Duration) -> Self {
        Self {
            specs: index_by_name(&specs),
            cache: Mutex::new(ToolCache::new(cache_max_entries, cache_ttl)),
            events: None,
        }
    }

    pub fn with_event_bus(mut self, bus: &'a EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn dispatch(
        &self,
        tool_name: &str,
        args: Value,
        ctx: &DispatchContext<'_>,
        approvals: &dyn ApprovalGate,
    ) -> ToolResult {
        self.emit(ctx, EventKind::ToolCallStarted, serde_json::json!({"tool": tool_name}));
        let result = self.dispatch_inner(tool_name, args, ctx, approvals);
        self.emit(
            ctx,
            EventKind::ToolCallFinished,
            serde_json::json!({"tool": tool_name, "ok": result.ok, "error_code": result.error_code}),
        );
        result
    }

    fn dispatch_inner(
        &self,
        tool_name: &str,
        args: Value,
        ctx: &DispatchContext<'_>,
        approvals: &dyn ApprovalGate,
    ) -> ToolResult {
        // 1. resolve
        let Some(spec) = self.specs.get(tool_name) else {
            return ToolResult::err(
                ErrorCode::EUnknownTool.as_str(),
                serde_json::json!({"tool": tool_name}),
            );
        };

        // 2. validate
        let validated_args = match validate_args(&spec.args_schema, &args) {
            Ok(v) => v,
            Err(e) => {
                return ToolResult::err(ErrorCode::EBadArgs.as_str(), serde_json::json!({"message": e.to_string()}))
            }
        };

        // 3. cache lookup (read-only tools only)
        let key = cache_key(tool_name, &validated_args);
        if spec.side_effects.is_cacheable() {
            if let Some(hit) = self.cache.lock().unwrap().get(&key) {
                return hit;
            }
        }

        // 4. policy / approval gate
        let rule_input = RuleMatchInput { tool_name, args: &validated_args };
        match evaluate_permission_rules(ctx.permission_rules, &rule_input) {
            Some(Decision::Deny) => {
                self.emit(ctx, EventKind::PolicyDeny, serde_json::json!({"tool": tool_name, "reason": "permission_rule"}));
                return ToolResult::err(ErrorCode::ECmdDenied.as_str(), serde_json::json!({"tool": tool_name}));
            }
            Some(Decision::Ask) => {
                if approvals.status_for(tool_name, &validated_args) != Some(ApprovalStatus::Approved) {
                    return ToolResult::err(ErrorCode::EApprovalRequired.as_str(), serde_json::json!({"tool": tool_name}));
                }
            }
            Some(Decision::Allow) | None => {}
        }

        let effective_risk = self.effective_risk(ctx.risk, spec.side_effects);
        if requires_approval_gate(effective_risk) {
            match approvals.status_for(tool_name, &validated_args) {
                Some(ApprovalStatus::Approved) => {}
                Some(ApprovalStatus::Pending) | None => {
                    return ToolResult::err(ErrorCode::EApprovalRequired.as_str(), serde_json::json!({"tool": tool_name}));
                }
                Some(ApprovalStatus::Rejected) => {
                    return ToolResult::err(ErrorCode::EApprovalRequired.as_str(), serde_json::json!({"tool": tool_name, "rejected": true}));
                }
            }
        } else if requires_confirmation(spec.side_effects, effective_risk, ctx.policy)
            && approvals.status_for(tool_name, &validated_args) != Some(ApprovalStatus::Approved)
        {
            return ToolResult::err(ErrorCode::EApprovalRequired.as_str(), serde_json::json!({"tool": tool_name}));
        }

        // 5. timeout (smaller of tool-declared and caller-declared wins); only
        // `run_cmd` can actually block, so the resolved timeout is threaded
        // into its args rather than wrapping every handler in a watchdog.
        let timeout = smaller_timeout(spec.timeout_seconds.map(Duration::from_secs), ctx.caller_timeout);
        let mut validated_args = validated_args;
        if tool_name == "run_cmd" {
            if let Some(t) = timeout {
                validated_args["timeout_seconds"] = serde_json::json!(t.as_secs());
            }
        }

        // 6. execute
        let outcome = self.execute(tool_name, &validated_args, ctx);

        // 7. cache write / invalidation
        {
            let mut cache = self.cache.lock().unwrap();
            if spec.side_effects.is_cacheable() {
                cache.put(key, outcome.result.clone(), outcome.touched_paths.clone());
            } else if matches!(spec.side_effects, SideEffects::Write) {
                cache.invalidate_paths(&outcome.touched_paths);
            } else if matches!(spec.side_effects, SideEffects::Exec) {
                cache.invalidate_all();
            }
        }

        outcome.result
    }

    fn execute(&self, tool_name: &str, args: &Value, ctx: &DispatchContext<'_>) -> handlers::HandlerOutcome {
        match tool_name {
            "list_dir" => handlers::list_dir(&ctx.workspace_root, ctx.policy, args),
            "read_file" => handlers::read_file(&ctx.workspace_root, ctx.policy, args),
            "write_file" => handlers::write_file(&ctx.workspace_root, ctx.policy, args),
            "edit_file" => handlers::edit_file(&ctx.workspace_root, ctx.policy, args),
            "apply_patch" => handlers::apply_patch(&ctx.workspace_root, ctx.policy, args),
            "grep" => handlers::grep(&ctx.workspace_root, ctx.policy, args),
            "glob" => handlers::glob(&ctx.workspace_root, args),
            "run_cmd" => handlers::run_cmd(&ctx.workspace_root, args, ctx.policy),
            other => handlers::HandlerOutcome {
                result: ToolResult::err(ErrorCode::EUnknownTool.as_str(), serde_json::json!({"tool": other})),
                touched_paths: vec![],
            },
        }
    }

    fn effective_risk(&self, intent_risk: RiskLevel, side_effects: SideEffects) -> RiskLevel {
        let side_effect_floor = match side_effects {
            SideEffects::Exec => RiskLevel::High,
            SideEffects::Write => RiskLevel::Medium,
            _ => RiskLevel::Low,
        };
        intent_risk.max(side_effect_floor)
    }

    fn emit(&self, ctx: &DispatchContext<'_>, kind: EventKind, data: Value) {
        if let Some(bus) = self.events {
            let event = EventEnvelope::new(ctx.trace_id, ctx.session_id, ctx.project_id.clone(), kind, data);
            let _ = bus.publish(&event);
        }
    }
}

fn smaller_timeout(tool: Option<Duration>, caller: Option<Duration>) -> Option<Duration> {
    match (tool, caller) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
