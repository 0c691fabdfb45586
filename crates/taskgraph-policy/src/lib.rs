//! Policy Engine & Path Sandbox (§4.7): path sandboxing, command allow/deny,
//! env scrubbing, a `Tool(specifier)` permission-rule DSL, and secret
//! redaction.
//!
//! Grounded on `deepseek-policy/src/lib.rs`'s `PolicyEngine`/`PermissionRule`/
//! `check_path`/`check_command`/`redact`, trimmed to what §4.7 actually asks
//! for: this crate drops the teacher's permission-mode state machine (ask/
//! auto/plan/acceptEdits/dontAsk/locked/bypass), team-policy-override files,
//! and managed-settings/MCP integration — none of those are named by the
//! spec, and risk-gated approval already lives in `ApprovalMode` +
//! `RiskLevel` (`taskgraph-core`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use taskgraph_core::{runtime_dir, ApprovalMode, PolicyConfig, RiskLevel, SideEffects};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("path `{0}` escapes the workspace root")]
    PathEscape(String),
    #[error("path `{0}` is outside the configured sandbox paths")]
    SecretPath(String),
    #[error("command contains forbidden shell metacharacters: `{0}`")]
    CommandInjection(String),
    #[error("command `{0}` is denied by policy")]
    CommandDenied(String),
    #[error("command `{0}` is not on the allowlist")]
    CommandNotAllowed(String),
}

/// Resolves `path` (relative to `workspace_root` if not absolute) and
/// verifies it stays inside the workspace: no `..` escape post-resolution,
/// no symlink escape, and it must land strictly under `workspace_root`
/// — and, per `policy.sandbox_paths`, under one of the configured sandbox
/// sub-roots (§4.7 `check_path`).
pub fn check_path(workspace_root: &Path, policy: &PolicyConfig, path: &Path) -> Result<PathBuf, PolicyError> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_root.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(PolicyError::PathEscape(path.display().to_string()));
                }
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    // Symlink escape: if the path (or its existing ancestors) resolves via
    // the filesystem to somewhere outside the root, canonicalize catches it.
    let root_canon = workspace_root
        .canonicalize()
        .unwrap_or_else(|_| workspace_root.to_path_buf());
    let resolved = normalized
        .canonicalize()
        .unwrap_or_else(|_| normalized.clone());

    if !resolved.starts_with(&root_canon) && !normalized.starts_with(&root_canon) {
        return Err(PolicyError::PathEscape(path.display().to_string()));
    }

    if !within_sandbox_paths(workspace_root, policy, &normalized, &resolved) {
        return Err(PolicyError::SecretPath(path.display().to_string()));
    }

    Ok(normalized)
}

/// Whether `normalized`/`resolved` lands under at least one of
/// `policy.sandbox_paths` (each relative to `workspace_root`). An empty list
/// defaults to `["."]`, i.e. the whole workspace, matching `PolicyConfig`'s
/// own default.
fn within_sandbox_paths(workspace_root: &Path, policy: &PolicyConfig, normalized: &Path, resolved: &Path) -> bool {
    let defaulted = [".".to_string()];
    let configured: &[String] = if policy.sandbox_paths.is_empty() {
        &defaulted
    } else {
        &policy.sandbox_paths
    };
    configured.iter().any(|sandbox| {
        let root = workspace_root.join(sandbox);
        let root_canon = root.canonicalize().unwrap_or_else(|_| root.clone());
        normalized.starts_with(&root) || normalized.starts_with(&root_canon) || resolved.starts_with(&root_canon)
    })
}

/// Command first-token deny list consulted before any allowlist (§4.7:
/// "reject if first token matches the deny list").
pub const DEFAULT_COMMAND_DENYLIST: &[&str] = &[
    "rm", "rmdir", "del", "rd", "mkfs", "dd", "format", "shutdown", "reboot", "poweroff", "curl",
    "wget",
];

const FORBIDDEN_SHELL_TOKENS: &[&str] = &["\n", "\r", ";", "&&", "||", "|", "`", "$("];

/// Tokenizes (argv-preferring) and checks a command string against the
/// deny/allow lists (§4.7 `check_command`). An empty `allowlist` means no
/// allowlist restriction is enforced beyond the deny list.
pub fn check_command(cmd: &str, policy: &PolicyConfig) -> Result<Vec<String>, PolicyError> {
    if FORBIDDEN_SHELL_TOKENS.iter().any(|tok| cmd.contains(tok)) {
        return Err(PolicyError::CommandInjection(cmd.to_string()));
    }

    let tokens = shell_words::split(cmd).unwrap_or_else(|_| {
        cmd.split_whitespace().map(|s| s.to_string()).collect()
    });
    let Some(first) = tokens.first() else {
        return Err(PolicyError::CommandDenied(cmd.to_string()));
    };
    let first_lower = first.to_ascii_lowercase();

    if policy
        .command_denylist
        .iter()
        .any(|d| d.eq_ignore_ascii_case(&first_lower))
        || DEFAULT_COMMAND_DENYLIST
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&first_lower))
    {
        return Err(PolicyError::CommandDenied(cmd.to_string()));
    }

    if !policy.command_allowlist.is_empty() {
        let token_refs: Vec<&str> = tokens.iter().map(|s| s.as_str()).collect();
        let allowed = policy
            .command_allowlist
            .iter()
            .any(|pattern| allow_pattern_matches(pattern, &token_refs));
        if !allowed {
            return Err(PolicyError::CommandNotAllowed(cmd.to_string()));
        }
    }

    Ok(tokens)
}

fn allow_pattern_matches(pattern: &str, cmd_tokens: &[&str]) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split_whitespace().collect();
    if pattern_tokens.is_empty() || cmd_tokens.len() < pattern_tokens.len() {
        return false;
    }
    for (i, pt) in pattern_tokens.iter().enumerate() {
        if *pt == "*" {
            return true;
        }
        if let Some(prefix) = pt.strip_suffix('*') {
            if !cmd_tokens[i].starts_with(prefix) {
                return false;
            }
        } else if !pt.eq_ignore_ascii_case(cmd_tokens[i]) {
            return false;
        }
    }
    true
}

const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "LC_CTYPE", "TZ"];

/// Subprocess environment inherits only an allowlist, then strips anything
/// matching a sensitive-name pattern — the configured `redact_env_keys` plus
/// a fixed second safety net — as a defense in depth (§4.7 env scrub).
pub fn scrub_env(ambient: &HashMap<String, String>, policy: &PolicyConfig) -> HashMap<String, String> {
    ambient
        .iter()
        .filter(|(k, _)| ENV_ALLOWLIST.contains(&k.as_str()))
        .filter(|(k, _)| !is_sensitive_env_key(k, policy))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn is_sensitive_env_key(key: &str, policy: &PolicyConfig) -> bool {
    let upper = key.to_ascii_uppercase();
    policy
        .redact_env_keys
        .iter()
        .any(|needle| upper.contains(needle.to_ascii_uppercase().as_str()))
        || ["TOKEN", "KEY", "SECRET", "PASSWORD"]
            .iter()
            .any(|needle| upper.contains(needle))
        || upper.starts_with("AWS_")
}

/// A `Tool(specifier)` rule, e.g. `Bash(npm run *)`, `Edit(src/**/*.rs)`.
/// Evaluation order across a rule set is deny > ask > allow (first-matching
/// `deny` wins immediately; §4.7's permission-rule DSL).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    pub rule: String,
    pub decision: Decision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Ask,
    Deny,
}

/// Minimal surface of a tool invocation a rule needs to match against.
pub struct RuleMatchInput<'a> {
    pub tool_name: &'a str,
    pub args: &'a serde_json::Value,
}

impl PermissionRule {
    pub fn matches(&self, call: &RuleMatchInput) -> Option<Decision> {
        let (prefix, specifier) = parse_rule_syntax(&self.rule)?;
        let expected_tool = match prefix.to_ascii_lowercase().as_str() {
            "bash" => "run_cmd",
            "read" => "read_file",
            "edit" => "edit_file",
            "write" => "write_file",
            "patch" => "apply_patch",
            "glob" => "glob",
            "grep" => "grep",
            "list" => "list_dir",
            _ => return None,
        };
        if call.tool_name != expected_tool {
            return None;
        }
        match expected_tool {
            "run_cmd" => {
                let cmd = call.args.get("command").and_then(|v| v.as_str()).unwrap_or("");
                let tokens: Vec<&str> = cmd.split_whitespace().collect();
                allow_pattern_matches(&specifier, &tokens).then_some(self.decision)
            }
            "read_file" | "edit_file" | "write_file" | "apply_patch" | "glob" | "grep" | "list_dir" => {
                let path = call
                    .args
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                match glob::Pattern::new(&specifier) {
                    Ok(pattern) if pattern.matches(path) => Some(self.decision),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// Reads the optional `permission_rules.yaml` registry (empty if absent,
/// never created on first touch since most workspaces never need it).
pub fn load_permission_rules(workspace: &Path) -> anyhow::Result<Vec<PermissionRule>> {
    let path = runtime_dir(workspace).join("permission_rules.yaml");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(&path)?;
    Ok(serde_yaml::from_str(&raw)?)
}

fn parse_rule_syntax(rule: &str) -> Option<(String, String)> {
    let rule = rule.trim();
    let open = rule.find('(')?;
    if !rule.ends_with(')') {
        return None;
    }
    let tool = rule[..open].trim().to_string();
    let specifier = rule[open + 1..rule.len() - 1].trim().to_string();
    (!tool.is_empty() && !specifier.is_empty()).then_some((tool, specifier))
}

/// First-match-wins across the rule set with deny > ask > allow strength.
pub fn evaluate_permission_rules(rules: &[PermissionRule], call: &RuleMatchInput) -> Option<Decision> {
    let mut best: Option<Decision> = None;
    for rule in rules {
        match rule.matches(call) {
            Some(Decision::Deny) => return Some(Decision::Deny),
            Some(Decision::Ask) => best = Some(Decision::Ask),
            Some(Decision::Allow) => best = best.or(Some(Decision::Allow)),
            None => {}
        }
    }
    best
}

/// Whether a high/critical-risk operation must wait on an approved
/// `ApprovalRequest` before dispatch (§4.7: "high / critical risk requires
/// an approved ApprovalRequest before execution").
pub fn requires_approval_gate(risk: RiskLevel) -> bool {
    risk >= RiskLevel::High
}

/// Whether a medium-risk write/exec operation must consult the configured
/// write/exec confirmation gate (§4.7 "write confirm / exec confirm gates").
pub fn requires_confirmation(side_effects: SideEffects, risk: RiskLevel, policy: &PolicyConfig) -> bool {
    if risk >= RiskLevel::High {
        return false; // handled by requires_approval_gate instead
    }
    match side_effects {
        SideEffects::Write => policy.approve_writes != ApprovalMode::Never,
        SideEffects::Exec => policy.approve_exec != ApprovalMode::Never,
        _ => false,
    }
}

/// Applies each configured secret-redaction pattern to a string, replacing
/// matches with `[REDACTED]` (§4.7/§4.13 redaction).
pub fn redact_secrets(text: &str, patterns: &[regex::Regex]) -> String {
    patterns
        .iter()
        .fold(text.to_string(), |acc, re| re.replace_all(&acc, "[REDACTED]").into_owned())
}

pub fn default_secret_patterns() -> Vec<regex::Regex> {
    [
        r"(?i)(api[_-]?key|token|secret|password)\s*[:=]\s*['\"]?[a-z0-9_\-]{8,}['\"]?",
        r"\b\d{3}-\d{2}-\d{4}\b",
    ]
    .iter()
    .filter_map(|p| regex::Regex::new(p).ok())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn check_path_accepts_path_inside_workspace() {
        let dir = tempdir().unwrap();
        let policy = PolicyConfig::default();
        let result = check_path(dir.path(), &policy, Path::new("src/main.rs"));
        assert!(result.is_ok());
    }

    #[test]
    fn check_path_rejects_parent_dir_escape() {
        let dir = tempdir().unwrap();
        let policy = PolicyConfig::default();
        let result = check_path(dir.path(), &policy, Path::new("../../etc/passwd"));
        assert_eq!(
            result,
            Err(PolicyError::PathEscape("../../etc/passwd".to_string()))
        );
    }

    #[test]
    fn check_path_rejects_path_outside_configured_sandbox() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::create_dir(dir.path().join("other")).unwrap();
        let mut policy = PolicyConfig::default();
        policy.sandbox_paths = vec!["src".to_string()];
        assert!(check_path(dir.path(), &policy, Path::new("src/main.rs")).is_ok());
        let result = check_path(dir.path(), &policy, Path::new("other/file.rs"));
        assert_eq!(
            result,
            Err(PolicyError::SecretPath("other/file.rs".to_string()))
        );
    }

    #[test]
    fn check_command_rejects_shell_metacharacters() {
        let policy = PolicyConfig::default();
        let result = check_command("git status; rm -rf /", &policy);
        assert!(matches!(result, Err(PolicyError::CommandInjection(_))));
    }

    #[test]
    fn check_command_rejects_denylisted_first_token() {
        let policy = PolicyConfig::default();
        let result = check_command("rm -rf target", &policy);
        assert!(matches!(result, Err(PolicyError::CommandDenied(_))));
    }

    #[test]
    fn check_command_enforces_allowlist_when_present() {
        let mut policy = PolicyConfig::default();
        policy.command_allowlist = vec!["git status".to_string()];
        assert!(check_command("git status", &policy).is_ok());
        assert!(check_command("git push", &policy).is_err());
    }

    #[test]
    fn scrub_env_keeps_only_allowlisted_and_strips_sensitive() {
        let mut ambient = HashMap::new();
        ambient.insert("PATH".to_string(), "/usr/bin".to_string());
        ambient.insert("LLM_API_KEY".to_string(), "sk-secret".to_string());
        ambient.insert("RANDOM_VAR".to_string(), "x".to_string());
        let policy = PolicyConfig::default();
        let scrubbed = scrub_env(&ambient, &policy);
        assert_eq!(scrubbed.get("PATH"), Some(&"/usr/bin".to_string()));
        assert!(!scrubbed.contains_key("LLM_API_KEY"));
        assert!(!scrubbed.contains_key("RANDOM_VAR"));
    }

    #[test]
    fn scrub_env_strips_configured_redact_keys() {
        let mut ambient = HashMap::new();
        ambient.insert("PATH".to_string(), "/usr/bin".to_string());
        ambient.insert("HOME".to_string(), "/home/agent".to_string());
        let mut policy = PolicyConfig::default();
        policy.redact_env_keys = vec!["HOME".to_string()];
        let scrubbed = scrub_env(&ambient, &policy);
        assert_eq!(scrubbed.get("PATH"), Some(&"/usr/bin".to_string()));
        assert!(!scrubbed.contains_key("HOME"));
    }

    #[test]
    fn permission_rule_matches_bash_glob_specifier() {
        let rule = PermissionRule {
            rule: "Bash(npm run *)".to_string(),
            decision: Decision::Allow,
        };
        let args = serde_json::json!({"command": "npm run build"});
        let call = RuleMatchInput { tool_name: "run_cmd", args: &args };
        assert_eq!(rule.matches(&call), Some(Decision::Allow));
    }

    #[test]
    fn evaluate_permission_rules_deny_wins_over_allow() {
        let args = serde_json::json!({"command": "npm run test"});
        let call = RuleMatchInput { tool_name: "run_cmd", args: &args };
        let rules = vec![
            PermissionRule { rule: "Bash(npm run *)".to_string(), decision: Decision::Allow },
            PermissionRule { rule: "Bash(npm run test)".to_string(), decision: Decision::Deny },
        ];
        assert_eq!(evaluate_permission_rules(&rules, &call), Some(Decision::Deny));
    }

    #[test]
    fn requires_approval_gate_only_for_high_and_critical() {
        assert!(!requires_approval_gate(RiskLevel::Medium));
        assert!(requires_approval_gate(RiskLevel::High));
        assert!(requires_approval_gate(RiskLevel::Critical));
    }

    #[test]
    fn redact_secrets_masks_api_key_assignment() {
        let patterns = default_secret_patterns();
        let redacted = redact_secrets("api_key: abcd1234efgh", &patterns);
        assert!(redacted.contains("[REDACTED]"));
        assert!(!redacted.contains("abcd1234efgh"));
    }
}
