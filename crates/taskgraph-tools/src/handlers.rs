//! Built-in tool handler implementations (§4.6, §4.7).
//!
//! Every handler that touches a path calls `check_path` first, and the one
//! handler that shells out calls `check_command`, per §4.7's blanket rule
//! ("All tool handlers touching paths MUST call check_path... Command
//! handlers MUST call check_command"). Grounded on the teacher's per-tool
//! handler bodies in `deepseek-tools/src/lib.rs` (read_file/write_file/
//! list_dir/grep family), restructured around this system's `ArgSchema`-
//! validated args and `ToolResult` envelope instead of the teacher's ad hoc
//! per-tool return types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
use taskgraph_core::{PolicyConfig, ToolResult};
use taskgraph_diff::{Hunk, PatchError, PatchStore};
use taskgraph_errors::ErrorCode;
use taskgraph_policy::{check_command, check_path, scrub_env};
use uuid::Uuid;

use crate::runner::{CommandRunner, PlatformCommandRunner};

/// Paths a handler's result depends on, returned alongside the `ToolResult`
/// so the dispatcher can index the cache entry for later invalidation.
pub struct HandlerOutcome {
    pub result: ToolResult,
    pub touched_paths: Vec<PathBuf>,
}

impl HandlerOutcome {
    fn new(result: ToolResult, touched_paths: Vec<PathBuf>) -> Self {
        Self {
            result,
            touched_paths,
        }
    }
}

fn err(code: ErrorCode, message: impl Into<String>) -> ToolResult {
    ToolResult::err(code.as_str(), json!({"message": message.into()}))
}

fn resolved_path(workspace_root: &Path, policy: &PolicyConfig, args: &Value, field: &str) -> Result<PathBuf, ToolResult> {
    let Some(raw) = args.get(field).and_then(Value::as_str) else {
        return Err(err(ErrorCode::EBadArgs, format!("missing `{field}`")));
    };
    check_path(workspace_root, policy, Path::new(raw))
        .map_err(|e| err(ErrorCode::EPathDenied, e.to_string()))
}

pub fn list_dir(workspace_root: &Path, policy: &PolicyConfig, args: &Value) -> HandlerOutcome {
    let path = match resolved_path(workspace_root, policy, args, "path") {
        Ok(p) => p,
        Err(result) => return HandlerOutcome::new(result, vec![]),
    };
    let recursive = args.get("recursive").and_then(Value::as_bool).unwrap_or(false);

    let mut entries = Vec::new();
    if recursive {
        for entry in walkdir::WalkDir::new(&path).into_iter().filter_map(Result::ok) {
            if entry.path() != path {
                entries.push(relative_display(&path, entry.path()));
            }
        }
    } else {
        let read_dir = match std::fs::read_dir(&path) {
            Ok(rd) => rd,
            Err(e) => {
                return HandlerOutcome::new(
                    err(ErrorCode::ENotFound, e.to_string()),
                    vec![path],
                )
            }
        };
        for entry in read_dir.filter_map(Result::ok) {
            entries.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    entries.sort();
    HandlerOutcome::new(
        ToolResult::ok(json!({"entries": entries})),
        vec![path],
    )
}

fn relative_display(base: &Path, full: &Path) -> String {
    full.strip_prefix(base)
        .unwrap_or(full)
        .to_string_lossy()
        .into_owned()
}

pub fn read_file(workspace_root: &Path, policy: &PolicyConfig, args: &Value) -> HandlerOutcome {
    let path = match resolved_path(workspace_root, policy, args, "path") {
        Ok(p) => p,
        Err(result) => return HandlerOutcome::new(result, vec![]),
    };
    let max_bytes = args
        .get("max_bytes")
        .and_then(Value::as_u64)
        .unwrap_or(65536) as usize;

    match std::fs::read(&path) {
        Ok(bytes) => {
            let truncated = bytes.len() > max_bytes;
            let slice = if truncated { &bytes[..max_bytes] } else { &bytes[..] };
            let contents = String::from_utf8_lossy(slice).into_owned();
            let mut result = ToolResult::ok(json!({"contents": contents}));
            result.truncated = truncated;
            HandlerOutcome::new(result, vec![path])
        }
        Err(e) => HandlerOutcome::new(err(ErrorCode::ENotFound, e.to_string()), vec![path]),
    }
}

pub fn write_file(workspace_root: &Path, policy: &PolicyConfig, args: &Value) -> HandlerOutcome {
    let path = match resolved_path(workspace_root, policy, args, "path") {
        Ok(p) => p,
        Err(result) => return HandlerOutcome::new(result, vec![]),
    };
    let Some(contents) = args.get("contents").and_then(Value::as_str) else {
        return HandlerOutcome::new(err(ErrorCode::EBadArgs, "missing `contents`"), vec![path]);
    };

    match atomic_write(&path, contents.as_bytes()) {
        Ok(()) => HandlerOutcome::new(
            ToolResult::ok(json!({"bytes_written": contents.len()})),
            vec![path],
        ),
        Err(e) => HandlerOutcome::new(err(ErrorCode::EConflict, e.to_string()), vec![path]),
    }
}

pub fn edit_file(workspace_root: &Path, policy: &PolicyConfig, args: &Value) -> HandlerOutcome {
    let path = match resolved_path(workspace_root, policy, args, "path") {
        Ok(p) => p,
        Err(result) => return HandlerOutcome::new(result, vec![]),
    };
    let (Some(old_text), Some(new_text)) = (
        args.get("old_text").and_then(Value::as_str),
        args.get("new_text").and_then(Value::as_str),
    ) else {
        return HandlerOutcome::new(
            err(ErrorCode::EBadArgs, "missing `old_text`/`new_text`"),
            vec![path],
        );
    };

    let current = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => return HandlerOutcome::new(err(ErrorCode::ENotFound, e.to_string()), vec![path]),
    };

    let occurrences = current.matches(old_text).count();
    if occurrences == 0 {
        return HandlerOutcome::new(
            err(ErrorCode::ENotFound, "old_text not found"),
            vec![path],
        );
    }
    if occurrences > 1 {
        return HandlerOutcome::new(
            err(ErrorCode::EAmbiguous, "old_text matches more than one location"),
            vec![path],
        );
    }

    let updated = current.replacen(old_text, new_text, 1);
    match atomic_write(&path, updated.as_bytes()) {
        Ok(()) => HandlerOutcome::new(ToolResult::ok(json!({"applied": true})), vec![path]),
        Err(e) => HandlerOutcome::new(err(ErrorCode::EConflict, e.to_string()), vec![path]),
    }
}

/// Stages and immediately applies a sequence of context-anchored hunks
/// against a workspace-relative file (§4.9 Patch Engine), delegating the
/// actual matching/atomic-write/undo-bookkeeping logic to `taskgraph-diff`'s
/// `PatchStore` rather than re-implementing it here.
pub fn apply_patch(workspace_root: &Path, policy: &PolicyConfig, args: &Value) -> HandlerOutcome {
    let relative_path = match args.get("path").and_then(Value::as_str) {
        Some(p) => p.to_string(),
        None => return HandlerOutcome::new(err(ErrorCode::EBadArgs, "missing `path`"), vec![]),
    };
    let path = match resolved_path(workspace_root, policy, args, "path") {
        Ok(p) => p,
        Err(result) => return HandlerOutcome::new(result, vec![]),
    };

    let Some(raw_hunks) = args.get("hunks").and_then(Value::as_array) else {
        return HandlerOutcome::new(err(ErrorCode::EBadArgs, "missing `hunks`"), vec![path]);
    };
    let mut hunks = Vec::with_capacity(raw_hunks.len());
    for raw in raw_hunks {
        let (Some(before), Some(after)) = (
            raw.get("before").and_then(Value::as_str),
            raw.get("after").and_then(Value::as_str),
        ) else {
            return HandlerOutcome::new(
                err(ErrorCode::EBadArgs, "each hunk needs `before` and `after`"),
                vec![path],
            );
        };
        hunks.push(Hunk {
            before: before.to_string(),
            after: after.to_string(),
        });
    }

    let plan_id = args
        .get("plan_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::now_v7);

    let store = match PatchStore::new(workspace_root) {
        Ok(s) => s,
        Err(e) => return HandlerOutcome::new(err(ErrorCode::ENotFound, e.to_string()), vec![path]),
    };
    let staged = match store.stage(plan_id, &relative_path, hunks) {
        Ok(p) => p,
        Err(e) => return HandlerOutcome::new(patch_error_result(e), vec![path]),
    };

    match store.apply(workspace_root, staged.patch_id) {
        Ok(applied) => HandlerOutcome::new(
            ToolResult::ok(json!({
                "patch_id": applied.patch_id,
                "applied": applied.applied,
                "old_hash": applied.old_hash,
                "new_hash": applied.new_hash,
            })),
            vec![path],
        ),
        Err(e) => HandlerOutcome::new(patch_error_result(e), vec![path]),
    }
}

fn patch_error_result(e: PatchError) -> ToolResult {
    match e {
        PatchError::Conflict { .. } => err(ErrorCode::EConflict, e.to_string()),
        PatchError::Ambiguous { .. } => err(ErrorCode::EAmbiguous, e.to_string()),
        PatchError::NotFound(_) => err(ErrorCode::ENotFound, e.to_string()),
        PatchError::HashMismatch => err(ErrorCode::EConflict, e.to_string()),
        PatchError::Io(_) | PatchError::Serde(_) => err(ErrorCode::ENotFound, e.to_string()),
    }
}

pub fn grep(workspace_root: &Path, policy: &PolicyConfig, args: &Value) -> HandlerOutcome {
    let Some(pattern) = args.get("pattern").and_then(Value::as_str) else {
        return HandlerOutcome::new(err(ErrorCode::EBadArgs, "missing `pattern`"), vec![]);
    };
    let re = match regex::Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => return HandlerOutcome::new(err(ErrorCode::EBadArgs, e.to_string()), vec![]),
    };
    let search_root = args
        .get("path")
        .and_then(Value::as_str)
        .unwrap_or(".");
    let root = match check_path(workspace_root, policy, Path::new(search_root)) {
        Ok(p) => p,
        Err(e) => return HandlerOutcome::new(err(ErrorCode::EPathDenied, e.to_string()), vec![]),
    };
    let max_results = args
        .get("max_results")
        .and_then(Value::as_u64)
        .unwrap_or(200) as usize;

    let mut hits = Vec::new();
    for entry in walkdir::WalkDir::new(&root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let Ok(contents) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        for (line_no, line) in contents.lines().enumerate() {
            if re.is_match(line) {
                hits.push(json!({
                    "path": relative_display(&root, entry.path()),
                    "line": line_no + 1,
                    "text": line,
                }));
                if hits.len() >= max_results {
                    break;
                }
            }
        }
        if hits.len() >= max_results {
            break;
        }
    }

    if hits.is_empty() {
        return HandlerOutcome::new(
            err(ErrorCode::ENoResults, "no matches"),
            vec![root],
        );
    }
    HandlerOutcome::new(ToolResult::ok(json!({"hits": hits})), vec![root])
}

pub fn glob(workspace_root: &Path, args: &Value) -> HandlerOutcome {
    let Some(pattern) = args.get("pattern").and_then(Value::as_str) else {
        return HandlerOutcome::new(err(ErrorCode::EBadArgs, "missing `pattern`"), vec![]);
    };
    let full_pattern = workspace_root.join(pattern);
    let matched = match glob::glob(&full_pattern.to_string_lossy()) {
        Ok(paths) => paths.filter_map(Result::ok).collect::<Vec<_>>(),
        Err(e) => return HandlerOutcome::new(err(ErrorCode::EBadArgs, e.to_string()), vec![]),
    };
    let entries: Vec<String> = matched
        .iter()
        .map(|p| relative_display(workspace_root, p))
        .collect();
    HandlerOutcome::new(
        ToolResult::ok(json!({"matches": entries})),
        vec![workspace_root.to_path_buf()],
    )
}

pub fn run_cmd(workspace_root: &Path, args: &Value, policy: &PolicyConfig) -> HandlerOutcome {
    let Some(command) = args.get("command").and_then(Value::as_str) else {
        return HandlerOutcome::new(err(ErrorCode::EBadArgs, "missing `command`"), vec![]);
    };
    if let Err(e) = check_command(command, policy) {
        return HandlerOutcome::new(err(ErrorCode::ECmdDenied, e.to_string()), vec![]);
    }

    let timeout = args
        .get("timeout_seconds")
        .and_then(Value::as_u64)
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(60));

    let ambient: std::collections::HashMap<String, String> = std::env::vars().collect();
    let env = scrub_env(&ambient, policy);

    let runner = PlatformCommandRunner::new();
    match runner.run(command, workspace_root, &env, timeout) {
        Ok(outcome) if outcome.timed_out => HandlerOutcome::new(
            err(ErrorCode::ETimeout, "command exceeded its timeout"),
            vec![workspace_root.to_path_buf()],
        ),
        Ok(outcome) => {
            let mut result = ToolResult::ok(json!({
                "exit_code": outcome.exit_code,
                "stdout": outcome.stdout,
                "stderr": outcome.stderr,
                "duration_ms": outcome.duration_ms,
            }));
            result.truncated = outcome.truncated;
            HandlerOutcome::new(result, vec![workspace_root.to_path_buf()])
        }
        Err(e) => HandlerOutcome::new(
            err(ErrorCode::EUnknownTool, e.to_string()),
            vec![workspace_root.to_path_buf()],
        ),
    }
}

fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_file_rejects_path_outside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PolicyConfig::default();
        let outcome = read_file(dir.path(), &policy, &json!({"path": "../../etc/passwd"}));
        assert!(!outcome.result.ok);
        assert_eq!(outcome.result.error_code.as_deref(), Some(ErrorCode::EPathDenied.as_str()));
    }

    #[test]
    fn read_file_rejects_path_outside_configured_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("secrets.txt"), "top secret").unwrap();
        let mut policy = PolicyConfig::default();
        policy.sandbox_paths = vec!["src".to_string()];
        let outcome = read_file(dir.path(), &policy, &json!({"path": "secrets.txt"}));
        assert!(!outcome.result.ok);
        assert_eq!(outcome.result.error_code.as_deref(), Some(ErrorCode::EPathDenied.as_str()));
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PolicyConfig::default();
        let write_outcome = write_file(
            dir.path(),
            &policy,
            &json!({"path": "a.txt", "contents": "hello"}),
        );
        assert!(write_outcome.result.ok);
        let read_outcome = read_file(dir.path(), &policy, &json!({"path": "a.txt"}));
        assert!(read_outcome.result.ok);
        assert_eq!(read_outcome.result.payload["contents"], json!("hello"));
    }

    #[test]
    fn edit_file_rejects_ambiguous_match() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PolicyConfig::default();
        write_file(dir.path(), &policy, &json!({"path": "a.txt", "contents": "foo foo"}));
        let outcome = edit_file(
            dir.path(),
            &policy,
            &json!({"path": "a.txt", "old_text": "foo", "new_text": "bar"}),
        );
        assert!(!outcome.result.ok);
        assert_eq!(outcome.result.error_code.as_deref(), Some(ErrorCode::EAmbiguous.as_str()));
    }

    #[test]
    fn edit_file_replaces_unique_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PolicyConfig::default();
        write_file(dir.path(), &policy, &json!({"path": "a.txt", "contents": "def foo():\n    pass\n"}));
        let outcome = edit_file(
            dir.path(),
            &policy,
            &json!({"path": "a.txt", "old_text": "def foo():", "new_text": "def foo():\n    \"\"\"doc\"\"\""}),
        );
        assert!(outcome.result.ok);
        let read_outcome = read_file(dir.path(), &policy, &json!({"path": "a.txt"}));
        assert!(read_outcome.result.payload["contents"]
            .as_str()
            .unwrap()
            .contains("doc"));
    }

    #[test]
    fn grep_finds_pattern_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PolicyConfig::default();
        write_file(dir.path(), &policy, &json!({"path": "a.txt", "contents": "one\nTODO fix\nthree"}));
        let outcome = grep(dir.path(), &policy, &json!({"pattern": "TODO"}));
        assert!(outcome.result.ok);
        assert_eq!(outcome.result.payload["hits"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn grep_with_no_matches_returns_no_results_error() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PolicyConfig::default();
        write_file(dir.path(), &policy, &json!({"path": "a.txt", "contents": "nothing here"}));
        let outcome = grep(dir.path(), &policy, &json!({"pattern": "TODO"}));
        assert!(!outcome.result.ok);
        assert_eq!(outcome.result.error_code.as_deref(), Some(ErrorCode::ENoResults.as_str()));
    }

    #[test]
    fn apply_patch_succeeds_on_unique_context() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PolicyConfig::default();
        write_file(dir.path(), &policy, &json!({"path": "a.py", "contents": "def foo():\n    pass\n"}));
        let outcome = apply_patch(
            dir.path(),
            &policy,
            &json!({
                "path": "a.py",
                "hunks": [{"before": "def foo():", "after": "def foo():\n    \"\"\"doc\"\"\""}],
            }),
        );
        assert!(outcome.result.ok);
        let read_outcome = read_file(dir.path(), &policy, &json!({"path": "a.py"}));
        assert!(read_outcome.result.payload["contents"]
            .as_str()
            .unwrap()
            .contains("doc"));
    }

    #[test]
    fn apply_patch_with_missing_context_returns_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PolicyConfig::default();
        write_file(dir.path(), &policy, &json!({"path": "a.py", "contents": "def foo():\n    pass\n"}));
        let outcome = apply_patch(
            dir.path(),
            &policy,
            &json!({
                "path": "a.py",
                "hunks": [{"before": "def bar():", "after": "def bar():\n    pass"}],
            }),
        );
        assert!(!outcome.result.ok);
        assert_eq!(outcome.result.error_code.as_deref(), Some(ErrorCode::EConflict.as_str()));
    }

    #[test]
    fn apply_patch_with_ambiguous_context_returns_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PolicyConfig::default();
        write_file(dir.path(), &policy, &json!({"path": "a.py", "contents": "foo\nfoo\n"}));
        let outcome = apply_patch(
            dir.path(),
            &policy,
            &json!({
                "path": "a.py",
                "hunks": [{"before": "foo", "after": "bar"}],
            }),
        );
        assert!(!outcome.result.ok);
        assert_eq!(outcome.result.error_code.as_deref(), Some(ErrorCode::EAmbiguous.as_str()));
    }

    #[test]
    fn run_cmd_denies_blocked_first_token() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PolicyConfig::default();
        let outcome = run_cmd(dir.path(), &json!({"command": "rm -rf /"}), &policy);
        assert!(!outcome.result.ok);
        assert_eq!(outcome.result.error_code.as_deref(), Some(ErrorCode::ECmdDenied.as_str()));
    }

    #[test]
    fn run_cmd_does_not_leak_ambient_secret_env_var() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PolicyConfig::default();
        std::env::set_var("SOME_API_KEY", "sk-super-secret");
        let outcome = run_cmd(dir.path(), &json!({"command": "env"}), &policy);
        std::env::remove_var("SOME_API_KEY");
        assert!(outcome.result.ok);
        let stdout = outcome.result.payload["stdout"].as_str().unwrap_or("");
        assert!(!stdout.contains("sk-super-secret"));
    }
}
