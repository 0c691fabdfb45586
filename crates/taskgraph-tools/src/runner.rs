//! Command Runner (§4.8): argv-vs-shell-mode detection, byte-budget output
//! capture, and timeout-triggered process-tree kill.
//!
//! Grounded on `deepseek-tools/src/shell.rs`'s `ShellRunner` trait and
//! `wait_timeout`-based wait loop, with two deliberate departures the spec
//! requires: (1) the teacher always shells out via `sh -lc`/`bash -lc`; here
//! shell-mode is only used when the command actually contains shell
//! metacharacters, otherwise the command runs as argv with no shell in
//! between (§4.8 "forces shell-mode, else argv mode"). (2) output is
//! captured under a byte budget with head/tail truncation instead of the
//! teacher's unbounded `String::from_utf8_lossy` capture.
//!
//! The spawned child's environment is never the ambient process
//! environment verbatim: `spawn()` clears it and replaces it with whatever
//! `env` map the caller passes in, which the dispatcher populates via
//! `taskgraph_policy::scrub_env` (§4.7 env scrub) before it ever reaches here.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

const SHELL_METACHARACTERS: &[char] = &[
    '|', '>', '<', '&', ';', '$', '`', '*', '?', '(', ')', '{', '}', '[', ']',
];

/// True if `cmd` needs a shell to interpret it (§4.8 shell-feature detector).
pub fn needs_shell(cmd: &str) -> bool {
    cmd.chars().any(|c| SHELL_METACHARACTERS.contains(&c))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub pid: Option<u32>,
    pub timed_out: bool,
    pub truncated: bool,
}

pub trait CommandRunner {
    fn run(&self, cmd: &str, cwd: &Path, env: &HashMap<String, String>, timeout: Duration) -> anyhow::Result<RunOutcome>;
}

#[derive(Debug, Default)]
pub struct PlatformCommandRunner {
    /// Per-stream capture budget (§4.8 default 64 KiB per stream).
    pub byte_budget: Option<usize>,
}

const DEFAULT_BYTE_BUDGET: usize = 64 * 1024;

impl PlatformCommandRunner {
    pub fn new() -> Self {
        Self { byte_budget: None }
    }

    fn budget(&self) -> usize {
        self.byte_budget.unwrap_or(DEFAULT_BYTE_BUDGET)
    }
}

impl CommandRunner for PlatformCommandRunner {
    fn run(&self, cmd: &str, cwd: &Path, env: &HashMap<String, String>, timeout: Duration) -> anyhow::Result<RunOutcome> {
        let started = std::time::Instant::now();
        let mut child = spawn(cmd, cwd, env)?;
        let pid = Some(child.id());

        let status = child.wait_timeout(timeout)?;
        let timed_out = status.is_none();
        if timed_out {
            kill_process_tree(&mut child);
        }

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_end(&mut stdout_buf);
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_end(&mut stderr_buf);
        }
        let exit_code = child.wait().ok().and_then(|s| s.code());

        let (stdout, stdout_truncated) = capture_with_budget(&stdout_buf, self.budget());
        let (stderr, stderr_truncated) = capture_with_budget(&stderr_buf, self.budget());

        Ok(RunOutcome {
            exit_code,
            stdout,
            stderr,
            duration_ms: started.elapsed().as_millis() as u64,
            pid,
            timed_out,
            truncated: stdout_truncated || stderr_truncated,
        })
    }
}

/// Keeps the head (33%) and tail (67%) of `bytes` when it exceeds `budget`,
/// per §4.8 "retain head (33%) and tail (67%), mark truncated=true".
fn capture_with_budget(bytes: &[u8], budget: usize) -> (String, bool) {
    if bytes.len() <= budget {
        return (String::from_utf8_lossy(bytes).into_owned(), false);
    }
    let head_len = budget / 3;
    let tail_len = budget - head_len;
    let head = String::from_utf8_lossy(&bytes[..head_len]);
    let tail = String::from_utf8_lossy(&bytes[bytes.len() - tail_len..]);
    (format!("{head}\n...[truncated]...\n{tail}"), true)
}

fn spawn(cmd: &str, cwd: &Path, env: &HashMap<String, String>) -> anyhow::Result<Child> {
    let resolved_cwd = if cwd.exists() {
        std::fs::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf())
    } else {
        cwd.to_path_buf()
    };

    let mut command = if needs_shell(cmd) {
        let mut c = shell_command();
        c.arg(cmd);
        c
    } else {
        let tokens = shell_words::split(cmd)?;
        let Some((program, args)) = tokens.split_first() else {
            anyhow::bail!("empty command");
        };
        let mut c = Command::new(program);
        c.args(args);
        c
    };

    command.current_dir(&resolved_cwd);
    command.env_clear();
    command.envs(env);
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.stdin(Stdio::null());
    #[cfg(unix)]
    set_process_group(&mut command);
    Ok(command.spawn()?)
}

#[cfg(target_os = "windows")]
fn shell_command() -> Command {
    let mut c = Command::new("cmd");
    c.arg("/C");
    c
}

#[cfg(not(target_os = "windows"))]
fn shell_command() -> Command {
    let mut c = Command::new("sh");
    c.arg("-c");
    c
}

#[cfg(unix)]
fn set_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        command.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
}

/// On timeout, kill the whole process group rather than just the immediate
/// child (§4.8 "terminate process tree").
#[cfg(unix)]
fn kill_process_tree(child: &mut Child) {
    let pid = child.id() as i32;
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_shell_detects_pipe() {
        assert!(needs_shell("ls | grep foo"));
        assert!(!needs_shell("ls -la"));
    }

    fn empty_env() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn argv_command_runs_without_shell() {
        let runner = PlatformCommandRunner::new();
        let outcome = runner
            .run("echo hello", Path::new("."), &empty_env(), Duration::from_secs(5))
            .expect("run");
        assert!(!outcome.timed_out);
        assert!(outcome.stdout.contains("hello"));
    }

    #[test]
    fn shell_mode_command_runs_via_shell() {
        let runner = PlatformCommandRunner::new();
        let outcome = runner
            .run("echo a && echo b", Path::new("."), &empty_env(), Duration::from_secs(5))
            .expect("run");
        assert!(outcome.stdout.contains('a'));
        assert!(outcome.stdout.contains('b'));
    }

    #[test]
    fn timeout_marks_timed_out() {
        let runner = PlatformCommandRunner::new();
        let outcome = runner
            .run("sleep 5", Path::new("."), &empty_env(), Duration::from_millis(100))
            .expect("run");
        assert!(outcome.timed_out);
    }

    #[test]
    fn byte_budget_truncates_large_output() {
        let runner = PlatformCommandRunner {
            byte_budget: Some(16),
        };
        let outcome = runner
            .run(
                "printf '0123456789abcdefghij'",
                Path::new("."),
                &empty_env(),
                Duration::from_secs(5),
            )
            .expect("run");
        assert!(outcome.truncated);
    }

    #[test]
    fn spawned_command_does_not_inherit_ambient_env() {
        let runner = PlatformCommandRunner::new();
        std::env::set_var("TASKGRAPH_RUNNER_TEST_CANARY", "should-not-leak");
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), std::env::var("PATH").unwrap_or_default());
        let outcome = runner
            .run(
                "echo $TASKGRAPH_RUNNER_TEST_CANARY",
                Path::new("."),
                &env,
                Duration::from_secs(5),
            )
            .expect("run");
        std::env::remove_var("TASKGRAPH_RUNNER_TEST_CANARY");
        assert!(!outcome.stdout.contains("should-not-leak"));
    }
}
