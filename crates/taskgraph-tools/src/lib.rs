//! Tool Registry, Dispatcher, Cache and Command Runner (§4.6, §4.7, §4.8).
//!
//! Grounded on `deepseek-tools` (`LocalToolHost`, `shell.rs`, `validation.rs`)
//! but reshaped around this system's `ArgSchema`-described, cacheable,
//! policy-gated tool contract instead of the teacher's per-tool hand-rolled
//! validators and always-shell-out command runner.

mod cache;
mod dispatcher;
mod handlers;
mod registry;
mod runner;
mod validate;

pub use cache::{cache_key, ToolCache};
pub use dispatcher::{ApprovalGate, DispatchContext, Dispatcher, NoApprovals};
pub use registry::{default_tool_specs, index_by_name};
pub use runner::{needs_shell, CommandRunner, PlatformCommandRunner, RunOutcome};
pub use validate::{validate_args, ValidationError};
