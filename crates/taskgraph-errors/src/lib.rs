//! Error taxonomy and user-facing guidance (§7).
//!
//! `ErrorCode` is the closed `error_code` vocabulary carried on the wire in
//! `ToolResult`/turn-outcome payloads. `EnhancedError` is the presentation
//! layer wrapped around any `anyhow::Error` before it reaches a human,
//! following the teacher's `EnhancedError`/`ErrorHandler` split.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed `error_code` vocabulary (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    EUnknownTool,
    EBadArgs,
    EPathDenied,
    ECmdDenied,
    EApprovalRequired,
    ETimeout,
    ECancelled,
    ENotFound,
    EConflict,
    EAmbiguous,
    EPlanParse,
    EInvalidOutput,
    EStuttering,
    EProviderFailed,
    ENotConfigured,
    ENoResults,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::EUnknownTool => "E_UNKNOWN_TOOL",
            ErrorCode::EBadArgs => "E_BAD_ARGS",
            ErrorCode::EPathDenied => "E_PATH_DENIED",
            ErrorCode::ECmdDenied => "E_CMD_DENIED",
            ErrorCode::EApprovalRequired => "E_APPROVAL_REQUIRED",
            ErrorCode::ETimeout => "E_TIMEOUT",
            ErrorCode::ECancelled => "E_CANCELLED",
            ErrorCode::ENotFound => "E_NOT_FOUND",
            ErrorCode::EConflict => "E_CONFLICT",
            ErrorCode::EAmbiguous => "E_AMBIGUOUS",
            ErrorCode::EPlanParse => "E_PLAN_PARSE",
            ErrorCode::EInvalidOutput => "E_INVALID_OUTPUT",
            ErrorCode::EStuttering => "E_STUTTERING",
            ErrorCode::EProviderFailed => "E_PROVIDER_FAILED",
            ErrorCode::ENotConfigured => "E_NOT_CONFIGURED",
            ErrorCode::ENoResults => "E_NO_RESULTS",
        }
    }

    /// Whether the model should see this in feedback and may retry on its
    /// own, vs. a denial that requires a re-plan or human decision (§7
    /// propagation policy).
    pub fn is_model_recoverable(self) -> bool {
        !matches!(
            self,
            ErrorCode::EApprovalRequired
                | ErrorCode::ECmdDenied
                | ErrorCode::EPathDenied
                | ErrorCode::ECancelled
                | ErrorCode::EProviderFailed
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categories for `EnhancedError`, distinct from `ErrorCode`: this is a
/// coarser grouping used only to pick an emoji/suggestion set for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Configuration,
    Network,
    Permission,
    Runtime,
    Validation,
    Policy,
    Unknown,
}

impl ErrorType {
    pub fn emoji(self) -> &'static str {
        match self {
            ErrorType::Configuration => "\u{1F527}",
            ErrorType::Network => "\u{1F310}",
            ErrorType::Permission => "\u{1F512}",
            ErrorType::Runtime => "\u{26A1}",
            ErrorType::Validation => "\u{1F4CB}",
            ErrorType::Policy => "\u{1F6E1}",
            ErrorType::Unknown => "\u{2753}",
        }
    }
}

/// A user-facing error: title, message, recovery suggestions, and the
/// originating `error_code` when there is one (§7 propagation policy:
/// a user-visible message that preserves the trace id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedError {
    pub title: String,
    pub message: String,
    pub suggestions: Vec<String>,
    pub error_type: ErrorType,
    pub code: Option<ErrorCode>,
    pub trace_id: Option<String>,
}

impl EnhancedError {
    pub fn new(title: impl Into<String>, message: impl Into<String>, error_type: ErrorType) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            suggestions: Vec::new(),
            error_type,
            code: None,
            trace_id: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions.extend(suggestions);
        self
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn into_error(self) -> anyhow::Error {
        anyhow::Error::new(self)
    }

    pub fn format(&self, verbose: bool) -> String {
        let mut out = String::new();
        out.push_str(&format!("{} {}\n", self.error_type.emoji(), self.title));
        out.push_str(&format!("  {}\n", self.message));
        if verbose {
            if let Some(trace_id) = &self.trace_id {
                out.push_str(&format!("\n  Trace: {trace_id}\n"));
            }
            if let Some(code) = self.code {
                out.push_str(&format!("  Code: {code}\n"));
            }
        }
        if !self.suggestions.is_empty() {
            out.push_str("\n  Suggestions:\n");
            for (i, suggestion) in self.suggestions.iter().enumerate() {
                out.push_str(&format!("    {}. {}\n", i + 1, suggestion));
            }
        }
        out
    }
}

impl fmt::Display for EnhancedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format(false))
    }
}

impl std::error::Error for EnhancedError {}

/// Wraps an `ErrorCode` into a ready-made `EnhancedError` with stock
/// suggestions (§7 error kinds). One constructor per code, used by the
/// dispatcher/orchestrator layers when they need to surface a code to a human
/// rather than just feed it back to the model.
pub mod guidance {
    use super::*;

    pub fn for_code(code: ErrorCode, detail: &str) -> EnhancedError {
        match code {
            ErrorCode::EUnknownTool => EnhancedError::new(
                "Unknown Tool",
                format!("The model requested a tool that is not registered: {detail}"),
                ErrorType::Validation,
            )
            .with_code(code)
            .with_suggestion("Check the tool registry for the correct name"),
            ErrorCode::EBadArgs => EnhancedError::new(
                "Invalid Tool Arguments",
                format!("Arguments failed schema validation: {detail}"),
                ErrorType::Validation,
            )
            .with_code(code)
            .with_suggestion("Review the tool's args_schema and required fields"),
            ErrorCode::EPathDenied => EnhancedError::new(
                "Path Denied",
                format!("Path escapes the workspace sandbox: {detail}"),
                ErrorType::Policy,
            )
            .with_code(code)
            .with_suggestion("Use a path inside the workspace root"),
            ErrorCode::ECmdDenied => EnhancedError::new(
                "Command Denied",
                format!("Command is on the deny list or not allowlisted: {detail}"),
                ErrorType::Policy,
            )
            .with_code(code)
            .with_suggestion("Request an allowlist change from the operator"),
            ErrorCode::EApprovalRequired => EnhancedError::new(
                "Approval Required",
                "This operation is high risk and needs human approval before it can run.",
                ErrorType::Policy,
            )
            .with_code(code)
            .with_suggestion("Approve or reject the pending request"),
            ErrorCode::ETimeout => EnhancedError::new(
                "Timed Out",
                format!("Operation exceeded its timeout: {detail}"),
                ErrorType::Runtime,
            )
            .with_code(code)
            .with_suggestion("Increase the timeout or narrow the operation's scope"),
            ErrorCode::ECancelled => EnhancedError::new(
                "Cancelled",
                "The turn was cancelled before it completed.",
                ErrorType::Runtime,
            )
            .with_code(code),
            ErrorCode::ENotFound => EnhancedError::new(
                "Not Found",
                format!("{detail}"),
                ErrorType::Validation,
            )
            .with_code(code),
            ErrorCode::EConflict => EnhancedError::new(
                "Patch Conflict",
                format!("The file changed since it was last read: {detail}"),
                ErrorType::Runtime,
            )
            .with_code(code)
            .with_suggestion("Re-read the file and regenerate the patch"),
            ErrorCode::EAmbiguous => EnhancedError::new(
                "Ambiguous Patch",
                format!("More than one location matches the hunk context: {detail}"),
                ErrorType::Runtime,
            )
            .with_code(code)
            .with_suggestion("Add more surrounding context to disambiguate the hunk"),
            ErrorCode::EPlanParse => EnhancedError::new(
                "Plan Parse Failed",
                format!("The model's plan output could not be parsed: {detail}"),
                ErrorType::Runtime,
            )
            .with_code(code),
            ErrorCode::EInvalidOutput => EnhancedError::new(
                "Invalid Step Output",
                format!("The model's step output did not match any known form: {detail}"),
                ErrorType::Runtime,
            )
            .with_code(code),
            ErrorCode::EStuttering => EnhancedError::new(
                "Repetitive Tool Calls",
                "The same tool call was issued repeatedly with no progress.",
                ErrorType::Runtime,
            )
            .with_code(code)
            .with_suggestion("Forcing a re-plan"),
            ErrorCode::EProviderFailed => EnhancedError::new(
                "Provider Failed",
                format!("The LLM provider failed after retries: {detail}"),
                ErrorType::Network,
            )
            .with_code(code)
            .with_suggestion("Check provider status and API key configuration"),
            ErrorCode::ENotConfigured => EnhancedError::new(
                "Not Configured",
                format!("Missing required configuration: {detail}"),
                ErrorType::Configuration,
            )
            .with_code(code)
            .with_suggestion("Run the setup flow to populate configuration"),
            ErrorCode::ENoResults => EnhancedError::new(
                "No Results",
                format!("The operation completed but returned nothing: {detail}"),
                ErrorType::Validation,
            )
            .with_code(code),
        }
    }
}

/// Classifies and formats arbitrary `anyhow::Error`s for display, following
/// the teacher's `ErrorHandler` (downcast to `EnhancedError` first, fall back
/// to message-pattern classification).
pub struct ErrorHandler {
    verbose: bool,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self { verbose: false }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn handle(&self, error: &anyhow::Error) -> String {
        if let Some(enhanced) = error.downcast_ref::<EnhancedError>() {
            return enhanced.format(self.verbose);
        }
        self.classify(&error.to_string()).format(self.verbose)
    }

    fn classify(&self, message: &str) -> EnhancedError {
        let lower = message.to_lowercase();
        if lower.contains("api key") || lower.contains("not_configured") || lower.contains("configuration") {
            return EnhancedError::new("Configuration Error", message, ErrorType::Configuration)
                .with_code(ErrorCode::ENotConfigured)
                .with_suggestions(vec![
                    "Check the taskgraph config file".to_string(),
                    "Set the provider's API key environment variable".to_string(),
                ]);
        }
        if lower.contains("timeout") || lower.contains("connection") || lower.contains("network") {
            return EnhancedError::new("Network Error", message, ErrorType::Network)
                .with_code(ErrorCode::EProviderFailed)
                .with_suggestion("Check connectivity and retry");
        }
        if lower.contains("permission") || lower.contains("denied") || lower.contains("sandbox") {
            return EnhancedError::new("Permission Error", message, ErrorType::Permission)
                .with_code(ErrorCode::EPathDenied)
                .with_suggestion("Adjust the policy allowlist or approve the pending request");
        }
        EnhancedError::new("Error", message, ErrorType::Unknown)
            .with_suggestion("Check the audit log for the full trace")
    }
}
