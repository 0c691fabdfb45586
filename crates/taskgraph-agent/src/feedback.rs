//! Feedback Shaper (§4.10): compresses a tool's raw output before it is fed
//! back to the model, at one of three tiers (§6 configuration enumerates
//! `minimal` / `balanced` / `aggressive`, already modeled as
//! `taskgraph_core::CompressionLevel`).
//!
//! Grounded on the teacher's tool-output truncation in
//! `deepseek-agent/src/tools_runtime/output.rs` (head/tail preservation with
//! an "N lines omitted" marker rather than a hard mid-string cut), narrowed
//! to three named tiers instead of the teacher's single fixed cap.

use serde_json::Value;
use taskgraph_core::CompressionLevel;

const MINIMAL_MAX_CHARS: usize = 20_000;
const BALANCED_MAX_CHARS: usize = 4_000;
const AGGRESSIVE_MAX_CHARS: usize = 800;

const MINIMAL_MAX_ITEMS: usize = 50;
const BALANCED_MAX_ITEMS: usize = 20;
const AGGRESSIVE_MAX_ITEMS: usize = 5;

pub struct FeedbackShaper;

impl FeedbackShaper {
    /// Shapes a tool result's `payload` for the given compression tier,
    /// branching on the payload's own shape rather than treating every
    /// result as opaque text (§4.10): a JSON array is list-shaped and kept
    /// as head-N elements with a count suffix; anything else is
    /// byte/char-shaped and kept as head+tail with an "omitted" marker.
    /// Failed results (`ok == false`) bypass shaping entirely and are
    /// preserved verbatim, bounded only by a hard cap far above any tier's
    /// budget, since error text is the model's one chance to self-correct
    /// (§4.10 "always preserve error text verbatim (bounded)").
    pub fn shape(payload: &Value, ok: bool, level: CompressionLevel) -> String {
        if !ok {
            return preserve_error_verbatim(payload);
        }
        match payload {
            Value::Array(items) => shape_list(items, level),
            other => {
                let text = other.to_string();
                let max_chars = char_budget(level);
                if text.chars().count() <= max_chars {
                    text
                } else {
                    truncate_head_tail(&text, max_chars)
                }
            }
        }
    }
}

fn char_budget(level: CompressionLevel) -> usize {
    match level {
        CompressionLevel::Minimal => MINIMAL_MAX_CHARS,
        CompressionLevel::Balanced => BALANCED_MAX_CHARS,
        CompressionLevel::Aggressive => AGGRESSIVE_MAX_CHARS,
    }
}

fn item_budget(level: CompressionLevel) -> usize {
    match level {
        CompressionLevel::Minimal => MINIMAL_MAX_ITEMS,
        CompressionLevel::Balanced => BALANCED_MAX_ITEMS,
        CompressionLevel::Aggressive => AGGRESSIVE_MAX_ITEMS,
    }
}

/// List-shaped results keep the first N elements and note how many were
/// dropped, rather than cutting mid-element with head/tail ellipsis — the
/// model reads better from a clean prefix of a list than from half of one
/// element and half of another (§4.10 "head-N with a count suffix").
fn shape_list(items: &[Value], level: CompressionLevel) -> String {
    let max_items = item_budget(level);
    if items.len() <= max_items {
        return Value::Array(items.to_vec()).to_string();
    }
    let head: Vec<Value> = items[..max_items].to_vec();
    let omitted = items.len() - max_items;
    format!(
        "{}\n... [{omitted} more items omitted, {} total] ...",
        Value::Array(head),
        items.len()
    )
}

/// A hard cap well above any compression tier's budget, so pathologically
/// large error payloads (a runaway stack trace, a dumped file) don't reach
/// the model in full, while any realistic error message passes through
/// untouched.
const ERROR_HARD_CAP_CHARS: usize = 50_000;

fn preserve_error_verbatim(payload: &Value) -> String {
    let text = match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() <= ERROR_HARD_CAP_CHARS {
        return text;
    }
    let chars: Vec<char> = text.chars().collect();
    let kept: String = chars[..ERROR_HARD_CAP_CHARS].iter().collect();
    let omitted = chars.len() - ERROR_HARD_CAP_CHARS;
    format!("{kept}\n... [{omitted} characters omitted] ...")
}

fn truncate_head_tail(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let keep_each = max_chars / 2;
    let head: String = chars[..keep_each].iter().collect();
    let tail: String = chars[chars.len() - keep_each..].iter().collect();
    let omitted = chars.len() - (keep_each * 2);
    format!("{head}\n... [{omitted} characters omitted] ...\n{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_passes_through_unchanged_at_every_tier() {
        let payload = Value::String("short output".to_string());
        let expected = payload.to_string();
        assert_eq!(FeedbackShaper::shape(&payload, true, CompressionLevel::Minimal), expected);
        assert_eq!(FeedbackShaper::shape(&payload, true, CompressionLevel::Balanced), expected);
        assert_eq!(FeedbackShaper::shape(&payload, true, CompressionLevel::Aggressive), expected);
    }

    #[test]
    fn aggressive_compresses_more_than_balanced() {
        let payload = Value::String("x".repeat(10_000));
        let balanced = FeedbackShaper::shape(&payload, true, CompressionLevel::Balanced);
        let aggressive = FeedbackShaper::shape(&payload, true, CompressionLevel::Aggressive);
        assert!(aggressive.len() < balanced.len());
    }

    #[test]
    fn truncation_marks_omitted_content_rather_than_silently_dropping_it() {
        let payload = Value::String("y".repeat(5_000));
        let shaped = FeedbackShaper::shape(&payload, true, CompressionLevel::Aggressive);
        assert!(shaped.contains("omitted"));
    }

    #[test]
    fn list_shaped_payload_keeps_head_n_with_count_suffix() {
        let items: Vec<Value> = (0..100).map(|i| Value::from(i)).collect();
        let payload = Value::Array(items);
        let shaped = FeedbackShaper::shape(&payload, true, CompressionLevel::Aggressive);
        assert!(shaped.contains("more items omitted"));
        assert!(shaped.contains("100 total"));
        assert!(shaped.contains('0'));
        assert!(!shaped.contains("99"));
    }

    #[test]
    fn short_list_passes_through_without_count_suffix() {
        let items: Vec<Value> = (0..3).map(|i| Value::from(i)).collect();
        let payload = Value::Array(items);
        let shaped = FeedbackShaper::shape(&payload, true, CompressionLevel::Aggressive);
        assert!(!shaped.contains("omitted"));
    }

    #[test]
    fn failed_result_preserves_error_text_verbatim_even_over_tier_budget() {
        let text = "z".repeat(5_000);
        let payload = Value::String(text.clone());
        let shaped = FeedbackShaper::shape(&payload, false, CompressionLevel::Aggressive);
        assert_eq!(shaped, text);
    }

    #[test]
    fn failed_result_still_bounded_by_hard_cap() {
        let text = "w".repeat(ERROR_HARD_CAP_CHARS + 1_000);
        let payload = Value::String(text);
        let shaped = FeedbackShaper::shape(&payload, false, CompressionLevel::Minimal);
        assert!(shaped.contains("omitted"));
        assert!(shaped.chars().count() < ERROR_HARD_CAP_CHARS + 1_000);
    }
}
