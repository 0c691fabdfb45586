//! Shared JSON-from-prose extraction, used by both the Planner (plan
//! documents) and the Step Executor (tool calls / control envelopes) since
//! both parse one JSON object out of otherwise free-form model text.
//!
//! Grounded on `deepseek-agent/src/planner/parsing.rs`'s fence-or-bare-object
//! extraction strategy.

/// Strips a ```json fence if present, otherwise returns the first balanced
/// `{...}` span in `text`.
pub fn extract_json_span(text: &str) -> Option<String> {
    let fenced = text
        .split("```json")
        .nth(1)
        .and_then(|rest| rest.split("```").next());
    if let Some(block) = fenced {
        let trimmed = block.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    let start = text.find('{')?;
    let mut depth = 0i32;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
