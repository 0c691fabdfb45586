//! Conversation messages (§3 Message, §9 "dynamic typing of messages").
//!
//! The original implementation lets `content` be either a bare string or a
//! list of typed parts. We model that as a tagged variant instead of an
//! untyped union, and give merging (used when two adjacent tool-turn
//! messages get coalesced) a total, exhaustively-tested four-case function.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageRef { path: String },
}

/// Either a bare string or an ordered sequence of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn text(s: impl Into<String>) -> Self {
        MessageContent::Text(s.into())
    }

    /// Flattened text view, concatenating part text and dropping image refs.
    pub fn as_plain_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageRef { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn image_paths(&self) -> Vec<&str> {
        match self {
            MessageContent::Text(_) => vec![],
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ImageRef { path } => Some(path.as_str()),
                    ContentPart::Text { .. } => None,
                })
                .collect(),
        }
    }
}

/// Total merge over the four (str|list) x (str|list) cases, coalescing
/// adjacent text parts/text strings rather than ever dropping either side.
pub fn merge_content(a: &MessageContent, b: &MessageContent) -> MessageContent {
    match (a, b) {
        (MessageContent::Text(a), MessageContent::Text(b)) => {
            MessageContent::Text(format!("{a}{b}"))
        }
        (MessageContent::Text(a), MessageContent::Parts(b)) => {
            let mut parts = Vec::with_capacity(b.len() + 1);
            if !a.is_empty() {
                parts.push(ContentPart::Text { text: a.clone() });
            }
            parts.extend(b.iter().cloned());
            MessageContent::Parts(coalesce_text_parts(parts))
        }
        (MessageContent::Parts(a), MessageContent::Text(b)) => {
            let mut parts = a.clone();
            if !b.is_empty() {
                parts.push(ContentPart::Text { text: b.clone() });
            }
            MessageContent::Parts(coalesce_text_parts(parts))
        }
        (MessageContent::Parts(a), MessageContent::Parts(b)) => {
            let mut parts = a.clone();
            parts.extend(b.iter().cloned());
            MessageContent::Parts(coalesce_text_parts(parts))
        }
    }
}

fn coalesce_text_parts(parts: Vec<ContentPart>) -> Vec<ContentPart> {
    let mut out: Vec<ContentPart> = Vec::with_capacity(parts.len());
    for part in parts {
        match (&mut out.last_mut(), &part) {
            (Some(ContentPart::Text { text: prev }), ContentPart::Text { text }) => {
                prev.push_str(text);
            }
            _ => out.push(part),
        }
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::text(text),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::text(text),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::text(text),
        }
    }

    pub fn tool(text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::text(text),
        }
    }
}
