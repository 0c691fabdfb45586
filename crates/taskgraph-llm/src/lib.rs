//! LLM HTTP transport contract (§6 "LLM HTTP contract"): `chat(messages,
//! model, temperature, max_tokens, timeout) -> {text, usage, model}` for
//! OpenAI-compatible endpoints, with message-content normalization and
//! exponential-backoff-with-jitter retry (§5 Backpressure: "0.5s, 1s, 2s;
//! max 3 attempts" on timeout/429/5xx).
//!
//! Grounded on the teacher's `DeepSeekClient`/`LlmClient`
//! (`deepseek-llm/src/lib.rs`): same `reqwest::blocking::Client` transport,
//! same attempt-loop-with-sleep retry shape, same non-streaming JSON
//! response parsing. Narrowed to the `chat`-only contract §6 names (no
//! streaming callback, no DeepSeek-specific prompt-cache annotation —
//! out of scope here) and given a typed `LlmError` instead of the teacher's
//! blanket `anyhow::Error`.

use std::time::Duration;

use rand::Rng;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use taskgraph_core::{Message, MessageContent, Role};

const RETRY_DELAYS_MS: [u64; 3] = [500, 1000, 2000];
const MAX_ATTEMPTS: u8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,
    #[error("could not connect to the provider: {0}")]
    Connect(String),
    #[error("provider returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub usage: Usage,
    pub model: String,
}

pub trait LlmClient {
    fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError>;
}

/// Converts this system's `Message`/`MessageContent` into the provider's
/// OpenAI-compatible wire shape: `content` is a bare string for
/// text-only messages, or an array of `{type: "text"|"image_url", ...}`
/// parts when the message carries image references (§6 "Connector
/// normalizes multimodal parts to the provider's expected shape").
fn to_provider_message(message: &Message) -> Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let content = match &message.content {
        MessageContent::Text(text) => json!(text),
        MessageContent::Parts(parts) => {
            let rendered: Vec<Value> = parts
                .iter()
                .map(|part| match part {
                    taskgraph_core::ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    taskgraph_core::ContentPart::ImageRef { path } => {
                        json!({"type": "image_url", "image_url": {"url": path}})
                    }
                })
                .collect();
            json!(rendered)
        }
    };
    json!({"role": role, "content": content})
}

pub struct HttpLlmClient {
    endpoint: String,
    api_key: String,
    client: Client,
}

impl HttpLlmClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            client,
        })
    }

    fn build_payload(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(to_provider_message).collect();
        let mut payload = json!({
            "model": req.model,
            "messages": messages,
            "temperature": req.temperature,
            "stream": false,
        });
        if let Some(max_tokens) = req.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        payload
    }
}

impl LlmClient for HttpLlmClient {
    fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let payload = self.build_payload(req);
        let mut attempt: u8 = 0;

        loop {
            let response = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .timeout(req.timeout)
                .json(&payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().map_err(|e| LlmError::Connect(e.to_string()))?;
                    if status.is_success() {
                        return parse_chat_response(&body, &req.model);
                    }
                    if should_retry_status(status) && attempt + 1 < MAX_ATTEMPTS {
                        std::thread::sleep(backoff_delay(attempt));
                        attempt += 1;
                        continue;
                    }
                    return Err(LlmError::HttpStatus {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(e) => {
                    if e.is_timeout() {
                        if attempt + 1 < MAX_ATTEMPTS {
                            std::thread::sleep(backoff_delay(attempt));
                            attempt += 1;
                            continue;
                        }
                        return Err(LlmError::Timeout);
                    }
                    if attempt + 1 < MAX_ATTEMPTS {
                        std::thread::sleep(backoff_delay(attempt));
                        attempt += 1;
                        continue;
                    }
                    return Err(LlmError::Connect(e.to_string()));
                }
            }
        }
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// `RETRY_DELAYS_MS[attempt]` plus up to 20% jitter, per §5's "exponential
/// backoff with jitter (default 0.5s, 1s, 2s)".
fn backoff_delay(attempt: u8) -> Duration {
    let base = RETRY_DELAYS_MS[(attempt as usize).min(RETRY_DELAYS_MS.len() - 1)];
    let jitter_ms = rand::thread_rng().gen_range(0..=(base / 5));
    Duration::from_millis(base + jitter_ms)
}

fn parse_chat_response(body: &str, model: &str) -> Result<ChatResponse, LlmError> {
    let value: Value = serde_json::from_str(body).map_err(|e| LlmError::Malformed(e.to_string()))?;
    let text = value["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| LlmError::Malformed("missing choices[0].message.content".to_string()))?
        .to_string();
    let usage = Usage {
        prompt_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        total_tokens: value["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32,
    };
    let response_model = value["model"].as_str().unwrap_or(model).to_string();
    Ok(ChatResponse {
        text,
        usage,
        model: response_model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgraph_core::ContentPart;

    #[test]
    fn to_provider_message_text_only_is_bare_string_content() {
        let message = Message::user("hello");
        let rendered = to_provider_message(&message);
        assert_eq!(rendered["role"], "user");
        assert_eq!(rendered["content"], "hello");
    }

    #[test]
    fn to_provider_message_parts_normalizes_image_refs() {
        let message = Message {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: "look at this".to_string() },
                ContentPart::ImageRef { path: "diagram.png".to_string() },
            ]),
        };
        let rendered = to_provider_message(&message);
        let parts = rendered["content"].as_array().expect("array content");
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "diagram.png");
    }

    #[test]
    fn parse_chat_response_extracts_text_and_usage() {
        let body = r#"{
            "model": "deepseek-chat",
            "choices": [{"message": {"content": "hi there"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let response = parse_chat_response(body, "fallback-model").expect("parses");
        assert_eq!(response.text, "hi there");
        assert_eq!(response.usage.total_tokens, 15);
        assert_eq!(response.model, "deepseek-chat");
    }

    #[test]
    fn parse_chat_response_missing_content_is_malformed() {
        let body = r#"{"choices": [{"message": {}}]}"#;
        let err = parse_chat_response(body, "m").unwrap_err();
        assert!(matches!(err, LlmError::Malformed(_)));
    }

    #[test]
    fn should_retry_status_covers_429_and_5xx_not_4xx() {
        assert!(should_retry_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!should_retry_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn backoff_delay_grows_with_attempt_number() {
        let first = backoff_delay(0);
        let last = backoff_delay(2);
        assert!(first.as_millis() >= 500);
        assert!(last.as_millis() >= 2000);
    }
}
