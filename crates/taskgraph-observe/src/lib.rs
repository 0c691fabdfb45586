//! Event/Audit Bus (§4.13): append-only JSONL log plus non-blocking
//! in-process pub/sub, with recursive sensitive-key redaction applied before
//! anything is written or dispatched. Structured operational logging goes
//! through `tracing`, layered alongside (not replacing) the audit log.
//!
//! Grounded on the teacher's `Observer` (`deepseek-observe/src/lib.rs`): an
//! append-only log file under the workspace's runtime dir, opened in append
//! mode per write, with a verbose/stderr side channel. The teacher's telemetry
//! HTTP sink has no counterpart here — events are bus-local and file-logged
//! only (§4.13 does not describe an outbound telemetry collector).

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;
use taskgraph_core::runtime_dir;
use uuid::Uuid;

/// The closed kind vocabulary from §4.13 (`tool_call_*` / `policy_deny_*`
/// collapse to one variant each with the specific sub-kind carried in `data`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TurnStart,
    IntentClassified,
    PlanGenerated,
    ToolCallStarted,
    ToolCallFinished,
    ControlSignal,
    ApprovalRequired,
    PolicyDeny,
    LlmRequestParams,
    LlmResponse,
    LlmError,
    /// Which model tier served a given request, mirroring the teacher's
    /// `RouterDecision` telemetry since the model is an open parameter per
    /// request rather than a single fixed choice.
    ModelSelected,
    /// Token accounting for one completed LLM call.
    UsageUpdated,
    TurnComplete,
}

/// One audit event (§4.13: `{ts, trace_id, session_id, project_id, kind,
/// data}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub ts: DateTime<Utc>,
    pub trace_id: Uuid,
    pub session_id: Uuid,
    pub project_id: String,
    pub kind: EventKind,
    pub data: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(
        trace_id: Uuid,
        session_id: Uuid,
        project_id: impl Into<String>,
        kind: EventKind,
        data: serde_json::Value,
    ) -> Self {
        Self {
            ts: Utc::now(),
            trace_id,
            session_id,
            project_id: project_id.into(),
            kind,
            data,
        }
    }
}

/// Recursively masks object keys matching the sensitive-key pattern
/// (case-insensitive `api_key|token|authorization|password|secret|cookie|
/// set-cookie`), plus a string-level regex mask for bearer tokens embedded in
/// otherwise-innocuous string values (§4.13 sensitive-data redaction).
pub fn redact(value: &serde_json::Value) -> serde_json::Value {
    static SENSITIVE_KEY: &str =
        "(?i)api_key|token|authorization|password|secret|cookie|set-cookie";
    let key_re = Regex::new(SENSITIVE_KEY).expect("static redaction regex is valid");
    redact_with(value, &key_re)
}

fn redact_with(value: &serde_json::Value, key_re: &Regex) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if key_re.is_match(k) {
                    out.insert(k.clone(), serde_json::Value::String("***REDACTED***".to_string()));
                } else {
                    out.insert(k.clone(), redact_with(v, key_re));
                }
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| redact_with(v, key_re)).collect())
        }
        serde_json::Value::String(s) => serde_json::Value::String(redact_string(s)),
        other => other.clone(),
    }
}

fn redact_string(s: &str) -> String {
    static BEARER: &str = r"(?i)\bbearer\s+[a-z0-9._-]{8,}";
    let bearer_re = Regex::new(BEARER).expect("static bearer regex is valid");
    bearer_re.replace_all(s, "Bearer ***REDACTED***").into_owned()
}

/// A bounded per-event mailbox. `publish` uses `try_send`: a subscriber that
/// cannot keep up has this event dropped for it, per §5 backpressure policy
/// ("Event subscribers that cannot keep up lose events").
pub struct Subscription {
    receiver: Receiver<EventEnvelope>,
}

impl Subscription {
    pub fn try_recv(&self) -> Option<EventEnvelope> {
        self.receiver.try_recv().ok()
    }

    pub fn iter_available(&self) -> impl Iterator<Item = EventEnvelope> + '_ {
        self.receiver.try_iter()
    }
}

struct SubscriberSlot {
    sender: SyncSender<EventEnvelope>,
}

/// The Event/Audit Bus: append-only log + in-process pub/sub.
pub struct EventBus {
    log_path: PathBuf,
    subscribers: Mutex<Vec<SubscriberSlot>>,
    dropped_count: AtomicU64,
    log_mutex: Mutex<()>,
}

const SUBSCRIBER_MAILBOX_CAPACITY: usize = 256;

impl EventBus {
    pub fn new(workspace: &Path) -> anyhow::Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("audit.log"),
            subscribers: Mutex::new(Vec::new()),
            dropped_count: AtomicU64::new(0),
            log_mutex: Mutex::new(()),
        })
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = sync_channel(SUBSCRIBER_MAILBOX_CAPACITY);
        self.subscribers.lock().unwrap().push(SubscriberSlot { sender: tx });
        Subscription { receiver: rx }
    }

    /// Writes the redacted event to the audit log, then fans it out to every
    /// subscriber non-blockingly. Publish order is the causal order of the
    /// action that produced the event (§5 ordering guarantees).
    pub fn publish(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        let redacted = EventEnvelope {
            data: redact(&event.data),
            ..event.clone()
        };
        self.append_log_line(&serde_json::to_string(&redacted)?)?;

        tracing::info!(
            trace_id = %redacted.trace_id,
            kind = ?redacted.kind,
            "event"
        );

        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|slot| match slot.sender.try_send(redacted.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped_count.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        Ok(())
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    fn append_log_line(&self, line: &str) -> anyhow::Result<()> {
        let _guard = self.log_mutex.lock().unwrap();
        let mut f = OpenOptions::new().create(true).append(true).open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}

/// Installs a `tracing-subscriber` with env-filter defaulting to `info`,
/// matching the teacher's convention of a process-wide subscriber installed
/// once at CLI start.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_event(kind: EventKind, data: serde_json::Value) -> EventEnvelope {
        EventEnvelope::new(Uuid::now_v7(), Uuid::now_v7(), "proj", kind, data)
    }

    #[test]
    fn redact_masks_sensitive_keys_recursively() {
        let value = serde_json::json!({
            "tool": "fs.write",
            "args": {"api_key": "sk-123", "nested": {"password": "hunter2"}},
        });
        let redacted = redact(&value);
        assert_eq!(redacted["args"]["api_key"], "***REDACTED***");
        assert_eq!(redacted["args"]["nested"]["password"], "***REDACTED***");
        assert_eq!(redacted["tool"], "fs.write");
    }

    #[test]
    fn redact_masks_bearer_tokens_in_strings() {
        let value = serde_json::json!({"header": "Authorization header: Bearer abc123def456"});
        let redacted = redact(&value);
        assert!(redacted["header"].as_str().unwrap().contains("***REDACTED***"));
        assert!(!redacted["header"].as_str().unwrap().contains("abc123def456"));
    }

    #[test]
    fn publish_writes_append_only_log_line() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new(dir.path()).unwrap();
        bus.publish(&sample_event(EventKind::TurnStart, serde_json::json!({"n": 1})))
            .unwrap();
        bus.publish(&sample_event(EventKind::TurnComplete, serde_json::json!({"n": 2})))
            .unwrap();

        let log_path = runtime_dir(dir.path()).join("audit.log");
        let contents = fs::read_to_string(log_path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn subscriber_receives_published_events() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new(dir.path()).unwrap();
        let sub = bus.subscribe();
        bus.publish(&sample_event(EventKind::ToolCallStarted, serde_json::json!({})))
            .unwrap();
        let received = sub.try_recv().expect("event delivered");
        assert_eq!(received.kind, EventKind::ToolCallStarted);
    }

    #[test]
    fn full_subscriber_mailbox_drops_without_blocking_publish() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new(dir.path()).unwrap();
        let sub = bus.subscribe();
        for _ in 0..(SUBSCRIBER_MAILBOX_CAPACITY + 10) {
            bus.publish(&sample_event(EventKind::ToolCallFinished, serde_json::json!({})))
                .unwrap();
        }
        assert!(bus.dropped_count() > 0);
        drop(sub);
    }
}
