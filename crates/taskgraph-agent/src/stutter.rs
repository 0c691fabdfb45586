//! Doom-loop / stuttering detection (§4.5: "stutter window 8, threshold 3 —
//! if the same tool+args appears >= threshold times within the last `window`
//! calls, surface E_STUTTERING and force a replan").
//!
//! Grounded on `codingbuddy-agent/src/tool_loop/safety.rs`'s
//! `DoomLoopTracker`: a rolling `VecDeque` of `(call_fingerprint, turn_index)`
//! pairs bounded to a fixed window, a `DefaultHasher` fingerprint over the
//! raw call so args matter (not just the tool name), and a one-shot
//! "already warned this loop" flag that resets the moment a different call
//! breaks the streak. The teacher's window is 10 and its threshold 3; this
//! tracker uses the window size `LimitsConfig::stutter_window` calls for
//! (8 by default) instead of the teacher's literal constant, per §4.5.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CallFingerprint(String, u64);

fn fingerprint(tool_name: &str, args: &serde_json::Value) -> CallFingerprint {
    let mut hasher = DefaultHasher::new();
    args.to_string().hash(&mut hasher);
    CallFingerprint(tool_name.to_string(), hasher.finish())
}

/// Tracks the last `window` tool calls and reports whether the current call
/// has now repeated at least `threshold` times within that window.
pub struct StutterTracker {
    window: usize,
    threshold: usize,
    recent: VecDeque<CallFingerprint>,
    warning_injected: bool,
}

impl StutterTracker {
    pub fn new(window: usize, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            recent: VecDeque::with_capacity(window),
            warning_injected: false,
        }
    }

    /// Records one tool call and returns `true` the first time its repeat
    /// count within the window reaches `threshold` (one-shot per streak: a
    /// different call resets `warning_injected` so the next repeat streak
    /// can warn again).
    pub fn record(&mut self, tool_name: &str, args: &serde_json::Value) -> bool {
        let fp = fingerprint(tool_name, args);

        if self.recent.back() != Some(&fp) {
            self.warning_injected = false;
        }

        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(fp.clone());

        let repeats = self.recent.iter().filter(|f| **f == fp).count();
        if repeats >= self.threshold && !self.warning_injected {
            self.warning_injected = true;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.recent.clear();
        self.warning_injected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_calls_trigger_at_threshold() {
        let mut tracker = StutterTracker::new(8, 3);
        let args = json!({"path": "a.py"});
        assert!(!tracker.record("read_file", &args));
        assert!(!tracker.record("read_file", &args));
        assert!(tracker.record("read_file", &args));
    }

    #[test]
    fn different_args_do_not_count_toward_the_same_streak() {
        let mut tracker = StutterTracker::new(8, 3);
        assert!(!tracker.record("read_file", &json!({"path": "a.py"})));
        assert!(!tracker.record("read_file", &json!({"path": "b.py"})));
        assert!(!tracker.record("read_file", &json!({"path": "a.py"})));
    }

    #[test]
    fn warning_is_one_shot_until_a_different_call_breaks_the_streak() {
        let mut tracker = StutterTracker::new(8, 3);
        let args = json!({"path": "a.py"});
        tracker.record("read_file", &args);
        tracker.record("read_file", &args);
        assert!(tracker.record("read_file", &args));
        assert!(!tracker.record("read_file", &args), "already warned this streak");

        tracker.record("grep", &json!({"pattern": "TODO"}));
        assert!(
            tracker.record("read_file", &args),
            "the streak resumed after a single different call, so it can warn again"
        );
        assert!(!tracker.record("read_file", &args), "already warned this new streak");
    }

    #[test]
    fn window_evicts_old_calls_so_stale_repeats_do_not_count() {
        let mut tracker = StutterTracker::new(3, 3);
        let a = json!({"path": "a.py"});
        let b = json!({"path": "b.py"});
        tracker.record("read_file", &a);
        tracker.record("read_file", &a);
        tracker.record("read_file", &b);
        assert!(
            !tracker.record("read_file", &a),
            "one of the earlier a.py calls has scrolled out of the window"
        );
    }
}
