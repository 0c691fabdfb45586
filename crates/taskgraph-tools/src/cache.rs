//! Tool-result cache: LRU + TTL with path-indexed invalidation (§4.6).
//!
//! No direct teacher equivalent — `deepseek-tools` never caches a tool call.
//! Built from the spec's explicit contract: cache key is
//! `(tool_name, canonical(args))`, entries expire after a TTL, and any write
//! or exec-family call invalidates every cached entry whose recorded touched
//! paths overlap the new call's target paths.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use taskgraph_core::ToolResult;

#[derive(Debug, Clone)]
struct CacheEntry {
    result: ToolResult,
    inserted_at: Instant,
    last_used: Instant,
    /// Workspace-relative paths this entry's result depends on, used for
    /// invalidation when a later write/exec call touches one of them.
    touched_paths: Vec<PathBuf>,
}

/// Stable cache key derived from the tool name and a canonical (sorted-key)
/// JSON rendering of its arguments, so `{"a":1,"b":2}` and `{"b":2,"a":1}`
/// hash identically.
pub fn cache_key(tool_name: &str, args: &Value) -> String {
    let canonical = canonicalize_json(args);
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonicalize_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
                sorted.sort_by_key(|(k, _)| k.as_str());
                let mut out = serde_json::Map::new();
                for (k, v) in sorted {
                    out.insert(k.clone(), sort(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

pub struct ToolCache {
    max_entries: usize,
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
    order: Vec<String>,
}

impl ToolCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries,
            ttl,
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<ToolResult> {
        let expired = matches!(
            self.entries.get(key),
            Some(entry) if entry.inserted_at.elapsed() > self.ttl
        );
        if expired {
            self.remove(key);
            return None;
        }
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_used = Instant::now();
            self.touch_order(key);
            let mut result = entry.result.clone();
            result.from_cache = true;
            return Some(result);
        }
        None
    }

    pub fn put(&mut self, key: String, result: ToolResult, touched_paths: Vec<PathBuf>) {
        if !self.entries.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.entries.insert(
            key.clone(),
            CacheEntry {
                result,
                inserted_at: Instant::now(),
                last_used: Instant::now(),
                touched_paths,
            },
        );
        self.touch_order(&key);
        self.evict_if_over_capacity();
    }

    /// Drops every entry whose touched paths overlap `paths` (or any of
    /// their ancestors/descendants), called after a write or exec tool runs.
    pub fn invalidate_paths(&mut self, paths: &[PathBuf]) {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry
                    .touched_paths
                    .iter()
                    .any(|touched| paths.iter().any(|p| paths_overlap(touched, p)))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.remove(&key);
        }
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }

    fn touch_order(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push(key.to_string());
    }

    fn evict_if_over_capacity(&mut self) {
        while self.entries.len() > self.max_entries {
            if self.order.is_empty() {
                break;
            }
            let lru_key = self.order.remove(0);
            self.entries.remove(&lru_key);
        }
    }
}

fn paths_overlap(a: &Path, b: &Path) -> bool {
    a == b || a.starts_with(b) || b.starts_with(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cache_key_ignores_field_order() {
        let a = cache_key("fs.read", &json!({"path": "a.rs", "limit": 10}));
        let b = cache_key("fs.read", &json!({"limit": 10, "path": "a.rs"}));
        assert_eq!(a, b);
    }

    #[test]
    fn get_returns_none_for_missing_key() {
        let mut cache = ToolCache::new(4, Duration::from_secs(60));
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn put_then_get_marks_from_cache() {
        let mut cache = ToolCache::new(4, Duration::from_secs(60));
        let result = ToolResult::ok(json!({"x": 1}));
        cache.put("k1".into(), result, vec![PathBuf::from("a.rs")]);
        let hit = cache.get("k1").expect("hit");
        assert!(hit.from_cache);
    }

    #[test]
    fn ttl_expiry_evicts_entry() {
        let mut cache = ToolCache::new(4, Duration::from_millis(1));
        cache.put("k1".into(), ToolResult::ok(json!(null)), vec![]);
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get("k1").is_none());
    }

    #[test]
    fn lru_eviction_drops_oldest_when_over_capacity() {
        let mut cache = ToolCache::new(2, Duration::from_secs(60));
        cache.put("k1".into(), ToolResult::ok(json!(1)), vec![]);
        cache.put("k2".into(), ToolResult::ok(json!(2)), vec![]);
        cache.put("k3".into(), ToolResult::ok(json!(3)), vec![]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k3").is_some());
    }

    #[test]
    fn invalidate_paths_drops_overlapping_entries() {
        let mut cache = ToolCache::new(8, Duration::from_secs(60));
        cache.put(
            "k1".into(),
            ToolResult::ok(json!("contents")),
            vec![PathBuf::from("src/lib.rs")],
        );
        cache.put(
            "k2".into(),
            ToolResult::ok(json!("other")),
            vec![PathBuf::from("src/main.rs")],
        );
        cache.invalidate_paths(&[PathBuf::from("src/lib.rs")]);
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k2").is_some());
    }
}
