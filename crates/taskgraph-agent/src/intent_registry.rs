//! Intent registry (§4.2 Classifier & Router, §10.3 registry files): a
//! YAML-backed table of keyword rules, one row per `IntentCategory`, each
//! carrying the risk level, tool group and prompt profile a match should
//! produce.
//!
//! Grounded on the teacher's keyword-matching classifier in
//! `deepseek-agent/src/intent.rs` (score-by-keyword-hit, highest score wins,
//! ties broken by rule order) and on `honeycomb-Technolgies-Krusty`'s
//! `krusty-core` YAML-loaded registry pattern for the on-disk format
//! (`prompt_profiles.yaml`/`intents.yaml`, named in SPEC_FULL.md §10.3).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use taskgraph_core::{runtime_dir, IntentCategory, IntentMatch, Mode, RiskLevel};

#[derive(Debug, thiserror::Error)]
pub enum IntentRegistryError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// One row of the registry: the keywords that match `category`, and the
/// profile/risk/tool groups that match should yield.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRule {
    pub category: IntentCategory,
    pub keywords: Vec<String>,
    pub risk_level: RiskLevel,
    pub prompt_profile_ref: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRegistry {
    pub rules: Vec<IntentRule>,
}

impl IntentRegistry {
    pub fn path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("intents.yaml")
    }

    /// Loads the registry if present, otherwise writes and returns the
    /// built-in default set (teacher's "create on first touch" pattern,
    /// mirrored from `AppConfig::ensure`).
    pub fn ensure(workspace: &Path) -> Result<Self, IntentRegistryError> {
        let path = Self::path(workspace);
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            return Ok(serde_yaml::from_str(&raw)?);
        }
        fs::create_dir_all(path.parent().expect("registry path always has a parent"))?;
        let registry = Self::defaults();
        fs::write(&path, serde_yaml::to_string(&registry)?)?;
        Ok(registry)
    }

    /// The closed 11-category default set (§3 `IntentCategory`), one rule
    /// per category so every category is always reachable even before an
    /// operator customizes `intents.yaml`.
    pub fn defaults() -> Self {
        use IntentCategory::*;
        let rule = |category, keywords: &[&str], risk, profile: &str, tools: &[&str]| IntentRule {
            category,
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            risk_level: risk,
            prompt_profile_ref: profile.to_string(),
            tools: tools.iter().map(|s| s.to_string()).collect(),
        };
        Self {
            rules: vec![
                rule(
                    CodingTask,
                    &["fix", "implement", "add", "refactor", "change", "update", "write code"],
                    RiskLevel::Medium,
                    "coding_task",
                    &["readonly", "write"],
                ),
                rule(
                    ErrorDiagnosis,
                    &["bug", "error", "crash", "stack trace", "why does", "failing", "traceback"],
                    RiskLevel::Medium,
                    "error_diagnosis",
                    &["readonly", "exec"],
                ),
                rule(
                    RepoAnalysis,
                    &["what does", "explain", "show me", "where is", "how does", "walk me through"],
                    RiskLevel::Low,
                    "repo_analysis",
                    &["readonly"],
                ),
                rule(
                    DocumentationTask,
                    &["document", "docstring", "write a readme", "changelog", "comment this"],
                    RiskLevel::Low,
                    "documentation_task",
                    &["readonly", "write"],
                ),
                rule(
                    TechnicalConsulting,
                    &["should i use", "what's the tradeoff", "recommend", "which approach", "pros and cons"],
                    RiskLevel::Low,
                    "technical_consulting",
                    &["readonly"],
                ),
                rule(
                    ProjectDesign,
                    &["design", "architecture", "restructure", "migrate", "rewrite", "plan out"],
                    RiskLevel::Medium,
                    "project_design",
                    &["readonly", "write"],
                ),
                rule(
                    SecurityConsulting,
                    &["vulnerability", "cve", "exploit", "security review", "pen test", "sanitize"],
                    RiskLevel::Medium,
                    "security_consulting",
                    &["readonly"],
                ),
                rule(
                    CapabilityQuery,
                    &["can you", "are you able", "what can you do", "do you support"],
                    RiskLevel::Low,
                    "capability_query",
                    &[],
                ),
                rule(
                    GeneralChat,
                    &["thanks", "hello", "hi there", "good morning"],
                    RiskLevel::Low,
                    "general_chat",
                    &[],
                ),
                rule(
                    CasualChat,
                    &["lol", "haha", "by the way", "random question"],
                    RiskLevel::Low,
                    "casual_chat",
                    &[],
                ),
                rule(Uncertain, &[], RiskLevel::Low, "uncertain", &["readonly"]),
            ],
        }
    }

    /// Scores every rule by keyword-substring hit count (teacher's
    /// score-by-keyword-hit shape) and returns the match for the
    /// highest-scoring rule, falling back to `Uncertain` on a total miss.
    pub fn classify(&self, text: &str, mode_hint: Mode) -> IntentMatch {
        let lower = text.to_lowercase();
        let mut best: Option<(&IntentRule, usize)> = None;
        for rule in &self.rules {
            let score = rule
                .keywords
                .iter()
                .filter(|kw| lower.contains(kw.as_str()))
                .count();
            if score == 0 {
                continue;
            }
            if best.map(|(_, best_score)| score > best_score).unwrap_or(true) {
                best = Some((rule, score));
            }
        }

        let rule = best.map(|(r, _)| r).unwrap_or_else(|| {
            self.rules
                .iter()
                .find(|r| r.category == IntentCategory::Uncertain)
                .expect("defaults always carry an uncertain rule")
        });

        let mode = if Mode::planning_enabled_for(rule.category) {
            mode_hint
        } else {
            Mode::Unified
        };

        IntentMatch::new(
            rule.category,
            rule.category.as_str(),
            rule.risk_level,
            rule.tools.clone(),
            rule.prompt_profile_ref.clone(),
            mode,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn classify_picks_highest_scoring_rule() {
        let registry = IntentRegistry::defaults();
        let m = registry.classify("why does this crash with a stack trace", Mode::Split);
        assert_eq!(m.category, IntentCategory::ErrorDiagnosis);
    }

    #[test]
    fn classify_falls_back_to_uncertain_on_total_miss() {
        let registry = IntentRegistry::defaults();
        let m = registry.classify("xyzzy plugh", Mode::Split);
        assert_eq!(m.category, IntentCategory::Uncertain);
    }

    #[test]
    fn classify_disables_planning_for_general_chat() {
        let registry = IntentRegistry::defaults();
        let m = registry.classify("hello there, good morning", Mode::Split);
        assert_eq!(m.category, IntentCategory::GeneralChat);
        assert_eq!(m.mode, Mode::Unified);
    }

    #[test]
    fn ensure_writes_then_loads_same_registry() {
        let dir = tempdir().unwrap();
        let first = IntentRegistry::ensure(dir.path()).unwrap();
        assert!(IntentRegistry::path(dir.path()).exists());
        let second = IntentRegistry::ensure(dir.path()).unwrap();
        assert_eq!(first.rules.len(), second.rules.len());
    }
}
