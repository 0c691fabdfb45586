//! Layered configuration (§6 "Configuration (enumerated options)", §10.3).
//!
//! `AppConfig` follows the shape the teacher's `deepseek_core::AppConfig`
//! uses: one `#[serde(default)]` struct per concern, TOML on disk under the
//! workspace's runtime dir, `load`/`ensure`/`save` doing the same
//! read-or-default / create-on-first-touch / atomic-ish write dance.

use crate::runtime_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub policy: PolicyConfig,
    pub cache: CacheConfig,
    pub limits: LimitsConfig,
    pub observe: ObserveConfig,
}

impl AppConfig {
    pub fn config_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    pub fn load(workspace: &Path) -> crate::Result<Self> {
        let path = Self::config_path(workspace);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Loads the config if present, otherwise writes and returns the default
    /// (the teacher's "create on first touch" pattern).
    pub fn ensure(workspace: &Path) -> crate::Result<Self> {
        let path = Self::config_path(workspace);
        if path.exists() {
            return Self::load(workspace);
        }
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        let cfg = Self::default();
        cfg.save(workspace)?;
        Ok(cfg)
    }

    pub fn save(&self, workspace: &Path) -> crate::Result<()> {
        let path = Self::config_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub temperature: f32,
    pub endpoint: String,
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "deepseek-chat".to_string(),
            temperature: 0.2,
            endpoint: "https://api.deepseek.com/chat/completions".to_string(),
            api_key_env: "DEEPSEEK_API_KEY".to_string(),
            timeout_seconds: 60,
            max_retries: 3,
            retry_base_ms: 500,
        }
    }
}

/// Approval/sandbox posture (§4.7 policy gating).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub approve_writes: ApprovalMode,
    pub approve_exec: ApprovalMode,
    pub command_allowlist: Vec<String>,
    pub command_denylist: Vec<String>,
    pub sandbox_paths: Vec<String>,
    pub redact_env_keys: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            approve_writes: ApprovalMode::Ask,
            approve_exec: ApprovalMode::Ask,
            command_allowlist: vec![
                "git status".to_string(),
                "git diff".to_string(),
                "cargo test".to_string(),
                "cargo check".to_string(),
            ],
            command_denylist: vec!["rm -rf /".to_string()],
            sandbox_paths: vec![".".to_string()],
            redact_env_keys: vec![
                "API_KEY".to_string(),
                "TOKEN".to_string(),
                "SECRET".to_string(),
                "PASSWORD".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    Always,
    Ask,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 256,
            ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_iterations: u32,
    pub stutter_window: usize,
    pub stutter_threshold: usize,
    pub tool_timeout_seconds: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            stutter_window: 8,
            stutter_threshold: 3,
            tool_timeout_seconds: 120,
        }
    }
}

/// Feedback-shaping and audit posture (§4.13, §10.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserveConfig {
    pub compression_level: CompressionLevel,
    pub audit_log_enabled: bool,
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            compression_level: CompressionLevel::Balanced,
            audit_log_enabled: true,
        }
    }
}

/// The three Feedback Shaper compression tiers (§4.10, §6 configuration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    Minimal,
    #[default]
    Balanced,
    Aggressive,
}
