//! Classifier/Router output types (§3 IntentCategory/IntentMatch, §4.2).

use crate::RiskLevel;
use serde::{Deserialize, Serialize};

/// The closed set of categories the Classifier is allowed to emit (§3
/// IntentCategory, ~11 values). Unknown categories from a model response are
/// a parse error, not a silently-accepted extension (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    CodingTask,
    ErrorDiagnosis,
    RepoAnalysis,
    DocumentationTask,
    TechnicalConsulting,
    ProjectDesign,
    SecurityConsulting,
    CapabilityQuery,
    GeneralChat,
    CasualChat,
    Uncertain,
}

impl IntentCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            IntentCategory::CodingTask => "coding_task",
            IntentCategory::ErrorDiagnosis => "error_diagnosis",
            IntentCategory::RepoAnalysis => "repo_analysis",
            IntentCategory::DocumentationTask => "documentation_task",
            IntentCategory::TechnicalConsulting => "technical_consulting",
            IntentCategory::ProjectDesign => "project_design",
            IntentCategory::SecurityConsulting => "security_consulting",
            IntentCategory::CapabilityQuery => "capability_query",
            IntentCategory::GeneralChat => "general_chat",
            IntentCategory::CasualChat => "casual_chat",
            IntentCategory::Uncertain => "uncertain",
        }
    }
}

/// Prompt composition mode for the matched intent (§3 IntentMatch.mode).
/// `Unified` renders one system prompt covering classification and planning
/// guidance together; `Split` renders separate stage prompts per §4.3's
/// phase-specific user prompts (planning / execute_step / replan).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Unified,
    Split,
}

impl Mode {
    /// Planning is disabled for these categories regardless of `Mode` (§4.2).
    pub fn planning_enabled_for(category: IntentCategory) -> bool {
        !matches!(
            category,
            IntentCategory::CapabilityQuery
                | IntentCategory::GeneralChat
                | IntentCategory::CasualChat
                | IntentCategory::Uncertain
        )
    }
}

/// An entry in the intent registry (loaded from `intents.yaml`, §10.3) plus
/// the resolved decision for one classified turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentMatch {
    pub category: IntentCategory,
    pub name: String,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub tools: Vec<String>,
    pub prompt_profile_ref: String,
    pub mode: Mode,
}

impl IntentMatch {
    pub fn new(
        category: IntentCategory,
        name: impl Into<String>,
        risk_level: RiskLevel,
        tools: Vec<String>,
        prompt_profile_ref: impl Into<String>,
        mode: Mode,
    ) -> Self {
        Self {
            category,
            name: name.into(),
            risk_level,
            tools,
            prompt_profile_ref: prompt_profile_ref.into(),
            mode,
        }
    }
}
