use serde::{Deserialize, Serialize};

/// Verdict tag of a safety decision. Mirrors the JSON contract with the
/// evaluating model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "ALLOW")]
    Allow,
    #[serde(rename = "DENY")]
    Deny,
    #[serde(rename = "NEED_MORE_HISTORY")]
    NeedMoreHistory,
    #[serde(rename = "NEED_USER_CONFIRM")]
    NeedUserConfirm,
    #[serde(rename = "NEED_ASSISTANT_CONFIRM")]
    NeedAssistantConfirm,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Deny => "DENY",
            Self::NeedMoreHistory => "NEED_MORE_HISTORY",
            Self::NeedUserConfirm => "NEED_USER_CONFIRM",
            Self::NeedAssistantConfirm => "NEED_ASSISTANT_CONFIRM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALLOW" => Some(Self::Allow),
            "DENY" => Some(Self::Deny),
            "NEED_MORE_HISTORY" => Some(Self::NeedMoreHistory),
            "NEED_USER_CONFIRM" => Some(Self::NeedUserConfirm),
            "NEED_ASSISTANT_CONFIRM" => Some(Self::NeedAssistantConfirm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFactor {
    pub severity: Severity,
    pub description: String,
}

/// What the evaluator asked for before it can decide.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequiredContext {
    /// How many more history entries to include.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_depth: Option<u32>,
    /// How many recent execution results to include.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_results: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_keywords: Option<Vec<String>>,
    /// Question to put to the user when confirmation is required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_intent_question: Option<String>,
    /// Message for the calling assistant when it must supply context itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_request: Option<String>,
}

/// Ephemeral result of one evaluation round.
#[derive(Debug, Clone, Serialize)]
pub struct SafetyDecision {
    pub verdict: Verdict,
    pub reasoning: String,
    pub confidence: f64,
    pub risk_factors: Vec<RiskFactor>,
    pub suggested_alternatives: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_context: Option<RequiredContext>,
    /// Post-validation notes appended without changing the verdict.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl SafetyDecision {
    pub fn new(verdict: Verdict, reasoning: impl Into<String>, confidence: f64) -> Self {
        Self {
            verdict,
            reasoning: reasoning.into(),
            confidence,
            risk_factors: Vec::new(),
            suggested_alternatives: Vec::new(),
            required_context: None,
            warnings: Vec::new(),
        }
    }

    pub fn has_critical_risk(&self) -> bool {
        self.risk_factors
            .iter()
            .any(|rf| rf.severity == Severity::Critical)
    }
}
