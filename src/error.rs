use thiserror::Error;

#[derive(Debug, Error)]
pub enum BosunError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{resource} limit reached ({limit})")]
    ResourceLimit { resource: &'static str, limit: usize },

    #[error("execution failure: {0}")]
    ExecutionFailure(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("refused by safety policy: {reasoning}")]
    SafetyRefusal {
        reasoning: String,
        alternatives: Vec<String>,
    },

    #[error("guard rejected input: expected {expected}, foreground is {observed}")]
    GuardFailure { expected: String, observed: String },

    #[error("elicitation unavailable: {0}")]
    ElicitationUnavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BosunError {
    /// Stable kind code for structured tool errors. Clients match on these,
    /// so renaming one is a breaking change.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotFound { .. } => "not_found",
            Self::ResourceLimit { .. } => "resource_limit",
            Self::ExecutionFailure(_) => "execution_failure",
            Self::Timeout(_) => "timeout",
            Self::PolicyViolation(_) => "policy_violation",
            Self::SafetyRefusal { .. } => "safety_refusal",
            Self::GuardFailure { .. } => "guard_failure",
            Self::ElicitationUnavailable(_) => "elicitation_unavailable",
            Self::Io(_) => "io",
        }
    }

    /// Produce a sanitized error message safe for returning to MCP clients.
    /// Does not leak internal paths or raw OS error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidArgument(msg) => format!("invalid argument: {msg}"),
            Self::NotFound { kind, id } => format!("{kind} not found: {id}"),
            Self::ResourceLimit { resource, limit } => {
                format!("{resource} limit reached ({limit}) — retry after freeing capacity")
            }
            Self::ExecutionFailure(msg) => format!("execution failure: {msg}"),
            Self::Timeout(ms) => format!("timed out after {ms}ms"),
            Self::PolicyViolation(reason) => format!("policy violation: {reason}"),
            Self::SafetyRefusal { reasoning, .. } => {
                format!("refused by safety policy: {reasoning}")
            }
            Self::GuardFailure { expected, observed } => {
                format!("input guard failed: expected {expected}, foreground is {observed}")
            }
            Self::ElicitationUnavailable(_) => {
                "user confirmation required but no elicitation channel is available".to_string()
            }
            Self::Io(_) => "an I/O error occurred".to_string(),
        }
    }
}
