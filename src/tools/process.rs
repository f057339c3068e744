use schemars::JsonSchema;
use serde::Deserialize;

use crate::exec::{ExecutionStatus, TerminateSignal};

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ProcessGetExecutionRequest {
    /// Execution identifier returned by shell_execute
    pub execution_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ProcessListRequest {
    /// Only list executions in this status
    pub status_filter: Option<ExecutionStatus>,
    /// Only list executions whose command contains this substring
    pub command_pattern: Option<String>,
    /// Only list executions attached to this terminal session
    pub session_id: Option<String>,
    /// Page size (default 50)
    #[serde(default = "default_list_limit")]
    pub limit: usize,
    /// Page offset
    #[serde(default)]
    pub offset: usize,
}

fn default_list_limit() -> usize {
    50
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ProcessTerminateRequest {
    /// Execution identifier or raw pid of a tracked execution
    pub process_id: String,
    /// Signal to send (default TERM; escalates to KILL after a grace window)
    #[serde(default)]
    pub signal: TerminateSignal,
    /// Send SIGKILL immediately, skipping the escalation
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SetDefaultWorkdirRequest {
    /// New default working directory (must be inside the allowed roots)
    pub working_directory: String,
}
