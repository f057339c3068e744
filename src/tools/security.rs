use schemars::JsonSchema;
use serde::Deserialize;

use crate::config::SecurityMode;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SetRestrictionsRequest {
    /// Admission policy: permissive, restrictive (allow-list only), or custom
    pub security_mode: SecurityMode,
    /// Programs admissible in restrictive mode (basename match)
    pub allowed_commands: Option<Vec<String>>,
    /// Programs refused in every mode (basename match)
    pub blocked_commands: Option<Vec<String>>,
    /// When set, replaces the allowed working-directory roots
    pub allowed_directories: Option<Vec<String>>,
    /// Upper bound for per-request timeout_seconds
    pub max_execution_time: Option<u64>,
    /// Address-space limit (MB) applied to children via RLIMIT_AS
    pub max_memory_mb: Option<u64>,
    /// Advisory network toggle (recorded, not enforced)
    pub enable_network: Option<bool>,
}
