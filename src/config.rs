use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Environment variables inherited into spawned children and shells; the
/// per-request overlay is merged on top.
pub const INHERITED_ENV: &[&str] = &["PATH", "HOME", "USER", "SHELL", "TERM", "LANG", "TZ"];

/// Security mode governing command admission in the process manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    Permissive,
    Restrictive,
    Custom,
}

impl SecurityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permissive => "permissive",
            Self::Restrictive => "restrictive",
            Self::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "permissive" => Some(Self::Permissive),
            "restrictive" => Some(Self::Restrictive),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Runtime-mutable restriction state. Seeded from the environment, updated
/// through `security_set_restrictions`, consulted by the process manager on
/// every admission.
#[derive(Debug, Clone)]
pub struct Restrictions {
    pub security_mode: SecurityMode,
    pub allowed_commands: Vec<String>,
    pub blocked_commands: Vec<String>,
    /// When non-empty these replace the configured allowed workdir roots.
    pub allowed_directories: Vec<PathBuf>,
    /// Upper bound applied to per-request timeout_seconds.
    pub max_execution_time: u64,
    /// Address-space limit applied to children via RLIMIT_AS.
    pub max_memory_mb: Option<u64>,
    /// Advisory only: recorded and echoed back, not enforced.
    pub enable_network: bool,
}

pub struct Config {
    pub default_workdir: PathBuf,
    pub allowed_workdirs: Vec<PathBuf>,
    pub restrictions: Restrictions,
    pub elicitation_enabled: bool,
    pub llm_evaluation: bool,
    pub disabled_tools: HashSet<String>,
    pub output_dir: PathBuf,
    pub max_output_files: usize,
    pub max_concurrent_processes: usize,
    pub max_terminals: usize,
    pub max_output_lines: usize,
    pub max_history_lines: usize,
    pub history_limit: usize,
    pub idle_timeout_secs: u64,
}

const DEFAULT_MAX_EXECUTION_TIME: u64 = 300;
const DEFAULT_MAX_OUTPUT_FILES: usize = 200;
const DEFAULT_MAX_CONCURRENT: usize = 10;
const DEFAULT_MAX_TERMINALS: usize = 20;
const DEFAULT_MAX_OUTPUT_LINES: usize = 10_000;
const DEFAULT_MAX_HISTORY_LINES: usize = 1_000;
const DEFAULT_HISTORY_LIMIT: usize = 500;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

impl Config {
    pub fn from_env() -> Self {
        let default_workdir = env::var("MCP_SHELL_DEFAULT_WORKDIR")
            .map(PathBuf::from)
            .ok()
            .or_else(|| env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"));

        let allowed_workdirs: Vec<PathBuf> = env::var("MCP_SHELL_ALLOWED_WORKDIRS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .filter(|v: &Vec<PathBuf>| !v.is_empty())
            .unwrap_or_else(|| vec![default_workdir.clone()]);

        let security_mode = match env::var("MCP_SHELL_SECURITY_MODE") {
            Ok(raw) => SecurityMode::parse(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "unknown MCP_SHELL_SECURITY_MODE — using permissive");
                SecurityMode::Permissive
            }),
            Err(_) => SecurityMode::Permissive,
        };

        let max_execution_time =
            env_u64("MCP_SHELL_MAX_EXECUTION_TIME", DEFAULT_MAX_EXECUTION_TIME);
        let max_memory_mb = env::var("MCP_SHELL_MAX_MEMORY_MB")
            .ok()
            .and_then(|v| match v.trim().parse::<u64>() {
                Ok(n) if n > 0 => Some(n),
                _ => {
                    tracing::warn!(value = %v, "invalid MCP_SHELL_MAX_MEMORY_MB — ignoring");
                    None
                }
            });

        let enable_network = env_flag("MCP_SHELL_ENABLE_NETWORK", true);
        let elicitation_enabled = env_flag("MCP_SHELL_ELICITATION", true);
        let llm_evaluation = env_flag("MCP_SHELL_LLM_EVALUATION", true);

        let disabled_tools: HashSet<String> = env::var("MCP_DISABLED_TOOLS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if !disabled_tools.is_empty() {
            tracing::info!(count = disabled_tools.len(), "tools disabled via MCP_DISABLED_TOOLS");
        }

        let output_dir = env::var("MCP_SHELL_OUTPUT_DIR")
            .map(PathBuf::from)
            .ok()
            .or_else(|| env::var("HOME").ok().map(|h| PathBuf::from(h).join(".bosun/out")))
            .unwrap_or_else(|| PathBuf::from("./bosun-out"));

        Config {
            default_workdir,
            allowed_workdirs,
            restrictions: Restrictions {
                security_mode,
                allowed_commands: Vec::new(),
                blocked_commands: Vec::new(),
                allowed_directories: Vec::new(),
                max_execution_time,
                max_memory_mb,
                enable_network,
            },
            elicitation_enabled,
            llm_evaluation,
            disabled_tools,
            output_dir,
            max_output_files: env_usize("MCP_SHELL_MAX_OUTPUT_FILES", DEFAULT_MAX_OUTPUT_FILES),
            max_concurrent_processes: env_usize("MCP_SHELL_MAX_CONCURRENT", DEFAULT_MAX_CONCURRENT),
            max_terminals: env_usize("MCP_SHELL_MAX_TERMINALS", DEFAULT_MAX_TERMINALS),
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
            max_history_lines: DEFAULT_MAX_HISTORY_LINES,
            history_limit: env_usize("MCP_SHELL_HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT),
            idle_timeout_secs: env_u64("MCP_SHELL_IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(n) if n > 0 => n,
            _ => {
                tracing::warn!(key, value = %raw, "invalid numeric value — using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env_u64(key, default as u64) as usize
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
