use std::collections::HashMap;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::exec::ExecutionMode;
use crate::terminal::{ShellKind, TerminalDimensions};

use super::default_true;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ShellExecuteRequest {
    /// The shell command to run (passed to `sh -c`)
    pub command: String,
    /// Execution mode: foreground, adaptive (default), background, or detached
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Working directory (must be inside the allowed roots; defaults to the configured default)
    pub working_directory: Option<String>,
    /// Extra environment variables layered over the inherited whitelist
    pub environment_variables: Option<HashMap<String, String>>,
    /// Text streamed to the child's standard input
    pub input_data: Option<String>,
    /// A prior capture's output_id whose content is streamed as standard input
    pub input_output_id: Option<String>,
    /// Overall timeout in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Adaptive mode: seconds to wait in the foreground before transitioning
    #[serde(default = "default_foreground_timeout_seconds")]
    pub foreground_timeout_seconds: u64,
    /// Per-stream capture cap in bytes; further output is dropped and flagged
    #[serde(default = "default_max_output_size")]
    pub max_output_size: usize,
    /// Capture standard error (default true)
    #[serde(default = "default_true")]
    pub capture_stderr: bool,
    /// On foreground timeout, return accumulated output instead of an error
    #[serde(default = "default_true")]
    pub return_partial_on_timeout: bool,
    /// Run the command inside a new PTY terminal session instead of a pipe
    #[serde(default)]
    pub create_terminal: bool,
    /// Shell for the created terminal (default bash)
    pub terminal_shell: Option<ShellKind>,
    /// Dimensions for the created terminal (default 80x24)
    pub terminal_dimensions: Option<TerminalDimensions>,
    /// Intent note forwarded to the safety evaluator
    pub comment: Option<String>,
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_foreground_timeout_seconds() -> u64 {
    10
}

fn default_max_output_size() -> usize {
    1_048_576
}

impl ShellExecuteRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("command must not be empty".to_string());
        }
        if self.timeout_seconds == 0 {
            return Err("timeout_seconds must be positive".to_string());
        }
        if self.max_output_size == 0 {
            return Err("max_output_size must be positive".to_string());
        }
        if self.input_data.is_some() && self.input_output_id.is_some() {
            return Err("input_data and input_output_id are mutually exclusive".to_string());
        }
        Ok(())
    }
}
