use std::collections::HashMap;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::terminal::{SessionState, ShellKind, TerminalDimensions};

use super::default_true;

/// Sub-operation selector for the unified terminal tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TerminalOperation {
    Create,
    Input,
    Output,
    Resize,
    Close,
}

impl TerminalOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Input => "input",
            Self::Output => "output",
            Self::Resize => "resize",
            Self::Close => "close",
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TerminalOperateRequest {
    /// Which terminal operation to perform
    pub operation: TerminalOperation,
    /// Target session (required for everything except create)
    pub terminal_id: Option<String>,

    // -- create --
    /// Shell to spawn (default bash)
    pub shell_type: Option<ShellKind>,
    /// Terminal dimensions (default 80x24; also used by resize)
    pub dimensions: Option<TerminalDimensions>,
    /// Working directory for the shell (must be inside the allowed roots)
    pub working_directory: Option<String>,
    /// Extra environment variables for the shell
    pub environment_variables: Option<HashMap<String, String>>,

    // -- input --
    /// Input payload: text, control-code syntax, or hex depending on flags
    pub input: Option<String>,
    /// Append a carriage return and record the line in command history
    #[serde(default)]
    pub execute: bool,
    /// Decode `^X` caret codes and escape sequences before writing
    #[serde(default)]
    pub control_codes: bool,
    /// Treat the input as a hexadecimal byte string, written verbatim
    #[serde(default)]
    pub raw_bytes: bool,
    /// Program guard: `*`, `pid:<n>`, `sessionleader:`, a basename, or an absolute path
    pub send_to: Option<String>,
    /// Write even when unread output is pending
    #[serde(default)]
    pub force_input: bool,

    // -- output --
    /// First line of the retained buffer window to return
    #[serde(default)]
    pub start_line: usize,
    /// Number of lines to return (default 100)
    #[serde(default = "default_line_count")]
    pub line_count: usize,
    /// Keep ANSI escape sequences in the output (default strip)
    #[serde(default)]
    pub include_ansi: bool,
    /// Attach the current foreground-process descriptor
    #[serde(default)]
    pub include_foreground_process: bool,

    // -- close --
    /// Persist the session's command history to the output store
    #[serde(default)]
    pub save_history: bool,
}

fn default_line_count() -> usize {
    100
}

impl TerminalOperateRequest {
    /// Cross-field validation the schema alone cannot express.
    pub fn validate(&self) -> Result<(), String> {
        match self.operation {
            TerminalOperation::Create => {
                if self.terminal_id.is_some() {
                    return Err("create does not take terminal_id".to_string());
                }
            }
            op => {
                if self.terminal_id.is_none() {
                    return Err(format!("{} requires terminal_id", op.as_str()));
                }
                if op == TerminalOperation::Input && self.input.is_none() {
                    return Err("input operation requires input".to_string());
                }
                if op == TerminalOperation::Resize && self.dimensions.is_none() {
                    return Err("resize operation requires dimensions".to_string());
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TerminalListRequest {
    /// Only list sessions in this state
    pub state_filter: Option<SessionState>,
    /// Only list sessions running this shell
    pub shell_filter: Option<ShellKind>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TerminalGetInfoRequest {
    /// Terminal session identifier
    pub terminal_id: String,
    /// Attach the current foreground-process descriptor
    #[serde(default = "default_true")]
    pub include_foreground_process: bool,
}
