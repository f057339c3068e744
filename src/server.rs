use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler, tool, tool_handler, tool_router};
use serde::Serialize;

use crate::config::Config;
use crate::error::BosunError;
use crate::exec::{ExecRequest, ExecutionListFilter, ProcessManager};
use crate::history::HistoryLog;
use crate::output_store::{OutputListFilter, OutputStore, OutputType};
use crate::safety::elicit::{DEFAULT_ELICITATION_TIMEOUT, Elicitor, PeerElicitor};
use crate::safety::evaluator::{PeerSampling, SamplingClient};
use crate::safety::{SafetyChannels, SafetyEvaluator, SafetyOutcome, refusal_payload};
use crate::terminal::{SessionExitNotifier, TerminalInput, TerminalManager};
use crate::tools::execute::ShellExecuteRequest;
use crate::tools::outputs::{
    DeleteExecutionOutputsRequest, ListExecutionOutputsRequest, ReadExecutionOutputRequest,
};
use crate::tools::process::{
    ProcessGetExecutionRequest, ProcessListRequest, ProcessTerminateRequest,
    SetDefaultWorkdirRequest,
};
use crate::tools::security::SetRestrictionsRequest;
use crate::tools::terminal::{
    TerminalGetInfoRequest, TerminalListRequest, TerminalOperateRequest, TerminalOperation,
};

#[derive(Clone)]
pub struct BosunServer {
    processes: Arc<ProcessManager>,
    terminals: Arc<TerminalManager>,
    output_store: Arc<OutputStore>,
    safety: Arc<SafetyEvaluator>,
    disabled_tools: Arc<HashSet<String>>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl BosunServer {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let output_store = Arc::new(OutputStore::new(
            config.output_dir.clone(),
            config.max_output_files,
        )?);
        let history = Arc::new(HistoryLog::new(
            config.history_limit,
            Some(output_store.log_dir().join("history.jsonl")),
        ));
        let restrictions = Arc::new(Mutex::new(config.restrictions.clone()));
        let processes = Arc::new(ProcessManager::new(
            Arc::clone(&output_store),
            Arc::clone(&history),
            Arc::clone(&restrictions),
            config.default_workdir.clone(),
            config.allowed_workdirs.clone(),
            config.max_concurrent_processes,
        ));
        // The process manager is the terminal manager's exit notifier so
        // terminal-backed execution records finalize even when the shell
        // exits without an explicit close.
        let terminals = Arc::new(TerminalManager::new(
            config.max_terminals,
            config.max_output_lines,
            config.max_history_lines,
            Duration::from_secs(config.idle_timeout_secs),
            Some(Arc::clone(&processes) as Arc<dyn SessionExitNotifier>),
        ));
        terminals.spawn_idle_sweep();
        let safety = Arc::new(SafetyEvaluator::new(
            Arc::clone(&history),
            config.llm_evaluation,
            config.elicitation_enabled,
            DEFAULT_ELICITATION_TIMEOUT,
        ));

        Ok(Self {
            processes,
            terminals,
            output_store,
            safety,
            disabled_tools: Arc::new(config.disabled_tools),
            tool_router: Self::tool_router(),
        })
    }

    pub fn process_manager(&self) -> Arc<ProcessManager> {
        Arc::clone(&self.processes)
    }

    pub fn terminal_manager(&self) -> Arc<TerminalManager> {
        Arc::clone(&self.terminals)
    }

    fn ensure_enabled(&self, tool: &str) -> Result<(), McpError> {
        if self.disabled_tools.contains(tool) {
            return Err(McpError::invalid_params(
                format!("tool {tool} is disabled by MCP_DISABLED_TOOLS"),
                None,
            ));
        }
        Ok(())
    }

    #[tool(
        name = "shell_execute",
        description = "Run a shell command under the safety policy. Modes: foreground (wait for exit), adaptive (default: wait briefly, then keep running in the background), background, detached. Returns an execution record; the full capture is retrievable via read_execution_output."
    )]
    async fn shell_execute(
        &self,
        Parameters(req): Parameters<ShellExecuteRequest>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_enabled("shell_execute")?;
        req.validate()
            .map_err(|msg| McpError::invalid_params(msg, None))?;

        // Safety channels live only for this request: sampling and
        // elicitation both travel through the peer that asked.
        let capabilities = context.peer.peer_info().map(|info| info.capabilities.clone());
        let sampler = capabilities
            .as_ref()
            .is_some_and(|c| c.sampling.is_some())
            .then(|| PeerSampling::new(context.peer.clone()));
        let elicitor = capabilities
            .as_ref()
            .is_some_and(|c| c.elicitation.is_some())
            .then(|| PeerElicitor::new(context.peer.clone()));
        let channels = SafetyChannels {
            sampling: sampler.as_ref().map(|s| s as &dyn SamplingClient),
            elicitor: elicitor.as_ref().map(|e| e as &dyn Elicitor),
        };

        let workdir_display = match req.working_directory.as_deref() {
            Some(wd) => wd.to_string(),
            None => self.processes.default_workdir().display().to_string(),
        };

        match self
            .safety
            .assess(&req.command, &workdir_display, req.comment.as_deref(), &channels)
            .await
        {
            Err(e) => return error_result(e),
            Ok(SafetyOutcome::Refused(decision)) => {
                return json_value_result(refusal_payload(&decision));
            }
            Ok(SafetyOutcome::AssistantConfirmRequired(decision)) => {
                let request = decision
                    .required_context
                    .as_ref()
                    .and_then(|c| c.assistant_request.clone());
                return json_value_result(serde_json::json!({
                    "status": "assistant_confirm_required",
                    "reasoning": decision.reasoning,
                    "assistant_request": request,
                    "suggested_alternatives": decision.suggested_alternatives,
                }));
            }
            Ok(SafetyOutcome::Admitted(decision)) => {
                tracing::debug!(confidence = decision.confidence, "command admitted");
            }
        }

        let overlay = req.environment_variables.clone().unwrap_or_default();

        if req.create_terminal {
            return self.execute_in_terminal(&req, overlay);
        }

        let exec_req = ExecRequest {
            command: req.command.clone(),
            mode: req.execution_mode,
            working_directory: req.working_directory.clone(),
            environment: overlay,
            input_data: req.input_data.clone(),
            input_output_id: req.input_output_id.clone(),
            timeout: Duration::from_secs(req.timeout_seconds),
            foreground_timeout: Duration::from_secs(req.foreground_timeout_seconds),
            max_output_size: req.max_output_size,
            capture_stderr: req.capture_stderr,
            return_partial_on_timeout: req.return_partial_on_timeout,
        };

        match self.processes.execute(exec_req).await {
            Ok(record) => json_result(&record),
            Err(e) => error_result(e),
        }
    }

    /// Terminal-backed execution: create the session, write the command, and
    /// return a running record pointing at the terminal.
    fn execute_in_terminal(
        &self,
        req: &ShellExecuteRequest,
        overlay: HashMap<String, String>,
    ) -> Result<CallToolResult, McpError> {
        let workdir = match self.processes.resolve_workdir(req.working_directory.as_deref()) {
            Ok(wd) => wd,
            Err(e) => return error_result(e),
        };
        let info = match self.terminals.create(
            req.terminal_shell.unwrap_or_default(),
            req.terminal_dimensions.unwrap_or_default(),
            workdir.clone(),
            &overlay,
        ) {
            Ok(info) => info,
            Err(e) => return error_result(e),
        };
        let record = match self.processes.register_terminal_execution(
            &req.command,
            &info.terminal_id,
            &workdir,
        ) {
            Ok(record) => record,
            Err(e) => return error_result(e),
        };
        // First write into a fresh session: a shell banner may already be
        // buffered, so skip the unread-output check.
        let input = TerminalInput {
            input: req.command.clone(),
            execute: true,
            force_input: true,
            ..Default::default()
        };
        if let Err(e) = self.terminals.input(&info.terminal_id, &input) {
            return error_result(e);
        }
        json_result(&record)
    }

    #[tool(
        name = "process_get_execution",
        description = "Fetch the current execution record for an execution_id returned by shell_execute.",
        annotations(read_only_hint = true)
    )]
    async fn process_get_execution(
        &self,
        Parameters(req): Parameters<ProcessGetExecutionRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_enabled("process_get_execution")?;
        match self.processes.get_execution(&req.execution_id) {
            Ok(record) => json_result(&record),
            Err(e) => error_result(e),
        }
    }

    #[tool(
        name = "process_list",
        description = "List tracked executions, newest first, with optional status / command / terminal filters.",
        annotations(read_only_hint = true)
    )]
    async fn process_list(
        &self,
        Parameters(req): Parameters<ProcessListRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_enabled("process_list")?;
        let filter = ExecutionListFilter {
            status: req.status_filter,
            command_pattern: req.command_pattern,
            terminal_id: req.session_id,
            limit: req.limit,
            offset: req.offset,
        };
        let (executions, total_count) = self.processes.list(&filter);
        json_value_result(serde_json::json!({
            "executions": executions,
            "total_count": total_count,
        }))
    }

    #[tool(
        name = "process_terminate",
        description = "Signal a running execution's process group. Default ordering is SIGTERM, a grace window, then SIGKILL; force sends SIGKILL immediately."
    )]
    async fn process_terminate(
        &self,
        Parameters(req): Parameters<ProcessTerminateRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_enabled("process_terminate")?;
        match self
            .processes
            .terminate(&req.process_id, req.signal, req.force)
            .await
        {
            Ok(outcome) => json_result(&outcome),
            Err(e) => error_result(e),
        }
    }

    #[tool(
        name = "shell_set_default_workdir",
        description = "Change the default working directory for subsequent executions. The new directory must be inside the allowed roots."
    )]
    async fn shell_set_default_workdir(
        &self,
        Parameters(req): Parameters<SetDefaultWorkdirRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_enabled("shell_set_default_workdir")?;
        match self.processes.set_default_workdir(&req.working_directory) {
            Ok((previous, new)) => {
                let changed = previous != new;
                json_value_result(serde_json::json!({
                    "success": true,
                    "previous": previous.display().to_string(),
                    "new": new.display().to_string(),
                    "changed": changed,
                }))
            }
            Err(e) => error_result(e),
        }
    }

    #[tool(
        name = "terminal_operate",
        description = "Unified PTY terminal operation, selected by `operation`: create a session, write input (with optional program guard), read buffered output, resize, or close."
    )]
    async fn terminal_operate(
        &self,
        Parameters(req): Parameters<TerminalOperateRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_enabled("terminal_operate")?;
        req.validate()
            .map_err(|msg| McpError::invalid_params(msg, None))?;

        match req.operation {
            TerminalOperation::Create => {
                let workdir = match self
                    .processes
                    .resolve_workdir(req.working_directory.as_deref())
                {
                    Ok(wd) => wd,
                    Err(e) => return error_result(e),
                };
                let overlay = req.environment_variables.clone().unwrap_or_default();
                match self.terminals.create(
                    req.shell_type.unwrap_or_default(),
                    req.dimensions.unwrap_or_default(),
                    workdir,
                    &overlay,
                ) {
                    Ok(info) => json_result(&info),
                    Err(e) => error_result(e),
                }
            }
            TerminalOperation::Input => {
                let terminal_id = req.terminal_id.as_deref().expect("validated");
                let input = TerminalInput {
                    input: req.input.clone().expect("validated"),
                    execute: req.execute,
                    control_codes: req.control_codes,
                    raw_bytes: req.raw_bytes,
                    send_to: req.send_to.clone(),
                    force_input: req.force_input,
                };
                match self.terminals.input(terminal_id, &input) {
                    Ok(outcome) => json_result(&outcome),
                    Err(e) => error_result(e),
                }
            }
            TerminalOperation::Output => {
                let terminal_id = req.terminal_id.as_deref().expect("validated");
                match self.terminals.output(
                    terminal_id,
                    req.start_line,
                    req.line_count,
                    req.include_ansi,
                    req.include_foreground_process,
                ) {
                    Ok(slice) => json_result(&slice),
                    Err(e) => error_result(e),
                }
            }
            TerminalOperation::Resize => {
                let terminal_id = req.terminal_id.as_deref().expect("validated");
                let dimensions = req.dimensions.expect("validated");
                match self.terminals.resize(terminal_id, dimensions) {
                    Ok(info) => json_result(&info),
                    Err(e) => error_result(e),
                }
            }
            TerminalOperation::Close => {
                let terminal_id = req.terminal_id.as_deref().expect("validated");
                // Closing notifies the process manager through the exit
                // notifier, finalizing any terminal-backed records.
                let outcome = match self.terminals.close(terminal_id, req.save_history) {
                    Ok(outcome) => outcome,
                    Err(e) => return error_result(e),
                };

                let history_output_id = match &outcome.history {
                    Some(lines) if !lines.is_empty() => {
                        let body = lines.join("\n");
                        match self
                            .output_store
                            .create(
                                body.as_bytes(),
                                OutputType::Log,
                                None,
                                Some(&format!("terminal_history_{terminal_id}")),
                            )
                            .await
                        {
                            Ok(oid) => Some(oid),
                            Err(e) => {
                                tracing::warn!(terminal_id, "history save failed: {e}");
                                None
                            }
                        }
                    }
                    _ => None,
                };

                json_value_result(serde_json::json!({
                    "terminal_id": outcome.terminal_id,
                    "status": "closed",
                    "history_output_id": history_output_id,
                }))
            }
        }
    }

    #[tool(
        name = "terminal_list",
        description = "List terminal sessions, newest first, with optional state and shell filters.",
        annotations(read_only_hint = true)
    )]
    async fn terminal_list(
        &self,
        Parameters(req): Parameters<TerminalListRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_enabled("terminal_list")?;
        let terminals: Vec<_> = self
            .terminals
            .list()
            .into_iter()
            .filter(|info| req.state_filter.is_none_or(|s| info.state == s))
            .filter(|info| req.shell_filter.is_none_or(|s| info.shell_type == s))
            .collect();
        json_value_result(serde_json::json!({
            "total_count": terminals.len(),
            "terminals": terminals,
        }))
    }

    #[tool(
        name = "terminal_get_info",
        description = "Fetch one terminal session's details, optionally with its current foreground process.",
        annotations(read_only_hint = true)
    )]
    async fn terminal_get_info(
        &self,
        Parameters(req): Parameters<TerminalGetInfoRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_enabled("terminal_get_info")?;
        let info = match self.terminals.get_info(&req.terminal_id) {
            Ok(info) => info,
            Err(e) => return error_result(e),
        };
        let foreground = if req.include_foreground_process {
            self.terminals
                .foreground_of(&req.terminal_id)
                .unwrap_or(None)
        } else {
            None
        };
        json_value_result(serde_json::json!({
            "terminal": info,
            "foreground_process": foreground,
        }))
    }

    #[tool(
        name = "list_execution_outputs",
        description = "List stored output captures, newest first, with optional type / execution / name filters.",
        annotations(read_only_hint = true)
    )]
    async fn list_execution_outputs(
        &self,
        Parameters(req): Parameters<ListExecutionOutputsRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_enabled("list_execution_outputs")?;
        let filter = OutputListFilter {
            output_type: req.output_type,
            execution_id: req.execution_id,
            name_pattern: req.name_pattern,
            limit: req.limit,
        };
        let (files, total_count) = self.output_store.list(&filter);
        json_value_result(serde_json::json!({
            "files": files,
            "total_count": total_count,
        }))
    }

    #[tool(
        name = "read_execution_output",
        description = "Random-access read of a stored capture by output_id. Returns content plus total size and a truncation flag.",
        annotations(read_only_hint = true)
    )]
    async fn read_execution_output(
        &self,
        Parameters(req): Parameters<ReadExecutionOutputRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_enabled("read_execution_output")?;
        match self
            .output_store
            .read(&req.output_id, req.offset, req.size, &req.encoding)
            .await
        {
            Ok(result) => json_result(&result),
            Err(e) => error_result(e),
        }
    }

    #[tool(
        name = "delete_execution_outputs",
        description = "Delete stored captures by output_id. Requires confirm=true; nothing is removed without it."
    )]
    async fn delete_execution_outputs(
        &self,
        Parameters(req): Parameters<DeleteExecutionOutputsRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_enabled("delete_execution_outputs")?;
        match self.output_store.delete(&req.output_ids, req.confirm).await {
            Ok(outcome) => json_value_result(serde_json::json!({
                "deleted": outcome.deleted,
                "failed": outcome.failed,
                "total_deleted": outcome.deleted.len(),
            })),
            Err(e) => error_result(e),
        }
    }

    #[tool(
        name = "security_set_restrictions",
        description = "Update the runtime admission policy: security mode, allow/block lists, directory roots, and resource bounds."
    )]
    async fn security_set_restrictions(
        &self,
        Parameters(req): Parameters<SetRestrictionsRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_enabled("security_set_restrictions")?;
        let state = self.processes.apply_restrictions(
            req.security_mode,
            req.allowed_commands,
            req.blocked_commands,
            req.allowed_directories,
            req.max_execution_time,
            req.max_memory_mb,
            req.enable_network,
        );
        json_value_result(serde_json::json!({
            "success": true,
            "security_mode": state.security_mode,
            "allowed_commands": state.allowed_commands,
            "blocked_commands": state.blocked_commands,
            "allowed_directories": state
                .allowed_directories
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>(),
            "max_execution_time": state.max_execution_time,
            "max_memory_mb": state.max_memory_mb,
            "enable_network": state.enable_network,
        }))
    }
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string(value)
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn json_value_result(value: serde_json::Value) -> Result<CallToolResult, McpError> {
    json_result(&value)
}

/// Taxonomy mapping: argument and lookup failures surface as MCP errors;
/// everything else is a structured payload on a successful response so a
/// refused or timed-out command never cascades into sibling call failures.
fn error_result(err: BosunError) -> Result<CallToolResult, McpError> {
    match &err {
        BosunError::InvalidArgument(_) | BosunError::NotFound { .. } => Err(
            McpError::invalid_params(
                err.user_message(),
                Some(serde_json::json!({ "kind": err.kind() })),
            ),
        ),
        BosunError::SafetyRefusal {
            reasoning,
            alternatives,
        } => json_value_result(serde_json::json!({
            "status": "refused",
            "kind": err.kind(),
            "reasoning": reasoning,
            "suggested_alternatives": alternatives,
        })),
        _ => json_value_result(serde_json::json!({
            "status": "error",
            "kind": err.kind(),
            "message": err.user_message(),
        })),
    }
}

#[tool_handler]
impl ServerHandler for BosunServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "bosun".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Bosun: shell execution gateway with PTY terminals and a two-layer safety policy.\n\n\
                 Execution:\n\
                 - `shell_execute`: run a command. The default adaptive mode waits ~10s, then \
                 returns a running record (with `transition_reason`) and keeps the process going; \
                 poll `process_get_execution` for the final status.\n\
                 - `process_list` / `process_get_execution`: inspect tracked executions.\n\
                 - `process_terminate`: signal a running execution (TERM, then KILL after a grace window).\n\n\
                 Terminals:\n\
                 - `terminal_operate` with operation=create|input|output|resize|close drives a PTY session.\n\
                 - Pass `send_to` on input to guard delivery to a specific foreground program \
                 (`*`, `pid:<n>`, `sessionleader:`, a basename, or an absolute path).\n\
                 - Unread output blocks plain input unless `force_input` is set; control-code \
                 input (e.g. `^C`) always goes through.\n\n\
                 Output captures:\n\
                 - Every completed execution persists its output; `read_execution_output` reads it \
                 by `output_id`, `list_execution_outputs` enumerates, `delete_execution_outputs` \
                 (confirm=true) removes.\n\
                 - An execution can consume a prior capture as stdin via `input_output_id`.\n\n\
                 Safety:\n\
                 - Commands pass a dangerous-pattern scan plus (when the client supports sampling) \
                 an LLM safety evaluation that may ask the user for confirmation via elicitation. \
                 Refusals return `status: \"refused\"` with reasoning and alternatives."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
