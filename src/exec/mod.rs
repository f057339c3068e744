pub mod supervisor;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{INHERITED_ENV, Restrictions, SecurityMode};
use crate::error::BosunError;
use crate::history::{HistoryEntry, HistoryLog};
use crate::output_store::{OutputStore, OutputType};
use crate::terminal::SessionExitNotifier;

use supervisor::{
    ProcessGroupGuard, SharedCapture, SpawnSpec, StdinSource, TERMINATION_GRACE, signal_group,
    spawn_drain, spawn_shell, terminate_group,
};

static EXEC_COUNTER: AtomicU64 = AtomicU64::new(0);

const OUTPUT_SUMMARY_LEN: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Foreground,
    #[default]
    Adaptive,
    Background,
    Detached,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Foreground => "foreground",
            Self::Adaptive => "adaptive",
            Self::Background => "background",
            Self::Detached => "detached",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    ForegroundTimeout,
    OutputSizeLimit,
}

/// Snapshot of one command invocation, handed to callers by value. Status
/// transitions are owned exclusively by the process manager; a terminal
/// status is never reopened.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub command: String,
    pub execution_mode: ExecutionMode,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub working_directory: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub environment_variables: HashMap<String, String>,
    pub stdout: String,
    pub stderr: String,
    pub output_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition_reason: Option<TransitionReason>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Internal request shape after tool-level validation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub mode: ExecutionMode,
    pub working_directory: Option<String>,
    pub environment: HashMap<String, String>,
    pub input_data: Option<String>,
    pub input_output_id: Option<String>,
    pub timeout: Duration,
    pub foreground_timeout: Duration,
    pub max_output_size: usize,
    pub capture_stderr: bool,
    pub return_partial_on_timeout: bool,
}

#[derive(Debug, Default, Clone)]
pub struct ExecutionListFilter {
    pub status: Option<ExecutionStatus>,
    pub command_pattern: Option<String>,
    pub terminal_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct TerminateOutcome {
    pub success: bool,
    pub signal_sent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub message: String,
}

struct ExecState {
    record: ExecutionRecord,
    started: Option<Instant>,
}

/// Owns execution records and live children: admission, mode dispatch,
/// timeouts, and termination ordering. Collaborators are handed in at
/// construction; cross-component links are opaque identifiers.
pub struct ProcessManager {
    executions: Mutex<HashMap<String, ExecState>>,
    output_store: Arc<OutputStore>,
    history: Arc<HistoryLog>,
    restrictions: Arc<Mutex<Restrictions>>,
    default_workdir: Mutex<PathBuf>,
    allowed_workdirs: Vec<PathBuf>,
    max_concurrent: usize,
    /// Cancelled on shutdown so supervision tasks stop waiting on children.
    shutdown: CancellationToken,
}

impl ProcessManager {
    pub fn new(
        output_store: Arc<OutputStore>,
        history: Arc<HistoryLog>,
        restrictions: Arc<Mutex<Restrictions>>,
        default_workdir: PathBuf,
        allowed_workdirs: Vec<PathBuf>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            executions: Mutex::new(HashMap::new()),
            output_store,
            history,
            restrictions,
            default_workdir: Mutex::new(default_workdir),
            allowed_workdirs,
            max_concurrent: max_concurrent.max(1),
            shutdown: CancellationToken::new(),
        }
        .normalize()
    }

    fn normalize(mut self) -> Self {
        // Canonicalise allowed roots once; entries that do not resolve are
        // kept verbatim so a later mkdir can still make them usable.
        self.allowed_workdirs = self
            .allowed_workdirs
            .iter()
            .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
            .collect();
        self
    }

    fn mint_id() -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let seq = EXEC_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("exec_{ts:x}_{seq}")
    }

    /// Resolve and validate the working directory: the canonical path must
    /// equal or sit under one of the allowed roots.
    pub fn resolve_workdir(&self, requested: Option<&str>) -> Result<PathBuf, BosunError> {
        let candidate = match requested {
            Some(p) => PathBuf::from(p),
            None => self
                .default_workdir
                .lock()
                .expect("workdir lock poisoned")
                .clone(),
        };
        let canonical = std::fs::canonicalize(&candidate).map_err(|_| {
            BosunError::InvalidArgument(format!(
                "working directory does not exist: {}",
                candidate.display()
            ))
        })?;

        let restricted_roots = {
            let restrictions = self.restrictions.lock().expect("restrictions lock poisoned");
            restrictions.allowed_directories.clone()
        };
        let roots: Vec<PathBuf> = if restricted_roots.is_empty() {
            self.allowed_workdirs.clone()
        } else {
            restricted_roots
                .iter()
                .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
                .collect()
        };

        if roots.iter().any(|root| canonical.starts_with(root)) {
            Ok(canonical)
        } else {
            Err(BosunError::PolicyViolation(format!(
                "working directory {} is outside the allowed roots",
                canonical.display()
            )))
        }
    }

    /// Swap the default working directory after validating it.
    pub fn set_default_workdir(&self, path: &str) -> Result<(PathBuf, PathBuf), BosunError> {
        let resolved = self.resolve_workdir(Some(path))?;
        let mut current = self.default_workdir.lock().expect("workdir lock poisoned");
        let previous = current.clone();
        *current = resolved.clone();
        Ok((previous, resolved))
    }

    pub fn default_workdir(&self) -> PathBuf {
        self.default_workdir
            .lock()
            .expect("workdir lock poisoned")
            .clone()
    }

    /// Command-level restriction checks plus the timeout clamp.
    fn check_restrictions(&self, command: &str, timeout: Duration) -> Result<Duration, BosunError> {
        let restrictions = self
            .restrictions
            .lock()
            .expect("restrictions lock poisoned")
            .clone();
        let program = first_program(command);

        if restrictions
            .blocked_commands
            .iter()
            .any(|blocked| blocked == &program)
        {
            return Err(BosunError::PolicyViolation(format!(
                "command '{program}' is blocked"
            )));
        }
        if restrictions.security_mode == SecurityMode::Restrictive
            && !restrictions
                .allowed_commands
                .iter()
                .any(|allowed| allowed == &program)
        {
            return Err(BosunError::PolicyViolation(format!(
                "command '{program}' is not in the allowed set (restrictive mode)"
            )));
        }

        let max = Duration::from_secs(restrictions.max_execution_time);
        Ok(timeout.min(max))
    }

    fn build_env(&self, overlay: &HashMap<String, String>) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = INHERITED_ENV
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
            .collect();
        for (k, v) in overlay {
            match env.iter_mut().find(|(key, _)| key == k) {
                Some(slot) => slot.1 = v.clone(),
                None => env.push((k.clone(), v.clone())),
            }
        }
        env
    }

    pub fn running_count(&self) -> usize {
        self.executions
            .lock()
            .expect("executions lock poisoned")
            .values()
            .filter(|s| s.record.status == ExecutionStatus::Running)
            .count()
    }

    /// Insert a fresh record, enforcing the shared concurrency bound inside
    /// one critical section.
    fn admit(&self, record: ExecutionRecord) -> Result<(), BosunError> {
        let mut map = self.executions.lock().expect("executions lock poisoned");
        let running = map
            .values()
            .filter(|s| s.record.status == ExecutionStatus::Running)
            .count();
        if running >= self.max_concurrent {
            return Err(BosunError::ResourceLimit {
                resource: "concurrent processes",
                limit: self.max_concurrent,
            });
        }
        map.insert(
            record.execution_id.clone(),
            ExecState {
                record,
                started: None,
            },
        );
        Ok(())
    }

    fn update<F: FnOnce(&mut ExecState)>(&self, id: &str, f: F) {
        let mut map = self.executions.lock().expect("executions lock poisoned");
        if let Some(state) = map.get_mut(id) {
            f(state);
        }
    }

    fn snapshot_of(state: &ExecState) -> ExecutionRecord {
        let mut record = state.record.clone();
        if record.status == ExecutionStatus::Running
            && let Some(started) = state.started
        {
            record.execution_time_ms = Some(started.elapsed().as_millis() as u64);
        }
        record
    }

    pub fn get_execution(&self, id: &str) -> Result<ExecutionRecord, BosunError> {
        let map = self.executions.lock().expect("executions lock poisoned");
        map.get(id)
            .map(Self::snapshot_of)
            .ok_or_else(|| BosunError::NotFound {
                kind: "execution",
                id: id.to_string(),
            })
    }

    pub fn list(&self, filter: &ExecutionListFilter) -> (Vec<ExecutionRecord>, usize) {
        let map = self.executions.lock().expect("executions lock poisoned");
        let mut records: Vec<ExecutionRecord> = map
            .values()
            .filter(|s| filter.status.is_none_or(|st| s.record.status == st))
            .filter(|s| {
                filter
                    .command_pattern
                    .as_deref()
                    .is_none_or(|pat| s.record.command.contains(pat))
            })
            .filter(|s| {
                filter
                    .terminal_id
                    .as_deref()
                    .is_none_or(|tid| s.record.terminal_id.as_deref() == Some(tid))
            })
            .map(Self::snapshot_of)
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = records.len();
        let records = records
            .into_iter()
            .skip(filter.offset)
            .take(if filter.limit == 0 { usize::MAX } else { filter.limit })
            .collect();
        (records, total)
    }

    /// Record an execution that lives inside a terminal session. No child is
    /// supervised here; output flows through the terminal buffer.
    pub fn register_terminal_execution(
        &self,
        command: &str,
        terminal_id: &str,
        working_directory: &Path,
    ) -> Result<ExecutionRecord, BosunError> {
        let record = ExecutionRecord {
            execution_id: Self::mint_id(),
            command: command.to_string(),
            execution_mode: ExecutionMode::Adaptive,
            status: ExecutionStatus::Running,
            exit_code: None,
            working_directory: working_directory.display().to_string(),
            environment_variables: HashMap::new(),
            stdout: String::new(),
            stderr: String::new(),
            output_truncated: false,
            output_id: None,
            terminal_id: Some(terminal_id.to_string()),
            transition_reason: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            execution_time_ms: None,
            pid: None,
        };
        self.admit(record.clone())?;
        self.update(&record.execution_id, |s| s.started = Some(Instant::now()));
        Ok(record)
    }

    /// Flip any still-running terminal-backed records over to completed when
    /// their session ends, whether closed explicitly or because the shell
    /// exited on its own.
    pub fn complete_terminal_executions(&self, terminal_id: &str) {
        let mut map = self.executions.lock().expect("executions lock poisoned");
        for state in map.values_mut() {
            if state.record.terminal_id.as_deref() == Some(terminal_id)
                && state.record.status == ExecutionStatus::Running
            {
                state.record.status = ExecutionStatus::Completed;
                state.record.completed_at = Some(Utc::now());
                if let Some(started) = state.started {
                    state.record.execution_time_ms = Some(started.elapsed().as_millis() as u64);
                }
            }
        }
    }

    /// Run a command under the requested mode. Foreground and adaptive await
    /// their first response through the supervision task; background and
    /// detached return immediately.
    pub async fn execute(self: &Arc<Self>, req: ExecRequest) -> Result<ExecutionRecord, BosunError> {
        let workdir = self.resolve_workdir(req.working_directory.as_deref())?;
        let timeout = self.check_restrictions(&req.command, req.timeout)?;
        let max_memory_mb = {
            let restrictions = self.restrictions.lock().expect("restrictions lock poisoned");
            restrictions.max_memory_mb
        };

        let stdin = if let Some(ref output_id) = req.input_output_id {
            let prior = self
                .output_store
                .read(output_id, 0, usize::MAX / 2, "utf-8")
                .await?;
            StdinSource::Data(prior.content.into_bytes())
        } else if let Some(ref data) = req.input_data {
            StdinSource::Data(data.clone().into_bytes())
        } else {
            StdinSource::Closed
        };

        let record = ExecutionRecord {
            execution_id: Self::mint_id(),
            command: req.command.clone(),
            execution_mode: req.mode,
            status: ExecutionStatus::Running,
            exit_code: None,
            working_directory: workdir.display().to_string(),
            environment_variables: req.environment.clone(),
            stdout: String::new(),
            stderr: String::new(),
            output_truncated: false,
            output_id: None,
            terminal_id: None,
            transition_reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            execution_time_ms: None,
            pid: None,
        };
        let id = record.execution_id.clone();
        self.admit(record)?;

        let capture = req.mode != ExecutionMode::Detached;
        let spec = SpawnSpec {
            command: req.command.clone(),
            working_directory: workdir,
            environment: self.build_env(&req.environment),
            stdin: if req.mode == ExecutionMode::Detached {
                StdinSource::Closed
            } else {
                stdin
            },
            capture_output: capture,
            max_memory_mb,
        };

        let (mut child, pid) = match spawn_shell(spec) {
            Ok(pair) => pair,
            Err(e) => {
                self.update(&id, |s| {
                    s.record.status = ExecutionStatus::Failed;
                    s.record.completed_at = Some(Utc::now());
                });
                self.append_history(&id, false, Some("spawn failed"));
                return Err(e);
            }
        };

        self.update(&id, |s| {
            s.record.pid = Some(pid);
            s.record.started_at = Some(Utc::now());
            s.started = Some(Instant::now());
        });

        if req.mode == ExecutionMode::Detached {
            // Opportunistic exit observation; the manager does not own the
            // lifecycle of a detached child.
            let manager = Arc::clone(self);
            let detached_id = id.clone();
            tokio::spawn(async move {
                if let Ok(status) = child.wait().await {
                    manager.update(&detached_id, |s| {
                        s.record.status = ExecutionStatus::Completed;
                        s.record.exit_code = Some(status.code().unwrap_or(-1));
                        s.record.completed_at = Some(Utc::now());
                        if let Some(started) = s.started {
                            s.record.execution_time_ms =
                                Some(started.elapsed().as_millis() as u64);
                        }
                    });
                    manager.append_history(&detached_id, true, None);
                }
            });
            return self.get_execution(&id);
        }

        let stdout_cap = SharedCapture::new(req.max_output_size);
        // With stderr capture off the stream is still drained (the child must
        // never block on a full pipe) but nothing is stored or monitored.
        let stderr_cap = if req.capture_stderr {
            SharedCapture::new(req.max_output_size)
        } else {
            SharedCapture::sink()
        };
        let stdout_drain = spawn_drain(
            child.stdout.take().expect("stdout was piped"),
            Arc::clone(&stdout_cap),
        );
        let stderr_drain = spawn_drain(
            child.stderr.take().expect("stderr was piped"),
            Arc::clone(&stderr_cap),
        );

        let (tx, rx) = oneshot::channel();
        let responder = match req.mode {
            ExecutionMode::Foreground | ExecutionMode::Adaptive => Some(tx),
            _ => None,
        };

        let manager = Arc::clone(self);
        let task_id = id.clone();
        let mode = req.mode;
        let window = req.foreground_timeout;
        let return_partial = req.return_partial_on_timeout;
        tokio::spawn(async move {
            manager
                .supervise(
                    task_id,
                    child,
                    pid,
                    stdout_cap,
                    stderr_cap,
                    (stdout_drain, stderr_drain),
                    mode,
                    timeout,
                    window,
                    return_partial,
                    responder,
                )
                .await;
        });

        match req.mode {
            ExecutionMode::Foreground | ExecutionMode::Adaptive => rx
                .await
                .map_err(|_| BosunError::ExecutionFailure("supervision task dropped".to_string()))?,
            _ => self.get_execution(&id),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn supervise(
        self: Arc<Self>,
        id: String,
        mut child: tokio::process::Child,
        pid: u32,
        stdout_cap: Arc<SharedCapture>,
        stderr_cap: Arc<SharedCapture>,
        drains: (JoinHandle<()>, JoinHandle<()>),
        mode: ExecutionMode,
        overall: Duration,
        window: Duration,
        return_partial: bool,
        mut responder: Option<oneshot::Sender<Result<ExecutionRecord, BosunError>>>,
    ) {
        let mut guard = ProcessGroupGuard::new(pid);
        let started = Instant::now();

        // Adaptive phase: wait inside the foreground window for exit, the
        // window elapsing, or an output stream hitting its cap. Exactly one
        // child is ever spawned; the transition is purely internal state.
        if mode == ExecutionMode::Adaptive {
            enum WindowOutcome {
                Exited(std::io::Result<std::process::ExitStatus>),
                Transition(TransitionReason),
                Shutdown,
            }
            let outcome = {
                let wait = child.wait();
                tokio::pin!(wait);
                tokio::select! {
                    status = &mut wait => WindowOutcome::Exited(status),
                    _ = tokio::time::sleep(window) => {
                        WindowOutcome::Transition(TransitionReason::ForegroundTimeout)
                    }
                    _ = stdout_cap.cap_hit() => {
                        WindowOutcome::Transition(TransitionReason::OutputSizeLimit)
                    }
                    _ = stderr_cap.cap_hit() => {
                        WindowOutcome::Transition(TransitionReason::OutputSizeLimit)
                    }
                    _ = self.shutdown.cancelled() => WindowOutcome::Shutdown,
                }
            };
            match outcome {
                WindowOutcome::Exited(status) => {
                    join_drains(drains).await;
                    let record = self
                        .finalize(&id, status, &stdout_cap, &stderr_cap, started, None)
                        .await;
                    guard.disarm();
                    respond(&mut responder, Ok(record));
                    return;
                }
                WindowOutcome::Shutdown => {
                    let _ = terminate_group(&mut child, pid, TERMINATION_GRACE).await;
                    guard.disarm();
                    respond(
                        &mut responder,
                        Err(BosunError::ExecutionFailure("server shutting down".to_string())),
                    );
                    return;
                }
                WindowOutcome::Transition(reason) => {
                    // Persist the partial capture and hand the running record
                    // back; supervision continues toward the overall bound.
                    let partial = combine_output(&stdout_cap, &stderr_cap);
                    let output_id = match self
                        .output_store
                        .create(&partial, OutputType::Combined, Some(&id), None)
                        .await
                    {
                        Ok(oid) => Some(oid),
                        Err(e) => {
                            tracing::warn!(execution_id = %id, "partial capture persist failed: {e}");
                            None
                        }
                    };
                    let truncated = stdout_cap.truncated() || stderr_cap.truncated();
                    self.update(&id, |s| {
                        s.record.transition_reason = Some(reason);
                        s.record.output_id = output_id.clone();
                        s.record.output_truncated = truncated;
                        s.record.stdout =
                            String::from_utf8_lossy(&stdout_cap.snapshot()).to_string();
                        s.record.stderr =
                            String::from_utf8_lossy(&stderr_cap.snapshot()).to_string();
                    });
                    if let Ok(record) = self.get_execution(&id) {
                        respond(&mut responder, Ok(record));
                    }
                }
            }
        }

        // Final bound: foreground uses the whole budget, adaptive whatever
        // the window left over.
        let remaining = overall.saturating_sub(started.elapsed());
        let waited = tokio::select! {
            res = tokio::time::timeout(remaining, child.wait()) => Some(res),
            _ = self.shutdown.cancelled() => None,
        };
        let Some(waited) = waited else {
            let _ = terminate_group(&mut child, pid, TERMINATION_GRACE).await;
            guard.disarm();
            respond(
                &mut responder,
                Err(BosunError::ExecutionFailure("server shutting down".to_string())),
            );
            return;
        };
        match waited {
            Ok(status) => {
                join_drains(drains).await;
                let record = self
                    .finalize(&id, status, &stdout_cap, &stderr_cap, started, None)
                    .await;
                guard.disarm();
                respond(&mut responder, Ok(record));
            }
            Err(_) => {
                let status = terminate_group(&mut child, pid, TERMINATION_GRACE).await;
                join_drains(drains).await;
                let record = self
                    .finalize(
                        &id,
                        status.ok_or_else(|| std::io::Error::other("unreaped after SIGKILL")),
                        &stdout_cap,
                        &stderr_cap,
                        started,
                        Some(ExecutionStatus::Timeout),
                    )
                    .await;
                guard.disarm();
                let elapsed_ms = started.elapsed().as_millis() as u64;
                if mode == ExecutionMode::Foreground && !return_partial {
                    respond(&mut responder, Err(BosunError::Timeout(elapsed_ms)));
                } else {
                    respond(&mut responder, Ok(record));
                }
            }
        }
    }

    /// Persist the capture, transition the record to its terminal status, and
    /// append the history entry.
    async fn finalize(
        &self,
        id: &str,
        status: std::io::Result<std::process::ExitStatus>,
        stdout_cap: &SharedCapture,
        stderr_cap: &SharedCapture,
        started: Instant,
        forced_status: Option<ExecutionStatus>,
    ) -> ExecutionRecord {
        let combined = combine_output(stdout_cap, stderr_cap);
        let output_id = match self
            .output_store
            .create(&combined, OutputType::Combined, Some(id), None)
            .await
        {
            Ok(oid) => Some(oid),
            Err(e) => {
                tracing::warn!(execution_id = %id, "capture persist failed: {e}");
                None
            }
        };

        let (final_status, exit_code) = match forced_status {
            Some(forced) => (forced, status.ok().map(|s| s.code().unwrap_or(-1))),
            None => match status {
                Ok(s) => (ExecutionStatus::Completed, Some(s.code().unwrap_or(-1))),
                Err(e) => {
                    tracing::warn!(execution_id = %id, "child wait failed: {e}");
                    (ExecutionStatus::Failed, None)
                }
            },
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let truncated = stdout_cap.truncated() || stderr_cap.truncated();
        let stdout = String::from_utf8_lossy(&stdout_cap.snapshot()).to_string();
        let stderr = String::from_utf8_lossy(&stderr_cap.snapshot()).to_string();

        self.update(id, |s| {
            s.record.status = final_status;
            s.record.exit_code = exit_code;
            s.record.completed_at = Some(Utc::now());
            s.record.execution_time_ms = Some(elapsed_ms);
            s.record.output_truncated = truncated;
            s.record.output_id = output_id.clone();
            s.record.stdout = stdout;
            s.record.stderr = stderr;
        });
        self.append_history(id, true, None);

        self.get_execution(id).unwrap_or_else(|_| ExecutionRecord {
            execution_id: id.to_string(),
            command: String::new(),
            execution_mode: ExecutionMode::Foreground,
            status: final_status,
            exit_code,
            working_directory: String::new(),
            environment_variables: HashMap::new(),
            stdout: String::new(),
            stderr: String::new(),
            output_truncated: truncated,
            output_id,
            terminal_id: None,
            transition_reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: Some(Utc::now()),
            execution_time_ms: Some(elapsed_ms),
            pid: None,
        })
    }

    fn append_history(&self, id: &str, executed: bool, note: Option<&str>) {
        let Ok(record) = self.get_execution(id) else {
            return;
        };
        let summary = note.map(str::to_string).or_else(|| {
            (!record.stdout.is_empty())
                .then(|| record.stdout.chars().take(OUTPUT_SUMMARY_LEN).collect())
        });
        self.history.append(HistoryEntry {
            execution_id: record.execution_id.clone(),
            command: record.command.clone(),
            working_directory: record.working_directory.clone(),
            timestamp: Utc::now(),
            executed,
            classification: None,
            decision: Some(if executed { "allow" } else { "error" }.to_string()),
            output_summary: summary,
        });
    }

    /// Signal a tracked process. `process_id` accepts an execution id or a
    /// raw pid of a tracked execution. Without `force` the kill escalates
    /// TERM → grace → KILL.
    pub async fn terminate(
        self: &Arc<Self>,
        process_id: &str,
        signal: TerminateSignal,
        force: bool,
    ) -> Result<TerminateOutcome, BosunError> {
        let (id, pid, status) = {
            let map = self.executions.lock().expect("executions lock poisoned");
            let state = map.get(process_id).or_else(|| {
                process_id
                    .parse::<u32>()
                    .ok()
                    .and_then(|n| map.values().find(|s| s.record.pid == Some(n)))
            });
            match state {
                Some(s) => (
                    s.record.execution_id.clone(),
                    s.record.pid,
                    s.record.status,
                ),
                None => {
                    return Err(BosunError::NotFound {
                        kind: "execution",
                        id: process_id.to_string(),
                    });
                }
            }
        };

        let Some(pid) = pid else {
            return Ok(TerminateOutcome {
                success: false,
                signal_sent: "none".to_string(),
                exit_code: None,
                message: "execution has no live process".to_string(),
            });
        };
        if status.is_terminal() {
            let record = self.get_execution(&id)?;
            return Ok(TerminateOutcome {
                success: false,
                signal_sent: "none".to_string(),
                exit_code: record.exit_code,
                message: format!("execution already {}", status_label(status)),
            });
        }

        if force {
            signal_group(pid, libc::SIGKILL);
            return Ok(TerminateOutcome {
                success: true,
                signal_sent: "KILL".to_string(),
                exit_code: None,
                message: "sent SIGKILL to process group".to_string(),
            });
        }

        signal_group(pid, signal.as_libc());
        // Escalate after the grace window if the record is still running.
        let manager = Arc::clone(self);
        let watch_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TERMINATION_GRACE).await;
            let still_running = manager
                .get_execution(&watch_id)
                .map(|r| r.status == ExecutionStatus::Running)
                .unwrap_or(false);
            if still_running {
                tracing::info!(execution_id = %watch_id, "escalating to SIGKILL after grace");
                signal_group(pid, libc::SIGKILL);
            }
        });

        Ok(TerminateOutcome {
            success: true,
            signal_sent: signal.as_str().to_string(),
            exit_code: None,
            message: format!("sent SIG{} to process group", signal.as_str()),
        })
    }

    /// Replace the runtime restriction state. `None` fields keep their
    /// current value except the list fields, which reset to the new policy.
    pub fn apply_restrictions(
        &self,
        mode: SecurityMode,
        allowed_commands: Option<Vec<String>>,
        blocked_commands: Option<Vec<String>>,
        allowed_directories: Option<Vec<String>>,
        max_execution_time: Option<u64>,
        max_memory_mb: Option<u64>,
        enable_network: Option<bool>,
    ) -> Restrictions {
        let mut restrictions = self.restrictions.lock().expect("restrictions lock poisoned");
        restrictions.security_mode = mode;
        restrictions.allowed_commands = allowed_commands.unwrap_or_default();
        restrictions.blocked_commands = blocked_commands.unwrap_or_default();
        restrictions.allowed_directories = allowed_directories
            .unwrap_or_default()
            .into_iter()
            .map(PathBuf::from)
            .collect();
        if let Some(max) = max_execution_time {
            restrictions.max_execution_time = max.max(1);
        }
        if max_memory_mb.is_some() {
            restrictions.max_memory_mb = max_memory_mb.filter(|mb| *mb > 0);
        }
        if let Some(network) = enable_network {
            restrictions.enable_network = network;
        }
        tracing::info!(mode = mode.as_str(), "restrictions updated");
        restrictions.clone()
    }

    /// SIGTERM every tracked child, wait out one grace window, SIGKILL the
    /// stragglers, then drop all records.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let pids: Vec<u32> = {
            let map = self.executions.lock().expect("executions lock poisoned");
            map.values()
                .filter(|s| s.record.status == ExecutionStatus::Running)
                .filter_map(|s| s.record.pid)
                .collect()
        };
        if !pids.is_empty() {
            tracing::info!(count = pids.len(), "terminating tracked children on shutdown");
            for pid in &pids {
                signal_group(*pid, libc::SIGTERM);
            }
            tokio::time::sleep(TERMINATION_GRACE).await;
            for pid in &pids {
                signal_group(*pid, libc::SIGKILL);
            }
        }
        self.executions
            .lock()
            .expect("executions lock poisoned")
            .clear();
    }
}

impl SessionExitNotifier for ProcessManager {
    fn session_closed(&self, terminal_id: &str) {
        self.complete_terminal_executions(terminal_id);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum TerminateSignal {
    #[default]
    #[serde(rename = "TERM")]
    Term,
    #[serde(rename = "INT")]
    Int,
    #[serde(rename = "KILL")]
    Kill,
}

impl TerminateSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Term => "TERM",
            Self::Int => "INT",
            Self::Kill => "KILL",
        }
    }

    fn as_libc(&self) -> libc::c_int {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Int => libc::SIGINT,
            Self::Kill => libc::SIGKILL,
        }
    }
}

fn status_label(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Running => "running",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Timeout => "timed out",
    }
}

/// Program name a restriction check applies to: the basename of the first
/// token.
fn first_program(command: &str) -> String {
    command
        .split_whitespace()
        .next()
        .map(|tok| {
            Path::new(tok)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| tok.to_string())
        })
        .unwrap_or_default()
}

fn combine_output(stdout_cap: &SharedCapture, stderr_cap: &SharedCapture) -> Vec<u8> {
    let mut combined = stdout_cap.snapshot();
    combined.extend_from_slice(&stderr_cap.snapshot());
    combined
}

async fn join_drains(drains: (JoinHandle<()>, JoinHandle<()>)) {
    // Pipes reach EOF once the child (and its group) is gone; the timeout is
    // protection against a grandchild inheriting the pipe and never exiting.
    let (a, b) = drains;
    let _ = tokio::time::timeout(
        Duration::from_secs(2),
        futures_util::future::join(a, b),
    )
    .await;
}

fn respond(
    responder: &mut Option<oneshot::Sender<Result<ExecutionRecord, BosunError>>>,
    result: Result<ExecutionRecord, BosunError>,
) {
    if let Some(tx) = responder.take() {
        let _ = tx.send(result);
    }
}
