pub mod guard;
pub mod input;

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::INHERITED_ENV;
use crate::error::BosunError;

use guard::{ForegroundProcess, GuardCheck, GuardExpr, guard_matches, probe_foreground};
use input::{decode_control_codes, decode_hex};

static TERMINAL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Closed sessions stay resolvable for in-flight reads this long before the
/// record is evicted.
const CLOSED_RETENTION: Duration = Duration::from_secs(30);

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

static ANSI_SEQ: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\^_]")
        .expect("static pattern must compile")
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    #[default]
    Bash,
    Zsh,
    Fish,
    Sh,
    Powershell,
    Cmd,
}

impl ShellKind {
    pub fn program(&self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Zsh => "zsh",
            Self::Fish => "fish",
            Self::Sh => "sh",
            Self::Powershell => "powershell",
            Self::Cmd => "cmd",
        }
    }

    /// POSIX shells are started as login shells; the rest have no such flag.
    fn login_args(&self) -> &'static [&'static str] {
        match self {
            Self::Bash | Self::Zsh | Self::Fish => &["--login"],
            Self::Sh => &["-l"],
            Self::Powershell | Self::Cmd => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TerminalDimensions {
    /// Columns.
    pub width: u16,
    /// Rows.
    pub height: u16,
}

impl Default for TerminalDimensions {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}

impl TerminalDimensions {
    fn pty_size(&self) -> PtySize {
        PtySize {
            rows: self.height,
            cols: self.width,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Idle,
    Closed,
}

/// Line ring fed by the PTY reader thread. `unread` counts lines appended
/// since the last read that reached the buffer tail; windowed reads that
/// stop short leave it untouched.
struct OutputBuffer {
    lines: VecDeque<String>,
    partial: String,
    max_lines: usize,
    unread: usize,
}

impl OutputBuffer {
    fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            partial: String::new(),
            max_lines: max_lines.max(1),
            unread: 0,
        }
    }

    fn append_bytes(&mut self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        for c in text.chars() {
            match c {
                '\n' => {
                    let line = std::mem::take(&mut self.partial);
                    self.push_line(line);
                }
                '\r' => {}
                _ => self.partial.push(c),
            }
        }
    }

    fn push_line(&mut self, line: String) {
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.unread = self.unread.saturating_add(1);
    }

    /// Slice `[start, start+count)` of the retained window. A read whose
    /// window covers the tail clears the unread counter; the pending partial
    /// line is included on tail reads.
    fn read(&mut self, start: usize, count: usize) -> (Vec<String>, usize) {
        let total = self.lines.len();
        let mut slice: Vec<String> = self.lines.iter().skip(start).take(count).cloned().collect();
        let reached_tail = start.saturating_add(count) >= total;
        if reached_tail {
            if !self.partial.is_empty() {
                slice.push(self.partial.clone());
            }
            self.unread = 0;
        }
        (slice, total)
    }

    fn unread(&self) -> usize {
        self.unread
    }

    fn len(&self) -> usize {
        self.lines.len()
    }
}

pub struct TerminalSession {
    id: String,
    shell: ShellKind,
    working_directory: PathBuf,
    created_at: DateTime<Utc>,
    max_history_lines: usize,
    pid: Option<u32>,
    master_fd: Option<RawFd>,
    dimensions: Mutex<TerminalDimensions>,
    state: Mutex<SessionState>,
    last_activity: Mutex<(Instant, DateTime<Utc>)>,
    buffer: Mutex<OutputBuffer>,
    command_history: Mutex<VecDeque<String>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
}

impl TerminalSession {
    fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = (Instant::now(), Utc::now());
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == SessionState::Idle {
            *state = SessionState::Active;
        }
    }

    fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn info(&self) -> TerminalInfo {
        let (_, last_activity) = *self.last_activity.lock().expect("activity lock poisoned");
        let buffer = self.buffer.lock().expect("buffer lock poisoned");
        TerminalInfo {
            terminal_id: self.id.clone(),
            shell_type: self.shell,
            dimensions: *self.dimensions.lock().expect("dimensions lock poisoned"),
            state: self.state(),
            pid: self.pid,
            working_directory: self.working_directory.display().to_string(),
            created_at: self.created_at,
            last_activity,
            buffered_lines: buffer.len(),
            unread_lines: buffer.unread(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminalInfo {
    pub terminal_id: String,
    pub shell_type: ShellKind,
    pub dimensions: TerminalDimensions,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub working_directory: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub buffered_lines: usize,
    pub unread_lines: usize,
}

/// Decoded input request, one channel at a time.
#[derive(Debug, Default)]
pub struct TerminalInput {
    pub input: String,
    pub execute: bool,
    pub control_codes: bool,
    pub raw_bytes: bool,
    pub send_to: Option<String>,
    pub force_input: bool,
}

#[derive(Debug, Serialize)]
pub struct TerminalInputOutcome {
    pub terminal_id: String,
    pub bytes_written: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard_check: Option<GuardCheck>,
}

#[derive(Debug, Serialize)]
pub struct TerminalOutputSlice {
    pub terminal_id: String,
    pub output: String,
    pub start_line: usize,
    pub lines_returned: usize,
    pub total_lines: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreground_process: Option<ForegroundProcess>,
}

#[derive(Debug, Serialize)]
pub struct TerminalCloseOutcome {
    pub terminal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<String>>,
}

/// Narrow capability handed in at construction: whoever tracks state keyed
/// on a terminal id (execution records) learns when the session ends,
/// whether through an explicit close or the shell exiting on its own.
pub trait SessionExitNotifier: Send + Sync {
    fn session_closed(&self, terminal_id: &str);
}

/// PTY session registry: creation, input with program-guard validation,
/// buffered output retrieval, resize, close, and the idle sweep.
pub struct TerminalManager {
    sessions: Mutex<HashMap<String, Arc<TerminalSession>>>,
    max_terminals: usize,
    max_output_lines: usize,
    max_history_lines: usize,
    idle_timeout: Duration,
    exit_notifier: Option<Arc<dyn SessionExitNotifier>>,
}

impl TerminalManager {
    pub fn new(
        max_terminals: usize,
        max_output_lines: usize,
        max_history_lines: usize,
        idle_timeout: Duration,
        exit_notifier: Option<Arc<dyn SessionExitNotifier>>,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_terminals: max_terminals.max(1),
            max_output_lines,
            max_history_lines,
            idle_timeout,
            exit_notifier,
        }
    }

    fn mint_id() -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let seq = TERMINAL_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("term_{ts:x}_{seq}")
    }

    pub fn create(
        &self,
        shell: ShellKind,
        dimensions: TerminalDimensions,
        working_directory: PathBuf,
        env_overlay: &HashMap<String, String>,
    ) -> Result<TerminalInfo, BosunError> {
        {
            let sessions = self.sessions.lock().expect("sessions lock poisoned");
            if sessions.len() >= self.max_terminals {
                return Err(BosunError::ResourceLimit {
                    resource: "terminals",
                    limit: self.max_terminals,
                });
            }
        }

        let pty = native_pty_system()
            .openpty(dimensions.pty_size())
            .map_err(|e| BosunError::ExecutionFailure(format!("failed to open pty: {e}")))?;

        let mut cmd = CommandBuilder::new(shell.program());
        for arg in shell.login_args() {
            cmd.arg(arg);
        }
        cmd.cwd(&working_directory);
        cmd.env_clear();
        for key in INHERITED_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in env_overlay {
            cmd.env(key, value);
        }

        let child = pty
            .slave
            .spawn_command(cmd)
            .map_err(|e| BosunError::ExecutionFailure(format!("failed to spawn shell: {e}")))?;
        let pid = child.process_id();

        let reader = pty
            .master
            .try_clone_reader()
            .map_err(|e| BosunError::ExecutionFailure(format!("failed to clone pty reader: {e}")))?;
        let writer = pty
            .master
            .take_writer()
            .map_err(|e| BosunError::ExecutionFailure(format!("failed to take pty writer: {e}")))?;
        let master_fd = pty.master.as_raw_fd();

        let session = Arc::new(TerminalSession {
            id: Self::mint_id(),
            shell,
            working_directory,
            created_at: Utc::now(),
            max_history_lines: self.max_history_lines,
            pid,
            master_fd,
            dimensions: Mutex::new(dimensions),
            state: Mutex::new(SessionState::Active),
            last_activity: Mutex::new((Instant::now(), Utc::now())),
            buffer: Mutex::new(OutputBuffer::new(self.max_output_lines)),
            command_history: Mutex::new(VecDeque::new()),
            master: Mutex::new(pty.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
        });

        spawn_reader_thread(Arc::clone(&session), reader, self.exit_notifier.clone());

        let info = session.info();
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .insert(session.id.clone(), session);
        tracing::info!(terminal_id = %info.terminal_id, shell = shell.program(), "terminal created");
        Ok(info)
    }

    fn session(&self, terminal_id: &str) -> Result<Arc<TerminalSession>, BosunError> {
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .get(terminal_id)
            .cloned()
            .ok_or_else(|| BosunError::NotFound {
                kind: "terminal",
                id: terminal_id.to_string(),
            })
    }

    /// Write input to a session, subject to the program guard and the
    /// unread-output check. Control-code input implies `force_input` so an
    /// emergency Ctrl+C is never locked out.
    pub fn input(
        &self,
        terminal_id: &str,
        req: &TerminalInput,
    ) -> Result<TerminalInputOutcome, BosunError> {
        if req.control_codes && req.raw_bytes {
            return Err(BosunError::InvalidArgument(
                "control_codes and raw_bytes are mutually exclusive".to_string(),
            ));
        }

        let session = self.session(terminal_id)?;
        if session.state() == SessionState::Closed {
            return Err(BosunError::InvalidArgument(format!(
                "terminal {terminal_id} is closed"
            )));
        }

        let bytes = if req.raw_bytes {
            decode_hex(&req.input)?
        } else if req.control_codes {
            decode_control_codes(&req.input)?
        } else {
            let mut bytes = req.input.clone().into_bytes();
            if req.execute {
                bytes.push(b'\r');
            }
            bytes
        };

        let force = req.force_input || req.control_codes;
        if !force {
            let unread = session.buffer.lock().expect("buffer lock poisoned").unread();
            if unread > 0 {
                return Err(BosunError::InvalidArgument(format!(
                    "{unread} unread output lines pending; read output first or set force_input"
                )));
            }
        }

        let guard_check = match req.send_to.as_deref() {
            None => None,
            Some(raw) => {
                let expr = GuardExpr::parse(raw)?;
                let probe = session.master_fd.and_then(probe_foreground);
                match (&expr, probe) {
                    (GuardExpr::Any, None) => None,
                    (_, None) => {
                        return Err(BosunError::GuardFailure {
                            expected: expr.describe(),
                            observed: "unknown".to_string(),
                        });
                    }
                    (_, Some(probe)) => {
                        if !guard_matches(&expr, &probe) {
                            return Err(BosunError::GuardFailure {
                                expected: expr.describe(),
                                observed: format!("{} (pid {})", probe.name, probe.pid),
                            });
                        }
                        Some(GuardCheck {
                            guard: expr.describe(),
                            foreground: probe,
                        })
                    }
                }
            }
        };

        {
            let mut writer = session.writer.lock().expect("writer lock poisoned");
            writer
                .write_all(&bytes)
                .and_then(|_| writer.flush())
                .map_err(|e| {
                    BosunError::ExecutionFailure(format!("failed to write to terminal: {e}"))
                })?;
        }

        if req.execute && !req.control_codes && !req.raw_bytes {
            let mut history = session
                .command_history
                .lock()
                .expect("history lock poisoned");
            if history.len() == session.max_history_lines {
                history.pop_front();
            }
            history.push_back(req.input.clone());
        }

        session.touch();
        Ok(TerminalInputOutcome {
            terminal_id: terminal_id.to_string(),
            bytes_written: bytes.len(),
            guard_check,
        })
    }

    pub fn output(
        &self,
        terminal_id: &str,
        start_line: usize,
        line_count: usize,
        include_ansi: bool,
        include_foreground_process: bool,
    ) -> Result<TerminalOutputSlice, BosunError> {
        let session = self.session(terminal_id)?;
        let (lines, total_lines) = session
            .buffer
            .lock()
            .expect("buffer lock poisoned")
            .read(start_line, line_count);

        let lines_returned = lines.len();
        let mut output = lines.join("\n");
        if !include_ansi {
            output = ANSI_SEQ.replace_all(&output, "").to_string();
        }

        let foreground_process = (include_foreground_process
            && session.state() != SessionState::Closed)
            .then(|| session.master_fd.and_then(probe_foreground))
            .flatten();

        Ok(TerminalOutputSlice {
            terminal_id: terminal_id.to_string(),
            output,
            start_line,
            lines_returned,
            total_lines,
            foreground_process,
        })
    }

    pub fn resize(
        &self,
        terminal_id: &str,
        dimensions: TerminalDimensions,
    ) -> Result<TerminalInfo, BosunError> {
        let session = self.session(terminal_id)?;
        if session.state() == SessionState::Closed {
            return Err(BosunError::InvalidArgument(format!(
                "terminal {terminal_id} is closed"
            )));
        }
        // PTY and stored dimensions move together under the master lock.
        {
            let master = session.master.lock().expect("master lock poisoned");
            master
                .resize(dimensions.pty_size())
                .map_err(|e| BosunError::ExecutionFailure(format!("resize failed: {e}")))?;
            *session.dimensions.lock().expect("dimensions lock poisoned") = dimensions;
        }
        session.touch();
        Ok(session.info())
    }

    /// Kill the shell, mark the session closed, and keep the record briefly
    /// resolvable for in-flight reads before eviction.
    pub fn close(
        self: &Arc<Self>,
        terminal_id: &str,
        save_history: bool,
    ) -> Result<TerminalCloseOutcome, BosunError> {
        let session = self.session(terminal_id)?;

        {
            let mut child = session.child.lock().expect("child lock poisoned");
            if let Err(e) = child.kill() {
                tracing::debug!(terminal_id, "shell kill on close: {e}");
            }
        }
        *session.state.lock().expect("state lock poisoned") = SessionState::Closed;
        if let Some(notifier) = &self.exit_notifier {
            notifier.session_closed(terminal_id);
        }

        let history = save_history.then(|| {
            session
                .command_history
                .lock()
                .expect("history lock poisoned")
                .iter()
                .cloned()
                .collect::<Vec<_>>()
        });

        let manager = Arc::clone(self);
        let id = terminal_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(CLOSED_RETENTION).await;
            manager
                .sessions
                .lock()
                .expect("sessions lock poisoned")
                .remove(&id);
            tracing::debug!(terminal_id = %id, "closed terminal evicted");
        });

        tracing::info!(terminal_id, "terminal closed");
        Ok(TerminalCloseOutcome {
            terminal_id: terminal_id.to_string(),
            history,
        })
    }

    pub fn get_info(&self, terminal_id: &str) -> Result<TerminalInfo, BosunError> {
        Ok(self.session(terminal_id)?.info())
    }

    /// Current foreground process of a session, when determinable.
    pub fn foreground_of(
        &self,
        terminal_id: &str,
    ) -> Result<Option<ForegroundProcess>, BosunError> {
        let session = self.session(terminal_id)?;
        Ok(session.master_fd.and_then(probe_foreground))
    }

    pub fn list(&self) -> Vec<TerminalInfo> {
        let mut infos: Vec<TerminalInfo> = self
            .sessions
            .lock()
            .expect("sessions lock poisoned")
            .values()
            .map(|s| s.info())
            .collect();
        infos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        infos
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("sessions lock poisoned").len()
    }

    /// Background task flipping sessions to idle after the configured
    /// inactivity threshold.
    pub fn spawn_idle_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(IDLE_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let sessions: Vec<Arc<TerminalSession>> = manager
                    .sessions
                    .lock()
                    .expect("sessions lock poisoned")
                    .values()
                    .cloned()
                    .collect();
                for session in sessions {
                    let inactive = session
                        .last_activity
                        .lock()
                        .expect("activity lock poisoned")
                        .0
                        .elapsed();
                    if inactive > manager.idle_timeout {
                        let mut state = session.state.lock().expect("state lock poisoned");
                        if *state == SessionState::Active {
                            tracing::debug!(terminal_id = %session.id, "session marked idle");
                            *state = SessionState::Idle;
                        }
                    }
                }
            }
        })
    }

    /// Close every session immediately (shutdown path).
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<TerminalSession>> = {
            let mut map = self.sessions.lock().expect("sessions lock poisoned");
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            {
                let mut child = session.child.lock().expect("child lock poisoned");
                let _ = child.kill();
            }
            *session.state.lock().expect("state lock poisoned") = SessionState::Closed;
            if let Some(notifier) = &self.exit_notifier {
                notifier.session_closed(&session.id);
            }
        }
    }
}

/// PTY reads block, so each session gets a dedicated thread feeding the
/// line ring. EOF (shell exited) closes the session and reports the exit so
/// any execution records tied to this terminal reach a terminal status; an
/// explicit close already notified, so the flag suppresses a duplicate.
fn spawn_reader_thread(
    session: Arc<TerminalSession>,
    mut reader: Box<dyn Read + Send>,
    exit_notifier: Option<Arc<dyn SessionExitNotifier>>,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    session
                        .buffer
                        .lock()
                        .expect("buffer lock poisoned")
                        .append_bytes(&buf[..n]);
                    *session.last_activity.lock().expect("activity lock poisoned") =
                        (Instant::now(), Utc::now());
                }
                Err(e) => {
                    tracing::debug!(terminal_id = %session.id, "pty reader ended: {e}");
                    break;
                }
            }
        }
        let was_closed = {
            let mut state = session.state.lock().expect("state lock poisoned");
            let was_closed = *state == SessionState::Closed;
            if !was_closed {
                tracing::info!(terminal_id = %session.id, "shell exited; session closed");
                *state = SessionState::Closed;
            }
            was_closed
        };
        if !was_closed && let Some(notifier) = exit_notifier {
            notifier.session_closed(&session.id);
        }
    });
}
