//! Child-process supervision primitives: shell spawn, capped output drains,
//! stdin feeding, and the SIGTERM → grace → SIGKILL ordering. The per-mode
//! state machine lives in the process manager; everything here owns exactly
//! one child and its stdio streams.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::BosunError;

pub const TERMINATION_GRACE: Duration = Duration::from_secs(5);

const DRAIN_CHUNK: usize = 8 * 1024;

/// Output accumulator bounded by `max_output_size`. Bytes past the cap are
/// dropped (the drain keeps reading so the child never blocks on a full
/// pipe), and crossing the cap raises a notification the adaptive mode
/// listens on.
pub struct SharedCapture {
    inner: Mutex<CaptureState>,
    cap_reached: AtomicBool,
    cap_notify: Notify,
}

struct CaptureState {
    data: Vec<u8>,
    cap: usize,
    /// Byte count past which the cap notification fires. `u64::MAX` for a
    /// pure sink that drains without monitoring.
    threshold: u64,
    total_seen: u64,
}

impl SharedCapture {
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CaptureState {
                data: Vec::with_capacity(cap.min(64 * 1024)),
                cap,
                threshold: cap as u64,
                total_seen: 0,
            }),
            cap_reached: AtomicBool::new(false),
            cap_notify: Notify::new(),
        })
    }

    /// A capture that discards everything: the stream is drained so the
    /// child never blocks, but nothing is stored and the cap never fires.
    pub fn sink() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CaptureState {
                data: Vec::new(),
                cap: 0,
                threshold: u64::MAX,
                total_seen: 0,
            }),
            cap_reached: AtomicBool::new(false),
            cap_notify: Notify::new(),
        })
    }

    fn append(&self, chunk: &[u8]) {
        let hit_cap = {
            let mut state = self.inner.lock().expect("capture lock poisoned");
            state.total_seen += chunk.len() as u64;
            let room = state.cap.saturating_sub(state.data.len());
            let take = chunk.len().min(room);
            state.data.extend_from_slice(&chunk[..take]);
            state.total_seen > state.threshold
        };
        if hit_cap && !self.cap_reached.swap(true, Ordering::SeqCst) {
            self.cap_notify.notify_waiters();
        }
    }

    pub fn truncated(&self) -> bool {
        self.cap_reached.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().expect("capture lock poisoned").data.clone()
    }

    /// Resolves once the stream has produced more than `cap` bytes. Never
    /// resolves for well-behaved children.
    pub async fn cap_hit(&self) {
        loop {
            if self.cap_reached.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.cap_notify.notified();
            tokio::pin!(notified);
            // Register before the re-check; notify_waiters only wakes
            // already-registered waiters.
            notified.as_mut().enable();
            if self.cap_reached.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// What to connect to the child's stdin.
pub enum StdinSource {
    Closed,
    Data(Vec<u8>),
}

pub struct SpawnSpec {
    pub command: String,
    pub working_directory: std::path::PathBuf,
    pub environment: Vec<(String, String)>,
    pub stdin: StdinSource,
    pub capture_output: bool,
    pub max_memory_mb: Option<u64>,
}

/// Spawn `sh -c <command>` as its own process-group leader with a scrubbed
/// environment. The whole group is the signalling unit from here on.
pub fn spawn_shell(spec: SpawnSpec) -> Result<(Child, u32), BosunError> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(&spec.command)
        .current_dir(&spec.working_directory)
        .env_clear()
        .envs(spec.environment.iter().map(|(k, v)| (k, v)))
        .process_group(0);

    match spec.stdin {
        StdinSource::Closed => cmd.stdin(Stdio::null()),
        StdinSource::Data(_) => cmd.stdin(Stdio::piped()),
    };
    if spec.capture_output {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }

    if let Some(mb) = spec.max_memory_mb {
        let bytes: libc::rlim_t = mb.saturating_mul(1024 * 1024);
        unsafe {
            cmd.pre_exec(move || {
                let limit = libc::rlimit {
                    rlim_cur: bytes,
                    rlim_max: bytes,
                };
                if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| BosunError::ExecutionFailure(format!("failed to spawn shell: {e}")))?;
    let pid = child
        .id()
        .ok_or_else(|| BosunError::ExecutionFailure("child exited before pid read".to_string()))?;

    // Feed stdin from a task rather than inline: if the payload exceeds the
    // OS pipe buffer and the child echoes output, an inline write deadlocks
    // against the undrained stdout pipe.
    if let StdinSource::Data(data) = spec.stdin {
        let mut stdin = child.stdin.take().expect("stdin was piped");
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&data).await {
                tracing::debug!("stdin feed ended early: {e}");
            }
            // drop closes the pipe so the child sees EOF
        });
    }

    Ok((child, pid))
}

/// Drain one stdio pipe into a capture, reading to EOF regardless of the
/// cap so the child never stalls on a full pipe.
pub fn spawn_drain<R>(mut reader: R, capture: Arc<SharedCapture>) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; DRAIN_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => capture.append(&buf[..n]),
                Err(e) => {
                    tracing::warn!("pipe drain error: {e}");
                    break;
                }
            }
        }
    })
}

/// Signal an entire process group. `process_group(0)` made the child its own
/// leader, so `-pid` addresses the child and every grandchild.
pub fn signal_group(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

/// SIGTERM, wait out the grace window, then SIGKILL. Returns the observed
/// exit status when the child is reaped in time.
pub async fn terminate_group(child: &mut Child, pid: u32, grace: Duration) -> Option<std::process::ExitStatus> {
    signal_group(pid, libc::SIGTERM);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        _ => {
            signal_group(pid, libc::SIGKILL);
            child.wait().await.ok()
        }
    }
}

/// Drop guard that kills the whole process group. Armed while a supervision
/// task runs so a torn-down runtime cannot orphan grandchildren; disarmed
/// once the child is reaped.
pub struct ProcessGroupGuard {
    pid: Option<u32>,
}

impl ProcessGroupGuard {
    pub fn new(pid: u32) -> Self {
        Self { pid: Some(pid) }
    }

    pub fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            signal_group(pid, libc::SIGKILL);
        }
    }
}
