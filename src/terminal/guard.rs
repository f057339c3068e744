//! Program guard: validates the PTY's current foreground process against a
//! caller-supplied guard expression before input is written. OS
//! introspection is confined to `probe_foreground`; guard evaluation itself
//! is a pure predicate.

use std::os::fd::RawFd;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::BosunError;

/// Constraint on who may receive terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardExpr {
    /// `*`: any foreground process.
    Any,
    /// `pid:<n>`: exact process id.
    Pid(u32),
    /// `sessionleader:`: the foreground process must lead the session.
    SessionLeader,
    /// Absolute path: executable path match.
    Path(PathBuf),
    /// Anything else: process basename match.
    Name(String),
}

impl GuardExpr {
    pub fn parse(raw: &str) -> Result<Self, BosunError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(BosunError::InvalidArgument(
                "send_to must not be empty".to_string(),
            ));
        }
        if raw == "*" {
            return Ok(Self::Any);
        }
        if let Some(pid) = raw.strip_prefix("pid:") {
            let pid = pid.parse::<u32>().map_err(|_| {
                BosunError::InvalidArgument(format!("invalid pid in guard: {pid}"))
            })?;
            return Ok(Self::Pid(pid));
        }
        if raw == "sessionleader:" {
            return Ok(Self::SessionLeader);
        }
        if raw.starts_with('/') {
            return Ok(Self::Path(PathBuf::from(raw)));
        }
        Ok(Self::Name(raw.to_string()))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Any => "*".to_string(),
            Self::Pid(pid) => format!("pid:{pid}"),
            Self::SessionLeader => "sessionleader:".to_string(),
            Self::Path(path) => path.display().to_string(),
            Self::Name(name) => name.clone(),
        }
    }
}

/// Best-effort snapshot of the process owning the terminal's foreground
/// process group.
#[derive(Debug, Clone, Serialize)]
pub struct ForegroundProcess {
    pub pid: u32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub session_leader: bool,
}

/// Read the foreground process group of the PTY and describe its leader via
/// /proc. Returns None when the probe cannot determine it (dead group,
/// masked /proc, non-Linux).
pub fn probe_foreground(master_fd: RawFd) -> Option<ForegroundProcess> {
    let pgid = unsafe { libc::tcgetpgrp(master_fd) };
    if pgid <= 0 {
        return None;
    }
    let pid = pgid as u32;

    let name = std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()?
        .trim()
        .to_string();
    let path = std::fs::read_link(format!("/proc/{pid}/exe")).ok();
    let session_leader = read_session_id(pid).is_some_and(|sid| sid == pid);

    Some(ForegroundProcess {
        pid,
        name,
        path,
        session_leader,
    })
}

/// Session id from /proc/<pid>/stat. The comm field may contain spaces and
/// parentheses, so fields are counted from after the last ')'.
fn read_session_id(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    // rest: " <state> <ppid> <pgrp> <session> ..."
    rest.split_whitespace().nth(3)?.parse().ok()
}

/// Pure guard predicate over (expression, probe result).
pub fn guard_matches(guard: &GuardExpr, probe: &ForegroundProcess) -> bool {
    match guard {
        GuardExpr::Any => true,
        GuardExpr::Pid(pid) => probe.pid == *pid,
        GuardExpr::SessionLeader => probe.session_leader,
        GuardExpr::Path(path) => probe.path.as_deref() == Some(path.as_path()),
        GuardExpr::Name(name) => {
            probe.name == *name
                || probe
                    .path
                    .as_deref()
                    .and_then(|p| p.file_name())
                    .is_some_and(|base| base.to_string_lossy() == *name)
        }
    }
}

/// Attached to successful guarded input so callers can audit what the guard
/// saw at the moment of the write.
#[derive(Debug, Clone, Serialize)]
pub struct GuardCheck {
    pub guard: String,
    pub foreground: ForegroundProcess,
}
