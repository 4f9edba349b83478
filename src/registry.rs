//! Session Registry (spec §4.5, component C5): owns the id → Session map
//! and reconstructs on-disk state left behind by a previous server
//! process (crash recovery).

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::eventloop::{EventLoop, Interest};
use crate::pty;
use crate::recording::{self, Event, EventKind};
use crate::session::{CreateSessionSpec, FdRole, Session, Status};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// The opaque value registered with the shared event loop for every fd a
/// session owns: which session it belongs to, and which of its fds.
pub type SessionFd = (String, FdRole);

pub struct Registry {
    config: ServerConfig,
    sessions: DashMap<String, Arc<Session>>,
    event_loop: Arc<EventLoop<SessionFd>>,
}

#[derive(Deserialize)]
struct Meta {
    id: String,
    pid: i32,
}

impl Registry {
    pub fn new(config: ServerConfig, event_loop: Arc<EventLoop<SessionFd>>) -> Self {
        Self { config, sessions: DashMap::new(), event_loop }
    }

    pub fn control_root(&self) -> &Path {
        &self.config.control_root
    }

    pub fn default_term(&self) -> &str {
        &self.config.term
    }

    pub fn event_loop(&self) -> &Arc<EventLoop<SessionFd>> {
        &self.event_loop
    }

    /// Scans `control_root` for session directories left by a previous
    /// process, finalizes any whose pid is no longer alive so a crash
    /// doesn't leave a recording stuck mid-stream, and reconstructs an
    /// in-memory entry for each so it's visible through `list`/`get`
    /// until explicitly cleaned up (spec §4.5). Sessions whose process is
    /// still alive are left untouched — this server has no way to
    /// reacquire a PTY master fd it never opened, so reattachment across
    /// a restart is out of scope.
    pub fn recover_on_startup(&self) {
        let entries = match std::fs::read_dir(&self.config.control_root) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let meta: Meta = match std::fs::read_to_string(dir.join("meta.json"))
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok())
            {
                Some(m) => m,
                None => continue,
            };
            let recording_path = dir.join("stream-out");
            if !recording_path.exists() {
                continue;
            }
            if pty::is_alive(meta.pid) {
                warn!(
                    session_id = %meta.id, pid = meta.pid,
                    "found a still-living process from a previous server run; leaving it alone"
                );
                continue;
            }
            match finalize_orphaned_recording(&recording_path) {
                Ok(true) => info!(session_id = %meta.id, "finalized recording left open by a previous crash"),
                Ok(false) => {}
                Err(e) => warn!(session_id = %meta.id, error = %e, "failed to finalize orphaned recording"),
            }
            match Session::reconstruct(&meta.id, &dir, meta.pid) {
                Ok(session) => {
                    info!(session_id = %meta.id, "recovered session from a previous server run");
                    self.sessions.insert(meta.id.clone(), session);
                }
                Err(e) => warn!(session_id = %meta.id, error = %e, "failed to reconstruct session"),
            }
        }
    }

    /// Spawns a new session and registers its fds with the shared event
    /// loop (spec §4.5 `create`).
    pub fn create(&self, spec: CreateSessionSpec) -> Result<Arc<Session>, AppError> {
        let (session, master_fd, stdin_fd) =
            Session::create(&self.config.control_root, spec, &self.config.term)?;
        self.event_loop
            .add(master_fd, Interest::READ, (session.id.clone(), FdRole::Master))
            .map_err(|e| AppError::Other(anyhow::anyhow!("failed to register pty master: {e}")))?;
        self.event_loop
            .add(stdin_fd, Interest::READ, (session.id.clone(), FdRole::Stdin))
            .map_err(|e| AppError::Other(anyhow::anyhow!("failed to register stdin fifo: {e}")))?;
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|e| e.clone())
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.clone()).collect()
    }

    /// Requires the session to already be in `exited` state (spec §4.5
    /// `cleanup`); removes it from the map and deletes its directory.
    pub fn cleanup(&self, id: &str) -> Result<(), AppError> {
        let session = self
            .sessions
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| AppError::NotFound(id.to_string()))?;
        session.cleanup()?;
        let _ = self.event_loop.remove(session.master_fd());
        let _ = self.event_loop.remove(session.stdin_fd());
        self.sessions.remove(id);
        Ok(())
    }

    /// Runs `cleanup()` on every session in `exited` state, returning the
    /// ids that were removed (spec §4.5 `cleanupExited`). Idempotent: a
    /// session already `running` or already `cleaned` is left untouched.
    pub fn cleanup_exited(&self) -> Vec<String> {
        let exited: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().status() == Status::Exited)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = Vec::new();
        for id in exited {
            if let Some((_, session)) = self.sessions.remove(&id) {
                let _ = self.event_loop.remove(session.master_fd());
                let _ = self.event_loop.remove(session.stdin_fd());
                match session.cleanup() {
                    Ok(()) => removed.push(id),
                    Err(e) => warn!(session_id = %id, error = %e, "failed to clean up exited session"),
                }
            }
        }
        removed
    }

    /// Drives the shared event loop until `stop()` is called on it from
    /// another worker (spec §4.2/§5: one event-loop worker, owned
    /// exclusively by this call). Dispatches PTY-master readiness to
    /// [`Session::on_master_readable`] and stdin-FIFO readiness to
    /// [`Session::on_stdin_readable`], draining each edge-triggered
    /// notification as the contract requires.
    ///
    /// Intended to run on its own OS thread — `run_once`'s underlying
    /// `poll(2)`/`kevent(2)` wait blocks synchronously, so this must never
    /// be awaited from a Tokio task.
    pub fn run_event_loop(&self) {
        loop {
            if self.event_loop.is_stopped() {
                return;
            }
            let result = self.event_loop.run_once(
                std::time::Duration::from_millis(100),
                |readiness, (id, role)| {
                    let Some(session) = self.sessions.get(id).map(|e| e.clone()) else {
                        return;
                    };
                    let was_running = session.status() == Status::Running;
                    if readiness.error || readiness.hup {
                        if *role == crate::session::FdRole::Master {
                            session.on_master_readable();
                        }
                    } else if readiness.readable {
                        match role {
                            crate::session::FdRole::Master => session.on_master_readable(),
                            crate::session::FdRole::Stdin => session.on_stdin_readable(readiness.fd),
                        }
                    }
                    // The child's exit is only detected inside the
                    // `on_*_readable` calls above, so check status
                    // afterward rather than special-casing which fd
                    // noticed it.
                    if was_running && session.status() != Status::Running {
                        let _ = self.event_loop.remove(session.master_fd());
                        let _ = self.event_loop.remove(session.stdin_fd());
                    }
                },
            );
            if let Err(e) = result {
                warn!(error = %e, "event loop poll failed");
            }
        }
    }
}

/// One entry of the `--list-sessions` CLI output (spec §6): `{cmdline,
/// cwd, name, pid, status, exit_code, started_at, stream-out, stdin}`.
/// Read straight off disk rather than through a `Registry`/`Session`
/// pair, so listing never needs an event loop or mutates anything —
/// this is the one CLI operation that must work whether or not a
/// `--serve` process currently owns these directories.
#[derive(Serialize)]
pub struct SessionSummary {
    pub cmdline: String,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub pid: i32,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "stream-out")]
    pub stream_out: String,
    pub stdin: String,
}

#[derive(Deserialize, Default)]
struct FullMeta {
    command: Option<Vec<String>>,
    cwd: Option<std::path::PathBuf>,
    name: Option<String>,
    pid: Option<i32>,
    started_at: Option<DateTime<Utc>>,
}

/// Scans `control_root` and builds a summary of every session directory
/// found, live or exited, for the CLI's `--list-sessions` (spec §6). Does
/// not require a running event loop or registry.
pub fn scan_sessions(control_root: &Path) -> BTreeMap<String, SessionSummary> {
    let mut out = BTreeMap::new();
    let entries = match std::fs::read_dir(control_root) {
        Ok(e) => e,
        Err(_) => return out,
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let id = match dir.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let meta: FullMeta = std::fs::read_to_string(dir.join("meta.json"))
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        let recording_path = dir.join("stream-out");
        let events = recording::read_events(&recording_path).unwrap_or_default();
        let pid = meta.pid.unwrap_or(-1);
        let alive = pid >= 0 && pty::is_alive(pid);
        let last_exit = events
            .iter()
            .rev()
            .find(|e| e.kind == EventKind::Exit)
            .and_then(|e| e.data.parse::<i32>().ok());
        let status = if alive {
            "running"
        } else if last_exit.is_some() {
            "exited"
        } else {
            "unknown"
        };
        out.insert(
            id,
            SessionSummary {
                cmdline: meta.command.unwrap_or_default().join(" "),
                cwd: meta.cwd.map(|p| p.display().to_string()).unwrap_or_default(),
                name: meta.name,
                pid,
                status: status.to_string(),
                exit_code: if alive { None } else { last_exit },
                started_at: meta.started_at.unwrap_or_else(Utc::now),
                stream_out: recording_path.display().to_string(),
                stdin: dir.join("stdin").display().to_string(),
            },
        );
    }
    out
}

/// Appends a synthetic `exit` event to a recording that never got one,
/// because the server that owned it was killed before its child was
/// reaped. Returns `false` if the recording already ends in an exit
/// event (nothing to do).
fn finalize_orphaned_recording(path: &Path) -> anyhow::Result<bool> {
    let events = recording::read_events(path)?;
    if matches!(events.last(), Some(e) if e.kind == EventKind::Exit) {
        return Ok(false);
    }
    let t = events.last().map(|e| e.time).unwrap_or(0.0);
    let line = Event::exit(t, -1).to_line();
    let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{Header, RecordingWriter};
    use tempfile::tempdir;

    #[test]
    fn finalizes_recording_missing_exit_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stream-out");
        let mut writer = RecordingWriter::create(&path, &Header::new(80, 24)).unwrap();
        writer.append(&Event::output(0.1, "hi")).unwrap();

        let changed = finalize_orphaned_recording(&path).unwrap();
        assert!(changed);

        let events = recording::read_events(&path).unwrap();
        assert_eq!(events.last().unwrap().kind, EventKind::Exit);
    }

    #[test]
    fn leaves_already_finalized_recording_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stream-out");
        let mut writer = RecordingWriter::create(&path, &Header::new(80, 24)).unwrap();
        writer.append(&Event::exit(0.1, 0)).unwrap();

        let changed = finalize_orphaned_recording(&path).unwrap();
        assert!(!changed);
    }

    #[test]
    fn scan_sessions_reports_exited_session_from_disk() {
        let root = tempdir().unwrap();
        let session_dir = root.path().join("deadbeef");
        std::fs::create_dir_all(&session_dir).unwrap();
        std::fs::write(
            session_dir.join("meta.json"),
            r#"{"command":["/bin/sh","-c","true"],"cwd":"/tmp","name":"build","pid":999999}"#,
        )
        .unwrap();
        let mut writer =
            RecordingWriter::create(session_dir.join("stream-out"), &Header::new(80, 24)).unwrap();
        writer.append(&Event::exit(0.1, 3)).unwrap();

        let sessions = scan_sessions(root.path());
        let summary = sessions.get("deadbeef").expect("session should be listed");
        assert_eq!(summary.status, "exited");
        assert_eq!(summary.exit_code, Some(3));
        assert_eq!(summary.name.as_deref(), Some("build"));
        assert_eq!(summary.cmdline, "/bin/sh -c true");
    }

    #[test]
    fn scan_sessions_reports_unknown_status_without_a_recording() {
        let root = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("bare-dir")).unwrap();

        let sessions = scan_sessions(root.path());
        let summary = sessions.get("bare-dir").expect("directory should still be listed");
        assert_eq!(summary.status, "unknown");
        assert_eq!(summary.exit_code, None);
    }
}
