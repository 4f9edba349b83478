//! The Session object (spec §4.4, component C4): the composite that ties
//! a PTY, a child process, a recording file, and an input path into one
//! managed lifecycle.

use crate::error::{AppError, ResourceError};
use crate::pty::{self, PtyMaster};
use crate::recording::{self, Event, Header, RecordingWriter};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, trace, warn};

use super::spec::CreateSessionSpec;

/// Output chunks are appended as one event per read, bounded so a single
/// burst of PTY output can't produce one unbounded recording line (spec
/// §4.4).
pub const OUTPUT_CHUNK_BOUND: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Starting,
    Running,
    Exited,
    Cleaned,
}

/// Which fd a readiness notification is about, for the shared event loop
/// (spec §4.4: PTY output, plus the `stdin` FIFO used by the companion
/// CLI tool to route input into a running session from another process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FdRole {
    Master,
    Stdin,
}

/// An event broadcast to every live subscriber, numbered by its position
/// in the append order. The ordinal lets a fresh subscriber reconcile its
/// disk-read backlog against the live feed without gaps or duplicates
/// (see [`crate::multiplexer`]).
pub type BusMessage = (u64, Event);

pub struct Session {
    pub id: String,
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub dir: PathBuf,
    pub name: Option<String>,
    pub started_at: DateTime<Utc>,

    size: Mutex<(u16, u16)>,
    pid: AtomicI32,
    status: Mutex<Status>,
    exit_code: Mutex<Option<i32>>,
    stale: AtomicBool,

    writer: Mutex<RecordingWriter>,
    /// Shared by the reader (event-loop worker, via `on_master_readable`)
    /// and writers (HTTP input handlers); contention is negligible since
    /// reads and writes to a PTY master are both brief. `None` for a
    /// session reconstructed from disk on startup (spec §4.5): its
    /// process is already gone, so there is no live fd to hold.
    master: Mutex<Option<PtyMaster>>,
    child: Mutex<Option<pty::Spawned>>,

    /// Raw fds registered with the shared event loop (spec §4.2). `-1` for
    /// a session reconstructed from disk on startup, which never registers
    /// anything with the event loop.
    master_fd: RawFd,
    stdin_fd: RawFd,
    /// Owns the stdin FIFO fd so it closes on drop; `None` for a
    /// reconstructed session, matching `master`/`child` above.
    stdin_owner: Option<OwnedFd>,

    event_count: AtomicU64,
    bus: broadcast::Sender<BusMessage>,
}

const BUS_CAPACITY: usize = 16_384;

impl Session {
    /// Allocates the session directory, writes the header, spawns the
    /// child, and returns both the `Session` and the raw fds the caller
    /// must register with the shared event loop. On any failure the
    /// partially created directory is removed (spec §4.4 `create`).
    pub fn create(
        control_root: &Path,
        spec: CreateSessionSpec,
        default_term: &str,
    ) -> Result<(Arc<Session>, RawFd, RawFd), AppError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let dir = control_root.join(&id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| AppError::Resource(ResourceError::Storage(e)))?;

        let result = Self::create_inner(&id, &dir, spec, default_term);
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dir);
                Err(e)
            }
        }
    }

    fn create_inner(
        id: &str,
        dir: &Path,
        spec: CreateSessionSpec,
        default_term: &str,
    ) -> Result<(Arc<Session>, RawFd, RawFd), AppError> {
        let term = spec
            .env
            .get("TERM")
            .cloned()
            .unwrap_or_else(|| default_term.to_string());
        let mut env = spec.env.clone();
        env.entry("TERM".to_string()).or_insert(term.clone());

        let spawned = pty::spawn(&spec.command, &spec.cwd, &env, spec.cols, spec.rows)?;
        let master_fd = spawned.master.raw_fd();
        let master_handle = spawned
            .master
            .try_clone()
            .map_err(|e| ResourceError::Spawn(format!("failed to dup pty master: {e}")))?;

        let stdin_path = dir.join("stdin");
        let stdin_owner = make_stdin_fifo(&stdin_path).map_err(ResourceError::Storage)?;
        let stdin_fd = stdin_owner.as_raw_fd();

        let mut header = Header::new(spec.cols as u32, spec.rows as u32);
        header.timestamp = Some(Utc::now().timestamp());
        header.command = Some(spec.command.join(" "));
        header.env = Some(env.clone());
        let writer = RecordingWriter::create(dir.join("stream-out"), &header)
            .map_err(ResourceError::Storage)?;

        write_meta(dir, id, &spec, &term, spawned.pid);
        let name = spec.name.clone();

        let (bus_tx, _rx) = broadcast::channel(BUS_CAPACITY);

        let session = Arc::new(Session {
            id: id.to_string(),
            command: spec.command,
            cwd: spec.cwd,
            env,
            dir: dir.to_path_buf(),
            name,
            started_at: Utc::now(),
            size: Mutex::new((spec.cols, spec.rows)),
            pid: AtomicI32::new(spawned.pid),
            status: Mutex::new(Status::Running),
            exit_code: Mutex::new(None),
            stale: AtomicBool::new(false),
            writer: Mutex::new(writer),
            master: Mutex::new(Some(master_handle)),
            child: Mutex::new(Some(spawned)),
            master_fd,
            stdin_fd,
            stdin_owner: Some(stdin_owner),
            event_count: AtomicU64::new(0),
            bus: bus_tx,
        });

        info!(session_id = %session.id, pid = session.pid(), "session running");
        Ok((session, master_fd, stdin_fd))
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::SeqCst)
    }

    /// The master fd registered with the shared event loop, or `-1` for a
    /// reconstructed session that never registered one.
    pub fn master_fd(&self) -> RawFd {
        self.master_fd
    }

    /// The stdin FIFO fd registered with the shared event loop, or `-1`
    /// for a reconstructed session that never registered one.
    pub fn stdin_fd(&self) -> RawFd {
        self.stdin_fd
    }

    pub fn status(&self) -> Status {
        *self.status.lock()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    pub fn size(&self) -> (u16, u16) {
        *self.size.lock()
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        std::fs::metadata(self.dir.join("stream-out"))
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or(self.started_at)
            .max(self.started_at)
    }

    pub fn subscribe_bus(&self) -> broadcast::Receiver<BusMessage> {
        self.bus.subscribe()
    }

    pub fn current_header(&self) -> anyhow::Result<Header> {
        Ok(recording::read_header(&self.dir.join("stream-out"))?.0)
    }

    /// Reads the backlog from disk and returns it alongside the ordinal
    /// count at the moment of the read, which a subscriber uses to
    /// reconcile against the live bus (spec §4.6).
    pub fn read_backlog(&self) -> anyhow::Result<(Vec<Event>, u64)> {
        let events = recording::read_events(&self.dir.join("stream-out"))?;
        let ordinal = events.len() as u64;
        Ok((events, ordinal))
    }

    /// Returns the full recording file verbatim (spec §4.4 `snapshot`).
    pub fn snapshot(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.join("stream-out"))
    }

    /// Emits a self-contained cast file with `duration` populated in the
    /// header (spec §4.4 `exportRecording`).
    pub fn export_recording(&self) -> anyhow::Result<Vec<u8>> {
        let path = self.dir.join("stream-out");
        let (mut header, _) = recording::read_header(&path)?;
        let events = recording::read_events(&path)?;
        // The terminal `exit` event carries no timestamp on the wire (spec
        // §4.4/§8 E2: `["exit", code, ""]`), so `duration` comes from the
        // last timestamped event instead of unconditionally the last one.
        header.duration = events
            .iter()
            .rev()
            .find(|e| e.kind != recording::EventKind::Exit)
            .map(|e| e.time);
        let mut out = serde_json::to_string(&header)?;
        out.push('\n');
        for event in &events {
            out.push_str(&event.to_line());
            out.push('\n');
        }
        Ok(out.into_bytes())
    }

    /// Writes raw bytes or a translated special key to the PTY (spec
    /// §4.4 `sendInput`). Concurrent callers serialize on `write_master`.
    ///
    /// `ProcessGone`/410 covers both ways a caller can discover the child
    /// is dead: the event loop already reaped it and the session sits in
    /// `exited`, or this very call is the first thing to notice a dead pid
    /// on a session still marked `running` (spec §8 E4 exercises the
    /// former — the status transition has already happened by the time
    /// the request arrives, and the dead-process error must still win
    /// over the more generic `NotRunning`).
    pub fn send_input(&self, payload: &str) -> Result<(), AppError> {
        match self.status() {
            Status::Running => {}
            Status::Exited | Status::Cleaned => return Err(AppError::ProcessGone),
            Status::Starting => return Err(AppError::NotRunning),
        }
        if !pty::is_alive(self.pid()) {
            self.mark_exited_stale();
            return Err(AppError::ProcessGone);
        }
        let bytes = pty::resolve_input(payload);
        let mut master = self.master.lock();
        let master = master.as_mut().ok_or(AppError::ProcessGone)?;
        master
            .write_all(&bytes)
            .map_err(ResourceError::Storage)?;
        Ok(())
    }

    /// Updates the PTY window size and appends a `"r"` event (spec §4.4
    /// `resize`). Idempotent when the size is unchanged.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), AppError> {
        if self.status() != Status::Running {
            return Err(AppError::NotRunning);
        }
        {
            let mut size = self.size.lock();
            if *size == (cols, rows) {
                return Ok(());
            }
            *size = (cols, rows);
        }
        let master = self.master.lock();
        let master_ref = master.as_ref().ok_or(AppError::ProcessGone)?;
        master_ref
            .resize(cols, rows)
            .map_err(ResourceError::Storage)?;
        pty::notify_winch(master_ref);
        drop(master);
        let t = self.writer.lock().elapsed();
        self.append_event(Event::resize(t, cols as u32, rows as u32));
        Ok(())
    }

    /// Delivers SIGTERM/SIGKILL without waiting for the reaper (spec §4.4
    /// `kill`); the event loop's EOF/HUP handling performs the reap.
    pub async fn kill(&self) {
        let pid = self.pid();
        pty::kill_with_escalation(pid).await;
    }

    /// Requires `status ∈ {exited}`; removes the session directory and
    /// transitions to `cleaned` (spec §4.4 `cleanup`).
    pub fn cleanup(&self) -> Result<(), AppError> {
        if self.status() != Status::Exited {
            return Err(AppError::Client(
                "session must be exited before cleanup".to_string(),
            ));
        }
        std::fs::remove_dir_all(&self.dir).map_err(ResourceError::Storage)?;
        *self.status.lock() = Status::Cleaned;
        Ok(())
    }

    fn mark_exited_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
        let mut status = self.status.lock();
        if *status != Status::Exited && *status != Status::Cleaned {
            *status = Status::Exited;
            drop(status);
            if self.exit_code().is_none() {
                *self.exit_code.lock() = Some(-1);
                let t = self.writer.lock().elapsed();
                self.append_event(Event::exit(t, -1));
            }
        }
    }

    fn append_event(&self, event: Event) {
        if let Err(e) = self.writer.lock().append(&event) {
            warn!(session_id = %self.id, error = %e, "failed to append recording event");
            return;
        }
        let ordinal = self.event_count.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.bus.send((ordinal, event));
    }

    /// Called by the event-loop worker when the PTY master is readable;
    /// drains to `EAGAIN` and appends one output event per read, chunked
    /// at [`OUTPUT_CHUNK_BOUND`] (spec §4.4).
    pub fn on_master_readable(&self) {
        let mut buf = vec![0u8; OUTPUT_CHUNK_BOUND];
        loop {
            let read = {
                let mut master = self.master.lock();
                match master.as_mut() {
                    Some(master) => master.read(&mut buf),
                    None => return,
                }
            };
            match read {
                Ok(0) => {
                    self.reap();
                    return;
                }
                Ok(n) => {
                    let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let t = self.writer.lock().elapsed();
                    self.append_event(Event::output(t, data));
                    trace!(session_id = %self.id, bytes = n, "appended output event");
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(session_id = %self.id, error = %e, "pty read error");
                    self.reap();
                    return;
                }
            }
        }
    }

    /// Called when the `stdin` FIFO is readable (input routed in from the
    /// companion CLI process rather than the HTTP surface).
    pub fn on_stdin_readable(&self, stdin_fd: RawFd) {
        let mut buf = vec![0u8; 4096];
        loop {
            match pty::read_raw(stdin_fd, &mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    if self.status() != Status::Running {
                        continue;
                    }
                    let mut master = self.master.lock();
                    if let Some(master) = master.as_mut() {
                        let _ = master.write_all(&buf[..n]);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(_) => return,
            }
        }
    }

    /// Reaps the child once EOF/HUP has been observed, appends the
    /// terminal `exit` event, and transitions to `exited` (spec §4.4).
    fn reap(&self) {
        if self.status() != Status::Running {
            return;
        }
        let code = {
            let mut child = self.child.lock();
            match child.as_mut() {
                Some(child) => child.wait().unwrap_or(-1),
                None => -1,
            }
        };
        *self.exit_code.lock() = Some(code);
        *self.status.lock() = Status::Exited;
        let t = self.writer.lock().elapsed();
        self.append_event(Event::exit(t, code));
        info!(session_id = %self.id, exit_code = code, "session exited");
    }

    /// Rebuilds a `Session` purely from what's on disk, for a directory
    /// left behind by a previous server process whose own process is
    /// confirmed dead (spec §4.5). The result has no PTY master and no
    /// child handle — every method that would touch either treats that as
    /// "already gone" rather than panicking, so a reconstructed session
    /// is fully usable for listing, streaming its backlog, and `cleanup`.
    pub fn reconstruct(id: &str, dir: &Path, pid: i32) -> anyhow::Result<Arc<Session>> {
        #[derive(serde::Deserialize, Default)]
        struct Meta {
            command: Option<Vec<String>>,
            cwd: Option<PathBuf>,
            name: Option<String>,
            started_at: Option<DateTime<Utc>>,
        }
        let meta: Meta = std::fs::read_to_string(dir.join("meta.json"))
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

        let recording_path = dir.join("stream-out");
        let (header, _) = recording::read_header(&recording_path)?;
        let events = recording::read_events(&recording_path)?;
        let exit_code = events
            .iter()
            .rev()
            .find(|e| e.kind == crate::recording::EventKind::Exit)
            .and_then(|e| e.data.parse::<i32>().ok());

        let writer = RecordingWriter::open_for_append(&recording_path)?;

        let session = Arc::new(Session {
            id: id.to_string(),
            command: meta.command.unwrap_or_default(),
            cwd: meta.cwd.unwrap_or_else(|| dir.to_path_buf()),
            env: header.env.clone().unwrap_or_default(),
            dir: dir.to_path_buf(),
            name: meta.name,
            started_at: meta.started_at.unwrap_or_else(Utc::now),
            size: Mutex::new((header.width as u16, header.height as u16)),
            pid: AtomicI32::new(pid),
            status: Mutex::new(Status::Exited),
            exit_code: Mutex::new(exit_code),
            stale: AtomicBool::new(true),
            writer: Mutex::new(writer),
            master: Mutex::new(None),
            child: Mutex::new(None),
            master_fd: -1,
            stdin_fd: -1,
            stdin_owner: None,
            event_count: AtomicU64::new(events.len() as u64),
            bus: broadcast::channel(BUS_CAPACITY).0,
        });
        Ok(session)
    }

    /// Used by the registry's startup scan to reconstruct a synthetic
    /// exit for a session whose process is already gone but whose
    /// recording never got a terminal event (spec §4.5).
    pub fn force_mark_exited(&self, code: i32) {
        let mut status = self.status.lock();
        if *status == Status::Running || *status == Status::Starting {
            *status = Status::Exited;
            drop(status);
            *self.exit_code.lock() = Some(code);
            let t = self.writer.lock().elapsed();
            self.append_event(Event::exit(t, code));
        }
    }
}

fn write_meta(dir: &Path, id: &str, spec: &CreateSessionSpec, term: &str, pid: i32) {
    #[derive(Serialize)]
    struct Meta<'a> {
        id: &'a str,
        command: &'a [String],
        cwd: &'a Path,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: &'a Option<String>,
        term: &'a str,
        pid: i32,
        started_at: DateTime<Utc>,
    }
    let meta = Meta {
        id,
        command: &spec.command,
        cwd: &spec.cwd,
        name: &spec.name,
        term,
        pid,
        started_at: Utc::now(),
    };
    if let Ok(json) = serde_json::to_vec_pretty(&meta) {
        let _ = std::fs::write(dir.join("meta.json"), json);
    }
}

#[cfg(unix)]
fn make_stdin_fifo(path: &Path) -> std::io::Result<OwnedFd> {
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;

    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
        Err(e) => return Err(std::io::Error::from_raw_os_error(e as i32)),
    }

    // Opened O_RDWR (not O_RDONLY) so the fd never blocks waiting for a
    // writer to connect and readiness polling reports correctly when
    // the FIFO is empty.
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    Ok(file.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::spec::CreateSessionSpec;
    use tempfile::tempdir;

    fn spec(cmd: &[&str]) -> CreateSessionSpec {
        CreateSessionSpec::new(
            cmd.iter().map(|s| s.to_string()).collect(),
            None,
            None,
            "xterm-256color",
        )
        .unwrap()
    }

    #[test]
    fn create_and_reap_exit_zero() {
        let dir = tempdir().unwrap();
        let (session, master_fd, _stdin_fd) =
            Session::create(dir.path(), spec(&["/bin/sh", "-c", "exit 0"]), "xterm-256color")
                .unwrap();
        assert_eq!(session.status(), Status::Running);
        assert!(master_fd >= 0);

        // Give the shell a moment to exit, then simulate the event loop
        // observing EOF on the master.
        std::thread::sleep(std::time::Duration::from_millis(200));
        session.on_master_readable();

        assert_eq!(session.status(), Status::Exited);
        assert_eq!(session.exit_code(), Some(0));
    }

    #[test]
    fn send_input_after_reap_is_process_gone_not_not_running() {
        let dir = tempdir().unwrap();
        let (session, _master_fd, _stdin_fd) =
            Session::create(dir.path(), spec(&["/bin/sh", "-c", "exit 3"]), "xterm-256color")
                .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(200));
        session.on_master_readable();
        assert_eq!(session.status(), Status::Exited);

        assert!(matches!(session.send_input("hi"), Err(AppError::ProcessGone)));
    }

    #[test]
    fn cleanup_requires_exited() {
        let dir = tempdir().unwrap();
        let (session, _m, _s) =
            Session::create(dir.path(), spec(&["/bin/sh", "-c", "sleep 5"]), "xterm-256color")
                .unwrap();
        assert!(session.cleanup().is_err());
    }

    #[test]
    fn resize_is_idempotent_when_unchanged() {
        let dir = tempdir().unwrap();
        let (session, _m, _s) =
            Session::create(dir.path(), spec(&["/bin/sh", "-c", "sleep 5"]), "xterm-256color")
                .unwrap();
        let (cols, rows) = session.size();
        session.resize(cols, rows).unwrap();
        let (_, count) = session.read_backlog().unwrap();
        assert_eq!(count, 0, "no-op resize should not append a redundant event");
        let _ = session.kill();
    }

    fn write_recording(dir: &Path, events: &[Event]) {
        let mut writer = RecordingWriter::create(dir.join("stream-out"), &Header::new(80, 24)).unwrap();
        for event in events {
            writer.append(event).unwrap();
        }
    }

    #[test]
    fn reconstruct_reads_status_and_exit_code_from_disk() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("meta.json"),
            r#"{"command":["/bin/sh","-c","true"],"name":"recovered"}"#,
        )
        .unwrap();
        write_recording(dir.path(), &[Event::output(0.1, "hi"), Event::exit(0.2, 7)]);

        let session = Session::reconstruct("abc123", dir.path(), 999).unwrap();
        assert_eq!(session.status(), Status::Exited);
        assert_eq!(session.exit_code(), Some(7));
        assert_eq!(session.name.as_deref(), Some("recovered"));
        assert_eq!(session.command, vec!["/bin/sh", "-c", "true"]);

        let (events, ordinal) = session.read_backlog().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(ordinal, 2);
    }

    #[test]
    fn reconstructed_session_rejects_input_and_resize() {
        let dir = tempdir().unwrap();
        write_recording(dir.path(), &[Event::exit(0.1, 0)]);

        let session = Session::reconstruct("abc123", dir.path(), 999).unwrap();
        assert!(matches!(session.send_input("hi"), Err(AppError::ProcessGone)));
        assert!(matches!(session.resize(100, 40), Err(AppError::NotRunning)));
    }

    #[test]
    fn reconstructed_session_can_still_be_cleaned_up() {
        let dir = tempdir().unwrap();
        write_recording(dir.path(), &[Event::exit(0.1, 0)]);

        let session = Session::reconstruct("abc123", dir.path(), 999).unwrap();
        session.cleanup().unwrap();
        assert_eq!(session.status(), Status::Cleaned);
        assert!(!dir.path().join("stream-out").exists());
    }
}
