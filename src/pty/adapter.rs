//! Platform PTY allocation, fork/exec, resize, and signal delivery
//! (spec §4.1, component C1).
//!
//! Built on `portable-pty`, with the master fd duplicated out to an owned
//! handle so it can be registered directly with the event loop (spec §4.2)
//! rather than living behind `portable-pty`'s own trait object for the
//! lifetime of the session.

use crate::error::ResourceError;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid as NixPid;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Grace period between SIGTERM and SIGKILL escalation (spec §4.1).
pub const KILL_GRACE: Duration = Duration::from_secs(1);

pub struct Spawned {
    pub master: PtyMaster,
    pub pid: i32,
    child: Box<dyn portable_pty::Child + Send + Sync>,
}

impl Spawned {
    /// Reaps the child if it has already exited, returning its exit code.
    /// Non-blocking: returns `Ok(None)` while the child is still alive.
    pub fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        match self.child.try_wait()? {
            Some(status) => Ok(Some(status.exit_code() as i32)),
            None => Ok(None),
        }
    }

    /// Blocks until the child exits, returning its exit code. Used only
    /// from the dedicated reaper path after EOF/HUP has already been
    /// observed on the master fd, so this does not stall the event loop.
    pub fn wait(&mut self) -> std::io::Result<i32> {
        let status = self.child.wait()?;
        Ok(status.exit_code() as i32)
    }
}

/// An owned duplicate of the PTY master fd, readable and writable
/// independently of `portable_pty`'s `Box<dyn MasterPty>`.
pub struct PtyMaster {
    fd: OwnedFd,
}

impl PtyMaster {
    fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Duplicates the underlying fd so reads (driven by the event loop
    /// worker) and writes (driven by HTTP input handlers) can proceed on
    /// independent descriptors without contending for a lock.
    pub fn try_clone(&self) -> std::io::Result<Self> {
        let dup = unsafe { libc::dup(self.fd.as_raw_fd()) };
        if dup < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(dup) } })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn set_nonblocking(&self) -> std::io::Result<()> {
        let fd = self.fd.as_raw_fd();
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        let mut file = self.as_file();
        let result = file.write_all(data);
        std::mem::forget(file); // fd is owned by `self.fd`, not the File
        result
    }

    /// Reads into `buf`, returning `Ok(0)` on a genuine EOF (child exited)
    /// and `Err(EWOULDBLOCK/EAGAIN)` when the caller should stop draining
    /// for this readiness event (spec §4.2: drain until `EAGAIN`).
    pub fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut file = self.as_file();
        let result = file.read(buf);
        std::mem::forget(file);
        result
    }

    fn as_file(&self) -> std::fs::File {
        // SAFETY: `fd` stays owned by `self.fd`; this temporary `File` is
        // forgotten by every caller above before it would drop and close
        // the descriptor.
        unsafe { std::fs::File::from_raw_fd(self.fd.as_raw_fd()) }
    }

    pub fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()> {
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Spawns `command` attached to a fresh PTY of the given size, with `env`
/// merged over the inherited environment and `cwd` as the working
/// directory (spec §4.1 `spawn` contract).
pub fn spawn(
    command: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
    cols: u16,
    rows: u16,
) -> Result<Spawned, ResourceError> {
    if command.is_empty() {
        return Err(ResourceError::Spawn("command must not be empty".into()));
    }
    if !cwd.is_dir() {
        return Err(ResourceError::Spawn(format!(
            "working directory does not exist: {}",
            cwd.display()
        )));
    }

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
        .map_err(|e| ResourceError::Spawn(format!("failed to allocate pty: {e}")))?;

    let mut cmd = CommandBuilder::new(&command[0]);
    cmd.args(&command[1..]);
    cmd.cwd(cwd);
    for (k, v) in env {
        cmd.env(k, v);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| ResourceError::Spawn(format!("failed to spawn command: {e}")))?;
    let pid = child
        .process_id()
        .ok_or_else(|| ResourceError::Spawn("spawned child has no pid".into()))?;

    // Slave is only needed by the child; drop our copy so EOF on the
    // master is observed once the child (and any of its own children
    // holding the slave open) exit.
    drop(pair.slave);

    let master_raw = pair
        .master
        .as_raw_fd()
        .ok_or_else(|| ResourceError::Spawn("pty master has no raw fd".into()))?;
    let dup_fd = unsafe { libc::dup(master_raw) };
    if dup_fd < 0 {
        return Err(ResourceError::Spawn(format!(
            "failed to duplicate pty master fd: {}",
            std::io::Error::last_os_error()
        )));
    }
    let owned = unsafe { OwnedFd::from_raw_fd(dup_fd) };
    drop(pair.master);

    let master = PtyMaster::from_owned(owned);
    master
        .set_nonblocking()
        .map_err(|e| ResourceError::Spawn(format!("failed to set non-blocking: {e}")))?;

    debug!(pid, cols, rows, "spawned pty child");
    Ok(Spawned { master, pid: pid as i32, child })
}

/// Reads from a raw fd the event loop reported readable without taking
/// ownership of it — used for the `stdin` FIFO, whose lifetime is tied to
/// the session directory rather than to any Rust value the event loop
/// worker holds (spec §4.2 dispatch).
pub fn read_raw(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    let result = file.read(buf);
    std::mem::forget(file);
    result
}

/// Signal-0 liveness probe (spec §4.1 `isAlive`).
pub fn is_alive(pid: i32) -> bool {
    match kill(NixPid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true, // e.g. EPERM: process exists, just not signalable by us
    }
}

/// Sends `SIGTERM`, then escalates to `SIGKILL` after [`KILL_GRACE`] if
/// the process is still alive (spec §4.1 `kill`). Does not wait
/// synchronously for the child to be reaped.
pub async fn kill_with_escalation(pid: i32) {
    let nix_pid = NixPid::from_raw(pid);
    if kill(nix_pid, Signal::SIGTERM).is_err() {
        trace!(pid, "SIGTERM delivery failed (process likely already gone)");
        return;
    }
    tokio::time::sleep(KILL_GRACE).await;
    if is_alive(pid) {
        warn!(pid, "process survived SIGTERM grace period, escalating to SIGKILL");
        let _ = kill(nix_pid, Signal::SIGKILL);
    }
}

/// Sends `SIGWINCH` to the foreground process group of the PTY, as
/// `resize` is required to (spec §4.1).
pub fn notify_winch(master: &PtyMaster) {
    let fd = master.raw_fd();
    let pgrp = unsafe { libc::tcgetpgrp(fd) };
    if pgrp > 0 {
        unsafe {
            libc::killpg(pgrp, libc::SIGWINCH);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn rejects_empty_command() {
        let err = spawn(&[], Path::new("/"), &HashMap::new(), 80, 24);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_missing_cwd() {
        let err = spawn(
            &["/bin/sh".to_string()],
            Path::new("/no/such/directory/at/all"),
            &HashMap::new(),
            80,
            24,
        );
        assert!(err.is_err());
    }

    #[test]
    fn spawn_echo_and_reap() {
        let mut spawned = spawn(
            &["/bin/sh".to_string(), "-c".to_string(), "exit 0".to_string()],
            Path::new("/"),
            &HashMap::new(),
            80,
            24,
        )
        .expect("spawn should succeed");
        let code = spawned.wait().expect("wait should succeed");
        assert_eq!(code, 0);
    }

    #[test]
    fn is_alive_false_after_exit() {
        let mut spawned = spawn(
            &["/bin/sh".to_string(), "-c".to_string(), "exit 0".to_string()],
            Path::new("/"),
            &HashMap::new(),
            80,
            24,
        )
        .unwrap();
        let pid = spawned.pid;
        spawned.wait().unwrap();
        // Allow the OS a brief moment to finish reaping bookkeeping.
        for _ in 0..20 {
            if !is_alive(pid) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!is_alive(pid));
    }
}
