//! Append-only per-session recording store.
//!
//! The owning [`Session`](crate::session::Session) is the sole writer; any
//! number of readers may tail the same file concurrently (spec §4.3). Each
//! write is a single `write_all` of one complete line so that readers never
//! observe a partial record — the OS does not guarantee atomic appends
//! across processes, but since there is exactly one writer here, buffering
//! a full line before the syscall is enough.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;

use super::format::{Event, Header};

/// Owns the writer end of a session's `stream-out` file.
pub struct RecordingWriter {
    file: std::fs::File,
    path: PathBuf,
    started_at: Instant,
}

impl RecordingWriter {
    /// Creates the recording file and writes the header line. Fails (and
    /// leaves no file behind beyond what `create` itself made) if the
    /// directory cannot be written to.
    pub fn create(path: impl AsRef<Path>, header: &Header) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut line = serde_json::to_string(header).expect("header always serializes");
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(Self { file, path, started_at: Instant::now() })
    }

    /// Reopens an existing recording for append, without touching its
    /// header or prior events. Used when a session object is reconstructed
    /// for a directory that already has a complete recording on disk (spec
    /// §4.5 startup recovery) — `elapsed()` restarts from this reopen, but
    /// a reconstructed session's status is always terminal, so nothing
    /// ever calls `append` on it again in practice.
    pub fn open_for_append(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new().append(true).open(&path)?;
        Ok(Self { file, path, started_at: Instant::now() })
    }

    /// Seconds elapsed since this writer was created; monotonic by
    /// construction (spec §4.3: `t` is monotonic non-decreasing).
    pub fn elapsed(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn append(&mut self, event: &Event) -> std::io::Result<()> {
        let mut line = event.to_line();
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads the header line and, on success, the byte offset immediately
/// after it (the canonical start offset for a fresh subscriber's backlog
/// scan).
pub fn read_header(path: &Path) -> anyhow::Result<(Header, u64)> {
    let content = std::fs::read_to_string(path)?;
    let newline = content
        .find('\n')
        .ok_or_else(|| anyhow::anyhow!("recording file has no header line"))?;
    let header: Header = serde_json::from_str(&content[..newline])?;
    Ok((header, (newline + 1) as u64))
}

/// Reads every event after the header, in order. Used for `snapshot()`
/// and for a subscriber's backlog delivery.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<Event>> {
    let content = std::fs::read_to_string(path)?;
    let mut lines = content.lines();
    lines.next(); // header
    let mut events = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        events.push(Event::parse_line(line)?);
    }
    Ok(events)
}

/// A cursor that tails a recording file, blocking (via a file-system
/// watch rather than a polling timer, per the design notes) when it
/// catches up to the writer instead of returning EOF.
pub struct Tail {
    file: tokio::fs::File,
    buf: BufReader<tokio::fs::File>,
    _watcher: RecommendedWatcher,
    changed: mpsc::Receiver<()>,
}

impl Tail {
    pub async fn open(path: &Path, from_offset: u64) -> anyhow::Result<Self> {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(from_offset)).await?;
        let buf = BufReader::new(file.try_clone().await?);

        let (tx, rx) = mpsc::channel(16);
        let (std_tx, std_rx) = std_mpsc::channel::<notify::Result<notify::Event>>();
        let mut watcher = notify::recommended_watcher(std_tx)?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;

        // Bridge notify's synchronous callback thread into the async
        // world with a small pump task; we only care that *something*
        // changed, not what.
        tokio::task::spawn_blocking(move || {
            while let Ok(event) = std_rx.recv() {
                if event.is_ok() && tx.blocking_send(()).is_err() {
                    break;
                }
            }
        });

        Ok(Self { file, buf, _watcher: watcher, changed: rx })
    }

    /// Returns the next complete line, blocking until the writer appends
    /// one (or the tail is dropped/cancelled by the caller). Tolerates a
    /// multi-byte UTF-8 sequence or JSON line arriving across several
    /// writer flushes by buffering until a newline is seen.
    pub async fn next_line(&mut self) -> anyhow::Result<String> {
        let mut line = String::new();
        loop {
            let n = self.buf.read_line(&mut line).await?;
            if n > 0 && line.ends_with('\n') {
                line.pop();
                return Ok(line);
            }
            // Partial line (writer mid-append) or genuine EOF: wait for
            // the file to grow before retrying the read from where we
            // left off.
            if self.changed.recv().await.is_none() {
                anyhow::bail!("recording file watch closed unexpectedly");
            }
        }
    }

    #[allow(dead_code)]
    pub async fn current_offset(&mut self) -> std::io::Result<u64> {
        self.file.stream_position().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::format::Header;
    use tempfile::tempdir;

    #[test]
    fn writer_creates_header_then_events() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stream-out");
        let header = Header::new(80, 24);
        let mut writer = RecordingWriter::create(&path, &header).unwrap();
        writer.append(&Event::output(0.1, "hi")).unwrap();
        writer.append(&Event::exit(0.2, 0)).unwrap();

        let (read_header_back, _offset) = read_header(&path).unwrap();
        assert_eq!(read_header_back, header);

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data, "0");
    }

    #[tokio::test]
    async fn tail_yields_backlog_then_blocks_for_new_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stream-out");
        let header = Header::new(80, 24);
        let mut writer = RecordingWriter::create(&path, &header).unwrap();
        writer.append(&Event::output(0.0, "a")).unwrap();

        let (_, offset) = read_header(&path).unwrap();
        let mut tail = Tail::open(&path, offset).await.unwrap();
        let first = tail.next_line().await.unwrap();
        assert!(first.contains("\"a\""));

        writer.append(&Event::output(0.1, "b")).unwrap();
        let second = tokio::time::timeout(std::time::Duration::from_secs(5), tail.next_line())
            .await
            .expect("tail should observe the new write")
            .unwrap();
        assert!(second.contains("\"b\""));
    }
}
