//! Stream Multiplexer (spec §4.6, component C6): fans a single session's
//! recording out to any number of concurrent SSE subscribers, each
//! rewritten onto its own clock.
//!
//! A fresh subscriber sees the whole backlog with every event's `t`
//! rewritten to `0`, then the live feed with `t` rewritten relative to its
//! own connect time — matching what a terminal replaying the recording
//! from scratch would show, not the absolute wall-clock the writer used.

use crate::recording::EventKind;
use crate::session::Session;
use async_stream::stream;
use futures::Stream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::warn;

/// Heartbeat cadence for subscribers during quiet periods, so a
/// reverse proxy or browser doesn't time the connection out (spec §4.6).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A single SSE payload line. The HTTP layer wraps these in
/// `axum::response::sse::Event`; kept independent of axum here so the
/// multiplexer can be exercised without spinning up a server.
#[derive(Debug, Clone)]
pub enum Frame {
    Header(String),
    Event(String),
    Heartbeat,
}

/// Subscribes to `session`, yielding its whole backlog (rewritten to
/// `t=0`) followed by every subsequent live event (rewritten to
/// `now - connect_time`), terminating after an `exit` event or when the
/// session's bus closes.
///
/// Subscribing to the live bus before reading the backlog, then
/// discarding any live message whose ordinal was already covered by the
/// backlog read, closes the classic snapshot-then-subscribe race without
/// ever dropping or duplicating an event.
pub fn subscribe(session: Arc<Session>) -> anyhow::Result<impl Stream<Item = Frame>> {
    let mut bus = session.subscribe_bus();
    let header = session.current_header()?;
    let (backlog, next_ordinal) = session.read_backlog()?;
    let connect_time = Instant::now();

    Ok(stream! {
        yield Frame::Header(serde_json::to_string(&header).unwrap_or_default());
        for event in backlog {
            let is_exit = event.kind == EventKind::Exit;
            yield Frame::Event(event.with_time(0.0).to_line());
            if is_exit {
                // A subscriber connecting after the session already exited
                // finds the terminal event already in its backlog read; the
                // live bus below will never deliver anything further for it.
                return;
            }
        }

        loop {
            tokio::select! {
                biased;
                recv = bus.recv() => {
                    match recv {
                        Ok((ordinal, event)) => {
                            if ordinal <= next_ordinal {
                                continue; // already covered by the backlog read above
                            }
                            let rewritten = event.with_time(connect_time.elapsed().as_secs_f64());
                            let is_exit = rewritten.kind == EventKind::Exit;
                            yield Frame::Event(rewritten.to_line());
                            if is_exit {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(session_id = %session.id, skipped, "subscriber fell behind, disconnecting");
                            return;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    yield Frame::Heartbeat;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CreateSessionSpec;
    use futures::StreamExt;
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

    #[tokio::test]
    async fn backlog_then_exit_terminates_stream() {
        let dir = tempdir().unwrap();
        let (session, _master_fd, _stdin_fd) = Session::create(
            dir.path(),
            spec(&["/bin/sh", "-c", "echo hi; exit 3"]),
            "xterm-256color",
        )
        .unwrap();

        let mut stream = Box::pin(subscribe(session.clone()).unwrap());
        assert!(matches!(stream.next().await, Some(Frame::Header(_))));

        // Give the shell time to run and the event loop a manual nudge,
        // since no worker thread is running in this unit test.
        for _ in 0..50 {
            if session.status() != crate::session::Status::Running {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
            session.on_master_readable();
        }
        session.on_master_readable();

        let mut saw_exit = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), stream.next()).await {
                Ok(Some(Frame::Event(line))) if line.contains("\"exit\"") => {
                    saw_exit = true;
                    break;
                }
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        assert!(saw_exit, "stream should terminate with an exit event");
    }
}
