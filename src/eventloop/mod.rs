//! Readiness multiplexing across PTY master fds (spec §4.2, component
//! C2): edge-triggered on Linux (epoll) and kqueue on BSD/Darwin, both
//! selected transparently by `mio`, the crate the corpus reaches for
//! whenever raw fd readiness needs a cross-platform backend.
//!
//! One [`EventLoop`] is owned by a single worker, which is the only
//! caller of [`EventLoop::run`]/[`run_once`]; `add`/`modify`/`remove` are
//! safe to call concurrently from other workers because the fd→opaque
//! map is guarded by a mutex (spec §5).

use bitflags::bitflags;
use mio::unix::SourceFd;
use mio::{Events, Interest as MioInterest, Poll, Token};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

bitflags! {
    /// Composable event kinds (spec §4.2).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READ  = 0b0001;
        const WRITE = 0b0010;
        const ERROR = 0b0100;
        const HUP   = 0b1000;
    }
}

/// A single dispatch's readiness for one fd.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hup: bool,
}

/// The maximum time a single `poll(2)`/`kevent(2)` wait may block, chosen
/// so that `stop()` is observed within roughly one tick (spec §4.2: the
/// bound must be ≤100ms).
const MAX_WAIT: Duration = Duration::from_millis(100);

fn to_mio_interest(interest: Interest) -> MioInterest {
    let readable = interest.contains(Interest::READ);
    let writable = interest.contains(Interest::WRITE);
    match (readable, writable) {
        (true, true) => MioInterest::READABLE | MioInterest::WRITABLE,
        (true, false) => MioInterest::READABLE,
        (false, true) => MioInterest::WRITABLE,
        (false, false) => MioInterest::READABLE,
    }
}

/// A single-threaded readiness loop over an arbitrary set of raw fds,
/// generic over the opaque value associated with each registration (the
/// session or subscriber the fd belongs to).
pub struct EventLoop<T: Clone + Send + 'static> {
    poll: Mutex<Poll>,
    entries: Mutex<HashMap<RawFd, (Interest, T)>>,
    stop: Arc<AtomicBool>,
}

impl<T: Clone + Send + 'static> EventLoop<T> {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            poll: Mutex::new(Poll::new()?),
            entries: Mutex::new(HashMap::new()),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Registers `fd` for the given interest set, setting it non-blocking
    /// is the caller's responsibility (the PTY adapter already does this
    /// for master fds).
    pub fn add(&self, fd: RawFd, interest: Interest, opaque: T) -> std::io::Result<()> {
        self.poll
            .lock()
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), to_mio_interest(interest))?;
        self.entries.lock().insert(fd, (interest, opaque));
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> std::io::Result<()> {
        self.poll
            .lock()
            .registry()
            .reregister(&mut SourceFd(&fd), Token(fd as usize), to_mio_interest(interest))?;
        if let Some(entry) = self.entries.lock().get_mut(&fd) {
            entry.0 = interest;
        }
        Ok(())
    }

    pub fn remove(&self, fd: RawFd) -> std::io::Result<()> {
        // Deregistering an fd that was already closed is a normal race
        // with the reaper path (session exit), not an error worth
        // surfacing to the caller.
        let _ = self.poll.lock().registry().deregister(&mut SourceFd(&fd));
        self.entries.lock().remove(&fd);
        Ok(())
    }

    /// Requests that [`run`](Self::run) return after its current wait.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// One poll-wait-and-dispatch pass. In edge-triggered mode the
    /// `handler` must drain each readable fd until `EAGAIN` itself —
    /// this loop only delivers the readiness notification once per
    /// transition.
    pub fn run_once(
        &self,
        timeout: Duration,
        mut handler: impl FnMut(Readiness, &T),
    ) -> std::io::Result<()> {
        let mut events = Events::with_capacity(128);
        let wait = timeout.min(MAX_WAIT);
        loop {
            let mut poll = self.poll.lock();
            match poll.poll(&mut events, Some(wait)) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue, // EINTR retried
                Err(e) => return Err(e),
            }
        }
        for event in events.iter() {
            let fd = event.token().0 as RawFd;
            let opaque = { self.entries.lock().get(&fd).map(|(_, o)| o.clone()) };
            if let Some(opaque) = opaque {
                let readiness = Readiness {
                    fd,
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    error: event.is_error(),
                    hup: event.is_read_closed() || event.is_write_closed(),
                };
                handler(readiness, &opaque);
            }
        }
        Ok(())
    }

    /// Runs until [`stop`](Self::stop) is called from another worker.
    pub fn run(&self, mut handler: impl FnMut(Readiness, &T)) -> std::io::Result<()> {
        while !self.is_stopped() {
            self.run_once(MAX_WAIT, &mut handler)?;
        }
        Ok(())
    }

    pub fn close(self) {
        // Dropping `poll` closes the underlying epoll/kqueue fd.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn delivers_readable_event_for_a_pipe() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let loop_ = EventLoop::<i32>::new().unwrap();
        loop_.add(b.as_raw_fd(), Interest::READ, 42).unwrap();

        a.write_all(b"hi").unwrap();

        let mut saw = false;
        loop_
            .run_once(Duration::from_millis(500), |readiness, opaque| {
                if readiness.readable && *opaque == 42 {
                    saw = true;
                }
            })
            .unwrap();
        assert!(saw);

        let mut buf = [0u8; 2];
        let mut bs = b;
        bs.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn remove_then_no_more_events() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let loop_ = EventLoop::<i32>::new().unwrap();
        loop_.add(b.as_raw_fd(), Interest::READ, 1).unwrap();
        loop_.remove(b.as_raw_fd()).unwrap();

        a.write_all(b"x").unwrap();

        let mut saw = false;
        loop_
            .run_once(Duration::from_millis(200), |_, _| saw = true)
            .unwrap();
        assert!(!saw);
    }
}
