//! Supervisor (spec §4.8, component C8): startup cleanup, periodic health
//! probing, exponential-backoff crash recovery, and graceful shutdown
//! sequencing.
//!
//! An `AtomicBool` shutdown flag is checked by every background task, a
//! tracked list of spawned tasks is awaited on shutdown, and a signal
//! handler flips the flag and lets tasks notice it on their next tick
//! rather than being torn down mid-operation.

use crate::eventloop::EventLoop;
use crate::registry::{Registry, SessionFd};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Interval between in-process health probes (spec §4.8: "every 10s").
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Consecutive failures before the server is declared crashed.
const FAILURE_THRESHOLD: u32 = 3;
/// Base of the exponential backoff between restart attempts.
const BACKOFF_BASE: Duration = Duration::from_secs(2);
/// Ceiling on the backoff delay.
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Window of stable operation after which the crash counter resets.
const STABLE_RESET_WINDOW: Duration = Duration::from_secs(5 * 60);
/// How long after startup to run the one-shot cleanup pass, letting the
/// registry's directory scan settle first (spec §4.8 "startup cleanup").
const STARTUP_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Whatever the health probe actually checks: that the event loop worker
/// is still alive and the registry is still reachable. Kept as a trait so
/// unit tests can substitute a probe that fails on demand (spec §9:
/// collapse dynamic dispatch over backends into one production impl plus
/// a test fake — the one place in this server where substituting the
/// production check for a test double is the cleanest way to exercise
/// the backoff math without actually crashing a thread).
pub trait HealthProbe: Send + Sync {
    fn probe(&self) -> Result<(), String>;
}

/// Production probe: the event loop is healthy as long as its worker
/// thread hasn't asked it to stop out from under us.
pub struct EventLoopProbe {
    event_loop: Arc<EventLoop<SessionFd>>,
}

impl EventLoopProbe {
    pub fn new(event_loop: Arc<EventLoop<SessionFd>>) -> Self {
        Self { event_loop }
    }
}

impl HealthProbe for EventLoopProbe {
    fn probe(&self) -> Result<(), String> {
        if self.event_loop.is_stopped() {
            Err("event loop worker has stopped".to_string())
        } else {
            Ok(())
        }
    }
}

struct RestartState {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// Owns the background health/restart loop and the shutdown flag every
/// other long-running task in the process checks.
pub struct Supervisor {
    started_at: Instant,
    shutdown: Arc<AtomicBool>,
    restart_count: AtomicU32,
    state: RwLock<RestartState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started_at: Instant::now(),
            shutdown: Arc::new(AtomicBool::new(false)),
            restart_count: AtomicU32::new(0),
            state: RwLock::new(RestartState { consecutive_failures: 0, last_failure: None }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Manual restart resets the crash counter (spec §4.8: "Manual
    /// restart zeroes the counter").
    pub async fn reset_crash_counter(&self) {
        self.restart_count.store(0, Ordering::SeqCst);
        let mut state = self.state.write().await;
        state.consecutive_failures = 0;
        state.last_failure = None;
    }

    /// Runs `registry.cleanup_exited()` once, after a short settle delay,
    /// if `enabled` (spec §4.8 "startup cleanup").
    pub async fn run_startup_cleanup(&self, registry: Arc<Registry>, enabled: bool) {
        if !enabled {
            return;
        }
        tokio::time::sleep(STARTUP_SETTLE_DELAY).await;
        let removed = registry.cleanup_exited();
        if !removed.is_empty() {
            info!(count = removed.len(), "cleaned up exited sessions on startup");
        }
    }

    /// Spawns the periodic health-probe task, which counts consecutive
    /// failures and, once [`FAILURE_THRESHOLD`] is reached, applies the
    /// exponential-backoff restart policy from spec §4.8. `on_crash` is
    /// invoked with the attempt number (starting at 1) to perform the
    /// actual restart action; this function only owns the timing.
    pub fn spawn_health_monitor<F, Fut>(self: &Arc<Self>, probe: Arc<dyn HealthProbe>, on_crash: F)
    where
        F: Fn(u32) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let supervisor = self.clone();
        let on_crash = Arc::new(on_crash);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            loop {
                interval.tick().await;
                if supervisor.is_shutting_down() {
                    break;
                }
                match probe.probe() {
                    Ok(()) => supervisor.record_success().await,
                    Err(reason) => {
                        let failures = supervisor.record_failure().await;
                        warn!(failures, %reason, "health probe failed");
                        if failures >= FAILURE_THRESHOLD {
                            let attempt = supervisor.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
                            let delay = backoff_delay(attempt);
                            error!(attempt, delay_secs = delay.as_secs(), "declaring crash, scheduling restart");
                            tokio::time::sleep(delay).await;
                            (on_crash)(attempt).await;
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn record_success(&self) {
        let mut state = self.state.write().await;
        let stable_long_enough = state
            .last_failure
            .map(|t| t.elapsed() >= STABLE_RESET_WINDOW)
            .unwrap_or(true);
        if stable_long_enough && state.consecutive_failures > 0 {
            info!("health probe stable, resetting crash counter");
            state.consecutive_failures = 0;
            self.restart_count.store(0, Ordering::SeqCst);
        }
    }

    async fn record_failure(&self) -> u32 {
        let mut state = self.state.write().await;
        state.consecutive_failures += 1;
        state.last_failure = Some(Instant::now());
        state.consecutive_failures
    }

    /// Registers a background task this supervisor did not itself spawn
    /// (e.g. the rate limiter's stale-bucket sweep) so it gets aborted
    /// alongside everything else on [`shutdown`](Self::shutdown).
    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Flips the shutdown flag and aborts every task spawned through this
    /// supervisor (spec §4.8 "graceful shutdown": cancel the event loop,
    /// close subscriber streams, flush writes, kill surviving children).
    /// The event loop and session children are handled by the caller,
    /// which holds the registry; this only tears down supervisor-owned
    /// background work.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let tasks = self.tasks.lock();
        for task in tasks.iter() {
            task.abort();
        }
    }
}

/// `base * 2^(attempt - 1)`, capped, per spec §4.8: "base 2s, cap 60s,
/// doubled per failure within a 5-minute window".
fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let scaled = BACKOFF_BASE.saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX));
    scaled.min(BACKOFF_CAP)
}

/// Kills every still-running session's child during graceful shutdown,
/// via SIGTERM-then-escalation (spec §4.8).
pub async fn kill_all_sessions(registry: &Registry) {
    for session in registry.list() {
        if session.status() == crate::session::Status::Running {
            session.kill().await;
        }
    }
}

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(10), Duration::from_secs(60));
    }

    struct FlakyProbe {
        fail_next: StdMutex<u32>,
    }

    impl HealthProbe for FlakyProbe {
        fn probe(&self) -> Result<(), String> {
            let mut remaining = self.fail_next.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                Err("simulated failure".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn manual_reset_zeroes_the_counter() {
        let supervisor = Supervisor::new();
        supervisor.record_failure().await;
        supervisor.record_failure().await;
        supervisor.restart_count.store(5, Ordering::SeqCst);
        supervisor.reset_crash_counter().await;
        assert_eq!(supervisor.restart_count.load(Ordering::SeqCst), 0);
        let state = supervisor.state.read().await;
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn flaky_probe_fails_then_recovers() {
        let probe = FlakyProbe { fail_next: StdMutex::new(2) };
        assert!(probe.probe().is_err());
        assert!(probe.probe().is_err());
        assert!(probe.probe().is_ok());
    }
}
