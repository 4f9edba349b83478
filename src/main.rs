//! CLI entry point (spec §6): dispatches either to the HTTP server
//! (`--serve`) or to one of the direct session operations, matching the
//! teacher's practice of deciding the mode first and initializing
//! `tracing` once, rather than per-subcommand.
//!
//! The surface is flag-based, not subcommand-based — spec §6 names flags
//! directly (`--list-sessions`, `--session-name ... -- ...`, `--session
//! <id> --send-text/--send-key/--cleanup`), so `Cli` stays one flat
//! `clap::Parser` struct.

use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ttysrv::config::{session_dir, ServerConfig};
use ttysrv::eventloop::EventLoop;
use ttysrv::registry::{self, Registry};
use ttysrv::session::{CreateSessionSpec, Status};

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_BAD_ARGS: u8 = 2;
const EXIT_KILLED: u8 = 9;

#[derive(Parser)]
#[command(name = "ttysrv")]
#[command(about = "Exposes local PTY-backed shells over HTTP/SSE")]
struct Cli {
    /// Control root directory (spec §6, default `${HOME}/.vibetunnel/control`).
    #[arg(long = "control-path", env = "VT_CONTROL_DIR")]
    control_path: Option<PathBuf>,

    /// TERM for newly spawned sessions.
    #[arg(long = "term")]
    term: Option<String>,

    /// Print a JSON map of every known session and exit.
    #[arg(long = "list-sessions")]
    list_sessions: bool,

    /// Spawn a session with this label, then drive it until it exits
    /// (the command itself follows `--`).
    #[arg(long = "session-name")]
    session_name: Option<String>,

    /// Target an existing session for `--send-text`/`--send-key`/`--cleanup`.
    #[arg(long = "session")]
    session: Option<String>,

    /// Write this text verbatim to the targeted session's stdin.
    #[arg(long = "send-text")]
    send_text: Option<String>,

    /// Translate this named key and write it to the targeted session's stdin.
    #[arg(long = "send-key")]
    send_key: Option<String>,

    /// With `--session`, remove that session's directory; alone, remove
    /// every exited session.
    #[arg(long = "cleanup")]
    cleanup: bool,

    /// Run the HTTP server on this port.
    #[arg(long = "serve", env = "VT_PORT")]
    serve: Option<u16>,

    /// Host to bind the HTTP server to.
    #[arg(long = "host", default_value = "127.0.0.1")]
    host: String,

    /// Serve static assets from this directory alongside the API.
    #[arg(long = "static-path")]
    static_path: Option<PathBuf>,

    /// The command to spawn, given after `--` with `--session-name`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn build_config(cli: &Cli) -> ServerConfig {
    ServerConfig::new(cli.control_path.clone(), cli.term.clone())
        .with_static_path(cli.static_path.clone())
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Directs logging to a non-rotating file under `<control-root>/../logs/`
/// rather than stdout, mirroring the teacher's own `init_daemon_logging`
/// for its background daemon process. The returned guard must be held
/// for the life of the process — dropping it stops the non-blocking
/// writer from flushing.
fn init_server_logging(control_root: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    let logs_dir = control_root.parent().unwrap_or(control_root).join("logs");
    let _ = std::fs::create_dir_all(&logs_dir);
    let file_appender = tracing_appender::rolling::never(&logs_dir, "server.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    guard
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(port) = cli.serve {
        let config = build_config(&cli);
        let _logging_guard = init_server_logging(&config.control_root);
        let runtime = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(e) => {
                eprintln!("failed to start async runtime: {e}");
                return ExitCode::from(EXIT_FAILURE);
            }
        };
        return match runtime.block_on(ttysrv::server::run(config, port, &cli.host)) {
            Ok(()) => ExitCode::from(EXIT_SUCCESS),
            Err(e) => {
                eprintln!("server error: {e:#}");
                ExitCode::from(EXIT_FAILURE)
            }
        };
    }

    init_logging();
    let config = build_config(&cli);

    if cli.list_sessions {
        return run_list_sessions(&config);
    }

    if let Some(name) = cli.session_name.clone() {
        return run_spawn_and_drive(&config, name, cli.command.clone());
    }

    if let Some(id) = cli.session.clone() {
        return run_session_operation(&config, &id, cli.send_text.clone(), cli.send_key.clone(), cli.cleanup);
    }

    if cli.cleanup {
        return run_global_cleanup(&config);
    }

    eprintln!("no operation specified; see --help");
    ExitCode::from(EXIT_BAD_ARGS)
}

fn run_list_sessions(config: &ServerConfig) -> ExitCode {
    let sessions = registry::scan_sessions(&config.control_root);
    match serde_json::to_string_pretty(&sessions) {
        Ok(json) => {
            println!("{json}");
            ExitCode::from(EXIT_SUCCESS)
        }
        Err(e) => {
            eprintln!("failed to serialize session list: {e}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

static KILLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_term_signal(_: i32) {
    KILLED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    // SAFETY: the handler only stores to an atomic, the one signal-safe
    // operation this process needs while driving a single session.
    unsafe {
        let _ = signal(Signal::SIGTERM, SigHandler::Handler(on_term_signal));
        let _ = signal(Signal::SIGINT, SigHandler::Handler(on_term_signal));
    }
}

/// Spawns a session and blocks draining its PTY until the child exits or
/// this process is itself killed (spec §6 `--session-name`): this
/// invocation is, for the life of the session, its own single-session
/// event-loop driver, so the child's PTY output buffer never fills for
/// lack of a reader.
fn run_spawn_and_drive(config: &ServerConfig, name: String, command: Vec<String>) -> ExitCode {
    if command.is_empty() {
        eprintln!("--session-name requires a command after `--`");
        return ExitCode::from(EXIT_BAD_ARGS);
    }
    if let Err(e) = std::fs::create_dir_all(&config.control_root) {
        eprintln!("failed to create control root {}: {e}", config.control_root.display());
        return ExitCode::from(EXIT_FAILURE);
    }

    let spec = match CreateSessionSpec::new(command, None, None, &config.term) {
        Ok(s) => s.with_name(Some(name)),
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_BAD_ARGS);
        }
    };

    let event_loop = match EventLoop::new() {
        Ok(e) => Arc::new(e),
        Err(e) => {
            eprintln!("failed to initialize event loop: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let registry = Arc::new(Registry::new(config.clone(), event_loop.clone()));
    let session = match registry.create(spec) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    println!("{}", session.id);
    let _ = std::io::stdout().flush();

    install_signal_handlers();

    let worker_registry = registry.clone();
    let worker = std::thread::Builder::new()
        .name("pty-event-loop".to_string())
        .spawn(move || worker_registry.run_event_loop())
        .expect("failed to spawn event loop worker thread");

    loop {
        if KILLED.load(Ordering::SeqCst) {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(session.pid()),
                nix::sys::signal::Signal::SIGTERM,
            );
            event_loop.stop();
            let _ = worker.join();
            return ExitCode::from(EXIT_KILLED);
        }
        if session.status() != Status::Running {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    event_loop.stop();
    let _ = worker.join();
    ExitCode::from(EXIT_SUCCESS)
}

fn run_session_operation(
    config: &ServerConfig,
    id: &str,
    send_text: Option<String>,
    send_key: Option<String>,
    cleanup: bool,
) -> ExitCode {
    let operations = send_text.is_some() as u8 + send_key.is_some() as u8 + cleanup as u8;
    if operations != 1 {
        eprintln!("--session requires exactly one of --send-text, --send-key, or --cleanup");
        return ExitCode::from(EXIT_BAD_ARGS);
    }

    if cleanup {
        return run_single_cleanup(config, id);
    }

    let payload = send_text.or(send_key).expect("exactly one was Some, checked above");
    let stdin_path = session_dir(&config.control_root, id).join("stdin");
    let bytes = ttysrv::pty::resolve_input(&payload);
    match std::fs::OpenOptions::new().write(true).open(&stdin_path) {
        Ok(mut file) => match file.write_all(&bytes) {
            Ok(()) => ExitCode::from(EXIT_SUCCESS),
            Err(e) => {
                eprintln!("failed to write to {}: {e}", stdin_path.display());
                ExitCode::from(EXIT_FAILURE)
            }
        },
        Err(e) => {
            eprintln!("failed to open {}: {e}", stdin_path.display());
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn run_single_cleanup(config: &ServerConfig, id: &str) -> ExitCode {
    let dir = session_dir(&config.control_root, id);
    if !dir.is_dir() {
        eprintln!("session not found: {id}");
        return ExitCode::from(EXIT_FAILURE);
    }
    if let Some(pid) = read_meta_pid(&dir) {
        if ttysrv::pty::is_alive(pid) {
            eprintln!("session must be exited before cleanup");
            return ExitCode::from(EXIT_FAILURE);
        }
    }
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            eprintln!("failed to remove {}: {e}", dir.display());
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn read_meta_pid(dir: &std::path::Path) -> Option<i32> {
    #[derive(serde::Deserialize)]
    struct Meta {
        pid: i32,
    }
    std::fs::read_to_string(dir.join("meta.json"))
        .ok()
        .and_then(|s| serde_json::from_str::<Meta>(&s).ok())
        .map(|m| m.pid)
}

fn run_global_cleanup(config: &ServerConfig) -> ExitCode {
    let event_loop = match EventLoop::new() {
        Ok(e) => Arc::new(e),
        Err(e) => {
            eprintln!("failed to initialize event loop: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let registry = Registry::new(config.clone(), event_loop);
    registry.recover_on_startup();
    let removed = registry.cleanup_exited();
    println!("cleaned up {} session(s)", removed.len());
    ExitCode::from(EXIT_SUCCESS)
}
