//! Server-wide configuration assembled from CLI flags and environment
//! fallbacks, with `dirs::home_dir()` supplying the default control root.

use std::path::{Path, PathBuf};

/// Default terminal type sessions are given when the client does not
/// request one (spec §3: `env` MUST include `TERM`).
pub const DEFAULT_TERM: &str = "xterm-256color";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root directory under which every session's subdirectory lives.
    pub control_root: PathBuf,
    /// Default TERM for newly spawned sessions, overridable per-session.
    pub term: String,
    /// Directory of static assets to serve, if any (`--static-path`).
    pub static_path: Option<PathBuf>,
    /// Run `cleanup_exited()` once, shortly after startup.
    pub cleanup_on_startup: bool,
}

impl ServerConfig {
    pub fn new(control_root: Option<PathBuf>, term: Option<String>) -> Self {
        Self {
            control_root: control_root.unwrap_or_else(default_control_root),
            term: term.unwrap_or_else(|| DEFAULT_TERM.to_string()),
            static_path: None,
            cleanup_on_startup: true,
        }
    }

    pub fn with_static_path(mut self, path: Option<PathBuf>) -> Self {
        self.static_path = path;
        self
    }
}

/// `${HOME}/.vibetunnel/control`, falling back to the current directory
/// when `HOME` cannot be resolved (spec §6).
pub fn default_control_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vibetunnel")
        .join("control")
}

/// Expands a leading `~` the way a shell would; otherwise returns the path
/// untouched. Used for session `cwd` resolution (spec §3).
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Resolves a user-supplied working directory to an absolute path,
/// defaulting to the server's own working directory when none is given.
pub fn resolve_cwd(requested: Option<&str>) -> PathBuf {
    match requested {
        Some(p) => {
            let expanded = expand_tilde(p);
            if expanded.is_absolute() {
                expanded
            } else {
                std::env::current_dir()
                    .unwrap_or_else(|_| PathBuf::from("."))
                    .join(expanded)
            }
        }
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

pub fn session_dir(control_root: &Path, id: &str) -> PathBuf {
    control_root.join(id)
}
