//! The client-supplied shape of a session creation request (spec §3,
//! §4.7 `POST /api/sessions`).

use crate::config::{resolve_cwd, DEFAULT_TERM};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct CreateSessionSpec {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    /// A human-readable label, set only by the CLI surface (`--session-name`,
    /// spec §6); the HTTP API's `POST /api/sessions` has no such field.
    pub name: Option<String>,
}

impl CreateSessionSpec {
    /// Builds a spec from the raw HTTP request fields, applying the
    /// `cwd` resolution and `TERM` defaulting rules from spec §3. Fails
    /// with a client error if `command` is empty.
    pub fn new(
        command: Vec<String>,
        working_dir: Option<String>,
        term: Option<String>,
        default_term: &str,
    ) -> Result<Self, String> {
        if command.is_empty() {
            return Err("command must not be empty".to_string());
        }
        let mut env = HashMap::new();
        env.insert(
            "TERM".to_string(),
            term.unwrap_or_else(|| default_term.to_string()),
        );
        if env.get("TERM").map(String::as_str) == Some("") {
            env.insert("TERM".to_string(), DEFAULT_TERM.to_string());
        }
        Ok(Self {
            command,
            cwd: resolve_cwd(working_dir.as_deref()),
            env,
            cols: 80,
            rows: 24,
            name: None,
        })
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }
}
