//! The PTY adapter (spec §4.1, component C1): platform allocation of a
//! PTY pair, fork/exec of a child, resize, signal delivery, liveness.

pub mod adapter;
pub mod keys;

pub use adapter::{is_alive, kill_with_escalation, notify_winch, read_raw, spawn, PtyMaster, Spawned};
pub use keys::resolve_input;
