//! Session server: exposes local PTY-backed shells over HTTP/SSE.
//!
//! Module layout mirrors the components of the system this crate
//! implements (PTY adapter, event loop, recording store, session,
//! registry, stream multiplexer, HTTP/SSE surface, supervisor, tunnel
//! launcher); see `SPEC_FULL.md` §D for the component-to-module map.

pub mod config;
pub mod error;
pub mod eventloop;
pub mod http;
pub mod multiplexer;
pub mod pty;
pub mod recording;
pub mod registry;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod tunnel;

pub use config::ServerConfig;
pub use error::AppError;
pub use registry::Registry;
