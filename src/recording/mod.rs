//! The asciicast v2 recording format and its on-disk append-only store
//! (spec §4.3, component C3).

pub mod format;
pub mod store;

pub use format::{Event, EventKind, Header};
pub use store::{read_events, read_header, RecordingWriter, Tail};
