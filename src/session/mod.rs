//! The Session object and its creation request shape (spec §4.4,
//! component C4).

pub mod session;
pub mod spec;

pub use session::{BusMessage, FdRole, Session, Status, OUTPUT_CHUNK_BOUND};
pub use spec::CreateSessionSpec;
