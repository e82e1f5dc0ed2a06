//! Replog's server-side plumbing modules.

mod heartbeat;
mod storage;
mod transport;

/// Server replica ID type.
pub type ReplicaId = u8;

pub use storage::{logs_agree, read_lines, CommitLog};
pub use transport::{Target, Transport, TransportHub};

pub(crate) use heartbeat::{HeartbeatEvent, Heartbeater};
