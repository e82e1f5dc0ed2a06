//! Public interface to the replog core library, linked by the server, client,
//! and manager executables.

#[macro_use]
mod utils;

mod client;
mod cluster;
mod protocol;
mod server;

// Helper utilities, functions, and macros
pub use utils::{logger_init, me_init, Bitmap, ReplogError, ME};

// Cluster configuration
pub use cluster::ClusterConfig;

// Server-side plumbing
pub use server::{
    logs_agree, read_lines, CommitLog, ReplicaId, Target, Transport,
    TransportHub,
};

// Replication protocol
pub use protocol::{
    ClientRequest, Envelope, LeaderStatus, LogReplica, PledgedEntry,
    ReplicaStats, SeqNum, SlotValue, ViewNum,
};

// Client-side endpoint
pub use client::{ClientEndpoint, ClientId, ClientSeq};
