//! Replog's client functionality modules.

mod endpoint;

pub use endpoint::{ClientEndpoint, ClientId, ClientSeq};
