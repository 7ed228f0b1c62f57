//! Remote host plumbing: SSH tunnel, agent bootstrap, wire client, host
//! connection, and the connection pool.

pub mod bootstrap;
pub mod host;
pub mod manager;
pub mod ssh;
pub mod tunnel;
pub mod wire;

pub use host::{RemoteHost, DEFAULT_RPC_TIMEOUT};
pub use manager::{ConnectOutcome, HostManager};
