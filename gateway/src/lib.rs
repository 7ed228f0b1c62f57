#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]

//! hostlink library — the gateway side of the remote host execution core.
//!
//! - `registry` — persisted host configurations (`hosts.json`)
//! - `remote` — SSH tunnel, agent bootstrap, wire client, host pool
//! - `backend` — local/remote execution backends and the router
//! - `compare` — cross-backend file and directory comparison
//! - `protocol` — wire frames shared with the on-host agent
//! - `error` — typed error codes surfaced to callers

pub mod backend;
pub mod compare;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod remote;

pub use backend::{BackendRouter, ExecutionBackend};
pub use error::HostError;
pub use registry::{ActiveSession, HostConfig, HostRegistry};
pub use remote::{ConnectOutcome, HostManager, RemoteHost};
