//! Coordinator/worker networking and the orchestrator built on it.
//!
//! - `format`: fixed little-endian blocks of the private TCP protocol
//! - `connection` / `client`: the two protocol endpoints
//! - `server`: listener accepting worker connections
//! - `process`: supervision of the remote worker processes
//! - `timerange`: global channel grid assembled from per-node rows
//! - `commander`: task queue and event loop tying everything together

pub mod client;
pub mod commander;
pub mod connection;
pub mod event;
pub mod format;
pub mod process;
pub mod server;
pub mod timerange;

pub use client::Client;
pub use commander::{ProcessCommander, Task};
pub use connection::{ConnectionSettings, Request, ResponsePayload, ServerConnection};
pub use event::CommanderEvent;
pub use format::{ErrorCode, RequestType, WireError, DEFAULT_PORT, PROTOCOL_VERSION};
pub use process::{CoordinatorAddress, ExitReport, RemoteProcess, SshLauncher, WorkerLauncher};
pub use server::Server;
pub use timerange::{GridError, ObservationTimerange};
