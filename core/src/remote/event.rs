//! Messages sent to the orchestrator's event loop.
//!
//! The accept thread, every connection thread and every worker-process
//! thread only ever talk to the orchestrator through these events. The
//! orchestrator is the single consumer and the only owner of the cluster
//! map, the error log and the result destinations.

use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;

use super::connection::{ConnectionCommand, ResponsePayload};
use super::format::ErrorCode;
use super::process::ExitReport;


pub type ConnectionId = u64;

pub type EventSender = mpsc::Sender<CommanderEvent>;


#[derive(Debug)]
pub enum CommanderEvent {
    /// A worker connected. Sent by the accept thread before the connection's
    /// own thread starts, so it always precedes that connection's events.
    ConnectionCreated {
        id: ConnectionId,
        peer: SocketAddr,
        commands: mpsc::Sender<ConnectionCommand>,
        /// Second handle on the socket, used to cut a connection that is
        /// blocked on a silent peer.
        socket: TcpStream,
    },

    /// Handshake done or previous request answered; ready for the next one.
    AwaitingCommand { id: ConnectionId, hostname: String },

    Finished {
        id: ConnectionId,
        hostname: String,
        payload: ResponsePayload,
    },

    /// The worker answered with a non-zero error code. The connection stays
    /// usable.
    RemoteError {
        id: ConnectionId,
        hostname: String,
        code: ErrorCode,
        message: String,
    },

    /// Protocol violation, I/O failure or timeout. The connection is gone.
    ConnectionFailed {
        id: ConnectionId,
        hostname: Option<String>,
        error: String,
    },

    ProcessFinished {
        hostname: String,
        outcome: Result<ExitReport, String>,
    },

    ListenerFailed { error: String },
}
