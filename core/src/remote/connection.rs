//! Coordinator side of one worker connection.
//!
//! A `ServerConnection` performs the handshake and then runs strictly
//! request-then-response: one request is written, its response header and
//! body are read, and only then is the next request accepted. Each
//! connection runs on its own thread (`serve`) and reports to the
//! orchestrator through `CommanderEvent`s.

use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use super::event::{CommanderEvent, ConnectionId};
use super::format::{
    read_payload, write_request, ErrorCode, InitialBlock, InitialResponse, ReadRowsOptions,
    RequestType, ResponseHeader, StandardOptions, WireError, WriteRowsOptions,
    CORRECT_HISTOGRAMS_FLAG, PROTOCOL_VERSION,
};
use crate::payload::{self, AntennaInfo, BandInfo, QualityTables, RowData};


// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ReadQualityTables { path: String, correct_histograms: bool },
    ReadAntennaTables { path: String },
    ReadBandTable { path: String },
    ReadDataRows { path: String, start_row: u64, row_count: u64 },
    WriteDataRows { path: String, start_row: u64, rows: Vec<RowData> },
}

impl Request {
    pub fn path(&self) -> &str {
        match self {
            Request::ReadQualityTables { path, .. }
            | Request::ReadAntennaTables { path }
            | Request::ReadBandTable { path }
            | Request::ReadDataRows { path, .. }
            | Request::WriteDataRows { path, .. } => path,
        }
    }
}

/// Decoded body of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    QualityTables(QualityTables),
    Antennas(Vec<AntennaInfo>),
    Band(BandInfo),
    Rows(Vec<RowData>),
    Written,
}

/// What the orchestrator can tell a connection thread to do.
#[derive(Debug)]
pub enum ConnectionCommand {
    Execute(Request),
    Stop,
}

/// Result of one request that reached the worker. Transport failures are
/// the `Err` side of the surrounding `Result` instead.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome<T> {
    Finished(T),
    RemoteError { code: ErrorCode, message: String },
}

impl<T> RequestOutcome<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> RequestOutcome<U> {
        match self {
            RequestOutcome::Finished(v) => RequestOutcome::Finished(f(v)),
            RequestOutcome::RemoteError { code, message } => RequestOutcome::RemoteError { code, message },
        }
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    AwaitingCommand,
    AwaitingResponseHeader,
    AwaitingResponseBody,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub handshake_timeout: Duration,
    /// Deadline for each response, header and body alike.
    pub request_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            handshake_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(600),
        }
    }
}

/// Zero means no deadline; `set_read_timeout` rejects a zero duration.
fn deadline(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}


// ---------------------------------------------------------------------------
// ServerConnection
// ---------------------------------------------------------------------------

pub struct ServerConnection {
    id: ConnectionId,
    stream: TcpStream,
    state: ConnectionState,
    hostname: Option<String>,
    settings: ConnectionSettings,
}

impl ServerConnection {
    pub fn new(id: ConnectionId, stream: TcpStream, settings: ConnectionSettings) -> ServerConnection {
        ServerConnection {
            id,
            stream,
            state: ConnectionState::Connecting,
            hostname: None,
            settings,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Host name the worker announced during the handshake.
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Send `Initial`, read the worker's `InitialResponse` and host name.
    pub fn start(&mut self) -> Result<String, WireError> {
        self.state = ConnectionState::Handshaking;
        let _ = self.stream.set_nodelay(true);
        self.stream.set_read_timeout(deadline(self.settings.handshake_timeout))?;
        InitialBlock::new().write_to(&mut self.stream)?;
        let response = InitialResponse::read_from(&mut self.stream)
            .map_err(|e| e.while_waiting_for("initial response"))?;
        if response.error_code.is_error() {
            return Err(WireError::Protocol(format!("worker refused handshake: {}", response.error_code)));
        }
        if response.negotiated_protocol_version != PROTOCOL_VERSION {
            return Err(WireError::Protocol(format!(
                "worker negotiated protocol version {}, expected {}",
                response.negotiated_protocol_version, PROTOCOL_VERSION
            )));
        }
        self.hostname = Some(response.hostname.clone());
        self.state = ConnectionState::AwaitingCommand;
        Ok(response.hostname)
    }

    pub fn read_quality_tables(
        &mut self,
        path: &str,
        correct_histograms: bool,
    ) -> Result<RequestOutcome<QualityTables>, WireError> {
        let options = StandardOptions {
            flags: if correct_histograms { CORRECT_HISTOGRAMS_FLAG } else { 0 },
            path: path.to_string(),
        };
        self.request_decoded(RequestType::ReadQualityTables, &options.encode(), "quality tables")
    }

    pub fn read_antenna_tables(&mut self, path: &str) -> Result<RequestOutcome<Vec<AntennaInfo>>, WireError> {
        let options = StandardOptions { flags: 0, path: path.to_string() };
        self.request_decoded(RequestType::ReadAntennaTables, &options.encode(), "antenna table")
    }

    pub fn read_band_table(&mut self, path: &str) -> Result<RequestOutcome<BandInfo>, WireError> {
        let options = StandardOptions { flags: 0, path: path.to_string() };
        self.request_decoded(RequestType::ReadBandTable, &options.encode(), "band table")
    }

    pub fn read_data_rows(
        &mut self,
        path: &str,
        start_row: u64,
        row_count: u64,
    ) -> Result<RequestOutcome<Vec<RowData>>, WireError> {
        let options = ReadRowsOptions { flags: 0, path: path.to_string(), start_row, row_count };
        self.request_decoded(RequestType::ReadDataRows, &options.encode(), "data rows")
    }

    /// Options announce the size of the encoded rows, which follow the
    /// request block as a separate body.
    pub fn write_data_rows(
        &mut self,
        path: &str,
        start_row: u64,
        rows: &[RowData],
    ) -> Result<RequestOutcome<()>, WireError> {
        let body = payload::encode("data rows", &rows)?;
        let options = WriteRowsOptions {
            flags: 0,
            path: path.to_string(),
            start_row,
            row_count: rows.len() as u64,
            data_size: body.len() as u64,
        };
        Ok(self
            .round_trip(RequestType::WriteDataRows, &options.encode(), Some(&body))?
            .map(|_| ()))
    }

    pub fn execute(&mut self, request: &Request) -> Result<RequestOutcome<ResponsePayload>, WireError> {
        Ok(match request {
            Request::ReadQualityTables { path, correct_histograms } => self
                .read_quality_tables(path, *correct_histograms)?
                .map(ResponsePayload::QualityTables),
            Request::ReadAntennaTables { path } => {
                self.read_antenna_tables(path)?.map(ResponsePayload::Antennas)
            }
            Request::ReadBandTable { path } => self.read_band_table(path)?.map(ResponsePayload::Band),
            Request::ReadDataRows { path, start_row, row_count } => self
                .read_data_rows(path, *start_row, *row_count)?
                .map(ResponsePayload::Rows),
            Request::WriteDataRows { path, start_row, rows } => self
                .write_data_rows(path, *start_row, rows)?
                .map(|_| ResponsePayload::Written),
        })
    }

    /// Tell the worker to finish. No response is expected.
    pub fn stop_client(&mut self) -> Result<(), WireError> {
        if self.state == ConnectionState::Stopped {
            return Ok(());
        }
        self.state = ConnectionState::Stopped;
        write_request(&mut self.stream, RequestType::Stop, &[])
    }

    fn request_decoded<T: DeserializeOwned>(
        &mut self,
        request: RequestType,
        options: &[u8],
        what: &'static str,
    ) -> Result<RequestOutcome<T>, WireError> {
        match self.round_trip(request, options, None)? {
            RequestOutcome::Finished(bytes) => Ok(RequestOutcome::Finished(payload::decode(what, &bytes)?)),
            RequestOutcome::RemoteError { code, message } => Ok(RequestOutcome::RemoteError { code, message }),
        }
    }

    fn round_trip(
        &mut self,
        request: RequestType,
        options: &[u8],
        body: Option<&[u8]>,
    ) -> Result<RequestOutcome<Vec<u8>>, WireError> {
        if self.state != ConnectionState::AwaitingCommand {
            return Err(WireError::Protocol(format!(
                "cannot send {:?} while connection is {:?}",
                request, self.state
            )));
        }
        write_request(&mut self.stream, request, options)?;
        if let Some(body) = body {
            self.stream.write_all(body)?;
            self.stream.flush()?;
        }

        self.state = ConnectionState::AwaitingResponseHeader;
        self.stream.set_read_timeout(deadline(self.settings.request_timeout))?;
        let header = ResponseHeader::read_from(&mut self.stream)
            .map_err(|e| e.while_waiting_for("response header"))?;

        self.state = ConnectionState::AwaitingResponseBody;
        let bytes = read_payload(&mut self.stream, header.data_size as u64)
            .map_err(|e| e.while_waiting_for("response body"))?;
        self.state = ConnectionState::AwaitingCommand;

        if header.error_code.is_error() {
            return Ok(RequestOutcome::RemoteError {
                code: header.error_code,
                message: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(RequestOutcome::Finished(bytes))
    }

    fn fail(&mut self) {
        let _ = self.stop_client();
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Thread body: handshake, then execute commands until told to stop.
    ///
    /// Ends by sending `Stop` to the worker, either on `ConnectionCommand::Stop`
    /// or when the orchestrator drops its command sender.
    pub fn serve(mut self, commands: mpsc::Receiver<ConnectionCommand>, events: mpsc::Sender<CommanderEvent>) {
        let id = self.id;
        let hostname = match self.start() {
            Ok(hostname) => hostname,
            Err(e) => {
                log::warn!("connection {}: handshake failed: {}", id, e);
                self.fail();
                let _ = events.send(CommanderEvent::ConnectionFailed {
                    id,
                    hostname: None,
                    error: e.to_string(),
                });
                return;
            }
        };
        log::info!("connection {}: worker {} ready", id, hostname);

        loop {
            if events.send(CommanderEvent::AwaitingCommand { id, hostname: hostname.clone() }).is_err() {
                break;
            }
            let request = match commands.recv() {
                Ok(ConnectionCommand::Execute(request)) => request,
                Ok(ConnectionCommand::Stop) | Err(_) => break,
            };
            log::debug!("connection {}: {} <- {:?} {}", id, hostname, kind(&request), request.path());
            let event = match self.execute(&request) {
                Ok(RequestOutcome::Finished(payload)) => CommanderEvent::Finished {
                    id,
                    hostname: hostname.clone(),
                    payload,
                },
                Ok(RequestOutcome::RemoteError { code, message }) => CommanderEvent::RemoteError {
                    id,
                    hostname: hostname.clone(),
                    code,
                    message,
                },
                Err(e) => {
                    log::warn!("connection {} to {} failed: {}", id, hostname, e);
                    self.fail();
                    let _ = events.send(CommanderEvent::ConnectionFailed {
                        id,
                        hostname: Some(hostname),
                        error: e.to_string(),
                    });
                    return;
                }
            };
            if events.send(event).is_err() {
                break;
            }
        }

        log::debug!("connection {}: stopping worker {}", id, hostname);
        let _ = self.stop_client();
    }
}

fn kind(request: &Request) -> RequestType {
    match request {
        Request::ReadQualityTables { .. } => RequestType::ReadQualityTables,
        Request::ReadAntennaTables { .. } => RequestType::ReadAntennaTables,
        Request::ReadBandTable { .. } => RequestType::ReadBandTable,
        Request::ReadDataRows { .. } => RequestType::ReadDataRows,
        Request::WriteDataRows { .. } => RequestType::WriteDataRows,
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
