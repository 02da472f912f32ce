//! Worker side of the protocol.
//!
//! A `Client` connects out to the coordinator, answers the handshake with
//! its host name and then serves requests against a local `ShardStore`
//! until it receives `Stop`. A failing request never ends the loop: store
//! errors (and panics inside the store) become error responses and the
//! worker waits for the next request. Only transport and protocol failures
//! end it.

use std::net::TcpStream;
use std::panic::{self, AssertUnwindSafe};

use super::format::{
    read_payload, write_response, ErrorCode, InitialBlock, InitialResponse, ReadRowsOptions,
    RequestBlock, RequestType, StandardOptions, WireError, WriteRowsOptions,
    CORRECT_HISTOGRAMS_FLAG,
};
use crate::payload::{self, RowData};
use crate::store::{ShardStore, StoreError};


pub struct Client<S: ShardStore> {
    stream: TcpStream,
    store: S,
    hostname: String,
    served: u64,
}

impl<S: ShardStore> Client<S> {
    pub fn connect(host: &str, port: u16, store: S, hostname: &str) -> Result<Client<S>, WireError> {
        log::info!("connecting to coordinator {}:{}", host, port);
        let stream = TcpStream::connect((host, port))?;
        Ok(Self::from_stream(stream, store, hostname))
    }

    pub fn from_stream(stream: TcpStream, store: S, hostname: &str) -> Client<S> {
        let _ = stream.set_nodelay(true);
        Client {
            stream,
            store,
            hostname: hostname.to_string(),
            served: 0,
        }
    }

    /// Requests answered so far, successful or not.
    pub fn served(&self) -> u64 {
        self.served
    }

    /// Handshake, then serve requests until `Stop`.
    pub fn run(&mut self) -> Result<(), WireError> {
        self.handshake()?;
        loop {
            let block = RequestBlock::read_from(&mut self.stream)?;
            let options = read_payload(&mut self.stream, block.data_size as u64)?;
            let request = match RequestType::from_code(block.request) {
                Some(RequestType::Stop) => {
                    log::info!("stop received after {} request(s)", self.served);
                    return Ok(());
                }
                Some(request) => request,
                None => {
                    log::warn!("unsupported request type {}", block.request);
                    let detail = format!("request type {} is not supported by this worker", block.request);
                    write_response(&mut self.stream, ErrorCode::UnexpectedExceptionOccured, detail.as_bytes())?;
                    self.served += 1;
                    continue;
                }
            };
            let result = self.handle(request, &options)?;
            match result {
                Ok(body) => write_response(&mut self.stream, ErrorCode::NoError, &body)?,
                Err(e) => {
                    log::warn!("{:?} failed: {}", request, e);
                    write_response(&mut self.stream, e.error_code(), e.to_string().as_bytes())?;
                }
            }
            self.served += 1;
        }
    }

    fn handshake(&mut self) -> Result<(), WireError> {
        let initial = InitialBlock::read_from(&mut self.stream)?;
        if let Err(e) = initial.validate() {
            log::error!("rejecting coordinator: {}", e);
            InitialResponse::reject(ErrorCode::ProtocolNotUnderstoodError).write_to(&mut self.stream)?;
            return Err(e);
        }
        InitialResponse::accept(&self.hostname).write_to(&mut self.stream)?;
        log::info!("handshake complete, serving as {}", self.hostname);
        Ok(())
    }

    /// Outer `Err` ends the connection; inner `Err` is reported to the
    /// coordinator.
    fn handle(&mut self, request: RequestType, options: &[u8]) -> Result<Result<Vec<u8>, StoreError>, WireError> {
        if request == RequestType::WriteDataRows {
            // The row body follows the options; without valid options the
            // stream position is lost.
            let opts = WriteRowsOptions::decode(options)?;
            let body = read_payload(&mut self.stream, opts.data_size)?;
            return Ok(self.write_rows(&opts, &body));
        }
        Ok(self.read(request, options))
    }

    fn read(&self, request: RequestType, options: &[u8]) -> Result<Vec<u8>, StoreError> {
        let invalid = |e: WireError| StoreError::InvalidRequest(e.to_string());
        match request {
            RequestType::ReadQualityTables => {
                let opts = StandardOptions::decode(options).map_err(invalid)?;
                let correct = opts.flags & CORRECT_HISTOGRAMS_FLAG != 0;
                let tables = self.guarded(|store| store.read_quality_tables(&opts.path, correct))?;
                Ok(payload::encode("quality tables", &tables)?)
            }
            RequestType::ReadAntennaTables => {
                let opts = StandardOptions::decode(options).map_err(invalid)?;
                let antennas = self.guarded(|store| store.read_antennas(&opts.path))?;
                Ok(payload::encode("antenna table", &antennas)?)
            }
            RequestType::ReadBandTable => {
                let opts = StandardOptions::decode(options).map_err(invalid)?;
                let band = self.guarded(|store| store.read_band(&opts.path))?;
                Ok(payload::encode("band table", &band)?)
            }
            RequestType::ReadDataRows => {
                let opts = ReadRowsOptions::decode(options).map_err(invalid)?;
                let rows = self.guarded(|store| store.read_rows(&opts.path, opts.start_row, opts.row_count))?;
                Ok(payload::encode("data rows", &rows)?)
            }
            RequestType::Stop | RequestType::WriteDataRows => Err(StoreError::InvalidRequest(format!(
                "{:?} is not a read request",
                request
            ))),
        }
    }

    fn write_rows(&self, opts: &WriteRowsOptions, body: &[u8]) -> Result<Vec<u8>, StoreError> {
        let rows: Vec<RowData> = payload::decode("data rows", body)?;
        if rows.len() as u64 != opts.row_count {
            return Err(StoreError::InvalidRequest(format!(
                "{} rows announced, {} received",
                opts.row_count,
                rows.len()
            )));
        }
        self.guarded(|store| store.write_rows(&opts.path, opts.start_row, &rows))?;
        Ok(Vec::new())
    }

    fn guarded<T>(&self, f: impl FnOnce(&S) -> Result<T, StoreError>) -> Result<T, StoreError> {
        match panic::catch_unwind(AssertUnwindSafe(|| f(&self.store))) {
            Ok(result) => result,
            Err(cause) => {
                let message = cause
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| cause.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(StoreError::Internal(message))
            }
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
