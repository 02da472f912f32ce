//! Wire format for the coordinator/worker protocol.
//!
//! Every block begins with a fixed-size header of little-endian integers.
//! Payload lengths are always carried in the header; nothing on the wire
//! relies on a delimiter or on the peer closing the socket.
//!
//! # Block layouts
//!
//! ```text
//! Initial          i16 blockSize | i16 0x414F | i16 protocolVersion | i16 options
//! InitialResponse  i16 blockSize | i16 2 | i16 negotiatedVersion | i16 errorCode | i16 hostNameSize
//!                  + hostNameSize bytes of UTF-8
//! Request          i16 blockSize | i16 3 | i16 requestType | i16 dataSize
//!                  + dataSize bytes of request options
//! Response         i16 blockSize | i16 10 | i16 errorCode | i64 dataSize
//!                  + dataSize bytes of payload (or an error detail string)
//! ```

use std::fmt;
use std::io::{Read, Write};

use thiserror::Error;


pub const PROTOCOL_VERSION: i16 = 1;
pub const DEFAULT_PORT: u16 = 1892;

pub const INITIAL_BLOCK_ID: i16 = 0x414F;
pub const INITIAL_RESPONSE_BLOCK_ID: i16 = 2;
pub const REQUEST_BLOCK_ID: i16 = 3;
pub const GENERIC_READ_RESPONSE_BLOCK_ID: i16 = 10;

pub const INITIAL_BLOCK_SIZE: i16 = 8;
pub const INITIAL_RESPONSE_BLOCK_SIZE: i16 = 10;
pub const REQUEST_BLOCK_SIZE: i16 = 8;
pub const GENERIC_READ_RESPONSE_BLOCK_SIZE: i16 = 14;

/// Request flag for `ReadQualityTables`: subtract RFI counts from the total
/// histograms before returning them.
pub const CORRECT_HISTOGRAMS_FLAG: i32 = 0x1;


// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure while encoding, decoding or transporting a block.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent something this side does not understand. The connection
    /// is unusable afterwards.
    #[error("protocol not understood: {0}")]
    Protocol(String),

    #[error("{field} of {size} bytes does not fit in its length field")]
    Oversized { field: &'static str, size: usize },

    #[error("timed out waiting for {0}")]
    TimedOut(&'static str),

    #[error("payload codec error: {0}")]
    Codec(#[from] crate::payload::CodecError),
}

impl WireError {
    /// Reclassify socket timeouts (which surface as `WouldBlock` or
    /// `TimedOut` when a read deadline is set) as [`WireError::TimedOut`].
    pub fn while_waiting_for(self, what: &'static str) -> WireError {
        match self {
            WireError::Io(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                WireError::TimedOut(what)
            }
            other => other,
        }
    }
}


// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Status code carried in handshake and response headers.
///
/// Codes are stable within one protocol version. Codes this side does not
/// know are preserved as [`ErrorCode::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    UnexpectedExceptionOccured,
    ProtocolNotUnderstoodError,
    CouldNotOpenMeasurementSetError,
    CouldNotOpenTableError,
    Unknown(i16),
}

impl ErrorCode {
    pub fn code(self) -> i16 {
        match self {
            ErrorCode::NoError => 0,
            ErrorCode::UnexpectedExceptionOccured => 1,
            ErrorCode::ProtocolNotUnderstoodError => 10,
            ErrorCode::CouldNotOpenMeasurementSetError => 20,
            ErrorCode::CouldNotOpenTableError => 21,
            ErrorCode::Unknown(c) => c,
        }
    }

    pub fn from_code(code: i16) -> ErrorCode {
        match code {
            0 => ErrorCode::NoError,
            1 => ErrorCode::UnexpectedExceptionOccured,
            10 => ErrorCode::ProtocolNotUnderstoodError,
            20 => ErrorCode::CouldNotOpenMeasurementSetError,
            21 => ErrorCode::CouldNotOpenTableError,
            other => ErrorCode::Unknown(other),
        }
    }

    pub fn is_error(self) -> bool {
        self != ErrorCode::NoError
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::NoError => write!(f, "no error"),
            ErrorCode::UnexpectedExceptionOccured => write!(f, "unexpected exception occurred"),
            ErrorCode::ProtocolNotUnderstoodError => write!(f, "protocol not understood"),
            ErrorCode::CouldNotOpenMeasurementSetError => {
                write!(f, "could not open measurement set")
            }
            ErrorCode::CouldNotOpenTableError => write!(f, "could not open table"),
            ErrorCode::Unknown(c) => write!(f, "unknown error code {}", c),
        }
    }
}


// ---------------------------------------------------------------------------
// RequestType
// ---------------------------------------------------------------------------

/// Kind of request a coordinator sends after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Stop,
    ReadQualityTables,
    ReadAntennaTables,
    ReadDataRows,
    WriteDataRows,
    ReadBandTable,
}

impl RequestType {
    pub fn code(self) -> i16 {
        match self {
            RequestType::Stop => 0,
            RequestType::ReadQualityTables => 1,
            RequestType::ReadAntennaTables => 2,
            RequestType::ReadDataRows => 3,
            RequestType::WriteDataRows => 4,
            RequestType::ReadBandTable => 5,
        }
    }

    /// `None` for request codes from a newer or incompatible peer.
    pub fn from_code(code: i16) -> Option<RequestType> {
        match code {
            0 => Some(RequestType::Stop),
            1 => Some(RequestType::ReadQualityTables),
            2 => Some(RequestType::ReadAntennaTables),
            3 => Some(RequestType::ReadDataRows),
            4 => Some(RequestType::WriteDataRows),
            5 => Some(RequestType::ReadBandTable),
            _ => None,
        }
    }
}


// ---------------------------------------------------------------------------
// Primitive encoding
// ---------------------------------------------------------------------------

fn put_i16(buf: &mut Vec<u8>, v: i16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn get_i16(bytes: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn get_i32(bytes: &[u8], at: usize) -> i32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    i32::from_le_bytes(b)
}

fn get_u64(bytes: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(b)
}

fn get_i64(bytes: &[u8], at: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    i64::from_le_bytes(b)
}

fn checked_i16(field: &'static str, size: usize) -> Result<i16, WireError> {
    i16::try_from(size).map_err(|_| WireError::Oversized { field, size })
}

/// Read exactly `size` bytes without trusting `size` for the allocation.
pub fn read_payload<R: Read>(reader: &mut R, size: u64) -> Result<Vec<u8>, WireError> {
    let mut payload = Vec::new();
    reader.take(size).read_to_end(&mut payload)?;
    if payload.len() as u64 != size {
        return Err(WireError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("expected {} payload bytes, got {}", size, payload.len()),
        )));
    }
    Ok(payload)
}

fn string_from(bytes: Vec<u8>, what: &str) -> Result<String, WireError> {
    String::from_utf8(bytes).map_err(|_| WireError::Protocol(format!("{} is not valid UTF-8", what)))
}


// ---------------------------------------------------------------------------
// Initial
// ---------------------------------------------------------------------------

/// First block of every connection, sent by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialBlock {
    pub block_size: i16,
    pub block_identifier: i16,
    pub protocol_version: i16,
    pub options: i16,
}

impl InitialBlock {
    pub fn new() -> InitialBlock {
        InitialBlock {
            block_size: INITIAL_BLOCK_SIZE,
            block_identifier: INITIAL_BLOCK_ID,
            protocol_version: PROTOCOL_VERSION,
            options: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INITIAL_BLOCK_SIZE as usize);
        put_i16(&mut buf, self.block_size);
        put_i16(&mut buf, self.block_identifier);
        put_i16(&mut buf, self.protocol_version);
        put_i16(&mut buf, self.options);
        buf
    }

    pub fn decode(bytes: &[u8; 8]) -> InitialBlock {
        InitialBlock {
            block_size: get_i16(bytes, 0),
            block_identifier: get_i16(bytes, 2),
            protocol_version: get_i16(bytes, 4),
            options: get_i16(bytes, 6),
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), WireError> {
        writer.write_all(&self.encode())?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<InitialBlock, WireError> {
        let mut bytes = [0u8; 8];
        reader.read_exact(&mut bytes)?;
        Ok(InitialBlock::decode(&bytes))
    }

    /// Check the block against what this side speaks.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.block_identifier != INITIAL_BLOCK_ID || self.block_size != INITIAL_BLOCK_SIZE {
            return Err(WireError::Protocol(format!(
                "bad initial block (identifier {:#x}, size {})",
                self.block_identifier, self.block_size
            )));
        }
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(WireError::Protocol(format!(
                "protocol version {} requested, this side speaks version {}",
                self.protocol_version, PROTOCOL_VERSION
            )));
        }
        Ok(())
    }
}

impl Default for InitialBlock {
    fn default() -> Self {
        Self::new()
    }
}


// ---------------------------------------------------------------------------
// InitialResponse
// ---------------------------------------------------------------------------

/// The worker's answer to [`InitialBlock`], followed by its host name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialResponse {
    pub block_size: i16,
    pub block_identifier: i16,
    pub negotiated_protocol_version: i16,
    pub error_code: ErrorCode,
    pub hostname: String,
}

impl InitialResponse {
    pub fn accept(hostname: &str) -> InitialResponse {
        InitialResponse {
            block_size: INITIAL_RESPONSE_BLOCK_SIZE,
            block_identifier: INITIAL_RESPONSE_BLOCK_ID,
            negotiated_protocol_version: PROTOCOL_VERSION,
            error_code: ErrorCode::NoError,
            hostname: hostname.to_string(),
        }
    }

    pub fn reject(code: ErrorCode) -> InitialResponse {
        InitialResponse {
            error_code: code,
            hostname: String::new(),
            ..InitialResponse::accept("")
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let host_size = checked_i16("host name", self.hostname.len())?;
        let mut buf = Vec::with_capacity(INITIAL_RESPONSE_BLOCK_SIZE as usize + self.hostname.len());
        put_i16(&mut buf, self.block_size);
        put_i16(&mut buf, self.block_identifier);
        put_i16(&mut buf, self.negotiated_protocol_version);
        put_i16(&mut buf, self.error_code.code());
        put_i16(&mut buf, host_size);
        buf.extend_from_slice(self.hostname.as_bytes());
        Ok(buf)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), WireError> {
        writer.write_all(&self.encode()?)?;
        writer.flush()?;
        Ok(())
    }

    /// Read the header and the host name that follows it. A malformed header
    /// is reported before any host name bytes are consumed.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<InitialResponse, WireError> {
        let mut header = [0u8; INITIAL_RESPONSE_BLOCK_SIZE as usize];
        reader.read_exact(&mut header)?;
        let block_size = get_i16(&header, 0);
        let block_identifier = get_i16(&header, 2);
        if block_identifier != INITIAL_RESPONSE_BLOCK_ID || block_size != INITIAL_RESPONSE_BLOCK_SIZE {
            return Err(WireError::Protocol(format!(
                "bad initial response (identifier {}, size {})",
                block_identifier, block_size
            )));
        }
        let host_size = get_i16(&header, 8);
        if host_size < 0 {
            return Err(WireError::Protocol(format!("negative host name size {}", host_size)));
        }
        let hostname = string_from(read_payload(reader, host_size as u64)?, "host name")?;
        Ok(InitialResponse {
            block_size,
            block_identifier,
            negotiated_protocol_version: get_i16(&header, 4),
            error_code: ErrorCode::from_code(get_i16(&header, 6)),
            hostname,
        })
    }
}


// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Header preceding every request. `data_size` bytes of options follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestBlock {
    pub block_size: i16,
    pub block_identifier: i16,
    pub request: i16,
    pub data_size: i16,
}

impl RequestBlock {
    pub fn new(request: RequestType, data_size: usize) -> Result<RequestBlock, WireError> {
        Ok(RequestBlock {
            block_size: REQUEST_BLOCK_SIZE,
            block_identifier: REQUEST_BLOCK_ID,
            request: request.code(),
            data_size: checked_i16("request options", data_size)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REQUEST_BLOCK_SIZE as usize);
        put_i16(&mut buf, self.block_size);
        put_i16(&mut buf, self.block_identifier);
        put_i16(&mut buf, self.request);
        put_i16(&mut buf, self.data_size);
        buf
    }

    pub fn decode(bytes: &[u8; 8]) -> RequestBlock {
        RequestBlock {
            block_size: get_i16(bytes, 0),
            block_identifier: get_i16(bytes, 2),
            request: get_i16(bytes, 4),
            data_size: get_i16(bytes, 6),
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<RequestBlock, WireError> {
        let mut bytes = [0u8; 8];
        reader.read_exact(&mut bytes)?;
        let block = RequestBlock::decode(&bytes);
        if block.block_identifier != REQUEST_BLOCK_ID || block.block_size != REQUEST_BLOCK_SIZE {
            return Err(WireError::Protocol(format!(
                "bad request block (identifier {}, size {})",
                block.block_identifier, block.block_size
            )));
        }
        if block.data_size < 0 {
            return Err(WireError::Protocol(format!(
                "negative request data size {}",
                block.data_size
            )));
        }
        Ok(block)
    }
}

/// Write a request header followed by its options.
pub fn write_request<W: Write>(
    writer: &mut W,
    request: RequestType,
    options: &[u8],
) -> Result<(), WireError> {
    let block = RequestBlock::new(request, options.len())?;
    let mut buf = block.encode();
    buf.extend_from_slice(options);
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}


// ---------------------------------------------------------------------------
// Request options
// ---------------------------------------------------------------------------

/// Options shared by the quality, antenna and band requests: a flag word
/// followed by the shard path, whose length is implied by the block size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardOptions {
    pub flags: i32,
    pub path: String,
}

impl StandardOptions {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.path.len());
        put_i32(&mut buf, self.flags);
        buf.extend_from_slice(self.path.as_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<StandardOptions, WireError> {
        if bytes.len() < 4 {
            return Err(WireError::Protocol(format!(
                "request options too short ({} bytes)",
                bytes.len()
            )));
        }
        Ok(StandardOptions {
            flags: get_i32(bytes, 0),
            path: string_from(bytes[4..].to_vec(), "shard path")?,
        })
    }
}

/// Options of a `ReadDataRows` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRowsOptions {
    pub flags: i32,
    pub path: String,
    pub start_row: u64,
    pub row_count: u64,
}

const READ_ROWS_FIXED: usize = 4 + 8 + 8;

impl ReadRowsOptions {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(READ_ROWS_FIXED + self.path.len());
        put_i32(&mut buf, self.flags);
        buf.extend_from_slice(self.path.as_bytes());
        put_u64(&mut buf, self.start_row);
        put_u64(&mut buf, self.row_count);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<ReadRowsOptions, WireError> {
        if bytes.len() < READ_ROWS_FIXED {
            return Err(WireError::Protocol(format!(
                "read-rows options too short ({} bytes)",
                bytes.len()
            )));
        }
        let path_end = bytes.len() - 16;
        Ok(ReadRowsOptions {
            flags: get_i32(bytes, 0),
            path: string_from(bytes[4..path_end].to_vec(), "shard path")?,
            start_row: get_u64(bytes, path_end),
            row_count: get_u64(bytes, path_end + 8),
        })
    }
}

/// Options of a `WriteDataRows` request. `data_size` announces the size of
/// the serialized rows sent right after the options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRowsOptions {
    pub flags: i32,
    pub path: String,
    pub start_row: u64,
    pub row_count: u64,
    pub data_size: u64,
}

const WRITE_ROWS_FIXED: usize = 4 + 8 + 8 + 8;

impl WriteRowsOptions {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(WRITE_ROWS_FIXED + self.path.len());
        put_i32(&mut buf, self.flags);
        buf.extend_from_slice(self.path.as_bytes());
        put_u64(&mut buf, self.start_row);
        put_u64(&mut buf, self.row_count);
        put_u64(&mut buf, self.data_size);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<WriteRowsOptions, WireError> {
        if bytes.len() < WRITE_ROWS_FIXED {
            return Err(WireError::Protocol(format!(
                "write-rows options too short ({} bytes)",
                bytes.len()
            )));
        }
        let path_end = bytes.len() - 24;
        Ok(WriteRowsOptions {
            flags: get_i32(bytes, 0),
            path: string_from(bytes[4..path_end].to_vec(), "shard path")?,
            start_row: get_u64(bytes, path_end),
            row_count: get_u64(bytes, path_end + 8),
            data_size: get_u64(bytes, path_end + 16),
        })
    }
}


// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Header preceding every response. `data_size` payload bytes follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub block_size: i16,
    pub block_identifier: i16,
    pub error_code: ErrorCode,
    pub data_size: i64,
}

impl ResponseHeader {
    pub fn new(error_code: ErrorCode, data_size: usize) -> Result<ResponseHeader, WireError> {
        let data_size = i64::try_from(data_size).map_err(|_| WireError::Oversized {
            field: "response payload",
            size: data_size,
        })?;
        Ok(ResponseHeader {
            block_size: GENERIC_READ_RESPONSE_BLOCK_SIZE,
            block_identifier: GENERIC_READ_RESPONSE_BLOCK_ID,
            error_code,
            data_size,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(GENERIC_READ_RESPONSE_BLOCK_SIZE as usize);
        put_i16(&mut buf, self.block_size);
        put_i16(&mut buf, self.block_identifier);
        put_i16(&mut buf, self.error_code.code());
        put_i64(&mut buf, self.data_size);
        buf
    }

    pub fn decode(bytes: &[u8; 14]) -> ResponseHeader {
        ResponseHeader {
            block_size: get_i16(bytes, 0),
            block_identifier: get_i16(bytes, 2),
            error_code: ErrorCode::from_code(get_i16(bytes, 4)),
            data_size: get_i64(bytes, 6),
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<ResponseHeader, WireError> {
        let mut bytes = [0u8; 14];
        reader.read_exact(&mut bytes)?;
        let header = ResponseHeader::decode(&bytes);
        if header.block_identifier != GENERIC_READ_RESPONSE_BLOCK_ID
            || header.block_size != GENERIC_READ_RESPONSE_BLOCK_SIZE
        {
            return Err(WireError::Protocol(format!(
                "bad response header (identifier {}, size {})",
                header.block_identifier, header.block_size
            )));
        }
        if header.data_size < 0 {
            return Err(WireError::Protocol(format!(
                "negative response data size {}",
                header.data_size
            )));
        }
        Ok(header)
    }
}

/// Write a response header followed by its payload.
pub fn write_response<W: Write>(
    writer: &mut W,
    error_code: ErrorCode,
    payload: &[u8],
) -> Result<(), WireError> {
    let header = ResponseHeader::new(error_code, payload.len())?;
    writer.write_all(&header.encode())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
