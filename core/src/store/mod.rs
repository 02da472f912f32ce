//! Local shard access on a worker node.
//!
//! Provides the `ShardStore` trait the worker-side protocol handler calls,
//! plus two implementations: `JsonShardStore` (shards as directories of JSON
//! tables) and `MemoryStore` (test double).

pub mod json;
pub mod memory;

pub use json::JsonShardStore;
pub use memory::MemoryStore;

use std::sync::Arc;

use thiserror::Error;

use crate::payload::{AntennaInfo, BandInfo, CodecError, QualityTables, RowData};
use crate::remote::format::ErrorCode;


#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not open measurement set {0}")]
    CouldNotOpenMeasurementSet(String),

    #[error("could not open table {table} of {path}")]
    CouldNotOpenTable { path: String, table: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Codec(#[from] CodecError),

    /// A store implementation panicked while serving the request.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Wire code reported to the coordinator for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            StoreError::CouldNotOpenMeasurementSet(_) => ErrorCode::CouldNotOpenMeasurementSetError,
            StoreError::CouldNotOpenTable { .. } => ErrorCode::CouldNotOpenTableError,
            _ => ErrorCode::UnexpectedExceptionOccured,
        }
    }
}


/// Reader/writer for shards stored on this node, addressed by local path.
pub trait ShardStore {
    fn read_quality_tables(&self, path: &str, correct_histograms: bool) -> Result<QualityTables, StoreError>;

    fn read_antennas(&self, path: &str) -> Result<Vec<AntennaInfo>, StoreError>;

    fn read_band(&self, path: &str) -> Result<BandInfo, StoreError>;

    /// Rows `[start_row, start_row + row_count)`. Fewer rows are returned
    /// when the shard ends earlier.
    fn read_rows(&self, path: &str, start_row: u64, row_count: u64) -> Result<Vec<RowData>, StoreError>;

    /// Overwrite rows starting at `start_row`.
    fn write_rows(&self, path: &str, start_row: u64, rows: &[RowData]) -> Result<(), StoreError>;
}

impl<S: ShardStore + ?Sized> ShardStore for Arc<S> {
    fn read_quality_tables(&self, path: &str, correct_histograms: bool) -> Result<QualityTables, StoreError> {
        (**self).read_quality_tables(path, correct_histograms)
    }

    fn read_antennas(&self, path: &str) -> Result<Vec<AntennaInfo>, StoreError> {
        (**self).read_antennas(path)
    }

    fn read_band(&self, path: &str) -> Result<BandInfo, StoreError> {
        (**self).read_band(path)
    }

    fn read_rows(&self, path: &str, start_row: u64, row_count: u64) -> Result<Vec<RowData>, StoreError> {
        (**self).read_rows(path, start_row, row_count)
    }

    fn write_rows(&self, path: &str, start_row: u64, rows: &[RowData]) -> Result<(), StoreError> {
        (**self).write_rows(path, start_row, rows)
    }
}
