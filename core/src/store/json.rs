//! Directory-of-JSON shard store.
//!
//! A shard is a directory holding one JSON file per table:
//!
//! ```text
//! <shard>/antennas.json   Vec<AntennaInfo>
//! <shard>/band.json       BandInfo
//! <shard>/quality.json    QualityTables
//! <shard>/rows.json       Vec<RowData>
//! ```

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{ShardStore, StoreError};
use crate::payload::{AntennaInfo, BandInfo, QualityTables, RowData};


pub const ANTENNA_TABLE: &str = "antennas.json";
pub const BAND_TABLE: &str = "band.json";
pub const QUALITY_TABLE: &str = "quality.json";
pub const ROWS_TABLE: &str = "rows.json";


#[derive(Debug, Default, Clone)]
pub struct JsonShardStore;

impl JsonShardStore {
    pub fn new() -> JsonShardStore {
        JsonShardStore
    }

    fn shard_dir(path: &str) -> Result<PathBuf, StoreError> {
        let dir = PathBuf::from(path);
        if !dir.is_dir() {
            return Err(StoreError::CouldNotOpenMeasurementSet(path.to_string()));
        }
        Ok(dir)
    }

    fn read_table<T: DeserializeOwned>(path: &str, table: &str) -> Result<T, StoreError> {
        let file = Self::shard_dir(path)?.join(table);
        if !file.is_file() {
            return Err(StoreError::CouldNotOpenTable {
                path: path.to_string(),
                table: table.to_string(),
            });
        }
        let content = std::fs::read_to_string(&file).map_err(|source| StoreError::Io {
            path: file.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|e| {
            StoreError::InvalidRequest(format!("table {} of {} is corrupt: {}", table, path, e))
        })
    }

    fn write_table<T: Serialize>(dir: &Path, table: &str, value: &T) -> Result<(), StoreError> {
        let file = dir.join(table);
        let content = serde_json::to_string_pretty(value).map_err(|e| {
            StoreError::InvalidRequest(format!("cannot serialize table {}: {}", table, e))
        })?;
        std::fs::write(&file, content).map_err(|source| StoreError::Io {
            path: file.display().to_string(),
            source,
        })
    }

    /// Create a shard directory from its tables. Used to stage test data and
    /// by conversion tooling.
    pub fn create_shard(
        dir: &Path,
        antennas: &[AntennaInfo],
        band: &BandInfo,
        quality: &QualityTables,
        rows: &[RowData],
    ) -> Result<(), StoreError> {
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        Self::write_table(dir, ANTENNA_TABLE, &antennas)?;
        Self::write_table(dir, BAND_TABLE, band)?;
        Self::write_table(dir, QUALITY_TABLE, quality)?;
        Self::write_table(dir, ROWS_TABLE, &rows)
    }
}

impl ShardStore for JsonShardStore {
    fn read_quality_tables(&self, path: &str, correct_histograms: bool) -> Result<QualityTables, StoreError> {
        let mut tables: QualityTables = Self::read_table(path, QUALITY_TABLE)?;
        if correct_histograms {
            tables.histograms.remove_rfi_from_total();
        }
        Ok(tables)
    }

    fn read_antennas(&self, path: &str) -> Result<Vec<AntennaInfo>, StoreError> {
        Self::read_table(path, ANTENNA_TABLE)
    }

    fn read_band(&self, path: &str) -> Result<BandInfo, StoreError> {
        Self::read_table(path, BAND_TABLE)
    }

    fn read_rows(&self, path: &str, start_row: u64, row_count: u64) -> Result<Vec<RowData>, StoreError> {
        let rows: Vec<RowData> = Self::read_table(path, ROWS_TABLE)?;
        let start = usize::try_from(start_row).unwrap_or(usize::MAX).min(rows.len());
        let count = usize::try_from(row_count).unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(start).take(count).collect())
    }

    fn write_rows(&self, path: &str, start_row: u64, new_rows: &[RowData]) -> Result<(), StoreError> {
        let mut rows: Vec<RowData> = Self::read_table(path, ROWS_TABLE)?;
        let start = usize::try_from(start_row)
            .map_err(|_| StoreError::InvalidRequest(format!("start row {} out of range", start_row)))?;
        if start + new_rows.len() > rows.len() {
            return Err(StoreError::InvalidRequest(format!(
                "rows {}..{} exceed the {} rows of {}",
                start,
                start + new_rows.len(),
                rows.len(),
                path
            )));
        }
        rows[start..start + new_rows.len()].clone_from_slice(new_rows);
        Self::write_table(&Self::shard_dir(path)?, ROWS_TABLE, &rows)
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
