//! In-memory shard store for tests and simulations.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{ShardStore, StoreError};
use crate::payload::{AntennaInfo, BandInfo, QualityTables, RowData};


/// Tables of one in-memory shard. Absent tables behave like missing table
/// files.
#[derive(Debug, Clone, Default)]
pub struct MemoryShard {
    pub antennas: Option<Vec<AntennaInfo>>,
    pub band: Option<BandInfo>,
    pub quality: Option<QualityTables>,
    pub rows: Option<Vec<RowData>>,
}

/// Shards keyed by local path. Interior mutability lets one store be shared
/// between a worker thread and the test that inspects it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    shards: Mutex<HashMap<String, MemoryShard>>,
    requests: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn insert(&self, path: &str, shard: MemoryShard) {
        self.shards.lock().insert(path.to_string(), shard);
    }

    pub fn shard(&self, path: &str) -> Option<MemoryShard> {
        self.shards.lock().get(path).cloned()
    }

    /// Every operation performed, as `"<operation> <path>"`, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    fn with_shard<T>(
        &self,
        operation: &str,
        path: &str,
        f: impl FnOnce(&mut MemoryShard) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.requests.lock().push(format!("{} {}", operation, path));
        let mut shards = self.shards.lock();
        let shard = shards
            .get_mut(path)
            .ok_or_else(|| StoreError::CouldNotOpenMeasurementSet(path.to_string()))?;
        f(shard)
    }
}

fn missing(path: &str, table: &str) -> StoreError {
    StoreError::CouldNotOpenTable {
        path: path.to_string(),
        table: table.to_string(),
    }
}

impl ShardStore for MemoryStore {
    fn read_quality_tables(&self, path: &str, correct_histograms: bool) -> Result<QualityTables, StoreError> {
        self.with_shard("quality", path, |shard| {
            let mut tables = shard.quality.clone().ok_or_else(|| missing(path, "QUALITY"))?;
            if correct_histograms {
                tables.histograms.remove_rfi_from_total();
            }
            Ok(tables)
        })
    }

    fn read_antennas(&self, path: &str) -> Result<Vec<AntennaInfo>, StoreError> {
        self.with_shard("antennas", path, |shard| {
            shard.antennas.clone().ok_or_else(|| missing(path, "ANTENNA"))
        })
    }

    fn read_band(&self, path: &str) -> Result<BandInfo, StoreError> {
        self.with_shard("band", path, |shard| {
            shard.band.clone().ok_or_else(|| missing(path, "SPECTRAL_WINDOW"))
        })
    }

    fn read_rows(&self, path: &str, start_row: u64, row_count: u64) -> Result<Vec<RowData>, StoreError> {
        self.with_shard("read-rows", path, |shard| {
            let rows = shard.rows.as_ref().ok_or_else(|| missing(path, "MAIN"))?;
            Ok(rows
                .iter()
                .skip(start_row as usize)
                .take(row_count as usize)
                .cloned()
                .collect())
        })
    }

    fn write_rows(&self, path: &str, start_row: u64, new_rows: &[RowData]) -> Result<(), StoreError> {
        self.with_shard("write-rows", path, |shard| {
            let rows = shard.rows.as_mut().ok_or_else(|| missing(path, "MAIN"))?;
            let start = start_row as usize;
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
            Ok(())
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_path_and_missing_table() {
        let store = MemoryStore::new();
        store.insert("/s0", MemoryShard::default());
        assert!(matches!(
            store.read_band("/s1"),
            Err(StoreError::CouldNotOpenMeasurementSet(_))
        ));
        assert!(matches!(
            store.read_band("/s0"),
            Err(StoreError::CouldNotOpenTable { .. })
        ));
        assert_eq!(store.requests(), vec!["band /s1".to_string(), "band /s0".to_string()]);
    }

    #[test]
    fn write_then_read_rows() {
        let store = MemoryStore::new();
        store.insert(
            "/s0",
            MemoryShard { rows: Some(vec![RowData::new(1, 1); 3]), ..Default::default() },
        );
        let mut row = RowData::new(1, 1);
        row.antenna1 = 9;
        store.write_rows("/s0", 2, &[row]).unwrap();
        assert_eq!(store.read_rows("/s0", 0, 10).unwrap()[2].antenna1, 9);
        assert!(store.write_rows("/s0", 3, &[RowData::new(1, 1)]).is_err());
    }
}
