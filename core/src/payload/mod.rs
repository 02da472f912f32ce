//! Opaque result objects moved between workers and the coordinator.
//!
//! The coordinator never looks inside these beyond three operations:
//! serialize, deserialize from a buffer of declared length, and merge into
//! a running total. Bodies are encoded with `bincode`; the fixed headers
//! around them live in [`crate::remote::format`].

pub mod antenna;
pub mod band;
pub mod rows;
pub mod statistics;

pub use antenna::AntennaInfo;
pub use band::{BandInfo, ChannelInfo};
pub use rows::RowData;
pub use statistics::{HistogramCollection, QualityTables, StatisticsCollection, StatisticsSample};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;


#[derive(Debug, Error)]
pub enum CodecError {
    #[error("could not encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },

    #[error("could not decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },
}

/// Merge failure. Always a configuration inconsistency between nodes, never
/// a transient fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("cannot merge {what} with {left} polarizations into one with {right}")]
    PolarizationMismatch {
        what: &'static str,
        left: usize,
        right: usize,
    },
}


/// A mergeable result. `merge` must be commutative and associative, and
/// merging a freshly constructed zero value must change nothing.
pub trait Accumulator: Sized {
    /// A zero value with the given polarization count.
    fn zero(polarization_count: usize) -> Self;

    fn merge(&mut self, other: &Self) -> Result<(), MergeError>;
}


/// Serialize a payload body.
pub fn encode<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(value).map_err(|e| CodecError::Encode {
        what,
        reason: e.to_string(),
    })
}

/// Deserialize a payload body received with an explicit length.
pub fn decode<T: DeserializeOwned>(what: &'static str, bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(|e| CodecError::Decode {
        what,
        reason: e.to_string(),
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_garbage_fails() {
        let result: Result<BandInfo, _> = decode("band", &[0xff, 0x01]);
        match result {
            Err(CodecError::Decode { what, .. }) => assert_eq!(what, "band"),
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn encode_then_decode_antenna_list() {
        let antennas = vec![AntennaInfo::new(0, "CS001HBA0", "CS001"), AntennaInfo::new(1, "CS002HBA0", "CS002")];
        let bytes = encode("antennas", &antennas).unwrap();
        let back: Vec<AntennaInfo> = decode("antennas", &bytes).unwrap();
        assert_eq!(back, antennas);
    }
}
