use num_complex::Complex32;
use serde::{Deserialize, Serialize};


/// One visibility row of a shard together with the metadata the grid
/// assembler needs to place it.
///
/// Samples are stored channel-major: `samples[channel * polarization_count + polarization]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowData {
    pub antenna1: u32,
    pub antenna2: u32,
    pub time: f64,
    /// Timestep slot this row occupies within the current batch.
    pub time_offset_index: usize,
    pub u: f64,
    pub v: f64,
    pub w: f64,
    pub polarization_count: usize,
    pub channel_count: usize,
    pub samples: Vec<Complex32>,
}

impl RowData {
    pub fn new(polarization_count: usize, channel_count: usize) -> RowData {
        RowData {
            antenna1: 0,
            antenna2: 0,
            time: 0.0,
            time_offset_index: 0,
            u: 0.0,
            v: 0.0,
            w: 0.0,
            polarization_count,
            channel_count,
            samples: vec![Complex32::new(0.0, 0.0); polarization_count * channel_count],
        }
    }

    pub fn sample(&self, channel: usize, polarization: usize) -> Complex32 {
        self.samples[channel * self.polarization_count + polarization]
    }

    pub fn set_sample(&mut self, channel: usize, polarization: usize, value: Complex32) {
        self.samples[channel * self.polarization_count + polarization] = value;
    }

    /// Whether `samples` holds exactly one value per channel and polarization.
    pub fn is_consistent(&self) -> bool {
        self.samples.len() == self.polarization_count * self.channel_count
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_layout_is_channel_major() {
        let mut row = RowData::new(2, 3);
        row.set_sample(1, 1, Complex32::new(4.0, -1.0));
        assert_eq!(row.samples[3], Complex32::new(4.0, -1.0));
        assert_eq!(row.sample(1, 1), Complex32::new(4.0, -1.0));
        assert!(row.is_consistent());
    }

    #[test]
    fn inconsistent_row_is_detected() {
        let mut row = RowData::new(4, 2);
        row.samples.pop();
        assert!(!row.is_consistent());
    }
}
