//! Row-grid assembly across shards with different frequency bands.
//!
//! Every shard (node index) covers its own slice of the spectrum. Once all
//! bands are known, `initialize` sorts them, derives a common channel
//! resolution and maps each shard's local channels onto one global grid. Row
//! batches are then scattered into (and gathered out of) a dense buffer laid
//! out as `[timestep][global channel][polarization]`.

use num_complex::Complex32;
use thiserror::Error;

use crate::payload::{BandInfo, RowData};


#[derive(Debug, Clone, PartialEq, Error)]
pub enum GridError {
    #[error("timerange has not been initialized")]
    NotInitialized,

    #[error("node {0} is not part of this timerange")]
    UnknownNode(usize),

    #[error("no band information for node {0}")]
    MissingBand(usize),

    #[error("band of node {0} has no channels")]
    EmptyBand(usize),

    #[error("channels of node {node} are not increasing in frequency")]
    NonMonotonic { node: usize },

    #[error("two channels share frequency {frequency_hz} Hz")]
    CoincidentChannels { frequency_hz: f64 },

    #[error("band of node {left} overlaps band of node {right}")]
    BandOverlap { left: usize, right: usize },

    #[error("row for timestep {index} is outside the {count} timesteps of this batch")]
    TimestepOutOfRange { index: usize, count: usize },

    #[error("row of node {node} does not fit the grid: {reason}")]
    RowShape { node: usize, reason: String },
}


// ---------------------------------------------------------------------------
// ObservationTimerange
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ObservationTimerange {
    bands: Vec<Option<BandInfo>>,
    polarization_count: usize,
    timestep_count: usize,
    channel_count: usize,
    resolution_hz: f64,
    /// Per node, global channel index of each local channel.
    lookup: Vec<Vec<usize>>,
    samples: Vec<Complex32>,
    uvw: Vec<[f64; 3]>,
    antenna_pairs: Vec<(u32, u32)>,
    times: Vec<f64>,
    filled: Vec<bool>,
    initialized: bool,
}

impl ObservationTimerange {
    pub fn new(node_count: usize) -> ObservationTimerange {
        ObservationTimerange {
            bands: vec![None; node_count],
            polarization_count: 0,
            timestep_count: 0,
            channel_count: 0,
            resolution_hz: 0.0,
            lookup: Vec::new(),
            samples: Vec::new(),
            uvw: Vec::new(),
            antenna_pairs: Vec::new(),
            times: Vec::new(),
            filled: Vec::new(),
            initialized: false,
        }
    }

    pub fn node_count(&self) -> usize {
        self.bands.len()
    }

    pub fn set_band(&mut self, node: usize, band: BandInfo) -> Result<(), GridError> {
        let slot = self.bands.get_mut(node).ok_or(GridError::UnknownNode(node))?;
        *slot = Some(band);
        self.initialized = false;
        Ok(())
    }

    pub fn band(&self, node: usize) -> Option<&BandInfo> {
        self.bands.get(node).and_then(|b| b.as_ref())
    }

    /// Build the global grid and allocate a zeroed buffer for
    /// `timestep_count` timesteps.
    pub fn initialize(&mut self, polarization_count: usize, timestep_count: usize) -> Result<(), GridError> {
        self.initialized = false;

        let mut order: Vec<(usize, &BandInfo)> = Vec::with_capacity(self.bands.len());
        for (node, band) in self.bands.iter().enumerate() {
            let band = band.as_ref().ok_or(GridError::MissingBand(node))?;
            if band.channels.is_empty() {
                return Err(GridError::EmptyBand(node));
            }
            for pair in band.channels.windows(2) {
                let (a, b) = (pair[0].frequency_hz, pair[1].frequency_hz);
                if a == b {
                    return Err(GridError::CoincidentChannels { frequency_hz: a });
                }
                if b < a {
                    return Err(GridError::NonMonotonic { node });
                }
            }
            order.push((node, band));
        }
        if order.is_empty() {
            return Err(GridError::MissingBand(0));
        }

        order.sort_by(|(_, a), (_, b)| {
            let fa = a.channels[0].frequency_hz;
            let fb = b.channels[0].frequency_hz;
            fa.total_cmp(&fb)
        });
        for pair in order.windows(2) {
            let (left, a) = pair[0];
            let (right, b) = pair[1];
            let a_end = a.channels[a.channels.len() - 1].frequency_hz;
            let b_start = b.channels[0].frequency_hz;
            if a_end > b_start {
                return Err(GridError::BandOverlap { left, right });
            }
            if a_end == b_start {
                return Err(GridError::CoincidentChannels { frequency_hz: a_end });
            }
        }

        let frequencies: Vec<f64> = order
            .iter()
            .flat_map(|(_, band)| band.channels.iter().map(|c| c.frequency_hz))
            .collect();
        let resolution = frequencies
            .windows(2)
            .map(|w| w[1] - w[0])
            .filter(|gap| *gap > 0.0)
            .fold(f64::INFINITY, f64::min);
        let resolution = if resolution.is_finite() {
            resolution
        } else {
            let width = order[0].1.channels[0].width_hz;
            if width > 0.0 { width } else { 1.0 }
        };
        let start = frequencies[0];

        let mut lookup = vec![Vec::new(); self.bands.len()];
        let mut channel_count = 0;
        for (node, band) in &order {
            lookup[*node] = band
                .channels
                .iter()
                .map(|c| ((c.frequency_hz - start) / resolution).round() as usize)
                .collect();
            if let Some(last) = lookup[*node].last() {
                channel_count = channel_count.max(last + 1);
            }
        }

        log::debug!(
            "timerange grid: {} channels at {} Hz resolution, {} timesteps, {} polarizations",
            channel_count,
            resolution,
            timestep_count,
            polarization_count
        );

        self.polarization_count = polarization_count;
        self.timestep_count = timestep_count;
        self.channel_count = channel_count;
        self.resolution_hz = resolution;
        self.lookup = lookup;
        self.samples = vec![Complex32::new(0.0, 0.0); timestep_count * channel_count * polarization_count];
        self.uvw = vec![[0.0; 3]; timestep_count];
        self.antenna_pairs = vec![(0, 0); timestep_count];
        self.times = vec![0.0; timestep_count];
        self.filled = vec![false; timestep_count];
        self.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn timestep_count(&self) -> usize {
        self.timestep_count
    }

    pub fn polarization_count(&self) -> usize {
        self.polarization_count
    }

    pub fn resolution_hz(&self) -> f64 {
        self.resolution_hz
    }

    /// Global index of `node`'s local channel.
    pub fn global_channel(&self, node: usize, local_channel: usize) -> Option<usize> {
        self.lookup.get(node)?.get(local_channel).copied()
    }

    fn index(&self, timestep: usize, channel: usize, polarization: usize) -> usize {
        (timestep * self.channel_count + channel) * self.polarization_count + polarization
    }

    pub fn sample(&self, timestep: usize, channel: usize, polarization: usize) -> Complex32 {
        self.samples[self.index(timestep, channel, polarization)]
    }

    pub fn set_sample(&mut self, timestep: usize, channel: usize, polarization: usize, value: Complex32) {
        let i = self.index(timestep, channel, polarization);
        self.samples[i] = value;
    }

    pub fn uvw(&self, timestep: usize) -> [f64; 3] {
        self.uvw[timestep]
    }

    pub fn antenna_pair(&self, timestep: usize) -> (u32, u32) {
        self.antenna_pairs[timestep]
    }

    pub fn time(&self, timestep: usize) -> f64 {
        self.times[timestep]
    }

    pub fn is_filled(&self, timestep: usize) -> bool {
        self.filled[timestep]
    }

    /// Timesteps no node has written since the last `set_zero`.
    pub fn unfilled_timesteps(&self) -> Vec<usize> {
        self.filled
            .iter()
            .enumerate()
            .filter(|(_, f)| !**f)
            .map(|(t, _)| t)
            .collect()
    }

    /// Clear the buffer between batches.
    pub fn set_zero(&mut self) {
        self.samples.fill(Complex32::new(0.0, 0.0));
        self.uvw.fill([0.0; 3]);
        self.antenna_pairs.fill((0, 0));
        self.times.fill(0.0);
        self.filled.fill(false);
    }

    fn node_lookup(&self, node: usize) -> Result<&[usize], GridError> {
        if !self.initialized {
            return Err(GridError::NotInitialized);
        }
        self.lookup
            .get(node)
            .map(|l| l.as_slice())
            .ok_or(GridError::UnknownNode(node))
    }

    fn check_timestep(&self, index: usize) -> Result<(), GridError> {
        if index >= self.timestep_count {
            return Err(GridError::TimestepOutOfRange { index, count: self.timestep_count });
        }
        Ok(())
    }

    /// Scatter one node's rows into the global buffer. Each row lands in the
    /// timestep given by its `time_offset_index`.
    ///
    /// The whole batch is checked first; on `Err` the buffer is unchanged.
    pub fn set_timestep_data(&mut self, node: usize, rows: &[RowData]) -> Result<(), GridError> {
        let lookup = self.node_lookup(node)?.to_vec();
        for row in rows {
            self.check_timestep(row.time_offset_index)?;
            if !row.is_consistent()
                || row.channel_count != lookup.len()
                || row.polarization_count != self.polarization_count
            {
                return Err(GridError::RowShape {
                    node,
                    reason: format!(
                        "{} channels x {} polarizations, grid expects {} x {}",
                        row.channel_count,
                        row.polarization_count,
                        lookup.len(),
                        self.polarization_count
                    ),
                });
            }
        }
        for row in rows {
            let t = row.time_offset_index;
            for (local, &global) in lookup.iter().enumerate() {
                for p in 0..self.polarization_count {
                    let i = self.index(t, global, p);
                    self.samples[i] = row.sample(local, p);
                }
            }
            self.uvw[t] = [row.u, row.v, row.w];
            self.antenna_pairs[t] = (row.antenna1, row.antenna2);
            self.times[t] = row.time;
            self.filled[t] = true;
        }
        Ok(())
    }

    /// Gather the buffer back into one node's rows, reshaping them to the
    /// node's channel count where needed.
    pub fn get_timestep_data(&self, node: usize, rows: &mut [RowData]) -> Result<(), GridError> {
        let lookup = self.node_lookup(node)?;
        for row in rows.iter_mut() {
            self.check_timestep(row.time_offset_index)?;
            let t = row.time_offset_index;
            row.channel_count = lookup.len();
            row.polarization_count = self.polarization_count;
            row.samples.resize(lookup.len() * self.polarization_count, Complex32::new(0.0, 0.0));
            for (local, &global) in lookup.iter().enumerate() {
                for p in 0..self.polarization_count {
                    row.set_sample(local, p, self.samples[self.index(t, global, p)]);
                }
            }
            let [u, v, w] = self.uvw[t];
            row.u = u;
            row.v = v;
            row.w = w;
            row.antenna1 = self.antenna_pairs[t].0;
            row.antenna2 = self.antenna_pairs[t].1;
            row.time = self.times[t];
        }
        Ok(())
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MHZ: f64 = 1e6;

    fn band(freqs_mhz: &[f64]) -> BandInfo {
        let hz: Vec<f64> = freqs_mhz.iter().map(|f| f * MHZ).collect();
        BandInfo::from_frequencies(0, &hz)
    }

    fn two_node_grid() -> ObservationTimerange {
        let mut tr = ObservationTimerange::new(2);
        tr.set_band(0, band(&[100.0, 101.0, 102.0])).unwrap();
        tr.set_band(1, band(&[103.0, 104.0, 105.0])).unwrap();
        tr
    }

    fn row(t: usize, channels: usize, value: f32) -> RowData {
        let mut r = RowData::new(1, channels);
        r.time_offset_index = t;
        r.antenna1 = 1;
        r.antenna2 = 2;
        r.u = 10.0;
        for c in 0..channels {
            r.set_sample(c, 0, Complex32::new(value + c as f32, 0.0));
        }
        r
    }

    #[test]
    fn bad_row_leaves_batch_unwritten() {
        let mut tr = two_node_grid();
        tr.initialize(1, 3).unwrap();
        let batch = vec![row(0, 3, 1.0), row(1, 2, 1.0), row(2, 3, 1.0)];
        assert!(matches!(tr.set_timestep_data(0, &batch), Err(GridError::RowShape { node: 0, .. })));
        assert_eq!(tr.unfilled_timesteps(), vec![0, 1, 2]);
        assert_eq!(tr.sample(0, 0, 0), Complex32::new(0.0, 0.0));

        let batch = vec![row(0, 3, 1.0), row(7, 3, 1.0)];
        assert!(matches!(
            tr.set_timestep_data(0, &batch),
            Err(GridError::TimestepOutOfRange { index: 7, count: 3 })
        ));
        assert!(!tr.is_filled(0));
    }

    #[test]
    fn adjacent_bands_form_one_grid() {
        let mut tr = two_node_grid();
        tr.initialize(4, 2).unwrap();
        assert_eq!(tr.channel_count(), 6);
        assert_eq!(tr.resolution_hz(), MHZ);
        assert_eq!((0..3).map(|c| tr.global_channel(0, c).unwrap()).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!((0..3).map(|c| tr.global_channel(1, c).unwrap()).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn node_order_follows_frequency_not_index() {
        let mut tr = ObservationTimerange::new(2);
        tr.set_band(0, band(&[103.0, 104.0])).unwrap();
        tr.set_band(1, band(&[100.0, 101.0])).unwrap();
        tr.initialize(1, 1).unwrap();
        assert_eq!(tr.global_channel(1, 0), Some(0));
        assert_eq!(tr.global_channel(0, 0), Some(3));
        assert_eq!(tr.channel_count(), 5);
    }

    #[test]
    fn overlapping_bands_are_rejected() {
        let mut tr = ObservationTimerange::new(2);
        tr.set_band(0, band(&[100.0, 102.0])).unwrap();
        tr.set_band(1, band(&[101.0, 103.0])).unwrap();
        assert_eq!(tr.initialize(1, 1), Err(GridError::BandOverlap { left: 0, right: 1 }));
        assert!(!tr.is_initialized());
    }

    #[test]
    fn coincident_and_non_monotonic_channels() {
        let mut tr = ObservationTimerange::new(1);
        tr.set_band(0, band(&[100.0, 100.0])).unwrap();
        assert!(matches!(tr.initialize(1, 1), Err(GridError::CoincidentChannels { .. })));

        tr.set_band(0, band(&[101.0, 100.0])).unwrap();
        assert_eq!(tr.initialize(1, 1), Err(GridError::NonMonotonic { node: 0 }));

        let mut tr = ObservationTimerange::new(2);
        tr.set_band(0, band(&[100.0, 101.0])).unwrap();
        tr.set_band(1, band(&[101.0, 102.0])).unwrap();
        assert!(matches!(tr.initialize(1, 1), Err(GridError::CoincidentChannels { .. })));
    }

    #[test]
    fn missing_band_is_an_error() {
        let mut tr = ObservationTimerange::new(2);
        tr.set_band(0, band(&[100.0])).unwrap();
        assert_eq!(tr.initialize(1, 1), Err(GridError::MissingBand(1)));
        assert_eq!(tr.set_band(5, band(&[1.0])), Err(GridError::UnknownNode(5)));
    }

    #[test]
    fn gap_between_bands_uses_finest_spacing() {
        let mut tr = ObservationTimerange::new(2);
        tr.set_band(0, band(&[100.0, 100.5])).unwrap();
        tr.set_band(1, band(&[102.0, 102.5])).unwrap();
        tr.initialize(1, 1).unwrap();
        assert_eq!(tr.resolution_hz(), 0.5 * MHZ);
        assert_eq!(tr.global_channel(1, 0), Some(4));
        assert_eq!(tr.channel_count(), 6);
    }

    #[test]
    fn single_channel_uses_width() {
        let mut tr = ObservationTimerange::new(1);
        tr.set_band(0, band(&[100.0])).unwrap();
        tr.initialize(2, 3).unwrap();
        assert_eq!(tr.channel_count(), 1);
        assert_eq!(tr.resolution_hz(), 1.0);
    }

    #[test]
    fn scatter_places_samples_by_lookup() {
        let mut tr = two_node_grid();
        tr.initialize(1, 2).unwrap();
        assert_eq!(tr.unfilled_timesteps(), vec![0, 1]);
        tr.set_timestep_data(1, &[row(1, 3, 5.0)]).unwrap();
        assert_eq!(tr.sample(1, 3, 0), Complex32::new(5.0, 0.0));
        assert_eq!(tr.sample(1, 5, 0), Complex32::new(7.0, 0.0));
        assert_eq!(tr.sample(1, 0, 0), Complex32::new(0.0, 0.0));
        assert_eq!(tr.antenna_pair(1), (1, 2));
        assert_eq!(tr.uvw(1), [10.0, 0.0, 0.0]);
        assert_eq!(tr.unfilled_timesteps(), vec![0]);
    }

    #[test]
    fn gather_is_inverse_of_scatter() {
        let mut tr = two_node_grid();
        tr.initialize(1, 1).unwrap();
        let original = row(0, 3, 2.0);
        tr.set_timestep_data(0, std::slice::from_ref(&original)).unwrap();
        let mut back = RowData::new(1, 3);
        tr.get_timestep_data(0, std::slice::from_mut(&mut back)).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn set_zero_clears_previous_batch() {
        let mut tr = two_node_grid();
        tr.initialize(1, 1).unwrap();
        tr.set_timestep_data(0, &[row(0, 3, 9.0)]).unwrap();
        tr.set_zero();
        assert_eq!(tr.sample(0, 0, 0), Complex32::new(0.0, 0.0));
        assert!(!tr.is_filled(0));
    }

    #[test]
    fn rows_outside_batch_or_wrong_shape_fail() {
        let mut tr = two_node_grid();
        assert_eq!(tr.set_timestep_data(0, &[row(0, 3, 1.0)]), Err(GridError::NotInitialized));
        tr.initialize(1, 2).unwrap();
        assert!(matches!(
            tr.set_timestep_data(0, &[row(2, 3, 1.0)]),
            Err(GridError::TimestepOutOfRange { index: 2, count: 2 })
        ));
        assert!(matches!(
            tr.set_timestep_data(0, &[row(0, 2, 1.0)]),
            Err(GridError::RowShape { node: 0, .. })
        ));
    }
}
