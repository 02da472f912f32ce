//! Spectral window description of one shard.

use serde::{Deserialize, Serialize};


#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub frequency_hz: f64,
    pub width_hz: f64,
}

/// The channel list of one shard. Channels are expected in increasing
/// frequency order; the grid assembler rejects anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandInfo {
    pub window_index: u32,
    pub channels: Vec<ChannelInfo>,
}

impl BandInfo {
    /// Build a band from centre frequencies, using the first spacing as the
    /// channel width.
    pub fn from_frequencies(window_index: u32, frequencies_hz: &[f64]) -> BandInfo {
        let width = match frequencies_hz {
            [a, b, ..] => (b - a).abs(),
            _ => 0.0,
        };
        BandInfo {
            window_index,
            channels: frequencies_hz
                .iter()
                .map(|&f| ChannelInfo { frequency_hz: f, width_hz: width })
                .collect(),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn start_frequency(&self) -> Option<f64> {
        self.channels.first().map(|c| c.frequency_hz)
    }

    pub fn end_frequency(&self) -> Option<f64> {
        self.channels.last().map(|c| c.frequency_hz)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_frequencies_sets_width() {
        let band = BandInfo::from_frequencies(3, &[100e6, 100.5e6, 101e6]);
        assert_eq!(band.channel_count(), 3);
        assert_eq!(band.channels[0].width_hz, 0.5e6);
        assert_eq!(band.start_frequency(), Some(100e6));
        assert_eq!(band.end_frequency(), Some(101e6));
    }

    #[test]
    fn empty_band() {
        let band = BandInfo::from_frequencies(0, &[]);
        assert_eq!(band.start_frequency(), None);
        assert_eq!(band.end_frequency(), None);
    }
}
