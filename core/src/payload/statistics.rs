//! Quality statistics and histogram accumulators.
//!
//! Both collections are indexed per polarization and merge by plain
//! element-wise addition, which keeps `merge` commutative and associative.
//! How the individual sums are computed from visibilities is the business
//! of whoever fills them; the coordinator only ships and merges them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Accumulator, MergeError};


// ---------------------------------------------------------------------------
// StatisticsSample
// ---------------------------------------------------------------------------

/// Running sums for one timestep, baseline or frequency bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSample {
    pub count: Vec<u64>,
    pub rfi_count: Vec<u64>,
    pub sum_real: Vec<f64>,
    pub sum_imag: Vec<f64>,
    pub sum_squares: Vec<f64>,
}

impl StatisticsSample {
    pub fn zero(polarization_count: usize) -> StatisticsSample {
        StatisticsSample {
            count: vec![0; polarization_count],
            rfi_count: vec![0; polarization_count],
            sum_real: vec![0.0; polarization_count],
            sum_imag: vec![0.0; polarization_count],
            sum_squares: vec![0.0; polarization_count],
        }
    }

    pub fn polarization_count(&self) -> usize {
        self.count.len()
    }

    /// Account for one visibility in the given polarization.
    pub fn add_value(&mut self, polarization: usize, real: f64, imag: f64, is_rfi: bool) {
        if is_rfi {
            self.rfi_count[polarization] += 1;
        } else {
            self.count[polarization] += 1;
            self.sum_real[polarization] += real;
            self.sum_imag[polarization] += imag;
            self.sum_squares[polarization] += real * real + imag * imag;
        }
    }

    /// Every per-polarization vector must hold exactly `polarization_count`
    /// entries.
    fn check(&self, polarization_count: usize) -> Result<(), MergeError> {
        let lengths = [
            self.count.len(),
            self.rfi_count.len(),
            self.sum_real.len(),
            self.sum_imag.len(),
            self.sum_squares.len(),
        ];
        match lengths.into_iter().find(|&len| len != polarization_count) {
            Some(len) => Err(MergeError::PolarizationMismatch {
                what: "statistics sample",
                left: len,
                right: polarization_count,
            }),
            None => Ok(()),
        }
    }

    /// Both sides must have passed `check` with the same count.
    fn add(&mut self, other: &StatisticsSample) {
        add_all(&mut self.count, &other.count);
        add_all(&mut self.rfi_count, &other.rfi_count);
        add_all(&mut self.sum_real, &other.sum_real);
        add_all(&mut self.sum_imag, &other.sum_imag);
        add_all(&mut self.sum_squares, &other.sum_squares);
    }
}

fn add_all<T: Copy + std::ops::AddAssign>(into: &mut [T], from: &[T]) {
    for (a, b) in into.iter_mut().zip(from) {
        *a += *b;
    }
}


// ---------------------------------------------------------------------------
// StatisticsCollection
// ---------------------------------------------------------------------------

/// Per-timestep, per-baseline and per-frequency statistics of one or more
/// shards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsCollection {
    polarization_count: usize,
    /// Keyed by observation time in whole milliseconds.
    timestep: BTreeMap<u64, StatisticsSample>,
    #[serde(with = "entries")]
    baseline: BTreeMap<(u32, u32), StatisticsSample>,
    /// Keyed by channel centre frequency in whole hertz.
    frequency: BTreeMap<u64, StatisticsSample>,
}

impl StatisticsCollection {
    pub fn new(polarization_count: usize) -> StatisticsCollection {
        StatisticsCollection {
            polarization_count,
            timestep: BTreeMap::new(),
            baseline: BTreeMap::new(),
            frequency: BTreeMap::new(),
        }
    }

    pub fn polarization_count(&self) -> usize {
        self.polarization_count
    }

    pub fn is_empty(&self) -> bool {
        self.timestep.is_empty() && self.baseline.is_empty() && self.frequency.is_empty()
    }

    pub fn timestep_mut(&mut self, time_ms: u64) -> &mut StatisticsSample {
        let n = self.polarization_count;
        self.timestep.entry(time_ms).or_insert_with(|| StatisticsSample::zero(n))
    }

    pub fn baseline_mut(&mut self, antenna1: u32, antenna2: u32) -> &mut StatisticsSample {
        let n = self.polarization_count;
        self.baseline
            .entry((antenna1, antenna2))
            .or_insert_with(|| StatisticsSample::zero(n))
    }

    pub fn frequency_mut(&mut self, frequency_hz: u64) -> &mut StatisticsSample {
        let n = self.polarization_count;
        self.frequency.entry(frequency_hz).or_insert_with(|| StatisticsSample::zero(n))
    }

    pub fn baseline(&self, antenna1: u32, antenna2: u32) -> Option<&StatisticsSample> {
        self.baseline.get(&(antenna1, antenna2))
    }

    pub fn baseline_count(&self) -> usize {
        self.baseline.len()
    }

    /// Fails when any sample disagrees with the collection's polarization
    /// count, as can happen with a payload decoded from a foreign node.
    pub fn validate(&self) -> Result<(), MergeError> {
        self.timestep
            .values()
            .chain(self.baseline.values())
            .chain(self.frequency.values())
            .try_for_each(|sample| sample.check(self.polarization_count))
    }

    /// Sum over all baselines.
    pub fn total(&self) -> StatisticsSample {
        let mut total = StatisticsSample::zero(self.polarization_count);
        for sample in self.baseline.values() {
            total.add(sample);
        }
        total
    }
}

impl Accumulator for StatisticsCollection {
    fn zero(polarization_count: usize) -> Self {
        StatisticsCollection::new(polarization_count)
    }

    fn merge(&mut self, other: &Self) -> Result<(), MergeError> {
        if self.polarization_count != other.polarization_count {
            return Err(MergeError::PolarizationMismatch {
                what: "statistics",
                left: other.polarization_count,
                right: self.polarization_count,
            });
        }
        self.validate()?;
        other.validate()?;
        merge_maps(&mut self.timestep, &other.timestep);
        merge_maps(&mut self.baseline, &other.baseline);
        merge_maps(&mut self.frequency, &other.frequency);
        Ok(())
    }
}

fn merge_maps<K: Ord + Clone>(
    into: &mut BTreeMap<K, StatisticsSample>,
    from: &BTreeMap<K, StatisticsSample>,
) {
    for (key, sample) in from {
        match into.get_mut(key) {
            Some(existing) => existing.add(sample),
            None => {
                into.insert(key.clone(), sample.clone());
            }
        }
    }
}


// ---------------------------------------------------------------------------
// HistogramCollection
// ---------------------------------------------------------------------------

/// Log-binned amplitude histograms per polarization, for all data and for
/// data flagged as RFI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramCollection {
    polarization_count: usize,
    total: Vec<BTreeMap<i32, u64>>,
    rfi: Vec<BTreeMap<i32, u64>>,
}

impl HistogramCollection {
    pub fn new(polarization_count: usize) -> HistogramCollection {
        HistogramCollection {
            polarization_count,
            total: vec![BTreeMap::new(); polarization_count],
            rfi: vec![BTreeMap::new(); polarization_count],
        }
    }

    pub fn polarization_count(&self) -> usize {
        self.polarization_count
    }

    /// Fails unless there is one total and one RFI histogram per
    /// polarization.
    pub fn validate(&self) -> Result<(), MergeError> {
        for len in [self.total.len(), self.rfi.len()] {
            if len != self.polarization_count {
                return Err(MergeError::PolarizationMismatch {
                    what: "histograms",
                    left: len,
                    right: self.polarization_count,
                });
            }
        }
        Ok(())
    }

    /// Bin index of an amplitude: tenths of a decade. Zero or negative
    /// amplitudes fall into `i32::MIN`.
    pub fn bin_of(amplitude: f64) -> i32 {
        if amplitude > 0.0 {
            (amplitude.log10() * 10.0).floor() as i32
        } else {
            i32::MIN
        }
    }

    pub fn add_amplitude(&mut self, polarization: usize, amplitude: f64, is_rfi: bool) {
        let bin = Self::bin_of(amplitude);
        *self.total[polarization].entry(bin).or_insert(0) += 1;
        if is_rfi {
            *self.rfi[polarization].entry(bin).or_insert(0) += 1;
        }
    }

    pub fn total_count(&self, polarization: usize) -> u64 {
        self.total[polarization].values().sum()
    }

    pub fn rfi_count(&self, polarization: usize) -> u64 {
        self.rfi[polarization].values().sum()
    }

    /// Remove the RFI contribution from the total histograms.
    pub fn remove_rfi_from_total(&mut self) {
        for (total, rfi) in self.total.iter_mut().zip(&self.rfi) {
            for (bin, count) in rfi {
                if let Some(t) = total.get_mut(bin) {
                    *t = t.saturating_sub(*count);
                }
            }
            total.retain(|_, c| *c != 0);
        }
    }
}

impl Accumulator for HistogramCollection {
    fn zero(polarization_count: usize) -> Self {
        HistogramCollection::new(polarization_count)
    }

    fn merge(&mut self, other: &Self) -> Result<(), MergeError> {
        if self.polarization_count != other.polarization_count {
            return Err(MergeError::PolarizationMismatch {
                what: "histograms",
                left: other.polarization_count,
                right: self.polarization_count,
            });
        }
        self.validate()?;
        other.validate()?;
        for (into, from) in self.total.iter_mut().zip(&other.total) {
            merge_bins(into, from);
        }
        for (into, from) in self.rfi.iter_mut().zip(&other.rfi) {
            merge_bins(into, from);
        }
        Ok(())
    }
}


fn merge_bins(into: &mut BTreeMap<i32, u64>, from: &BTreeMap<i32, u64>) {
    for (bin, count) in from {
        *into.entry(*bin).or_insert(0) += count;
    }
}


// ---------------------------------------------------------------------------
// QualityTables
// ---------------------------------------------------------------------------

/// Response body of a `ReadQualityTables` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityTables {
    pub statistics: StatisticsCollection,
    pub histograms: HistogramCollection,
}

impl QualityTables {
    pub fn new(polarization_count: usize) -> QualityTables {
        QualityTables {
            statistics: StatisticsCollection::new(polarization_count),
            histograms: HistogramCollection::new(polarization_count),
        }
    }

    pub fn validate(&self) -> Result<(), MergeError> {
        self.statistics.validate()?;
        self.histograms.validate()
    }
}


/// Serialize a map with non-string keys as a sequence of pairs so that it
/// survives JSON as well as bincode.
mod entries {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, K, V>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        K: Serialize,
        V: Serialize,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D, K, V>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        D: Deserializer<'de>,
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
    {
        let pairs: Vec<(K, V)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(seed: u32) -> StatisticsCollection {
        let mut s = StatisticsCollection::new(2);
        s.baseline_mut(0, seed).add_value(0, seed as f64, 1.0, false);
        s.baseline_mut(0, 1).add_value(1, 2.0, seed as f64, seed % 2 == 0);
        s.timestep_mut(1000 * seed as u64).add_value(0, 1.0, 1.0, false);
        s.frequency_mut(150_000_000).add_value(1, 3.0, 0.0, false);
        s
    }

    #[test]
    fn merge_is_commutative() {
        let mut ab = stats(1);
        ab.merge(&stats(2)).unwrap();
        let mut ba = stats(2);
        ba.merge(&stats(1)).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn merge_is_associative() {
        let (a, b, c) = (stats(1), stats(2), stats(3));

        let mut left = a.clone();
        left.merge(&b).unwrap();
        left.merge(&c).unwrap();

        let mut bc = b.clone();
        bc.merge(&c).unwrap();
        let mut right = a.clone();
        right.merge(&bc).unwrap();

        assert_eq!(left, right);
    }

    #[test]
    fn merging_zero_is_a_no_op() {
        let mut s = stats(5);
        s.merge(&StatisticsCollection::zero(2)).unwrap();
        assert_eq!(s, stats(5));

        let mut z = StatisticsCollection::zero(2);
        z.merge(&stats(5)).unwrap();
        assert_eq!(z, stats(5));
    }

    #[test]
    fn merge_rejects_polarization_mismatch() {
        let mut s = StatisticsCollection::new(4);
        let err = s.merge(&StatisticsCollection::new(2)).unwrap_err();
        assert_eq!(
            err,
            MergeError::PolarizationMismatch { what: "statistics", left: 2, right: 4 }
        );
    }

    #[test]
    fn total_sums_baselines() {
        let mut s = StatisticsCollection::new(1);
        s.baseline_mut(0, 1).add_value(0, 1.0, 0.0, false);
        s.baseline_mut(1, 2).add_value(0, 2.0, 0.0, false);
        s.baseline_mut(1, 2).add_value(0, 9.0, 0.0, true);
        let total = s.total();
        assert_eq!(total.count[0], 2);
        assert_eq!(total.rfi_count[0], 1);
        assert_eq!(total.sum_real[0], 3.0);
    }

    #[test]
    fn statistics_survive_json() {
        let s = stats(3);
        let json = serde_json::to_string(&s).unwrap();
        let back: StatisticsCollection = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn histogram_merge_and_zero() {
        let mut a = HistogramCollection::new(1);
        a.add_amplitude(0, 10.0, false);
        a.add_amplitude(0, 100.0, true);
        let mut b = HistogramCollection::new(1);
        b.add_amplitude(0, 10.0, true);

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.total_count(0), 3);
        assert_eq!(ab.rfi_count(0), 2);

        let before = ab.clone();
        ab.merge(&HistogramCollection::zero(1)).unwrap();
        assert_eq!(ab, before);
    }

    #[test]
    fn histogram_polarization_mismatch() {
        let mut a = HistogramCollection::new(1);
        assert!(a.merge(&HistogramCollection::new(4)).is_err());
    }

    /// Two polarizations declared, one histogram of each kind present.
    fn short_histograms() -> HistogramCollection {
        serde_json::from_str(r#"{"polarization_count":2,"total":[{}],"rfi":[{}]}"#).unwrap()
    }

    #[test]
    fn histogram_merge_rejects_short_vectors() {
        let mut full = HistogramCollection::new(2);
        full.add_amplitude(1, 10.0, true);

        let mut short = short_histograms();
        let err = short.merge(&full).unwrap_err();
        assert_eq!(err, MergeError::PolarizationMismatch { what: "histograms", left: 1, right: 2 });
        assert_eq!(short, short_histograms());

        let before = full.clone();
        assert!(full.merge(&short_histograms()).is_err());
        assert_eq!(full, before);
    }

    #[test]
    fn histogram_merge_rejects_short_rfi() {
        let bad: HistogramCollection =
            serde_json::from_str(r#"{"polarization_count":2,"total":[{},{}],"rfi":[{}]}"#).unwrap();
        assert!(bad.validate().is_err());
        assert!(HistogramCollection::new(2).merge(&bad).is_err());
    }

    #[test]
    fn statistics_merge_rejects_short_samples() {
        let mut bad = stats(1);
        bad.baseline_mut(3, 4).count.pop();
        let err = bad.validate().unwrap_err();
        assert_eq!(
            err,
            MergeError::PolarizationMismatch { what: "statistics sample", left: 1, right: 2 }
        );

        let mut good = stats(2);
        let before = good.clone();
        assert!(good.merge(&bad).is_err());
        assert_eq!(good, before);

        let mut bad_self = bad.clone();
        assert!(bad_self.merge(&stats(2)).is_err());
        assert_eq!(bad_self, bad);
    }

    #[test]
    fn statistics_merge_rejects_long_samples() {
        let mut bad = stats(1);
        bad.timestep_mut(1000).sum_squares.push(1.0);
        assert!(stats(2).merge(&bad).is_err());
        assert!(QualityTables { statistics: bad, histograms: HistogramCollection::new(2) }
            .validate()
            .is_err());
        assert!(QualityTables::new(2).validate().is_ok());
    }

    #[test]
    fn remove_rfi_from_total() {
        let mut h = HistogramCollection::new(1);
        h.add_amplitude(0, 10.0, false);
        h.add_amplitude(0, 10.0, true);
        h.add_amplitude(0, 1000.0, true);
        h.remove_rfi_from_total();
        assert_eq!(h.total_count(0), 1);
        assert_eq!(h.rfi_count(0), 2);
    }

    #[test]
    fn bins_are_tenths_of_a_decade() {
        assert_eq!(HistogramCollection::bin_of(1.0), 0);
        assert_eq!(HistogramCollection::bin_of(10.0), 10);
        assert_eq!(HistogramCollection::bin_of(0.0), i32::MIN);
    }
}
