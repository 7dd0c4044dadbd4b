//! Variance-gated multi-band beat detector.
//!
//! Each band's energy is compared with a threshold derived from that band's
//! own recent history: `energy > (slope · variance + base) · mean`. A noisy
//! band (high variance) gets a lower multiplier and a quiet, steady band a
//! higher one, so no absolute level is ever configured.

use crate::config::{BandRange, DetectorConfig};
use crate::events::BEAT_BANDS;
use crate::{BeatlightError, Result};

/// Half-open range of spectrum bins `[lo, hi)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandBins {
    pub lo: usize,
    pub hi: usize,
}

impl BandBins {
    /// Maps a frequency range onto the `frame_size / 2` bins of a spectrum.
    ///
    /// Indices are clamped to the spectrum and every band keeps at least one
    /// bin.
    pub fn from_range(range: BandRange, sample_rate_hz: u32, frame_size: usize) -> Self {
        let half = frame_size / 2;
        if half == 0 || sample_rate_hz == 0 {
            return Self { lo: 0, hi: 0 };
        }
        let bin_hz = sample_rate_hz as f32 / half as f32;
        let to_bin = |hz: f32| ((hz / bin_hz).floor().max(0.0) as usize).min(half);

        let lo = to_bin(range.lo_hz).min(half - 1);
        let mut hi = to_bin(range.hi_hz);
        if hi <= lo {
            hi = (lo + 1).min(half);
        }
        Self { lo, hi }
    }

    pub fn width(&self) -> usize {
        self.hi.saturating_sub(self.lo)
    }

    /// Mean of the spectrum over this band. NaN bins count as zero.
    pub fn average(&self, spectrum: &[f32]) -> f32 {
        let hi = self.hi.min(spectrum.len());
        if hi <= self.lo {
            return 0.0;
        }
        let sum: f32 = spectrum[self.lo..hi]
            .iter()
            .map(|v| if v.is_nan() { 0.0 } else { *v })
            .sum();
        sum / (hi - self.lo) as f32
    }
}

type Bands = [f32; BEAT_BANDS];
/// Running sums; evicting a loud frame must not leave residue behind.
type Sums = [f64; BEAT_BANDS];

#[derive(Debug, Clone)]
pub struct BeatDetector {
    bins: Vec<BandBins>,
    variance_slope: f32,
    base_multiplier: f32,
    history: Vec<Bands>,
    head: usize,
    count: usize,
    sum: Sums,
    sumsq: Sums,
    energy: Bands,
    mean: Bands,
    variance: Bands,
}

impl BeatDetector {
    pub fn new(config: &DetectorConfig, sample_rate_hz: u32, frame_size: usize) -> Result<Self> {
        if config.bands.is_empty() || config.bands.len() > BEAT_BANDS {
            return Err(BeatlightError::InvalidInput(
                "beat detector needs between one and BEAT_BANDS bands",
            ));
        }
        if config.history_len < 2 {
            return Err(BeatlightError::InvalidInput(
                "beat detector history must hold at least two frames",
            ));
        }

        let bins = config
            .bands
            .iter()
            .map(|band| BandBins::from_range(*band, sample_rate_hz, frame_size))
            .collect::<Vec<_>>();
        tracing::debug!(?bins, sample_rate_hz, frame_size, "beat detector bands");

        Ok(Self {
            bins,
            variance_slope: config.variance_slope,
            base_multiplier: config.base_multiplier,
            history: vec![[0.0; BEAT_BANDS]; config.history_len],
            head: 0,
            count: 0,
            sum: [0.0; BEAT_BANDS],
            sumsq: [0.0; BEAT_BANDS],
            energy: [0.0; BEAT_BANDS],
            mean: [0.0; BEAT_BANDS],
            variance: [0.0; BEAT_BANDS],
        })
    }

    /// Runs the detector on one spectrum. Per-band flags are written to
    /// `flags`; the return value is true if any band fired.
    pub fn process(&mut self, spectrum: &[f32], flags: &mut [bool; BEAT_BANDS]) -> bool {
        let mut energies = [0.0; BEAT_BANDS];
        for (energy, bins) in energies.iter_mut().zip(&self.bins) {
            *energy = bins.average(spectrum);
        }
        self.process_energies(&energies[..self.bins.len()], flags)
    }

    /// Same as [`process`](Self::process) for precomputed band energies.
    ///
    /// The decision uses statistics of earlier frames only; the current
    /// energies enter the history afterwards. Nothing fires before the
    /// history holds at least one frame.
    pub fn process_energies(&mut self, energies: &[f32], flags: &mut [bool; BEAT_BANDS]) -> bool {
        *flags = [false; BEAT_BANDS];
        self.energy = [0.0; BEAT_BANDS];
        let bands = self.bins.len().min(energies.len());
        self.energy[..bands].copy_from_slice(&energies[..bands]);

        if self.count == 0 {
            self.push_history();
            return false;
        }

        let held = self.count as f64;
        let mut any = false;
        for b in 0..bands {
            let mean = self.sum[b] / held;
            let variance = (self.sumsq[b] / held - mean * mean).max(0.0);
            let (mean, variance) = (mean as f32, variance as f32);
            self.mean[b] = mean;
            self.variance[b] = variance;

            let multiplier = self.variance_slope * variance + self.base_multiplier;
            let beat = self.energy[b] > multiplier * mean;
            flags[b] = beat;
            any |= beat;
        }

        self.push_history();
        any
    }

    fn push_history(&mut self) {
        let capacity = self.history.len();
        if self.count == capacity {
            let evicted = self.history[self.head];
            for b in 0..BEAT_BANDS {
                let evicted = f64::from(evicted[b]);
                self.sum[b] -= evicted;
                self.sumsq[b] -= evicted * evicted;
            }
        } else {
            self.count += 1;
        }

        self.history[self.head] = self.energy;
        for b in 0..BEAT_BANDS {
            let energy = f64::from(self.energy[b]);
            self.sum[b] += energy;
            self.sumsq[b] += energy * energy;
        }
        self.head = (self.head + 1) % capacity;
    }

    /// Forgets all history; the next frame is a warm-up frame again.
    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|slot| *slot = [0.0; BEAT_BANDS]);
        self.head = 0;
        self.count = 0;
        self.sum = [0.0; BEAT_BANDS];
        self.sumsq = [0.0; BEAT_BANDS];
        self.energy = [0.0; BEAT_BANDS];
        self.mean = [0.0; BEAT_BANDS];
        self.variance = [0.0; BEAT_BANDS];
    }

    pub fn bins(&self) -> &[BandBins] {
        &self.bins
    }

    pub fn energy(&self) -> &[f32] {
        &self.energy[..self.bins.len()]
    }

    pub fn mean(&self) -> &[f32] {
        &self.mean[..self.bins.len()]
    }

    pub fn variance(&self) -> &[f32] {
        &self.variance[..self.bins.len()]
    }

    /// Number of frames currently held in the history.
    pub fn history_len(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn detector(bands: usize, history_len: usize) -> BeatDetector {
        let mut config = DetectorConfig {
            history_len,
            ..DetectorConfig::default()
        };
        config.bands.truncate(bands);
        BeatDetector::new(&config, 10_000, 512).unwrap()
    }

    #[test]
    fn maps_bands_to_bins() {
        // 10 kHz over 256 bins: 39.0625 Hz per bin.
        let bins = BandBins::from_range(BandRange::new(40.0, 130.0), 10_000, 512);
        assert_eq!(bins, BandBins { lo: 1, hi: 3 });

        let narrow = BandBins::from_range(BandRange::new(41.0, 42.0), 10_000, 512);
        assert_eq!(narrow.width(), 1);

        let beyond = BandBins::from_range(BandRange::new(20_000.0, 30_000.0), 10_000, 512);
        assert_eq!(beyond, BandBins { lo: 255, hi: 256 });
    }

    #[test]
    fn band_average_skips_nan() {
        let bins = BandBins { lo: 1, hi: 3 };
        assert_abs_diff_eq!(bins.average(&[9.0, f32::NAN, 4.0, 9.0]), 2.0);
    }

    #[test]
    fn first_frame_never_fires() {
        let mut detector = detector(1, 20);
        let mut flags = [false; BEAT_BANDS];
        assert!(!detector.process_energies(&[1_000.0], &mut flags));
        assert_eq!(flags, [false; BEAT_BANDS]);
        assert_eq!(detector.history_len(), 1);
    }

    #[test]
    fn fires_on_jump_after_steady_history() {
        let mut detector = detector(1, 20);
        let mut flags = [false; BEAT_BANDS];
        for _ in 0..19 {
            assert!(!detector.process_energies(&[10.0], &mut flags));
        }
        assert!(detector.process_energies(&[16.0], &mut flags));
        assert_eq!(flags, [true, false]);
        assert_abs_diff_eq!(detector.mean()[0], 10.0, epsilon = 1e-6);
        assert_abs_diff_eq!(detector.variance()[0], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn stays_quiet_below_dynamic_threshold() {
        let mut detector = detector(1, 20);
        let mut flags = [false; BEAT_BANDS];
        for _ in 0..19 {
            detector.process_energies(&[10.0], &mut flags);
        }
        // 1.5142857 * 10 = 15.14
        assert!(!detector.process_energies(&[15.0], &mut flags));
    }

    #[test]
    fn noisy_band_lowers_the_multiplier() {
        let mut steady = detector(1, 10);
        let mut noisy = detector(1, 10);
        let mut flags = [false; BEAT_BANDS];
        for i in 0..10 {
            steady.process_energies(&[50.0], &mut flags);
            noisy.process_energies(&[if i % 2 == 0 { 40.0 } else { 60.0 }], &mut flags);
        }
        // Same mean, variance 100 in the noisy band: multiplier 1.257.
        assert!(!steady.process_energies(&[70.0], &mut flags));
        assert!(noisy.process_energies(&[70.0], &mut flags));
    }

    #[test]
    fn running_sums_track_ring_contents() {
        let mut detector = detector(2, 5);
        let mut flags = [false; BEAT_BANDS];
        let inputs: Vec<[f32; 2]> = (0..23).map(|i| [i as f32, (i * i % 7) as f32]).collect();
        for input in &inputs {
            detector.process_energies(input, &mut flags);
        }
        for b in 0..2 {
            let window = inputs[inputs.len() - 5..].iter().map(|e| e[b]);
            let sum: f64 = window.clone().map(f64::from).sum();
            let sumsq: f64 = window.map(|e| f64::from(e) * f64::from(e)).sum();
            assert_abs_diff_eq!(detector.sum[b], sum, epsilon = 1e-9);
            assert_abs_diff_eq!(detector.sumsq[b], sumsq, epsilon = 1e-9);
        }
    }

    #[test]
    fn loud_passage_leaves_no_residue_in_sums() {
        let mut detector = detector(1, 20);
        let mut flags = [false; BEAT_BANDS];
        for i in 0..20 {
            detector.process_energies(&[3_000.0 + i as f32 * 0.37], &mut flags);
        }
        for _ in 0..20 {
            detector.process_energies(&[1.0], &mut flags);
        }
        assert_abs_diff_eq!(detector.sum[0], 20.0, epsilon = 1e-6);
        assert_abs_diff_eq!(detector.sumsq[0], 20.0, epsilon = 1e-6);

        detector.process_energies(&[1.0], &mut flags);
        assert_abs_diff_eq!(detector.mean()[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(detector.variance()[0], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn identical_inputs_give_identical_outputs() {
        let sequence: Vec<[f32; 2]> = (0..200)
            .map(|i| {
                let kick = if i % 12 == 0 { 40.0 } else { 0.0 };
                [10.0 + kick + (i % 5) as f32, 5.0 + (i % 3) as f32]
            })
            .collect();
        let run = || {
            let mut detector = detector(2, 20);
            let mut flags = [false; BEAT_BANDS];
            sequence
                .iter()
                .map(|e| {
                    detector.process_energies(e, &mut flags);
                    flags
                })
                .collect::<Vec<_>>()
        };
        let first = run();
        assert_eq!(first, run());
        assert!(first.iter().any(|f| f[0]));
    }

    #[test]
    fn reset_restarts_warm_up() {
        let mut detector = detector(1, 20);
        let mut flags = [false; BEAT_BANDS];
        for _ in 0..5 {
            detector.process_energies(&[10.0], &mut flags);
        }
        detector.reset();
        assert!(!detector.process_energies(&[100.0], &mut flags));
        assert_eq!(detector.history_len(), 1);
    }

    #[test]
    fn rejects_too_many_bands() {
        let mut config = DetectorConfig::default();
        config.bands.push(BandRange::new(1_000.0, 2_000.0));
        assert!(BeatDetector::new(&config, 10_000, 512).is_err());
    }
}
