use crate::config::OnsetConfig;
use crate::dsp::beat::BandBins;
use crate::{BeatlightError, Result};

const GAIN_LEVEL_SMOOTHING: f32 = 0.95;
const GAIN_SMOOTHING: f32 = 0.9;
const GAIN_MIN_LEVEL: f32 = 0.01;
const PEAK_SMOOTHING: f32 = 0.9;

/// Single-band onset detector.
///
/// Tracks the energy of one low-frequency band over a rolling window and
/// reports a beat on the rising edge of `energy > mean + k·σ`. An auto-gain
/// estimate is derived alongside and exposed for consumers; it is not fed
/// back into detection.
#[derive(Debug, Clone)]
pub struct OnsetDetector {
    bins: BandBins,
    sensitivity: f32,
    target_level: f32,
    gain_min: f32,
    gain_max: f32,
    history: Vec<f32>,
    index: usize,
    filled: usize,
    energy: f32,
    mean: f32,
    variance: f32,
    above: bool,
    avg_level: f32,
    auto_gain: f32,
    rms: f32,
    peak_level: f32,
}

impl OnsetDetector {
    pub fn new(config: &OnsetConfig, sample_rate_hz: u32, frame_size: usize) -> Result<Self> {
        if config.history_len < 2 {
            return Err(BeatlightError::InvalidInput(
                "onset detector history must hold at least two frames",
            ));
        }
        Ok(Self {
            bins: BandBins::from_range(config.band, sample_rate_hz, frame_size),
            sensitivity: config.sensitivity,
            target_level: config.target_level,
            gain_min: config.gain_min,
            gain_max: config.gain_max,
            history: vec![0.0; config.history_len],
            index: 0,
            filled: 0,
            energy: 0.0,
            mean: 0.0,
            variance: 0.0,
            above: false,
            avg_level: 0.0,
            auto_gain: 1.0,
            rms: 0.0,
            peak_level: 0.0,
        })
    }

    /// Processes one frame given its spectrum and the samples it came from.
    pub fn process(&mut self, spectrum: &[f32], samples: &[f32]) -> bool {
        let energy = self.bins.average(spectrum);
        self.update_levels(samples);
        self.update_auto_gain(energy);
        self.detect(energy)
    }

    /// Edge-triggered statistical decision on a precomputed band energy.
    ///
    /// The window includes the current frame. Only the transition into the
    /// "above threshold" state reports a beat.
    pub fn detect(&mut self, energy: f32) -> bool {
        self.energy = energy;
        self.history[self.index] = energy;
        self.index = (self.index + 1) % self.history.len();
        self.filled = (self.filled + 1).min(self.history.len());

        let window = &self.history[..self.filled];
        let count = self.filled as f32;
        self.mean = window.iter().sum::<f32>() / count;
        self.variance = window
            .iter()
            .map(|e| {
                let diff = e - self.mean;
                diff * diff
            })
            .sum::<f32>()
            / count;

        let threshold = self.mean + self.sensitivity * self.variance.sqrt();
        let above = energy > threshold;
        let beat = above && !self.above;
        self.above = above;
        beat
    }

    fn update_levels(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        self.rms = (sum_sq / samples.len() as f32).sqrt();
        let peak = samples.iter().fold(0.0_f32, |acc, s| acc.max(s.abs()));
        self.peak_level = self.peak_level * PEAK_SMOOTHING + peak * (1.0 - PEAK_SMOOTHING);
    }

    fn update_auto_gain(&mut self, level: f32) {
        self.avg_level =
            self.avg_level * GAIN_LEVEL_SMOOTHING + level * (1.0 - GAIN_LEVEL_SMOOTHING);
        if self.avg_level > GAIN_MIN_LEVEL {
            let adjust = (self.target_level / self.avg_level).clamp(self.gain_min, self.gain_max);
            self.auto_gain = self.auto_gain * GAIN_SMOOTHING + adjust * (1.0 - GAIN_SMOOTHING);
        }
    }

    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|e| *e = 0.0);
        self.index = 0;
        self.filled = 0;
        self.energy = 0.0;
        self.mean = 0.0;
        self.variance = 0.0;
        self.above = false;
        self.avg_level = 0.0;
        self.auto_gain = 1.0;
        self.rms = 0.0;
        self.peak_level = 0.0;
    }

    pub fn bins(&self) -> BandBins {
        self.bins
    }

    pub fn energy(&self) -> f32 {
        self.energy
    }

    pub fn mean(&self) -> f32 {
        self.mean
    }

    pub fn variance(&self) -> f32 {
        self.variance
    }

    /// Smoothed correction factor towards the target level, within the
    /// configured bounds.
    pub fn auto_gain(&self) -> f32 {
        self.auto_gain
    }

    pub fn rms(&self) -> f32 {
        self.rms
    }

    pub fn peak_level(&self) -> f32 {
        self.peak_level
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn detector() -> OnsetDetector {
        OnsetDetector::new(&OnsetConfig::default(), 10_000, 512).unwrap()
    }

    #[test]
    fn fires_once_per_rising_edge() {
        let mut detector = detector();
        let mut beats = Vec::new();
        for _ in 0..20 {
            beats.push(detector.detect(1.0));
        }
        beats.push(detector.detect(10.0));
        beats.push(detector.detect(10.0));
        beats.push(detector.detect(10.0));
        assert!(beats[..20].iter().all(|b| !b));
        assert_eq!(&beats[20..], &[true, false, false]);
    }

    #[test]
    fn re_fires_after_falling_back() {
        let mut detector = detector();
        let mut count = 0;
        for i in 0..120 {
            let energy = if i % 20 == 19 { 8.0 } else { 1.0 };
            if detector.detect(energy) {
                count += 1;
            }
        }
        assert_eq!(count, 6);
    }

    #[test]
    fn steady_signal_never_fires() {
        let mut detector = detector();
        assert!((0..100).all(|_| !detector.detect(3.0)));
        assert_abs_diff_eq!(detector.variance(), 0.0);
    }

    #[test]
    fn auto_gain_stays_within_bounds() {
        let mut loud = detector();
        let mut quiet = detector();
        for _ in 0..500 {
            loud.update_auto_gain(50.0);
            quiet.update_auto_gain(0.05);
        }
        assert_abs_diff_eq!(loud.auto_gain(), 0.5, epsilon = 1e-3);
        assert_abs_diff_eq!(quiet.auto_gain(), 2.0, epsilon = 1e-3);
    }

    #[test]
    fn silence_leaves_gain_untouched() {
        let mut detector = detector();
        for _ in 0..50 {
            detector.update_auto_gain(0.0);
        }
        assert_eq!(detector.auto_gain(), 1.0);
    }

    #[test]
    fn tracks_rms_and_peak() {
        let mut detector = detector();
        let samples = [0.5, -0.5, 0.5, -0.5];
        let spectrum = vec![0.0; 256];
        detector.process(&spectrum, &samples);
        assert_abs_diff_eq!(detector.rms(), 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(detector.peak_level(), 0.05, epsilon = 1e-6);
    }
}
