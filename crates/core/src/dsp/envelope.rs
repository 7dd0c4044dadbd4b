use crate::config::EnvelopeConfig;

/// Fast/slow envelope onset detector.
///
/// Two exponential moving averages follow the signal level. Their
/// normalised difference (`lift`) is scale invariant, so the thresholds
/// do not depend on input gain. Hysteresis between the rise and fall
/// thresholds plus a refractory period keep one hit from firing twice.
#[derive(Debug, Clone)]
pub struct LevelPeakDetector {
    a_fast: f32,
    a_slow: f32,
    rise_threshold: f32,
    fall_threshold: f32,
    denom_eps: f32,
    level_clip: f32,
    min_frames: u32,
    fast: f32,
    slow: f32,
    lift: f32,
    armed: bool,
    since_last: u32,
}

impl LevelPeakDetector {
    /// `hop_samples` is the number of samples covered by one call to
    /// [`process_block`](Self::process_block) or
    /// [`process_level`](Self::process_level).
    pub fn new(config: &EnvelopeConfig, sample_rate_hz: u32, hop_samples: usize) -> Self {
        let dt = if sample_rate_hz > 0 && hop_samples > 0 {
            hop_samples as f32 / sample_rate_hz as f32
        } else {
            0.001
        };
        let min_frames = (config.min_interval_ms as f32 * 1e-3 / dt).max(1.0) as u32;

        let mut detector = Self {
            a_fast: one_minus_exp(-dt / (config.fast_tau_ms * 1e-3)),
            a_slow: one_minus_exp(-dt / (config.slow_tau_ms * 1e-3)),
            rise_threshold: config.rise_threshold,
            fall_threshold: config.fall_threshold,
            denom_eps: config.denom_eps,
            level_clip: config.level_clip,
            min_frames,
            fast: 0.0,
            slow: 0.0,
            lift: 0.0,
            armed: true,
            since_last: 0,
        };
        detector.reset(0.0);
        detector
    }

    /// Seeds both envelopes with `seed_level` and re-arms the trigger. The
    /// refractory window starts out elapsed.
    pub fn reset(&mut self, seed_level: f32) {
        let seed = seed_level.max(0.0);
        self.fast = seed;
        self.slow = seed;
        self.lift = 0.0;
        self.armed = true;
        self.since_last = self.min_frames;
    }

    /// Feeds a block of mono samples, using their mean absolute value as
    /// the level.
    pub fn process_block(&mut self, samples: &[f32]) -> bool {
        let level = if samples.is_empty() {
            0.0
        } else {
            samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32
        };
        self.process_level(level)
    }

    /// Feeds a precomputed level and returns whether a beat fired.
    pub fn process_level(&mut self, level: f32) -> bool {
        let level = level.min(self.level_clip);

        self.fast += self.a_fast * (level - self.fast);
        self.slow += self.a_slow * (level - self.slow);
        self.lift = ((self.fast - self.slow) / (self.slow + self.denom_eps)).max(0.0);
        self.since_last = self.since_last.saturating_add(1);

        if self.armed {
            if self.lift >= self.rise_threshold && self.since_last >= self.min_frames {
                self.armed = false;
                self.since_last = 0;
                return true;
            }
        } else if self.lift <= self.fall_threshold {
            self.armed = true;
        }
        false
    }

    pub fn fast(&self) -> f32 {
        self.fast
    }

    pub fn slow(&self) -> f32 {
        self.slow
    }

    /// Normalised lift `(fast - slow) / slow`, floored at zero.
    pub fn lift(&self) -> f32 {
        self.lift
    }

    pub fn armed(&self) -> bool {
        self.armed
    }

    pub fn refractory_frames(&self) -> u32 {
        self.min_frames
    }
}

/// `1 - e^x` for `x <= 0`, linearised near zero.
fn one_minus_exp(x: f32) -> f32 {
    if x > -1e-4 {
        return -x;
    }
    (1.0 - x.exp()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn detector() -> LevelPeakDetector {
        LevelPeakDetector::new(&EnvelopeConfig::default(), 10_000, 512)
    }

    #[test]
    fn step_fires_once() {
        let mut detector = detector();
        let beats: Vec<bool> = (0..30).map(|_| detector.process_level(1.0)).collect();
        assert!(beats[0]);
        assert!(beats[1..].iter().all(|b| !b));
        assert!(detector.armed());
        assert_abs_diff_eq!(detector.slow(), 1.0, epsilon = 1e-3);
    }

    #[test]
    fn silence_then_step_fires_again() {
        let mut detector = detector();
        for _ in 0..30 {
            detector.process_level(1.0);
        }
        assert!((0..40).all(|_| !detector.process_level(0.0)));
        assert_eq!(detector.lift(), 0.0);
        assert!(detector.process_level(1.0));
    }

    #[test]
    fn refractory_period_spaces_beats() {
        let config = EnvelopeConfig {
            min_interval_ms: 500,
            ..EnvelopeConfig::default()
        };
        let mut detector = LevelPeakDetector::new(&config, 10_000, 512);
        assert_eq!(detector.refractory_frames(), 9);

        let beats: Vec<usize> = (0..60)
            .filter(|i| detector.process_level(if i % 2 == 0 { 1.0 } else { 0.0 }))
            .collect();
        assert!(beats.len() >= 2, "beats at {beats:?}");
        for pair in beats.windows(2) {
            assert!(pair[1] - pair[0] >= 9, "beats at {beats:?}");
        }
    }

    #[test]
    fn block_level_is_mean_absolute_value() {
        let mut a = detector();
        let mut b = detector();
        a.process_block(&[0.5, -0.5, 1.0, -1.0]);
        b.process_level(0.75);
        assert_eq!(a.fast(), b.fast());
        assert_eq!(a.slow(), b.slow());
    }

    #[test]
    fn clips_extreme_levels() {
        let mut detector = detector();
        detector.process_level(1_000.0);
        assert!(detector.fast() <= 10.0);
    }

    #[test]
    fn linearises_small_exponents() {
        assert_eq!(one_minus_exp(-1e-5), 1e-5);
        assert_abs_diff_eq!(one_minus_exp(-1.0), 0.632_120_6, epsilon = 1e-6);
    }
}
