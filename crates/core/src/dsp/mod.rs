//! Signal chain from a DC-corrected frame to beat flags.
//!
//! Every frame runs through the low-pass [`LowPassFilter`], then (for the
//! spectral detectors) the [`SpectrumAnalyzer`], and finally one of the beat
//! detectors. The detectors are wrapped as [`BeatStrategy`] implementations
//! so the processing stage can pick one from configuration.

pub mod beat;
pub mod envelope;
pub mod filter;
pub mod onset;
pub mod spectrum;

pub use beat::{BandBins, BeatDetector};
pub use envelope::LevelPeakDetector;
pub use filter::{BiquadCoefficients, LowPassFilter};
pub use onset::OnsetDetector;
pub use spectrum::SpectrumAnalyzer;

use crate::config::{AppConfig, DetectorKind};
use crate::events::BEAT_BANDS;
use crate::Result;

/// Per-band beat flags reported by a strategy.
pub type BeatFlags = [bool; BEAT_BANDS];

/// A beat detection algorithm fed one frame at a time.
pub trait BeatStrategy: Send {
    fn name(&self) -> &'static str;

    /// Processes one frame. Returns the band flags when a beat fired.
    fn process(&mut self, frame: &[f32]) -> Result<Option<BeatFlags>>;

    /// Drops all history, including filter state.
    fn reset(&mut self);
}

/// Filter plus FFT shared by the spectral strategies.
#[derive(Debug)]
struct SpectralFrontEnd {
    filter: LowPassFilter,
    analyzer: SpectrumAnalyzer,
    filtered: Vec<f32>,
}

impl SpectralFrontEnd {
    fn new(frame_size: usize) -> Result<Self> {
        Ok(Self {
            filter: LowPassFilter::default(),
            analyzer: SpectrumAnalyzer::new(frame_size)?,
            filtered: vec![0.0; frame_size],
        })
    }

    /// Returns the filtered frame and its spectrum.
    fn run(&mut self, frame: &[f32]) -> Result<(&[f32], &[f32])> {
        self.filter.process(frame, &mut self.filtered)?;
        let spectrum = self.analyzer.process(&self.filtered)?;
        Ok((&self.filtered, spectrum))
    }

    fn reset(&mut self) {
        self.filter.reset();
    }
}

/// Multi-band variance gate over the filtered spectrum.
#[derive(Debug)]
pub struct VarianceStrategy {
    front: SpectralFrontEnd,
    detector: BeatDetector,
}

impl VarianceStrategy {
    pub fn new(config: &AppConfig, sample_rate_hz: u32) -> Result<Self> {
        let frame_size = config.sampling.frame_size;
        Ok(Self {
            front: SpectralFrontEnd::new(frame_size)?,
            detector: BeatDetector::new(&config.detector, sample_rate_hz, frame_size)?,
        })
    }

    pub fn detector(&self) -> &BeatDetector {
        &self.detector
    }
}

impl BeatStrategy for VarianceStrategy {
    fn name(&self) -> &'static str {
        "variance"
    }

    fn process(&mut self, frame: &[f32]) -> Result<Option<BeatFlags>> {
        let (_, spectrum) = self.front.run(frame)?;
        let mut flags = [false; BEAT_BANDS];
        Ok(self.detector.process(spectrum, &mut flags).then_some(flags))
    }

    fn reset(&mut self) {
        self.front.reset();
        self.detector.reset();
    }
}

/// Single low band, rising edge over `mean + k·σ`. Reports on band 0.
#[derive(Debug)]
pub struct OnsetStrategy {
    front: SpectralFrontEnd,
    detector: OnsetDetector,
}

impl OnsetStrategy {
    pub fn new(config: &AppConfig, sample_rate_hz: u32) -> Result<Self> {
        let frame_size = config.sampling.frame_size;
        Ok(Self {
            front: SpectralFrontEnd::new(frame_size)?,
            detector: OnsetDetector::new(&config.onset, sample_rate_hz, frame_size)?,
        })
    }

    pub fn detector(&self) -> &OnsetDetector {
        &self.detector
    }
}

impl BeatStrategy for OnsetStrategy {
    fn name(&self) -> &'static str {
        "onset"
    }

    fn process(&mut self, frame: &[f32]) -> Result<Option<BeatFlags>> {
        let (_, spectrum) = self.front.run(frame)?;
        // Level telemetry is taken from the unfiltered samples.
        let beat = self.detector.process(spectrum, frame);
        Ok(beat.then_some(single_band()))
    }

    fn reset(&mut self) {
        self.front.reset();
        self.detector.reset();
    }
}

/// Fast/slow envelope follower over the filtered frame level. Reports on
/// band 0.
#[derive(Debug)]
pub struct EnvelopeStrategy {
    filter: LowPassFilter,
    filtered: Vec<f32>,
    detector: LevelPeakDetector,
}

impl EnvelopeStrategy {
    pub fn new(config: &AppConfig, sample_rate_hz: u32) -> Self {
        let frame_size = config.sampling.frame_size;
        Self {
            filter: LowPassFilter::default(),
            filtered: vec![0.0; frame_size],
            detector: LevelPeakDetector::new(&config.envelope, sample_rate_hz, frame_size),
        }
    }

    pub fn detector(&self) -> &LevelPeakDetector {
        &self.detector
    }
}

impl BeatStrategy for EnvelopeStrategy {
    fn name(&self) -> &'static str {
        "envelope"
    }

    fn process(&mut self, frame: &[f32]) -> Result<Option<BeatFlags>> {
        self.filter.process(frame, &mut self.filtered)?;
        let beat = self.detector.process_block(&self.filtered);
        Ok(beat.then_some(single_band()))
    }

    fn reset(&mut self) {
        self.filter.reset();
        self.detector.reset(0.0);
    }
}

fn single_band() -> BeatFlags {
    let mut flags = [false; BEAT_BANDS];
    flags[0] = true;
    flags
}

/// Builds the strategy selected by `config.detector.kind`.
pub fn build_strategy(config: &AppConfig, sample_rate_hz: u32) -> Result<Box<dyn BeatStrategy>> {
    let strategy: Box<dyn BeatStrategy> = match config.detector.kind {
        DetectorKind::Variance => Box::new(VarianceStrategy::new(config, sample_rate_hz)?),
        DetectorKind::Onset => Box::new(OnsetStrategy::new(config, sample_rate_hz)?),
        DetectorKind::Envelope => Box::new(EnvelopeStrategy::new(config, sample_rate_hz)),
    };
    tracing::info!(
        strategy = strategy.name(),
        sample_rate_hz,
        frame_size = config.sampling.frame_size,
        "beat detection ready"
    );
    Ok(strategy)
}
