use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{events::BEAT_BANDS, BeatlightError, Result};

/// Number of samples in one acquisition frame.
pub const FRAME_SIZE: usize = 512;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sampling: SamplingConfig,
    pub queues: QueueConfig,
    pub detector: DetectorConfig,
    pub onset: OnsetConfig,
    pub envelope: EnvelopeConfig,
    pub render: RenderConfig,
    pub input: InputConfig,
}

impl AppConfig {
    pub fn live_defaults() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON document. Missing sections fall back to
    /// their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks every section for values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.sampling.validate()?;
        self.queues.validate()?;
        self.detector.validate()?;
        self.onset.validate()?;
        self.envelope.validate()?;
        self.render.validate()
    }
}

/// Configuration specific to the sampling subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Period of the sampling timer in microseconds.
    pub interval_us: u32,
    /// Samples per frame. Fixed at build time, carried here for reporting.
    pub frame_size: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_us: 100,
            frame_size: FRAME_SIZE,
        }
    }
}

impl SamplingConfig {
    /// Sample rate implied by the timer period, rounded to the nearest Hz.
    pub fn sample_rate_hz(&self) -> u32 {
        sample_rate_for_interval(self.interval_us)
    }

    fn validate(&self) -> Result<()> {
        if self.interval_us == 0 {
            return Err(BeatlightError::InvalidConfig(
                "sampling.interval_us must be non-zero".into(),
            ));
        }
        if self.frame_size != FRAME_SIZE {
            return Err(BeatlightError::InvalidConfig(format!(
                "sampling.frame_size is fixed at {FRAME_SIZE}, got {}",
                self.frame_size
            )));
        }
        Ok(())
    }
}

pub(crate) fn sample_rate_for_interval(interval_us: u32) -> u32 {
    if interval_us == 0 {
        return 0;
    }
    (1_000_000 + interval_us / 2) / interval_us
}

/// Queue depth for every bus topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub audio: usize,
    pub feature: usize,
    pub beat: usize,
    pub tick: usize,
    pub anim_cmd: usize,
    pub button: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            audio: 4,
            feature: 4,
            beat: 8,
            tick: 2,
            anim_cmd: 4,
            button: 4,
        }
    }
}

impl QueueConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        let depths = [
            ("audio", self.audio),
            ("feature", self.feature),
            ("beat", self.beat),
            ("tick", self.tick),
            ("anim_cmd", self.anim_cmd),
            ("button", self.button),
        ];
        for (name, depth) in depths {
            if depth == 0 {
                return Err(BeatlightError::InvalidConfig(format!(
                    "queues.{name} must hold at least one message"
                )));
            }
        }
        Ok(())
    }
}

/// Half-open frequency interval `[lo_hz, hi_hz)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandRange {
    pub lo_hz: f32,
    pub hi_hz: f32,
}

impl BandRange {
    pub const fn new(lo_hz: f32, hi_hz: f32) -> Self {
        Self { lo_hz, hi_hz }
    }

    fn validate(&self, section: &str) -> Result<()> {
        if !(self.lo_hz >= 0.0 && self.lo_hz < self.hi_hz) {
            return Err(BeatlightError::InvalidConfig(format!(
                "{section}: band [{}, {}) is empty or negative",
                self.lo_hz, self.hi_hz
            )));
        }
        Ok(())
    }
}

/// Selects which beat detection strategy processes audio frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Multi-band rolling mean/variance gate.
    #[default]
    Variance,
    /// Single low band, rising edge over mean plus scaled deviation.
    Onset,
    /// Fast/slow envelope follower with hysteresis and refractory period.
    Envelope,
}

/// Parameters of the variance-gated multi-band detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub kind: DetectorKind,
    pub bands: Vec<BandRange>,
    pub history_len: usize,
    /// Slope of the variance to threshold-multiplier map.
    pub variance_slope: f32,
    /// Threshold multiplier at zero variance.
    pub base_multiplier: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            kind: DetectorKind::Variance,
            bands: vec![BandRange::new(40.0, 130.0), BandRange::new(300.0, 750.0)],
            history_len: 20,
            variance_slope: -0.002_571_4,
            base_multiplier: 1.514_285_7,
        }
    }
}

impl DetectorConfig {
    fn validate(&self) -> Result<()> {
        if self.bands.is_empty() || self.bands.len() > BEAT_BANDS {
            return Err(BeatlightError::InvalidConfig(format!(
                "detector.bands must list between 1 and {BEAT_BANDS} bands"
            )));
        }
        for band in &self.bands {
            band.validate("detector.bands")?;
        }
        if self.history_len < 2 {
            return Err(BeatlightError::InvalidConfig(
                "detector.history_len must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

/// Parameters of the single-band statistical onset detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnsetConfig {
    pub band: BandRange,
    pub history_len: usize,
    /// Number of standard deviations above the mean that counts as a beat.
    pub sensitivity: f32,
    pub target_level: f32,
    pub gain_min: f32,
    pub gain_max: f32,
}

impl Default for OnsetConfig {
    fn default() -> Self {
        Self {
            band: BandRange::new(30.0, 140.0),
            history_len: 40,
            sensitivity: 0.9,
            target_level: 0.7,
            gain_min: 0.5,
            gain_max: 2.0,
        }
    }
}

impl OnsetConfig {
    fn validate(&self) -> Result<()> {
        self.band.validate("onset.band")?;
        if self.history_len < 2 {
            return Err(BeatlightError::InvalidConfig(
                "onset.history_len must be at least 2".into(),
            ));
        }
        if !(self.gain_min > 0.0 && self.gain_min <= self.gain_max) {
            return Err(BeatlightError::InvalidConfig(
                "onset gain bounds must satisfy 0 < gain_min <= gain_max".into(),
            ));
        }
        Ok(())
    }
}

/// Parameters of the fast/slow envelope onset follower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    pub fast_tau_ms: f32,
    pub slow_tau_ms: f32,
    /// Trigger when the normalised lift reaches this value.
    pub rise_threshold: f32,
    /// Re-arm once the normalised lift drops to this value.
    pub fall_threshold: f32,
    pub min_interval_ms: u32,
    pub denom_eps: f32,
    pub level_clip: f32,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            fast_tau_ms: 12.0,
            slow_tau_ms: 160.0,
            rise_threshold: 0.45,
            fall_threshold: 0.2,
            min_interval_ms: 120,
            denom_eps: 1e-6,
            level_clip: 10.0,
        }
    }
}

impl EnvelopeConfig {
    fn validate(&self) -> Result<()> {
        if !(self.fast_tau_ms > 0.0 && self.slow_tau_ms > 0.0) {
            return Err(BeatlightError::InvalidConfig(
                "envelope time constants must be positive".into(),
            ));
        }
        if self.fall_threshold > self.rise_threshold {
            return Err(BeatlightError::InvalidConfig(
                "envelope.fall_threshold must not exceed rise_threshold".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration of the rendering consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub fps_target: u16,
    /// Beats closer together than this are ignored by the renderer.
    pub beat_holdoff_ms: u32,
    /// Animation catalog in cycling order.
    pub animations: Vec<String>,
    pub brightness: u16,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            fps_target: 100,
            beat_holdoff_ms: 200,
            animations: ["beat_pulse", "larson_scanner", "solar_corona", "beat_flash"]
                .into_iter()
                .map(String::from)
                .collect(),
            brightness: 100,
        }
    }
}

impl RenderConfig {
    fn validate(&self) -> Result<()> {
        if self.fps_target == 0 {
            return Err(BeatlightError::InvalidConfig(
                "render.fps_target must be non-zero".into(),
            ));
        }
        if self.animations.is_empty() || self.animations.len() > usize::from(u16::MAX) {
            return Err(BeatlightError::InvalidConfig(
                "render.animations must name at least one animation".into(),
            ));
        }
        if self.brightness > 100 {
            return Err(BeatlightError::InvalidConfig(format!(
                "render.brightness is a percentage, got {}",
                self.brightness
            )));
        }
        Ok(())
    }
}

/// Configuration of the button input path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub long_press_ms: u32,
    /// How long a command publish may wait for queue space.
    pub command_timeout_ms: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            long_press_ms: 2_000,
            command_timeout_ms: 50,
        }
    }
}
