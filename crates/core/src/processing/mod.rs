use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::bus::{Dispatcher, EventBus};
use crate::config::AppConfig;
use crate::dsp::{build_strategy, BeatStrategy};
use crate::events::{AudioFrame, BeatEvent, FeatureFrame};

/// Counters shared between a running processor and its owner.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    frames: AtomicU64,
    beats: AtomicU64,
    errors: AtomicU64,
}

impl ProcessorStats {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Turns audio frames into features and beat events.
///
/// The detection strategy is built from the first frame's sample rate and
/// rebuilt whenever the rate changes. If it cannot be built the processor
/// keeps publishing features but never reports a beat.
pub struct AudioProcessor {
    bus: Arc<EventBus>,
    config: AppConfig,
    strategy: Option<Box<dyn BeatStrategy>>,
    sample_rate_hz: Option<u32>,
    last_rms: f32,
    stats: Arc<ProcessorStats>,
}

impl AudioProcessor {
    pub fn new(bus: Arc<EventBus>, config: AppConfig) -> Self {
        Self {
            bus,
            config,
            strategy: None,
            sample_rate_hz: None,
            last_rms: 0.0,
            stats: Arc::new(ProcessorStats::default()),
        }
    }

    /// Uses a prebuilt strategy for frames at `sample_rate_hz`.
    pub fn with_strategy(
        bus: Arc<EventBus>,
        config: AppConfig,
        sample_rate_hz: u32,
        strategy: Box<dyn BeatStrategy>,
    ) -> Self {
        let mut processor = Self::new(bus, config);
        processor.strategy = Some(strategy);
        processor.sample_rate_hz = Some(sample_rate_hz);
        processor
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        self.stats.clone()
    }

    /// Name of the active strategy, if one could be built.
    pub fn strategy_name(&self) -> Option<&'static str> {
        self.strategy.as_ref().map(|strategy| strategy.name())
    }

    /// Processes one frame. Publishes a [`FeatureFrame`] and, when a beat
    /// is detected, a [`BeatEvent`] stamped with the frame's timestamp.
    pub fn handle_frame(&mut self, frame: &AudioFrame) -> Option<BeatEvent> {
        self.ensure_strategy(frame.sample_rate_hz);
        self.stats.frames.fetch_add(1, Ordering::Relaxed);

        let rms = compute_rms(&frame.samples);
        let feature = FeatureFrame {
            ts: frame.ts,
            energy: rms,
            flux: (rms - self.last_rms).max(0.0),
        };
        self.last_rms = rms;
        if !self.bus.publish_now(feature) {
            tracing::trace!(target: "audio_processing", "feature queue full, frame dropped");
        }

        let strategy = self.strategy.as_mut()?;
        let bands = match strategy.process(&frame.samples) {
            Ok(Some(bands)) => bands,
            Ok(None) => return None,
            Err(err) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(target: "audio_processing", error = %err, "frame rejected");
                return None;
            }
        };

        let event = BeatEvent {
            ts: frame.ts,
            bands,
        };
        self.stats.beats.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: "audio_processing", ts_ms = frame.ts.as_millis(), ?bands, "beat");
        if !self.bus.publish_now(event) {
            tracing::error!(target: "audio_processing", "failed to publish beat event");
        }
        Some(event)
    }

    fn ensure_strategy(&mut self, sample_rate_hz: u32) {
        if self.sample_rate_hz == Some(sample_rate_hz) {
            return;
        }
        if let Some(previous) = self.sample_rate_hz {
            tracing::info!(
                target: "audio_processing",
                previous,
                sample_rate_hz,
                "sample rate changed, rebuilding detector"
            );
        }
        self.sample_rate_hz = Some(sample_rate_hz);
        self.strategy = match build_strategy(&self.config, sample_rate_hz) {
            Ok(strategy) => Some(strategy),
            Err(err) => {
                tracing::error!(
                    target: "audio_processing",
                    error = %err,
                    "beat detection unavailable"
                );
                None
            }
        };
    }

    /// Registers this processor as the [`AudioFrame`] handler of
    /// `dispatcher`.
    pub fn attach(mut self, dispatcher: &mut Dispatcher) -> Arc<ProcessorStats> {
        let stats = self.stats();
        dispatcher.on::<AudioFrame, _>(move |frame| {
            self.handle_frame(frame);
        });
        stats
    }
}

impl fmt::Debug for AudioProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioProcessor")
            .field("strategy", &self.strategy_name())
            .field("sample_rate_hz", &self.sample_rate_hz)
            .field("last_rms", &self.last_rms)
            .field("stats", &self.stats)
            .finish()
    }
}

pub(crate) fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}
