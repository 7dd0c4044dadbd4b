//! Core library for the Beatlight beat detector.
//!
//! The crate is split along the pipeline: sampling fills fixed-size frames,
//! the bus moves typed events between stages, the DSP chain turns frames
//! into beat flags, and the render and input stages consume them. Every
//! stage talks to the others only through an [`EventBus`] handed to it at
//! construction.

pub mod analysis;
pub mod bus;
pub mod config;
pub mod dsp;
pub mod error;
pub mod events;
pub mod input;
pub mod processing;
pub mod render;
pub mod sampling;

pub use analysis::{AnalysisSummary, BeatAnalysis, BeatMark, BeatReport};
pub use bus::{
    BoundedTopic, BusEvent, DispatchOutcome, Dispatcher, DispatcherHandle, EventBus,
    OverflowPolicy, Timeout,
};
pub use config::{AppConfig, DetectorKind, FRAME_SIZE};
pub use dsp::{build_strategy, BeatDetector, BeatStrategy, LevelPeakDetector, OnsetDetector};
pub use error::{AdcError, BeatlightError, Result};
pub use events::{
    AnimCmd, AnimCmdType, AudioFrame, BeatEvent, ButtonEvent, ButtonState, FeatureFrame,
    TickEvent, Timestamp, BEAT_BANDS,
};
pub use input::{ButtonTracker, CommandMapper, InputModule};
pub use processing::{AudioProcessor, ProcessorStats};
pub use render::{AnimationControl, AnimationHandle, Animator, LoggingAnimator};
pub use sampling::{AcquisitionState, AdcDriver, SampleAcquisition, SyntheticAdc};
