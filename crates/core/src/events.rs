//! Event payloads moved across the bus.
//!
//! Every event is a plain `Copy` record. Topics store values, never
//! references, so a consumer can not alias a publisher's buffers.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::FRAME_SIZE;

/// Number of frequency bands carried by a [`BeatEvent`].
pub const BEAT_BANDS: usize = 2;

/// Monotonic timestamp in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub nanoseconds: u64,
}

impl Timestamp {
    pub const fn from_nanos(nanoseconds: u64) -> Self {
        Self { nanoseconds }
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self {
            nanoseconds: millis * 1_000_000,
        }
    }

    /// Time elapsed since `origin`.
    pub fn since(origin: Instant) -> Self {
        Self::from_nanos(origin.elapsed().as_nanos() as u64)
    }

    pub fn as_micros(&self) -> f32 {
        self.nanoseconds as f32 / 1_000.0
    }

    pub fn as_millis(&self) -> f32 {
        self.as_micros() / 1_000.0
    }

    pub fn saturating_sub(&self, earlier: Timestamp) -> Timestamp {
        Timestamp::from_nanos(self.nanoseconds.saturating_sub(earlier.nanoseconds))
    }
}

/// One completed, DC-corrected sample frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioFrame {
    pub ts: Timestamp,
    pub sample_rate_hz: u32,
    pub samples: [f32; FRAME_SIZE],
}

impl AudioFrame {
    pub fn new(ts: Timestamp, sample_rate_hz: u32, samples: [f32; FRAME_SIZE]) -> Self {
        Self {
            ts,
            sample_rate_hz,
            samples,
        }
    }
}

/// Per-band beat flags for one detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeatEvent {
    pub ts: Timestamp,
    pub bands: [bool; BEAT_BANDS],
}

impl BeatEvent {
    pub fn any(&self) -> bool {
        self.bands.iter().any(|b| *b)
    }
}

/// Loudness features computed for every processed frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureFrame {
    pub ts: Timestamp,
    pub energy: f32,
    pub flux: f32,
}

/// Render clock tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickEvent {
    pub ts: Timestamp,
    pub fps_target: u16,
    pub dt_ms: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ButtonState {
    Pressed,
    ReleasedShort,
    ReleasedLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonEvent {
    pub ts: Timestamp,
    pub state: ButtonState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnimCmdType {
    Next,
    Prev,
    SetIndex,
    /// `value` is the catalog id of a named animation.
    SetName,
    /// `value` is a percentage, 0..=100.
    Brightness,
}

/// Command addressed to the rendering stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimCmd {
    pub ts: Timestamp,
    pub kind: AnimCmdType,
    pub value: u16,
}

impl AnimCmd {
    pub fn new(ts: Timestamp, kind: AnimCmdType, value: u16) -> Self {
        Self { ts, kind, value }
    }
}
