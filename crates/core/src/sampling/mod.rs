//! Timer-driven sample acquisition.
//!
//! A [`PeriodicTimer`] hands a unit of work per period to a worker thread,
//! which calls [`SampleAcquisition::read_sample`]. Every `N` samples the
//! frame is DC-corrected and handed to the frame-ready callback.

pub mod synthetic;
pub mod timer;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bus::EventBus;
use crate::config::{sample_rate_for_interval, FRAME_SIZE};
use crate::events::{AudioFrame, Timestamp};
use crate::{AdcError, BeatlightError, Result};

pub use synthetic::SyntheticAdc;
pub use timer::{PeriodicTimer, TimerHandle};

/// Analog front end consumed by [`SampleAcquisition`].
pub trait AdcDriver: Send {
    /// Prepares the channel. Called once from `initialize`.
    fn setup(&mut self) -> std::result::Result<(), AdcError> {
        Ok(())
    }

    /// Performs one conversion and returns the raw code.
    fn read_raw(&mut self) -> std::result::Result<i32, AdcError>;

    /// Converts a raw code to microvolts.
    fn raw_to_microvolts(&self, raw: i32) -> std::result::Result<i32, AdcError>;
}

/// Lifecycle of the acquisition state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Arming,
    Sampling,
    FrameReady,
}

/// Callback receiving the sample rate and a completed frame.
pub type FrameReady<const N: usize> = Box<dyn FnMut(u32, &[f32; N]) + Send>;

/// Frame buffer shared between the sampling writer and frame readers.
pub type SharedFrame<const N: usize> = Arc<Mutex<[f32; N]>>;

pub struct SampleAcquisition<A, const N: usize = FRAME_SIZE> {
    adc: A,
    state: AcquisitionState,
    interval_us: u32,
    sample_rate_hz: u32,
    frame: SharedFrame<N>,
    sample_count: usize,
    frames_delivered: u64,
    dropped_writes: u64,
    on_frame: Option<FrameReady<N>>,
}

impl<A: AdcDriver, const N: usize> SampleAcquisition<A, N> {
    pub fn new(adc: A) -> Self {
        Self {
            adc,
            state: AcquisitionState::Idle,
            interval_us: 0,
            sample_rate_hz: 0,
            frame: Arc::new(Mutex::new([0.0; N])),
            sample_count: 0,
            frames_delivered: 0,
            dropped_writes: 0,
            on_frame: None,
        }
    }

    /// Configures the sampling period and sets up the ADC channel.
    ///
    /// On failure the module stays idle and never delivers a frame.
    pub fn initialize(&mut self, interval_us: u32) -> Result<()> {
        if interval_us == 0 {
            return Err(BeatlightError::InvalidInput("sampling interval must be non-zero"));
        }
        if N == 0 {
            return Err(BeatlightError::InvalidInput("frame size must be non-zero"));
        }
        if let Err(err) = self.adc.setup() {
            tracing::error!(target: "adc_reader", %err, "adc initialization failed");
            self.state = AcquisitionState::Idle;
            return Err(err.into());
        }

        self.interval_us = interval_us;
        self.sample_rate_hz = sample_rate_for_interval(interval_us);
        self.sample_count = 0;
        self.state = AcquisitionState::Arming;
        tracing::info!(
            target: "adc_reader",
            interval_us,
            sample_rate_hz = self.sample_rate_hz,
            "adc initialized"
        );
        Ok(())
    }

    /// Installs the frame-ready callback and begins accepting samples.
    pub fn start(&mut self, on_frame: FrameReady<N>) -> Result<()> {
        if self.state != AcquisitionState::Arming {
            return Err(BeatlightError::InvalidInput(
                "acquisition must be initialized before it is started",
            ));
        }
        self.on_frame = Some(on_frame);
        self.state = AcquisitionState::Sampling;
        tracing::info!(target: "adc_reader", "adc started");
        Ok(())
    }

    /// Stops accepting samples. A partially filled frame is discarded.
    pub fn stop(&mut self) {
        self.state = AcquisitionState::Idle;
        self.sample_count = 0;
        self.on_frame = None;
    }

    /// Deferred handler for one timer period.
    ///
    /// The buffer write uses a non-blocking lock; on contention the slot
    /// keeps its previous value. ADC faults are logged and likewise leave
    /// the slot untouched. The counter advances in every case so frame
    /// cadence never depends on faults.
    pub fn read_sample(&mut self) {
        if self.state != AcquisitionState::Sampling {
            return;
        }

        if let Some(value) = self.acquire_volts() {
            match self.frame.try_lock() {
                Some(mut frame) => frame[self.sample_count] = value,
                None => {
                    self.dropped_writes += 1;
                    tracing::trace!(target: "adc_reader", slot = self.sample_count, "frame busy, sample dropped");
                }
            }
        }

        self.sample_count += 1;
        if self.sample_count >= N {
            self.state = AcquisitionState::FrameReady;
            self.read_frame();
            self.sample_count = 0;
            self.state = AcquisitionState::Sampling;
        }
    }

    /// Removes the frame mean in place and hands the frame to the callback.
    pub fn read_frame(&mut self) {
        let mut frame = self.frame.lock();
        let offset = frame.iter().sum::<f32>() / N as f32;
        for sample in frame.iter_mut() {
            *sample -= offset;
        }
        if let Some(on_frame) = self.on_frame.as_mut() {
            on_frame(self.sample_rate_hz, &*frame);
        }
        self.frames_delivered += 1;
    }

    fn acquire_volts(&mut self) -> Option<f32> {
        let raw = match self.adc.read_raw() {
            Ok(raw) => raw,
            Err(err) => {
                tracing::error!(target: "adc_reader", %err, "adc reading failed");
                return None;
            }
        };
        match self.adc.raw_to_microvolts(raw) {
            Ok(microvolts) => Some(microvolts as f32 / 1_000_000.0),
            Err(err) => {
                tracing::error!(target: "adc_reader", raw, %err, "value in microvolts not available");
                None
            }
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    pub fn interval(&self) -> Duration {
        Duration::from_micros(self.interval_us as u64)
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes
    }

    /// Handle to the frame buffer, for readers on other threads.
    pub fn frame_buffer(&self) -> SharedFrame<N> {
        self.frame.clone()
    }

    pub fn adc(&self) -> &A {
        &self.adc
    }
}

impl<A: AdcDriver + 'static, const N: usize> SampleAcquisition<A, N> {
    /// Drives `read_sample` from a [`PeriodicTimer`] at the configured
    /// interval. The acquisition moves onto the timer's worker thread.
    pub fn spawn(mut self) -> Result<TimerHandle> {
        if self.state != AcquisitionState::Sampling {
            return Err(BeatlightError::InvalidInput(
                "acquisition must be started before it is spawned",
            ));
        }
        PeriodicTimer::new(self.interval()).start(move || self.read_sample())
    }
}

impl<A: AdcDriver> SampleAcquisition<A, FRAME_SIZE> {
    /// Starts sampling with a callback that publishes every frame as an
    /// [`AudioFrame`] stamped relative to `origin`.
    pub fn start_publishing(&mut self, bus: Arc<EventBus>, origin: Instant) -> Result<()> {
        self.start(Box::new(move |sample_rate_hz: u32, samples: &[f32; FRAME_SIZE]| {
            let frame = AudioFrame::new(Timestamp::since(origin), sample_rate_hz, *samples);
            // Audio frames use DropOldest, so this only fails if the bus is gone.
            if !bus.publish_now(frame) {
                tracing::error!(target: "audio_sampling", "failed to publish audio frame");
            }
        }))
    }
}

impl<A, const N: usize> fmt::Debug for SampleAcquisition<A, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleAcquisition")
            .field("state", &self.state)
            .field("frame_size", &N)
            .field("interval_us", &self.interval_us)
            .field("sample_count", &self.sample_count)
            .field("frames_delivered", &self.frames_delivered)
            .field("dropped_writes", &self.dropped_writes)
            .finish()
    }
}
